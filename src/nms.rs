//! Client for the NMS inventory API.
//!
//! Authentication is a two-step exchange: username/password login yields a
//! refresh token, which is traded for a short-lived JWT access token. The
//! access token is reused until five minutes before the `exp` claim in its
//! payload. A 401 from the refresh endpoint or from an inventory request
//! triggers one fresh login and a single retry.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::NmsConfig;
use crate::error::{SlaError, SlaResult};
use crate::models::SiteStatusKind;

// ---

const SERVICE: &str = "nms";

/// Access tokens are refreshed this many minutes before they expire.
const EARLY_REFRESH_MINUTES: i64 = 5;

/// One site in an inventory response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NmsSite {
    pub site_id_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub down_since: Option<String>,
    #[serde(default)]
    pub down_seconds: Option<f64>,
}

impl NmsSite {
    /// `down_since` as a UTC timestamp. Accepts RFC 3339 and
    /// `YYYY-MM-DD HH:MM:SS` (taken as UTC).
    pub fn down_since_utc(&self) -> Option<DateTime<Utc>> {
        // ---
        let raw = self.down_since.as_deref()?.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn down_seconds_whole(&self) -> Option<i64> {
        self.down_seconds
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| s.round() as i64)
    }
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    result: Vec<NmsSite>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "refresh_token")]
    refresh: String,
    #[serde(default, alias = "access_token")]
    access: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token")]
    access: String,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Expiry from a JWT's payload, `None` if it cannot be read.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    // ---
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn new(token: String) -> Self {
        let expires_at = jwt_expiry(&token);
        if expires_at.is_none() {
            warn!("NMS access token carries no readable exp claim, it will not be reused");
        }
        AccessToken { token, expires_at }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::minutes(EARLY_REFRESH_MINUTES);
        self.expires_at.is_some_and(|exp| exp - margin > now)
    }
}

#[derive(Debug, Default)]
struct TokenState {
    refresh: Option<String>,
    access: Option<AccessToken>,
}

/// Source of current up/down site lists.
#[async_trait]
pub trait NmsSource: Send + Sync {
    async fn list_sites(&self, status: SiteStatusKind) -> SlaResult<Vec<NmsSite>>;
}

pub struct NmsClient {
    http: reqwest::Client,
    config: NmsConfig,
    tokens: Mutex<TokenState>,
}

impl NmsClient {
    pub fn new(http: reqwest::Client, config: NmsConfig) -> Self {
        NmsClient {
            http,
            config,
            tokens: Mutex::new(TokenState::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn login(&self) -> SlaResult<LoginResponse> {
        // ---
        debug!("Logging in to NMS as {}", self.config.username);
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                error!("NMS login failed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?;

        response.json().await.map_err(|e| {
            error!("NMS login response is malformed: {}", e);
            SlaError::upstream(SERVICE, e)
        })
    }

    /// `Ok(None)` when the refresh token was rejected with 401.
    async fn refresh(&self, refresh_token: &str) -> SlaResult<Option<String>> {
        // ---
        let response = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&serde_json::json!({ "refresh": refresh_token }))
            .send()
            .await
            .map_err(|e| {
                error!("NMS token refresh failed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body: RefreshResponse = response
            .error_for_status()
            .map_err(|e| {
                error!("NMS token refresh failed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?
            .json()
            .await
            .map_err(|e| {
                error!("NMS refresh response is malformed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?;
        Ok(Some(body.access))
    }

    /// A usable access token, logging in or refreshing as needed.
    async fn access_token(&self) -> SlaResult<String> {
        // ---
        let mut state = self.tokens.lock().await;
        if let Some(access) = state.access.as_ref().filter(|a| a.is_fresh(Utc::now())) {
            return Ok(access.token.clone());
        }

        let mut logged_in = false;
        if state.refresh.is_none() {
            let login = self.login().await?;
            logged_in = true;
            state.refresh = Some(login.refresh);
            if let Some(access) = login.access.map(AccessToken::new) {
                let token = access.token.clone();
                state.access = Some(access);
                return Ok(token);
            }
        }

        let refresh_token = state.refresh.clone().unwrap_or_default();
        let access = match self.refresh(&refresh_token).await? {
            Some(access) => access,
            None if logged_in => {
                return Err(SlaError::upstream(
                    SERVICE,
                    "refresh token rejected right after login",
                ))
            }
            None => {
                info!("NMS refresh token rejected, logging in again");
                let login = self.login().await?;
                state.refresh = Some(login.refresh.clone());
                match login.access {
                    Some(access) => access,
                    None => self.refresh(&login.refresh).await?.ok_or_else(|| {
                        SlaError::upstream(SERVICE, "refresh token rejected right after login")
                    })?,
                }
            }
        };

        let access = AccessToken::new(access);
        let token = access.token.clone();
        state.access = Some(access);
        Ok(token)
    }

    /// Forget every token so the next call starts with a login.
    async fn reset_tokens(&self) {
        *self.tokens.lock().await = TokenState::default();
    }

    async fn fetch_inventory(
        &self,
        status: SiteStatusKind,
        token: &str,
    ) -> SlaResult<Option<InventoryResponse>> {
        // ---
        let response = self
            .http
            .get(self.url("/inventory/site"))
            .bearer_auth(token)
            .query(&[
                ("site_status", status.as_str().to_string()),
                ("limit", self.config.page_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!("NMS inventory request failed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .map_err(|e| {
                error!("NMS inventory request failed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?
            .json()
            .await
            .map_err(|e| {
                error!("NMS inventory response is malformed: {}", e);
                SlaError::upstream(SERVICE, e)
            })?;
        Ok(Some(body))
    }
}

#[async_trait]
impl NmsSource for NmsClient {
    async fn list_sites(&self, status: SiteStatusKind) -> SlaResult<Vec<NmsSite>> {
        // ---
        let token = self.access_token().await?;
        let inventory = match self.fetch_inventory(status, &token).await? {
            Some(inventory) => inventory,
            None => {
                info!("NMS rejected access token, re-authenticating once");
                self.reset_tokens().await;
                let token = self.access_token().await?;
                self.fetch_inventory(status, &token)
                    .await?
                    .ok_or_else(|| SlaError::upstream(SERVICE, "unauthorized after re-login"))?
            }
        };

        info!(
            "NMS returned {} '{}' sites (total {:?}, message {:?})",
            inventory.result.len(),
            status.as_str(),
            inventory.total,
            inventory.message
        );
        Ok(inventory.result)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jwt(exp: i64) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(json!({ "exp": exp, "sub": "sla" }).to_string())
        )
    }

    fn client(server: &MockServer) -> NmsClient {
        NmsClient::new(
            reqwest::Client::new(),
            NmsConfig {
                api_url: server.uri(),
                username: "ops".into(),
                password: "secret".into(),
                page_limit: 5000,
            },
        )
    }

    fn inventory() -> serde_json::Value {
        json!({
            "message": "ok",
            "total": 1,
            "result": [{
                "site_id_name": "SITE-A",
                "name": "Alpha",
                "terminal_id": "T1",
                "down_since": "2025-01-01 08:00:00",
                "down_seconds": 3600
            }]
        })
    }

    #[test]
    fn reads_exp_from_jwt_payload() {
        // ---
        let exp = 1_735_689_600;
        assert_eq!(jwt_expiry(&jwt(exp)).map(|t| t.timestamp()), Some(exp));
        assert_eq!(jwt_expiry("not-a-jwt"), None);
        assert_eq!(jwt_expiry("a.%%%.c"), None);
    }

    #[test]
    fn tokens_close_to_expiry_are_not_fresh() {
        // ---
        let now = Utc::now();
        let soon = AccessToken::new(jwt((now + chrono::Duration::minutes(4)).timestamp()));
        let later = AccessToken::new(jwt((now + chrono::Duration::minutes(30)).timestamp()));
        assert!(!soon.is_fresh(now));
        assert!(later.is_fresh(now));
    }

    #[test]
    fn parses_down_since_formats() {
        // ---
        let site = NmsSite {
            site_id_name: "X".into(),
            name: None,
            terminal_id: None,
            down_since: Some("2025-01-01T08:00:00+07:00".into()),
            down_seconds: Some(59.6),
        };
        assert_eq!(
            site.down_since_utc(),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap())
        );
        assert_eq!(site.down_seconds_whole(), Some(60));
    }

    #[tokio::test]
    async fn logs_in_once_and_reuses_access_token() {
        // ---
        let server = MockServer::start().await;
        let access = jwt(Utc::now().timestamp() + 3600);

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "refresh": "r1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": access })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/inventory/site"))
            .and(query_param("site_status", "down"))
            .and(query_param("limit", "5000"))
            .and(header("authorization", format!("Bearer {access}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(inventory()))
            .expect(2)
            .mount(&server)
            .await;

        let nms = client(&server);
        for _ in 0..2 {
            let sites = nms.list_sites(SiteStatusKind::Down).await.unwrap();
            assert_eq!(sites.len(), 1);
            assert_eq!(sites[0].terminal_id.as_deref(), Some("T1"));
        }
    }

    #[tokio::test]
    async fn rejected_refresh_token_triggers_fresh_login() {
        // ---
        let server = MockServer::start().await;
        let access = jwt(Utc::now().timestamp() + 3600);

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "refresh": "r1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access": access })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/inventory/site"))
            .respond_with(ResponseTemplate::new(200).set_body_json(inventory()))
            .mount(&server)
            .await;

        let nms = client(&server);
        // A refresh token left over from an earlier session, now revoked.
        nms.tokens.lock().await.refresh = Some("revoked".into());

        let sites = nms.list_sites(SiteStatusKind::Up).await.unwrap();
        assert_eq!(sites.len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_inventory_retries_once() {
        // ---
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "refresh": "r1",
                "access": jwt(Utc::now().timestamp() + 3600)
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/inventory/site"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/inventory/site"))
            .respond_with(ResponseTemplate::new(200).set_body_json(inventory()))
            .mount(&server)
            .await;

        let sites = client(&server).list_sites(SiteStatusKind::Down).await.unwrap();
        assert_eq!(sites[0].site_id_name, "SITE-A");
    }

    #[tokio::test]
    async fn upstream_errors_surface() {
        // ---
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_sites(SiteStatusKind::Down)
            .await
            .unwrap_err();
        assert!(matches!(err, SlaError::Upstream { service: "nms", .. }));
    }
}
