//! Client for the external sites registry.
//!
//! The registry is the system of record for active sites and their attributes.
//! One paginated fetch builds a whole [`RegistrySnapshot`] which is reused
//! until its TTL expires; every list and lookup operation is answered from
//! that snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{SlaError, SlaResult};
use crate::models::BatteryVersion;

// ---

/// Hard stop for pagination in case the upstream never reports a last page.
const MAX_PAGES: u32 = 1000;

/// Site as returned by `GET /sites`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub site_id: String,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub battery_version: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub talis_installed: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SitesEnvelope {
    success: bool,
    data: Option<SitesPage>,
}

#[derive(Debug, Deserialize)]
struct SitesPage {
    data: Vec<Site>,
    pagination: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(alias = "total_pages")]
    total_pages: u32,
}

/// Registry attributes the engine enriches its output with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDetails {
    pub name: String,
    pub province: Option<String>,
    pub battery_version: Option<BatteryVersion>,
    pub install_date: Option<NaiveDate>,
}

/// Accepts `YYYY-MM-DD` optionally followed by a time component.
fn parse_install_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Immutable view of every active site from one registry fetch.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    sites: HashMap<String, SiteDetails>,
    by_terminal: HashMap<String, String>,
}

impl RegistrySnapshot {
    pub fn from_sites(sites: impl IntoIterator<Item = Site>) -> Self {
        // ---
        let mut snapshot = RegistrySnapshot::default();
        for site in sites {
            if site.is_active == Some(false) {
                continue;
            }
            let site_id = site.site_id.trim().to_string();
            if site_id.is_empty() {
                continue;
            }
            if let Some(terminal) = site.terminal_id.as_deref().map(str::trim) {
                if !terminal.is_empty() {
                    snapshot
                        .by_terminal
                        .insert(terminal.to_string(), site_id.clone());
                }
            }
            let details = SiteDetails {
                name: site.site_name.clone().unwrap_or_else(|| site_id.clone()),
                province: site.province.map(|p| p.trim().to_string()),
                battery_version: site
                    .battery_version
                    .as_deref()
                    .and_then(|v| v.parse().ok()),
                install_date: site.talis_installed.as_deref().and_then(parse_install_date),
            };
            snapshot.sites.insert(site_id, details);
        }
        snapshot
    }

    /// Resolve an external identifier to a canonical site id: exact site id
    /// match first, then the terminal-id index. `None` means "skip".
    pub fn resolve_site_id(&self, external_id: &str, terminal_id: Option<&str>) -> Option<String> {
        // ---
        let external_id = external_id.trim();
        if self.sites.contains_key(external_id) {
            return Some(external_id.to_string());
        }
        terminal_id
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .and_then(|t| self.by_terminal.get(t))
            .cloned()
    }

    pub fn active_site_ids(&self) -> HashSet<String> {
        self.sites.keys().cloned().collect()
    }

    pub fn site_details(&self) -> &HashMap<String, SiteDetails> {
        &self.sites
    }

    pub fn details(&self, site_id: &str) -> Option<&SiteDetails> {
        self.sites.get(site_id)
    }

    pub fn site_ids_by_battery_version(&self, version: BatteryVersion) -> BTreeSet<String> {
        self.sites
            .iter()
            .filter(|(_, d)| d.battery_version == Some(version))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Read access to the sites registry.
#[async_trait]
pub trait SiteRegistry: Send + Sync {
    /// Current snapshot; may be served from the in-process cache.
    async fn snapshot(&self) -> SlaResult<Arc<RegistrySnapshot>>;

    /// `false` when there is no upstream to ask.
    fn is_configured(&self) -> bool {
        true
    }

    async fn resolve_site_id(
        &self,
        external_id: &str,
        terminal_id: Option<&str>,
    ) -> SlaResult<Option<String>> {
        Ok(self.snapshot().await?.resolve_site_id(external_id, terminal_id))
    }

    async fn list_active_site_ids(&self) -> SlaResult<HashSet<String>> {
        Ok(self.snapshot().await?.active_site_ids())
    }

    async fn list_site_details(&self) -> SlaResult<HashMap<String, SiteDetails>> {
        Ok(self.snapshot().await?.site_details().clone())
    }

    async fn list_site_ids_by_battery_version(
        &self,
        version: BatteryVersion,
    ) -> SlaResult<BTreeSet<String>> {
        Ok(self.snapshot().await?.site_ids_by_battery_version(version))
    }
}

struct CachedSnapshot {
    data: Arc<RegistrySnapshot>,
    expires_at: Instant,
}

/// HTTP client for `GET /sites` with a whole-snapshot TTL cache.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Option<String>,
    page_size: u32,
    ttl: Duration,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl RegistryClient {
    pub fn new(http: reqwest::Client, base_url: Option<String>, page_size: u32, ttl: Duration) -> Self {
        RegistryClient {
            http,
            base_url,
            page_size: page_size.max(1),
            ttl,
            cache: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<RegistrySnapshot>> {
        let guard = self.cache.lock();
        guard
            .as_ref()
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| Arc::clone(&c.data))
    }

    async fn fetch_all(&self, base_url: &str) -> SlaResult<Vec<Site>> {
        // ---
        let mut sites = Vec::new();
        let mut page: u32 = 1;

        loop {
            let url = format!("{base_url}/sites");
            debug!("Fetching registry page {} from {}", page, url);

            let response = self
                .http
                .get(&url)
                .query(&[
                    ("page", page.to_string()),
                    ("limit", self.page_size.to_string()),
                    ("isActive", "true".to_string()),
                    ("sortBy", "siteId".to_string()),
                    ("sortOrder", "asc".to_string()),
                ])
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| {
                    error!("Registry request for page {} failed: {}", page, e);
                    SlaError::upstream("registry", e)
                })?;

            let envelope: SitesEnvelope = response.json().await.map_err(|e| {
                error!("Registry page {} is not valid JSON: {}", page, e);
                SlaError::upstream("registry", e)
            })?;

            let body = match envelope.data {
                Some(body) if envelope.success => body,
                _ => {
                    error!("Registry page {} reported failure", page);
                    return Err(SlaError::upstream("registry", "response marked unsuccessful"));
                }
            };

            let received = body.data.len() as u32;
            sites.extend(body.data);

            let last_page = match body.pagination {
                Some(info) => page >= info.total_pages,
                None => received < self.page_size,
            };
            if last_page || received == 0 || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }

        info!("Fetched {} sites from registry in {} page(s)", sites.len(), page);
        Ok(sites)
    }
}

#[async_trait]
impl SiteRegistry for RegistryClient {
    fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    async fn snapshot(&self) -> SlaResult<Arc<RegistrySnapshot>> {
        // ---
        if let Some(snapshot) = self.cached() {
            return Ok(snapshot);
        }
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(SlaError::RegistryNotConfigured("sites registry"))?;

        // Concurrent misses may both fetch; the result is the same.
        let snapshot = Arc::new(RegistrySnapshot::from_sites(self.fetch_all(base_url).await?));
        *self.cache.lock() = Some(CachedSnapshot {
            data: Arc::clone(&snapshot),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(snapshot)
    }
}

/// Registry answering from a fixed snapshot.
pub struct StaticRegistry {
    snapshot: Arc<RegistrySnapshot>,
}

impl StaticRegistry {
    pub fn new(sites: impl IntoIterator<Item = Site>) -> Self {
        StaticRegistry {
            snapshot: Arc::new(RegistrySnapshot::from_sites(sites)),
        }
    }
}

#[async_trait]
impl SiteRegistry for StaticRegistry {
    async fn snapshot(&self) -> SlaResult<Arc<RegistrySnapshot>> {
        Ok(Arc::clone(&self.snapshot))
    }
}

impl Site {
    /// Convenience constructor for an active site.
    pub fn active(site_id: &str, name: &str, battery_version: &str, province: &str) -> Self {
        Site {
            site_id: site_id.to_string(),
            site_name: Some(name.to_string()),
            battery_version: Some(battery_version.to_string()),
            province: Some(province.to_string()),
            terminal_id: None,
            talis_installed: None,
            is_active: Some(true),
        }
    }

    pub fn with_terminal(mut self, terminal_id: &str) -> Self {
        self.terminal_id = Some(terminal_id.to_string());
        self
    }
}
