//! Get-or-compute cache in front of the aggregator.
//!
//! Keys are derived deterministically from the operation and its parameters.
//! Every key that covers a date range is also registered in a per-month index
//! set (`sla:idx:YYYY-MM`) together with its own range, so range invalidation
//! is a direct lookup followed by an exact overlap test rather than a scan.
//!
//! The cache is an optimization only: backend failures are logged at warn
//! level and the caller always falls through to the compute path.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::SlaResult;
use crate::models::{first_of_month, DateRange};

mod backend;
mod redis_backend;

pub use backend::{glob_match, CacheBackend, CacheError, MemoryBackend};
pub use redis_backend::RedisBackend;

// ---

const KEY_PREFIX: &str = "sla";
const INDEX_PREFIX: &str = "sla:idx";

/// Fully historical ranges.
pub const LONG_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Ranges touching today or the future.
pub const SHORT_TTL: Duration = Duration::from_secs(30 * 60);
/// Monthly summaries of the current month.
pub const CURRENT_MONTH_TTL: Duration = Duration::from_secs(60 * 60);
/// Index sets outlive the longest entry they point at.
const INDEX_TTL: Duration = Duration::from_secs(25 * 60 * 60);

pub fn ttl_for_range(range: DateRange, today: NaiveDate) -> Duration {
    if range.end < today {
        LONG_TTL
    } else {
        SHORT_TTL
    }
}

pub fn ttl_for_month(range: DateRange, today: NaiveDate) -> Duration {
    if first_of_month(range.end) < first_of_month(today) {
        LONG_TTL
    } else {
        CURRENT_MONTH_TTL
    }
}

/// A cache key plus the date range its value was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    key: String,
    range: Option<DateRange>,
}

impl CacheKey {
    /// `sla:<op>:<start>:<end>`
    pub fn for_range(op: &str, range: DateRange) -> Self {
        CacheKey {
            key: format!("{KEY_PREFIX}:{op}:{}:{}", range.start, range.end),
            range: Some(range),
        }
    }

    /// `sla:<op>:<qualifier>:<start>:<end>`
    pub fn for_range_with(op: &str, qualifier: &str, range: DateRange) -> Self {
        CacheKey {
            key: format!(
                "{KEY_PREFIX}:{op}:{}:{}:{}",
                qualifier.trim().to_ascii_lowercase(),
                range.start,
                range.end
            ),
            range: Some(range),
        }
    }

    /// `sla:<op>:<start>:<end>:<sha256 of normalized filters>`
    pub fn hashed<F: Serialize>(op: &str, range: DateRange, filters: &F) -> Self {
        CacheKey {
            key: format!(
                "{KEY_PREFIX}:{op}:{}:{}:{}",
                range.start,
                range.end,
                filter_hash(filters)
            ),
            range: Some(range),
        }
    }

    /// Key without a date range; only pattern invalidation reaches it.
    pub fn plain(op: &str, qualifier: &str) -> Self {
        CacheKey {
            key: format!("{KEY_PREFIX}:{op}:{qualifier}"),
            range: None,
        }
    }

    /// Index the entry under `range` instead of the range named in the key,
    /// for values that also read data outside their own range.
    pub fn depends_on(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn range(&self) -> Option<DateRange> {
        self.range
    }
}

fn normalize_value(value: &serde_json::Value) -> String {
    // ---
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(normalize_value)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Order-independent hash of a filter set. Null, missing and blank fields all
/// normalize to the empty string and are left out, so they hash identically.
pub fn filter_hash<F: Serialize>(filters: &F) -> String {
    // ---
    let value = serde_json::to_value(filters).unwrap_or_else(|e| {
        warn!("Filter set could not be serialized for hashing: {}", e);
        serde_json::Value::Null
    });

    let normalized: BTreeMap<String, String> = match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), normalize_value(v)))
            .filter(|(_, v)| !v.is_empty())
            .collect(),
        other => BTreeMap::from([(String::new(), normalize_value(&other))]),
    };

    let canonical = normalized
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn index_key(month: NaiveDate) -> String {
    format!("{INDEX_PREFIX}:{}", month.format("%Y-%m"))
}

fn index_member(key: &CacheKey, range: DateRange) -> String {
    format!("{}|{}|{}", range.start, range.end, key.as_str())
}

fn parse_index_member(member: &str) -> Option<(DateRange, &str)> {
    // ---
    let mut parts = member.splitn(3, '|');
    let start = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let end = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
    let key = parts.next()?;
    Some((DateRange::new(start, end).ok()?, key))
}

/// Aggregate cache shared by the aggregator, bulk loader and report routes.
#[derive(Clone)]
pub struct SlaCache {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl SlaCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        SlaCache {
            backend: Some(backend),
        }
    }

    /// Cache that always computes.
    pub fn disabled() -> Self {
        SlaCache { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Return the cached value for `key`, or run `compute`, store its result
    /// for `ttl` and return it. Compute errors are returned and never cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> SlaResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = SlaResult<T>>,
    {
        // ---
        if let Some(backend) = &self.backend {
            match backend.get(key.as_str()).await {
                Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                    Ok(value) => {
                        debug!(key = key.as_str(), "cache hit");
                        return Ok(value);
                    }
                    Err(e) => warn!(key = key.as_str(), "Discarding undecodable cache entry: {}", e),
                },
                Ok(None) => debug!(key = key.as_str(), "cache miss"),
                Err(e) => warn!(key = key.as_str(), "Cache read failed, computing: {}", e),
            }
        }

        let value = compute().await?;

        if let Some(backend) = &self.backend {
            if let Err(e) = store(backend.as_ref(), key, ttl, &value).await {
                warn!(key = key.as_str(), "Cache write failed: {}", e);
            }
        }
        Ok(value)
    }

    /// Delete every key matching any of the glob `patterns`. Failures are
    /// logged and swallowed; returns the number of keys removed.
    pub async fn invalidate(&self, patterns: &[&str]) -> u64 {
        // ---
        let Some(backend) = &self.backend else {
            return 0;
        };
        let mut removed = 0;
        for pattern in patterns {
            match delete_matching(backend.as_ref(), pattern).await {
                Ok(n) => removed += n,
                Err(e) => warn!(pattern = *pattern, "Cache invalidation failed: {}", e),
            }
        }
        debug!("Invalidated {} cache keys by pattern", removed);
        removed
    }

    /// Delete every entry whose own range overlaps `range`. Failures are
    /// logged and swallowed; returns the number of keys removed.
    pub async fn invalidate_by_date_range(&self, range: DateRange) -> u64 {
        // ---
        let Some(backend) = &self.backend else {
            return 0;
        };
        match invalidate_overlapping(backend.as_ref(), range).await {
            Ok(removed) => {
                debug!("Invalidated {} cache keys overlapping {}", removed, range);
                removed
            }
            Err(e) => {
                warn!("Cache range invalidation for {} failed: {}", range, e);
                0
            }
        }
    }
}

async fn store<T: Serialize>(
    backend: &dyn CacheBackend,
    key: &CacheKey,
    ttl: Duration,
    value: &T,
) -> Result<(), CacheError> {
    // ---
    let raw = serde_json::to_string(value)?;
    backend.set(key.as_str(), &raw, ttl).await?;

    if let Some(range) = key.range() {
        let member = index_member(key, range);
        for month in range.months() {
            backend.index_add(&index_key(month), &member, INDEX_TTL).await?;
        }
    }
    Ok(())
}

async fn delete_matching(backend: &dyn CacheBackend, pattern: &str) -> Result<u64, CacheError> {
    let keys = backend.scan(pattern).await?;
    backend.delete(&keys).await
}

async fn invalidate_overlapping(
    backend: &dyn CacheBackend,
    range: DateRange,
) -> Result<u64, CacheError> {
    // ---
    let mut keys: Vec<String> = Vec::new();
    for month in range.months() {
        let index = index_key(month);
        let mut stale_members = Vec::new();
        for member in backend.index_members(&index).await? {
            match parse_index_member(&member) {
                Some((entry_range, key)) if entry_range.overlaps(&range) => {
                    keys.push(key.to_string());
                    stale_members.push(member);
                }
                Some(_) => {}
                None => {
                    warn!(index = index.as_str(), "Dropping malformed index member '{}'", member);
                    stale_members.push(member);
                }
            }
        }
        backend.index_remove(&index, &stale_members).await?;
    }

    keys.sort();
    keys.dedup();
    backend.delete(&keys).await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::SlaError;

    fn range(start: &str, end: &str) -> DateRange {
        DateRange::parse(start, end).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[derive(Serialize)]
    struct Filters {
        site: Option<String>,
        version: Option<String>,
        page: u32,
    }

    #[derive(Serialize)]
    struct ReorderedFilters {
        page: u32,
        version: Option<String>,
    }

    #[test]
    fn range_keys_embed_dates() {
        // ---
        let key = CacheKey::for_range("daily", range("2025-01-01", "2025-01-31"));
        assert_eq!(key.as_str(), "sla:daily:2025-01-01:2025-01-31");

        let key = CacheKey::for_range_with("daily", "Talis5", range("2025-01-01", "2025-01-31"));
        assert_eq!(key.as_str(), "sla:daily:talis5:2025-01-01:2025-01-31");
    }

    #[test]
    fn filter_hash_ignores_order_and_empty_fields() {
        // ---
        let a = Filters {
            site: None,
            version: Some("mix".into()),
            page: 1,
        };
        let b = ReorderedFilters {
            page: 1,
            version: Some(" mix ".into()),
        };
        let blank = Filters {
            site: Some("".into()),
            version: Some("mix".into()),
            page: 1,
        };
        assert_eq!(filter_hash(&a), filter_hash(&b));
        assert_eq!(filter_hash(&a), filter_hash(&blank));

        let other = Filters {
            site: None,
            version: Some("jspro".into()),
            page: 1,
        };
        assert_ne!(filter_hash(&a), filter_hash(&other));
    }

    #[test]
    fn ttl_policy_distinguishes_history_from_today() {
        // ---
        let today = day("2025-03-15");
        assert_eq!(ttl_for_range(range("2025-03-01", "2025-03-14"), today), LONG_TTL);
        assert_eq!(ttl_for_range(range("2025-03-01", "2025-03-15"), today), SHORT_TTL);
        assert_eq!(ttl_for_range(range("2025-03-01", "2025-04-01"), today), SHORT_TTL);

        assert_eq!(ttl_for_month(range("2025-02-01", "2025-02-28"), today), LONG_TTL);
        assert_eq!(ttl_for_month(range("2025-03-01", "2025-03-31"), today), CURRENT_MONTH_TTL);
    }

    #[test]
    fn index_members_round_trip() {
        // ---
        let key = CacheKey::for_range("weekly", range("2025-01-01", "2025-01-28"));
        let member = index_member(&key, key.range().unwrap());
        let (parsed_range, parsed_key) = parse_index_member(&member).unwrap();
        assert_eq!(parsed_range, key.range().unwrap());
        assert_eq!(parsed_key, key.as_str());
        assert!(parse_index_member("garbage").is_none());
    }

    #[tokio::test]
    async fn computes_once_until_invalidated() {
        // ---
        let cache = SlaCache::new(Arc::new(MemoryBackend::new()));
        let key = CacheKey::for_range("daily", range("2025-01-10", "2025-01-20"));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SlaError>(vec![1u32, 2, 3])
        };

        let first = cache.get_or_compute(&key, LONG_TTL, compute).await.unwrap();
        let second = cache.get_or_compute(&key, LONG_TTL, compute).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache
            .invalidate_by_date_range(range("2025-01-15", "2025-01-25"))
            .await;
        cache.get_or_compute(&key, LONG_TTL, compute).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disjoint_range_leaves_entry_alone() {
        // ---
        let backend = Arc::new(MemoryBackend::new());
        let cache = SlaCache::new(backend.clone());
        let key = CacheKey::for_range("daily", range("2025-01-10", "2025-01-20"));

        cache
            .get_or_compute(&key, LONG_TTL, || async { Ok::<_, SlaError>(42u32) })
            .await
            .unwrap();

        let removed = cache
            .invalidate_by_date_range(range("2025-02-01", "2025-02-05"))
            .await;
        assert_eq!(removed, 0);
        assert_eq!(backend.get(key.as_str()).await.unwrap(), Some("42".into()));

        let removed = cache
            .invalidate_by_date_range(range("2025-01-20", "2025-01-20"))
            .await;
        assert_eq!(removed, 1);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn entries_spanning_months_are_found_from_either_month() {
        // ---
        let backend = Arc::new(MemoryBackend::new());
        let cache = SlaCache::new(backend.clone());
        let key = CacheKey::for_range("master", range("2025-01-25", "2025-02-10"));
        cache
            .get_or_compute(&key, LONG_TTL, || async { Ok::<_, SlaError>("x".to_string()) })
            .await
            .unwrap();

        let removed = cache
            .invalidate_by_date_range(range("2025-02-05", "2025-02-06"))
            .await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn pattern_invalidation_and_disabled_cache() {
        // ---
        let backend = Arc::new(MemoryBackend::new());
        let cache = SlaCache::new(backend.clone());
        for op in ["daily", "weekly"] {
            let key = CacheKey::for_range(op, range("2025-01-01", "2025-01-31"));
            cache
                .get_or_compute(&key, LONG_TTL, || async { Ok::<_, SlaError>(1u8) })
                .await
                .unwrap();
        }
        assert_eq!(cache.invalidate(&["sla:daily:*"]).await, 1);
        assert_eq!(backend.len(), 1);

        let disabled = SlaCache::disabled();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let key = CacheKey::plain("sites", "total");
        for _ in 0..2 {
            disabled
                .get_or_compute(&key, LONG_TTL, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SlaError>(0u8)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn compute_errors_are_not_cached() {
        // ---
        let cache = SlaCache::new(Arc::new(MemoryBackend::new()));
        let key = CacheKey::for_range("monthly", range("2025-03-05", "2025-03-31"));

        let err = cache
            .get_or_compute(&key, LONG_TTL, || async {
                Err::<u8, _>(SlaError::validation("startDate must be the first of a month"))
            })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_compute(&key, LONG_TTL, || async { Ok::<_, SlaError>(7u8) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
    }
}
