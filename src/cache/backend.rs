use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

// ---

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Key/value store with TTLs, glob scans and index sets.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Add `member` to the set at `index` and (re)arm the set's TTL.
    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn index_members(&self, index: &str) -> Result<Vec<String>, CacheError>;

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<(), CacheError>;
}

/// Minimal glob matcher supporting `*` (any run) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    // ---
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = backtrack {
            pi = star_pi + 1;
            ti = star_ti + 1;
            backtrack = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, (HashSet<String>, Instant)>,
}

/// Process-local backend with lazy expiry.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) values.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .values
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        // ---
        let mut inner = self.inner.lock();
        match inner.values.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                inner.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.inner
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter(|k| inner.values.remove(k.as_str()).is_some())
            .count() as u64)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner
            .values
            .iter()
            .filter(|(k, (_, expires))| *expires > now && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        // ---
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner
            .sets
            .entry(index.to_string())
            .or_insert_with(|| (HashSet::new(), now + ttl));
        if entry.1 <= now {
            entry.0.clear();
        }
        entry.0.insert(member.to_string());
        entry.1 = now + ttl;
        Ok(())
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, CacheError> {
        let inner = self.inner.lock();
        Ok(match inner.sets.get(index) {
            Some((members, expires)) if *expires > Instant::now() => {
                members.iter().cloned().collect()
            }
            _ => Vec::new(),
        })
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<(), CacheError> {
        if let Some((set, _)) = self.inner.lock().sets.get_mut(index) {
            for member in members {
                set.remove(member);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn glob_matches_redis_style_patterns() {
        // ---
        assert!(glob_match("sla:daily:*", "sla:daily:2025-01-01:2025-01-31"));
        assert!(glob_match("sla:*:2025-01-0?:*", "sla:weekly:2025-01-01:2025-01-28"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("sla:daily:*", "sla:weekly:2025-01-01:2025-01-31"));
        assert!(!glob_match("sla:?", "sla:ab"));
    }

    #[tokio::test]
    async fn expired_values_are_not_returned() {
        // ---
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn index_sets_round_trip() {
        // ---
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        backend.index_add("idx", "a", ttl).await.unwrap();
        backend.index_add("idx", "b", ttl).await.unwrap();
        backend.index_remove("idx", &["a".to_string()]).await.unwrap();

        assert_eq!(backend.index_members("idx").await.unwrap(), vec!["b".to_string()]);
    }
}
