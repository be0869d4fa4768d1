use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backend::{CacheBackend, CacheError};

// ---

const SCAN_COUNT: usize = 500;

/// Redis-backed cache. The connection manager reconnects on its own, so one
/// instance lives for the whole process.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        // ---
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisBackend { conn })
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        // ---
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn index_add(&self, index: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let () = redis::pipe()
            .atomic()
            .sadd(index, member)
            .ignore()
            .expire(index, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(index).await?;
        Ok(members)
    }

    async fn index_remove(&self, index: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(index, members).await?;
        Ok(())
    }
}
