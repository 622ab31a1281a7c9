use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use anyhow::Result;

/// The key-value operations the auth repository needs. Redis shaped, but the
/// repository never sees which backend sits behind it.
#[async_trait::async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Set only if the key does not exist yet; returns false on collision.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Returns false when the key was not there.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Process local store. Entries expire lazily, checked on every access.
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        MemoryStorage::new()
    }
}

#[async_trait::async_trait]
impl KvStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if let Some((_, expires)) = entries.get(key)
            && *expires > Instant::now()
        {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(key) {
            Some((_, expires)) => Ok(expires > Instant::now()),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Redis backend over a shared multiplexed connection.
pub struct RedisStorage {
    conn: redis::aio::ConnectionManager,
}

impl RedisStorage {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisStorage { conn })
    }
}

#[async_trait::async_trait]
impl KvStorage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.set_nx("k1", "v1", Duration::from_secs(60)).await.unwrap());
        assert_eq!(storage.get("k1").await.unwrap(), Some("v1".to_string()));
        assert!(storage.exists("k1").await.unwrap());
        assert!(storage.delete("k1").await.unwrap());
        assert!(!storage.delete("k1").await.unwrap());
        assert_eq!(storage.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_set_nx_collision() {
        let storage = MemoryStorage::new();
        assert!(storage.set_nx("k1", "v1", Duration::from_secs(60)).await.unwrap());
        assert!(!storage.set_nx("k1", "v2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(storage.get("k1").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_memory_entries_expire() {
        let storage = MemoryStorage::new();
        assert!(storage.set_nx("k1", "v1", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(storage.get("k1").await.unwrap(), None);
        assert!(!storage.exists("k1").await.unwrap());
        // Expired slots can be taken again
        assert!(storage.set_nx("k1", "v2", Duration::from_secs(60)).await.unwrap());
    }
}
