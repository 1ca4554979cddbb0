use async_trait::async_trait;
use hashbrown::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("embedded cache store error")]
    Sled(#[from] sled::Error),
}

/// Byte-level cache the search layer stores its precomputed result sets
/// in. Implementations must tolerate arbitrary keys and treat a missing
/// key as a plain miss.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
}

/// Process-local cache for tests and single-replica deployments.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().expect("cache lock poisoned").get(key).cloned())
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(key.to_owned(), value);
        Ok(())
    }
}

/// Embedded on-disk cache, so populated result sets survive a process
/// restart.
pub struct SledCache {
    db: sled::Db,
}

impl SledCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

#[async_trait]
impl Cache for SledCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.db.insert(key, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get_bytes("missing").await.unwrap(), None);

        cache.set_bytes("key", b"value".to_vec()).await.unwrap();
        assert_eq!(cache.get_bytes("key").await.unwrap(), Some(b"value".to_vec()));

        cache.set_bytes("key", b"newer".to_vec()).await.unwrap();
        assert_eq!(cache.get_bytes("key").await.unwrap(), Some(b"newer".to_vec()));
    }

    #[tokio::test]
    async fn sled_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SledCache::open(dir.path().join("cache")).unwrap();
        assert_eq!(cache.get_bytes("missing").await.unwrap(), None);

        cache.set_bytes("key", b"value".to_vec()).await.unwrap();
        assert_eq!(cache.get_bytes("key").await.unwrap(), Some(b"value".to_vec()));
    }
}
