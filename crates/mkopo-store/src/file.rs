//! File-backed cache: one JSON document per key inside a directory.
//!
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a crash mid-write never leaves a torn entry behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{KvCache, StoreError};

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", encode_key(key))))
    }
}

/// Percent-encode anything outside `[A-Za-z0-9_-]` so every key maps to a
/// distinct, flat file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[async_trait]
impl KvCache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(value.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
            debug!(path = %path.display(), "cache entry written");
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Other(format!("cache writer task failed: {e}")))?
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        cache.set("customer_comments_c1", "[1]".into()).await.unwrap();

        let reopened = FileCache::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get("customer_comments_c1").await.unwrap().as_deref(),
            Some("[1]")
        );
    }

    #[tokio::test]
    async fn overwrite_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        cache.set("k", "a".into()).await.unwrap();
        cache.set("k", "b".into()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
        cache.remove("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn keys_with_separators_stay_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        cache.set("../escape/x", "v".into()).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["%2E%2E%2Fescape%2Fx.json".to_string()]);
        assert_eq!(cache.get("../escape/x").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        cache.set("a.b", "dot".into()).await.unwrap();
        cache.set("a_b", "underscore".into()).await.unwrap();
        assert_eq!(cache.get("a.b").await.unwrap().as_deref(), Some("dot"));
        assert_eq!(cache.get("a_b").await.unwrap().as_deref(), Some("underscore"));
    }

    #[tokio::test]
    async fn empty_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        assert!(matches!(
            cache.get("").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn encode_key_passthrough() {
        assert_eq!(encode_key("customer_comments_65ab"), "customer_comments_65ab");
    }
}
