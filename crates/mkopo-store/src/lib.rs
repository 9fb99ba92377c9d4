//! Local durable key-value cache: the offline backstop for operator writes.
//!
//! The cache is string-keyed and string-valued, like browser storage. Callers
//! depend on the [`KvCache`] trait; [`MemoryCache`] and [`FileCache`] are the
//! two provided backends.

mod error;
mod file;
mod keys;
mod memory;

pub use error::StoreError;
pub use file::FileCache;
pub use keys::{comments_key, synced_comments_key};
pub use memory::MemoryCache;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Injectable key-value store with get/set/remove semantics.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read and deserialise a JSON value.
pub async fn load_json<T, C>(cache: &C, key: &str) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    C: KvCache + ?Sized,
{
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialise and write a JSON value.
pub async fn store_json<T, C>(cache: &C, key: &str, value: &T) -> Result<(), StoreError>
where
    T: Serialize + ?Sized,
    C: KvCache + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw).await
}
