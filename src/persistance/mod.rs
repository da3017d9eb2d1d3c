//! Fingerprint and metadata stores.
//!
//! The recognition engine only reads through [`FingerprintStore`] and
//! [`MetadataStore`]; registration lives on the concrete backends.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::StoreError;

pub mod database;
pub mod memory;

pub use database::SqliteStore;
pub use memory::MemoryStore;

pub type SongId = i64;

/// Free-form attributes attached to a registered song.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One stored occurrence of a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMatch {
    pub song_id: SongId,
    /// Anchor frame in the reference recording.
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SongRecord {
    pub id: SongId,
    pub name: String,
    pub fingerprints: usize,
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn lookup(&self, hash: u64) -> Result<Vec<StoredMatch>, StoreError>;

    async fn song_name(&self, song_id: SongId) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_metadata(&self, song_name: &str) -> Result<Option<Metadata>, StoreError>;
}

/// Run `op` under the configured timeout, retrying transient failures with
/// exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff();

    loop {
        let result = match tokio::time::timeout(policy.timeout(), op()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.timeout())),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(what, attempt, error = %err, "store call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff());
            }
            Err(err) => return Err(err),
        }
    }
}
