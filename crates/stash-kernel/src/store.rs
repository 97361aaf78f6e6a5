//! Storage seams: the blob store and the object index.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use stash_db::{ChangedObject, Database, IndexError, ObjectWrite};
use thiserror::Error;

/// Blob upload request.
#[derive(Debug, Clone, Copy)]
pub struct PutObject<'a> {
    pub key: &'a str,
    pub content_length: i64,
    pub acl: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store write of '{key}' failed: {error:#}")]
    Object {
        key: String,
        /// Back-off requested by the store, if it sent one.
        retry_after: Option<Duration>,
        error: anyhow::Error,
    },
    /// The blob store turned the write down for good (bad ACL, bad length).
    #[error("object store refused '{key}': {error:#}")]
    Refused { key: String, error: anyhow::Error },
    #[error("index write failed: {0:#}")]
    Index(anyhow::Error),
    #[error("no owner registered for upload prefix '{0}'")]
    UnknownPrefix(String),
}

impl StoreError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Object { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Failures that come back the same on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::Refused { .. } | StoreError::UnknownPrefix(_))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Writes (or overwrites) the blob at `request.key`.
    async fn put_object(&self, request: PutObject<'_>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    /// Inserts or overwrites the row keyed by owner and name, stamping it with
    /// the current time.
    async fn upsert_object(&self, write: &ObjectWrite) -> Result<(), StoreError>;

    /// Rows with `last_updated >= since`, ascending, at most `limit`.
    async fn changed_since(&self, since: i64, limit: u32)
        -> Result<Vec<ChangedObject>, StoreError>;
}

#[async_trait]
impl IndexStore for Database {
    async fn upsert_object(&self, write: &ObjectWrite) -> Result<(), StoreError> {
        Database::upsert_object(self, write, Utc::now())
            .await
            .map_err(|err| match err.downcast_ref::<IndexError>() {
                Some(IndexError::UnknownPrefix(prefix)) => StoreError::UnknownPrefix(prefix.clone()),
                None => StoreError::Index(err),
            })
    }

    async fn changed_since(
        &self,
        since: i64,
        limit: u32,
    ) -> Result<Vec<ChangedObject>, StoreError> {
        Database::changed_since(self, since, limit)
            .await
            .map_err(StoreError::Index)
    }
}
