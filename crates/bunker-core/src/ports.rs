use std::path::Path;

use crate::Result;

/// Narrow read/write interface to the external state store (the database the
/// embedding client keeps its durable business data in).
///
/// The backup core only ever reads whole collections; `insert_many` exists
/// for the explicit, caller-driven restore-application step.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<serde_json::Value>>;

    async fn insert_many(&self, collection: &str, records: &[serde_json::Value]) -> Result<()>;
}

/// Port for pushing finished archives to remote object storage.
///
/// Implementations stream the file at `path` to `key`; repeated puts of the
/// same key must be idempotent overwrites.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;
}
