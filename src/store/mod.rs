//! Annotation store: keyed persistence for tasks, requests and records.
//!
//! The engine reads and writes only through [`AnnotationStore`]; it never
//! assumes a persistence format. Three backends ship with the crate:
//! - `MemoryStore`: in-process maps (tests, embedding)
//! - `JsonlStore`: one append-only JSONL log per task, state derived by replay
//! - `SqliteStore`: embedded SQLite with an explicit `order` column

pub mod jsonl;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ResolvedConfig, StoreBackend};
use crate::domain::{sort_by_priority, AnnotationRecord, AnnotationRequest, Datapoint, Task};

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Store connection poisoned by a panicked writer")]
    Poisoned,

    #[error("Blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid task id {0:?}")]
    InvalidTaskId(String),

    #[error("Corrupt store entry at {location}: {message}")]
    Corrupt { location: String, message: String },
}

/// Keyed store mapping `(task, annotator, request_id)` to requests and
/// records.
///
/// Implementations must give read-your-writes consistency per annotator.
/// `mark_stale` must be conditional: only a Pending request may become
/// Stale, so a concurrent completion is never undone.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Upsert datapoints by entity; first import position is kept
    async fn put_datapoints(&self, task_id: &str, datapoints: &[Datapoint]) -> Result<(), StoreError>;

    /// Datapoints in import order
    async fn list_datapoints(&self, task_id: &str) -> Result<Vec<Datapoint>, StoreError>;

    /// One annotator's requests in priority order
    async fn list_requests(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRequest>, StoreError>;

    async fn get_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<Option<AnnotationRequest>, StoreError>;

    /// Upsert a request
    async fn put_request(&self, request: &AnnotationRequest) -> Result<(), StoreError>;

    /// Upsert a batch of requests
    async fn put_requests(&self, requests: &[AnnotationRequest]) -> Result<(), StoreError> {
        for request in requests {
            self.put_request(request).await?;
        }
        Ok(())
    }

    /// Mark a Pending request Stale. Returns false when the request is
    /// missing or no longer Pending.
    async fn mark_stale(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError>;

    /// Remove a request. Returns false when it did not exist.
    async fn delete_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError>;

    /// Append an annotation record
    async fn put_annotation_record(&self, record: &AnnotationRecord) -> Result<(), StoreError>;

    /// One annotator's records in write order
    async fn list_annotation_records(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRecord>, StoreError>;

    /// Everyone holding requests or records for the task
    async fn list_annotators_for_task(&self, task_id: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Every request of a task, grouped by annotator then priority
    async fn list_task_requests(&self, task_id: &str) -> Result<Vec<AnnotationRequest>, StoreError> {
        let mut all = Vec::new();
        for annotator_id in self.list_annotators_for_task(task_id).await? {
            let mut requests = self.list_requests(task_id, &annotator_id).await?;
            sort_by_priority(&mut requests);
            all.extend(requests);
        }
        Ok(all)
    }
}

/// Open the store selected by the configuration
pub fn open_store(config: &ResolvedConfig) -> Result<Arc<dyn AnnotationStore>, StoreError> {
    let store: Arc<dyn AnnotationStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Jsonl => Arc::new(JsonlStore::new(config.tasks_dir())),
        StoreBackend::Sqlite => {
            std::fs::create_dir_all(&config.home)?;
            Arc::new(SqliteStore::open(config.database_path())?)
        }
    };

    tracing::debug!(backend = store.name(), "Opened annotation store");
    Ok(store)
}
