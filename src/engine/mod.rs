//! Annotation engine: request lifecycle, consensus, agreement and export.
//!
//! [`Engine`] wraps a shared [`AnnotationStore`] and exposes the async
//! operations; consensus and kappa are pure functions over fetched data.

pub mod agreement;
pub mod consensus;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod outcome;
pub mod report;
pub mod sweeper;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::{latest_by_entity_label, AnnotationRecord, Task};
use crate::store::AnnotationStore;

pub use agreement::{cohen_kappa, compute_agreement, AgreementMatrix, AnnotationSets, AnnotatorPair};
pub use consensus::{entropy, majority, merge, merge_labels, Consensus, Vote};
pub use error::{EngineError, Result};
pub use export::{write_jsonl, LabeledExample};
pub use lifecycle::{next_pending, GenerateOptions};
pub use outcome::{FailurePolicy, Outcome, UnitFailure};
pub use report::{render_matrix, AnnotationStatistics, ContentionRow};
pub use sweeper::{StaleSweeper, SweepHandle, SweepReport};

/// annotator -> (entity, label) -> latest record
pub(crate) type LatestRecords = BTreeMap<String, BTreeMap<(String, String), AnnotationRecord>>;

/// Entry point for every engine operation.
///
/// Clones share the store and the generation lock, so the per-datapoint
/// cap holds across concurrent `generate_requests` calls made through
/// one engine.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn AnnotationStore>,
    generation: Arc<Mutex<()>>,
}

impl Engine {
    pub fn new(store: Arc<dyn AnnotationStore>) -> Self {
        Self {
            store,
            generation: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn AnnotationStore> {
        &self.store
    }

    /// Load a task or fail with NotFound
    pub async fn task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("task '{}'", task_id)))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks().await?)
    }

    /// Latest record per (annotator, entity, label) for a task
    pub(crate) async fn latest_records(&self, task_id: &str) -> Result<LatestRecords> {
        let mut latest = LatestRecords::new();
        for annotator_id in self.store.list_annotators_for_task(task_id).await? {
            let records = self
                .store
                .list_annotation_records(task_id, &annotator_id)
                .await?;
            if !records.is_empty() {
                latest.insert(annotator_id, latest_by_entity_label(records));
            }
        }
        Ok(latest)
    }
}
