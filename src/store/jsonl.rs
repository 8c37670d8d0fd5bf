//! Append-only JSONL store with one log per task.
//!
//! Layout: `<root>/<task_id>/log.jsonl`. Every change is appended as a
//! [`StoreEvent`]; current state is derived by replaying the log in order.
//! Appends take an exclusive file lock so several processes can share a
//! task directory.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{AnnotationStore, StoreError};
use crate::domain::{
    is_valid_task_id, sort_by_priority, AnnotationRecord, AnnotationRequest, Datapoint,
    RequestStatus, Task,
};

const LOG_FILE: &str = "log.jsonl";

/// A single entry in a task log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    /// When the change was written
    pub timestamp: DateTime<Utc>,

    pub change: StoreChange,
}

impl StoreEvent {
    pub fn now(change: StoreChange) -> Self {
        Self {
            timestamp: Utc::now(),
            change,
        }
    }
}

/// Types of change recorded in a task log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum StoreChange {
    /// Task created or updated
    TaskDefined(Task),

    /// Datapoints imported (upsert by entity)
    DatapointsImported(Vec<Datapoint>),

    /// Request created or updated
    RequestPut(AnnotationRequest),

    /// Pending request swept to Stale
    RequestMarkedStale {
        annotator_id: String,
        request_id: String,
    },

    /// Request purged
    RequestDeleted {
        annotator_id: String,
        request_id: String,
    },

    /// Annotation record appended
    RecordPut(AnnotationRecord),
}

/// State of one task derived from its log
#[derive(Debug, Default)]
pub struct TaskState {
    pub task: Option<Task>,
    pub datapoints: Vec<Datapoint>,
    pub requests: BTreeMap<String, BTreeMap<String, AnnotationRequest>>,
    pub records: BTreeMap<String, Vec<AnnotationRecord>>,
}

impl TaskState {
    /// Apply a single change to the state
    fn apply(&mut self, change: StoreChange) {
        match change {
            StoreChange::TaskDefined(task) => {
                self.task = Some(task);
            }
            StoreChange::DatapointsImported(datapoints) => {
                for dp in datapoints {
                    match self.datapoints.iter_mut().find(|e| e.entity == dp.entity) {
                        Some(slot) => *slot = dp,
                        None => self.datapoints.push(dp),
                    }
                }
            }
            StoreChange::RequestPut(request) => {
                self.requests
                    .entry(request.annotator_id.clone())
                    .or_default()
                    .insert(request.request_id.clone(), request);
            }
            StoreChange::RequestMarkedStale {
                annotator_id,
                request_id,
            } => {
                // Conditional on replay too: a completion that raced the
                // sweep keeps the request Complete.
                if let Some(request) = self
                    .requests
                    .get_mut(&annotator_id)
                    .and_then(|m| m.get_mut(&request_id))
                {
                    if request.status == RequestStatus::Pending {
                        request.status = RequestStatus::Stale;
                    }
                }
            }
            StoreChange::RequestDeleted {
                annotator_id,
                request_id,
            } => {
                if let Some(requests) = self.requests.get_mut(&annotator_id) {
                    requests.remove(&request_id);
                }
            }
            StoreChange::RecordPut(record) => {
                self.records
                    .entry(record.annotator_id.clone())
                    .or_default()
                    .push(record);
            }
        }
    }

    fn request(&self, annotator_id: &str, request_id: &str) -> Option<&AnnotationRequest> {
        self.requests
            .get(annotator_id)
            .and_then(|m| m.get(request_id))
    }
}

/// File-based store using one JSONL log per task
pub struct JsonlStore {
    /// Directory holding one subdirectory per task
    root: PathBuf,

    /// Serializes read-check-append sequences within this process
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path to a task's log file; the id must be a single plain name
    pub fn log_path(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_task_id(task_id) {
            return Err(StoreError::InvalidTaskId(task_id.to_string()));
        }
        Ok(self.root.join(task_id).join(LOG_FILE))
    }

    /// Append events to a task log under an exclusive file lock
    async fn append(&self, task_id: &str, events: Vec<StoreEvent>) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut payload = String::new();
        for event in &events {
            payload.push_str(&serde_json::to_string(event)?);
            payload.push('\n');
        }

        let path = self.log_path(task_id)?;
        tokio::task::spawn_blocking(move || append_locked(&path, &payload)).await?
    }

    /// Replay a task log into its current state
    pub async fn replay(&self, task_id: &str) -> Result<TaskState, StoreError> {
        let mut state = TaskState::default();
        let path = self.log_path(task_id)?;

        let read_path = path.clone();
        let Some(content) = tokio::task::spawn_blocking(move || read_locked(&read_path)).await??
        else {
            return Ok(state);
        };

        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let event: StoreEvent =
                serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                    location: format!("{}:{}", path.display(), index + 1),
                    message: e.to_string(),
                })?;
            state.apply(event.change);
        }

        Ok(state)
    }
}

/// Read a whole log under a shared lock so appends are never seen half
/// written. A missing log reads as `None`.
fn read_locked(path: &Path) -> Result<Option<String>, StoreError> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    file.lock_shared().map_err(|source| StoreError::Lock {
        path: path.to_path_buf(),
        source,
    })?;

    let mut content = String::new();
    let read = file.read_to_string(&mut content);
    let _ = file.unlock();
    read?;

    Ok(Some(content))
}

fn append_locked(path: &Path, payload: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    file.lock_exclusive().map_err(|source| StoreError::Lock {
        path: path.to_path_buf(),
        source,
    })?;

    let written = file.write_all(payload.as_bytes()).and_then(|_| file.flush());
    let _ = file.unlock();
    written?;

    Ok(())
}

#[async_trait]
impl AnnotationStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.replay(task_id).await?.task)
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.append(
            &task.id,
            vec![StoreEvent::now(StoreChange::TaskDefined(task.clone()))],
        )
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();

        if !self.root.exists() {
            return Ok(tasks);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().filter(|n| is_valid_task_id(n)) {
                if let Some(task) = self.replay(name).await?.task {
                    tasks.push(task);
                }
            }
        }

        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn put_datapoints(&self, task_id: &str, datapoints: &[Datapoint]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.append(
            task_id,
            vec![StoreEvent::now(StoreChange::DatapointsImported(
                datapoints.to_vec(),
            ))],
        )
        .await
    }

    async fn list_datapoints(&self, task_id: &str) -> Result<Vec<Datapoint>, StoreError> {
        Ok(self.replay(task_id).await?.datapoints)
    }

    async fn list_requests(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRequest>, StoreError> {
        let mut state = self.replay(task_id).await?;
        let mut requests: Vec<AnnotationRequest> = state
            .requests
            .remove(annotator_id)
            .map(|m| m.into_values().collect())
            .unwrap_or_default();

        sort_by_priority(&mut requests);
        Ok(requests)
    }

    async fn get_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<Option<AnnotationRequest>, StoreError> {
        let state = self.replay(task_id).await?;
        Ok(state.request(annotator_id, request_id).cloned())
    }

    async fn put_request(&self, request: &AnnotationRequest) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.append(
            &request.task_id,
            vec![StoreEvent::now(StoreChange::RequestPut(request.clone()))],
        )
        .await
    }

    async fn put_requests(&self, requests: &[AnnotationRequest]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        // One locked append per task keeps a generated batch contiguous
        let mut by_task: BTreeMap<&str, Vec<StoreEvent>> = BTreeMap::new();
        for request in requests {
            by_task
                .entry(request.task_id.as_str())
                .or_default()
                .push(StoreEvent::now(StoreChange::RequestPut(request.clone())));
        }

        for (task_id, events) in by_task {
            self.append(task_id, events).await?;
        }

        Ok(())
    }

    async fn mark_stale(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let state = self.replay(task_id).await?;

        match state.request(annotator_id, request_id) {
            Some(request) if request.status == RequestStatus::Pending => {}
            _ => return Ok(false),
        }

        self.append(
            task_id,
            vec![StoreEvent::now(StoreChange::RequestMarkedStale {
                annotator_id: annotator_id.to_string(),
                request_id: request_id.to_string(),
            })],
        )
        .await?;

        Ok(true)
    }

    async fn delete_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let state = self.replay(task_id).await?;

        if state.request(annotator_id, request_id).is_none() {
            return Ok(false);
        }

        self.append(
            task_id,
            vec![StoreEvent::now(StoreChange::RequestDeleted {
                annotator_id: annotator_id.to_string(),
                request_id: request_id.to_string(),
            })],
        )
        .await?;

        Ok(true)
    }

    async fn put_annotation_record(&self, record: &AnnotationRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.append(
            &record.task_id,
            vec![StoreEvent::now(StoreChange::RecordPut(record.clone()))],
        )
        .await
    }

    async fn list_annotation_records(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRecord>, StoreError> {
        let mut state = self.replay(task_id).await?;
        Ok(state.records.remove(annotator_id).unwrap_or_default())
    }

    async fn list_annotators_for_task(&self, task_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let state = self.replay(task_id).await?;

        let with_requests = state
            .requests
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(a, _)| a.clone());
        let with_records = state
            .records
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(a, _)| a.clone());

        Ok(with_requests.chain(with_records).collect())
    }

    async fn list_task_requests(&self, task_id: &str) -> Result<Vec<AnnotationRequest>, StoreError> {
        // Single replay instead of one per annotator
        let state = self.replay(task_id).await?;
        let mut all = Vec::new();

        for requests in state.requests.into_values() {
            let mut requests: Vec<_> = requests.into_values().collect();
            sort_by_priority(&mut requests);
            all.extend(requests);
        }

        Ok(all)
    }
}
