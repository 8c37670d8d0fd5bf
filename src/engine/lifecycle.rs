//! Request lifecycle: tasks, datapoint import, request generation,
//! assignment, submission and stale handling.
//!
//! Status transitions are Pending -> Complete on submission and
//! Pending -> Stale by sweep. Nothing leaves Complete.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument};

use super::consensus::validate_weight;
use super::error::{EngineError, Result};
use super::outcome::{FailureLog, FailurePolicy, Outcome};
use super::Engine;
use crate::config::{DEFAULT_MAX_PER_ANNOTATOR, DEFAULT_MAX_PER_DATAPOINT};
use crate::domain::{
    AnnotationContext, AnnotationRecord, AnnotationRequest, AnnotationValue, Datapoint,
    RequestStatus, Task,
};

/// Limits for one round of request generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Upper bound on new requests for the annotator
    pub max_per_annotator: usize,
    /// Upper bound on Pending requests per (entity, label) across annotators
    pub max_per_datapoint: usize,
    /// Must name the task's entity type
    pub entity_type: Option<String>,
}

impl GenerateOptions {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            max_per_annotator: DEFAULT_MAX_PER_ANNOTATOR,
            max_per_datapoint: DEFAULT_MAX_PER_DATAPOINT,
            entity_type: Some(entity_type.into()),
        }
    }

    pub fn with_max_per_annotator(mut self, max: usize) -> Self {
        self.max_per_annotator = max;
        self
    }

    pub fn with_max_per_datapoint(mut self, max: usize) -> Self {
        self.max_per_datapoint = max;
        self
    }
}

/// First Pending request after `current` in ring order.
///
/// `requests` must be in priority order. An unknown or absent `current`
/// starts the scan at the first request; a known one starts right after
/// it and examines it last.
pub fn next_pending<'a>(
    requests: &'a [AnnotationRequest],
    current: Option<&str>,
) -> Option<&'a AnnotationRequest> {
    let n = requests.len();
    let start = current
        .and_then(|id| requests.iter().position(|r| r.request_id == id))
        .map_or(0, |i| i + 1);

    (0..n)
        .map(|offset| &requests[(start + offset) % n])
        .find(|r| r.is_pending())
}

impl Engine {
    /// Validate and store a new task
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn create_task(&self, task: Task) -> Result<Task> {
        task.validate()?;
        if self.store.get_task(&task.id).await?.is_some() {
            return Err(EngineError::invalid(format!("task '{}' already exists", task.id)));
        }

        self.store.put_task(&task).await?;
        info!(name = %task.name, labels = task.labels.len(), "Task created");
        Ok(task)
    }

    /// Replace a task's active label set. Requests for dropped labels
    /// become stale on the next sweep.
    #[instrument(skip(self, labels))]
    pub async fn set_task_labels(&self, task_id: &str, labels: Vec<String>) -> Result<Task> {
        let mut task = self.task(task_id).await?;
        task.labels = labels;
        task.validate()?;

        self.store.put_task(&task).await?;
        info!(labels = ?task.labels, "Task labels updated");
        Ok(task)
    }

    /// Load datapoints from a JSONL data file into a task.
    ///
    /// Each line is an [`AnnotationContext`]; lines that fail to parse or
    /// name no entity are reported as `path:line` failures.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn import_datapoints(
        &self,
        task_id: &str,
        path: &Path,
        policy: FailurePolicy,
    ) -> Result<Outcome<usize>> {
        let mut task = self.task(task_id).await?;

        let read_error =
            |e: std::io::Error| EngineError::invalid(format!("cannot read {}: {}", path.display(), e));
        let file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let mut lines = BufReader::new(file).lines();
        let mut failures = FailureLog::new(policy);
        let mut datapoints = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await.map_err(read_error)? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let unit = format!("{}:{}", path.display(), line_no);
            match parse_datapoint(&line) {
                Ok(dp) => datapoints.push(dp),
                Err(err) => failures.record(unit, err)?,
            }
        }

        self.store.put_datapoints(task_id, &datapoints).await?;

        let source = path.display().to_string();
        if !task.data_files.contains(&source) {
            task.data_files.push(source);
            self.store.put_task(&task).await?;
        }

        info!(imported = datapoints.len(), "Datapoints imported");
        Ok(failures.finish(datapoints.len()))
    }

    /// Create Pending requests for an annotator. Returns how many were
    /// written.
    #[instrument(skip(self, options), fields(max = options.max_per_annotator))]
    pub async fn generate_requests(
        &self,
        task_id: &str,
        annotator_id: &str,
        options: &GenerateOptions,
    ) -> Result<usize> {
        let entity_type = options
            .entity_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::invalid("entity_type is required"))?;

        let task = self.task(task_id).await?;
        if task.entity_type != entity_type {
            return Err(EngineError::invalid(format!(
                "task '{}' labels '{}' entities, not '{}'",
                task_id, task.entity_type, entity_type
            )));
        }
        if !task.annotators.iter().any(|a| a == annotator_id) {
            return Err(EngineError::not_found(format!(
                "annotator '{}' in task '{}'",
                annotator_id, task_id
            )));
        }
        if options.max_per_annotator == 0 {
            return Ok(0);
        }

        // Cap counting and the batch write must not interleave
        let _guard = self.generation.lock().await;
        let existing = self.store.list_requests(task_id, annotator_id).await?;
        let already_requested: BTreeSet<(&str, &str)> = existing
            .iter()
            .map(|r| (r.entity.as_str(), r.label.as_str()))
            .collect();

        let mut outstanding: HashMap<(String, String), usize> = HashMap::new();
        for request in self.store.list_task_requests(task_id).await? {
            if request.is_pending() {
                *outstanding
                    .entry((request.entity, request.label))
                    .or_default() += 1;
            }
        }

        let datapoints = self.store.list_datapoints(task_id).await?;
        let mut batch: Vec<(&Datapoint, &str)> = Vec::new();

        'candidates: for dp in &datapoints {
            for label in &task.labels {
                if batch.len() >= options.max_per_annotator {
                    break 'candidates;
                }
                if already_requested.contains(&(dp.entity.as_str(), label.as_str())) {
                    continue;
                }
                let pending = outstanding
                    .get(&(dp.entity.clone(), label.clone()))
                    .copied()
                    .unwrap_or(0);
                if pending >= options.max_per_datapoint {
                    continue;
                }
                batch.push((dp, label));
            }
        }

        // New batch sorts ahead of everything already queued
        let base = existing
            .iter()
            .map(|r| r.order)
            .min_by(f64::total_cmp)
            .map_or(0.0, |min| min.min(0.0));
        let n = batch.len();
        let requests: Vec<AnnotationRequest> = batch
            .into_iter()
            .enumerate()
            .map(|(i, (dp, label))| {
                let order = base - (n - i) as f64;
                AnnotationRequest::new(task_id, annotator_id, dp, label, &task.entity_type, order)
            })
            .collect();

        self.store.put_requests(&requests).await?;
        info!(%annotator_id, created = n, "Generated annotation requests");
        Ok(n)
    }

    /// Next Pending request for an annotator, scanning past `current`
    pub async fn next_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        current: Option<&str>,
    ) -> Result<Option<AnnotationRequest>> {
        self.task(task_id).await?;
        let requests = self.store.list_requests(task_id, annotator_id).await?;
        Ok(next_pending(&requests, current).cloned())
    }

    /// Store an annotator's answer and complete the request
    #[instrument(skip(self, context))]
    pub async fn record_annotation(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
        value: i32,
        weight: Option<f64>,
        context: Option<AnnotationContext>,
    ) -> Result<AnnotationRecord> {
        let value = AnnotationValue::try_from(value)?;
        validate_weight(weight)?;

        let mut request = self
            .store
            .get_request(task_id, annotator_id, request_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "request '{}' for annotator '{}' in task '{}'",
                    request_id, annotator_id, task_id
                ))
            })?;

        if request.status == RequestStatus::Stale {
            return Err(EngineError::invalid(format!(
                "request '{}' is stale",
                request_id
            )));
        }

        let record = AnnotationRecord::from_request(&request, value, weight, context.as_ref());
        self.store.put_annotation_record(&record).await?;

        if request.status != RequestStatus::Complete {
            request.status = RequestStatus::Complete;
            self.store.put_request(&request).await?;
        } else {
            debug!("Resubmission for completed request");
        }

        Ok(record)
    }

    /// Mark Pending requests outside the task's labels or entity type as
    /// Stale. Returns how many changed.
    #[instrument(skip(self))]
    pub async fn sweep_stale(&self, task_id: &str) -> Result<usize> {
        let task = self.task(task_id).await?;
        let mut swept = 0;

        for request in self.store.list_task_requests(task_id).await? {
            if !request.is_pending() || task.is_active(&request.label, &request.entity_type) {
                continue;
            }
            if self
                .store
                .mark_stale(task_id, &request.annotator_id, &request.request_id)
                .await?
            {
                swept += 1;
            }
        }

        if swept > 0 {
            info!(swept, "Marked requests stale");
        }
        Ok(swept)
    }

    /// Delete Stale requests. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn purge_stale(&self, task_id: &str) -> Result<usize> {
        self.task(task_id).await?;
        let mut purged = 0;

        for request in self.store.list_task_requests(task_id).await? {
            if request.status != RequestStatus::Stale {
                continue;
            }
            if self
                .store
                .delete_request(task_id, &request.annotator_id, &request.request_id)
                .await?
            {
                purged += 1;
            }
        }

        if purged > 0 {
            info!(purged, "Purged stale requests");
        }
        Ok(purged)
    }

    /// Pending requests assigned to an annotator
    pub async fn outstanding(&self, task_id: &str, annotator_id: &str) -> Result<usize> {
        let requests = self.store.list_requests(task_id, annotator_id).await?;
        Ok(requests.iter().filter(|r| r.is_pending()).count())
    }
}

fn parse_datapoint(line: &str) -> Result<Datapoint> {
    let context: AnnotationContext = serde_json::from_str(line)
        .map_err(|e| EngineError::invalid(format!("malformed data line: {}", e)))?;
    Datapoint::from_context(context)
        .ok_or_else(|| EngineError::invalid("data line names no entity (meta.domain or meta.name)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::{AnnotationStore, MemoryStore};

    fn engine() -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Engine::new(store.clone()), store)
    }

    async fn seeded(entities: &[&str], labels: &[&str], annotators: &[&str]) -> (Engine, Arc<MemoryStore>) {
        let (engine, store) = engine();
        let task = Task::new("t", "company")
            .with_id("t1")
            .with_labels(labels.iter().copied())
            .with_annotators(annotators.iter().copied())
            .with_data_files(["data.jsonl"]);
        engine.create_task(task).await.unwrap();

        let datapoints: Vec<Datapoint> = entities
            .iter()
            .map(|e| Datapoint::new(*e, AnnotationContext::with_text(format!("about {}", e))))
            .collect();
        store.put_datapoints("t1", &datapoints).await.unwrap();
        (engine, store)
    }

    fn ids(requests: &[AnnotationRequest]) -> Vec<&str> {
        requests.iter().map(|r| r.request_id.as_str()).collect()
    }

    #[test]
    fn test_next_pending_ring_scan() {
        let dp = Datapoint::new("e", AnnotationContext::default());
        let mut requests: Vec<AnnotationRequest> = (0..4)
            .map(|i| AnnotationRequest::new("t1", "ann", &dp, format!("L{}", i), "company", i as f64))
            .collect();
        requests[0].status = RequestStatus::Complete;
        requests[2].status = RequestStatus::Complete;
        let all = ids(&requests);

        assert_eq!(next_pending(&requests, None).unwrap().request_id, all[1]);
        assert_eq!(next_pending(&requests, Some("unknown")).unwrap().request_id, all[1]);
        assert_eq!(next_pending(&requests, Some(all[1])).unwrap().request_id, all[3]);
        // Wraps around and examines current last
        assert_eq!(next_pending(&requests, Some(all[3])).unwrap().request_id, all[1]);

        requests[1].status = RequestStatus::Complete;
        let current = requests[3].request_id.clone();
        assert_eq!(next_pending(&requests, Some(&current)).unwrap().request_id, current);

        requests[3].status = RequestStatus::Stale;
        assert!(next_pending(&requests, Some(&current)).is_none());
        assert!(next_pending(&[], None).is_none());
    }

    #[tokio::test]
    async fn test_generate_caps_and_orders() {
        let (engine, store) = seeded(&["a", "b", "c"], &["L"], &["ann"]).await;

        let first = engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company").with_max_per_annotator(2))
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company"))
            .await
            .unwrap();
        assert_eq!(second, 1);

        // Nothing left to request
        let third = engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company"))
            .await
            .unwrap();
        assert_eq!(third, 0);

        let listed = store.list_requests("t1", "ann").await.unwrap();
        let entities: Vec<_> = listed.iter().map(|r| r.entity.as_str()).collect();
        // Latest batch first, batch order preserved
        assert_eq!(entities, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_generate_respects_datapoint_cap() {
        let (engine, _) = seeded(&["a"], &["L"], &["ann", "ben", "cat"]).await;
        let options = GenerateOptions::new("company").with_max_per_datapoint(2);

        assert_eq!(engine.generate_requests("t1", "ann", &options).await.unwrap(), 1);
        assert_eq!(engine.generate_requests("t1", "ben", &options).await.unwrap(), 1);
        assert_eq!(engine.generate_requests("t1", "cat", &options).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generate_validation() {
        let (engine, store) = seeded(&["a"], &["L"], &["ann"]).await;

        let mut options = GenerateOptions::new("company");
        options.entity_type = None;
        assert!(matches!(
            engine.generate_requests("t1", "ann", &options).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.generate_requests("t1", "ann", &GenerateOptions::new("person")).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.generate_requests("t1", "zed", &GenerateOptions::new("company")).await,
            Err(EngineError::NotFound(_))
        ));

        let zero = GenerateOptions::new("company").with_max_per_annotator(0);
        assert_eq!(engine.generate_requests("t1", "ann", &zero).await.unwrap(), 0);
        assert!(store.list_requests("t1", "ann").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_annotation_completes_request() {
        let (engine, store) = seeded(&["a"], &["L"], &["ann"]).await;
        engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company"))
            .await
            .unwrap();
        let request = engine.next_request("t1", "ann", None).await.unwrap().unwrap();

        let record = engine
            .record_annotation("t1", "ann", &request.request_id, 1, None, None)
            .await
            .unwrap();
        assert_eq!(record.value, 1);
        assert_eq!(record.text(), "about a");

        let stored = store.get_request("t1", "ann", &request.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Complete);
        assert!(engine.next_request("t1", "ann", None).await.unwrap().is_none());

        // Resubmission appends another record
        engine
            .record_annotation("t1", "ann", &request.request_id, -1, Some(2.0), None)
            .await
            .unwrap();
        assert_eq!(store.list_annotation_records("t1", "ann").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_annotation_errors() {
        let (engine, store) = seeded(&["a"], &["L"], &["ann"]).await;
        engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company"))
            .await
            .unwrap();
        let request = engine.next_request("t1", "ann", None).await.unwrap().unwrap();

        assert!(matches!(
            engine.record_annotation("t1", "ann", "missing", 1, None, None).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.record_annotation("t1", "ann", &request.request_id, 5, None, None).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.record_annotation("t1", "ann", &request.request_id, 1, Some(-1.0), None).await,
            Err(EngineError::InvalidInput(_))
        ));

        store.mark_stale("t1", "ann", &request.request_id).await.unwrap();
        assert!(matches!(
            engine.record_annotation("t1", "ann", &request.request_id, 1, None, None).await,
            Err(EngineError::InvalidInput(_))
        ));
        assert!(store.list_annotation_records("t1", "ann").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_then_purge() {
        let (engine, store) = seeded(&["a"], &["KEEP", "DROP"], &["ann"]).await;
        engine
            .generate_requests("t1", "ann", &GenerateOptions::new("company"))
            .await
            .unwrap();

        // Complete the DROP request so the sweep must leave it alone
        let requests = store.list_requests("t1", "ann").await.unwrap();
        let done = requests.iter().find(|r| r.label == "DROP").unwrap();
        engine
            .record_annotation("t1", "ann", &done.request_id, 1, None, None)
            .await
            .unwrap();

        engine.set_task_labels("t1", vec!["OTHER".to_string()]).await.unwrap();
        assert_eq!(engine.sweep_stale("t1").await.unwrap(), 1);
        assert_eq!(engine.sweep_stale("t1").await.unwrap(), 0);
        assert_eq!(engine.outstanding("t1", "ann").await.unwrap(), 0);

        assert_eq!(engine.purge_stale("t1").await.unwrap(), 1);
        let remaining = store.list_requests("t1", "ann").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, RequestStatus::Complete);
    }

    #[tokio::test]
    async fn test_import_reports_bad_lines() {
        let (engine, store) = seeded(&[], &["L"], &["ann"]).await;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("companies.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"text\": \"Foo builds EHR\", \"meta\": {\"domain\": \"foo.com\"}}\n",
                "not json\n",
                "\n",
                "{\"text\": \"no entity\"}\n",
                "{\"text\": \"Bar\", \"meta\": {\"name\": \"Bar\"}}\n",
            ),
        )
        .unwrap();

        let outcome = engine
            .import_datapoints("t1", &path, FailurePolicy::Isolate)
            .await
            .unwrap();
        assert_eq!(outcome.value, 2);
        let units: Vec<_> = outcome.failures.iter().map(|f| f.unit.clone()).collect();
        assert_eq!(
            units,
            vec![format!("{}:2", path.display()), format!("{}:4", path.display())]
        );

        let datapoints = store.list_datapoints("t1").await.unwrap();
        assert_eq!(datapoints[0].entity, "foo.com");
        assert_eq!(datapoints[1].entity, "Bar");

        let task = engine.task("t1").await.unwrap();
        assert!(task.data_files.contains(&path.display().to_string()));
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_and_duplicate() {
        let (engine, _) = engine();
        let invalid = Task::new("", "company");
        assert!(matches!(
            engine.create_task(invalid).await,
            Err(EngineError::InvalidInput(_))
        ));

        let task = Task::new("t", "company")
            .with_id("t1")
            .with_labels(["L"])
            .with_annotators(["ann"])
            .with_data_files(["d.jsonl"]);
        engine.create_task(task.clone()).await.unwrap();
        assert!(matches!(
            engine.create_task(task).await,
            Err(EngineError::InvalidInput(_))
        ));
    }
}
