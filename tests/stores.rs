//! Store Conformance Tests
//!
//! Every backend must order requests by priority, give read-your-writes
//! per annotator, and only move Pending requests to Stale.

use std::sync::Arc;

use annokit::domain::{AnnotationContext, AnnotationRecord, AnnotationRequest, AnnotationValue, Datapoint, RequestStatus, Task};
use annokit::store::{AnnotationStore, JsonlStore, MemoryStore, SqliteStore};
use tempfile::TempDir;

fn request(annotator: &str, entity: &str, label: &str, order: f64) -> AnnotationRequest {
    let dp = Datapoint::new(entity, AnnotationContext::with_text(format!("about {}", entity)));
    AnnotationRequest::new("t1", annotator, &dp, label, "company", order)
}

/// Each backend, kept alive alongside its temp directory
fn backends(temp: &TempDir) -> Vec<Arc<dyn AnnotationStore>> {
    vec![
        Arc::new(MemoryStore::new()),
        Arc::new(JsonlStore::new(temp.path().join("tasks"))),
        Arc::new(SqliteStore::open(temp.path().join("annokit.db")).unwrap()),
    ]
}

#[tokio::test]
async fn test_priority_order_and_read_your_writes() {
    let temp = TempDir::new().unwrap();

    for store in backends(&temp) {
        let mut late = request("ann", "c", "L", 2.0);
        store
            .put_requests(&[late.clone(), request("ann", "a", "L", -5.0), request("ann", "b", "L", 0.0)])
            .await
            .unwrap();

        let entities: Vec<String> = store
            .list_requests("t1", "ann")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.entity)
            .collect();
        assert_eq!(entities, vec!["a", "b", "c"], "backend {}", store.name());

        // Upsert moves the request to the front
        late.order = -10.0;
        store.put_request(&late).await.unwrap();
        let first = &store.list_requests("t1", "ann").await.unwrap()[0];
        assert_eq!(first.entity, "c", "backend {}", store.name());

        // Other annotators are unaffected
        assert!(store.list_requests("t1", "ben").await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_conditional_stale_and_delete() {
    let temp = TempDir::new().unwrap();

    for store in backends(&temp) {
        let pending = request("ann", "a", "L", 0.0);
        let mut complete = request("ann", "b", "L", 1.0);
        complete.status = RequestStatus::Complete;
        store.put_requests(&[pending.clone(), complete.clone()]).await.unwrap();

        assert!(store.mark_stale("t1", "ann", &pending.request_id).await.unwrap());
        assert!(!store.mark_stale("t1", "ann", &complete.request_id).await.unwrap());
        assert!(!store.mark_stale("t1", "ann", "missing").await.unwrap());

        let stale = store
            .get_request("t1", "ann", &pending.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.status, RequestStatus::Stale, "backend {}", store.name());

        assert!(store.delete_request("t1", "ann", &pending.request_id).await.unwrap());
        assert!(!store.delete_request("t1", "ann", &pending.request_id).await.unwrap());
        assert!(store
            .get_request("t1", "ann", &pending.request_id)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn test_tasks_datapoints_and_records() {
    let temp = TempDir::new().unwrap();

    for store in backends(&temp) {
        let task = Task::new("Companies", "company")
            .with_id("t1")
            .with_labels(["HEALTH"])
            .with_annotators(["ann"])
            .with_data_files(["d.jsonl"]);
        store.put_task(&task).await.unwrap();
        assert_eq!(store.get_task("t1").await.unwrap(), Some(task.clone()));
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);

        let first = Datapoint::new("a", AnnotationContext::with_text("one"));
        let second = Datapoint::new("b", AnnotationContext::with_text("two"));
        store.put_datapoints("t1", &[first, second]).await.unwrap();
        store
            .put_datapoints("t1", &[Datapoint::new("a", AnnotationContext::with_text("uno"))])
            .await
            .unwrap();

        let datapoints = store.list_datapoints("t1").await.unwrap();
        let entities: Vec<_> = datapoints.iter().map(|d| d.entity.as_str()).collect();
        assert_eq!(entities, vec!["a", "b"], "backend {}", store.name());
        assert_eq!(datapoints[0].context.text.as_deref(), Some("uno"));

        let req = request("ben", "a", "HEALTH", 0.0);
        let record = AnnotationRecord::from_request(&req, AnnotationValue::Positive, Some(2.0), None);
        store.put_annotation_record(&record).await.unwrap();

        let records = store.list_annotation_records("t1", "ben").await.unwrap();
        assert_eq!(records, vec![record]);

        let annotators = store.list_annotators_for_task("t1").await.unwrap();
        assert!(annotators.contains("ben"), "backend {}", store.name());
    }
}

#[tokio::test]
async fn test_file_backends_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let req = request("ann", "a", "L", 0.0);

    {
        let jsonl = JsonlStore::new(temp.path().join("tasks"));
        let sqlite = SqliteStore::open(temp.path().join("annokit.db")).unwrap();
        jsonl.put_request(&req).await.unwrap();
        sqlite.put_request(&req).await.unwrap();
    }

    let reopened: Vec<Arc<dyn AnnotationStore>> = vec![
        Arc::new(JsonlStore::new(temp.path().join("tasks"))),
        Arc::new(SqliteStore::open(temp.path().join("annokit.db")).unwrap()),
    ];
    for store in reopened {
        let found = store.get_request("t1", "ann", &req.request_id).await.unwrap();
        assert_eq!(found, Some(req.clone()), "backend {}", store.name());
    }
}

#[tokio::test]
async fn test_task_requests_span_annotators() {
    let temp = TempDir::new().unwrap();

    for store in backends(&temp) {
        store
            .put_requests(&[
                request("ben", "b", "L", 1.0),
                request("ann", "c", "L", 3.0),
                request("ben", "a", "L", -1.0),
                request("ann", "d", "L", 0.0),
            ])
            .await
            .unwrap();

        let all: Vec<(String, String)> = store
            .list_task_requests("t1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.annotator_id, r.entity))
            .collect();
        let expected = [("ann", "d"), ("ann", "c"), ("ben", "a"), ("ben", "b")]
            .map(|(a, e)| (a.to_string(), e.to_string()));
        assert_eq!(all, expected, "backend {}", store.name());
    }
}
