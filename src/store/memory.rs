//! In-process store backed by ordered maps.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AnnotationStore, StoreError};
use crate::domain::{
    sort_by_priority, AnnotationRecord, AnnotationRequest, Datapoint, RequestStatus, Task,
};

type AnnotatorKey = (String, String);

#[derive(Debug, Default)]
struct State {
    tasks: BTreeMap<String, Task>,
    datapoints: BTreeMap<String, Vec<Datapoint>>,
    requests: BTreeMap<AnnotatorKey, BTreeMap<String, AnnotationRequest>>,
    records: BTreeMap<AnnotatorKey, Vec<AnnotationRecord>>,
}

/// Store that keeps everything in memory; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(task_id: &str, annotator_id: &str) -> AnnotatorKey {
    (task_id.to_string(), annotator_id.to_string())
}

#[async_trait]
impl AnnotationStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().await.tasks.get(task_id).cloned())
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.state.read().await.tasks.values().cloned().collect())
    }

    async fn put_datapoints(&self, task_id: &str, datapoints: &[Datapoint]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let existing = state.datapoints.entry(task_id.to_string()).or_default();

        for dp in datapoints {
            match existing.iter_mut().find(|e| e.entity == dp.entity) {
                Some(slot) => *slot = dp.clone(),
                None => existing.push(dp.clone()),
            }
        }

        Ok(())
    }

    async fn list_datapoints(&self, task_id: &str) -> Result<Vec<Datapoint>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .datapoints
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_task_requests(&self, task_id: &str) -> Result<Vec<AnnotationRequest>, StoreError> {
        let state = self.state.read().await;
        let mut all = Vec::new();

        for ((task, _), requests) in &state.requests {
            if task != task_id {
                continue;
            }
            let mut requests: Vec<AnnotationRequest> = requests.values().cloned().collect();
            sort_by_priority(&mut requests);
            all.extend(requests);
        }

        Ok(all)
    }

    async fn list_requests(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRequest>, StoreError> {
        let state = self.state.read().await;
        let mut requests: Vec<AnnotationRequest> = state
            .requests
            .get(&key(task_id, annotator_id))
            .map(|m| m.values().cloned().collect())
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
        let state = self.state.read().await;
        Ok(state
            .requests
            .get(&key(task_id, annotator_id))
            .and_then(|m| m.get(request_id))
            .cloned())
    }

    async fn put_request(&self, request: &AnnotationRequest) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .requests
            .entry(key(&request.task_id, &request.annotator_id))
            .or_default()
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn mark_stale(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let request = state
            .requests
            .get_mut(&key(task_id, annotator_id))
            .and_then(|m| m.get_mut(request_id));

        match request {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = RequestStatus::Stale;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        Ok(state
            .requests
            .get_mut(&key(task_id, annotator_id))
            .and_then(|m| m.remove(request_id))
            .is_some())
    }

    async fn put_annotation_record(&self, record: &AnnotationRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .records
            .entry(key(&record.task_id, &record.annotator_id))
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_annotation_records(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(&key(task_id, annotator_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_annotators_for_task(&self, task_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.read().await;

        let with_requests = state
            .requests
            .iter()
            .filter(|((t, _), m)| t == task_id && !m.is_empty())
            .map(|((_, a), _)| a.clone());
        let with_records = state
            .records
            .iter()
            .filter(|((t, _), v)| t == task_id && !v.is_empty())
            .map(|((_, a), _)| a.clone());

        Ok(with_requests.chain(with_records).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnnotationContext, AnnotationValue};

    fn request(annotator: &str, entity: &str, order: f64) -> AnnotationRequest {
        let dp = Datapoint::new(entity, AnnotationContext::with_text(entity));
        AnnotationRequest::new("t1", annotator, &dp, "L", "company", order)
    }

    #[tokio::test]
    async fn test_requests_listed_in_priority_order() {
        let store = MemoryStore::new();
        store.put_request(&request("ann", "b", 2.0)).await.unwrap();
        store.put_request(&request("ann", "a", 1.0)).await.unwrap();

        let listed = store.list_requests("t1", "ann").await.unwrap();
        let entities: Vec<_> = listed.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mark_stale_only_from_pending() {
        let store = MemoryStore::new();
        let mut req = request("ann", "a", 1.0);
        req.status = RequestStatus::Complete;
        store.put_request(&req).await.unwrap();

        assert!(!store.mark_stale("t1", "ann", &req.request_id).await.unwrap());
        assert!(!store.mark_stale("t1", "ann", "missing").await.unwrap());

        let pending = request("ann", "b", 2.0);
        store.put_request(&pending).await.unwrap();
        assert!(store.mark_stale("t1", "ann", &pending.request_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_annotators_from_requests_and_records() {
        let store = MemoryStore::new();
        store.put_request(&request("ann", "a", 1.0)).await.unwrap();

        let record = AnnotationRecord::from_request(
            &request("ben", "a", 1.0),
            AnnotationValue::Positive,
            None,
            None,
        );
        store.put_annotation_record(&record).await.unwrap();

        let annotators = store.list_annotators_for_task("t1").await.unwrap();
        assert_eq!(
            annotators.into_iter().collect::<Vec<_>>(),
            vec!["ann".to_string(), "ben".to_string()]
        );
        assert!(store.list_annotators_for_task("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_datapoints_upsert_keeps_position() {
        let store = MemoryStore::new();
        let a = Datapoint::new("a", AnnotationContext::with_text("first"));
        let b = Datapoint::new("b", AnnotationContext::with_text("b"));
        store.put_datapoints("t1", &[a, b]).await.unwrap();

        let a2 = Datapoint::new("a", AnnotationContext::with_text("second"));
        store.put_datapoints("t1", &[a2]).await.unwrap();

        let listed = store.list_datapoints("t1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entity, "a");
        assert_eq!(listed[0].context.text.as_deref(), Some("second"));
    }
}
