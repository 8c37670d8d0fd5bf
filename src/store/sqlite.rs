//! Embedded SQLite store.
//!
//! Rows keep the full JSON body next to the columns that are queried
//! (`status`, `ord`). Calls run on the blocking pool behind a single
//! connection mutex.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{AnnotationStore, StoreError};
use crate::domain::{AnnotationRecord, AnnotationRequest, Datapoint, RequestStatus, Task};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id   TEXT PRIMARY KEY,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datapoints (
    task_id TEXT NOT NULL,
    entity  TEXT NOT NULL,
    seq     INTEGER NOT NULL,
    body    TEXT NOT NULL,
    PRIMARY KEY (task_id, entity)
);

CREATE TABLE IF NOT EXISTS requests (
    task_id      TEXT NOT NULL,
    annotator_id TEXT NOT NULL,
    request_id   TEXT NOT NULL,
    status       TEXT NOT NULL,
    ord          REAL NOT NULL,
    created_at   TEXT NOT NULL,
    body         TEXT NOT NULL,
    PRIMARY KEY (task_id, annotator_id, request_id)
);

CREATE INDEX IF NOT EXISTS idx_requests_priority
    ON requests (task_id, annotator_id, ord);

CREATE TABLE IF NOT EXISTS records (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      TEXT NOT NULL,
    annotator_id TEXT NOT NULL,
    body         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_annotator
    ON records (task_id, annotator_id);
"#;

/// SQLite-backed annotation store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

fn decode<T: serde::de::DeserializeOwned>(table: &str, body: &str) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        location: table.to_string(),
        message: e.to_string(),
    })
}

fn upsert_request(conn: &Connection, request: &AnnotationRequest) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO requests (task_id, annotator_id, request_id, status, ord, created_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (task_id, annotator_id, request_id) DO UPDATE SET
             status = excluded.status,
             ord = excluded.ord,
             body = excluded.body",
        params![
            request.task_id,
            request.annotator_id,
            request.request_id,
            request.status.as_str(),
            request.order,
            request.created_at.to_rfc3339(),
            serde_json::to_string(request)?,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl AnnotationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row("SELECT body FROM tasks WHERE id = ?1", params![task_id], |row| {
                    row.get(0)
                })
                .optional()?;
            body.map(|b| decode("tasks", &b)).transpose()
        })
        .await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let id = task.id.clone();
        let body = serde_json::to_string(task)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, body) VALUES (?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET body = excluded.body",
                params![id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM tasks ORDER BY id")?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode("tasks", b)).collect()
        })
        .await
    }

    async fn put_datapoints(&self, task_id: &str, datapoints: &[Datapoint]) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        let rows = datapoints
            .iter()
            .map(|dp| Ok((dp.entity.clone(), serde_json::to_string(dp)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut next_seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM datapoints WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )?;
                let mut stmt = tx.prepare(
                    "INSERT INTO datapoints (task_id, entity, seq, body) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (task_id, entity) DO UPDATE SET body = excluded.body",
                )?;
                for (entity, body) in &rows {
                    stmt.execute(params![task_id, entity, next_seq, body])?;
                    next_seq += 1;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_datapoints(&self, task_id: &str) -> Result<Vec<Datapoint>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM datapoints WHERE task_id = ?1 ORDER BY seq")?;
            let bodies = stmt
                .query_map(params![task_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode("datapoints", b)).collect()
        })
        .await
    }

    async fn list_requests(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRequest>, StoreError> {
        let task_id = task_id.to_string();
        let annotator_id = annotator_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM requests
                 WHERE task_id = ?1 AND annotator_id = ?2
                 ORDER BY ord, created_at, request_id",
            )?;
            let bodies = stmt
                .query_map(params![task_id, annotator_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode("requests", b)).collect()
        })
        .await
    }

    async fn get_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<Option<AnnotationRequest>, StoreError> {
        let keys = (task_id.to_string(), annotator_id.to_string(), request_id.to_string());
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM requests
                     WHERE task_id = ?1 AND annotator_id = ?2 AND request_id = ?3",
                    params![keys.0, keys.1, keys.2],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| decode("requests", &b)).transpose()
        })
        .await
    }

    async fn put_request(&self, request: &AnnotationRequest) -> Result<(), StoreError> {
        let request = request.clone();
        self.with_conn(move |conn| upsert_request(conn, &request)).await
    }

    async fn put_requests(&self, requests: &[AnnotationRequest]) -> Result<(), StoreError> {
        let requests = requests.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for request in &requests {
                upsert_request(&tx, request)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_stale(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let keys = (task_id.to_string(), annotator_id.to_string(), request_id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM requests
                     WHERE task_id = ?1 AND annotator_id = ?2 AND request_id = ?3
                       AND status = 'pending'",
                    params![keys.0, keys.1, keys.2],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(body) = body else {
                return Ok(false);
            };

            let mut request: AnnotationRequest = decode("requests", &body)?;
            request.status = RequestStatus::Stale;
            upsert_request(&tx, &request)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_request(
        &self,
        task_id: &str,
        annotator_id: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let keys = (task_id.to_string(), annotator_id.to_string(), request_id.to_string());
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM requests
                 WHERE task_id = ?1 AND annotator_id = ?2 AND request_id = ?3",
                params![keys.0, keys.1, keys.2],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn put_annotation_record(&self, record: &AnnotationRecord) -> Result<(), StoreError> {
        let task_id = record.task_id.clone();
        let annotator_id = record.annotator_id.clone();
        let body = serde_json::to_string(record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO records (task_id, annotator_id, body) VALUES (?1, ?2, ?3)",
                params![task_id, annotator_id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_annotation_records(
        &self,
        task_id: &str,
        annotator_id: &str,
    ) -> Result<Vec<AnnotationRecord>, StoreError> {
        let task_id = task_id.to_string();
        let annotator_id = annotator_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM records WHERE task_id = ?1 AND annotator_id = ?2 ORDER BY seq",
            )?;
            let bodies = stmt
                .query_map(params![task_id, annotator_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode("records", b)).collect()
        })
        .await
    }

    async fn list_annotators_for_task(&self, task_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT annotator_id FROM requests WHERE task_id = ?1
                 UNION
                 SELECT annotator_id FROM records WHERE task_id = ?1",
            )?;
            let annotators = stmt
                .query_map(params![task_id], |row| row.get::<_, String>(0))?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(annotators)
        })
        .await
    }

    async fn list_task_requests(&self, task_id: &str) -> Result<Vec<AnnotationRequest>, StoreError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body FROM requests WHERE task_id = ?1
                 ORDER BY annotator_id, ord, created_at, request_id",
            )?;
            let bodies = stmt
                .query_map(params![task_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies.iter().map(|b| decode("requests", b)).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnnotationContext, AnnotationValue};
    use tempfile::TempDir;

    fn request(annotator: &str, entity: &str, order: f64) -> AnnotationRequest {
        let dp = Datapoint::new(entity, AnnotationContext::with_text(entity));
        AnnotationRequest::new("t1", annotator, &dp, "L", "company", order)
    }

    #[tokio::test]
    async fn test_requests_ordered_by_order_column() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_requests(&[request("ann", "c", 5.0), request("ann", "a", -1.0), request("ann", "b", 0.0)])
            .await
            .unwrap();

        let listed = store.list_requests("t1", "ann").await.unwrap();
        let entities: Vec<_> = listed.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mark_stale_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pending = request("ann", "a", 0.0);
        let mut complete = request("ann", "b", 1.0);
        complete.status = RequestStatus::Complete;
        store.put_requests(&[pending.clone(), complete.clone()]).await.unwrap();

        assert!(store.mark_stale("t1", "ann", &pending.request_id).await.unwrap());
        assert!(!store.mark_stale("t1", "ann", &pending.request_id).await.unwrap());
        assert!(!store.mark_stale("t1", "ann", &complete.request_id).await.unwrap());

        let reloaded = store.get_request("t1", "ann", &pending.request_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RequestStatus::Stale);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("annokit.db");

        let req = request("ann", "a", 0.0);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_request(&req).await.unwrap();
            let record =
                AnnotationRecord::from_request(&req, AnnotationValue::Negative, None, None);
            store.put_annotation_record(&record).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let records = store.list_annotation_records("t1", "ann").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, -1);

        let annotators = store.list_annotators_for_task("t1").await.unwrap();
        assert!(annotators.contains("ann"));
    }
}
