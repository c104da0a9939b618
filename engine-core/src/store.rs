//! Durable Store (§4.1, §6.3)
//!
//! A row-oriented table keyed by `task_id`, with filter/sort/paging applied
//! in Rust over a loaded snapshot rather than pushed into SQL — the store's
//! job is durability and the startup recovery queries, not being a query
//! planner. Any equivalent durable store satisfies the contract; this
//! module ships an in-memory implementation (used in tests and for
//! non-persistent deployments) and a SQLite-backed one for production,
//! grounded on the teacher's lazy-connection `AgentDatabase`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_shared::error::{EngineError, Result};
use engine_shared::task::{Paging, SortKey, TaskFilters, TaskRecord, TaskStatus};
use rusqlite::Connection;
use tokio::sync::Mutex;

/// Durable persistence contract the Task Manager drives the scheduler loop
/// and recovery against.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert(&self, record: &TaskRecord) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;
    async fn query(&self, filters: &TaskFilters, sort: SortKey, paging: Paging) -> Result<(Vec<TaskRecord>, usize)>;
    async fn all(&self) -> Result<Vec<TaskRecord>>;

    /// Startup recovery: every record left in a non-terminal status from a
    /// prior process lifetime is marked `cancelled` with `message`. Returns
    /// the number of records touched (§4.1 restart recovery, step 1).
    async fn mark_incomplete_as_cancelled(&self, message: &str) -> Result<usize>;

    /// Startup recovery, step 2: records still `pending` after step 1 (i.e.
    /// they had not yet been reached by a scheduler routine) so the Task
    /// Manager can re-enqueue them.
    async fn list_pending(&self) -> Result<Vec<TaskRecord>>;
}

pub(crate) fn matches_filters(record: &TaskRecord, filters: &TaskFilters) -> bool {
    if let Some(sub) = &filters.brand_substring {
        if !record.payload.brand.name.to_ascii_lowercase().contains(&sub.to_ascii_lowercase()) {
            return false;
        }
    }
    if let Some(region) = &filters.region {
        if !record.payload.region.eq_ignore_ascii_case(region) {
            return false;
        }
    }
    if let Some(status) = filters.status {
        if record.status != status {
            return false;
        }
    }
    if let Some(sub) = &filters.name_substring {
        let name_matches = record
            .payload
            .task_name
            .as_deref()
            .is_some_and(|n| n.to_ascii_lowercase().contains(&sub.to_ascii_lowercase()));
        if !name_matches {
            return false;
        }
    }
    if let Some(after) = filters.run_at_time_after {
        if !record.run_at_time_utc.is_some_and(|t| t >= after) {
            return false;
        }
    }
    if let Some(before) = filters.run_end_time_before {
        if !record.run_end_time_utc.is_some_and(|t| t <= before) {
            return false;
        }
    }
    true
}

fn running_duration_seconds(record: &TaskRecord, now: DateTime<Utc>) -> i64 {
    let Some(started) = record.started_at else { return -1 };
    let end = record.finished_at.unwrap_or(now);
    (end - started).num_seconds()
}

pub(crate) fn sort_records(records: &mut [TaskRecord], sort: SortKey) {
    let now = Utc::now();
    match sort {
        SortKey::SubmittedDesc => records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at)),
        SortKey::RunAtTimeAsc => records.sort_by(|a, b| a.run_at_time_utc.cmp(&b.run_at_time_utc)),
        SortKey::RunAtTimeDesc => records.sort_by(|a, b| b.run_at_time_utc.cmp(&a.run_at_time_utc)),
        SortKey::RunEndTimeAsc => records.sort_by(|a, b| a.run_end_time_utc.cmp(&b.run_end_time_utc)),
        SortKey::RunEndTimeDesc => records.sort_by(|a, b| b.run_end_time_utc.cmp(&a.run_end_time_utc)),
        SortKey::RunningDurationAsc => {
            records.sort_by_key(|r| running_duration_seconds(r, now));
        }
        SortKey::RunningDurationDesc => {
            records.sort_by_key(|r| std::cmp::Reverse(running_duration_seconds(r, now)));
        }
    }
}

pub(crate) fn paginate(records: Vec<TaskRecord>, paging: Paging) -> (Vec<TaskRecord>, usize) {
    let total = records.len();
    let start = (paging.page - 1).saturating_mul(paging.page_size);
    let page = records.into_iter().skip(start).take(paging.page_size).collect();
    (page, total)
}

/// In-memory store. Nothing survives a process restart; used in tests and
/// for ephemeral deployments where durability is delegated elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        self.records.write().unwrap().insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.records.read().unwrap().get(task_id).cloned())
    }

    async fn query(&self, filters: &TaskFilters, sort: SortKey, paging: Paging) -> Result<(Vec<TaskRecord>, usize)> {
        let mut matched: Vec<TaskRecord> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| matches_filters(r, filters))
            .cloned()
            .collect();
        sort_records(&mut matched, sort);
        Ok(paginate(matched, paging))
    }

    async fn all(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.records.read().unwrap().values().cloned().collect())
    }

    async fn mark_incomplete_as_cancelled(&self, message: &str) -> Result<usize> {
        let mut records = self.records.write().unwrap();
        let mut touched = 0;
        for record in records.values_mut() {
            if !record.status.is_terminal() && record.status != TaskStatus::Pending {
                record.status = TaskStatus::Cancelled;
                record.message = message.to_string();
                record.finished_at = Some(Utc::now());
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn list_pending(&self) -> Result<Vec<TaskRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }
}

/// SQLite-backed store. One row per task, keyed by `task_id`, with the full
/// record serialized as a JSON blob (§6.3: "a row-oriented table ... any
/// equivalent durable store works"). The connection is opened lazily and
/// configured the way the teacher's `AgentDatabase` configures its own:
/// WAL mode plus a busy timeout so concurrent readers don't trip over the
/// scheduler's writes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path: PathBuf = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Persistence(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(&db_path)
            .map_err(|e| EngineError::Persistence(format!("open {}: {e}", db_path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EngineError::Persistence(format!("enable WAL: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| EngineError::Persistence(format!("busy timeout: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| EngineError::Persistence(format!("create tasks table: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn load_all(conn: &Connection) -> Result<Vec<TaskRecord>> {
        let mut stmt = conn
            .prepare("SELECT body FROM tasks")
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let mut records = Vec::new();
        for row in rows {
            let body = row.map_err(|e| EngineError::Persistence(e.to_string()))?;
            let record: TaskRecord = serde_json::from_str(&body)
                .map_err(|e| EngineError::Persistence(format!("corrupt task row: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let body = serde_json::to_string(record).map_err(|e| EngineError::Persistence(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, status, submitted_at, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task_id) DO UPDATE SET status = excluded.status, body = excluded.body",
            rusqlite::params![record.task_id, record.status.to_string(), record.submitted_at.to_rfc3339(), body],
        )
        .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT body FROM tasks WHERE task_id = ?1")
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let body: Option<String> = stmt
            .query_row(rusqlite::params![task_id], |row| row.get(0))
            .ok();
        match body {
            Some(body) => Ok(Some(
                serde_json::from_str(&body).map_err(|e| EngineError::Persistence(format!("corrupt task row: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn query(&self, filters: &TaskFilters, sort: SortKey, paging: Paging) -> Result<(Vec<TaskRecord>, usize)> {
        let conn = self.conn.lock().await;
        let mut matched: Vec<TaskRecord> =
            Self::load_all(&conn)?.into_iter().filter(|r| matches_filters(r, filters)).collect();
        sort_records(&mut matched, sort);
        Ok(paginate(matched, paging))
    }

    async fn all(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        Self::load_all(&conn)
    }

    async fn mark_incomplete_as_cancelled(&self, message: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut records = Self::load_all(&conn)?;
        let mut touched = 0;
        for record in records.iter_mut() {
            if !record.status.is_terminal() && record.status != TaskStatus::Pending {
                record.status = TaskStatus::Cancelled;
                record.message = message.to_string();
                record.finished_at = Some(Utc::now());
                touched += 1;
                let body = serde_json::to_string(record).map_err(|e| EngineError::Persistence(e.to_string()))?;
                conn.execute(
                    "UPDATE tasks SET status = ?1, body = ?2 WHERE task_id = ?3",
                    rusqlite::params![record.status.to_string(), body, record.task_id],
                )
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            }
        }
        Ok(touched)
    }

    async fn list_pending(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        Ok(Self::load_all(&conn)?.into_iter().filter(|r| r.status == TaskStatus::Pending).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::account::AccountSnapshot;
    use engine_shared::payload::TaskPayload;
    use engine_shared::task::{TaskControlFlags, TaskType};

    fn sample_payload() -> TaskPayload {
        serde_json::from_value(serde_json::json!({
            "region": "mx",
            "brand": {"name": "Acme"},
            "emailFirst": {"subject": "hi", "email_body": "body"},
        }))
        .unwrap()
    }

    fn sample(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            task_type: TaskType::Connect,
            status,
            payload: sample_payload(),
            submitted_at: Utc::now(),
            run_at_time_display: None,
            run_at_time_utc: None,
            run_end_time_display: None,
            run_end_time_utc: None,
            started_at: None,
            finished_at: None,
            task_dir: format!("/data/{id}"),
            created_by: "tester".to_string(),
            account_snapshot: None::<AccountSnapshot>,
            new_creators: 0,
            total_creators: 0,
            latest_subject: None,
            output_files: Vec::new(),
            log_path: None,
            message: String::new(),
            control: TaskControlFlags::default(),
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips_a_record() {
        let store = MemoryStore::new();
        let record = sample("0000000001", TaskStatus::Pending);
        store.upsert(&record).await.unwrap();
        let fetched = store.get("0000000001").await.unwrap().unwrap();
        assert_eq!(fetched.task_id, "0000000001");
    }

    #[tokio::test]
    async fn recovery_cancels_non_terminal_non_pending_records() {
        let store = MemoryStore::new();
        store.upsert(&sample("a", TaskStatus::Running)).await.unwrap();
        store.upsert(&sample("b", TaskStatus::ToBeRun)).await.unwrap();
        store.upsert(&sample("c", TaskStatus::Pending)).await.unwrap();
        store.upsert(&sample("d", TaskStatus::Completed)).await.unwrap();

        let touched = store.mark_incomplete_as_cancelled("interrupted by restart").await.unwrap();
        assert_eq!(touched, 2);

        assert_eq!(store.get("a").await.unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(store.get("b").await.unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(store.get("c").await.unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get("d").await.unwrap().unwrap().status, TaskStatus::Completed);

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "c");
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_handles_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.upsert(&sample("0000000001", TaskStatus::Running)).await.unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let fetched = store.get("0000000001").await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Running);

        let touched = store.mark_incomplete_as_cancelled("restarted").await.unwrap();
        assert_eq!(touched, 1);
    }

    #[tokio::test]
    async fn query_applies_filters_sort_and_paging() {
        let store = MemoryStore::new();
        for i in 0..5u32 {
            let mut record = sample(&format!("{i:010}"), TaskStatus::Pending);
            record.submitted_at = Utc::now() + chrono::Duration::seconds(i as i64);
            store.upsert(&record).await.unwrap();
        }
        let (page, total) = store
            .query(&TaskFilters::default(), SortKey::SubmittedDesc, Paging { page: 1, page_size: 2 })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].task_id, "0000000004");
    }
}
