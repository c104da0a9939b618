//! Task Manager facade (§4.1)
//!
//! Owns the `task_id -> TaskRecord` map and every scheduler routine. This
//! is the crate's single public entry point: Submit/Update/Rename/RunNow/
//! Cancel/ForceCancel/Get/List/Summary, plus the two-step restart recovery
//! described in §4.1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use engine_shared::config::EngineConfig;
use engine_shared::error::{EngineError, Result};
use engine_shared::task::{Paging, SortKey, TaskFilters, TaskRecord, TaskStatus, TaskSummary};
use engine_shared::utils::{calculate_checksum, next_task_id, parse_caller_time, resolve_timezone, task_dir};
use engine_shared::{TaskPayload, TaskSnapshot};
use tokio::sync::{Mutex, Semaphore};

use crate::account_pool::AccountPool;
use crate::scheduler::{SchedulerRoutine, TaskHandle, WorkerDriverFactory};
use crate::session_pool::{BrowserBackend, SessionPool};
use crate::store::{matches_filters, paginate, sort_records, DurableStore};

pub struct TaskManager<B: BrowserBackend + 'static> {
    store: Arc<dyn DurableStore>,
    account_pool: Arc<AccountPool>,
    session_pool: Arc<SessionPool<B>>,
    driver_factory: Arc<dyn WorkerDriverFactory>,
    config: EngineConfig,
    handles: Mutex<HashMap<String, Arc<TaskHandle>>>,
    next_counter: AtomicU64,
    worker_permits: Arc<Semaphore>,
}

impl<B: BrowserBackend + 'static> TaskManager<B> {
    /// Builds the manager and runs restart recovery: every non-terminal,
    /// non-pending record from a previous process lifetime is marked
    /// `cancelled`, then still-`pending` records are re-enqueued (§4.1).
    pub async fn new(
        store: Arc<dyn DurableStore>,
        account_pool: Arc<AccountPool>,
        session_pool: Arc<SessionPool<B>>,
        driver_factory: Arc<dyn WorkerDriverFactory>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        let touched = store.mark_incomplete_as_cancelled("cancelled on startup").await?;
        if touched > 0 {
            tracing::info!(touched, "recovered from a previous run: cancelled incomplete tasks");
        }

        let max_workers = config.max_workers.max(account_pool.enabled_count()).max(1);
        let highest_task_id = store
            .all()
            .await?
            .iter()
            .filter_map(|r| r.task_id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        let manager = Arc::new(Self {
            store,
            account_pool,
            session_pool,
            driver_factory,
            config,
            handles: Mutex::new(HashMap::new()),
            next_counter: AtomicU64::new(highest_task_id + 1),
            worker_permits: Arc::new(Semaphore::new(max_workers)),
        });

        let pending = manager.store.list_pending().await?;
        for record in pending {
            manager.enqueue(record).await;
        }

        Ok(manager)
    }

    fn zone(&self) -> chrono_tz::Tz {
        resolve_timezone(&self.config.caller_timezone)
    }

    /// Allocates a `TaskHandle`, registers it, and spawns its scheduler
    /// routine behind the bounded worker-pool semaphore.
    async fn enqueue(self: &Arc<Self>, record: TaskRecord) {
        let task_id = record.task_id.clone();
        let handle = Arc::new(TaskHandle::new(record));
        self.handles.lock().await.insert(task_id, Arc::clone(&handle));

        let routine = Arc::new(SchedulerRoutine {
            store: Arc::clone(&self.store),
            account_pool: Arc::clone(&self.account_pool),
            session_pool: Arc::clone(&self.session_pool),
            driver_factory: Arc::clone(&self.driver_factory),
            config: self.config.clone(),
        });
        let permits = Arc::clone(&self.worker_permits);

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            routine.run(handle).await;
        });
    }

    /// Submit(payload, created_by) -> task_id (§4.1).
    pub async fn submit(self: &Arc<Self>, mut payload: TaskPayload, created_by: &str) -> Result<String> {
        payload.validate()?;
        payload.apply_cross_field_defaults();

        let task_id = match &payload.task_id {
            Some(id) => {
                if self.store.get(id).await?.is_some() || self.handles.lock().await.contains_key(id) {
                    return Err(EngineError::DuplicateId(id.clone()));
                }
                id.clone()
            }
            None => next_task_id(self.next_counter.fetch_add(1, Ordering::SeqCst)),
        };

        let now = Utc::now();
        let zone = self.zone();

        let (run_at_display, run_at_utc) = match &payload.run_at_time {
            Some(raw) => {
                let parsed = parse_caller_time(raw, zone)?;
                if parsed <= now {
                    (None, None)
                } else {
                    (Some(raw.clone()), Some(parsed))
                }
            }
            None => (None, None),
        };
        let (run_end_display, run_end_utc) = match &payload.run_end_time {
            Some(raw) => (Some(raw.clone()), Some(parse_caller_time(raw, zone)?)),
            None => (None, None),
        };

        let base_name = payload.task_name.clone().unwrap_or_else(|| task_id.clone());
        let dir = task_dir(
            std::path::Path::new(&self.config.task_root),
            &payload.brand.name,
            &base_name,
            &task_id,
        );

        let record = TaskRecord {
            task_id: task_id.clone(),
            task_type: Default::default(),
            status: TaskStatus::Pending,
            payload,
            submitted_at: now,
            run_at_time_display: run_at_display,
            run_at_time_utc: run_at_utc,
            run_end_time_display: run_end_display,
            run_end_time_utc: run_end_utc,
            started_at: None,
            finished_at: None,
            task_dir: dir.to_string_lossy().into_owned(),
            created_by: created_by.to_string(),
            account_snapshot: None,
            new_creators: 0,
            total_creators: 0,
            latest_subject: None,
            output_files: Vec::new(),
            log_path: None,
            message: String::new(),
            control: Default::default(),
        };

        self.store.upsert(&record).await?;
        self.enqueue(record).await;
        Ok(task_id)
    }

    async fn pending_handle(&self, task_id: &str) -> Result<Arc<TaskHandle>> {
        let handles = self.handles.lock().await;
        let handle = handles.get(task_id).ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        let record = handle.record.lock().await;
        if record.status != TaskStatus::Pending {
            return Err(EngineError::NotPending(task_id.to_string()));
        }
        Ok(Arc::clone(handle))
    }

    /// Update(task_id, patch) (§4.1): record-level merge, refused unless
    /// pending; renames `task_dir` on the filesystem if the derived path
    /// changed.
    pub async fn update(&self, task_id: &str, patch: &serde_json::Value) -> Result<()> {
        let handle = self.pending_handle(task_id).await?;
        let mut record = handle.record.lock().await;

        let merged = record.payload.merge_patch(patch)?;
        merged.validate()?;

        let zone = self.zone();
        if let Some(raw) = &merged.run_at_time {
            let parsed = parse_caller_time(raw, zone)?;
            if parsed <= Utc::now() {
                record.run_at_time_display = None;
                record.run_at_time_utc = None;
            } else {
                record.run_at_time_display = Some(raw.clone());
                record.run_at_time_utc = Some(parsed);
            }
        } else {
            record.run_at_time_display = None;
            record.run_at_time_utc = None;
        }
        if let Some(raw) = &merged.run_end_time {
            record.run_end_time_utc = Some(parse_caller_time(raw, zone)?);
            record.run_end_time_display = Some(raw.clone());
        } else {
            record.run_end_time_display = None;
            record.run_end_time_utc = None;
        }

        let base_name = merged.task_name.clone().unwrap_or_else(|| task_id.to_string());
        let new_dir = task_dir(std::path::Path::new(&self.config.task_root), &merged.brand.name, &base_name, task_id);
        let new_dir_str = new_dir.to_string_lossy().into_owned();
        if new_dir_str != record.task_dir {
            if new_dir.exists() {
                return Err(EngineError::CollidingDir(new_dir_str));
            }
            let old_dir = std::path::PathBuf::from(&record.task_dir);
            if old_dir.exists() {
                if let Some(parent) = new_dir.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| EngineError::Persistence(e.to_string()))?;
                }
                std::fs::rename(&old_dir, &new_dir).map_err(|e| EngineError::Persistence(e.to_string()))?;
            }
            record.task_dir = new_dir_str;
        }

        record.payload = merged;
        self.store.upsert(&record).await?;
        Ok(())
    }

    /// Rename(task_id, new_name) (§4.1): adjusts only `task_name`.
    pub async fn rename(&self, task_id: &str, new_name: &str) -> Result<()> {
        self.update(task_id, &serde_json::json!({ "task_name": new_name })).await
    }

    /// RunNow(task_id) (§4.1): only valid while `pending`.
    pub async fn run_now(&self, task_id: &str) -> Result<()> {
        let handle = self.pending_handle(task_id).await?;
        let mut record = handle.record.lock().await;
        let now = Utc::now();
        record.run_at_time_utc = Some(now);
        record.run_at_time_display = Some(now.to_rfc3339());
        record.status = TaskStatus::ToBeRun;
        self.store.upsert(&record).await?;
        Ok(())
    }

    /// Cancel(task_id) -> bool (§4.1).
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let handles = self.handles.lock().await;
        let Some(handle) = handles.get(task_id) else {
            return Err(EngineError::NotFound(task_id.to_string()));
        };
        let handle = Arc::clone(handle);
        drop(handles);

        let mut record = handle.record.lock().await;
        if record.status.is_terminal() {
            return Ok(false);
        }

        let started = handle.started_checkpoint_passed.load(Ordering::SeqCst);
        if !started {
            record.status = TaskStatus::Cancelled;
            record.message = "cancelled before start".to_string();
            record.finished_at = Some(Utc::now());
            handle.cancel.cancel();
            self.store.upsert(&record).await?;
            return Ok(true);
        }

        record.status = TaskStatus::ToBeCancel;
        record.control.cancel_requested = true;
        drop(record);
        handle.cancel.cancel();
        Ok(true)
    }

    /// ForceCancel(task_id) -> bool (§4.1): unconditionally promotes the
    /// final status to `cancelled`, even if the driver already reported
    /// `success=true`.
    pub async fn force_cancel(&self, task_id: &str) -> Result<bool> {
        let handles = self.handles.lock().await;
        let Some(handle) = handles.get(task_id) else {
            return Err(EngineError::NotFound(task_id.to_string()));
        };
        let handle = Arc::clone(handle);
        drop(handles);

        {
            let record = handle.record.lock().await;
            if record.status.is_terminal() {
                return Ok(false);
            }
        }
        handle.force_terminated.store(true, Ordering::SeqCst);
        handle.cancel.cancel();
        Ok(true)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let now = Utc::now();
        if let Some(handle) = self.handles.lock().await.get(task_id) {
            return Ok(Some(handle.record.lock().await.to_snapshot(now)));
        }
        Ok(self.store.get(task_id).await?.map(|r| r.to_snapshot(now)))
    }

    /// List(filters, paging, sort) (§4.1): live in-memory records take
    /// precedence over whatever the durable store still has for the same
    /// `task_id`.
    pub async fn list(&self, filters: &TaskFilters, sort: SortKey, paging: Paging) -> Result<(Vec<TaskSnapshot>, usize)> {
        let now = Utc::now();
        let mut merged: HashMap<String, TaskRecord> =
            self.store.all().await?.into_iter().map(|r| (r.task_id.clone(), r)).collect();

        let handles = self.handles.lock().await;
        for handle in handles.values() {
            let record = handle.record.lock().await;
            merged.insert(record.task_id.clone(), record.clone());
        }
        drop(handles);

        let mut records: Vec<TaskRecord> = merged.into_values().filter(|r| matches_filters(r, filters)).collect();
        sort_records(&mut records, sort);
        let (page, total) = paginate(records, paging);
        Ok((page.iter().map(|r| r.to_snapshot(now)).collect(), total))
    }

    pub async fn summary(&self) -> Result<TaskSummary> {
        let mut merged: HashMap<String, TaskStatus> =
            self.store.all().await?.into_iter().map(|r| (r.task_id, r.status)).collect();

        let handles = self.handles.lock().await;
        for handle in handles.values() {
            let record = handle.record.lock().await;
            merged.insert(record.task_id.clone(), record.status);
        }
        drop(handles);

        let mut summary = TaskSummary::default();
        for status in merged.values() {
            match status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::ToBeRun => summary.to_be_run += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::ToBeCancel => summary.to_be_cancel += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary.in_queue = summary.pending + summary.to_be_run;
        Ok(summary)
    }

    /// Snapshot of every account's current holder set, for the ambient
    /// admin/observability surface (SPEC_FULL §4 [AMBIENT]).
    pub fn account_status(&self) -> Vec<engine_shared::account::AccountStatus> {
        self.account_pool.status()
    }

    /// Live Session Pool occupancy alongside its configured ceiling, for
    /// the same observability surface.
    pub async fn session_pool_status(&self) -> (usize, usize) {
        (self.session_pool.live_session_count().await, self.session_pool.pool_max())
    }

    /// Graceful shutdown (§6.4): signals every live task's cancel event and
    /// closes every Session Pool slot.
    pub async fn shutdown(&self) {
        let handles = self.handles.lock().await;
        for handle in handles.values() {
            handle.cancel.cancel();
        }
        drop(handles);
        self.session_pool.shutdown().await;
    }

    /// Exposed for the config-affecting-change detection an HTTP facade may
    /// want before deciding whether an Update is a no-op (not otherwise used
    /// by the engine itself).
    pub async fn payload_checksum(&self, task_id: &str) -> Result<String> {
        let snapshot = self.get(task_id).await?.ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        Ok(calculate_checksum(&[&snapshot.region, &snapshot.brand_name]))
    }
}
