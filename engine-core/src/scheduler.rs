//! Scheduler Loop (§4.3) and batching within a run (§4.4)
//!
//! One routine per task: wait for its run-at time, transition to running,
//! run a deadline watcher alongside it, acquire a credential, drive the
//! work in batches, then finalize. Everything here talks to the Account
//! Pool and Session Pool through their public operations only — no lock
//! nesting between pools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use engine_shared::config::EngineConfig;
use engine_shared::task::{TaskRecord, TaskStatus};
use tokio::sync::Mutex;

use crate::account_pool::AccountPool;
use crate::cancel::CancelToken;
use crate::driver::{BatchContext, BatchResult, DedupeSets, Progress, ProgressSink, WorkerDriver};
use crate::session_pool::{BrowserBackend, SessionPool};
use crate::store::DurableStore;

/// Produces a fresh driver instance for each batch, per the §4.7 contract
/// that a driver must be safe to instantiate multiple times for one task.
pub trait WorkerDriverFactory: Send + Sync {
    fn new_driver(&self) -> Arc<dyn WorkerDriver>;
}

/// Live, in-process task state the Task Manager and scheduler loop share.
/// `record` is the authoritative in-memory copy consulted by Get/List ahead
/// of the durable store (§4.1: "live takes precedence").
pub struct TaskHandle {
    pub record: Arc<Mutex<TaskRecord>>,
    pub cancel: CancelToken,
    pub force_terminated: Arc<AtomicBool>,
    pub started_checkpoint_passed: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new(record: TaskRecord) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
            cancel: CancelToken::new(),
            force_terminated: Arc::new(AtomicBool::new(false)),
            started_checkpoint_passed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A `ProgressSink` bound to one task's live record. `base_total` is
/// captured when the sink is built for a given batch so that progress
/// counts stay monotonically non-decreasing when projected onto the record
/// (§5 ordering guarantees, §4.4).
struct TaskProgressSink {
    record: Arc<Mutex<TaskRecord>>,
    base_total: u32,
}

#[async_trait]
impl ProgressSink for TaskProgressSink {
    async fn report(&self, progress: Progress) {
        let mut record = self.record.lock().await;
        if let Some(subject) = progress.latest_subject {
            record.latest_subject = Some(subject);
        }
        if let Some(new) = progress.new_creators {
            record.new_creators = self.base_total + new;
        }
    }
}

/// Runs one task end to end. Consumes the store/pools by `Arc` so it can be
/// spawned and outlive the call that created it.
pub struct SchedulerRoutine<B: BrowserBackend + 'static> {
    pub store: Arc<dyn DurableStore>,
    pub account_pool: Arc<AccountPool>,
    pub session_pool: Arc<SessionPool<B>>,
    pub driver_factory: Arc<dyn WorkerDriverFactory>,
    pub config: EngineConfig,
}

impl<B: BrowserBackend + 'static> SchedulerRoutine<B> {
    pub async fn run(self: Arc<Self>, handle: Arc<TaskHandle>) {
        // 1. Wait for start.
        if !self.wait_for_start(&handle).await {
            return;
        }

        // Run-at reached: surface the to-be-run state before the driver
        // actually starts (skipped if Cancel already moved us to terminal).
        if !handle.cancel.is_cancelled() {
            let mut record = handle.record.lock().await;
            if record.status == TaskStatus::Pending {
                record.status = TaskStatus::ToBeRun;
                let _ = self.store.upsert(&record).await;
            }
        }

        // 2. Pre-flight cancel.
        if handle.cancel.is_cancelled() {
            self.finalize_cancelled(&handle, "cancelled before start").await;
            return;
        }

        handle.started_checkpoint_passed.store(true, Ordering::SeqCst);

        // 3. Transition to running.
        {
            let mut record = handle.record.lock().await;
            record.status = TaskStatus::Running;
            record.started_at = Some(Utc::now());
            record.new_creators = 0;
            let _ = self.store.upsert(&record).await;
        }

        // 4. Deadline watcher.
        let watcher = self.spawn_deadline_watcher(&handle);

        // 5. Acquire account.
        let region = { handle.record.lock().await.payload.region.clone() };
        let account = self.account_pool.acquire_by_region(&task_id(&handle).await, &region);
        let Some(account) = account else {
            let mut record = handle.record.lock().await;
            record.status = TaskStatus::Failed;
            record.message = "no account available".to_string();
            record.finished_at = Some(Utc::now());
            let _ = self.store.upsert(&record).await;
            drop(record);
            if let Some(w) = watcher {
                w.abort();
            }
            return;
        };
        {
            let mut record = handle.record.lock().await;
            record.account_snapshot = Some(engine_shared::account::AccountSnapshot::from(&account));
            let _ = self.store.upsert(&record).await;
        }

        // 6. Invoke driver in batches.
        let batch_result = self.run_batches(&handle, &account).await;

        // 7. Finalize.
        self.account_pool.release(account.id, &task_id(&handle).await);
        if let Some(w) = watcher {
            let _ = tokio::time::timeout(Duration::from_millis(500), w).await;
        }
        self.finalize_result(&handle, batch_result).await;
    }

    /// Waits until `run_at_time_utc`, ticking at most every 5 s so the cancel
    /// event is observed promptly (§4.3 step 1). Returns `false` if the
    /// handle was already terminal (nothing further to do).
    async fn wait_for_start(&self, handle: &Arc<TaskHandle>) -> bool {
        let run_at = { handle.record.lock().await.run_at_time_utc };
        let Some(run_at) = run_at else { return true };

        let mut first_tick = true;
        loop {
            let remaining = run_at - Utc::now();
            if remaining <= chrono::Duration::zero() {
                return true;
            }
            if first_tick {
                let tid = task_id(handle).await;
                tracing::info!(task_id = %tid, "waiting for scheduled start");
                first_tick = false;
            } else {
                let tid = task_id(handle).await;
                tracing::debug!(task_id = %tid, seconds_left = remaining.num_seconds(), "still waiting for scheduled start");
            }
            let nap = remaining.to_std().unwrap_or(Duration::ZERO).min(Duration::from_secs(5));
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = handle.cancel.cancelled() => return true,
            }
        }
    }

    async fn finalize_cancelled(&self, handle: &Arc<TaskHandle>, message: &str) {
        let mut record = handle.record.lock().await;
        record.status = TaskStatus::Cancelled;
        record.message = message.to_string();
        record.finished_at = Some(Utc::now());
        let _ = self.store.upsert(&record).await;
    }

    /// Polls `run_end_time_utc` with exponential easing (§4.3 step 4):
    /// `sleep = clamp(remaining/5, 1, 30)s`. Sets the cancel event once on
    /// expiry and records the reason on the task's message exactly once.
    fn spawn_deadline_watcher(&self, handle: &Arc<TaskHandle>) -> Option<tokio::task::JoinHandle<()>> {
        let record_for_deadline = Arc::clone(&handle.record);
        let cancel = handle.cancel.clone();
        let floor = Duration::from_secs(self.config.deadline_watch_floor_secs);
        let ceiling = Duration::from_secs(self.config.deadline_watch_ceiling_secs);

        Some(tokio::spawn(async move {
            loop {
                let deadline = { record_for_deadline.lock().await.run_end_time_utc };
                let Some(deadline) = deadline else { return };
                let remaining = deadline - Utc::now();
                if remaining <= chrono::Duration::zero() {
                    cancel.cancel();
                    let mut record = record_for_deadline.lock().await;
                    if !record.control.wait_log_emitted {
                        record.message = "deadline exceeded".to_string();
                        record.control.wait_log_emitted = true;
                    }
                    return;
                }
                let nap = (remaining.to_std().unwrap_or(Duration::ZERO) / 5).clamp(floor, ceiling);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }))
    }

    /// The batching loop from §4.4.
    async fn run_batches(&self, handle: &Arc<TaskHandle>, account: &engine_shared::account::Account) -> BatchResult {
        let (max_batches, per_batch_cap) = {
            let record = handle.record.lock().await;
            (self.config.max_batches, record.payload.max_creators.min(self.config.per_batch_limit_cap))
        };

        let shared_sets = Arc::new(DedupeSets::default());
        let mut aggregated_new = 0u32;
        let mut aggregated_scanned = 0u32;
        let mut aggregated_success = true;
        let mut last_output_files = Vec::new();
        let mut last_log_path = None;
        let mut last_latest_subject = None;
        let mut last_message = String::new();
        let mut was_cancelled = false;
        let mut last_restart_requested = false;
        let mut last_restart_reason = None;

        for batch_index in 0..max_batches {
            if handle.cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }

            let target = { handle.record.lock().await.payload.target_new_creators };
            let remaining = target.saturating_sub(aggregated_new);
            if remaining == 0 && batch_index > 0 && aggregated_new >= self.config.min_batch_new_threshold {
                break;
            }
            let batch_target = per_batch_cap.min(remaining.max(1));

            let session = match self.session_pool.acquire(Some(account.region.as_str()), Some(account.name.as_str())).await {
                Ok(session) => session,
                Err(err) => {
                    aggregated_success = false;
                    last_message = format!("session acquisition failed: {err}");
                    break;
                }
            };

            let payload = Arc::new({ handle.record.lock().await.payload.clone() });
            let base_total = aggregated_new;
            let sink: Arc<dyn ProgressSink> = Arc::new(TaskProgressSink {
                record: Arc::clone(&handle.record),
                base_total,
            });

            let ctx = BatchContext {
                task_id: task_id(handle).await,
                task_dir: { handle.record.lock().await.task_dir.clone() },
                payload,
                batch_target,
                max_creators: { handle.record.lock().await.payload.max_creators },
                account: account.clone(),
                page: Arc::clone(&session.page),
                cancel_signal: handle.cancel.clone(),
                progress_sink: sink,
                shared_sets: Arc::clone(&shared_sets),
            };

            let driver = self.driver_factory.new_driver();
            let result = driver.run(ctx).await;
            self.session_pool.release(session).await;

            aggregated_new += result.new_creators;
            aggregated_scanned += result.total_scanned;
            aggregated_success &= result.success;
            last_output_files = result.output_files.clone();
            last_log_path = result.log_path.clone();
            last_latest_subject = result.latest_subject.clone();
            last_message = result.message.clone();
            last_restart_requested = result.restart_requested;
            last_restart_reason = result.restart_reason.clone();

            {
                let mut record = handle.record.lock().await;
                record.total_creators = aggregated_scanned;
                record.merge_output_files(result.output_files.iter().cloned());
                if let Some(log_path) = &result.log_path {
                    record.log_path = Some(log_path.clone());
                }
                let _ = self.store.upsert(&record).await;
            }

            if result.cancelled || handle.cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }

            if result.restart_requested {
                let tid = task_id(handle).await;
                tracing::info!(
                    task_id = %tid,
                    batch = batch_index,
                    reason = result.restart_reason.as_deref().unwrap_or("threshold triggered"),
                    "driver requested a restart, spinning a fresh instance for the next batch"
                );
                if aggregated_new >= target {
                    break;
                }
                if batch_index + 1 >= max_batches {
                    break;
                }
                continue;
            }

            if result.new_creators < self.config.min_batch_new_threshold {
                break;
            }

            if aggregated_new >= target && batch_index > 0 {
                break;
            }
        }

        BatchResult {
            success: aggregated_success,
            new_creators: aggregated_new,
            total_scanned: aggregated_scanned,
            output_files: last_output_files,
            log_path: last_log_path,
            latest_subject: last_latest_subject,
            cancelled: was_cancelled,
            restart_requested: last_restart_requested,
            restart_reason: last_restart_reason,
            message: last_message,
        }
    }

    async fn finalize_result(&self, handle: &Arc<TaskHandle>, result: BatchResult) {
        let mut record = handle.record.lock().await;
        record.new_creators = result.new_creators;
        record.total_creators = record.total_creators.max(result.total_scanned);
        record.merge_output_files(result.output_files);
        if let Some(log_path) = result.log_path {
            record.log_path = Some(log_path);
        }
        if let Some(subject) = result.latest_subject {
            record.latest_subject = Some(subject);
        }
        record.finished_at = Some(Utc::now());

        let force_terminated = handle.force_terminated.load(Ordering::SeqCst);
        record.status = if force_terminated {
            record.message = "force-cancelled".to_string();
            TaskStatus::Cancelled
        } else if result.cancelled {
            record.message = if record.message.is_empty() {
                "cancelled".to_string()
            } else {
                record.message.clone()
            };
            TaskStatus::Cancelled
        } else if result.success {
            record.message = result.message;
            TaskStatus::Completed
        } else {
            record.message = result.message;
            TaskStatus::Failed
        };

        let _ = self.store.upsert(&record).await;
    }
}

async fn task_id(handle: &Arc<TaskHandle>) -> String {
    handle.record.lock().await.task_id.clone()
}
