//! Task Record & State Machine data types (§3.1, §4.2)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountSnapshot;
use crate::payload::TaskPayload;
use crate::utils::format_run_time;

/// `task_type` discriminator (§3.1). Affects nothing in the engine besides
/// round-tripping; the `WorkerDriver` implementation is free to branch on
/// it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TaskType {
    #[default]
    Connect,
    Card,
}

/// The task lifecycle state machine (§4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    ToBeRun,
    Running,
    ToBeCancel,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal = {completed, failed, cancelled}; no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::ToBeRun => "to-be-run",
            TaskStatus::Running => "running",
            TaskStatus::ToBeCancel => "to-be-cancel",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Control flags the scheduler mutates in-process. Never persisted across a
/// restart (§3.1): recovery always re-derives them from scratch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskControlFlags {
    pub cancel_requested: bool,
    pub force_terminated: bool,
    pub wait_log_emitted: bool,
}

/// The durable unit of work (§3.1). `task_id` is immutable once assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: TaskPayload,

    pub submitted_at: DateTime<Utc>,
    /// Caller's original `run_at_time` string, preserved verbatim so the
    /// returned snapshot never loses the caller's wall-clock intent (§9).
    pub run_at_time_display: Option<String>,
    pub run_at_time_utc: Option<DateTime<Utc>>,
    pub run_end_time_display: Option<String>,
    pub run_end_time_utc: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub task_dir: String,

    pub created_by: String,
    pub account_snapshot: Option<AccountSnapshot>,

    pub new_creators: u32,
    pub total_creators: u32,
    pub latest_subject: Option<String>,
    pub output_files: Vec<String>,
    pub log_path: Option<String>,

    pub message: String,

    #[serde(skip, default)]
    pub control: TaskControlFlags,
}

impl TaskRecord {
    /// Merges a batch's `output_files` into the running set: union, sort,
    /// dedupe (§4.1 List invariant on `output_files`).
    pub fn merge_output_files(&mut self, files: impl IntoIterator<Item = String>) {
        for file in files {
            if !self.output_files.contains(&file) {
                self.output_files.push(file);
            }
        }
        self.output_files.sort();
        self.output_files.dedup();
    }

    /// The `run_time` field from §6.2: elapsed wall time as `HHhMMminSSs`,
    /// computed against `finished_at` once terminal, otherwise against now.
    pub fn run_time(&self, now: DateTime<Utc>) -> String {
        let Some(started) = self.started_at else {
            return format_run_time(0);
        };
        let end = self.finished_at.unwrap_or(now);
        format_run_time((end - started).num_seconds())
    }

    pub fn to_snapshot(&self, now: DateTime<Utc>) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            task_type: self.task_type,
            status: self.status,
            message: self.message.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            user: self.created_by.clone(),
            task_name: self.payload.task_name.clone(),
            campaign_id: self.payload.campaign_id.clone(),
            campaign_name: self.payload.campaign_name.clone(),
            region: self.payload.region.clone(),
            brand_name: self.payload.brand.name.clone(),
            account_email: self.account_snapshot.as_ref().map(|a| a.login_email.clone()),
            new_creators: self.new_creators,
            total_creators: self.total_creators,
            task_dir: self.task_dir.clone(),
            log_path: self.log_path.clone(),
            product_name: self.payload.product_name.clone(),
            product_id: self.payload.product_id.clone(),
            latest_subject: self.latest_subject.clone(),
            run_time: self.run_time(now),
            output_files: self.output_files.clone(),
            max_creators: self.payload.max_creators,
            target_new_creators: self.payload.target_new_creators,
            run_at_time: self.run_at_time_display.clone(),
            run_end_time: self.run_end_time_display.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Machine-readable status returned from Get/List (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub message: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub user: String,
    pub task_name: Option<String>,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub region: String,
    pub brand_name: String,
    pub account_email: Option<String>,
    pub new_creators: u32,
    pub total_creators: u32,
    pub task_dir: String,
    pub log_path: Option<String>,
    pub product_name: Option<String>,
    pub product_id: Option<String>,
    pub latest_subject: Option<String>,
    pub run_time: String,
    pub output_files: Vec<String>,
    pub max_creators: u32,
    pub target_new_creators: u32,
    pub run_at_time: Option<String>,
    pub run_end_time: Option<String>,
    pub payload: TaskPayload,
}

/// `List` filters (§4.1).
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub brand_substring: Option<String>,
    pub region: Option<String>,
    pub status: Option<TaskStatus>,
    pub name_substring: Option<String>,
    pub run_at_time_after: Option<DateTime<Utc>>,
    pub run_end_time_before: Option<DateTime<Utc>>,
}

/// `List` sort keys (§4.1). Direction is carried alongside the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    SubmittedDesc,
    RunAtTimeAsc,
    RunAtTimeDesc,
    RunEndTimeAsc,
    RunEndTimeDesc,
    RunningDurationAsc,
    RunningDurationDesc,
}

impl Default for SortKey {
    fn default() -> Self {
        SortKey::SubmittedDesc
    }
}

/// Paging request, clipped to `[1, 200]` by the caller of `List` (§4.1).
#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub page: usize,
    pub page_size: usize,
}

impl Paging {
    pub fn clipped(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, crate::defaults::max_list_page_size()),
        }
    }
}

/// Per-status counts plus `in_queue` (§4.1 `Summary`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSummary {
    pub pending: usize,
    pub to_be_run: usize,
    pub running: usize,
    pub to_be_cancel: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_queue: usize,
}
