//! Cross-cutting scheduler/manager scenarios, exercising the full stack
//! (Account Pool, Session Pool and a `MockDriver`) the way a real task
//! would run rather than unit-testing one module at a time.

mod scheduler_tests;

use chrono::{DateTime, Utc};
use engine_shared::account::Account;
use engine_shared::config::EngineConfig;
use engine_shared::task::{TaskControlFlags, TaskRecord, TaskStatus, TaskType};
use engine_shared::TaskPayload;

use crate::testing::sample_payload;

pub(crate) fn account(id: usize, region: &str) -> Account {
    crate::testing::sample_account(id, region)
}

pub(crate) fn payload(region: &str, max_creators: u32, target_new_creators: u32) -> TaskPayload {
    sample_payload(region, max_creators, target_new_creators)
}

/// Builds a bare task record, as `submit` would have, with the given
/// `status` and `run_at_time_utc` already resolved.
pub(crate) fn record(task_id: &str, status: TaskStatus, payload: TaskPayload, run_at_time_utc: Option<DateTime<Utc>>) -> TaskRecord {
    TaskRecord {
        task_id: task_id.to_string(),
        task_type: TaskType::Connect,
        status,
        payload,
        submitted_at: Utc::now(),
        run_at_time_display: run_at_time_utc.map(|t| t.to_rfc3339()),
        run_at_time_utc,
        run_end_time_display: None,
        run_end_time_utc: None,
        started_at: None,
        finished_at: None,
        task_dir: format!("/tmp/engine-core-tests/{task_id}"),
        created_by: "test-harness".to_string(),
        account_snapshot: None,
        new_creators: 0,
        total_creators: 0,
        latest_subject: None,
        output_files: Vec::new(),
        log_path: None,
        message: String::new(),
        control: TaskControlFlags::default(),
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        task_root: "/tmp/engine-core-tests".to_string(),
        max_batches: 10,
        per_batch_limit_cap: 40,
        min_batch_new_threshold: 5,
        deadline_watch_floor_secs: 1,
        deadline_watch_ceiling_secs: 2,
        ..Default::default()
    }
}
