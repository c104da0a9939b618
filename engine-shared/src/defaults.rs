//! Default values for configuration parameters and payload fields
//!
//! This module centralizes all default value functions used by the
//! configuration and payload structures. These functions are used by serde
//! when deserializing data that doesn't specify certain optional fields.

/// Default `max_creators` budget for a task (§6.1).
pub fn default_max_creators() -> u32 {
    500
}

/// Default `target_new_creators` budget for a task (§6.1).
pub fn default_target_new_creators() -> u32 {
    50
}

/// Default task type when omitted.
pub fn default_task_type() -> crate::task::TaskType {
    crate::task::TaskType::Connect
}

/// Default caller wall-clock zone used to interpret naive `run_at_time` /
/// `run_end_time` strings (§6.1).
pub fn default_caller_timezone() -> String {
    "Asia/Shanghai".to_string()
}

/// Default size of the `Session Pool` warm-start floor (§4.5).
pub fn default_pool_min() -> usize {
    2
}

/// Default per-task run timeout in minutes, used as a safety-net fallback
/// alongside `run_end_time` (§5).
pub fn default_task_timeout_minutes() -> u64 {
    120
}

/// Default maximum number of batches per run (§4.4).
pub fn default_max_batches() -> u32 {
    10
}

/// Default per-batch creator cap, independent of `max_creators` (§4.4).
pub fn default_per_batch_limit_cap() -> u32 {
    40
}

/// Default minimum new-creators-per-batch before the batching loop gives up
/// early as "exhausted" (§4.4).
pub fn default_min_batch_new_threshold() -> u32 {
    5
}

/// Default deadline-watcher poll floor, in seconds (§4.3 step 4).
pub fn default_deadline_watch_floor_secs() -> u64 {
    1
}

/// Default deadline-watcher poll ceiling, in seconds (§4.3 step 4).
pub fn default_deadline_watch_ceiling_secs() -> u64 {
    30
}

/// Default result/ready channel buffer size.
pub fn default_channel_buffer_size() -> usize {
    256
}

/// Default Session Pool idle-slot retry delay, in milliseconds (§4.5 step 5).
pub fn default_acquire_retry_delay_ms() -> u64 {
    1000
}

/// Default soft timeout for a session's release-to-home navigation, in
/// milliseconds (§4.5 Release).
pub fn default_release_home_timeout_ms() -> u64 {
    5000
}

/// Default page size used by `List` when the caller doesn't specify one.
pub fn default_list_page_size() -> usize {
    50
}

/// Hard ceiling on `List` page size (§4.1).
pub fn max_list_page_size() -> usize {
    200
}
