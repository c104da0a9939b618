//! Configuration structures shared by the engine core and its HTTP/MQ
//! surfaces, loaded from TOML the way the rest of this codebase's
//! configuration is loaded.

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// Engine-wide tuning knobs (§2, §4.3, §4.5, §5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Filesystem root under which per-task `task_dir`s are created.
    pub task_root: String,
    /// Caller wall-clock zone used to interpret naive `run_at_time` /
    /// `run_end_time` strings (default: `Asia/Shanghai`).
    #[serde(default = "default_caller_timezone")]
    pub caller_timezone: String,
    /// Warm-start floor for the Session Pool (§4.5).
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,
    /// Hard ceiling for the Session Pool; the effective cap is
    /// `max(configured, pool_min, count(enabled_accounts))` (§4.5).
    #[serde(default)]
    pub pool_max: usize,
    /// Fallback run timeout enforced in the finalize block if `run_end_time`
    /// was never set (§5).
    #[serde(default = "default_task_timeout_minutes")]
    pub task_timeout_minutes: u64,
    /// Bounded worker pool size hosting scheduler routines; effective value
    /// is `max(configured, count(accounts))` (§5).
    #[serde(default)]
    pub max_workers: usize,
    /// Maximum batches per run (§4.4); default 10.
    #[serde(default = "default_max_batches")]
    pub max_batches: u32,
    /// Per-batch creator cap independent of `max_creators` (§4.4); default
    /// 40, a documented-but-unexplained tunable (§9 Open Questions).
    #[serde(default = "default_per_batch_limit_cap")]
    pub per_batch_limit_cap: u32,
    /// Minimum new creators per batch before the loop declares the search
    /// exhausted and stops early (§4.4); default 5.
    #[serde(default = "default_min_batch_new_threshold")]
    pub min_batch_new_threshold: u32,
    /// Floor of the deadline watcher's exponential-ease poll, in seconds
    /// (§4.3 step 4).
    #[serde(default = "default_deadline_watch_floor_secs")]
    pub deadline_watch_floor_secs: u64,
    /// Ceiling of the deadline watcher's exponential-ease poll, in seconds
    /// (§4.3 step 4).
    #[serde(default = "default_deadline_watch_ceiling_secs")]
    pub deadline_watch_ceiling_secs: u64,
    /// MPSC channel buffer size used for task results and ready
    /// notifications.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Session Pool acquire-retry delay when the pool is at capacity and no
    /// idle slot is usable (§4.5 step 5); default 1000ms.
    #[serde(default = "default_acquire_retry_delay_ms")]
    pub acquire_retry_delay_ms: u64,
    /// Soft timeout for a session's release-to-home navigation (§4.5
    /// Release); default 5000ms.
    #[serde(default = "default_release_home_timeout_ms")]
    pub release_home_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_root: "./task_data".to_string(),
            caller_timezone: default_caller_timezone(),
            pool_min: default_pool_min(),
            pool_max: 0,
            task_timeout_minutes: default_task_timeout_minutes(),
            max_workers: 0,
            max_batches: default_max_batches(),
            per_batch_limit_cap: default_per_batch_limit_cap(),
            min_batch_new_threshold: default_min_batch_new_threshold(),
            deadline_watch_floor_secs: default_deadline_watch_floor_secs(),
            deadline_watch_ceiling_secs: default_deadline_watch_ceiling_secs(),
            channel_buffer_size: default_channel_buffer_size(),
            acquire_retry_delay_ms: default_acquire_retry_delay_ms(),
            release_home_timeout_ms: default_release_home_timeout_ms(),
        }
    }
}

/// The account registry loaded from `accounts.toml` (§3.1 Account, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AccountsConfig {
    pub accounts: Vec<crate::account::Account>,
}

/// HTTP facade configuration (ambient; the wire shapes themselves are out
/// of scope, see SPEC_FULL §1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Pre-shared key checked in constant time against the `X-Api-Key`
    /// header.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,
    #[serde(default = "default_list_page_size")]
    pub default_page_size: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> usize {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_key: String::new(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            default_page_size: default_list_page_size(),
        }
    }
}

/// MQ consumer adapter configuration (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqConfig {
    pub amqp_url: String,
    #[serde(default = "default_completed_queue")]
    pub completed_queue: String,
    #[serde(default = "default_other_queue")]
    pub other_queue: String,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
}

fn default_completed_queue() -> String {
    "outreach.completed".to_string()
}

fn default_other_queue() -> String {
    "outreach.other".to_string()
}

fn default_dead_letter_exchange() -> String {
    "outreach.dlx".to_string()
}

/// Delivery/ack mode for the MQ consumer adapter (§4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    AtLeastOnce,
    AtMostOnce,
}
