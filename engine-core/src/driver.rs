//! WorkerDriver abstract contract (§4.7)
//!
//! The browser-automation logic itself — selectors, scrolling, whatever a
//! given partner portal needs — is entirely opaque to the engine. All the
//! engine knows is this contract: it hands a driver instance a batch target
//! and the cross-batch dedupe sets, and gets back an aggregable result.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use engine_shared::account::Account;
use engine_shared::payload::TaskPayload;
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::session_pool::SessionPage;

/// Progress reported mid-batch. Fields are optional because a driver may
/// only have new information about one of them at a given moment.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub latest_subject: Option<String>,
    pub new_creators: Option<u32>,
}

/// The engine's side of `progress_sink`: re-entrant-safe, takes the task
/// lock briefly, never calls back into the driver (§4.7 contract, §9).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: Progress);
}

/// A `ProgressSink` that drops everything, for drivers under test that
/// don't care about progress plumbing.
pub struct NullProgressSink;

#[async_trait]
impl ProgressSink for NullProgressSink {
    async fn report(&self, _progress: Progress) {}
}

/// Cross-batch dedupe sets, owned by the scheduler and shared by reference
/// across every batch of one run (§4.4). Never persisted beyond the run.
#[derive(Default)]
pub struct DedupeSets {
    pub seen: Mutex<HashSet<String>>,
    pub skipped: Mutex<HashSet<String>>,
}

/// Everything the driver is given for one batch (§4.7).
pub struct BatchContext {
    pub task_id: String,
    pub task_dir: String,
    pub payload: Arc<TaskPayload>,
    pub batch_target: u32,
    pub max_creators: u32,
    pub account: Account,
    /// The live, logged-in browser session checked out for this batch. The
    /// driver drives this page directly; it never talks to the Session Pool.
    pub page: Arc<dyn SessionPage>,
    pub cancel_signal: CancelToken,
    pub progress_sink: Arc<dyn ProgressSink>,
    pub shared_sets: Arc<DedupeSets>,
}

/// The result of one batch invocation (§4.7).
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub success: bool,
    pub new_creators: u32,
    pub total_scanned: u32,
    pub output_files: Vec<String>,
    pub log_path: Option<String>,
    pub latest_subject: Option<String>,
    pub cancelled: bool,
    pub restart_requested: bool,
    pub restart_reason: Option<String>,
    pub message: String,
}

/// Opaque job logic. Implementations must be safe to instantiate fresh for
/// every batch of the same task (§4.7 contract).
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    async fn run(&self, ctx: BatchContext) -> BatchResult;
}
