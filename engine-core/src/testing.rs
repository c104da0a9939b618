//! Test doubles for the Session Pool backend and the WorkerDriver contract,
//! shared by the scheduler and manager test suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_shared::account::Account;
use engine_shared::error::Result;

use crate::driver::{BatchContext, BatchResult, WorkerDriver};
use crate::scheduler::WorkerDriverFactory;
use crate::session_pool::{BrowserBackend, SessionPage};

#[derive(Debug)]
pub struct MockPage(pub String);
impl SessionPage for MockPage {}

/// A browser backend that never actually opens a browser: login always
/// succeeds, health checks always pass unless poisoned.
#[derive(Default)]
pub struct MockBackend {
    pub healthy: std::sync::atomic::AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self { healthy: std::sync::atomic::AtomicBool::new(true) }
    }
}

#[async_trait]
impl BrowserBackend for MockBackend {
    type Page = MockPage;

    async fn login(&self, account: &Account) -> Result<Self::Page> {
        Ok(MockPage(account.login_email.clone()))
    }

    async fn reauthenticate(&self, _page: &Self::Page, _account: &Account) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self, _page: &Self::Page) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn navigate_home(&self, _page: &Self::Page) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _page: Self::Page) {}
}

/// A deterministic driver: yields a fixed number of new creators per batch
/// after a configurable delay, optionally honoring cancellation mid-sleep.
pub struct MockDriver {
    pub new_per_batch: u32,
    pub scanned_per_batch: u32,
    pub batch_delay: Duration,
    pub success: bool,
    pub restart_requested: bool,
    pub batches_run: Arc<AtomicU32>,
}

#[async_trait]
impl WorkerDriver for MockDriver {
    async fn run(&self, ctx: BatchContext) -> BatchResult {
        self.batches_run.fetch_add(1, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.batch_delay) => false,
            _ = ctx.cancel_signal.cancelled() => true,
        };

        let new_creators = if cancelled { 0 } else { self.new_per_batch.min(ctx.batch_target) };
        ctx.progress_sink
            .report(crate::driver::Progress {
                latest_subject: Some(format!("creator-{}", ctx.task_id)),
                new_creators: Some(new_creators),
            })
            .await;

        BatchResult {
            success: self.success,
            new_creators,
            total_scanned: self.scanned_per_batch,
            output_files: vec![format!("{}/batch.csv", ctx.task_dir)],
            log_path: Some(format!("{}/run.log", ctx.task_dir)),
            latest_subject: Some(format!("creator-{}", ctx.task_id)),
            cancelled,
            restart_requested: self.restart_requested,
            restart_reason: None,
            message: if self.success { "ok".to_string() } else { "mock failure".to_string() },
        }
    }
}

pub struct MockDriverFactory {
    pub new_per_batch: u32,
    pub scanned_per_batch: u32,
    pub batch_delay: Duration,
    pub success: bool,
    pub restart_requested: bool,
    pub batches_run: Arc<AtomicU32>,
}

impl MockDriverFactory {
    pub fn new(new_per_batch: u32, batch_delay: Duration) -> Self {
        Self {
            new_per_batch,
            scanned_per_batch: new_per_batch + 1,
            batch_delay,
            success: true,
            restart_requested: false,
            batches_run: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl WorkerDriverFactory for MockDriverFactory {
    fn new_driver(&self) -> Arc<dyn WorkerDriver> {
        Arc::new(MockDriver {
            new_per_batch: self.new_per_batch,
            scanned_per_batch: self.scanned_per_batch,
            batch_delay: self.batch_delay,
            success: self.success,
            restart_requested: self.restart_requested,
            batches_run: Arc::clone(&self.batches_run),
        })
    }
}

pub fn sample_account(id: usize, region: &str) -> Account {
    Account {
        id,
        name: format!("acct-{id}"),
        login_email: format!("acct{id}@example.com"),
        login_password: "secret".to_string(),
        region: region.to_string(),
        enabled: true,
        auxiliary: Default::default(),
    }
}

pub fn sample_payload(region: &str, max_creators: u32, target_new_creators: u32) -> engine_shared::TaskPayload {
    serde_json::from_value(serde_json::json!({
        "region": region,
        "brand": {"name": "Acme"},
        "emailFirst": {"subject": "hi", "email_body": "body"},
        "max_creators": max_creators,
        "target_new_creators": target_new_creators,
    }))
    .unwrap()
}
