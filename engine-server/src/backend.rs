//! Stand-in `BrowserBackend` / `WorkerDriver` implementation
//!
//! The portal-automation stack itself (selectors, scrolling, login forms) is
//! explicitly out of scope: it is the implementation detail `engine-core`
//! was built to keep opaque. This module supplies the minimal concrete
//! implementation the binary needs in order to be runnable — a session that
//! "logs in" by construction and a driver that reports zero progress every
//! batch. Swapping in a real portal driver means writing a new
//! `BrowserBackend` + `WorkerDriver` pair and wiring them in `main.rs`
//! instead of these two types.

use std::sync::Arc;

use async_trait::async_trait;
use engine_core::driver::{BatchContext, BatchResult, WorkerDriver};
use engine_core::scheduler::WorkerDriverFactory;
use engine_core::session_pool::{BrowserBackend, SessionPage};
use engine_shared::account::Account;
use engine_shared::error::Result;

#[derive(Debug)]
pub struct PlaceholderPage {
    pub login_email: String,
}

impl SessionPage for PlaceholderPage {}

/// Always succeeds at login/reauth/health-check/navigate-home; never
/// actually opens a browser.
#[derive(Default)]
pub struct PlaceholderBackend;

#[async_trait]
impl BrowserBackend for PlaceholderBackend {
    type Page = PlaceholderPage;

    async fn login(&self, account: &Account) -> Result<Self::Page> {
        tracing::debug!(account = %account.name, "placeholder backend: login");
        Ok(PlaceholderPage { login_email: account.login_email.clone() })
    }

    async fn reauthenticate(&self, _page: &Self::Page, _account: &Account) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self, _page: &Self::Page) -> bool {
        true
    }

    async fn navigate_home(&self, _page: &Self::Page) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _page: Self::Page) {}
}

/// A driver that does no scraping and reports no progress. Every batch
/// finishes immediately with `success = true, new_creators = 0`, so a task
/// run against this driver reaches `completed` only via the
/// min-batch-new-threshold exhaustion guard on its very first batch.
pub struct PlaceholderDriver;

#[async_trait]
impl WorkerDriver for PlaceholderDriver {
    async fn run(&self, ctx: BatchContext) -> BatchResult {
        tracing::warn!(
            task_id = %ctx.task_id,
            "placeholder driver invoked: no portal-automation stack is wired in, batch is a no-op"
        );
        BatchResult {
            success: true,
            new_creators: 0,
            total_scanned: 0,
            output_files: Vec::new(),
            log_path: None,
            latest_subject: None,
            cancelled: false,
            restart_requested: false,
            restart_reason: None,
            message: "placeholder driver: no automation stack configured".to_string(),
        }
    }
}

pub struct PlaceholderDriverFactory;

impl WorkerDriverFactory for PlaceholderDriverFactory {
    fn new_driver(&self) -> Arc<dyn WorkerDriver> {
        Arc::new(PlaceholderDriver)
    }
}
