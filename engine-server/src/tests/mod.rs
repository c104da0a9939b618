//! HTTP facade integration tests, driven through the router with
//! `tower::ServiceExt::oneshot` rather than a real bound socket.

mod api_tests;
mod main_tests;


use std::sync::Arc;
use std::time::Duration;

use engine_core::account_pool::AccountPool;
use engine_core::manager::TaskManager;
use engine_core::session_pool::SessionPool;
use engine_core::store::{DurableStore, MemoryStore};
use engine_shared::account::Account;
use engine_shared::config::EngineConfig;

use crate::api::{create_router, AppState};
use crate::backend::{PlaceholderBackend, PlaceholderDriverFactory};

fn account(id: usize, region: &str) -> Account {
    Account {
        id,
        name: format!("account-{id}"),
        login_email: format!("account-{id}@example.com"),
        login_password: "unused".to_string(),
        region: region.to_string(),
        enabled: true,
        auxiliary: serde_json::Map::new(),
    }
}

/// Builds a fully wired router over an in-memory store and a placeholder
/// backend, with auth disabled (blank `api_key`) unless the caller passes
/// one in.
pub(crate) async fn test_router(api_key: &str) -> axum::Router {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let account_pool = Arc::new(AccountPool::new(vec![account(1, "US")]));
    let session_pool = SessionPool::new(Arc::new(PlaceholderBackend), Arc::clone(&account_pool), 1, 2);
    let config = EngineConfig { task_root: "/tmp/engine-server-tests".to_string(), ..Default::default() };

    let manager = TaskManager::new(store, account_pool, session_pool, Arc::new(PlaceholderDriverFactory), config)
        .await
        .unwrap();

    let state = AppState::new(manager, api_key.to_string(), Duration::from_secs(60), 120, 20);
    create_router(state)
}
