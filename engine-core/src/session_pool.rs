//! Session Pool (§4.5)
//!
//! A fixed-capacity set of warm, logged-in browser sessions with
//! idle-reuse, account-affinity matching, rebuild-on-mismatch and a health
//! probe distinguishing transient from terminal driver failures. The
//! browser stack itself is opaque behind `BrowserBackend`; this module only
//! owns slot bookkeeping, capacity bounds, and the pending-account
//! registry that keeps concurrent prewarms from claiming the same
//! credential.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_shared::account::{Account, AccountSnapshot};
use engine_shared::error::{EngineError, Result};
use tokio::sync::Mutex;

use crate::account_pool::AccountPool;

/// Marker trait for a driver-opaque page/session handle. `BrowserBackend`
/// implementations supply the concrete type; the rest of the engine only
/// ever sees it behind `Arc<dyn SessionPage>`.
pub trait SessionPage: Send + Sync + std::fmt::Debug {}

/// The browser-automation stack backing the pool. Fully opaque: logging in,
/// re-authenticating, probing health and navigating home are all
/// implementation details of whatever automation framework is in use.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    type Page: SessionPage + 'static;

    async fn login(&self, account: &Account) -> Result<Self::Page>;
    async fn reauthenticate(&self, page: &Self::Page, account: &Account) -> Result<()>;
    /// Trivial synchronous probe (e.g. evaluate `1`) to distinguish a live
    /// session from one whose driver connection died underneath it.
    async fn health_check(&self, page: &Self::Page) -> bool;
    async fn navigate_home(&self, page: &Self::Page) -> Result<()>;
    async fn close(&self, page: Self::Page);
}

struct Slot<P> {
    session_id: String,
    account: Account,
    page: Arc<P>,
    in_use: bool,
}

/// A borrowed session, returned by `Acquire` and given back via `Release`.
pub struct SessionHandle {
    pub session_id: String,
    pub account: AccountSnapshot,
    pub page: Arc<dyn SessionPage>,
}

struct PoolState<P> {
    slots: Vec<Slot<P>>,
    next_session_id: u64,
    /// region -> account names reserved for an in-flight prewarm/spawn.
    pending_accounts: HashMap<String, HashSet<String>>,
}

pub struct SessionPool<B: BrowserBackend> {
    backend: Arc<B>,
    account_pool: Arc<AccountPool>,
    pool_min: usize,
    pool_max: usize,
    state: Mutex<PoolState<B::Page>>,
}

impl<B: BrowserBackend + 'static> SessionPool<B> {
    pub fn new(backend: Arc<B>, account_pool: Arc<AccountPool>, pool_min: usize, configured_max: usize) -> Arc<Self> {
        let pool_max = configured_max.max(pool_min).max(account_pool.enabled_count());
        Arc::new(Self {
            backend,
            account_pool,
            pool_min,
            pool_max,
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                next_session_id: 0,
                pending_accounts: HashMap::new(),
            }),
        })
    }

    pub fn pool_max(&self) -> usize {
        self.pool_max
    }

    /// Spawns `pool_min` warm sessions as a background task, each bound to
    /// a reserved account (§4.5 "Prewarm is a background task").
    pub fn spawn_prewarm(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..pool.pool_min {
                if let Err(err) = pool.prewarm_one().await {
                    tracing::warn!("prewarm session failed: {err}");
                }
            }
        });
    }

    async fn prewarm_one(self: &Arc<Self>) -> Result<()> {
        let account = self.reserve_account_for_spawn(None).await?;
        let result = self.spawn_and_append(account.clone()).await;
        self.release_pending_reservation(&account);
        result.map(|_| ())
    }

    async fn reserve_account_for_spawn(&self, region: Option<&str>) -> Result<Account> {
        let candidates = self.account_pool.list_enabled();
        let mut state = self.state.lock().await;

        let mut pick = |region_filter: Option<&str>| -> Option<Account> {
            candidates
                .iter()
                .find(|a| {
                    region_filter.is_none_or(|r| a.region_upper() == r.to_ascii_uppercase())
                        && !state
                            .pending_accounts
                            .get(&a.region_upper())
                            .is_some_and(|s| s.contains(&a.name))
                })
                .cloned()
        };

        let chosen = pick(region).or_else(|| pick(None));
        match chosen {
            Some(account) => {
                state
                    .pending_accounts
                    .entry(account.region_upper())
                    .or_default()
                    .insert(account.name.clone());
                Ok(account)
            }
            None => Err(EngineError::ResourceUnavailable("no account available to spawn a session".into())),
        }
    }

    fn release_pending_reservation(&self, account: &Account) {
        let state = self.state.try_lock();
        if let Ok(mut state) = state {
            if let Some(set) = state.pending_accounts.get_mut(&account.region_upper()) {
                set.remove(&account.name);
            }
        }
    }

    async fn spawn_and_append(&self, account: Account) -> Result<SessionHandle> {
        let page = self.backend.login(&account).await?;
        let page = Arc::new(page);
        let mut state = self.state.lock().await;
        let session_id = format!("sess-{}", state.next_session_id);
        state.next_session_id += 1;
        state.slots.push(Slot {
            session_id: session_id.clone(),
            account: account.clone(),
            page: Arc::clone(&page),
            in_use: true,
        });
        Ok(SessionHandle {
            session_id,
            account: AccountSnapshot::from(&account),
            page: page as Arc<dyn SessionPage>,
        })
    }

    /// Acquire a session bound (or rebindable) to the desired credential,
    /// following the five-step resolution order from §4.5.
    pub async fn acquire(&self, desired_region: Option<&str>, desired_account_name: Option<&str>) -> Result<SessionHandle> {
        loop {
            let resolved = self.account_pool.resolve_without_taking(desired_region, desired_account_name);

            {
                let mut state = self.state.lock().await;

                // Step 2: idle slot already bound to the desired login.
                if let Some(account) = &resolved {
                    if let Some(idx) = state
                        .slots
                        .iter()
                        .position(|s| !s.in_use && s.account.login_email == account.login_email)
                    {
                        let page = Arc::clone(&state.slots[idx].page);
                        if self.backend.health_check(&page).await {
                            let slot = &mut state.slots[idx];
                            slot.in_use = true;
                            return Ok(SessionHandle {
                                session_id: slot.session_id.clone(),
                                account: AccountSnapshot::from(&slot.account),
                                page: Arc::clone(&slot.page) as Arc<dyn SessionPage>,
                            });
                        }
                        let dead = state.slots.remove(idx);
                        self.close_slot_page(dead.page).await;
                    }
                }

                // Step 3: re-initialize any idle slot onto the desired credential.
                if let Some(account) = &resolved {
                    if let Some(idx) = state.slots.iter().position(|s| !s.in_use) {
                        let reauth_ok = self.backend.reauthenticate(&state.slots[idx].page, account).await.is_ok();
                        if reauth_ok {
                            state.slots[idx].account = account.clone();
                            state.slots[idx].in_use = true;
                            let slot = &state.slots[idx];
                            return Ok(SessionHandle {
                                session_id: slot.session_id.clone(),
                                account: AccountSnapshot::from(&slot.account),
                                page: Arc::clone(&slot.page) as Arc<dyn SessionPage>,
                            });
                        }
                        let dead = state.slots.remove(idx);
                        self.close_slot_page(dead.page).await;
                    }
                }

                // Step 4: spawn fresh if under capacity.
                if state.slots.len() < self.pool_max {
                    drop(state);
                    let account = self
                        .reserve_account_for_spawn(desired_region.or(resolved.as_ref().map(|a| a.region.as_str())))
                        .await?;
                    let result = self.spawn_and_append(account.clone()).await;
                    self.release_pending_reservation(&account);
                    return result;
                }
            }

            // Step 5: at capacity with nothing idle; wait and retry.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Navigates the session home with a soft 5 s budget, then marks it
    /// idle regardless of whether the navigation finished (§4.5 Release).
    pub async fn release(&self, handle: SessionHandle) {
        let mut state = self.state.lock().await;
        let Some(idx) = state.slots.iter().position(|s| s.session_id == handle.session_id) else {
            return;
        };
        let page = Arc::clone(&state.slots[idx].page);
        drop(state);

        let navigated = tokio::time::timeout(Duration::from_secs(5), self.backend.navigate_home(&page)).await;
        let alive = matches!(navigated, Ok(Ok(()))) || navigated.is_err();

        let mut state = self.state.lock().await;
        if let Some(idx) = state.slots.iter().position(|s| s.session_id == handle.session_id) {
            if alive {
                state.slots[idx].in_use = false;
            } else {
                state.slots.remove(idx);
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let slots = std::mem::take(&mut state.slots);
        drop(state);
        for slot in slots {
            self.close_slot_page(slot.page).await;
        }
    }

    /// Closes a slot's page if this was the last reference to it. A caller
    /// still holding a `SessionHandle` into a slot we're discarding (a
    /// narrow race with `Release`) simply leaks the backend resource to its
    /// own eventual drop rather than double-closing it.
    async fn close_slot_page(&self, page: Arc<B::Page>) {
        if let Ok(page) = Arc::try_unwrap(page) {
            self.backend.close(page).await;
        }
    }

    pub async fn live_session_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_account, MockBackend};

    #[tokio::test]
    async fn acquire_spawns_up_to_pool_max_then_waits() {
        let accounts = AccountPool::new(vec![sample_account(0, "MX"), sample_account(1, "MX")]);
        let pool = SessionPool::new(Arc::new(MockBackend::new()), Arc::new(accounts), 0, 1);

        let a = pool.acquire(Some("MX"), None).await.unwrap();
        assert_eq!(pool.live_session_count().await, 1);

        // pool_max is 1, so a second acquire should wait rather than spawn a
        // second slot until the first is released.
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire(Some("MX"), None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(a).await;
        let b = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("acquire should unblock once released")
            .expect("task should not panic")
            .expect("acquire should succeed");
        assert_eq!(pool.live_session_count().await, 1);
        pool.release(b).await;
    }

    #[tokio::test]
    async fn acquire_reuses_idle_slot_bound_to_the_same_login() {
        let accounts = AccountPool::new(vec![sample_account(0, "MX")]);
        let pool = SessionPool::new(Arc::new(MockBackend::new()), Arc::new(accounts), 0, 2);

        let a = pool.acquire(Some("MX"), Some("acct-0")).await.unwrap();
        let session_id = a.session_id.clone();
        pool.release(a).await;

        let b = pool.acquire(Some("MX"), Some("acct-0")).await.unwrap();
        assert_eq!(b.session_id, session_id);
        assert_eq!(pool.live_session_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_clears_every_slot() {
        let accounts = AccountPool::new(vec![sample_account(0, "MX")]);
        let pool = SessionPool::new(Arc::new(MockBackend::new()), Arc::new(accounts), 0, 2);
        let handle = pool.acquire(Some("MX"), None).await.unwrap();
        pool.release(handle).await;
        assert_eq!(pool.live_session_count().await, 1);
        pool.shutdown().await;
        assert_eq!(pool.live_session_count().await, 0);
    }
}
