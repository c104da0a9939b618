//! Account Pool (§4.6)
//!
//! Region-first-then-share allocation, grounded directly on the exclusive
//! pass / shared pass two-pass loop the original account pool manager uses:
//! try an enabled, region-matched, idle account first, then fall back to an
//! enabled, region-matched account already shared by other tasks, and only
//! then (for the region-less `Acquire`) ignore region entirely.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use engine_shared::account::{Account, AccountStatus};

pub struct AccountPool {
    accounts: Vec<Account>,
    /// account index -> set of task ids currently holding it.
    holders: RwLock<HashMap<usize, HashSet<String>>>,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let holders = accounts.iter().map(|a| (a.id, HashSet::new())).collect();
        Self { accounts, holders: RwLock::new(holders) }
    }

    pub fn enabled_count(&self) -> usize {
        self.accounts.iter().filter(|a| a.enabled).count()
    }

    /// Read-only snapshot of every enabled account, used by the Session
    /// Pool to pick credentials for a prewarm spawn. Never mutates holders.
    pub fn list_enabled(&self) -> Vec<Account> {
        self.accounts.iter().filter(|a| a.enabled).cloned().collect()
    }

    /// Resolves an account's full record by name or region without taking
    /// it, so the Session Pool can fetch login credentials for an account
    /// the scheduler already acquired (§4.5 step 1).
    pub fn resolve_without_taking(&self, region: Option<&str>, name: Option<&str>) -> Option<Account> {
        self.accounts
            .iter()
            .find(|a| {
                a.enabled
                    && name.is_none_or(|n| a.name == n)
                    && region.is_none_or(|r| a.region_upper() == r.to_ascii_uppercase())
            })
            .cloned()
    }

    /// Region-matched allocation: exclusive pass, then shared pass.
    pub fn acquire_by_region(&self, task_id: &str, region: &str) -> Option<Account> {
        let region_upper = region.to_ascii_uppercase();
        let mut holders = self.holders.write().unwrap();

        for account in &self.accounts {
            if account.enabled
                && account.region_upper() == region_upper
                && holders.get(&account.id).is_none_or(|h| h.is_empty())
            {
                holders.entry(account.id).or_default().insert(task_id.to_string());
                return Some(account.clone());
            }
        }

        for account in &self.accounts {
            if account.enabled && account.region_upper() == region_upper {
                holders.entry(account.id).or_default().insert(task_id.to_string());
                return Some(account.clone());
            }
        }

        None
    }

    /// Region-agnostic allocation: exclusive pass, then share the first
    /// enabled account.
    pub fn acquire(&self, task_id: &str) -> Option<Account> {
        let mut holders = self.holders.write().unwrap();

        for account in &self.accounts {
            if account.enabled && holders.get(&account.id).is_none_or(|h| h.is_empty()) {
                holders.entry(account.id).or_default().insert(task_id.to_string());
                return Some(account.clone());
            }
        }

        for account in &self.accounts {
            if account.enabled {
                holders.entry(account.id).or_default().insert(task_id.to_string());
                return Some(account.clone());
            }
        }

        None
    }

    /// Releases `task_id`'s hold on `account_id`. A task releasing an
    /// account it never held is a no-op (defensive against double-release
    /// on the finalize/force-cancel race).
    pub fn release(&self, account_id: usize, task_id: &str) {
        if let Some(tasks) = self.holders.write().unwrap().get_mut(&account_id) {
            tasks.remove(task_id);
        }
    }

    pub fn status(&self) -> Vec<AccountStatus> {
        let holders = self.holders.read().unwrap();
        self.accounts
            .iter()
            .map(|a| AccountStatus {
                id: a.id,
                name: a.name.clone(),
                region: a.region.clone(),
                enabled: a.enabled,
                current_holders: holders.get(&a.id).map(|h| {
                    let mut v: Vec<String> = h.iter().cloned().collect();
                    v.sort();
                    v
                }).unwrap_or_default(),
            })
            .collect()
    }
}
