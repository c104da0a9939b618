//! Account Pool data types (§3.1, §4.6)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A portal credential. `current_holders` is derived (size >= 0) and is not
/// part of the persisted configuration; it is tracked by the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: usize,
    pub name: String,
    pub login_email: String,
    pub login_password: String,
    /// Upper-case ISO-style region tag (case-insensitive at the edge).
    pub region: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque auxiliary fields passed through to the `WorkerDriver` as-is
    /// (e.g. mailbox credentials used for verification polling). The engine
    /// never interprets these.
    #[serde(default, flatten)]
    pub auxiliary: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn region_upper(&self) -> String {
        self.region.to_ascii_uppercase()
    }
}

/// A point-in-time snapshot of the account an account pool handed to a
/// scheduler routine, attached to the owning `TaskRecord` on acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub name: String,
    pub login_email: String,
    pub region: String,
}

impl From<&Account> for AccountSnapshot {
    fn from(account: &Account) -> Self {
        Self {
            name: account.name.clone(),
            login_email: account.login_email.clone(),
            region: account.region.clone(),
        }
    }
}

/// Admin-facing snapshot of one account's sharing state (§4.6 `Status()`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountStatus {
    pub id: usize,
    pub name: String,
    pub region: String,
    pub enabled: bool,
    pub current_holders: Vec<String>,
}

impl AccountStatus {
    pub fn is_free(enabled: bool, holders: &HashSet<String>) -> bool {
        enabled && holders.is_empty()
    }
}
