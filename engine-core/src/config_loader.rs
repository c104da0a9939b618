//! Configuration loading (ambient; §2)
//!
//! `engine.toml` and `accounts.toml` live side by side in one directory.
//! Loading is synchronous-at-startup and fails fast on a missing file or a
//! TOML syntax error; reloading re-reads both files and only replaces the
//! in-memory copies if the combined checksum actually changed, so a
//! SIGHUP-triggered reload doesn't thrash the Session/Account Pools for a
//! no-op edit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use engine_shared::config::{AccountsConfig, EngineConfig};
use engine_shared::utils::calculate_checksum;
use tracing::{debug, info};

const ENGINE_CONFIG_FILE: &str = "engine.toml";
const ACCOUNTS_CONFIG_FILE: &str = "accounts.toml";

/// Owns the loaded `EngineConfig`/`AccountsConfig` plus enough state to
/// detect a no-op reload.
pub struct ConfigManager {
    pub config_dir: PathBuf,
    pub engine_config: Option<EngineConfig>,
    pub accounts_config: Option<AccountsConfig>,
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.is_dir() {
            anyhow::bail!("configuration directory does not exist: {}", config_dir.display());
        }
        Ok(Self { config_dir, engine_config: None, accounts_config: None, current_checksum: None })
    }

    /// Reads both files, parses, and stores them. Accounts are not otherwise
    /// validated here: an empty or all-disabled account list is a runtime
    /// concern for the Account Pool, not a config-loading error.
    pub async fn load(&mut self) -> Result<()> {
        info!(dir = %self.config_dir.display(), "loading engine configuration");

        let engine_path = self.config_dir.join(ENGINE_CONFIG_FILE);
        let engine_toml = tokio::fs::read_to_string(&engine_path)
            .await
            .with_context(|| format!("failed to read {}", engine_path.display()))?;
        let engine_config: EngineConfig = toml::from_str(&engine_toml)
            .with_context(|| format!("TOML syntax error in {}", engine_path.display()))?;

        let accounts_path = self.config_dir.join(ACCOUNTS_CONFIG_FILE);
        let accounts_toml = tokio::fs::read_to_string(&accounts_path)
            .await
            .with_context(|| format!("failed to read {}", accounts_path.display()))?;
        let accounts_config: AccountsConfig = toml::from_str(&accounts_toml)
            .with_context(|| format!("TOML syntax error in {}", accounts_path.display()))?;

        let checksum = calculate_checksum(&[&engine_toml, &accounts_toml]);

        debug!(
            pool_min = engine_config.pool_min,
            pool_max = engine_config.pool_max,
            max_workers = engine_config.max_workers,
            accounts = accounts_config.accounts.len(),
            "engine configuration parameters"
        );

        self.engine_config = Some(engine_config);
        self.accounts_config = Some(accounts_config);
        self.current_checksum = Some(checksum);
        Ok(())
    }

    /// Re-reads both files; returns `Ok(true)` only if their combined
    /// content actually changed since the last successful load.
    pub async fn reload(&mut self) -> Result<bool> {
        let engine_path = self.config_dir.join(ENGINE_CONFIG_FILE);
        let accounts_path = self.config_dir.join(ACCOUNTS_CONFIG_FILE);

        let engine_toml = tokio::fs::read_to_string(&engine_path)
            .await
            .with_context(|| format!("failed to read {}", engine_path.display()))?;
        let accounts_toml = tokio::fs::read_to_string(&accounts_path)
            .await
            .with_context(|| format!("failed to read {}", accounts_path.display()))?;

        let new_checksum = calculate_checksum(&[&engine_toml, &accounts_toml]);
        if self.current_checksum.as_deref() == Some(new_checksum.as_str()) {
            debug!("configuration unchanged");
            return Ok(false);
        }

        let engine_config: EngineConfig = toml::from_str(&engine_toml)
            .with_context(|| format!("TOML syntax error in {}", engine_path.display()))?;
        let accounts_config: AccountsConfig = toml::from_str(&accounts_toml)
            .with_context(|| format!("TOML syntax error in {}", accounts_path.display()))?;

        self.engine_config = Some(engine_config);
        self.accounts_config = Some(accounts_config);
        self.current_checksum = Some(new_checksum);
        info!("engine configuration reloaded");
        Ok(true)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine_config.is_some() && self.accounts_config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(dir: &std::path::Path, name: &str, body: &str) {
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }

    #[tokio::test]
    async fn loads_both_files_and_computes_a_checksum() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "engine.toml", "task_root = \"./data\"\n").await;
        write(dir.path(), "accounts.toml", "accounts = []\n").await;

        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        manager.load().await.unwrap();
        assert!(manager.is_loaded());
        assert_eq!(manager.engine_config.as_ref().unwrap().task_root, "./data");
    }

    #[tokio::test]
    async fn reload_is_a_no_op_when_content_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "engine.toml", "task_root = \"./data\"\n").await;
        write(dir.path(), "accounts.toml", "accounts = []\n").await;

        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        manager.load().await.unwrap();
        let changed = manager.reload().await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn reload_picks_up_an_edited_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "engine.toml", "task_root = \"./data\"\n").await;
        write(dir.path(), "accounts.toml", "accounts = []\n").await;

        let mut manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
        manager.load().await.unwrap();

        write(dir.path(), "engine.toml", "task_root = \"./other\"\n").await;
        let changed = manager.reload().await.unwrap();
        assert!(changed);
        assert_eq!(manager.engine_config.as_ref().unwrap().task_root, "./other");
    }

    #[tokio::test]
    async fn missing_config_directory_is_rejected_up_front() {
        let missing = std::env::temp_dir().join("engine-core-config-loader-does-not-exist");
        assert!(ConfigManager::new(missing).is_err());
    }
}
