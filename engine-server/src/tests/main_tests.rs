use engine_core::config_loader::ConfigManager;
use engine_shared::config::ServerConfig;

use crate::{CliArgs, Server};

#[tokio::test]
async fn server_construction_parses_the_listen_address() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("engine.toml"), "task_root = \"./data\"\n").await.unwrap();
    tokio::fs::write(dir.path().join("accounts.toml"), "accounts = []\n").await.unwrap();

    let mut config_manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
    config_manager.load().await.unwrap();

    let args = CliArgs {
        config_dir: dir.path().to_path_buf(),
        bind_addr: Some("127.0.0.1:9999".to_string()),
        api_key: None,
        shutdown_timeout_secs: 5,
    };
    let server = Server::new(&args, config_manager, ServerConfig::default()).unwrap();
    assert_eq!(server.listen_address.to_string(), "127.0.0.1:9999");
}

#[tokio::test]
async fn cli_overrides_take_precedence_over_server_toml() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("engine.toml"), "task_root = \"./data\"\n").await.unwrap();
    tokio::fs::write(dir.path().join("accounts.toml"), "accounts = []\n").await.unwrap();

    let mut config_manager = ConfigManager::new(dir.path().to_path_buf()).unwrap();
    config_manager.load().await.unwrap();

    let args = CliArgs {
        config_dir: dir.path().to_path_buf(),
        bind_addr: None,
        api_key: Some("from-cli".to_string()),
        shutdown_timeout_secs: 5,
    };
    let base = ServerConfig { api_key: "from-file".to_string(), ..Default::default() };
    let server = Server::new(&args, config_manager, base).unwrap();
    assert_eq!(server.server_config.api_key, "from-cli");
}
