use qualification_sequencer::{config::GlobalConfig, AppError};
use serial_test::serial;

fn paths() -> (tempfile::TempDir, String, String) {
    let temp = tempfile::tempdir().expect("tempdir");
    let manifests = temp.path().join("manifests");
    std::fs::create_dir_all(&manifests).expect("manifest dir");
    let results = temp.path().join("results");
    let manifests = manifests.to_str().expect("utf8 path").to_owned();
    let results = results.to_str().expect("utf8 path").to_owned();
    (temp, manifests, results)
}

fn minimal_toml(manifest_dir: &str, results_dir: &str) -> String {
    format!(
        r#"
manifest_dir = '{manifest_dir}'
results_dir = '{results_dir}'
"#
    )
}

fn sample_toml(manifest_dir: &str, results_dir: &str) -> String {
    format!(
        r#"
manifest_dir = '{manifest_dir}'
results_dir = '{results_dir}'
tick_millis = 50
ipc_name = "bench-3"
result_channel_port = 9100
history_retention_days = 14

[launcher]
interpreter = "/bin/bash"
stop_grace_seconds = 2
core_services = "exec ./services.sh"

[inventory]
base_url = "https://inventory.example.test/api"
username = "bench"
"#
    )
}

#[test]
fn minimal_config_applies_defaults() {
    let (_temp, manifests, results) = paths();
    let config = GlobalConfig::from_toml_str(&minimal_toml(&manifests, &results)).expect("config");

    assert_eq!(config.tick_millis, 100);
    assert_eq!(config.ipc_name, "qual-sequencer");
    assert_eq!(config.result_channel_port, 7411);
    assert_eq!(config.history_retention_days, 90);
    assert_eq!(config.launcher.interpreter, "/bin/sh");
    assert_eq!(config.launcher.stop_grace_seconds, 5);
    assert!(config.launcher.core_services.is_none());
    assert!(config.inventory.is_none());
    assert_eq!(config.db_path(), config.results_dir.join("history.db"));
}

#[test]
fn full_config_parses_every_section() {
    let (_temp, manifests, results) = paths();
    let config = GlobalConfig::from_toml_str(&sample_toml(&manifests, &results)).expect("config");

    assert_eq!(config.tick_interval(), std::time::Duration::from_millis(50));
    assert_eq!(config.stop_grace(), std::time::Duration::from_secs(2));
    assert_eq!(config.ipc_name, "bench-3");
    assert_eq!(config.result_channel_port, 9100);
    assert_eq!(
        config.launcher.core_services.as_deref(),
        Some("exec ./services.sh")
    );
    let inventory = config.inventory.expect("inventory section");
    assert_eq!(inventory.username, "bench");
    assert!(inventory.password.is_empty(), "password never read from toml");
}

#[test]
fn results_dir_is_created_and_canonicalized() {
    let (_temp, manifests, results) = paths();
    let config = GlobalConfig::from_toml_str(&minimal_toml(&manifests, &results)).expect("config");

    assert!(config.results_dir.is_dir());
    assert!(config.results_dir.is_absolute());
    assert!(config.manifest_dir.is_absolute());
}

#[test]
fn explicit_db_path_wins() {
    let (_temp, manifests, results) = paths();
    let raw = format!(
        "{}db_path = '/var/lib/qual/history.db'\n",
        minimal_toml(&manifests, &results)
    );
    let config = GlobalConfig::from_toml_str(&raw).expect("config");

    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/var/lib/qual/history.db")
    );
}

#[test]
fn zero_tick_is_rejected() {
    let (_temp, manifests, results) = paths();
    let raw = format!("tick_millis = 0\n{}", minimal_toml(&manifests, &results));

    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("tick_millis")));
}

#[test]
fn missing_manifest_dir_is_rejected() {
    let (temp, _manifests, results) = paths();
    let missing = temp.path().join("nope");
    let raw = minimal_toml(missing.to_str().expect("utf8"), &results);

    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("manifest_dir")));
}

#[test]
fn blank_interpreter_is_rejected() {
    let (_temp, manifests, results) = paths();
    let raw = format!(
        "{}\n[launcher]\ninterpreter = \"  \"\n",
        minimal_toml(&manifests, &results)
    );

    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("interpreter")));
}

#[test]
fn blank_inventory_url_is_rejected() {
    let (_temp, manifests, results) = paths();
    let raw = format!(
        "{}\n[inventory]\nbase_url = \"\"\nusername = \"bench\"\n",
        minimal_toml(&manifests, &results)
    );

    let err = GlobalConfig::from_toml_str(&raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("base_url")));
}

#[test]
fn invalid_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("manifest_dir = [").unwrap_err();
    assert!(err.to_string().starts_with("config: invalid config"));
}

#[test]
fn missing_file_is_a_config_error() {
    let err = GlobalConfig::load_from_path("/definitely/not/here/config.toml").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}

#[tokio::test]
async fn credentials_are_skipped_without_inventory() {
    let (_temp, manifests, results) = paths();
    let mut config =
        GlobalConfig::from_toml_str(&minimal_toml(&manifests, &results)).expect("config");

    config.load_credentials().await.expect("no-op");
    assert!(config.inventory.is_none());
}

#[tokio::test]
#[serial]
async fn inventory_password_falls_back_to_env() {
    let (_temp, manifests, results) = paths();
    let mut config =
        GlobalConfig::from_toml_str(&sample_toml(&manifests, &results)).expect("config");
    std::env::set_var("QUAL_INVENTORY_PASSWORD", "hunter2");

    let loaded = config.load_credentials().await;
    std::env::remove_var("QUAL_INVENTORY_PASSWORD");

    loaded.expect("credentials");
    assert_eq!(
        config.inventory.map(|i| i.password).as_deref(),
        Some("hunter2")
    );
}

#[tokio::test]
#[serial]
async fn missing_inventory_password_names_the_env_var() {
    let (_temp, manifests, results) = paths();
    let mut config =
        GlobalConfig::from_toml_str(&sample_toml(&manifests, &results)).expect("config");
    std::env::remove_var("QUAL_INVENTORY_PASSWORD");

    let err = config.load_credentials().await.unwrap_err();
    assert!(err.to_string().contains("QUAL_INVENTORY_PASSWORD"));
}

#[tokio::test]
#[serial]
async fn ipc_token_is_loaded_only_when_auth_is_enabled() {
    let (_temp, manifests, results) = paths();
    let mut open = GlobalConfig::from_toml_str(&minimal_toml(&manifests, &results)).expect("config");
    let raw = format!("ipc_auth = true\n{}", minimal_toml(&manifests, &results));
    let mut guarded = GlobalConfig::from_toml_str(&raw).expect("config");
    std::env::set_var("QUAL_IPC_TOKEN", "bench-secret");

    let open_loaded = open.load_credentials().await;
    let guarded_loaded = guarded.load_credentials().await;
    std::env::remove_var("QUAL_IPC_TOKEN");

    open_loaded.expect("credentials");
    guarded_loaded.expect("credentials");
    assert!(!open.ipc_auth);
    assert!(open.ipc_auth_token.is_none());
    assert_eq!(guarded.ipc_auth_token.as_deref(), Some("bench-secret"));
}

#[tokio::test]
#[serial]
async fn missing_ipc_token_names_the_env_var() {
    let (_temp, manifests, results) = paths();
    let raw = format!("ipc_auth = true\n{}", minimal_toml(&manifests, &results));
    let mut config = GlobalConfig::from_toml_str(&raw).expect("config");
    std::env::remove_var("QUAL_IPC_TOKEN");

    let err = config.load_credentials().await.unwrap_err();
    assert!(err.to_string().contains("QUAL_IPC_TOKEN"));
}
