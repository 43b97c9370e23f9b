//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name under which inventory credentials are stored.
pub const KEYRING_SERVICE: &str = "qualification-sequencer";

/// Process launcher settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Interpreter used to run stage scripts (`<interpreter> <script>`).
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Seconds to wait after `SIGTERM` before a process group is force-killed.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// Optional shell command that brings up the core/background services.
    ///
    /// When absent the core-services group is a placeholder with no processes.
    #[serde(default)]
    pub core_services: Option<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            stop_grace_seconds: default_stop_grace_seconds(),
            core_services: None,
        }
    }
}

fn default_interpreter() -> String {
    "/bin/sh".into()
}

fn default_stop_grace_seconds() -> u64 {
    5
}

/// Inventory sink connectivity.
///
/// The password is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InventoryConfig {
    /// Base URL of the inventory service.
    pub base_url: String,
    /// Account used to authenticate against the inventory service.
    pub username: String,
    /// Account password (populated at runtime).
    #[serde(skip)]
    pub password: String,
}

fn default_tick_millis() -> u64 {
    100
}

fn default_ipc_name() -> String {
    "qual-sequencer".into()
}

fn default_result_channel_port() -> u16 {
    7411
}

fn default_history_retention_days() -> u32 {
    90
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory containing `tests.toml` and one sub-directory per test.
    pub manifest_dir: PathBuf,
    /// Directory where local copies of submitted reports are written.
    pub results_dir: PathBuf,
    /// Scheduler tick period in milliseconds.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Named pipe / Unix socket identifier for the control surface.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Require a shared-secret token on every IPC command.
    #[serde(default)]
    pub ipc_auth: bool,
    /// IPC shared secret, loaded by [`GlobalConfig::load_credentials`].
    #[serde(skip)]
    pub ipc_auth_token: Option<String>,
    /// Loopback port of the result channel HTTP endpoint.
    #[serde(default = "default_result_channel_port")]
    pub result_channel_port: u16,
    /// Days a finished session is kept in the history database.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
    /// Explicit history database path; defaults to `<results_dir>/history.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Process launcher settings.
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Inventory sink; reports are only written locally when absent.
    #[serde(default)]
    pub inventory: Option<InventoryConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load secrets from OS keychain with env-var fallback.
    ///
    /// The inventory password is loaded when an `[inventory]` section is
    /// configured, the IPC token when `ipc_auth` is set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide
    /// a required secret.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if let Some(inventory) = self.inventory.as_mut() {
            inventory.password =
                load_credential("inventory_password", "QUAL_INVENTORY_PASSWORD").await?;
        }
        if self.ipc_auth {
            self.ipc_auth_token = Some(load_credential("ipc_auth_token", "QUAL_IPC_TOKEN").await?);
        }
        Ok(())
    }

    /// Scheduler tick period.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Grace period granted to a process group between `SIGTERM` and kill.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.launcher.stop_grace_seconds)
    }

    /// Path of the session history database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.results_dir.join("history.db"))
    }

    fn validate(&mut self) -> Result<()> {
        if self.tick_millis == 0 {
            return Err(AppError::Config(
                "tick_millis must be greater than zero".into(),
            ));
        }

        if self.launcher.interpreter.trim().is_empty() {
            return Err(AppError::Config(
                "launcher.interpreter must not be empty".into(),
            ));
        }

        if let Some(ref inventory) = self.inventory {
            if inventory.base_url.trim().is_empty() {
                return Err(AppError::Config(
                    "inventory.base_url must not be empty".into(),
                ));
            }
        }

        self.manifest_dir = self
            .manifest_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("manifest_dir invalid: {err}")))?;

        fs::create_dir_all(&self.results_dir)
            .map_err(|err| AppError::Config(format!("results_dir unusable: {err}")))?;
        self.results_dir = self
            .results_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("results_dir invalid: {err}")))?;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
