//! Process launcher abstraction.
//!
//! A launch turns a declarative [`LaunchDescriptor`] into a running
//! [`ProcessGroup`]. Groups are polled once per scheduler tick, awaited for
//! synchronous stages, and stopped idempotently during teardown. The
//! orchestrator depends only on these traits; [`CommandLauncher`] is the
//! tokio-process implementation.

pub mod command;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::Result;

pub use command::CommandLauncher;

/// Boxed future returned by process-group operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a launch should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    /// Background services every session depends on.
    CoreServices,
    /// A stage script.
    Script(PathBuf),
}

/// Receives per-process exit notifications from a group.
pub trait DeathListener: Send + Sync {
    /// Called once per exited process; `exit_code` is `None` when unknown.
    fn process_died(&self, process: &str, exit_code: Option<i32>);
}

/// Declarative description of one process-group launch.
#[derive(Clone)]
pub struct LaunchDescriptor {
    /// Label used in logs and as the process name reported to listeners.
    pub label: String,
    /// What to start.
    pub target: LaunchTarget,
    /// Extra environment for every process in the group.
    pub env: Vec<(String, String)>,
    /// Optional exit listener.
    pub listener: Option<Arc<dyn DeathListener>>,
}

impl LaunchDescriptor {
    /// Descriptor for the core services group.
    #[must_use]
    pub fn core_services() -> Self {
        Self {
            label: "core-services".into(),
            target: LaunchTarget::CoreServices,
            env: Vec::new(),
            listener: None,
        }
    }

    /// Descriptor for a stage script, labelled by its file name.
    #[must_use]
    pub fn script(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |n| n.to_string_lossy())
            .into_owned();
        Self {
            label,
            target: LaunchTarget::Script(path),
            env: Vec::new(),
            listener: None,
        }
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Attach an exit listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn DeathListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl std::fmt::Debug for LaunchDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchDescriptor")
            .field("label", &self.label)
            .field("target", &self.target)
            .field("env", &self.env)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Starts process groups.
pub trait ProcessLauncher: Send + Sync {
    /// Start a group. Never partially starts: either every process in the
    /// group is running or an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the descriptor cannot be resolved or
    /// the processes cannot be spawned.
    fn launch(&self, descriptor: LaunchDescriptor) -> Result<Box<dyn ProcessGroup>>;
}

/// Handle to a running process group.
pub trait ProcessGroup: Send {
    /// Label the group was launched with.
    fn label(&self) -> &str;

    /// Non-blocking bookkeeping: reap exited processes and deliver exit
    /// notifications to the listener.
    fn poll_once(&mut self);

    /// Whether any process in the group is still running.
    fn is_alive(&mut self) -> bool;

    /// Resolve once every process in the group has exited.
    fn wait_until_done(&mut self) -> BoxFuture<'_, ()>;

    /// Terminate every process in the group. Idempotent.
    fn stop(&mut self) -> BoxFuture<'_, ()>;
}

/// Exit listener that remembers whether any process died badly.
///
/// Exit code `0` or an unknown code is clean; anything else is abnormal.
#[derive(Debug, Default)]
pub struct ExitTracker {
    died_badly: AtomicBool,
    first_failure: Mutex<Option<String>>,
}

impl ExitTracker {
    /// Fresh tracker with no recorded exits.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether any process exited abnormally.
    #[must_use]
    pub fn has_any_process_died_badly(&self) -> bool {
        self.died_badly.load(Ordering::SeqCst)
    }

    /// Description of the first abnormal exit.
    #[must_use]
    pub fn first_failure(&self) -> Option<String> {
        self.first_failure
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }
}

impl DeathListener for ExitTracker {
    fn process_died(&self, process: &str, exit_code: Option<i32>) {
        match exit_code {
            None | Some(0) => {
                info!(process, ?exit_code, "process exited cleanly");
            }
            Some(code) => {
                warn!(process, code, "process died badly");
                if !self.died_badly.swap(true, Ordering::SeqCst) {
                    if let Ok(mut guard) = self.first_failure.lock() {
                        *guard = Some(format!("{process} exited with code {code}"));
                    }
                }
            }
        }
    }
}
