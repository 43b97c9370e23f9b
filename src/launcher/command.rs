//! Process launcher backed by `tokio::process`.
//!
//! Each launch spawns `<interpreter> <script>` as the leader of a fresh OS
//! process group, so stopping the group also reaches any processes the
//! script forked. Children are created with `kill_on_drop(true)`; stdout
//! and stderr lines are forwarded to `tracing` under the group label.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, info_span, warn};

use super::{BoxFuture, DeathListener, LaunchDescriptor, LaunchTarget, ProcessGroup, ProcessLauncher};
use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Launches stage scripts as OS process groups.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    interpreter: String,
    core_services: Option<String>,
    stop_grace: Duration,
}

impl CommandLauncher {
    /// Construct a launcher.
    ///
    /// * `interpreter`   : program that runs a script given as its only argument.
    /// * `core_services` : optional shell command run with `<interpreter> -c`.
    /// * `stop_grace`    : delay between `SIGTERM` and a forced kill.
    #[must_use]
    pub fn new(interpreter: String, core_services: Option<String>, stop_grace: Duration) -> Self {
        Self {
            interpreter,
            core_services,
            stop_grace,
        }
    }

    /// Construct a launcher from the `[launcher]` configuration section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            config.launcher.interpreter.clone(),
            config.launcher.core_services.clone(),
            config.stop_grace(),
        )
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, descriptor: LaunchDescriptor) -> Result<Box<dyn ProcessGroup>> {
        let span = info_span!("launch", label = %descriptor.label);
        let _guard = span.enter();

        let mut cmd = match descriptor.target {
            LaunchTarget::CoreServices => {
                let Some(ref line) = self.core_services else {
                    info!("no core services command configured");
                    return Ok(Box::new(PlaceholderGroup::new(descriptor.label)));
                };
                let mut cmd = Command::new(&self.interpreter);
                cmd.arg("-c").arg(line);
                cmd
            }
            LaunchTarget::Script(ref path) => {
                if !path.is_file() {
                    return Err(AppError::Launch(format!(
                        "script {} does not exist",
                        path.display()
                    )));
                }
                let mut cmd = Command::new(&self.interpreter);
                cmd.arg(path);
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    cmd.current_dir(dir);
                }
                cmd
            }
        };

        cmd.envs(descriptor.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!("failed to spawn {}: {err}", descriptor.label))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(descriptor.label.clone(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(descriptor.label.clone(), stderr, true));
        }

        let pgid = child.id().and_then(|id| i32::try_from(id).ok());
        info!(pid = pgid.unwrap_or(0), "process group launched");

        Ok(Box::new(CommandGroup {
            label: descriptor.label,
            child,
            pgid,
            listener: descriptor.listener,
            exited: false,
            stopped: false,
            stop_grace: self.stop_grace,
        }))
    }
}

/// One spawned script and everything in its OS process group.
struct CommandGroup {
    label: String,
    child: Child,
    /// Leader pid captured at spawn; it stays the group id after the leader is reaped.
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
    listener: Option<Arc<dyn DeathListener>>,
    exited: bool,
    stopped: bool,
    stop_grace: Duration,
}

impl CommandGroup {
    fn record_exit(&mut self, status: Option<ExitStatus>) {
        if self.exited {
            return;
        }
        self.exited = true;
        let exit_code = status.and_then(|s| s.code());
        debug!(label = %self.label, ?exit_code, "process group exited");
        if let Some(ref listener) = self.listener {
            listener.process_died(&self.label, exit_code);
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        if let Err(err) = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pgid), signal) {
            debug!(label = %self.label, %err, ?signal, "failed to signal process group");
        }
    }
}

impl ProcessGroup for CommandGroup {
    fn label(&self) -> &str {
        &self.label
    }

    fn poll_once(&mut self) {
        if self.exited {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.record_exit(Some(status)),
            Ok(None) => {}
            Err(err) => {
                warn!(label = %self.label, %err, "failed to poll process status");
                self.record_exit(None);
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.poll_once();
        !self.exited
    }

    fn wait_until_done(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.exited {
                return;
            }
            match self.child.wait().await {
                Ok(status) => self.record_exit(Some(status)),
                Err(err) => {
                    warn!(label = %self.label, %err, "error waiting for process group");
                    self.record_exit(None);
                }
            }
        })
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.stopped {
                return;
            }
            self.stopped = true;

            self.poll_once();
            if self.exited {
                #[cfg(unix)]
                self.signal_group(nix::sys::signal::Signal::SIGKILL);
                return;
            }

            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGTERM);

            match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(label = %self.label, ?status, "process group stopped");
                    self.record_exit(Some(status));
                }
                Ok(Err(err)) => {
                    warn!(label = %self.label, %err, "error waiting for process group to stop");
                    self.record_exit(None);
                }
                Err(_) => {
                    warn!(
                        label = %self.label,
                        "process group did not exit within grace period, forcing kill"
                    );
                    #[cfg(unix)]
                    self.signal_group(nix::sys::signal::Signal::SIGKILL);
                    if let Err(err) = self.child.kill().await {
                        warn!(label = %self.label, %err, "failed to force-kill process group");
                    }
                    self.record_exit(None);
                }
            }

            // Reap stragglers that outlived the leader.
            #[cfg(unix)]
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
        })
    }
}

/// Stand-in core-services group when no command is configured.
struct PlaceholderGroup {
    label: String,
}

impl PlaceholderGroup {
    fn new(label: String) -> Self {
        Self { label }
    }
}

impl ProcessGroup for PlaceholderGroup {
    fn label(&self) -> &str {
        &self.label
    }

    fn poll_once(&mut self) {}

    fn is_alive(&mut self) -> bool {
        false
    }

    fn wait_until_done(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn stop(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

async fn forward_output<R>(label: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!(group = %label, output = %line, "stage stderr");
                } else {
                    info!(group = %label, output = %line, "stage stdout");
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(group = %label, %err, "stage output stream closed");
                break;
            }
        }
    }
}
