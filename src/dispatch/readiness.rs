//! Start-up state machine for a backend that needs a local daemon.
//!
//! `Unknown → {Running, NotInstalled, NotRunning} → Starting → {Running, FailedToStart}`
//!
//! One `check_ready()` call makes at most one start attempt: probe, look the
//! executable up on `PATH`, launch, wait out the settle window, probe again.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::config::LocalSettings;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Notifier, Remediation};
use crate::error::ReviewError;

/// Per-probe budget. The daemon answers its root route instantly when up.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    #[default]
    Unknown,
    Running,
    NotInstalled,
    NotRunning,
    Starting,
    FailedToStart,
}

/// Finds and launches the daemon executable.
pub trait DaemonLauncher: Send + Sync {
    /// Whether `executable` resolves on the command search path.
    fn is_installed<'a>(&'a self, executable: &'a str) -> BoxFuture<'a, bool>;

    /// Start `command` detached from this process. Returns once spawned.
    fn launch(&self, command: &str) -> Result<(), ReviewError>;
}

/// Runs the start command through the platform shell and forwards its output
/// into the log under the `daemon` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellLauncher;

impl DaemonLauncher for ShellLauncher {
    fn is_installed<'a>(&'a self, executable: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(command_on_path(executable))
    }

    fn launch(&self, command: &str) -> Result<(), ReviewError> {
        let mut cmd = shell_command(command);
        // stdout carries the MCP protocol; the daemon must never write to it.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ReviewError::Other(format!("failed to spawn `{command}`: {e}")))?;
        tracing::info!(command, pid = ?child.id(), "daemon launched");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err));
        }
        // Reap the child so it never lingers as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "daemon exited"),
                Err(e) => tracing::warn!("failed to wait on daemon: {e}"),
            }
        });
        Ok(())
    }
}

async fn forward_lines(pipe: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "daemon", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "daemon", "pipe closed: {e}");
                break;
            }
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Check if an executable exists on the command search path
/// (`where` on Windows, `which` elsewhere).
pub async fn command_on_path(name: &str) -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    Command::new(finder)
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

pub struct ReadinessController {
    client: Client,
    settings: LocalSettings,
    launcher: Arc<dyn DaemonLauncher>,
    notifier: Notifier,
    state: Mutex<ReadinessState>,
}

impl ReadinessController {
    pub fn new(
        client: Client,
        settings: LocalSettings,
        launcher: Arc<dyn DaemonLauncher>,
        notifier: Notifier,
    ) -> Self {
        Self {
            client,
            settings,
            launcher,
            notifier,
            state: Mutex::new(ReadinessState::Unknown),
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn transition(&self, next: ReadinessState) {
        if let Ok(mut state) = self.state.lock() {
            tracing::debug!(from = ?*state, to = ?next, "readiness transition");
            *state = next;
        }
    }

    /// GET the daemon's base URL. Any OK status means it is serving.
    pub async fn probe(&self) -> bool {
        match self
            .client
            .get(&self.settings.endpoint)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(endpoint = %self.settings.endpoint, "probe failed: {e}");
                false
            }
        }
    }

    pub async fn check_ready(&self) -> bool {
        let executable = self.settings.executable.as_str();

        if self.probe().await {
            self.transition(ReadinessState::Running);
            self.notifier.notify(Diagnostic::info(
                DiagnosticKind::Ready,
                format!("{executable} is already running"),
            ));
            return true;
        }

        if !self.launcher.is_installed(executable).await {
            self.transition(ReadinessState::NotInstalled);
            self.notifier.notify(
                Diagnostic::error(
                    DiagnosticKind::NotInstalled,
                    format!(
                        "{executable} is not installed; install it from {}",
                        self.settings.install_url
                    ),
                )
                .with_remediation(Remediation::OpenUrl(self.settings.install_url.clone())),
            );
            return false;
        }

        self.transition(ReadinessState::NotRunning);
        self.notifier.notify(Diagnostic::warning(
            DiagnosticKind::NotRunning,
            format!("{executable} is installed but not responding"),
        ));

        self.transition(ReadinessState::Starting);
        self.notifier.notify(Diagnostic::info(
            DiagnosticKind::Starting,
            format!("starting {executable}..."),
        ));

        if let Err(e) = self.launcher.launch(&self.settings.start_command) {
            self.transition(ReadinessState::FailedToStart);
            self.notifier.notify(Diagnostic::error(
                DiagnosticKind::FailedToStart,
                format!("failed to start {executable}: {}", e.user_message()),
            ));
            return false;
        }

        tokio::time::sleep(self.settings.settle).await;

        if self.probe().await {
            self.transition(ReadinessState::Running);
            self.notifier.notify(Diagnostic::info(
                DiagnosticKind::Ready,
                format!("{executable} started successfully"),
            ));
            true
        } else {
            self.transition(ReadinessState::FailedToStart);
            self.notifier.notify(
                Diagnostic::error(
                    DiagnosticKind::FailedToStart,
                    format!("{executable} did not come up after starting it"),
                )
                .with_remediation(Remediation::RunCommand(
                    self.settings.start_command.clone(),
                )),
            );
            false
        }
    }
}
