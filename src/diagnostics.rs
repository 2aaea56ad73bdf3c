//! Operator-facing diagnostics.
//!
//! Backends never surface failures as errors across their boundary. Every
//! failure (and a few milestones) becomes a [`Diagnostic`] handed to a
//! [`Notify`] implementation, while the operation itself returns an empty or
//! `false` result.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// What happened, independent of the human-readable wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Ready,
    NotRunning,
    NotInstalled,
    Starting,
    FailedToStart,
    CompanionMissing,
    AuthFailed,
    NoModels,
    Busy,
    InvalidModel,
    Chatting,
    Completed,
    Transport,
}

/// Suggested follow-up the operator can take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum Remediation {
    OpenUrl(String),
    RunCommand(String),
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenUrl(url) => write!(f, "open {url}"),
            Self::RunCommand(cmd) => write!(f, "run `{cmd}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub level: Level,
    pub kind: DiagnosticKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl Diagnostic {
    pub fn info(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Level::Info, kind, message)
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Level::Warning, kind, message)
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Level::Error, kind, message)
    }

    fn new(level: Level, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            level,
            kind,
            message: message.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: Remediation) -> Self {
        self.remediation = Some(remediation);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(r) = &self.remediation {
            write!(f, " ({r})")?;
        }
        Ok(())
    }
}

/// Side channel for diagnostics. Implementations must not block.
pub trait Notify: Send + Sync {
    fn notify(&self, diagnostic: Diagnostic);
}

pub type Notifier = Arc<dyn Notify>;

fn trace(diagnostic: &Diagnostic) {
    let kind = diagnostic.kind;
    match diagnostic.level {
        Level::Info => tracing::info!(?kind, "{diagnostic}"),
        Level::Warning => tracing::warn!(?kind, "{diagnostic}"),
        Level::Error => tracing::error!(?kind, "{diagnostic}"),
    }
}

/// Writes diagnostics to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notify for TracingNotifier {
    fn notify(&self, diagnostic: Diagnostic) {
        trace(&diagnostic);
    }
}

/// Logs and fans diagnostics out to any number of subscribers.
///
/// Each MCP tool call subscribes before touching a backend and drains its
/// receiver afterwards, so the response carries the diagnostics it caused.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Diagnostic>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notify for BroadcastNotifier {
    fn notify(&self, diagnostic: Diagnostic) {
        trace(&diagnostic);
        // No subscribers is normal between tool calls.
        let _ = self.tx.send(diagnostic);
    }
}

/// Drain everything currently buffered in a subscription.
pub fn drain(rx: &mut broadcast::Receiver<Diagnostic>) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(d) => out.push(d),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "diagnostic subscriber lagged");
            }
            Err(_) => break,
        }
    }
    out
}

/// Keeps every diagnostic in memory. Used by tests and embedders that poll.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    seen: Arc<Mutex<Vec<Diagnostic>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.seen.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.diagnostics().into_iter().map(|d| d.kind).collect()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics().iter().filter(|d| d.kind == kind).count()
    }
}

impl Notify for RecordingNotifier {
    fn notify(&self, diagnostic: Diagnostic) {
        trace(&diagnostic);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(diagnostic);
        }
    }
}
