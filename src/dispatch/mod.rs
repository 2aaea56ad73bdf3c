pub mod hosted;
pub mod local;
pub mod readiness;
pub mod registry;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostic, DiagnosticKind, Notifier};
use crate::error::ReviewError;
use crate::scope::ScopeProvider;

use self::hosted::{Authenticator, HostedBackend};
use self::local::LocalBackend;
use self::readiness::DaemonLauncher;

/// Opaque identifier of a model within the active backend.
pub type ModelId = String;

/// Which provider implementation is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A model server running on this machine.
    Local,
    /// A remote hosted chat model.
    #[default]
    Hosted,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "ollama" => Ok(Self::Local),
            "hosted" | "copilot" => Ok(Self::Hosted),
            _ => Err(ReviewError::UnknownBackend(s.to_string())),
        }
    }
}

/// Why a chat call produced no tokens without contacting the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Another chat call is still in flight on this backend instance.
    Busy,
    /// The requested model is not in the backend's current listing.
    InvalidModel,
    /// The backend could not authenticate or reach its provider.
    Unavailable,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("backend is busy with another review"),
            Self::InvalidModel => f.write_str("requested model is not available"),
            Self::Unavailable => f.write_str("backend is unavailable"),
        }
    }
}

/// Finite, non-restartable sequence of text fragments from one chat call.
///
/// A rejected call yields nothing and reports why through [`rejection`].
/// A call that was accepted but produced no text yields nothing and has no
/// rejection.
///
/// [`rejection`]: TokenStream::rejection
pub struct TokenStream {
    inner: Pin<Box<dyn Stream<Item = String> + Send>>,
    rejection: Option<Rejection>,
}

impl TokenStream {
    pub fn new(stream: impl Stream<Item = String> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            rejection: None,
        }
    }

    pub fn rejected(reason: Rejection) -> Self {
        Self {
            inner: Box::pin(futures_util::stream::empty()),
            rejection: Some(reason),
        }
    }

    pub fn rejection(&self) -> Option<Rejection> {
        self.rejection
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

impl fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStream")
            .field("rejection", &self.rejection)
            .finish_non_exhaustive()
    }
}

impl Stream for TokenStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// Per-instance single-flight flag.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag(Arc<AtomicBool>);

impl BusyFlag {
    /// Claim the flag. `None` if it is already held.
    pub fn try_acquire(&self) -> Option<BusyGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(self.0.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the busy flag when dropped.
#[derive(Debug)]
pub struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Common capability of every chat provider.
///
/// None of these operations fail across the boundary: problems are reported
/// to the backend's notifier and the call returns `false` or an empty result.
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the backend can serve chat requests right now.
    fn check_ready(&self) -> impl Future<Output = bool> + Send;

    /// Currently available models in lexicographic order.
    fn list_models(&self) -> impl Future<Output = Vec<ModelId>> + Send;

    /// Review `source_text` with `model`, streaming the answer.
    fn chat(&self, source_text: &str, model: &str) -> impl Future<Output = TokenStream> + Send;

    fn is_busy(&self) -> bool;
}

/// Collaborators shared by every backend instance a registry creates.
#[derive(Clone)]
pub struct BackendDeps {
    pub client: Client,
    pub scope: Arc<dyn ScopeProvider>,
    pub notifier: Notifier,
    pub launcher: Arc<dyn DaemonLauncher>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Language the review must be written in.
    pub response_language: String,
}

/// The active provider, as a closed set of variants.
pub enum Backend {
    Local(LocalBackend),
    Hosted(HostedBackend),
}

impl Backend {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::Local(_) => local::PROVIDER,
            Self::Hosted(_) => hosted::PROVIDER,
        }
    }
}

impl ChatBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Local(b) => b.kind(),
            Self::Hosted(b) => b.kind(),
        }
    }

    async fn check_ready(&self) -> bool {
        match self {
            Self::Local(b) => b.check_ready().await,
            Self::Hosted(b) => b.check_ready().await,
        }
    }

    async fn list_models(&self) -> Vec<ModelId> {
        match self {
            Self::Local(b) => b.list_models().await,
            Self::Hosted(b) => b.list_models().await,
        }
    }

    async fn chat(&self, source_text: &str, model: &str) -> TokenStream {
        match self {
            Self::Local(b) => b.chat(source_text, model).await,
            Self::Hosted(b) => b.chat(source_text, model).await,
        }
    }

    fn is_busy(&self) -> bool {
        match self {
            Self::Local(b) => b.is_busy(),
            Self::Hosted(b) => b.is_busy(),
        }
    }
}

/// Shared HTTP client. No overall timeout: chat streams run until the model
/// finishes.
pub fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default HTTP client: {e}");
            Client::new()
        })
}

/// Claim the busy flag and revalidate `model` against a fresh listing.
///
/// The guard is taken before the listing so two overlapping calls can never
/// both pass. On rejection the guard is dropped here and the reason returned.
pub(crate) async fn begin_chat(
    busy: &BusyFlag,
    notifier: &Notifier,
    models: impl Future<Output = Vec<ModelId>>,
    model: &str,
) -> Result<BusyGuard, Rejection> {
    let guard = claim_busy(busy, notifier)?;
    confirm_model(notifier, &models.await, model)?;
    Ok(guard)
}

/// Take the busy flag or report that a review is already running.
pub(crate) fn claim_busy(busy: &BusyFlag, notifier: &Notifier) -> Result<BusyGuard, Rejection> {
    busy.try_acquire().ok_or_else(|| {
        notifier.notify(Diagnostic::warning(
            DiagnosticKind::Busy,
            "a review is already in progress, please wait",
        ));
        Rejection::Busy
    })
}

/// Check `model` against `available` and announce the review on success.
pub(crate) fn confirm_model(
    notifier: &Notifier,
    available: &[ModelId],
    model: &str,
) -> Result<(), Rejection> {
    if !available.iter().any(|m| m == model) {
        notifier.notify(Diagnostic::error(
            DiagnosticKind::InvalidModel,
            format!("the selected model {model} is not available"),
        ));
        return Err(Rejection::InvalidModel);
    }

    notifier.notify(Diagnostic::info(
        DiagnosticKind::Chatting,
        format!("reviewing with {model}..."),
    ));
    Ok(())
}

/// Sort and dedup a model listing so repeated calls are identical.
pub(crate) fn normalize_models(mut models: Vec<ModelId>) -> Vec<ModelId> {
    models.retain(|m| !m.trim().is_empty());
    models.sort();
    models.dedup();
    models
}
