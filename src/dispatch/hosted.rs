use std::process::Stdio;
use std::sync::Arc;

use async_stream::stream;
use eventsource_stream::Eventsource;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::HostedSettings;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Notifier, Remediation};
use crate::dispatch::readiness::command_on_path;
use crate::dispatch::{
    BackendKind, BusyFlag, BusyGuard, ChatBackend, ModelId, Rejection, TokenStream, claim_busy,
    confirm_model, normalize_models,
};
use crate::error::ReviewError;
use crate::prompt::{SYSTEM_INSTRUCTION, build_review_prompt};
use crate::scope::ScopeProvider;

pub const PROVIDER: &str = "github";

/// Obtains credentials for the hosted provider through a companion tool.
pub trait Authenticator: Send + Sync {
    /// Whether the companion that owns the sign-in is available.
    fn companion_present(&self) -> BoxFuture<'_, bool>;

    /// Produce a bearer token, signing in first if the companion requires it.
    fn token(&self) -> BoxFuture<'_, Result<String, ReviewError>>;
}

/// Uses the GitHub CLI as the companion: `gh auth token` yields the token of
/// the signed-in account.
#[derive(Debug, Clone)]
pub struct GhCliAuth {
    companion: String,
    auth_provider: String,
}

impl GhCliAuth {
    pub fn new(settings: &HostedSettings) -> Self {
        Self {
            companion: settings.companion.clone(),
            auth_provider: settings.auth_provider.clone(),
        }
    }

    async fn fetch_token(&self) -> Result<String, ReviewError> {
        let output = Command::new(&self.companion)
            .args(["auth", "token"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ReviewError::AuthFailed {
                provider: self.auth_provider.clone(),
                message: format!("failed to run {}: {e}", self.companion),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReviewError::AuthFailed {
                provider: self.auth_provider.clone(),
                message: stderr.trim().to_string(),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ReviewError::AuthFailed {
                provider: self.auth_provider.clone(),
                message: "no token for the signed-in account".to_string(),
            });
        }
        Ok(token)
    }
}

impl Authenticator for GhCliAuth {
    fn companion_present(&self) -> BoxFuture<'_, bool> {
        Box::pin(command_on_path(&self.companion))
    }

    fn token(&self) -> BoxFuture<'_, Result<String, ReviewError>> {
        Box::pin(self.fetch_token())
    }
}

#[derive(Deserialize)]
struct CatalogModel {
    id: String,
}

/// The catalog is a bare array; OpenAI-style servers wrap it in `data`.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogResponse {
    List(Vec<CatalogModel>),
    Wrapped { data: Vec<CatalogModel> },
}

impl CatalogResponse {
    fn into_ids(self) -> Vec<ModelId> {
        let models = match self {
            Self::List(models) => models,
            Self::Wrapped { data } => data,
        };
        models.into_iter().map(|m| m.id).collect()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one SSE `data:` payload, and whether it ends the reply.
fn parse_event_data(data: &str) -> Result<(Vec<String>, bool), ReviewError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok((Vec::new(), true));
    }
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| ReviewError::SchemaParse(format!("bad completion chunk: {e}")))?;
    let mut texts = Vec::new();
    let mut finished = false;
    for choice in chunk.choices {
        if let Some(content) = choice.delta.and_then(|d| d.content)
            && !content.is_empty()
        {
            texts.push(content);
        }
        finished |= choice.finish_reason.is_some();
    }
    Ok((texts, finished))
}

/// Backend for a remote, OpenAI-compatible hosted model catalog.
pub struct HostedBackend {
    client: Client,
    settings: HostedSettings,
    authenticator: Arc<dyn Authenticator>,
    busy: BusyFlag,
    scope: Arc<dyn ScopeProvider>,
    notifier: Notifier,
    language: String,
}

impl HostedBackend {
    pub fn new(
        client: Client,
        settings: HostedSettings,
        authenticator: Arc<dyn Authenticator>,
        scope: Arc<dyn ScopeProvider>,
        notifier: Notifier,
        language: String,
    ) -> Self {
        Self {
            client,
            settings,
            authenticator,
            busy: BusyFlag::default(),
            scope,
            notifier,
            language,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    fn login_hint(&self) -> Remediation {
        Remediation::RunCommand(format!("{} auth login", self.settings.companion))
    }

    /// Token or an `AuthFailed` diagnostic.
    async fn authenticate(&self) -> Option<String> {
        match self.authenticator.token().await {
            Ok(token) => Some(token),
            Err(e) => {
                let provider = e.provider().unwrap_or(&self.settings.auth_provider);
                tracing::warn!(provider = %provider, "hosted authentication failed: {e}");
                let detail = match &e {
                    ReviewError::AuthFailed { message, .. } => message.clone(),
                    other => other.user_message(),
                };
                self.notifier.notify(
                    Diagnostic::error(
                        DiagnosticKind::AuthFailed,
                        format!("sign-in to {provider} failed: {detail}"),
                    )
                    .with_remediation(self.login_hint()),
                );
                None
            }
        }
    }

    async fn fetch_models(&self, token: &str) -> Result<Vec<ModelId>, ReviewError> {
        let response = self
            .client
            .get(self.url("/catalog/models"))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ReviewError::AuthFailed {
                provider: self.settings.auth_provider.clone(),
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            return Err(ReviewError::Upstream {
                provider: PROVIDER.to_string(),
                message: format!("model catalog returned {status}"),
                status: Some(status.as_u16()),
            });
        }

        let catalog: CatalogResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::SchemaParse(format!("failed to parse model catalog: {e}")))?;
        Ok(normalize_models(catalog.into_ids()))
    }

    /// Catalog listing with an already obtained token; failures become
    /// diagnostics and an empty list.
    async fn models_with_token(&self, token: &str) -> Vec<ModelId> {
        match self.fetch_models(token).await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                self.notifier.notify(Diagnostic::error(
                    DiagnosticKind::NoModels,
                    "no hosted models are available to this account",
                ));
                Vec::new()
            }
            Err(e) => {
                let provider = e.provider().unwrap_or(PROVIDER);
                tracing::warn!(provider = %provider, "hosted model listing failed: {e}");
                let diagnostic = match &e {
                    ReviewError::AuthFailed { .. } => Diagnostic::error(
                        DiagnosticKind::AuthFailed,
                        format!("model catalog refused the credentials: {}", e.user_message()),
                    )
                    .with_remediation(self.login_hint()),
                    _ => Diagnostic::error(
                        DiagnosticKind::NoModels,
                        format!("could not list hosted models: {}", e.user_message()),
                    ),
                };
                self.notifier.notify(diagnostic);
                Vec::new()
            }
        }
    }

    fn stream_chat(
        &self,
        guard: BusyGuard,
        token: String,
        prompt: String,
        model: String,
    ) -> impl Stream<Item = String> + Send + 'static {
        let body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": SYSTEM_INSTRUCTION},
                {"role": "user", "content": prompt},
            ],
            "stream": true,
        });
        let request = self
            .client
            .post(self.url("/inference/chat/completions"))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);
        let notifier = self.notifier.clone();

        stream! {
            let guard = guard;
            let mut completed = false;
            let mut failure: Option<String> = None;

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let mut events = response.bytes_stream().eventsource();
                    'read: while let Some(event) = events.next().await {
                        let event = match event {
                            Ok(event) => event,
                            Err(e) => {
                                failure = Some(format!("stream interrupted: {e}"));
                                break 'read;
                            }
                        };
                        match parse_event_data(&event.data) {
                            Ok((texts, finished)) => {
                                for text in texts {
                                    yield text;
                                }
                                if finished {
                                    completed = true;
                                    break 'read;
                                }
                            }
                            Err(e) => {
                                failure = Some(e.to_string());
                                break 'read;
                            }
                        }
                    }
                }
                Ok(response) => {
                    failure = Some(format!("chat request returned {}", response.status()));
                }
                Err(e) => {
                    failure = Some(format!("chat request failed: {e}"));
                }
            }

            drop(guard);
            match failure {
                Some(message) => notifier.notify(Diagnostic::error(
                    DiagnosticKind::Transport,
                    format!("{PROVIDER}: {message}"),
                )),
                None if completed => notifier.notify(Diagnostic::info(
                    DiagnosticKind::Completed,
                    "review with the hosted model finished",
                )),
                None => tracing::warn!("hosted chat stream ended without a completion marker"),
            }
        }
    }
}

impl ChatBackend for HostedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hosted
    }

    async fn check_ready(&self) -> bool {
        if !self.authenticator.companion_present().await {
            self.notifier.notify(
                Diagnostic::error(
                    DiagnosticKind::CompanionMissing,
                    format!(
                        "{} is not installed; install it to sign in to {}",
                        self.settings.companion, self.settings.auth_provider
                    ),
                )
                .with_remediation(Remediation::OpenUrl(
                    self.settings.companion_install_url.clone(),
                )),
            );
            return false;
        }

        if self.authenticate().await.is_none() {
            return false;
        }

        if self.list_models().await.is_empty() {
            return false;
        }

        self.notifier.notify(Diagnostic::info(
            DiagnosticKind::Ready,
            format!("signed in to {}", self.settings.auth_provider),
        ));
        true
    }

    async fn list_models(&self) -> Vec<ModelId> {
        let Some(token) = self.authenticate().await else {
            return Vec::new();
        };
        self.models_with_token(&token).await
    }

    async fn chat(&self, source_text: &str, model: &str) -> TokenStream {
        let guard = match claim_busy(&self.busy, &self.notifier) {
            Ok(guard) => guard,
            Err(reason) => return TokenStream::rejected(reason),
        };
        let Some(token) = self.authenticate().await else {
            return TokenStream::rejected(Rejection::Unavailable);
        };
        let models = self.models_with_token(&token).await;
        if let Err(reason) = confirm_model(&self.notifier, &models, model) {
            return TokenStream::rejected(reason);
        }
        let criteria = self.scope.selected_criteria();
        let prompt = build_review_prompt(source_text, &criteria, &self.language);
        TokenStream::new(self.stream_chat(guard, token, prompt, model.to_string()))
    }

    fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }
}
