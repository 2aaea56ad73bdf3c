use std::sync::Arc;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::config::LocalSettings;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Notifier};
use crate::dispatch::readiness::{DaemonLauncher, ReadinessController, ReadinessState};
use crate::dispatch::{
    BackendKind, BusyFlag, BusyGuard, ChatBackend, ModelId, TokenStream, begin_chat,
    normalize_models,
};
use crate::error::ReviewError;
use crate::prompt::{SYSTEM_INSTRUCTION, build_review_prompt};
use crate::scope::ScopeProvider;

pub const PROVIDER: &str = "ollama";

/// Cap on a single NDJSON line. A well-behaved daemon sends tiny chunks.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

/// One line of the daemon's streaming chat response.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, PartialEq, Eq)]
enum ChatLine {
    Token(String),
    Done,
    Skip,
}

fn parse_chat_line(line: &[u8]) -> Result<ChatLine, ReviewError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(ChatLine::Skip);
    }
    let chunk: ChatChunk = serde_json::from_slice(trimmed)
        .map_err(|e| ReviewError::SchemaParse(format!("bad chat chunk: {e}")))?;
    if let Some(message) = chunk.error {
        return Err(ReviewError::Upstream {
            provider: PROVIDER.to_string(),
            message,
            status: None,
        });
    }
    if chunk.done {
        return Ok(ChatLine::Done);
    }
    match chunk.message {
        Some(m) if !m.content.is_empty() => Ok(ChatLine::Token(m.content)),
        _ => Ok(ChatLine::Skip),
    }
}

/// Backend for a model server on this machine, speaking the Ollama HTTP API.
pub struct LocalBackend {
    client: Client,
    settings: LocalSettings,
    readiness: ReadinessController,
    busy: BusyFlag,
    scope: Arc<dyn ScopeProvider>,
    notifier: Notifier,
    language: String,
}

impl LocalBackend {
    pub fn new(
        client: Client,
        settings: LocalSettings,
        launcher: Arc<dyn DaemonLauncher>,
        scope: Arc<dyn ScopeProvider>,
        notifier: Notifier,
        language: String,
    ) -> Self {
        let readiness =
            ReadinessController::new(client.clone(), settings.clone(), launcher, notifier.clone());
        Self {
            client,
            settings,
            readiness,
            busy: BusyFlag::default(),
            scope,
            notifier,
            language,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    pub fn readiness_state(&self) -> ReadinessState {
        self.readiness.state()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.endpoint.trim_end_matches('/'))
    }

    async fn fetch_models(&self) -> Result<Vec<ModelId>, ReviewError> {
        let response = self.client.get(self.url("/api/tags")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReviewError::Upstream {
                provider: PROVIDER.to_string(),
                message: format!("model listing returned {status}"),
                status: Some(status.as_u16()),
            });
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::SchemaParse(format!("failed to parse model list: {e}")))?;
        Ok(normalize_models(
            tags.models.into_iter().map(|m| m.name).collect(),
        ))
    }

    fn stream_chat(
        &self,
        guard: BusyGuard,
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
            "keep_alive": 0,
        });
        let request = self.client.post(self.url("/api/chat")).json(&body);
        let notifier = self.notifier.clone();

        stream! {
            let guard = guard;
            let mut completed = false;
            let mut failure: Option<String> = None;

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let mut bytes = response.bytes_stream();
                    let mut buf: Vec<u8> = Vec::new();
                    'read: while let Some(next) = bytes.next().await {
                        let chunk = match next {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                failure = Some(format!("stream interrupted: {e}"));
                                break 'read;
                            }
                        };
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            match parse_chat_line(&line) {
                                Ok(ChatLine::Token(text)) => { yield text; }
                                Ok(ChatLine::Done) => {
                                    completed = true;
                                    break 'read;
                                }
                                Ok(ChatLine::Skip) => {}
                                Err(e) => {
                                    failure = Some(e.to_string());
                                    break 'read;
                                }
                            }
                        }
                        if buf.len() > MAX_LINE_BYTES {
                            failure = Some(format!("chat line exceeded {MAX_LINE_BYTES} bytes"));
                            break 'read;
                        }
                    }
                    // A final line may arrive without its trailing newline.
                    if !completed && failure.is_none() {
                        match parse_chat_line(&buf) {
                            Ok(ChatLine::Token(text)) => { yield text; }
                            Ok(ChatLine::Done) => completed = true,
                            Ok(ChatLine::Skip) => {}
                            Err(e) => failure = Some(e.to_string()),
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
                    "review with the local model finished",
                )),
                None => tracing::warn!("local chat stream ended without a done marker"),
            }
        }
    }
}

impl ChatBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn check_ready(&self) -> bool {
        self.readiness.check_ready().await
    }

    async fn list_models(&self) -> Vec<ModelId> {
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => {
                self.notifier.notify(Diagnostic::error(
                    DiagnosticKind::NoModels,
                    format!(
                        "no models found on {}; pull one with `{} pull <model>`",
                        self.settings.endpoint, self.settings.executable
                    ),
                ));
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("local model listing failed: {e}");
                self.notifier.notify(Diagnostic::error(
                    DiagnosticKind::NoModels,
                    format!("could not list local models: {}", e.user_message()),
                ));
                Vec::new()
            }
        }
    }

    async fn chat(&self, source_text: &str, model: &str) -> TokenStream {
        let guard = match begin_chat(&self.busy, &self.notifier, self.list_models(), model).await {
            Ok(guard) => guard,
            Err(reason) => return TokenStream::rejected(reason),
        };
        let criteria = self.scope.selected_criteria();
        let prompt = build_review_prompt(source_text, &criteria, &self.language);
        TokenStream::new(self.stream_chat(guard, prompt, model.to_string()))
    }

    fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }
}
