use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Implementation, LoggingLevel, LoggingMessageNotificationParam,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::{Peer, RequestContext};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, tool, tool_handler, tool_router};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, KEY_CRITERIA, KEY_MODEL};
use crate::context::{self, MAX_SOURCE_BYTES};
use crate::diagnostics::{BroadcastNotifier, Diagnostic, DiagnosticKind, drain};
use crate::dispatch::hosted::GhCliAuth;
use crate::dispatch::readiness::ShellLauncher;
use crate::dispatch::registry::BackendRegistry;
use crate::dispatch::{Backend, BackendDeps, ChatBackend, http_client};
use crate::error::ReviewError;
use crate::relay::{ReviewSink, relay};
use crate::response::{ToolMetadata, ToolResponse};
use crate::scope::{ReviewScope, ScopeProvider};
use crate::tools::backend::{SelectModelRequest, SwitchBackendRequest};
use crate::tools::listmodels::ModelListing;
use crate::tools::review::ReviewRequest;

/// Logger name on the progress notifications a `review` call emits.
pub const REVIEW_LOGGER: &str = "review";

#[derive(Clone)]
pub struct ReviewServer {
    registry: Arc<BackendRegistry>,
    config: Arc<ConfigStore>,
    scope: Arc<ReviewScope>,
    diagnostics: BroadcastNotifier,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl ReviewServer {
    /// Wire the production collaborators around `config`.
    pub fn new(config: Arc<ConfigStore>) -> Result<Self, ReviewError> {
        let selected = config.get_string_list(KEY_CRITERIA).unwrap_or_default();
        let scope = Arc::new(ReviewScope::with_selection(&selected));
        let diagnostics = BroadcastNotifier::default();
        let deps = BackendDeps {
            client: http_client(),
            scope: scope.clone(),
            notifier: Arc::new(diagnostics.clone()),
            launcher: Arc::new(ShellLauncher),
            authenticator: Arc::new(GhCliAuth::new(&config.hosted_settings())),
            response_language: config.response_language(),
        };
        let registry = Arc::new(BackendRegistry::new(config.clone(), deps)?);
        Ok(Self::from_parts(config, scope, diagnostics, registry))
    }

    /// Assemble a server from prebuilt parts. `diagnostics` must be the
    /// notifier the registry's backends report to.
    pub fn from_parts(
        config: Arc<ConfigStore>,
        scope: Arc<ReviewScope>,
        diagnostics: BroadcastNotifier,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            registry,
            config,
            scope,
            diagnostics,
            tool_router: Self::tool_router(),
        }
    }

    fn metadata(
        &self,
        tool_name: &str,
        backend: &Backend,
        model: Option<String>,
        start: Instant,
        rx: &mut broadcast::Receiver<Diagnostic>,
    ) -> ToolMetadata {
        ToolMetadata {
            tool_name: tool_name.to_string(),
            backend: backend.kind().to_string(),
            model,
            duration_seconds: start.elapsed().as_secs_f64(),
            diagnostics: drain(rx),
        }
    }

    /// The persisted model if `models` still offers it.
    fn selected_model(&self, models: &[String]) -> Option<String> {
        self.config
            .get_string(KEY_MODEL)
            .filter(|m| models.iter().any(|x| x == m))
    }

    #[tool(
        name = "check_ready",
        description = "Check that the active backend can serve reviews. For the local backend this starts the model server when it is installed but not running.",
        annotations(read_only_hint = false)
    )]
    pub async fn check_ready(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mut rx = self.diagnostics.subscribe();
        let backend = self.registry.active();

        let ready = backend.check_ready().await;
        let kind = backend.kind();
        let meta = self.metadata("check_ready", &backend, None, start, &mut rx);
        let response = if ready {
            ToolResponse::success(format!("{kind} backend is ready"), meta)
        } else {
            ToolResponse::error(
                format!("{kind} backend is not ready; see diagnostics"),
                meta,
            )
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "listmodels",
        description = "List the models the active backend offers, the selected model, and the review criteria with their selection.",
        annotations(read_only_hint = true)
    )]
    pub async fn listmodels(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mut rx = self.diagnostics.subscribe();
        let backend = self.registry.active();

        let models = backend.list_models().await;
        let listing = ModelListing {
            backend: backend.kind().to_string(),
            selected: self.selected_model(&models),
            models,
            criteria: self.scope.items(),
        };
        let meta = self.metadata(
            "listmodels",
            &backend,
            listing.selected.clone(),
            start,
            &mut rx,
        );
        Ok(ToolResponse::success(listing.to_markdown(), meta).into_call_tool_result())
    }

    #[tool(
        name = "switch_backend",
        description = "Replace the active backend with \"local\" or \"hosted\" and persist the choice. Selects the first offered model when the current selection is not available there.",
        annotations(read_only_hint = false)
    )]
    pub async fn switch_backend(
        &self,
        Parameters(req): Parameters<SwitchBackendRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mut rx = self.diagnostics.subscribe();

        let backend = match self.registry.switch_to_tag(&req.backend).await {
            Ok(backend) => backend,
            Err(e) => {
                return Err(McpError::invalid_params(e.user_message(), None));
            }
        };

        let models = backend.list_models().await;
        let selected = match self.selected_model(&models) {
            Some(model) => Some(model),
            None => {
                let first = models.first().cloned();
                if let Some(model) = &first
                    && let Err(e) = self.config.set(KEY_MODEL, model.as_str()).await
                {
                    tracing::warn!(model = %model, "failed to persist model selection: {e}");
                }
                first
            }
        };

        let listing = ModelListing {
            backend: backend.kind().to_string(),
            models,
            selected: selected.clone(),
            criteria: self.scope.items(),
        };
        let meta = self.metadata("switch_backend", &backend, selected, start, &mut rx);
        Ok(ToolResponse::success(listing.to_markdown(), meta).into_call_tool_result())
    }

    #[tool(
        name = "select_model",
        description = "Persist the model `review` uses when none is given. Must be a name returned by `listmodels`.",
        annotations(read_only_hint = false)
    )]
    pub async fn select_model(
        &self,
        Parameters(req): Parameters<SelectModelRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mut rx = self.diagnostics.subscribe();
        let backend = self.registry.active();
        let model = req.model.trim().to_string();

        let models = backend.list_models().await;
        if !models.contains(&model) {
            let meta = self.metadata("select_model", &backend, None, start, &mut rx);
            return Ok(ToolResponse::error(
                format!(
                    "model {model} is not offered by the {} backend",
                    backend.kind()
                ),
                meta,
            )
            .into_call_tool_result());
        }

        let response = match self.config.set(KEY_MODEL, model.as_str()).await {
            Ok(scope) => {
                tracing::info!(model = %model, ?scope, "model selected");
                let meta =
                    self.metadata("select_model", &backend, Some(model.clone()), start, &mut rx);
                ToolResponse::success(format!("selected `{model}`"), meta)
            }
            Err(e) => {
                let meta = self.metadata("select_model", &backend, Some(model), start, &mut rx);
                ToolResponse::error(e.user_message(), meta)
            }
        };
        Ok(response.into_call_tool_result())
    }

    #[tool(
        name = "review",
        description = "Review a saved source file against the selected criteria with the active backend. Progress is streamed as logging notifications ({\"event\":\"clear\"} then {\"event\":\"update\",\"content\":...}); the final review is returned as markdown.",
        annotations(read_only_hint = true)
    )]
    async fn review(
        &self,
        Parameters(req): Parameters<ReviewRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let mut sink = PeerSink::new(context.peer.clone(), context.ct.clone());
        self.run_review(req, &mut sink).await
    }

    /// Body of the `review` tool, generic over where progress is rendered.
    pub async fn run_review<K: ReviewSink>(
        &self,
        req: ReviewRequest,
        sink: &mut K,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mut rx = self.diagnostics.subscribe();
        let (backend, switches) = self.registry.watch_active();

        if let Some(criteria) = &req.criteria {
            self.scope.replace_selection(criteria);
            if let Err(e) = self
                .config
                .set(KEY_CRITERIA, self.scope.selected_criteria())
                .await
            {
                tracing::warn!("failed to persist criteria: {e}");
            }
        }
        if self.scope.selected_criteria().is_empty() {
            let meta = self.metadata("review", &backend, None, start, &mut rx);
            return Ok(ToolResponse::error(
                "no review criteria selected; pass `criteria` or see `listmodels`".to_string(),
                meta,
            )
            .into_call_tool_result());
        }

        let working_directory = match &req.working_directory {
            Some(wd) => Some(
                context::validate_working_directory(wd)
                    .await
                    .map_err(|e| McpError::invalid_params(e.user_message(), None))?,
            ),
            None => None,
        };
        let path = context::resolve_path(&req.file_path, working_directory.as_deref());
        let source = context::read_source_file(&path, MAX_SOURCE_BYTES)
            .await
            .map_err(|e| McpError::invalid_params(e.user_message(), None))?;

        let model = match req.model_override() {
            Some(model) => Some(model.to_string()),
            None => match self.config.get_string(KEY_MODEL) {
                Some(model) => Some(model),
                None => backend.list_models().await.into_iter().next(),
            },
        };
        let Some(model) = model else {
            let meta = self.metadata("review", &backend, None, start, &mut rx);
            return Ok(ToolResponse::error(
                "no model selected and the backend offers none".to_string(),
                meta,
            )
            .into_call_tool_result());
        };

        tracing::info!(file = %path.display(), model = %model, backend = %backend.kind(), "review requested");
        let tokens = backend.chat(&source, &model).await;
        if let Some(reason) = tokens.rejection() {
            let meta = self.metadata("review", &backend, Some(model), start, &mut rx);
            return Ok(ToolResponse::error(reason.to_string(), meta).into_call_tool_result());
        }

        let mut sink = ActiveBackendSink {
            inner: sink,
            switches,
        };
        let outcome = relay(tokens, &mut sink).await;
        let superseded = outcome.withdrawn && sink.superseded();
        let meta = self.metadata("review", &backend, Some(model), start, &mut rx);
        let interrupted = meta
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Transport);

        let response = if superseded {
            tracing::info!(backend = %backend.kind(), "review superseded by a backend switch");
            ToolResponse::error(
                "review superseded: the backend was switched while it ran".to_string(),
                meta,
            )
        } else if outcome.withdrawn {
            ToolResponse::error("review withdrawn".to_string(), meta)
        } else if interrupted {
            ToolResponse::error(
                format!("{}\n\n(stream interrupted)", outcome.transcript),
                meta,
            )
        } else if outcome.transcript.is_empty() {
            ToolResponse::success("_the model returned no text_".to_string(), meta)
        } else {
            ToolResponse::success(outcome.transcript, meta)
        };
        Ok(response.into_call_tool_result())
    }
}

/// Forwards to `inner` until the backend the review started on is replaced;
/// from then on it reports itself withdrawn.
struct ActiveBackendSink<'a, K> {
    inner: &'a mut K,
    switches: watch::Receiver<u64>,
}

impl<K> ActiveBackendSink<'_, K> {
    fn superseded(&self) -> bool {
        self.switches.has_changed().unwrap_or(false)
    }
}

impl<K: ReviewSink> ReviewSink for ActiveBackendSink<'_, K> {
    async fn clear(&mut self) {
        self.inner.clear().await;
    }

    async fn update(&mut self, transcript: &str) {
        self.inner.update(transcript).await;
    }

    fn is_withdrawn(&self) -> bool {
        self.superseded() || self.inner.is_withdrawn()
    }

    fn withdrawn(&self) -> impl Future<Output = ()> + Send {
        let mut switches = self.switches.clone();
        let inner = self.inner.withdrawn();
        async move {
            let switched = async move {
                if switches.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = inner => {}
                _ = switched => {}
            }
        }
    }
}

/// Renders review progress as MCP logging notifications to the calling peer.
/// Withdrawn once the request is cancelled or a notification fails to send.
struct PeerSink {
    peer: Peer<RoleServer>,
    ct: CancellationToken,
    withdrawn: bool,
}

impl PeerSink {
    fn new(peer: Peer<RoleServer>, ct: CancellationToken) -> Self {
        Self {
            peer,
            ct,
            withdrawn: false,
        }
    }

    async fn send(&mut self, data: serde_json::Value) {
        let param = LoggingMessageNotificationParam {
            level: LoggingLevel::Info,
            logger: Some(REVIEW_LOGGER.to_string()),
            data,
        };
        if let Err(e) = self.peer.notify_logging_message(param).await {
            tracing::debug!("progress notification failed, treating as withdrawn: {e}");
            self.withdrawn = true;
        }
    }
}

impl ReviewSink for PeerSink {
    async fn clear(&mut self) {
        self.send(serde_json::json!({ "event": "clear" })).await;
    }

    async fn update(&mut self, transcript: &str) {
        self.send(serde_json::json!({ "event": "update", "content": transcript }))
            .await;
    }

    fn is_withdrawn(&self) -> bool {
        self.withdrawn || self.ct.is_cancelled()
    }

    fn withdrawn(&self) -> impl Future<Output = ()> + Send {
        self.ct.cancelled()
    }
}

#[tool_handler]
impl ServerHandler for ReviewServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "review-on-save".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Review-on-save: AI review of a saved source file.\n\n\
                 Workflow:\n\
                 1. Call `check_ready` once; for the local backend it starts the model server.\n\
                 2. Call `listmodels` to see models and review criteria; `select_model` to pick one.\n\
                 3. After saving a file, call `review` with `file_path` (and `working_directory`).\n\
                    Progress arrives as logging notifications from logger \"review\".\n\
                 Use `switch_backend` to move between \"local\" and \"hosted\"."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_logging()
                .build(),
            ..Default::default()
        }
    }
}
