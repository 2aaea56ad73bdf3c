use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::config::{ConfigStore, KEY_BACKEND};
use crate::dispatch::hosted::HostedBackend;
use crate::dispatch::local::LocalBackend;
use crate::dispatch::{Backend, BackendDeps, BackendKind, ChatBackend};
use crate::error::ReviewError;

/// Owns the single active backend.
///
/// Switching replaces the slot. The previous instance is not torn down: a
/// caller still holding its `Arc` (or a stream it produced) keeps running to
/// completion, but nothing new reaches it.
pub struct BackendRegistry {
    config: Arc<ConfigStore>,
    deps: BackendDeps,
    active: RwLock<Arc<Backend>>,
    /// Bumped under the slot's write lock on every switch.
    switches: watch::Sender<u64>,
}

impl BackendRegistry {
    /// Build the backend named by the persisted `backend` key, defaulting to
    /// hosted when unset. An unrecognised tag is an error.
    pub fn new(config: Arc<ConfigStore>, deps: BackendDeps) -> Result<Self, ReviewError> {
        let kind = match config.get_string(KEY_BACKEND) {
            Some(tag) => tag.parse::<BackendKind>()?,
            None => BackendKind::default(),
        };
        let backend = Arc::new(Self::create(&config, &deps, kind));
        tracing::info!(backend = %kind, "active backend");
        Ok(Self {
            config,
            deps,
            active: RwLock::new(backend),
            switches: watch::Sender::new(0),
        })
    }

    fn create(config: &ConfigStore, deps: &BackendDeps, kind: BackendKind) -> Backend {
        match kind {
            BackendKind::Local => Backend::Local(LocalBackend::new(
                deps.client.clone(),
                config.local_settings(),
                deps.launcher.clone(),
                deps.scope.clone(),
                deps.notifier.clone(),
                deps.response_language.clone(),
            )),
            BackendKind::Hosted => Backend::Hosted(HostedBackend::new(
                deps.client.clone(),
                config.hosted_settings(),
                deps.authenticator.clone(),
                deps.scope.clone(),
                deps.notifier.clone(),
                deps.response_language.clone(),
            )),
        }
    }

    pub fn active(&self) -> Arc<Backend> {
        match self.active.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The active backend together with a receiver that changes once it is
    /// replaced. Both are taken under the same lock, so a switch can never
    /// fall between them.
    pub fn watch_active(&self) -> (Arc<Backend>, watch::Receiver<u64>) {
        let slot = match self.active.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        (slot.clone(), self.switches.subscribe())
    }

    pub fn active_kind(&self) -> BackendKind {
        self.active().kind()
    }

    /// Replace the active backend with a fresh `kind` instance and persist the
    /// choice. Always builds a new instance, even when `kind` is unchanged.
    pub async fn switch_to(&self, kind: BackendKind) -> Arc<Backend> {
        let backend = Arc::new(Self::create(&self.config, &self.deps, kind));
        {
            let mut slot = match self.active.write() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = backend.clone();
            self.switches.send_modify(|n| *n += 1);
        }
        if let Err(e) = self.config.set(KEY_BACKEND, kind.as_str()).await {
            tracing::warn!(backend = %kind, "failed to persist backend choice: {e}");
        }
        tracing::info!(backend = %kind, "switched backend");
        backend
    }

    /// [`switch_to`](Self::switch_to) from a string tag.
    pub async fn switch_to_tag(&self, tag: &str) -> Result<Arc<Backend>, ReviewError> {
        let kind = tag.parse::<BackendKind>()?;
        Ok(self.switch_to(kind).await)
    }
}
