//! Backend registry: default selection, persistence and switching.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use common::{FakeLauncher, StubAuth, ollama_daemon};
use futures_util::StreamExt;
use review_on_save::config::{ConfigScope, ConfigStore, KEY_BACKEND, WORKSPACE_FILE};
use review_on_save::diagnostics::RecordingNotifier;
use review_on_save::dispatch::registry::BackendRegistry;
use review_on_save::dispatch::{BackendDeps, BackendKind, ChatBackend, http_client};
use review_on_save::error::ReviewError;
use review_on_save::scope::FixedScope;

fn deps() -> BackendDeps {
    BackendDeps {
        client: http_client(),
        scope: Arc::new(FixedScope(vec!["comments".into()])),
        notifier: Arc::new(RecordingNotifier::new()),
        launcher: Arc::new(FakeLauncher::default()),
        authenticator: Arc::new(StubAuth::signed_in()),
        response_language: "English".into(),
    }
}

fn store(dir: &Path) -> Arc<ConfigStore> {
    Arc::new(
        ConfigStore::open(
            dir.join("global").join("config.toml"),
            Some(dir.join("project").join(WORKSPACE_FILE)),
        )
        .unwrap(),
    )
}

#[test]
fn defaults_to_hosted() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(store(dir.path()), deps()).unwrap();
    assert_eq!(registry.active_kind(), BackendKind::Hosted);
    assert_eq!(registry.active().provider(), "github");
}

#[tokio::test]
async fn persisted_tag_selects_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = store(dir.path());
    config.set(KEY_BACKEND, "local").await.unwrap();

    let registry = BackendRegistry::new(config, deps()).unwrap();
    assert_eq!(registry.active_kind(), BackendKind::Local);
    assert_eq!(registry.active().provider(), "ollama");
}

#[tokio::test]
async fn unknown_persisted_tag_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = store(dir.path());
    config.set(KEY_BACKEND, "gemini").await.unwrap();

    let err = BackendRegistry::new(config, deps()).err().unwrap();
    assert!(matches!(err, ReviewError::UnknownBackend(ref tag) if tag == "gemini"));
}

#[tokio::test]
async fn switch_persists_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(store(dir.path()), deps()).unwrap();

    registry.switch_to(BackendKind::Local).await;
    assert_eq!(registry.active_kind(), BackendKind::Local);

    let reloaded = store(dir.path());
    assert_eq!(reloaded.get_string(KEY_BACKEND).as_deref(), Some("local"));
    assert_eq!(reloaded.target_scope(KEY_BACKEND), ConfigScope::Global);
    assert!(dir.path().join("global").join("config.toml").exists());
}

#[tokio::test]
async fn switch_writes_to_workspace_when_set_there() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("project");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::write(workspace.join(WORKSPACE_FILE), "backend = \"local\"\n").unwrap();

    let registry = BackendRegistry::new(store(dir.path()), deps()).unwrap();
    assert_eq!(registry.active_kind(), BackendKind::Local);

    registry.switch_to_tag("hosted").await.unwrap();

    let text = std::fs::read_to_string(workspace.join(WORKSPACE_FILE)).unwrap();
    assert!(text.contains("backend = \"hosted\""));
    assert!(!dir.path().join("global").join("config.toml").exists());
}

#[tokio::test]
async fn unknown_switch_tag_keeps_active_backend() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(store(dir.path()), deps()).unwrap();

    assert!(registry.switch_to_tag("bard").await.is_err());
    assert_eq!(registry.active_kind(), BackendKind::Hosted);
}

#[tokio::test]
async fn switching_always_builds_a_fresh_instance() {
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::new(store(dir.path()), deps()).unwrap();

    let before = registry.active();
    let after = registry.switch_to(BackendKind::Hosted).await;
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(&after, &registry.active()));
}

#[tokio::test]
async fn stream_from_replaced_backend_runs_to_completion() {
    let daemon = ollama_daemon(Arc::new(AtomicBool::new(true)), &["m"], &["still ", "here"]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = store(dir.path());
    config.set(KEY_BACKEND, "local").await.unwrap();
    config.set("local.endpoint", daemon.url.as_str()).await.unwrap();
    let registry = BackendRegistry::new(config, deps()).unwrap();

    let old = registry.active();
    let tokens = old.chat("x", "m").await;
    registry.switch_to(BackendKind::Hosted).await;

    let text: Vec<String> = tokens.collect().await;
    assert_eq!(text.concat(), "still here");
    assert!(!old.is_busy());
    assert_eq!(registry.active_kind(), BackendKind::Hosted);
}
