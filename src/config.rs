use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ReviewError;

pub const KEY_BACKEND: &str = "backend";
pub const KEY_MODEL: &str = "model";
pub const KEY_CRITERIA: &str = "criteria";
pub const KEY_RESPONSE_LANGUAGE: &str = "response_language";
pub const KEY_LOCAL_ENDPOINT: &str = "local.endpoint";
pub const KEY_LOCAL_EXECUTABLE: &str = "local.executable";
pub const KEY_LOCAL_START_COMMAND: &str = "local.start_command";
pub const KEY_LOCAL_SETTLE_SECS: &str = "local.settle_secs";
pub const KEY_LOCAL_INSTALL_URL: &str = "local.install_url";
pub const KEY_HOSTED_BASE_URL: &str = "hosted.base_url";
pub const KEY_HOSTED_AUTH_PROVIDER: &str = "hosted.auth_provider";
pub const KEY_HOSTED_COMPANION: &str = "hosted.companion";
pub const KEY_HOSTED_COMPANION_URL: &str = "hosted.companion_install_url";

/// File name of the workspace-scoped config, looked up in the working directory.
pub const WORKSPACE_FILE: &str = ".review-on-save.toml";

pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_LOCAL_EXECUTABLE: &str = "ollama";
pub const DEFAULT_LOCAL_START_COMMAND: &str = "ollama serve";
pub const DEFAULT_LOCAL_INSTALL_URL: &str = "https://ollama.com/download";
/// Settling window between launching the daemon and re-probing it.
pub const DEFAULT_SETTLE_SECS: u64 = 5;
pub const DEFAULT_HOSTED_BASE_URL: &str = "https://models.github.ai";
pub const DEFAULT_AUTH_PROVIDER: &str = "github";
pub const DEFAULT_COMPANION: &str = "gh";
pub const DEFAULT_COMPANION_URL: &str = "https://cli.github.com";
pub const DEFAULT_RESPONSE_LANGUAGE: &str = "English";

/// Where a write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Workspace,
    Global,
}

struct Layers {
    global: toml::Table,
    workspace: toml::Table,
}

/// Two-scope key/value store backed by TOML files.
///
/// Reads prefer the workspace file, then the global file, then the caller's
/// default. Writes go to the workspace file only when the key is already set
/// there; everything else lands in the global file.
pub struct ConfigStore {
    global_path: PathBuf,
    workspace_path: Option<PathBuf>,
    layers: Mutex<Layers>,
    /// Held across a write so files land in the order the updates were made.
    write_order: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("global_path", &self.global_path)
            .field("workspace_path", &self.workspace_path)
            .finish()
    }
}

impl ConfigStore {
    /// Resolve the standard locations and load whatever exists there.
    pub fn load() -> Result<Self, ReviewError> {
        let global = global_config_path()
            .ok_or_else(|| ReviewError::Config("cannot resolve a global config path".into()))?;
        let workspace = env::current_dir().ok().map(|d| d.join(WORKSPACE_FILE));
        Self::open(global, workspace)
    }

    /// Open a store on explicit paths. Missing files read as empty tables.
    pub fn open(global_path: PathBuf, workspace_path: Option<PathBuf>) -> Result<Self, ReviewError> {
        let global = read_table(&global_path)?;
        let workspace = match &workspace_path {
            Some(path) => read_table(path)?,
            None => toml::Table::new(),
        };
        tracing::debug!(
            global = %global_path.display(),
            workspace = ?workspace_path,
            "config loaded"
        );
        Ok(Self {
            global_path,
            workspace_path,
            layers: Mutex::new(Layers { global, workspace }),
            write_order: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, key: &str) -> Option<toml::Value> {
        let layers = self.layers.lock().ok()?;
        lookup(&layers.workspace, key)
            .or_else(|| lookup(&layers.global, key))
            .cloned()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        let value = self.get(key)?;
        let items = value.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Which scope a write of `key` would target.
    pub fn target_scope(&self, key: &str) -> ConfigScope {
        let in_workspace = self
            .layers
            .lock()
            .map(|l| self.workspace_path.is_some() && lookup(&l.workspace, key).is_some())
            .unwrap_or(false);
        if in_workspace {
            ConfigScope::Workspace
        } else {
            ConfigScope::Global
        }
    }

    /// Persist `key = value` to the resolved scope and return that scope.
    ///
    /// The in-memory layer is updated first; the file write happens without
    /// holding the layer lock.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<toml::Value>,
    ) -> Result<ConfigScope, ReviewError> {
        let _order = self.write_order.lock().await;
        let scope = self.target_scope(key);

        let (path, text) = {
            let mut layers = self
                .layers
                .lock()
                .map_err(|_| ReviewError::Config("config lock poisoned".into()))?;
            let (table, path) = match (scope, &self.workspace_path) {
                (ConfigScope::Workspace, Some(path)) => (&mut layers.workspace, path.clone()),
                _ => (&mut layers.global, self.global_path.clone()),
            };
            insert(table, key, value.into())?;
            let text = toml::to_string_pretty(&*table)
                .map_err(|e| ReviewError::Config(format!("failed to serialize config: {e}")))?;
            (path, text)
        };

        write_file(&path, text).await?;
        tracing::info!(key, ?scope, path = %path.display(), "config updated");
        Ok(scope)
    }

    pub fn local_settings(&self) -> LocalSettings {
        LocalSettings {
            endpoint: self.string_or(KEY_LOCAL_ENDPOINT, DEFAULT_LOCAL_ENDPOINT),
            executable: self.string_or(KEY_LOCAL_EXECUTABLE, DEFAULT_LOCAL_EXECUTABLE),
            start_command: self.string_or(KEY_LOCAL_START_COMMAND, DEFAULT_LOCAL_START_COMMAND),
            install_url: self.string_or(KEY_LOCAL_INSTALL_URL, DEFAULT_LOCAL_INSTALL_URL),
            settle: Duration::from_secs(
                self.get_u64(KEY_LOCAL_SETTLE_SECS)
                    .unwrap_or(DEFAULT_SETTLE_SECS),
            ),
        }
    }

    pub fn hosted_settings(&self) -> HostedSettings {
        HostedSettings {
            base_url: self.string_or(KEY_HOSTED_BASE_URL, DEFAULT_HOSTED_BASE_URL),
            auth_provider: self.string_or(KEY_HOSTED_AUTH_PROVIDER, DEFAULT_AUTH_PROVIDER),
            companion: self.string_or(KEY_HOSTED_COMPANION, DEFAULT_COMPANION),
            companion_install_url: self.string_or(KEY_HOSTED_COMPANION_URL, DEFAULT_COMPANION_URL),
        }
    }

    pub fn response_language(&self) -> String {
        self.string_or(KEY_RESPONSE_LANGUAGE, DEFAULT_RESPONSE_LANGUAGE)
    }
}

/// Connection and lifecycle parameters for the local daemon.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    pub endpoint: String,
    pub executable: String,
    pub start_command: String,
    pub install_url: String,
    pub settle: Duration,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LOCAL_ENDPOINT.to_string(),
            executable: DEFAULT_LOCAL_EXECUTABLE.to_string(),
            start_command: DEFAULT_LOCAL_START_COMMAND.to_string(),
            install_url: DEFAULT_LOCAL_INSTALL_URL.to_string(),
            settle: Duration::from_secs(DEFAULT_SETTLE_SECS),
        }
    }
}

/// Parameters for the hosted model catalog.
#[derive(Debug, Clone)]
pub struct HostedSettings {
    pub base_url: String,
    /// Authentication provider id the companion signs in against.
    pub auth_provider: String,
    /// Executable name of the companion CLI.
    pub companion: String,
    pub companion_install_url: String,
}

impl Default for HostedSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HOSTED_BASE_URL.to_string(),
            auth_provider: DEFAULT_AUTH_PROVIDER.to_string(),
            companion: DEFAULT_COMPANION.to_string(),
            companion_install_url: DEFAULT_COMPANION_URL.to_string(),
        }
    }
}

/// `$REVIEW_ON_SAVE_CONFIG`, else `$XDG_CONFIG_HOME/review-on-save/config.toml`,
/// else `~/.config/review-on-save/config.toml`.
fn global_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var("REVIEW_ON_SAVE_CONFIG")
        && !explicit.trim().is_empty()
    {
        return Some(PathBuf::from(explicit));
    }
    let base = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .or_else(|| env::var_os("APPDATA").map(PathBuf::from))?;
    Some(base.join("review-on-save").join("config.toml"))
}

fn read_table(path: &Path) -> Result<toml::Table, ReviewError> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .parse::<toml::Table>()
            .map_err(|e| ReviewError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(toml::Table::new()),
        Err(e) => Err(ReviewError::Io(e)),
    }
}

async fn write_file(path: &Path, text: String) -> Result<(), ReviewError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    Ok(())
}

/// Dotted-key lookup (`local.endpoint` → `[local] endpoint`).
fn lookup<'a>(table: &'a toml::Table, key: &str) -> Option<&'a toml::Value> {
    let mut parts = key.split('.');
    let first = parts.next()?;
    let mut current = table.get(first)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn insert(table: &mut toml::Table, key: &str, value: toml::Value) -> Result<(), ReviewError> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let leaf = parts
        .pop()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ReviewError::Config(format!("invalid config key: {key:?}")))?;

    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        current = entry
            .as_table_mut()
            .ok_or_else(|| ReviewError::Config(format!("{part} is not a table in key {key}")))?;
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_lookup_walks_tables() {
        let table: toml::Table = "[local]\nendpoint = \"http://x:1\"\n".parse().unwrap();
        assert_eq!(
            lookup(&table, "local.endpoint").and_then(|v| v.as_str()),
            Some("http://x:1")
        );
        assert!(lookup(&table, "local.missing").is_none());
        assert!(lookup(&table, "hosted.base_url").is_none());
    }

    #[test]
    fn insert_creates_intermediate_tables() {
        let mut table = toml::Table::new();
        insert(&mut table, "local.settle_secs", toml::Value::Integer(2)).unwrap();
        assert_eq!(
            lookup(&table, "local.settle_secs").and_then(|v| v.as_integer()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn set_creates_missing_directories_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("nested").join("config.toml");
        let store = ConfigStore::open(global.clone(), None).unwrap();

        let scope = store.set(KEY_LOCAL_SETTLE_SECS, 2).await.unwrap();
        assert_eq!(scope, ConfigScope::Global);

        let reopened = ConfigStore::open(global, None).unwrap();
        assert_eq!(reopened.local_settings().settle, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sequential_writes_keep_the_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("config.toml");
        let store = ConfigStore::open(global.clone(), None).unwrap();

        store.set(KEY_MODEL, "a").await.unwrap();
        store.set(KEY_MODEL, "b").await.unwrap();

        let reopened = ConfigStore::open(global, None).unwrap();
        assert_eq!(reopened.get_string(KEY_MODEL).as_deref(), Some("b"));
    }

    #[test]
    fn insert_rejects_scalar_parent() {
        let mut table: toml::Table = "local = 3\n".parse().unwrap();
        assert!(insert(&mut table, "local.endpoint", toml::Value::from("x")).is_err());
    }
}
