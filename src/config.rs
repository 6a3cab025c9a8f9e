use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Per-plugin sections, keyed by module name: `[plugins.notes]`
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSection>,
}

/// Sandbox namespace layout and payload limits.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    /// Root that relative sandbox paths are resolved against
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    #[serde(default = "default_uploads_marker")]
    pub uploads_marker: PathBuf,
    #[serde(default = "default_shared_marker")]
    pub shared_marker: PathBuf,
    /// Host directory holding `{chat_key}/{filename}` uploads.
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_uploads_root")]
    pub uploads_root: PathBuf,
    /// Host directory holding `{container_key}/...` shared areas
    #[serde(default = "default_sandboxes_root")]
    pub sandboxes_root: PathBuf,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// How many times the init hook is tried before the plugin is degraded
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Everything else in the section is handed to the plugin's schema
    #[serde(flatten)]
    pub settings: toml::Table,
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("/sandbox")
}

fn default_uploads_marker() -> PathBuf {
    PathBuf::from("/sandbox/uploads")
}

fn default_shared_marker() -> PathBuf {
    PathBuf::from("/sandbox/shared")
}

fn default_uploads_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}

fn default_sandboxes_root() -> PathBuf {
    PathBuf::from("./data/sandboxes")
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_max_depth() -> usize {
    32
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/store")
}

fn default_init_attempts() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            uploads_marker: default_uploads_marker(),
            shared_marker: default_shared_marker(),
            uploads_root: default_uploads_root(),
            sandboxes_root: default_sandboxes_root(),
            max_payload_bytes: default_max_payload_bytes(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_attempts: default_init_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses a TOML document, expanding `${VAR}` references first.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Whether a plugin should be registered at startup.
    /// A plugin without a section is enabled with its schema defaults.
    pub fn is_enabled(&self, module: &str) -> bool {
        self.plugins.get(module).map(|p| p.enabled).unwrap_or(true)
    }

    /// Plugin settings as JSON, ready for schema resolution.
    pub fn plugin_settings(&self, module: &str) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        let Some(section) = self.plugins.get(module) else {
            return Ok(serde_json::Map::new());
        };
        match serde_json::to_value(&section.settings)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(anyhow::anyhow!(
                "settings for plugin '{module}' must be a table, got {other}"
            )),
        }
    }
}
