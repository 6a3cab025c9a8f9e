pub mod builtin;
pub mod registry;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::store::PluginStore;
use crate::wire::Value;

pub use registry::{PluginRecord, PluginRegistry};
pub use schema::ConfigSchema;

/// Snapshot of a plugin's resolved configuration.
pub type PluginConfig = Arc<serde_json::Map<String, serde_json::Value>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid plugin module name '{0}': use lowercase letters, digits, '_' or '-'")]
pub struct InvalidPluginId(pub String);

/// Globally unique module name of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginId(String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidPluginId> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if valid {
            Ok(Self(id))
        } else {
            Err(InvalidPluginId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Immutable identity of a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginIdentity {
    pub author: String,
    pub module: PluginId,
}

/// The chat/user interaction a call originates from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub chat_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl SessionContext {
    pub fn new(chat_key: impl Into<String>) -> Self {
        Self {
            chat_key: chat_key.into(),
            user_id: None,
            container_id: None,
        }
    }

    #[cfg(test)]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[cfg(test)]
    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }
}

// ── Method descriptors ───────────────────────────────────

/// What a method is for: answering the model, or acting on the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Read-mostly, result goes back to the model
    Tool,
    /// Side-effecting behavior
    Action,
}

/// Declared kind of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Map,
    Any,
    /// A sandbox path, translated to a host path before the call.
    Path,
    /// A list of sandbox paths.
    PathList,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::List => "list",
            ParamKind::Map => "map",
            ParamKind::Any => "any",
            ParamKind::Path => "path",
            ParamKind::PathList => "path_list",
        }
    }

    /// Whether a decoded (untranslated) argument fits this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ParamKind::Any, _) => true,
            (ParamKind::String | ParamKind::Path, Value::Str(_)) => true,
            (ParamKind::Integer, Value::Int(_)) => true,
            (ParamKind::Number, Value::Int(_) | Value::Float(_)) => true,
            (ParamKind::Boolean, Value::Bool(_)) => true,
            (ParamKind::List, Value::List(_)) => true,
            (ParamKind::Map, Value::Map(_)) => true,
            (ParamKind::PathList, Value::List(items)) => {
                items.iter().all(|v| matches!(v, Value::Str(_)))
            }
            _ => false,
        }
    }

    fn json_schema(&self) -> serde_json::Value {
        match self {
            ParamKind::String => json!({"type": "string"}),
            ParamKind::Integer => json!({"type": "integer"}),
            ParamKind::Number => json!({"type": "number"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
            ParamKind::List => json!({"type": "array"}),
            ParamKind::Map => json!({"type": "object"}),
            ParamKind::Any => json!({}),
            ParamKind::Path => json!({"type": "string", "format": "path"}),
            ParamKind::PathList => {
                json!({"type": "array", "items": {"type": "string", "format": "path"}})
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// A callable method mounted by a plugin. Immutable once registered.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    pub kind: MethodKind,
    pub params: Vec<ParamSpec>,
    pub handler: Arc<dyn MethodHandler>,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: MethodKind,
        description: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            params: Vec::new(),
            handler,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// JSON Schema of the parameters, as exposed to the model.
    pub fn parameters_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|p| {
                let mut schema = p.kind.json_schema();
                if let Some(obj) = schema.as_object_mut() {
                    obj.insert("description".to_string(), json!(p.description));
                }
                (p.name.clone(), schema)
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ── Calls and hooks ──────────────────────────────────────

/// Everything a method body receives for one invocation.
pub struct MethodCall {
    /// Decoded arguments; declared path params already hold host paths
    pub args: BTreeMap<String, Value>,
    pub session: SessionContext,
    pub store: PluginStore,
    pub config: PluginConfig,
}

impl MethodCall {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn str_arg(&self, name: &str) -> anyhow::Result<&str> {
        self.opt_str_arg(name)
            .ok_or_else(|| anyhow!("Missing required parameter: {name}"))
    }

    pub fn opt_str_arg(&self, name: &str) -> Option<&str> {
        self.arg(name).and_then(Value::as_str)
    }

    pub fn path_arg(&self, name: &str) -> anyhow::Result<&Path> {
        self.arg(name)
            .and_then(Value::as_path)
            .ok_or_else(|| anyhow!("Missing required path parameter: {name}"))
    }

    /// Integer config value, falling back to `default`.
    pub fn config_i64(&self, name: &str, default: i64) -> i64 {
        self.config
            .get(name)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(default)
    }
}

/// What lifecycle hooks receive.
pub struct HookContext {
    pub plugin: PluginId,
    pub store: PluginStore,
    pub config: PluginConfig,
}

/// Host-resident body of a plugin method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, call: MethodCall) -> anyhow::Result<Value>;
}

/// Adapts a closure into a [`MethodHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(MethodCall) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync,
{
    async fn call(&self, call: MethodCall) -> anyhow::Result<Value> {
        (self.0)(call).await
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(MethodCall) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Runs plugin code, turning a panic into an ordinary error.
pub(crate) async fn guarded<T>(
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("plugin panicked: {msg}"))
        }
    }
}

/// A third-party extension hosted by the bridge.
///
/// Plugins declare their methods and configuration as data; the bodies run
/// on the host while calls originate in a sandbox. Lifecycle hooks are
/// driven by the supervisor, never by the plugin itself.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn identity(&self) -> &PluginIdentity;

    fn description(&self) -> &str {
        ""
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default()
    }

    /// Mounted methods. Names must be unique within the plugin.
    fn methods(&self) -> Vec<MethodDescriptor>;

    async fn init(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when one chat session is reset; other sessions keep running.
    async fn on_session_reset(
        &self,
        _ctx: &HookContext,
        _session: &SessionContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release whatever init acquired. Also called after a failed init.
    async fn cleanup(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}
