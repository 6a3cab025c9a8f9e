//! Dispatch of sandbox-issued calls to host-resident plugin methods.
//!
//! A call goes through, in order: plugin lookup, the lifecycle gate,
//! method lookup, argument decoding and shape checks, sandbox-to-host
//! path translation, the method body, host-to-sandbox translation of
//! returned paths, and encoding. Every failure along the way comes back
//! as a [`BridgeError`]; nothing a plugin does escapes unstructured.
//!
//! The bridge holds no lock of its own. Concurrent calls into the same
//! plugin only meet at the lifecycle state check and inside the store.

pub mod error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::lifecycle::{LifecycleState, LifecycleSupervisor, PluginStatus, UnloadOutcome};
use crate::paths::{PathError, PathTranslator};
use crate::plugin::registry::ToolDefinition;
use crate::plugin::{guarded, MethodCall, MethodDescriptor, ParamKind, SessionContext};
use crate::wire::{SerializationError, SerializationGuard, Value, WireForm};

pub use error::{BridgeError, ErrorKind};

/// One call instance. Never persisted.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub correlation_id: String,
    pub plugin: String,
    pub method: String,
    pub session: SessionContext,
    pub args: WireForm,
}

impl Invocation {
    pub fn new(
        plugin: impl Into<String>,
        method: impl Into<String>,
        session: SessionContext,
        args: WireForm,
    ) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            plugin: plugin.into(),
            method: method.into(),
            session,
            args,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }
}

pub struct ExecutionBridge {
    supervisor: Arc<LifecycleSupervisor>,
    paths: PathTranslator,
    guard: SerializationGuard,
}

impl ExecutionBridge {
    pub fn new(
        supervisor: Arc<LifecycleSupervisor>,
        paths: PathTranslator,
        guard: SerializationGuard,
    ) -> Self {
        Self {
            supervisor,
            paths,
            guard,
        }
    }

    pub fn supervisor(&self) -> &Arc<LifecycleSupervisor> {
        &self.supervisor
    }

    pub fn guard(&self) -> &SerializationGuard {
        &self.guard
    }

    pub async fn invoke(&self, inv: Invocation) -> Result<WireForm, BridgeError> {
        debug!(
            correlation_id = %inv.correlation_id,
            plugin = %inv.plugin,
            method = %inv.method,
            chat = %inv.session.chat_key,
            args = %inv.args.fingerprint(),
            "Dispatch"
        );
        let started = Instant::now();
        let result = self.run(&inv).await;

        match &result {
            Ok(wire) => info!(
                correlation_id = %inv.correlation_id,
                "{}.{} ok ({} bytes, {}ms)",
                inv.plugin,
                inv.method,
                wire.len(),
                started.elapsed().as_millis()
            ),
            Err(e) => info!(
                correlation_id = %inv.correlation_id,
                kind = e.kind().as_str(),
                "{}.{} rejected: {e}",
                inv.plugin,
                inv.method
            ),
        }
        result
    }

    async fn run(&self, inv: &Invocation) -> Result<WireForm, BridgeError> {
        let record = self
            .supervisor
            .registry()
            .get(&inv.plugin)
            .ok_or_else(|| BridgeError::PluginNotFound(inv.plugin.clone()))?;

        self.supervisor
            .admit(&record, &inv.session)
            .map_err(|u| BridgeError::ServiceUnavailable {
                plugin: inv.plugin.clone(),
                state: u.state,
                reason: u.reason,
            })?;

        let method = record
            .method(&inv.method)
            .ok_or_else(|| BridgeError::MethodNotFound {
                plugin: inv.plugin.clone(),
                method: inv.method.clone(),
            })?;

        let mut args = match self.guard.decode(&inv.args)? {
            Value::Map(args) => args,
            Value::Null => BTreeMap::new(),
            other => {
                return Err(BridgeError::InvalidArguments(format!(
                    "arguments must be a map, got {}",
                    other.kind_name()
                )))
            }
        };
        check_args(method, &args).map_err(BridgeError::InvalidArguments)?;
        self.translate_args(method, &mut args, &inv.session)?;

        let call = MethodCall {
            args,
            session: inv.session.clone(),
            store: self.supervisor.store_for(record.id()),
            config: record.config(),
        };

        let value = match guarded(method.handler.call(call)).await {
            Ok(value) => value,
            Err(e) => {
                let full = format!("{e:#}");
                let bridged = BridgeError::from_handler(&inv.plugin, &inv.method, e);
                if let BridgeError::MethodExecution { .. } = bridged {
                    error!(
                        correlation_id = %inv.correlation_id,
                        plugin = %inv.plugin,
                        method = %inv.method,
                        "Method failed: {full}"
                    );
                }
                return Err(bridged);
            }
        };

        // The method succeeded; only its result failed to cross back.
        let value = self
            .untranslate(value, &inv.session)
            .map_err(|e| SerializationError::UnreturnablePath(e.to_string()))?;
        Ok(self.guard.encode(&value)?)
    }

    /// Replaces declared path arguments with host paths.
    fn translate_args(
        &self,
        method: &MethodDescriptor,
        args: &mut BTreeMap<String, Value>,
        session: &SessionContext,
    ) -> Result<(), PathError> {
        let chat_key = Some(session.chat_key.as_str());
        let container_key = session.container_id.as_deref();

        for spec in &method.params {
            let Some(arg) = args.get_mut(&spec.name) else {
                continue;
            };
            match spec.kind {
                ParamKind::Path => {
                    if let Value::Str(raw) = arg {
                        let host = self.paths.to_host(raw, chat_key, container_key)?;
                        *arg = Value::Path(host);
                    }
                }
                ParamKind::PathList => {
                    if let Value::List(items) = arg {
                        for item in items.iter_mut() {
                            if let Value::Str(raw) = item {
                                let host = self.paths.to_host(raw, chat_key, container_key)?;
                                *item = Value::Path(host);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Rewrites every host path in a result into its sandbox form.
    fn untranslate(&self, value: Value, session: &SessionContext) -> Result<Value, PathError> {
        Ok(match value {
            Value::Path(host) => Value::Str(self.paths.to_sandbox(
                &host,
                Some(session.chat_key.as_str()),
                session.container_id.as_deref(),
            )?),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.untranslate(v, session))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.untranslate(v, session)?)))
                    .collect::<Result<_, PathError>>()?,
            ),
            other => other,
        })
    }

    pub async fn reset_session(&self, plugin: &str, session: &SessionContext) -> Result<(), BridgeError> {
        Ok(self.supervisor.reset_session(plugin, session).await?)
    }

    pub async fn load(&self, plugin: &str) -> Result<LifecycleState, BridgeError> {
        Ok(self.supervisor.load(plugin).await?)
    }

    pub async fn unload(&self, plugin: &str) -> Result<UnloadOutcome, BridgeError> {
        Ok(self.supervisor.unload(plugin).await?)
    }

    pub async fn retry(&self, plugin: &str) -> Result<LifecycleState, BridgeError> {
        Ok(self.supervisor.retry(plugin).await?)
    }

    pub fn update_config(
        &self,
        plugin: &str,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), BridgeError> {
        Ok(self.supervisor.update_config(plugin, settings)?)
    }

    /// The plugin's settings form, for whoever renders configuration UIs.
    pub fn describe_config(&self, plugin: &str) -> Result<serde_json::Value, BridgeError> {
        let record = self
            .supervisor
            .registry()
            .get(plugin)
            .ok_or_else(|| BridgeError::PluginNotFound(plugin.to_string()))?;
        Ok(record.schema().to_ui_descriptor())
    }

    pub fn plugin_status(&self, plugin: &str) -> Result<PluginStatus, BridgeError> {
        self.supervisor
            .status(plugin)
            .ok_or_else(|| BridgeError::PluginNotFound(plugin.to_string()))
    }

    pub fn status(&self) -> Vec<PluginStatus> {
        self.supervisor.status_all()
    }

    pub fn catalog(&self) -> Vec<ToolDefinition> {
        self.supervisor.registry().catalog()
    }
}

/// Checks decoded arguments against the declared parameters. A null
/// counts as absent.
fn check_args(method: &MethodDescriptor, args: &BTreeMap<String, Value>) -> Result<(), String> {
    for spec in &method.params {
        match args.get(&spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(format!("missing required parameter '{}'", spec.name));
                }
            }
            Some(value) if !spec.kind.accepts(value) => {
                return Err(format!(
                    "parameter '{}' expects {}, got {}",
                    spec.name,
                    spec.kind.as_str(),
                    value.kind_name()
                ));
            }
            Some(_) => {}
        }
    }

    if let Some(unknown) = args
        .keys()
        .find(|name| !method.params.iter().any(|p| &p.name == *name))
    {
        return Err(format!("unknown parameter '{unknown}'"));
    }
    Ok(())
}
