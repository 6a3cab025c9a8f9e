//! Registry of hosted plugins.
//!
//! Holds one record per plugin: its identity, the method table built at
//! registration, the current configuration snapshot and the lifecycle
//! slot the supervisor drives. The registry is shared by the supervisor
//! and the bridge; nothing reaches plugins through globals.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::schema::SchemaError;
use super::{
    ConfigSchema, MethodDescriptor, MethodKind, Plugin, PluginConfig, PluginId, PluginIdentity,
};
use crate::lifecycle::{LifecycleSlot, LifecycleState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(PluginId),

    #[error("plugin '{plugin}' declares method '{method}' twice")]
    DuplicateMethod { plugin: PluginId, method: String },

    #[error("invalid configuration for plugin '{plugin}': {source}")]
    InvalidConfig {
        plugin: PluginId,
        #[source]
        source: SchemaError,
    },
}

impl Borrow<str> for PluginId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// One hosted plugin.
pub struct PluginRecord {
    identity: PluginIdentity,
    description: String,
    plugin: Arc<dyn Plugin>,
    schema: ConfigSchema,
    methods: HashMap<String, MethodDescriptor>,
    config: RwLock<PluginConfig>,
    pub(crate) lifecycle: LifecycleSlot,
}

impl PluginRecord {
    fn new(
        plugin: Arc<dyn Plugin>,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, RegistryError> {
        let identity = plugin.identity().clone();
        let schema = plugin.config_schema();

        let mut methods = HashMap::new();
        for method in plugin.methods() {
            if methods.contains_key(&method.name) {
                return Err(RegistryError::DuplicateMethod {
                    plugin: identity.module.clone(),
                    method: method.name,
                });
            }
            methods.insert(method.name.clone(), method);
        }

        let config = schema
            .resolve(settings)
            .map_err(|source| RegistryError::InvalidConfig {
                plugin: identity.module.clone(),
                source,
            })?;

        Ok(Self {
            description: plugin.description().to_string(),
            identity,
            plugin,
            schema,
            methods,
            config: RwLock::new(Arc::new(config)),
            lifecycle: LifecycleSlot::new(),
        })
    }

    pub fn id(&self) -> &PluginId {
        &self.identity.module
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn schema(&self) -> &ConfigSchema {
        &self.schema
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Methods sorted by name.
    pub fn methods(&self) -> Vec<&MethodDescriptor> {
        let mut methods: Vec<_> = self.methods.values().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Current configuration snapshot. Callers keep the snapshot they
    /// took even if the configuration is replaced meanwhile.
    pub fn config(&self) -> PluginConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace_config(&self, config: PluginConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

/// A method as advertised to the model layer.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// `{module}.{method}`
    pub name: String,
    pub description: String,
    pub kind: MethodKind,
    pub input_schema: serde_json::Value,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<PluginId, Arc<PluginRecord>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin in the UNLOADED state with its resolved config.
    pub fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arc<PluginRecord>, RegistryError> {
        let record = Arc::new(PluginRecord::new(plugin, settings)?);
        let id = record.id().clone();

        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        if plugins.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        plugins.insert(id.clone(), record.clone());

        info!(
            plugin = %id,
            author = %record.identity().author,
            methods = record.methods.len(),
            "Registered plugin"
        );
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginRecord>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All records, sorted by module name.
    pub fn records(&self) -> Vec<Arc<PluginRecord>> {
        let mut records: Vec<_> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub fn ids(&self) -> Vec<PluginId> {
        self.records().iter().map(|r| r.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every mounted method, for the model's tool list.
    pub fn catalog(&self) -> Vec<ToolDefinition> {
        self.records()
            .iter()
            .flat_map(|record| {
                record.methods().into_iter().map(move |m| ToolDefinition {
                    name: format!("{}.{}", record.id(), m.name),
                    description: m.description.clone(),
                    kind: m.kind,
                    input_schema: m.parameters_schema(),
                })
            })
            .collect()
    }
}
