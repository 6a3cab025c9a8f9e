use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{LifecycleError, LifecycleState};
use crate::paths::PathError;
use crate::store::{ScopeError, StoreError};
use crate::wire::SerializationError;

/// Longest handler message returned to a caller, in characters.
pub const MAX_ERROR_MESSAGE: usize = 512;

/// Error kind as reported across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PathResolution,
    InvalidScope,
    Serialization,
    ServiceUnavailable,
    PluginNotFound,
    MethodNotFound,
    InvalidArguments,
    MethodExecution,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PathResolution => "path_resolution",
            ErrorKind::InvalidScope => "invalid_scope",
            ErrorKind::Serialization => "serialization",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::PluginNotFound => "plugin_not_found",
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::MethodExecution => "method_execution",
        }
    }

    /// Only an unavailable plugin may succeed when asked again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ServiceUnavailable)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    PathResolution(#[from] PathError),

    #[error(transparent)]
    InvalidScope(#[from] ScopeError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("plugin '{plugin}' is unavailable ({state}): {reason}")]
    ServiceUnavailable {
        plugin: String,
        state: LifecycleState,
        reason: String,
    },

    #[error("plugin '{0}' not found")]
    PluginNotFound(String),

    #[error("plugin '{plugin}' has no method '{method}'")]
    MethodNotFound { plugin: String, method: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{plugin}.{method} failed: {message}")]
    MethodExecution {
        plugin: String,
        method: String,
        message: String,
    },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::PathResolution(_) => ErrorKind::PathResolution,
            BridgeError::InvalidScope(_) => ErrorKind::InvalidScope,
            BridgeError::Serialization(_) => ErrorKind::Serialization,
            BridgeError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            BridgeError::PluginNotFound(_) => ErrorKind::PluginNotFound,
            BridgeError::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            BridgeError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            BridgeError::MethodExecution { .. } => ErrorKind::MethodExecution,
        }
    }

    /// Classifies an error raised by a method body.
    ///
    /// Path and scope errors keep their own kind so callers can tell an
    /// integration bug from a plugin fault. Everything else is a method
    /// failure with a bounded message; the full chain stays in the logs.
    pub fn from_handler(plugin: &str, method: &str, err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<PathError>() {
            return BridgeError::PathResolution(e.clone());
        }
        if let Some(e) = err.downcast_ref::<ScopeError>() {
            return BridgeError::InvalidScope(e.clone());
        }
        if let Some(StoreError::InvalidScope(e)) = err.downcast_ref::<StoreError>() {
            return BridgeError::InvalidScope(e.clone());
        }
        if let Some(e) = err.downcast_ref::<SerializationError>() {
            return BridgeError::Serialization(e.clone());
        }
        BridgeError::MethodExecution {
            plugin: plugin.to_string(),
            method: method.to_string(),
            message: truncate(&format!("{err:#}"), MAX_ERROR_MESSAGE),
        }
    }
}

impl From<LifecycleError> for BridgeError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(id) => BridgeError::PluginNotFound(id),
            LifecycleError::InvalidTransition { ref plugin, state, .. } => {
                BridgeError::ServiceUnavailable {
                    plugin: plugin.to_string(),
                    state,
                    reason: err.to_string(),
                }
            }
            LifecycleError::ResetInProgress { ref plugin, .. } => BridgeError::ServiceUnavailable {
                plugin: plugin.to_string(),
                state: LifecycleState::Resetting,
                reason: err.to_string(),
            },
            LifecycleError::MissingChatKey | LifecycleError::InvalidConfig { .. } => {
                BridgeError::InvalidArguments(err.to_string())
            }
            LifecycleError::ResetFailed { plugin, message, .. } => BridgeError::MethodExecution {
                plugin: plugin.to_string(),
                method: "on_session_reset".to_string(),
                message: truncate(&message, MAX_ERROR_MESSAGE),
            },
        }
    }
}

/// Cuts `message` to at most `max` characters, marking the cut.
fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        None => message.to_string(),
        Some((cut, _)) => format!("{}…", &message[..cut]),
    }
}
