//! Plugin lifecycle supervision.
//!
//! Each plugin moves through
//! UNLOADED -> INITIALIZING -> {ACTIVE | DEGRADED} -> CLEANING_UP -> UNLOADED.
//! Load, retry and unload hold the plugin's transition lock exclusively;
//! session resets hold it shared, so they run alongside each other and
//! alongside dispatch but never alongside init or cleanup. Dispatch itself
//! never takes the lock: it reads the state and fails fast.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::plugin::schema::SchemaError;
use crate::plugin::{guarded, HookContext, PluginId, PluginRecord, PluginRegistry, SessionContext};
use crate::store::{PluginStore, ScopedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Unloaded,
    Initializing,
    Active,
    Degraded,
    /// Per-session only: one chat's reset hook is running. Never the
    /// plugin's global state.
    Resetting,
    CleaningUp,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unloaded => "UNLOADED",
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Degraded => "DEGRADED",
            LifecycleState::Resetting => "RESETTING",
            LifecycleState::CleaningUp => "CLEANING_UP",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LifecycleState::Unloaded => 0,
            LifecycleState::Initializing => 1,
            LifecycleState::Active => 2,
            LifecycleState::Degraded => 3,
            LifecycleState::Resetting => 4,
            LifecycleState::CleaningUp => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Active,
            3 => LifecycleState::Degraded,
            4 => LifecycleState::Resetting,
            5 => LifecycleState::CleaningUp,
            _ => LifecycleState::Unloaded,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub message: String,
    pub at: String,
}

impl FailureRecord {
    fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: timestamp(Utc::now()),
        }
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Per-plugin lifecycle bookkeeping, embedded in each registry record.
pub(crate) struct LifecycleSlot {
    state: AtomicU8,
    transition: RwLock<()>,
    failure: Mutex<Option<FailureRecord>>,
    session_failures: Mutex<BTreeMap<String, FailureRecord>>,
    resetting: Mutex<HashSet<String>>,
    last_transition: Mutex<DateTime<Utc>>,
}

impl LifecycleSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Unloaded.to_u8()),
            transition: RwLock::new(()),
            failure: Mutex::new(None),
            session_failures: Mutex::new(BTreeMap::new()),
            resetting: Mutex::new(HashSet::new()),
            last_transition: Mutex::new(Utc::now()),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: LifecycleState) {
        self.state.store(state.to_u8(), Ordering::Release);
        *self
            .last_transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn record_failure(&self, failure: Option<FailureRecord>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    fn failure(&self) -> Option<FailureRecord> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_resetting(&self, chat_key: &str) -> bool {
        self.resetting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(chat_key)
    }
}

/// Removes a chat from the in-flight reset set, even if the reset future
/// is dropped midway.
struct ResetGuard<'a> {
    slot: &'a LifecycleSlot,
    chat_key: String,
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.slot
            .resetting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.chat_key);
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("cannot {operation} plugin '{plugin}' while it is {state}")]
    InvalidTransition {
        plugin: PluginId,
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("session reset requires a chat key")]
    MissingChatKey,

    #[error("chat '{chat_key}' of plugin '{plugin}' is already being reset")]
    ResetInProgress { plugin: PluginId, chat_key: String },

    #[error("reset of chat '{chat_key}' failed in plugin '{plugin}': {message}")]
    ResetFailed {
        plugin: PluginId,
        chat_key: String,
        message: String,
    },

    #[error("invalid configuration for plugin '{plugin}': {source}")]
    InvalidConfig {
        plugin: PluginId,
        #[source]
        source: SchemaError,
    },
}

/// Why a plugin refused a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unavailable {
    pub state: LifecycleState,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadOutcome {
    Unloaded,
    /// Already unloaded or being unloaded by someone else.
    NoOp,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginStatus {
    pub id: PluginId,
    pub author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureRecord>,
    pub last_transition: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_sessions: BTreeMap<String, FailureRecord>,
}

pub struct LifecycleSupervisor {
    registry: Arc<PluginRegistry>,
    store: Arc<dyn ScopedStore>,
    retry: RetryPolicy,
}

impl LifecycleSupervisor {
    pub fn new(registry: Arc<PluginRegistry>, store: Arc<dyn ScopedStore>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            store,
            retry,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    fn record(&self, id: &str) -> Result<Arc<PluginRecord>, LifecycleError> {
        self.registry
            .get(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Store handle pinned to one plugin's namespace.
    pub fn store_for(&self, id: &PluginId) -> PluginStore {
        PluginStore::new(id.clone(), self.store.clone())
    }

    fn hook_context(&self, record: &PluginRecord) -> HookContext {
        HookContext {
            plugin: record.id().clone(),
            store: self.store_for(record.id()),
            config: record.config(),
        }
    }

    /// State as seen by one session: RESETTING while that chat's reset
    /// hook runs, the plugin's global state otherwise.
    pub fn session_state(&self, record: &PluginRecord, session: &SessionContext) -> LifecycleState {
        let state = record.state();
        if state == LifecycleState::Active && record.lifecycle.is_resetting(&session.chat_key) {
            LifecycleState::Resetting
        } else {
            state
        }
    }

    /// Gate for the bridge. Anything but ACTIVE is refused immediately.
    pub fn admit(&self, record: &PluginRecord, session: &SessionContext) -> Result<(), Unavailable> {
        let state = self.session_state(record, session);
        let reason = match state {
            LifecycleState::Active => return Ok(()),
            LifecycleState::Unloaded => "plugin is not loaded".to_string(),
            LifecycleState::Initializing => "plugin is still initializing, retry shortly".to_string(),
            LifecycleState::Degraded => match record.lifecycle.failure() {
                Some(f) => format!("plugin failed to initialize: {}", f.message),
                None => "plugin failed to initialize".to_string(),
            },
            LifecycleState::Resetting => "this chat session is being reset, retry shortly".to_string(),
            LifecycleState::CleaningUp => "plugin is shutting down".to_string(),
        };
        Err(Unavailable { state, reason })
    }

    /// UNLOADED -> INITIALIZING -> ACTIVE | DEGRADED.
    ///
    /// An init failure is not an error of `load` itself: the plugin is left
    /// DEGRADED with the failure recorded, and the resulting state returned.
    pub async fn load(&self, id: &str) -> Result<LifecycleState, LifecycleError> {
        let record = self.record(id)?;
        let _transition = record.lifecycle.transition.write().await;

        match record.state() {
            LifecycleState::Unloaded => Ok(self.initialize(&record).await),
            LifecycleState::Active => {
                debug!(plugin = %record.id(), "Plugin already active");
                Ok(LifecycleState::Active)
            }
            state => Err(LifecycleError::InvalidTransition {
                plugin: record.id().clone(),
                state,
                operation: "load",
            }),
        }
    }

    /// Loads every registered plugin that is still unloaded.
    pub async fn load_all(&self) -> Vec<(PluginId, LifecycleState)> {
        let loads = self
            .registry
            .records()
            .into_iter()
            .filter(|r| r.state() == LifecycleState::Unloaded)
            .map(|record| async move {
                let state = self
                    .load(record.id().as_str())
                    .await
                    .unwrap_or_else(|_| record.state());
                (record.id().clone(), state)
            });
        futures::future::join_all(loads).await
    }

    /// DEGRADED -> CLEANING_UP -> UNLOADED -> INITIALIZING -> ...
    pub async fn retry(&self, id: &str) -> Result<LifecycleState, LifecycleError> {
        let record = self.record(id)?;
        let _transition = record.lifecycle.transition.write().await;

        let state = record.state();
        if state != LifecycleState::Degraded {
            return Err(LifecycleError::InvalidTransition {
                plugin: record.id().clone(),
                state,
                operation: "retry",
            });
        }

        info!(plugin = %record.id(), "Retrying degraded plugin");
        self.teardown(&record).await;
        Ok(self.initialize(&record).await)
    }

    /// Runs the reset hook for one chat. Needs the plugin ACTIVE.
    ///
    /// A failing hook is recorded against that chat and reported, but the
    /// plugin stays ACTIVE for everyone else.
    pub async fn reset_session(&self, id: &str, session: &SessionContext) -> Result<(), LifecycleError> {
        if session.chat_key.is_empty() {
            return Err(LifecycleError::MissingChatKey);
        }
        let record = self.record(id)?;
        let _transition = record.lifecycle.transition.read().await;

        let state = record.state();
        if state != LifecycleState::Active {
            return Err(LifecycleError::InvalidTransition {
                plugin: record.id().clone(),
                state,
                operation: "reset a session of",
            });
        }

        let inserted = record
            .lifecycle
            .resetting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.chat_key.clone());
        if !inserted {
            return Err(LifecycleError::ResetInProgress {
                plugin: record.id().clone(),
                chat_key: session.chat_key.clone(),
            });
        }
        let _guard = ResetGuard {
            slot: &record.lifecycle,
            chat_key: session.chat_key.clone(),
        };

        let ctx = self.hook_context(&record);
        let result = guarded(record.plugin().on_session_reset(&ctx, session)).await;

        let mut failures = record
            .lifecycle
            .session_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                failures.remove(&session.chat_key);
                info!(plugin = %record.id(), chat = %session.chat_key, "Session reset");
                Ok(())
            }
            Err(e) => {
                warn!(plugin = %record.id(), chat = %session.chat_key, "Session reset failed: {e:#}");
                failures.insert(session.chat_key.clone(), FailureRecord::now(format!("{e:#}")));
                Err(LifecycleError::ResetFailed {
                    plugin: record.id().clone(),
                    chat_key: session.chat_key.clone(),
                    message: format!("{e:#}"),
                })
            }
        }
    }

    /// Runs cleanup once and returns the plugin to UNLOADED.
    ///
    /// Unloading an UNLOADED plugin, or one another unload is already
    /// cleaning up, does nothing. A CLEANING_UP plugin may also be in the
    /// middle of `retry`, so the state is only judged under the lock.
    pub async fn unload(&self, id: &str) -> Result<UnloadOutcome, LifecycleError> {
        let record = self.record(id)?;
        let _transition = record.lifecycle.transition.write().await;
        if record.state() == LifecycleState::Unloaded {
            return Ok(UnloadOutcome::NoOp);
        }

        self.teardown(&record).await;
        Ok(UnloadOutcome::Unloaded)
    }

    /// Unloads everything, carrying on past individual failures.
    pub async fn unload_all(&self) {
        let unloads = self.registry.records().into_iter().map(|record| async move {
            if let Err(e) = self.unload(record.id().as_str()).await {
                error!(plugin = %record.id(), "Unload failed: {e}");
            }
        });
        futures::future::join_all(unloads).await;
        info!("All plugins unloaded");
    }

    /// Re-resolves a plugin's configuration and swaps it in. Calls already
    /// running keep the snapshot they started with.
    pub fn update_config(
        &self,
        id: &str,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), LifecycleError> {
        let record = self.record(id)?;
        let resolved = record
            .schema()
            .resolve(settings)
            .map_err(|source| LifecycleError::InvalidConfig {
                plugin: record.id().clone(),
                source,
            })?;
        record.replace_config(Arc::new(resolved));
        info!(plugin = %record.id(), "Configuration reloaded");
        Ok(())
    }

    pub fn status(&self, id: &str) -> Option<PluginStatus> {
        self.registry.get(id).map(|record| status_of(&record))
    }

    pub fn status_all(&self) -> Vec<PluginStatus> {
        self.registry.records().iter().map(|r| status_of(r)).collect()
    }

    /// Init with retries. Caller holds the transition lock.
    async fn initialize(&self, record: &PluginRecord) -> LifecycleState {
        record.lifecycle.set(LifecycleState::Initializing);
        let ctx = self.hook_context(record);

        let mut attempt = 1;
        loop {
            match guarded(record.plugin().init(&ctx)).await {
                Ok(()) => {
                    record.lifecycle.record_failure(None);
                    record.lifecycle.set(LifecycleState::Active);
                    info!(plugin = %record.id(), attempt, "Plugin active");
                    return LifecycleState::Active;
                }
                Err(e) => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        warn!(
                            plugin = %record.id(),
                            attempt,
                            "Init failed: {e:#}, retrying in {}ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        error!(plugin = %record.id(), attempt, "Init failed, plugin degraded: {e:#}");
                        record.lifecycle.record_failure(Some(FailureRecord::now(format!("{e:#}"))));
                        record.lifecycle.set(LifecycleState::Degraded);
                        return LifecycleState::Degraded;
                    }
                },
            }
        }
    }

    /// Cleanup, then UNLOADED. Caller holds the transition lock.
    async fn teardown(&self, record: &PluginRecord) {
        record.lifecycle.set(LifecycleState::CleaningUp);
        let ctx = self.hook_context(record);

        if let Err(e) = guarded(record.plugin().cleanup(&ctx)).await {
            error!(plugin = %record.id(), "Cleanup failed: {e:#}");
        }

        record
            .lifecycle
            .session_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        record.lifecycle.set(LifecycleState::Unloaded);
        info!(plugin = %record.id(), "Plugin unloaded");
    }
}

fn status_of(record: &PluginRecord) -> PluginStatus {
    let slot = &record.lifecycle;
    PluginStatus {
        id: record.id().clone(),
        author: record.identity().author.clone(),
        description: record.description().to_string(),
        state: record.state(),
        last_error: slot.failure(),
        last_transition: timestamp(
            *slot
                .last_transition
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        ),
        failed_sessions: slot
            .session_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
    }
}
