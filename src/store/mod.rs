//! Scoped key/value persistence for plugin state.
//!
//! Every entry is addressed by a composite key: plugin module, scope
//! (global, one user, or one chat) and a caller-chosen store key. Scopes
//! never cross: a chat entry is invisible to user and global reads, even
//! when the chat id and user id are the same string.
//!
//! Values are opaque text. The store never interprets them.

pub mod file;
pub mod memory;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::plugin::PluginId;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("unknown scope '{0}' (expected global, user or chat)")]
    UnknownKind(String),

    #[error("{0} scope requires a non-empty scope id")]
    MissingScopeId(ScopeKind),

    #[error("global scope takes no scope id, got '{0}'")]
    UnexpectedScopeId(String),

    #[error("at most one of chat key and user key may be set")]
    AmbiguousScope,

    #[error("store key must not be empty")]
    EmptyKey,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidScope(#[from] ScopeError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt entry at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Global,
    User,
    Chat,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::User => "user",
            ScopeKind::Chat => "chat",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(ScopeKind::Global),
            "user" => Ok(ScopeKind::User),
            "chat" => Ok(ScopeKind::Chat),
            other => Err(ScopeError::UnknownKind(other.to_string())),
        }
    }
}

/// Isolation boundary of a stored entry, with its validated scope id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    User(String),
    Chat(String),
}

impl Scope {
    /// `scope_id` must be empty for global and non-empty otherwise.
    pub fn new(kind: ScopeKind, scope_id: &str) -> Result<Self, ScopeError> {
        match kind {
            ScopeKind::Global if scope_id.is_empty() => Ok(Scope::Global),
            ScopeKind::Global => Err(ScopeError::UnexpectedScopeId(scope_id.to_string())),
            _ if scope_id.is_empty() => Err(ScopeError::MissingScopeId(kind)),
            ScopeKind::User => Ok(Scope::User(scope_id.to_string())),
            ScopeKind::Chat => Ok(Scope::Chat(scope_id.to_string())),
        }
    }

    /// The plugin calling convention: chat key, user key, or neither.
    pub fn from_keys(chat_key: Option<&str>, user_key: Option<&str>) -> Result<Self, ScopeError> {
        let chat_key = chat_key.filter(|k| !k.is_empty());
        let user_key = user_key.filter(|k| !k.is_empty());
        match (chat_key, user_key) {
            (Some(_), Some(_)) => Err(ScopeError::AmbiguousScope),
            (Some(chat), None) => Ok(Scope::Chat(chat.to_string())),
            (None, Some(user)) => Ok(Scope::User(user.to_string())),
            (None, None) => Ok(Scope::Global),
        }
    }

    /// Scopes built by hand skip `new`; backends check them again here.
    pub fn validate(&self) -> Result<(), ScopeError> {
        match self {
            Scope::Global => Ok(()),
            Scope::User(id) | Scope::Chat(id) if id.is_empty() => Err(ScopeError::MissingScopeId(self.kind())),
            Scope::User(_) | Scope::Chat(_) => Ok(()),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Global => ScopeKind::Global,
            Scope::User(_) => ScopeKind::User,
            Scope::Chat(_) => ScopeKind::Chat,
        }
    }

    pub fn scope_id(&self) -> &str {
        match self {
            Scope::Global => "",
            Scope::User(id) | Scope::Chat(id) => id,
        }
    }
}

/// Composite key of a store entry. Unique per entry.
///
/// Only built through `new`, so every key a backend sees has a valid scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    plugin: PluginId,
    scope: Scope,
    key: String,
}

impl StoreKey {
    pub fn new(plugin: PluginId, scope: Scope, key: impl Into<String>) -> Result<Self, ScopeError> {
        scope.validate()?;
        let key = key.into();
        if key.is_empty() {
            return Err(ScopeError::EmptyKey);
        }
        Ok(Self { plugin, scope, key })
    }

    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Backend contract.
///
/// Operations on different keys must not block one another; operations
/// on the same key are linearizable and never expose a torn value.
#[async_trait]
pub trait ScopedStore: Send + Sync {
    /// Upsert. Returns true once the value is committed.
    async fn set(&self, key: &StoreKey, value: &str) -> Result<bool, StoreError>;

    /// Missing keys are `Ok(None)`, not an error.
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError>;

    /// True iff an entry existed and was removed.
    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError>;

    /// Removes every entry of one plugin scope; returns how many.
    async fn clear(&self, plugin: &PluginId, scope: &Scope) -> Result<usize, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Opens the backend selected in config.
pub fn open(config: &StoreConfig) -> anyhow::Result<Arc<dyn ScopedStore>> {
    let store: Arc<dyn ScopedStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(&config.path)?),
    };
    info!("Scoped store opened ({} backend)", store.backend());
    Ok(store)
}

// ── Plugin-facing handle ─────────────────────────────────

/// A plugin's view of the store, pinned to its own module name.
///
/// `chat_key`/`user_key` follow the plugin calling convention: at most
/// one may be non-empty, and both empty selects the global scope.
/// Mutations report `1`/`0` like the call sites in plugin bodies expect.
#[derive(Clone)]
pub struct PluginStore {
    plugin: PluginId,
    inner: Arc<dyn ScopedStore>,
}

impl PluginStore {
    pub fn new(plugin: PluginId, inner: Arc<dyn ScopedStore>) -> Self {
        Self { plugin, inner }
    }

    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    fn key(&self, scope: Scope, key: &str) -> Result<StoreKey, StoreError> {
        Ok(StoreKey::new(self.plugin.clone(), scope, key)?)
    }

    pub async fn set(
        &self,
        chat_key: Option<&str>,
        user_key: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<u8, StoreError> {
        let scope = Scope::from_keys(chat_key, user_key)?;
        Ok(self.set_in(scope, key, value).await? as u8)
    }

    pub async fn get(
        &self,
        chat_key: Option<&str>,
        user_key: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let scope = Scope::from_keys(chat_key, user_key)?;
        self.get_in(scope, key).await
    }

    pub async fn delete(
        &self,
        chat_key: Option<&str>,
        user_key: Option<&str>,
        key: &str,
    ) -> Result<u8, StoreError> {
        let scope = Scope::from_keys(chat_key, user_key)?;
        Ok(self.delete_in(scope, key).await? as u8)
    }

    async fn set_in(&self, scope: Scope, key: &str, value: &str) -> Result<bool, StoreError> {
        self.inner.set(&self.key(scope, key)?, value).await
    }

    async fn get_in(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(&self.key(scope, key)?).await
    }

    async fn delete_in(&self, scope: Scope, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(&self.key(scope, key)?).await
    }

    pub async fn clear(&self, scope: &Scope) -> Result<usize, StoreError> {
        self.inner.clear(&self.plugin, scope).await
    }
}

/// Behavioral checks every backend must pass.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;

    fn plugin() -> PluginId {
        PluginId::new("notes").unwrap()
    }

    fn key(scope: Scope, k: &str) -> StoreKey {
        StoreKey::new(plugin(), scope, k).unwrap()
    }

    pub async fn set_get_delete(store: Arc<dyn ScopedStore>) {
        let k = key(Scope::Chat("chat_7".into()), "shopping");
        assert_eq!(store.get(&k).await.unwrap(), None);
        assert!(!store.delete(&k).await.unwrap());

        assert!(store.set(&k, "milk,eggs").await.unwrap());
        assert_eq!(store.get(&k).await.unwrap().as_deref(), Some("milk,eggs"));

        assert!(store.set(&k, "bread").await.unwrap());
        assert_eq!(store.get(&k).await.unwrap().as_deref(), Some("bread"));

        assert!(store.delete(&k).await.unwrap());
        assert_eq!(store.get(&k).await.unwrap(), None);
        assert!(!store.delete(&k).await.unwrap());
    }

    pub async fn scopes_never_cross(store: Arc<dyn ScopedStore>) {
        store.set(&key(Scope::Chat("7".into()), "k"), "chat").await.unwrap();

        assert_eq!(store.get(&key(Scope::User("7".into()), "k")).await.unwrap(), None);
        assert_eq!(store.get(&key(Scope::Global, "k")).await.unwrap(), None);
        assert_eq!(store.get(&key(Scope::Chat("8".into()), "k")).await.unwrap(), None);

        let other_plugin = StoreKey::new(PluginId::new("files").unwrap(), Scope::Chat("7".into()), "k").unwrap();
        assert_eq!(store.get(&other_plugin).await.unwrap(), None);

        store.set(&key(Scope::User("7".into()), "k"), "user").await.unwrap();
        store.set(&key(Scope::Global, "k"), "global").await.unwrap();
        assert_eq!(store.get(&key(Scope::Chat("7".into()), "k")).await.unwrap().as_deref(), Some("chat"));
        assert_eq!(store.get(&key(Scope::User("7".into()), "k")).await.unwrap().as_deref(), Some("user"));
        assert_eq!(store.get(&key(Scope::Global, "k")).await.unwrap().as_deref(), Some("global"));
    }

    pub async fn values_round_trip_exactly(store: Arc<dyn ScopedStore>) {
        let k = key(Scope::Global, "blob");
        for value in ["", " leading and trailing ", "line1\nline2\r\n", "{\"json\":true}", "ünï ✓ 😀", "\0nul"] {
            store.set(&k, value).await.unwrap();
            assert_eq!(store.get(&k).await.unwrap().as_deref(), Some(value));
        }
    }

    pub async fn clear_removes_one_scope(store: Arc<dyn ScopedStore>) {
        let chat = Scope::Chat("c1".into());
        store.set(&key(chat.clone(), "a"), "1").await.unwrap();
        store.set(&key(chat.clone(), "b"), "2").await.unwrap();
        store.set(&key(Scope::Chat("c2".into()), "a"), "3").await.unwrap();
        store.set(&key(Scope::User("c1".into()), "a"), "4").await.unwrap();

        assert_eq!(store.clear(&plugin(), &chat).await.unwrap(), 2);
        assert_eq!(store.get(&key(chat.clone(), "a")).await.unwrap(), None);
        assert_eq!(store.get(&key(Scope::Chat("c2".into()), "a")).await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.get(&key(Scope::User("c1".into()), "a")).await.unwrap().as_deref(), Some("4"));
        assert_eq!(store.clear(&plugin(), &chat).await.unwrap(), 0);
    }

    /// Racing writers on one key leave exactly one of their values.
    pub async fn concurrent_sets_resolve_to_one_value(store: Arc<dyn ScopedStore>) {
        let a = "a".repeat(64 * 1024);
        let b = "b".repeat(64 * 1024);
        for _ in 0..20 {
            let k = key(Scope::Global, "k");
            let (s1, s2) = (store.clone(), store.clone());
            let (k1, k2) = (k.clone(), k.clone());
            let (va, vb) = (a.clone(), b.clone());
            let t1 = tokio::spawn(async move { s1.set(&k1, &va).await });
            let t2 = tokio::spawn(async move { s2.set(&k2, &vb).await });
            assert!(t1.await.unwrap().unwrap());
            assert!(t2.await.unwrap().unwrap());

            let got = store.get(&k).await.unwrap().expect("value must be present");
            assert!(got == a || got == b, "torn value of length {}", got.len());
        }
    }

    /// Readers racing a writer only ever observe complete values.
    pub async fn readers_never_see_torn_values(store: Arc<dyn ScopedStore>) {
        let k = key(Scope::User("u".into()), "doc");
        let old = "o".repeat(32 * 1024);
        let new = "n".repeat(48 * 1024);
        store.set(&k, &old).await.unwrap();

        let writer = {
            let (store, k, new) = (store.clone(), k.clone(), new.clone());
            tokio::spawn(async move {
                for _ in 0..10 {
                    store.set(&k, &new).await.unwrap();
                }
            })
        };
        for _ in 0..50 {
            let got = store.get(&k).await.unwrap().expect("never absent");
            assert!(got == old || got == new, "torn read of length {}", got.len());
        }
        writer.await.unwrap();
    }

    /// Many distinct keys written in parallel all land.
    pub async fn distinct_keys_in_parallel(store: Arc<dyn ScopedStore>) {
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let k = key(Scope::Chat(format!("chat_{i}")), &format!("key_{i}"));
                    store.set(&k, &format!("value_{i}")).await
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap().unwrap());
        }
        for i in 0..32 {
            let k = key(Scope::Chat(format!("chat_{i}")), &format!("key_{i}"));
            assert_eq!(store.get(&k).await.unwrap(), Some(format!("value_{i}")));
        }
    }
}
