use async_trait::async_trait;
use dashmap::DashMap;

use super::{Scope, ScopedStore, StoreError, StoreKey};
use crate::plugin::PluginId;

/// In-process store. Nothing survives a restart.
///
/// `DashMap` shards its table, so writers on unrelated keys only meet
/// for the instant it takes to swap a shard entry, and each entry is
/// replaced whole.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<StoreKey, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ScopedStore for MemoryStore {
    async fn set(&self, key: &StoreKey, value: &str) -> Result<bool, StoreError> {
        self.entries.insert(key.clone(), value.to_string());
        Ok(true)
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self, plugin: &PluginId, scope: &Scope) -> Result<usize, StoreError> {
        scope.validate()?;
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let doomed = &key.plugin == plugin && &key.scope == scope;
            if doomed {
                removed += 1;
            }
            !doomed
        });
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
