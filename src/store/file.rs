//! Filesystem-backed store, one file per entry.
//!
//! Layout:
//!   {root}/{plugin}/global/_/{key}
//!   {root}/{plugin}/user/{user_id}/{key}
//!   {root}/{plugin}/chat/{chat_id}/{key}
//!
//! Scope ids and keys are hex-encoded (or hashed when long), so any
//! caller-chosen string maps to one safe file name.
//!
//! Writes go to a temp file that is renamed over the entry, so readers
//! only ever see a complete old or new value. A write that fails or is
//! cancelled midway leaves at most a stray temp file, never a torn entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{Scope, ScopedStore, StoreError, StoreKey};
use crate::plugin::PluginId;

/// Segments longer than this are hashed to stay under file name limits
const MAX_PLAIN_SEGMENT: usize = 100;

/// Prefix of in-flight temp files; never a valid encoded segment
const TEMP_PREFIX: &str = ".tmp-";

type LockMap = DashMap<PathBuf, Arc<Mutex<()>>>;

pub struct FileStore {
    root: PathBuf,
    /// Writer locks, one per entry path with a writer in flight
    locks: LockMap,
}

/// Held while one entry is mutated. Dropping it, on completion or
/// cancellation, frees the map slot once no other writer waits on it.
struct EntryLock<'a> {
    locks: &'a LockMap,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl FileStore {
    pub fn open(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        info!("File store opened at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            locks: DashMap::new(),
        })
    }

    fn scope_dir(&self, plugin: &PluginId, scope: &Scope) -> PathBuf {
        let id = match scope {
            Scope::Global => "_".to_string(),
            _ => encode_segment(scope.scope_id()),
        };
        self.root
            .join(plugin.as_str())
            .join(scope.kind().as_str())
            .join(id)
    }

    fn entry_path(&self, key: &StoreKey) -> PathBuf {
        self.scope_dir(key.plugin(), key.scope())
            .join(encode_segment(key.key()))
    }

    async fn lock_entry(&self, path: &Path) -> EntryLock<'_> {
        let mut entry = EntryLock {
            locks: &self.locks,
            path: path.to_path_buf(),
            guard: None,
        };
        let mutex = self.locks.entry(path.to_path_buf()).or_default().clone();
        entry.guard = Some(mutex.lock_owned().await);
        entry
    }
}

/// Hex for short strings, `~` + SHA-1 hex for long ones. `~` never
/// appears in hex, so the two forms cannot collide.
fn encode_segment(raw: &str) -> String {
    if raw.len() <= MAX_PLAIN_SEGMENT {
        hex::encode(raw)
    } else {
        format!("~{}", hex::encode(Sha1::digest(raw.as_bytes())))
    }
}

#[async_trait]
impl ScopedStore for FileStore {
    async fn set(&self, key: &StoreKey, value: &str) -> Result<bool, StoreError> {
        let path = self.entry_path(key);
        let _lock = self.lock_entry(&path).await;

        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;

        let temp = dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp, value.as_bytes()).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!("Stored {} bytes at {}", value.len(), path.display());
        Ok(true)
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        // Renames are atomic, so readers need no lock.
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let path = self.entry_path(key);
        let _lock = self.lock_entry(&path).await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, plugin: &PluginId, scope: &Scope) -> Result<usize, StoreError> {
        scope.validate()?;
        let dir = self.scope_dir(plugin, scope);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let path = entry.path();
            let _lock = self.lock_entry(&path).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Could not remove store entry {}: {e}", path.display());
                    return Err(e.into());
                }
            }
        }

        debug!("Cleared {removed} entries from {}", dir.display());
        Ok(removed)
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
