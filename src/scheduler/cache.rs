//! Two-level cache in front of a [`JsonStore`].
//!
//! The local reference belongs to one cache instance. The shared slot is
//! handed in by whoever builds the cache and can be reused by every cache in
//! the process, so a handler constructed later can skip the storage round
//! trip. Neither level is guaranteed to match what another process has
//! persisted; callers that need that call [`SchedulerCache::force_reload`].
//!
//! Maps are immutable `Arc` snapshots. Changes go through [`SchedulerCache::stage`]
//! (in memory only, marks the cache dirty) or [`SchedulerCache::commit`]
//! (saved first, installed only if the save succeeded).
//!
//! The shared slot also owns the mutation lock. Every cache built on the
//! same slot takes the same lock for load-mutate-save, so writers in one
//! process never interleave.

use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::store::{EntryMap, JsonStore};
use crate::error::StorageError;

/// Process-scoped holder for the most recently loaded map.
pub trait SharedStateProvider<T>: Send + Sync {
    fn get(&self) -> Option<Arc<EntryMap<T>>>;
    fn set(&self, map: Option<Arc<EntryMap<T>>>);
    /// Lock held around every load-mutate-save of this map.
    fn mutation_lock(&self) -> Arc<AsyncMutex<()>>;
}

/// Default [`SharedStateProvider`]: a mutex-guarded slot.
pub struct SharedSlot<T> {
    slot: Mutex<Option<Arc<EntryMap<T>>>>,
    writer: Arc<AsyncMutex<()>>,
}

impl<T> SharedSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            writer: Arc::new(AsyncMutex::new(())),
        }
    }
}

impl<T> Default for SharedSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> SharedStateProvider<T> for SharedSlot<T> {
    fn get(&self) -> Option<Arc<EntryMap<T>>> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set(&self, map: Option<Arc<EntryMap<T>>>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = map;
    }

    fn mutation_lock(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.writer)
    }
}

pub struct SchedulerCache<T> {
    store: JsonStore<T>,
    shared: Arc<dyn SharedStateProvider<T>>,
    local: Option<Arc<EntryMap<T>>>,
    dirty: bool,
}

impl<T> SchedulerCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: JsonStore<T>, shared: Arc<dyn SharedStateProvider<T>>) -> Self {
        Self {
            store,
            shared,
            local: None,
            dirty: false,
        }
    }

    pub fn store(&self) -> &JsonStore<T> {
        &self.store
    }

    /// The process-wide writer lock of the shared slot.
    pub fn mutation_lock(&self) -> Arc<AsyncMutex<()>> {
        self.shared.mutation_lock()
    }

    /// Adopt the shared map if there is one, otherwise load from storage and
    /// publish the result to both levels.
    pub async fn ensure_loaded(&mut self) -> Result<Arc<EntryMap<T>>, StorageError> {
        if let Some(shared) = self.shared.get() {
            // Staged changes live in `local` until persisted; never drop them.
            if !self.dirty {
                self.local = Some(Arc::clone(&shared));
            }
        }
        if let Some(local) = &self.local {
            return Ok(Arc::clone(local));
        }

        let map = Arc::new(self.store.load().await?);
        tracing::info!(key = %self.store.key(), entries = map.len(), "Cache populated from storage");
        self.install(Arc::clone(&map));
        Ok(map)
    }

    /// Drop both levels and load fresh from storage. Staged changes are lost.
    pub async fn force_reload(&mut self) -> Result<Arc<EntryMap<T>>, StorageError> {
        if self.dirty {
            tracing::warn!(key = %self.store.key(), "Discarding unsaved changes on reload");
        }
        self.clear();
        self.ensure_loaded().await
    }

    /// Forget both levels without touching storage.
    pub fn clear(&mut self) {
        self.local = None;
        self.shared.set(None);
        self.dirty = false;
    }

    /// Current map without loading. `None` until the first load.
    pub fn snapshot(&self) -> Option<Arc<EntryMap<T>>> {
        self.local.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Apply `f` in memory only. The change is visible to this process but
    /// not durable until [`persist`](Self::persist).
    pub async fn stage<R>(
        &mut self,
        f: impl FnOnce(&mut EntryMap<T>) -> R,
    ) -> Result<R, StorageError> {
        let current = self.ensure_loaded().await?;
        let mut next = (*current).clone();
        let out = f(&mut next);
        self.install(Arc::new(next));
        self.dirty = true;
        Ok(out)
    }

    /// Save the current map if it has staged changes.
    pub async fn persist(&mut self) -> Result<bool, StorageError> {
        if !self.dirty {
            return Ok(false);
        }
        let current = self.ensure_loaded().await?;
        self.store.save(&current).await?;
        self.dirty = false;
        Ok(true)
    }

    /// Apply `f` to a copy, save the copy, then install it. On a save
    /// failure the cached map is left as it was.
    pub async fn commit<R>(
        &mut self,
        f: impl FnOnce(&mut EntryMap<T>) -> R,
    ) -> Result<R, StorageError> {
        let current = self.ensure_loaded().await?;
        let mut next = (*current).clone();
        let out = f(&mut next);
        self.store.save(&next).await?;
        self.install(Arc::new(next));
        self.dirty = false;
        Ok(out)
    }

    fn install(&mut self, map: Arc<EntryMap<T>>) {
        self.shared.set(Some(Arc::clone(&map)));
        self.local = Some(map);
    }
}
