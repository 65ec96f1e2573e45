//! Historical calendar: finished runs, kept for a bounded retention window.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::cache::{SchedulerCache, SharedStateProvider};
use super::store::{EntryMap, HistoryStore};
use super::types::{now_ms, HistoricalEvent, TestStatusRecord, ONE_DAY_MS};
use crate::error::SchedulerResult;
use crate::storage::TestStatusStore;

/// Counts from one janitor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HistoryTick {
    pub merged: usize,
    pub saved: bool,
    pub deleted: usize,
}

struct JanitorState {
    cache: SchedulerCache<HistoricalEvent>,
    /// Status records updated before this are already in the saved map.
    watermark: Option<i64>,
    /// Time of the last search whose results are staged but not saved yet.
    pending_watermark: Option<i64>,
}

impl JanitorState {
    /// Move the watermark forward once staged search results are durable.
    fn settle(&mut self) {
        if !self.cache.is_dirty() {
            if let Some(searched) = self.pending_watermark.take() {
                self.watermark = Some(searched);
            }
        }
    }
}

pub struct HistoricalJanitor {
    state: Mutex<JanitorState>,
    /// Writer lock shared with every janitor on the same history slot.
    /// Always taken before `state`.
    writer: Arc<Mutex<()>>,
    status: Arc<dyn TestStatusStore>,
    retention_days: u32,
}

fn retention_cutoff(now: i64, retention_days: u32) -> i64 {
    now - i64::from(retention_days) * ONE_DAY_MS
}

fn to_event(test_id: &str, record: &TestStatusRecord) -> HistoricalEvent {
    HistoricalEvent {
        id: test_id.to_string(),
        title: record.yaml_file.clone().unwrap_or_else(|| test_id.to_string()),
        start: record.start_time,
        end: record.end_time.unwrap_or(record.start_time),
    }
}

impl HistoricalJanitor {
    pub fn new(
        store: HistoryStore,
        shared: Arc<dyn SharedStateProvider<HistoricalEvent>>,
        status: Arc<dyn TestStatusStore>,
        retention_days: u32,
    ) -> Self {
        let cache = SchedulerCache::new(store, shared);
        Self {
            writer: cache.mutation_lock(),
            state: Mutex::new(JanitorState {
                cache,
                watermark: None,
                pending_watermark: None,
            }),
            status,
            retention_days,
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Load the history map, from storage when `force` is set. A forced
    /// load drops unsaved search results; the next search finds them again.
    pub async fn load_historical(&self, force: bool) -> SchedulerResult<Arc<EntryMap<HistoricalEvent>>> {
        if !force {
            return Ok(self.state.lock().await.cache.ensure_loaded().await?);
        }
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        state.pending_watermark = None;
        Ok(state.cache.force_reload().await?)
    }

    /// Every event, oldest first.
    pub async fn events(&self) -> SchedulerResult<Vec<HistoricalEvent>> {
        let map = self.load_historical(false).await?;
        let mut events: Vec<HistoricalEvent> = map.values().cloned().collect();
        events.sort_by_key(|e| (e.start, e.id.clone()));
        Ok(events)
    }

    /// Record a finished run straight away.
    pub async fn add_historical_test(
        &self,
        test_id: &str,
        yaml_file: &str,
        start: i64,
        end: i64,
    ) -> SchedulerResult<()> {
        let event = HistoricalEvent {
            id: test_id.to_string(),
            title: yaml_file.to_string(),
            start,
            end,
        };
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        state
            .cache
            .commit(|map| map.insert(event.id.clone(), event))
            .await?;
        state.settle();
        info!(test_id = %test_id, "Historical event added");
        Ok(())
    }

    /// Returns whether an event was removed.
    pub async fn remove_historical_test(&self, test_id: &str) -> SchedulerResult<bool> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        let present = state.cache.ensure_loaded().await?.contains_key(test_id);
        if !present {
            return Ok(false);
        }
        state.cache.commit(|map| map.remove(test_id)).await?;
        state.settle();
        info!(test_id = %test_id, "Historical event removed");
        Ok(true)
    }

    /// Merge runs that finished since the last search into the history map.
    /// Changes are staged; [`save_historical`](Self::save_historical) makes
    /// them durable. Returns how many events were added or changed.
    pub async fn run_historical_search(&self) -> SchedulerResult<usize> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        let started = now_ms();
        let cutoff = retention_cutoff(started, self.retention_days);
        let since = state.watermark.unwrap_or(cutoff);

        let records = self.status.list_updated_since(since).await?;
        let current = state.cache.ensure_loaded().await?;
        let found: Vec<HistoricalEvent> = records
            .iter()
            .filter(|(_, record)| record.status.is_finished())
            .map(|(test_id, record)| to_event(test_id, record))
            .filter(|event| event.start >= cutoff)
            .filter(|event| current.get(&event.id) != Some(event))
            .collect();

        let merged = found.len();
        if merged > 0 {
            state
                .cache
                .stage(|map| {
                    for event in found {
                        map.insert(event.id.clone(), event);
                    }
                })
                .await?;
        }
        if state.cache.is_dirty() {
            state.pending_watermark = Some(started);
        } else {
            state.watermark = Some(started);
        }
        debug!(since, scanned = records.len(), merged, "Historical search finished");
        Ok(merged)
    }

    /// Persist staged history changes. Returns whether anything was written.
    pub async fn save_historical(&self) -> SchedulerResult<bool> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        let saved = state.cache.persist().await?;
        state.settle();
        Ok(saved)
    }

    /// Drop events that started more than `retention_days` ago. Saves only
    /// when something was removed.
    pub async fn run_historical_delete(&self, retention_days: u32) -> SchedulerResult<usize> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.lock().await;
        let cutoff = retention_cutoff(now_ms(), retention_days);
        let current = state.cache.ensure_loaded().await?;
        let expired = current.values().filter(|e| e.start < cutoff).count();
        if expired == 0 {
            return Ok(0);
        }
        state
            .cache
            .commit(|map| map.retain(|_, event| event.start >= cutoff))
            .await?;
        state.settle();
        info!(removed = expired, retention_days, "Pruned historical events");
        Ok(expired)
    }

    /// Search, save, prune.
    pub async fn tick(&self) -> SchedulerResult<HistoryTick> {
        let merged = self.run_historical_search().await?;
        let saved = self.save_historical().await?;
        let deleted = self.run_historical_delete(self.retention_days).await?;
        Ok(HistoryTick { merged, saved, deleted })
    }
}
