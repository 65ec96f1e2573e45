//! Whole-map JSON persistence for the schedule and history maps.
//!
//! Each map lives in exactly one object. `save` always overwrites the entire
//! object; there is no merge, so concurrent writers on different hosts race
//! with last-writer-wins semantics.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{HistoricalEvent, ScheduledTestItem};
use crate::error::StorageError;
use crate::storage::ObjectStore;

/// Entries keyed by test id.
pub type EntryMap<T> = BTreeMap<String, T>;

/// One JSON object holding a full `testId -> T` map.
pub struct JsonStore<T> {
    objects: Arc<dyn ObjectStore>,
    key: String,
    _entry: PhantomData<fn() -> T>,
}

pub type ScheduleStore = JsonStore<ScheduledTestItem>;
pub type HistoryStore = JsonStore<HistoricalEvent>;

impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            key: self.key.clone(),
            _entry: PhantomData,
        }
    }
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(objects: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            objects,
            key: key.into(),
            _entry: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fetch and parse the map. A missing object is an empty map.
    pub async fn load(&self) -> Result<EntryMap<T>, StorageError> {
        let body = match self.objects.get(&self.key).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                tracing::debug!(key = %self.key, "No stored map, starting empty");
                return Ok(EntryMap::new());
            }
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "Failed to load map");
                return Err(e);
            }
        };
        let map: EntryMap<T> =
            serde_json::from_slice(&body).map_err(|source| StorageError::Serialize {
                key: self.key.clone(),
                source,
            })?;
        tracing::debug!(key = %self.key, entries = map.len(), "Loaded map");
        Ok(map)
    }

    /// Serialize the whole map and overwrite the object.
    pub async fn save(&self, map: &EntryMap<T>) -> Result<(), StorageError> {
        let body = serde_json::to_vec(map).map_err(|source| StorageError::Serialize {
            key: self.key.clone(),
            source,
        })?;
        if let Err(e) = self.objects.put(&self.key, Bytes::from(body)).await {
            tracing::error!(key = %self.key, error = %e, "Failed to save map");
            return Err(e);
        }
        tracing::debug!(key = %self.key, entries = map.len(), "Saved map");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{DaysOfWeek, Recurrence, Schedule, TestMessage};
    use crate::storage::MemoryObjectStore;

    fn item(test_id: &str, schedule: Schedule) -> ScheduledTestItem {
        ScheduledTestItem {
            test_message: TestMessage {
                test_id: test_id.to_string(),
                s3_folder: format!("store/{test_id}"),
                yaml_file: "store.yaml".into(),
                additional_files: vec!["extra.txt".into()],
                test_run_time_mn: Some(5),
                bucket_size_ms: Some(60_000),
                version: "0.5.12".into(),
                env_variables: BTreeMap::from([("KEY".to_string(), "value".to_string())]),
                user_id: Some("owner".into()),
                restart_on_failure: true,
                bypass_parser: Some(false),
            },
            queue_name: "unittests".into(),
            environment_variables_meta: vec![],
            schedule_date: 1_000,
            schedule,
            next_start: 2_000,
            user_id: Some("caller".into()),
        }
    }

    #[test]
    fn test_missing_object_loads_empty() {
        let store = ScheduleStore::new(Arc::new(MemoryObjectStore::new()), "settings/s.json");
        let map = tokio_test::block_on(store.load()).unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = ScheduleStore::new(Arc::new(MemoryObjectStore::new()), "settings/s.json");
        let mut map = EntryMap::new();
        map.insert("one".to_string(), item("one", Schedule::OneOff));
        map.insert(
            "two".to_string(),
            item(
                "two",
                Schedule::Recurring(Recurrence {
                    days_of_week: DaysOfWeek::try_from(vec![1, 3]).unwrap(),
                    end_date: 9_000,
                }),
            ),
        );

        store.save(&map).await.unwrap();
        assert_eq!(store.load().await.unwrap(), map);
    }

    #[tokio::test]
    async fn test_save_empty_then_load_is_empty() {
        let store = HistoryStore::new(Arc::new(MemoryObjectStore::new()), "settings/h.json");
        let mut map = EntryMap::new();
        map.insert(
            "gone".to_string(),
            HistoricalEvent { id: "gone".into(), title: "a.yaml".into(), start: 1, end: 2 },
        );
        store.save(&map).await.unwrap();
        store.save(&EntryMap::new()).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_storage_error() {
        let objects = Arc::new(MemoryObjectStore::new());
        objects
            .put("settings/h.json", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let store = HistoryStore::new(objects, "settings/h.json");
        assert!(matches!(
            store.load().await,
            Err(StorageError::Serialize { .. })
        ));
    }
}
