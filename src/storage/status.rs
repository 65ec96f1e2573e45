//! Per-test status records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;

use super::{with_conn, Pool};
use crate::error::StatusError;
use crate::scheduler::types::{now_ms, TestStatusRecord};

#[async_trait]
pub trait TestStatusStore: Send + Sync {
    async fn write(&self, test_id: &str, record: &TestStatusRecord) -> Result<(), StatusError>;

    /// Missing records are `StatusError::NotFound`.
    async fn read(&self, test_id: &str) -> Result<TestStatusRecord, StatusError>;

    /// Records written at or after `since_ms`, oldest first.
    async fn list_updated_since(
        &self,
        since_ms: i64,
    ) -> Result<Vec<(String, TestStatusRecord)>, StatusError>;
}

#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: Pool,
}

impl SqliteStatusStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TestStatusStore for SqliteStatusStore {
    async fn write(&self, test_id: &str, record: &TestStatusRecord) -> Result<(), StatusError> {
        let backend = |message: String| StatusError::Backend {
            test_id: test_id.to_string(),
            message,
        };
        let json = serde_json::to_string(record).map_err(|e| backend(e.to_string()))?;
        let status = format!("{:?}", record.status);
        let errors_count = record.errors.as_ref().map_or(0, |e| e.len() as i64);
        let id = test_id.to_string();
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO test_status (test_id, status, record_json, updated_at, errors_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(test_id) DO UPDATE SET
                    status = excluded.status,
                    record_json = excluded.record_json,
                    updated_at = excluded.updated_at,
                    errors_count = excluded.errors_count",
                params![id, status, json, now_ms(), errors_count],
            )
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn read(&self, test_id: &str) -> Result<TestStatusRecord, StatusError> {
        let id = test_id.to_string();
        let json: Option<String> = with_conn(&self.pool, move |conn| {
            conn.query_row(
                "SELECT record_json FROM test_status WHERE test_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|message| StatusError::Backend {
            test_id: test_id.to_string(),
            message,
        })?;

        let json = json.ok_or_else(|| StatusError::NotFound {
            test_id: test_id.to_string(),
        })?;
        serde_json::from_str(&json).map_err(|e| StatusError::Backend {
            test_id: test_id.to_string(),
            message: e.to_string(),
        })
    }

    async fn list_updated_since(
        &self,
        since_ms: i64,
    ) -> Result<Vec<(String, TestStatusRecord)>, StatusError> {
        let rows: Vec<(String, String)> = with_conn(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT test_id, record_json FROM test_status
                     WHERE updated_at >= ?1 ORDER BY updated_at",
                )
                .map_err(|e| e.to_string())?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![since_ms], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?;
            Ok(rows)
        })
        .await
        .map_err(|message| StatusError::Backend {
            test_id: "*".to_string(),
            message,
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for (test_id, json) in rows {
            match serde_json::from_str::<TestStatusRecord>(&json) {
                Ok(record) => records.push((test_id, record)),
                Err(e) => tracing::error!(test_id = %test_id, error = %e, "Failed to parse status record"),
            }
        }
        Ok(records)
    }
}

/// Status records held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<String, (i64, TestStatusRecord)>>,
    failing: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Insert a record with an explicit update time.
    pub async fn insert_at(&self, test_id: &str, record: TestStatusRecord, updated_at: i64) {
        self.records
            .lock()
            .await
            .insert(test_id.to_string(), (updated_at, record));
    }
}

#[async_trait]
impl TestStatusStore for MemoryStatusStore {
    async fn write(&self, test_id: &str, record: &TestStatusRecord) -> Result<(), StatusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StatusError::Backend {
                test_id: test_id.to_string(),
                message: "status store unavailable".to_string(),
            });
        }
        self.insert_at(test_id, record.clone(), now_ms()).await;
        Ok(())
    }

    async fn read(&self, test_id: &str) -> Result<TestStatusRecord, StatusError> {
        self.records
            .lock()
            .await
            .get(test_id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| StatusError::NotFound {
                test_id: test_id.to_string(),
            })
    }

    async fn list_updated_since(
        &self,
        since_ms: i64,
    ) -> Result<Vec<(String, TestStatusRecord)>, StatusError> {
        let mut found: Vec<(i64, String, TestStatusRecord)> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|(_, (updated_at, _))| *updated_at >= since_ms)
            .map(|(id, (updated_at, record))| (*updated_at, id.clone(), record.clone()))
            .collect();
        found.sort_by_key(|(updated_at, _, _)| *updated_at);
        Ok(found
            .into_iter()
            .map(|(_, id, record)| (id, record))
            .collect())
    }
}
