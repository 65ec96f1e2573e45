//! Test-start message queue.
//!
//! The scheduler only enqueues. Agents read pending messages per queue and
//! acknowledge them once a test is picked up.

use async_trait::async_trait;
use rusqlite::params;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{with_conn, Pool};
use crate::error::MessagingError;
use crate::scheduler::types::TestMessage;

/// A message waiting on a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: String,
    pub queue_name: String,
    pub message: TestMessage,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a test-start message; returns the message id.
    async fn enqueue(&self, queue_name: &str, message: &TestMessage)
        -> Result<String, MessagingError>;

    /// Oldest unacknowledged messages on `queue_name`.
    async fn pending(&self, queue_name: &str, limit: usize)
        -> Result<Vec<QueuedMessage>, MessagingError>;

    /// Mark messages as taken by an agent.
    async fn acknowledge(&self, queue_name: &str, ids: &[String]) -> Result<usize, MessagingError>;

    /// Withdraw a message no agent has taken yet. Returns whether it was
    /// still pending.
    async fn retract(&self, queue_name: &str, id: &str) -> Result<bool, MessagingError>;
}

/// Queue persisted in the shared SQLite database.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: Pool,
}

impl SqliteQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        message: &TestMessage,
    ) -> Result<String, MessagingError> {
        let backend = |message: String| MessagingError::Enqueue {
            queue: queue_name.to_string(),
            message,
        };
        let payload = serde_json::to_string(message).map_err(|e| backend(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let row = (id.clone(), queue_name.to_string(), message.test_id.clone());
        with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO queue_messages (id, queue_name, test_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
                params![row.0, row.1, row.2, payload],
            )
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(backend)?;
        Ok(id)
    }

    async fn pending(
        &self,
        queue_name: &str,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, MessagingError> {
        let queue = queue_name.to_string();
        let rows: Vec<(String, String)> = with_conn(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, payload_json FROM queue_messages
                     WHERE queue_name = ?1 AND dispatched = 0 ORDER BY rowid LIMIT ?2",
                )
                .map_err(|e| e.to_string())?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![queue, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?;
            Ok(rows)
        })
        .await
        .map_err(|message| MessagingError::Backend {
            queue: queue_name.to_string(),
            message,
        })?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, json) in rows {
            match serde_json::from_str::<TestMessage>(&json) {
                Ok(message) => messages.push(QueuedMessage {
                    id,
                    queue_name: queue_name.to_string(),
                    message,
                }),
                Err(e) => {
                    tracing::error!(queue = %queue_name, message_id = %id, error = %e, "Failed to parse queued message");
                }
            }
        }
        Ok(messages)
    }

    async fn acknowledge(&self, queue_name: &str, ids: &[String]) -> Result<usize, MessagingError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let queue = queue_name.to_string();
        let ids = ids.to_vec();
        with_conn(&self.pool, move |conn| {
            let mut changed = 0;
            for id in &ids {
                changed += conn
                    .execute(
                        "UPDATE queue_messages SET dispatched = 1 WHERE id = ?1 AND queue_name = ?2",
                        params![id, queue],
                    )
                    .map_err(|e| e.to_string())?;
            }
            Ok(changed)
        })
        .await
        .map_err(|message| MessagingError::Backend {
            queue: queue_name.to_string(),
            message,
        })
    }

    async fn retract(&self, queue_name: &str, id: &str) -> Result<bool, MessagingError> {
        let queue = queue_name.to_string();
        let id = id.to_string();
        let removed = with_conn(&self.pool, move |conn| {
            conn.execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND queue_name = ?2 AND dispatched = 0",
                params![id, queue],
            )
            .map_err(|e| e.to_string())
        })
        .await
        .map_err(|message| MessagingError::Backend {
            queue: queue_name.to_string(),
            message,
        })?;
        Ok(removed > 0)
    }
}

/// Queue held in process memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<(QueuedMessage, bool)>>,
    failing: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `enqueue` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        message: &TestMessage,
    ) -> Result<String, MessagingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MessagingError::Enqueue {
                queue: queue_name.to_string(),
                message: "queue unavailable".to_string(),
            });
        }
        let id = Uuid::new_v4().to_string();
        self.messages.lock().await.push((
            QueuedMessage {
                id: id.clone(),
                queue_name: queue_name.to_string(),
                message: message.clone(),
            },
            false,
        ));
        Ok(id)
    }

    async fn pending(
        &self,
        queue_name: &str,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, MessagingError> {
        Ok(self
            .messages
            .lock()
            .await
            .iter()
            .filter(|(m, acked)| !acked && m.queue_name == queue_name)
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn acknowledge(&self, queue_name: &str, ids: &[String]) -> Result<usize, MessagingError> {
        let mut changed = 0;
        for (m, acked) in self.messages.lock().await.iter_mut() {
            if !*acked && m.queue_name == queue_name && ids.contains(&m.id) {
                *acked = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn retract(&self, queue_name: &str, id: &str) -> Result<bool, MessagingError> {
        let mut messages = self.messages.lock().await;
        let before = messages.len();
        messages.retain(|(m, acked)| *acked || m.queue_name != queue_name || m.id != id);
        Ok(messages.len() < before)
    }
}
