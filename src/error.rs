//! Error taxonomy for the scheduler and its collaborators.

use serde_json::json;
use thiserror::Error;

use crate::scheduler::types::ApiResponse;

/// Object storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("object storage i/o failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage backend failed for {key}: {message}")]
    Backend { key: String, message: String },

    #[error("failed to (de)serialize {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Message queue failures.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to enqueue to {queue}: {message}")]
    Enqueue { queue: String, message: String },

    #[error("queue backend failed for {queue}: {message}")]
    Backend { queue: String, message: String },
}

/// Test status store failures.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status record not found: {test_id}")]
    NotFound { test_id: String },

    #[error("status store failed for {test_id}: {message}")]
    Backend { test_id: String, message: String },
}

/// Top-level error returned by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller supplied something unusable. Never retried.
    #[error("{message}")]
    Validation { message: String, detail: String },

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation(message: impl Into<String>, detail: impl Into<String>) -> Self {
        SchedulerError::Validation {
            message: message.into(),
            detail: detail.into(),
        }
    }

    /// HTTP status number the API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::Validation { .. } => 400,
            SchedulerError::NotFound(_) => 404,
            SchedulerError::Storage(_)
            | SchedulerError::Messaging(_)
            | SchedulerError::Status(_) => 500,
        }
    }

    /// Build the `{status, json: {message, error}}` envelope.
    pub fn to_response(&self) -> ApiResponse {
        let (message, error) = match self {
            SchedulerError::Validation { message, detail } => (message.clone(), detail.clone()),
            SchedulerError::NotFound(message) => (message.clone(), "not found".to_string()),
            SchedulerError::Storage(e) => ("object storage failure".to_string(), e.to_string()),
            SchedulerError::Messaging(e) => ("message queue failure".to_string(), e.to_string()),
            SchedulerError::Status(e) => ("test status failure".to_string(), e.to_string()),
        };
        ApiResponse {
            status: self.status_code(),
            json: json!({ "message": message, "error": error }),
        }
    }
}
