// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fuzzfleet-orchestrator.

use std::fmt::Display;

use fuzzfleet_store::StoreError;
use thiserror::Error;
use tracing::{error, warn};

use crate::cloud::CloudError;
use crate::models::{ErrorCode, ErrorInfo};
use crate::queue::QueueError;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or unknown input. Surfaced to the caller, never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A referenced entity does not exist.
    #[error("Unable to find: {0}")]
    UnableToFind(String),

    /// A task failed on a node.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Cloud VM creation failed.
    #[error("VM create failed: {0}")]
    VmCreateFailed(String),

    /// Resource creation failed.
    #[error("Unable to create: {0}")]
    UnableToCreate(String),

    /// Cloud resize failed.
    #[error("Unable to resize: {0}")]
    UnableToResize(String),

    /// Optimistic concurrency conflict on write.
    #[error("Unable to update: {0}")]
    UnableToUpdate(String),

    /// Configuration value not recognised.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Entity store failure other than a conflict.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Cloud provider failure.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Queue provider failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { .. } => Error::UnableToUpdate(err.to_string()),
            StoreError::NotFound { .. } => Error::UnableToFind(err.to_string()),
            other => Error::Store(other),
        }
    }
}

impl Error {
    /// Error code reported to callers.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidRequest(_) | Error::Json(_) => ErrorCode::InvalidRequest,
            Error::UnableToFind(_) => ErrorCode::UnableToFind,
            Error::TaskFailed(_) => ErrorCode::TaskFailed,
            Error::VmCreateFailed(_) => ErrorCode::VmCreateFailed,
            Error::UnableToCreate(_) | Error::Cloud(_) | Error::Queue(_) => {
                ErrorCode::UnableToCreate
            }
            Error::UnableToResize(_) => ErrorCode::UnableToResize,
            Error::UnableToUpdate(_) | Error::Store(_) => ErrorCode::UnableToUpdate,
            Error::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
        }
    }

    /// Structured `{code, errors}` payload for callers.
    pub fn to_info(&self) -> ErrorInfo {
        let message = match self {
            Error::InvalidRequest(m)
            | Error::UnableToFind(m)
            | Error::TaskFailed(m)
            | Error::VmCreateFailed(m)
            | Error::UnableToCreate(m)
            | Error::UnableToResize(m)
            | Error::UnableToUpdate(m)
            | Error::InvalidConfiguration(m) => m.clone(),
            other => other.to_string(),
        };
        ErrorInfo::new(self.error_code(), message)
    }

    /// True for optimistic concurrency failures, which the next
    /// reconciliation pass resolves by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::UnableToUpdate(_))
    }

    /// True when an insert collided with an existing record.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Store(StoreError::AlreadyExists { .. }))
    }

    /// Log a failure to process one entity of a sweep.
    ///
    /// Conflicts are expected when passes overlap and are only warned about;
    /// the next pass re-reads the entity and retries.
    pub fn log_entity_failure(&self, entity: &'static str, id: impl Display) {
        if self.is_conflict() {
            warn!(entity, id = %id, error = %self, "Concurrent update, retrying next pass");
        } else {
            error!(entity, id = %id, error = %self, "Failed to process entity");
        }
    }
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflict_maps_to_unable_to_update() {
        let err: Error = StoreError::ConcurrencyConflict {
            table: "Node".into(),
            partition_key: "pool".into(),
            row_key: "id".into(),
        }
        .into();
        assert!(err.is_conflict());
        assert_eq!(err.error_code(), ErrorCode::UnableToUpdate);
    }

    #[test]
    fn test_to_info_keeps_message() {
        let info = Error::InvalidRequest("unable to find task".into()).to_info();
        assert_eq!(info.code, ErrorCode::InvalidRequest);
        assert_eq!(info.errors, vec!["unable to find task".to_string()]);
    }
}
