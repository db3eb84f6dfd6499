// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fuzzfleet-store.

use thiserror::Error;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by entity store backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("Record not found: {table}/{partition_key}/{row_key}")]
    NotFound {
        /// Logical table name.
        table: String,
        /// Partition key of the record.
        partition_key: String,
        /// Row key of the record.
        row_key: String,
    },

    /// An insert collided with an existing record.
    #[error("Record already exists: {table}/{partition_key}/{row_key}")]
    AlreadyExists {
        /// Logical table name.
        table: String,
        /// Partition key of the record.
        partition_key: String,
        /// Row key of the record.
        row_key: String,
    },

    /// The etag supplied with a write no longer matches the stored record.
    #[error("Concurrency conflict on {table}/{partition_key}/{row_key}")]
    ConcurrencyConflict {
        /// Logical table name.
        table: String,
        /// Partition key of the record.
        partition_key: String,
        /// Row key of the record.
        row_key: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "RECORD_NOT_FOUND",
            Self::AlreadyExists { .. } => "RECORD_ALREADY_EXISTS",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// True when the error is an optimistic concurrency failure that a later
    /// attempt can resolve by re-reading the record.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn not_found(table: &str, partition_key: &str, row_key: &str) -> Self {
        Self::NotFound {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
        }
    }

    pub(crate) fn already_exists(table: &str, partition_key: &str, row_key: &str) -> Self {
        Self::AlreadyExists {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
        }
    }

    pub(crate) fn conflict(table: &str, partition_key: &str, row_key: &str) -> Self {
        Self::ConcurrencyConflict {
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
        }
    }
}
