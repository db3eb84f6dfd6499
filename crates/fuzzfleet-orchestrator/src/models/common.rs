// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Value types shared by several entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric error codes carried in [`ErrorInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or unknown input.
    InvalidRequest,
    /// Cloud resize call failed.
    UnableToResize,
    /// Cloud VM creation failed.
    VmCreateFailed,
    /// Resource creation failed.
    UnableToCreate,
    /// Referenced entity missing.
    UnableToFind,
    /// Task failed on a node.
    TaskFailed,
    /// Referenced node is invalid.
    InvalidNode,
    /// Entity could not be written back.
    UnableToUpdate,
    /// Configuration value not recognised.
    InvalidConfiguration,
}

impl ErrorCode {
    /// Numeric code as exposed to API clients.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::InvalidRequest => 450,
            ErrorCode::UnableToResize => 456,
            ErrorCode::VmCreateFailed => 461,
            ErrorCode::UnableToCreate => 464,
            ErrorCode::UnableToFind => 467,
            ErrorCode::TaskFailed => 468,
            ErrorCode::InvalidNode => 469,
            ErrorCode::UnableToUpdate => 471,
            ErrorCode::InvalidConfiguration => 476,
        }
    }

    /// Symbolic name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnableToResize => "UNABLE_TO_RESIZE",
            ErrorCode::VmCreateFailed => "VM_CREATE_FAILED",
            ErrorCode::UnableToCreate => "UNABLE_TO_CREATE",
            ErrorCode::UnableToFind => "UNABLE_TO_FIND",
            ErrorCode::TaskFailed => "TASK_FAILED",
            ErrorCode::InvalidNode => "INVALID_NODE",
            ErrorCode::UnableToUpdate => "UNABLE_TO_UPDATE",
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
        }
    }
}

/// Structured error stored on entities and returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category.
    pub code: ErrorCode,
    /// Human readable messages.
    pub errors: Vec<String>,
}

impl ErrorInfo {
    /// Build an error with a single message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errors: vec![message.into()],
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.code.as_u16(),
            self.code.as_str(),
            self.errors.join("; ")
        )
    }
}

/// Identity of the user that requested an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Application id of the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<Uuid>,
    /// Object id of the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Uuid>,
    /// User principal name. Personally identifying, scrubbed by retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
}

/// Credentials provisioned onto VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Local administrator password.
    pub password: String,
    /// SSH public key.
    pub public_key: String,
    /// SSH private key.
    pub private_key: String,
}

impl Authentication {
    /// Generate fresh credentials.
    pub fn generate() -> Self {
        let seed = Uuid::new_v4().simple().to_string();
        Self {
            password: Uuid::new_v4().to_string(),
            public_key: format!("ssh-ed25519 {seed} fuzzfleet"),
            private_key: format!("fuzzfleet-private-{seed}"),
        }
    }
}

/// Operating system of an image or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Os {
    /// Linux.
    Linux,
    /// Windows.
    Windows,
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Os::Linux => f.write_str("linux"),
            Os::Windows => f.write_str("windows"),
        }
    }
}

/// CPU architecture of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
}
