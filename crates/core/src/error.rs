// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed errors for the admission-control core.
//!
//! Every variant maps 1:1 to one of the error codes in the persisted
//! external-interface contract (`CoreError::code`), so an outer HTTP adapter
//! can render a response without re-deriving the mapping.

use thiserror::Error;

/// The four error categories from the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller error — never retried, surfaced as 4xx.
    CallerError,
    /// Admission refusal — 429/409, no retry inside the core.
    AdmissionRefusal,
    /// Timeout — 503/504, no internal retry.
    Timeout,
    /// Backend failure — fail closed for acquire/admit, best-effort for release.
    BackendFailure,
}

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    // --- Caller errors ---
    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("invalid config parameters: {0}")]
    InvalidConfigParameters(String),

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    // --- Concurrency limiter admission refusals / timeouts ---
    #[error("queue full for {resource_id}: {current_waiting}/{max_queue_size} waiters")]
    QueueFull { resource_id: String, current_waiting: u32, max_queue_size: u32 },

    #[error("queue wait timeout for {resource_id} after {timeout_secs}s")]
    QueueWaitTimeout { resource_id: String, timeout_secs: u64 },

    #[error("execution timeout for {resource_id} after {timeout_secs}s")]
    ExecutionTimeout { resource_id: String, timeout_secs: u64 },

    #[error("client disconnected while waiting for {resource_id}")]
    ClientDisconnected { resource_id: String },

    // --- Session quota ---
    #[error("session limit exceeded for account {account_id}: {current}/{max}")]
    SessionLimitExceeded { account_id: String, current: u32, max: u32 },

    // --- Session digest transitions ---
    #[error("session is not new: {session_id}")]
    SessionNotNew { session_id: String },

    #[error("digest content mismatch for session {session_id}")]
    SessionContentMismatch { session_id: String },

    #[error("digest append violation for session {session_id}")]
    SessionAppendViolation { session_id: String },

    #[error("digest rollback violation for session {session_id}")]
    SessionRollbackViolation { session_id: String },

    #[error("digest branch violation for session {session_id}")]
    SessionBranchViolation { session_id: String },

    // --- Backend ---
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl CoreError {
    /// Machine-readable error code from the external-interface contract.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidResourceId(_) => "INVALID_RESOURCE_ID",
            Self::InvalidConfigParameters(_) => "INVALID_CONFIG",
            Self::InvalidAccountId(_) => "INVALID_ACCOUNT_ID",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::QueueWaitTimeout { .. } => "TIMEOUT",
            Self::ExecutionTimeout { .. } => "TIMEOUT",
            Self::ClientDisconnected { .. } => "CLIENT_DISCONNECTED",
            Self::SessionLimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            Self::SessionNotNew { .. } => "SESSION_NOT_NEW",
            Self::SessionContentMismatch { .. } => "SESSION_CONTENT_MISMATCH",
            Self::SessionAppendViolation { .. } => "SESSION_APPEND_VIOLATION",
            Self::SessionRollbackViolation { .. } => "SESSION_ROLLBACK_VIOLATION",
            Self::SessionBranchViolation { .. } => "SESSION_BRANCH_VIOLATION",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
        }
    }

    /// The timeout subtype (`"queue"` or `"execution"`), if this is a timeout.
    pub fn timeout_type(&self) -> Option<&'static str> {
        match self {
            Self::QueueWaitTimeout { .. } => Some("queue"),
            Self::ExecutionTimeout { .. } => Some("execution"),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidResourceId(_)
            | Self::InvalidConfigParameters(_)
            | Self::InvalidAccountId(_) => ErrorCategory::CallerError,
            Self::QueueFull { .. }
            | Self::SessionLimitExceeded { .. }
            | Self::SessionNotNew { .. }
            | Self::SessionContentMismatch { .. }
            | Self::SessionAppendViolation { .. }
            | Self::SessionRollbackViolation { .. }
            | Self::SessionBranchViolation { .. }
            | Self::ClientDisconnected { .. } => ErrorCategory::AdmissionRefusal,
            Self::QueueWaitTimeout { .. } | Self::ExecutionTimeout { .. } => {
                ErrorCategory::Timeout
            }
            Self::BackendUnavailable(_) => ErrorCategory::BackendFailure,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
