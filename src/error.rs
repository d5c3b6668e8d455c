//! Error types for the ETH-like support library

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for chain support operations
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC call {method} failed: {message}")]
    Rpc { method: &'static str, message: String },

    #[error("Timed out after {timeout:?} waiting for an RPC permit")]
    PermitTimeout { timeout: Duration },

    #[error("Latest block carries no base fee; dynamic fee escalation is not possible")]
    BaseFeeUnavailable,

    #[error("Transaction resubmission failed: {0}")]
    Resubmission(String),

    #[error("Subscription closed by the remote end")]
    SubscriptionClosed,

    #[error("Resubscription gave up after exhausting its backoff")]
    ResubscriptionExhausted,

    #[error("Invalid name {name:?}: must be 1 to {max} characters without path separators or a leading dot")]
    InvalidName { name: String, max: usize },

    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChainError {
    /// Build an RPC error from any displayable SDK error
    pub fn rpc(method: &'static str, err: impl std::fmt::Display) -> Self {
        ChainError::Rpc {
            method,
            message: err.to_string(),
        }
    }

    /// Build a storage error for the given path
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChainError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc { .. } | ChainError::PermitTimeout { .. } | ChainError::SubscriptionClosed
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            ChainError::BaseFeeUnavailable
                | ChainError::Resubmission(_)
                | ChainError::ResubscriptionExhausted
        )
    }
}

/// Result type for chain support operations
pub type ChainResult<T> = Result<T, ChainError>;
