use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the hub operations.
///
/// All of these are local validation failures handed straight back to the
/// caller; the hub never retries them. A Poll that times out is not an
/// error, it returns an empty batch instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("identity '{0}' is already in use")]
    AlreadyExists(String),

    #[error("identity '{0}' has not joined")]
    NotJoined(String),

    #[error("message text must not be empty")]
    EmptyText,

    #[error("hub is shut down")]
    HubClosed,
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChatError::EmptyIdentity => ErrorCode::EmptyIdentity,
            ChatError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            ChatError::NotJoined(_) => ErrorCode::NotJoined,
            ChatError::EmptyText => ErrorCode::EmptyText,
            ChatError::HubClosed => ErrorCode::HubClosed,
        }
    }
}

/// Stable, machine-readable error identifiers carried over the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EmptyIdentity,
    AlreadyExists,
    NotJoined,
    EmptyText,
    HubClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: usize },
}
