//! The `error` module defines the error type shared by every `notifycast` component.
//!
//! Errors fall into four groups:
//!
//! - validation: a non-`message` event handed to the store, unknown or duplicate IDs, bad
//!   topic names
//! - quota: `TooManyRequests` from the visitor limiters, `LimitReached` from byte accounting
//! - integrity: database, serialization and I/O failures, surfaced verbatim
//! - schema: a cache database the binary cannot read
//!
//! Store and limiter errors propagate unchanged to the caller. Only the manager loop
//! and the per-subscriber fan-out tasks downgrade errors to log events.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unexpected message type")]
    UnexpectedMessageType,

    #[error("message not found")]
    MessageNotFound,

    #[error("message '{0}' already exists")]
    DuplicateMessage(String),

    #[error("too many requests")]
    TooManyRequests,

    #[error("limit reached")]
    LimitReached,

    #[error("total topic limit reached")]
    TopicLimitReached,

    #[error("topic '{0}' is not allowed")]
    DisallowedTopic(String),

    #[error("invalid topic name: '{0}'")]
    InvalidTopic(String),

    #[error("invalid since marker: '{0}'")]
    InvalidSince(String),

    #[error("invalid attachment id: '{0}'")]
    InvalidAttachmentId(String),

    #[error("attachment too large")]
    AttachmentTooLarge,

    #[error("unexpected schema version: version {found} is higher than current version {current}")]
    SchemaTooNew { found: i64, current: i64 },

    #[error("cannot determine schema version: cache file may be corrupt")]
    CorruptSchema,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors caused by a client exceeding one of its quotas.
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            Error::TooManyRequests | Error::LimitReached | Error::AttachmentTooLarge
        )
    }
}
