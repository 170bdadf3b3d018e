//! Error kinds surfaced by the core, one enum per component plus a
//! crate-wide union. Each variant corresponds to a row in the error table
//! of the core specification.

use thiserror::Error;

/// Errors from [`crate::tokenizer::Tokenizer::extract`].
#[derive(Debug, Error)]
pub enum TokenizerError {
    /// Decoded length exceeded the configured ceiling; the buffer was
    /// cleared and framing resumes from the next byte written.
    #[error("framed message length {len} exceeds ceiling {ceiling}")]
    Overflow { len: usize, ceiling: usize },
}

/// Errors surfaced on a [`crate::task::Task`]'s completion slot.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("task timed out")]
    Timeout,
    #[error("task aborted: {0}")]
    Aborted(String),
    #[error("response parser error: {0}")]
    Parser(String),
}

/// Errors from [`crate::queue::Queue`] operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue has terminated")]
    Terminated,
}

/// Errors from [`crate::transport`] operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,
    #[error("transport TLS failure: {0}")]
    Tls(String),
    #[error("invalid transport URI: {0}")]
    InvalidUri(String),
    #[error("operation not supported by this transport")]
    Unsupported,
    #[error("transport has been terminated")]
    Terminated,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`crate::storage::Storage`] operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

/// Errors from [`crate::subscriptions::Subscriptions`] operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("store unavailable: {0}")]
    Store(#[from] StorageError),
    #[error("role lookup for system {system_id} role {role} index {index} failed")]
    UnresolvedRole {
        system_id: String,
        role: String,
        index: u32,
    },
}

/// Crate-wide error union. Library-internal code should prefer the more
/// specific per-component enums above; this exists for call sites that
/// cross component boundaries (e.g. `DriverModule` setup).
#[derive(Debug, Error)]
pub enum DriverCoreError {
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
