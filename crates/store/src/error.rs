//! Error surface of the store adapter.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The store could not be reached or the connection dropped.
    Connection,
    /// A referenced collection, index, or document does not exist.
    NotFound,
    /// A write conflicted with an existing key.
    Conflict,
    /// The request itself was malformed (bad filter, wrong collection kind).
    InvalidRequest,
    /// The store reported an internal failure.
    Internal,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoreErrorKind::Connection => "connection",
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::Conflict => "conflict",
            StoreErrorKind::InvalidRequest => "invalid_request",
            StoreErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Error returned by every [`crate::DocumentStore`] operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("store error ({kind}): {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    /// Whether a retry with backoff may succeed.
    pub retryable: bool,
    pub message: String,
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Connection,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::NotFound,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Conflict,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::InvalidRequest,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Internal,
            retryable: true,
            message: message.into(),
        }
    }
}

/// Run `op`, retrying retryable failures with exponential backoff.
///
/// `max_attempts` counts the first try; backoff doubles from 50ms between
/// attempts. Non-retryable errors return immediately.
pub fn with_retry<T>(
    max_attempts: u32,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let attempts = max_attempts.max(1);
    let mut delay = Duration::from_millis(50);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable && attempt < attempts => {
                warn!(
                    kind = %err.kind,
                    attempt,
                    max_attempts = attempts,
                    "retryable store error, backing off: {}",
                    err.message
                );
                std::thread::sleep(delay);
                delay *= 2;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::internal("retry loop exhausted")))
}
