//! Error taxonomy for the event and webhook delivery core.
//!
//! Every crate in the workspace maps its own `thiserror` enum onto these
//! kinds at its boundary (see §7 of the design). `CoreError` is the kind set
//! itself; concrete crates (`eventinfra`, `webhookcore`, ...) wrap it with
//! `#[from]` conversions from `sqlx::Error`, `async_nats` errors, `reqwest::Error`
//! and so on, so no raw string error ever crosses an API edge.

use serde::Serialize;
use thiserror::Error;

/// The stable set of error kinds produced anywhere in the core.
///
/// Downstream crates should prefer constructing one of these directly over
/// inventing a new kind; the HTTP surface in `eventapi` maps each variant to
/// a fixed problem+json `code`.
#[derive(Debug, Error, Clone, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CoreError {
    /// Validation failure at an API/library edge. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or state conflict. Safe to treat as success for an
    /// idempotent publish.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient storage failure. Retried internally with backoff; surfaced
    /// only after local retries are exhausted.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Transient stream log failure.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Subscriber HTTP failure, already classified retryable/non-retryable.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Attempt exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Max attempts reached, or a non-retryable classification was hit.
    #[error("retry policy exhausted")]
    PolicyExhausted,

    /// Endpoint disabled or shutdown in progress; terminal for the affected
    /// attempt only.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Signature or idempotency conflict detected while recording an
    /// attempt; recovery is a no-op upsert.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
}

impl CoreError {
    /// Stable machine-readable code, used by the HTTP problem+json mapping
    /// and by log fields.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::StorageUnavailable(_) => "storage_unavailable",
            CoreError::StreamUnavailable(_) => "stream_unavailable",
            CoreError::RemoteUnavailable(_) => "remote_unavailable",
            CoreError::Timeout(_) => "timeout",
            CoreError::PolicyExhausted => "policy_exhausted",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::IntegrityViolation(_) => "integrity_violation",
        }
    }

    /// Whether a caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StorageUnavailable(_)
                | CoreError::StreamUnavailable(_)
                | CoreError::RemoteUnavailable(_)
                | CoreError::Timeout(_)
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
