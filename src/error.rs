use thiserror::Error;

use crate::models::notification::Channel;

/// Failures of the dispatch pipeline before any delivery is attempted.
///
/// Delivery failures are not represented here: they are recorded per
/// recipient in the job report and never fail a job as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Idempotency key was already used for a different request")]
    Conflict,

    #[error("A request with this idempotency key is still being processed")]
    RequestInFlight,

    #[error("Missing sender info for channel {0}")]
    MissingSenderInfo(Channel),

    #[error("Recipient resolution failed: {0}")]
    Resolution(String),

    #[error("Template rendering failed: {reason}")]
    TemplateRender { reason: String, retryable: bool },

    #[error("Content for {channel} is {size} bytes, limit is {limit}")]
    ContentTooLarge {
        channel: Channel,
        size: usize,
        limit: usize,
    },

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Storage failure: {0}")]
    Store(String),
}

impl DispatchError {
    /// Whether the caller may retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::RequestInFlight
            | DispatchError::Resolution(_)
            | DispatchError::Store(_) => true,
            DispatchError::TemplateRender { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::MissingIdempotencyKey => "missing_idempotency_key",
            DispatchError::Validation(_) | DispatchError::MissingSenderInfo(_) => {
                "validation_error"
            }
            DispatchError::Conflict => "idempotency_conflict",
            DispatchError::RequestInFlight => "request_in_flight",
            DispatchError::Resolution(_) => "resolution_error",
            DispatchError::TemplateRender { .. } => "template_render_error",
            DispatchError::ContentTooLarge { .. } => "content_too_large",
            DispatchError::JobNotFound(_) => "not_found",
            DispatchError::Store(_) => "store_error",
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        DispatchError::Store(err.to_string())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
