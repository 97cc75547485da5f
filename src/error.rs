//! Error taxonomy for the signaling core.

use thiserror::Error;

/// Errors surfaced by the public operations of the core.
///
/// "Deferred" is deliberately absent: an acquisition that has to wait for the
/// call config is not a failure and is reported as
/// [`AcquireOutcome::Deferred`](crate::manager::AcquireOutcome).
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed payload or wrong content type. Never queued or retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown conversation or flow.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A response arrived with no matching outstanding request. Expected
    /// under teardown races; callers should log and move on.
    #[error("no matching request for handle {0:?}")]
    StaleCorrelation(Option<String>),

    /// The named media back-end is not available on this build.
    #[error("media backend not available: {0}")]
    BackendUnavailable(String),

    /// The media system cannot be torn down while managers are registered.
    #[error("media system busy: {0} managers still registered")]
    Busy(usize),

    /// The host request callback failed to send a command.
    #[error("request send failed: {0}")]
    Transport(String),
}

impl FlowError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for the response-correlation miss that teardown races produce.
    pub fn is_stale_correlation(&self) -> bool {
        matches!(self, Self::StaleCorrelation(_))
    }
}
