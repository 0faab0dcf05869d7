//! Session Coordinator error types.
//!
//! Error types map to signaling error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Session Coordinator error type.
///
/// Maps to signaling error codes:
/// - `Engine`: `NEGOTIATION` (2)
/// - `Incompatible`: `INCOMPATIBLE` (3)
/// - `NotFound`, `SessionClosed`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - `EngineTimeout`, `EngineUnavailable`: `UNAVAILABLE` (6)
/// - `Transcoder`, `Internal`: `INTERNAL_ERROR` (7)
#[derive(Debug, Error)]
pub enum ScError {
    /// A resource already exists or is in the wrong state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation on a nonexistent transport, producer or consumer.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The engine's compatibility predicate rejected a consume request.
    #[error("Cannot consume")]
    Incompatible,

    /// The engine rejected negotiation parameters.
    #[error("Media engine rejected request: {0}")]
    Engine(String),

    /// A bounded engine call did not complete in time.
    #[error("Media engine call timed out: {operation}")]
    EngineTimeout { operation: &'static str },

    /// The media engine is gone (worker died or shutting down).
    #[error("Media engine unavailable")]
    EngineUnavailable,

    /// The owning session disconnected while the operation was in flight.
    #[error("Session closed")]
    SessionClosed,

    /// Transcoding process failure.
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScError {
    /// Returns the signaling error code value for this error.
    #[must_use]
    pub const fn error_code(&self) -> i32 {
        match self {
            ScError::Engine(_) => 2,                                  // NEGOTIATION
            ScError::Incompatible => 3,                               // INCOMPATIBLE
            ScError::NotFound(_) | ScError::SessionClosed => 4,       // NOT_FOUND
            ScError::Conflict(_) => 5,                                // CONFLICT
            ScError::EngineTimeout { .. } | ScError::EngineUnavailable => 6, // UNAVAILABLE
            ScError::Transcoder(_) | ScError::Internal(_) => 7, // INTERNAL_ERROR
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ScError::Conflict(msg) | ScError::NotFound(msg) | ScError::Engine(msg) => msg.clone(),
            ScError::Incompatible => "Cannot consume".to_string(),
            ScError::EngineTimeout { .. } => "Media engine did not respond in time".to_string(),
            ScError::EngineUnavailable => "Media engine unavailable".to_string(),
            ScError::SessionClosed => "Session closed".to_string(),
            ScError::Transcoder(_) | ScError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Bounded label for the `status` dimension of request metrics.
    #[must_use]
    pub const fn status_label(&self) -> &'static str {
        match self {
            ScError::Conflict(_) => "conflict",
            ScError::NotFound(_) | ScError::SessionClosed => "not_found",
            ScError::Incompatible => "incompatible",
            ScError::Engine(_) => "negotiation",
            ScError::EngineTimeout { .. } | ScError::EngineUnavailable => "unavailable",
            ScError::Transcoder(_) | ScError::Internal(_) => "internal",
        }
    }
}

impl From<EngineError> for ScError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Rejected(msg) => ScError::Engine(msg),
            EngineError::UnknownResource { kind, .. } => ScError::NotFound(format!("{kind} not found")),
            EngineError::Unavailable(_) => ScError::EngineUnavailable,
        }
    }
}
