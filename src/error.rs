//! Error taxonomy for the display engine and its consumers.
//!
//! Validation failures are surfaced to the immediate caller and never
//! retried. Persistence failures are logged and swallowed at the call site
//! (the in-memory canvas stays authoritative). Protocol failures are
//! isolated to the offending client. Lock-wait timeouts are reported as a
//! distinct condition so callers can choose to retry them.

use thiserror::Error;

/// All errors produced by the inkboard subsystems.
#[derive(Debug, Error)]
pub enum DisplayError {
    /// A caller-supplied coordinate, dimension, color, font, format string
    /// or timezone was rejected.
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// A bounded lock wait expired. Distinct from validation so callers may
    /// retry.
    #[error("a wait for the {name} lock timed out")]
    LockTimeout { name: &'static str },

    /// Journal/snapshot/clock-state file I/O failed. Best-effort: callers
    /// log and continue.
    #[error("state persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// A wire-level failure on a single client connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The accept loop exceeded its daily restart budget. Terminal for the
    /// listener; existing connections are unaffected.
    #[error("listener restart budget exhausted")]
    ListenerExhausted,

    /// PNG/JPEG encode failure on the canvas export path.
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl DisplayError {
    /// Shorthand for a validation error on a named field.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        DisplayError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DisplayError>;
