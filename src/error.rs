//! Error taxonomy for the detection loop.
//!
//! Capture failures are local and skippable. Inference failures are surfaced
//! to the operator and halt the polling loop. Threshold errors are rejected at
//! the setter and leave the previous value in place.

use std::time::Duration;

use thiserror::Error;

/// Frame capture could not produce a still image.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The video source is not producing frames yet (permission pending,
    /// device still opening, snapshot endpoint unreachable).
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

/// Inference call failed. Every variant is terminal for the current poll.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InferenceError {
    /// Connection refused, timeout, DNS failure, truncated body.
    #[error("transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("service error: HTTP {status}: {message}")]
    Service {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// The endpoint answered 2xx with a body matching no known response shape.
    #[error("malformed inference response: {0}")]
    Decode(String),

    /// The frame could not be encoded for upload.
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

impl InferenceError {
    pub fn is_transport(&self) -> bool {
        matches!(self, InferenceError::Transport(_))
    }
}

/// Confidence threshold outside [0, 1].
#[derive(Clone, Copy, Debug, Error, PartialEq)]
#[error("confidence threshold {0} is outside [0, 1]")]
pub struct ConfidenceError(pub f32);

/// Lifecycle mutator rejected.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("video source '{0}' is not ready")]
    SourceNotReady(String),

    #[error("no tokio runtime available to schedule polling")]
    NoRuntime,

    #[error(transparent)]
    InvalidConfidence(#[from] ConfidenceError),
}
