use crate::detect::result::RawDetection;
use crate::error::InferenceError;
use crate::frame::CapturedFrame;

/// Remote object detector.
///
/// One call is one outstanding request. Implementations normalise whatever the
/// endpoint returns into a flat list of `RawDetection` and perform no filtering
/// or deduplication of their own.
///
/// Calls block the current thread; the polling loop runs them on tokio's
/// blocking pool.
pub trait InferenceClient: Send + Sync {
    /// Client identifier used in logs.
    fn name(&self) -> &str;

    /// Submit one still frame and wait for the endpoint's answer.
    fn infer(&self, frame: &CapturedFrame) -> Result<Vec<RawDetection>, InferenceError>;
}

impl<T: InferenceClient + ?Sized> InferenceClient for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn infer(&self, frame: &CapturedFrame) -> Result<Vec<RawDetection>, InferenceError> {
        (**self).infer(frame)
    }
}
