use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::detect::backend::InferenceClient;
use crate::detect::result::RawDetection;
use crate::error::InferenceError;
use crate::frame::CapturedFrame;

/// Scripted inference client for tests and offline runs.
///
/// Replays queued responses in order. Once the script is exhausted it answers
/// with the fallback (an empty detection list by default).
pub struct StubInferenceClient {
    script: Mutex<VecDeque<Result<Vec<RawDetection>, InferenceError>>>,
    fallback: Result<Vec<RawDetection>, InferenceError>,
    calls: AtomicU64,
}

impl StubInferenceClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(Vec::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Answer every call with the same detections.
    pub fn repeating(detections: Vec<RawDetection>) -> Self {
        Self {
            fallback: Ok(detections),
            ..Self::new()
        }
    }

    /// Queue one response.
    pub fn push(&self, response: Result<Vec<RawDetection>, InferenceError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn with_response(self, response: Result<Vec<RawDetection>, InferenceError>) -> Self {
        self.push(response);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

impl Default for StubInferenceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceClient for StubInferenceClient {
    fn name(&self) -> &str {
        "stub"
    }

    fn infer(&self, _frame: &CapturedFrame) -> Result<Vec<RawDetection>, InferenceError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let next = self
            .script
            .lock()
            .map_err(|_| InferenceError::Transport("stub script lock poisoned".to_string()))?
            .pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
