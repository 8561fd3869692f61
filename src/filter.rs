//! Confidence gating.
//!
//! The same predicate runs at two independent points: when the store decides
//! whether to accept a detection, and when the presentation layer decides what
//! to show. The threshold is live-adjustable, so display filtering never relies
//! on the acceptance-time decision.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::detect::RawDetection;
use crate::error::ConfidenceError;

/// Threshold used when nothing else is configured.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// A confidence value validated to lie in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Confidence(f32);

impl Confidence {
    pub fn new(value: f32) -> Result<Self, ConfidenceError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(ConfidenceError(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self(DEFAULT_CONFIDENCE)
    }
}

impl TryFrom<f32> for Confidence {
    type Error = ConfidenceError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Returns true when `detection` meets `threshold`.
pub fn passes(detection: &RawDetection, threshold: Confidence) -> bool {
    detection.confidence >= threshold.value()
}

/// Live threshold shared between the control surface and the tick handler.
///
/// Stored as raw `f32` bits. There is no transactional requirement: a new value
/// applies to the next offer or filter evaluation.
#[derive(Debug)]
pub struct SharedThreshold {
    bits: AtomicU32,
}

impl SharedThreshold {
    pub fn new(initial: Confidence) -> Self {
        Self {
            bits: AtomicU32::new(initial.value().to_bits()),
        }
    }

    pub fn get(&self) -> Confidence {
        Confidence(f32::from_bits(self.bits.load(Ordering::Acquire)))
    }

    /// Validates and stores `value`. On error the previous value is retained.
    pub fn set(&self, value: f32) -> Result<Confidence, ConfidenceError> {
        let confidence = Confidence::new(value)?;
        self.bits.store(confidence.value().to_bits(), Ordering::Release);
        Ok(confidence)
    }
}

impl Default for SharedThreshold {
    fn default() -> Self {
        Self::new(Confidence::default())
    }
}
