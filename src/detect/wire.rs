//! Inference endpoint response parsing.
//!
//! Two incompatible response shapes exist in deployed detectors:
//! - a list of `{class_id, confidence, box: [x, y, w, h]}` objects, either bare or
//!   wrapped as `{"status": ..., "detections": [...]}`
//! - parallel arrays `{"classIDs": [...], "confidences": [...], "boxes": [...]}`
//!
//! The list of objects is canonical. Parallel arrays are zipped into it here so
//! nothing past this module ever sees the second shape.

use serde::Deserialize;
use std::time::Duration;

use crate::detect::result::{BoundingBox, RawDetection};
use crate::error::InferenceError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Wrapped {
        detections: Vec<RawDetection>,
    },
    List(Vec<RawDetection>),
    Parallel {
        #[serde(rename = "classIDs")]
        class_ids: Vec<u32>,
        confidences: Vec<f32>,
        boxes: Vec<BoundingBox>,
    },
}

/// Normalise a 2xx response body into detections.
pub fn parse_detections(body: &[u8]) -> Result<Vec<RawDetection>, InferenceError> {
    let response: WireResponse = serde_json::from_slice(body)
        .map_err(|e| InferenceError::Decode(format!("unrecognised response shape: {}", e)))?;

    match response {
        WireResponse::Wrapped { detections } | WireResponse::List(detections) => Ok(detections),
        WireResponse::Parallel {
            class_ids,
            confidences,
            boxes,
        } => {
            if class_ids.len() != confidences.len() || class_ids.len() != boxes.len() {
                return Err(InferenceError::Decode(format!(
                    "parallel arrays disagree in length: classIDs={} confidences={} boxes={}",
                    class_ids.len(),
                    confidences.len(),
                    boxes.len()
                )));
            }
            Ok(class_ids
                .into_iter()
                .zip(confidences)
                .zip(boxes)
                .map(|((class_id, confidence), bbox)| RawDetection {
                    class_id,
                    confidence,
                    bbox,
                })
                .collect())
        }
    }
}

/// Error body returned by the detector on non-2xx answers.
#[derive(Debug, Default, Deserialize)]
struct WireError {
    error: Option<String>,
    message: Option<String>,
    retry_after: Option<f64>,
}

/// Build a `Service` error from a non-2xx status and its (possibly empty) body.
pub fn service_error(status: u16, body: &str) -> InferenceError {
    let parsed: WireError = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    let retry_after = parsed
        .retry_after
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);
    InferenceError::Service {
        status,
        message,
        retry_after,
    }
}

/// `GET <endpoint>` health answer.
#[derive(Clone, Debug, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
}

/// `GET /status` answer.
#[derive(Clone, Debug, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub status: String,
    #[serde(default)]
    pub active_clients: u64,
    #[serde(default)]
    pub tracked_detections: u64,
    #[serde(default)]
    pub model_loaded: bool,
}
