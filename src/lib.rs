//! Detection feed
//!
//! Streams webcam stills to a remote object detector at a fixed cadence and
//! turns the noisy per-frame answers into a stable set of unique detections.
//!
//! # Architecture
//!
//! Each tick of the polling loop runs, in order:
//!
//! 1. **Capture**: take the video source's current frame as a 640x480 still.
//! 2. **Infer**: post the still (JPEG) to the detection endpoint.
//! 3. **Filter**: gate each returned detection on the live confidence threshold.
//! 4. **Dedupe**: store detections whose class + 50 px grid cell is new.
//!
//! Capture failures skip the tick. Inference failures stop the loop and are
//! surfaced until the next `start`. Only one tick is ever in flight, and a
//! result arriving after `stop` is discarded.
//!
//! # Module Structure
//!
//! - `ingest`: video sources (synthetic, HTTP snapshot, V4L2)
//! - `frame`: still capture (CapturedFrame, FrameCapture)
//! - `detect`: inference clients and response normalisation
//! - `filter`: confidence threshold
//! - `store`: unique detection store
//! - `session`: polling loop and lifecycle controller
//! - `display`: presentation helpers
//! - `config`: daemon configuration

pub mod config;
pub mod detect;
pub mod display;
pub mod error;
pub mod filter;
pub mod frame;
pub mod ingest;
pub mod session;
pub mod store;

pub use detect::{
    BoundingBox, HttpClientConfig, HttpInferenceClient, InferenceClient, PayloadFormat,
    RawDetection, StubInferenceClient,
};
pub use error::{CaptureError, ConfidenceError, InferenceError, SessionError};
pub use filter::{passes, Confidence};
pub use frame::{CapturedFrame, FrameCapture, FRAME_HEIGHT, FRAME_WIDTH};
pub use ingest::{open_source, VideoSource};
pub use session::{
    ControllerConfig, DetectionController, LifecycleState, SessionEvent, SessionState,
};
pub use store::{
    DetectionKey, DetectionRecord, DetectionSnapshot, DetectionStore, OfferOutcome,
    BUCKET_SIZE_PX,
};
