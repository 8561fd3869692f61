mod backend;
mod backends;
mod result;
pub mod wire;

pub use backend::InferenceClient;
pub use backends::{
    HttpClientConfig, HttpInferenceClient, PayloadFormat, StubInferenceClient,
};
pub use result::{BoundingBox, RawDetection};
pub use wire::{HealthReport, ServiceStatus};
