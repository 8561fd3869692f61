pub mod http;
pub mod stub;

pub use http::{HttpClientConfig, HttpInferenceClient, PayloadFormat};
pub use stub::StubInferenceClient;
