//! HTTP inference client.
//!
//! Posts one JPEG-encoded frame per call to the configured endpoint and
//! normalises the answer through `detect::wire`. Two upload encodings are
//! supported because deployed detectors disagree on it:
//! - `multipart`: `multipart/form-data` with a file part named `image`
//! - `base64-json`: `{"image": "<base64 jpeg>"}`

use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Deserialize;
use url::Url;

use crate::detect::backend::InferenceClient;
use crate::detect::result::RawDetection;
use crate::detect::wire::{parse_detections, service_error, HealthReport, ServiceStatus};
use crate::error::InferenceError;
use crate::frame::{CapturedFrame, DEFAULT_JPEG_QUALITY};

const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;
const MULTIPART_FIELD: &str = "image";
const MULTIPART_FILENAME: &str = "frame.jpg";

/// How the frame is put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    #[default]
    Multipart,
    Base64Json,
}

impl FromStr for PayloadFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multipart" => Ok(PayloadFormat::Multipart),
            "base64-json" | "base64" | "json" => Ok(PayloadFormat::Base64Json),
            other => Err(anyhow!(
                "unknown payload format '{}'; expected multipart or base64-json",
                other
            )),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Multipart => f.write_str("multipart"),
            PayloadFormat::Base64Json => f.write_str("base64-json"),
        }
    }
}

/// Configuration for an HTTP inference client.
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    /// Detection endpoint, e.g. "http://localhost:5000/detect".
    pub endpoint: String,
    pub payload: PayloadFormat,
    pub jpeg_quality: u8,
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5000/detect".to_string(),
            payload: PayloadFormat::Multipart,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpInferenceClient {
    config: HttpClientConfig,
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpInferenceClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("parse inference endpoint '{}'", config.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported inference endpoint scheme '{}'; expected http(s)",
                endpoint.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            config,
            endpoint,
            agent,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn payload(&self) -> PayloadFormat {
        self.config.payload
    }

    /// `GET <endpoint>`: detector liveness and model state.
    pub fn health(&self) -> Result<HealthReport, InferenceError> {
        let body = self.send(self.agent.get(self.endpoint.as_str()).call())?;
        decode_json(&body)
    }

    /// `GET /status`: detector-side counters.
    pub fn status(&self) -> Result<ServiceStatus, InferenceError> {
        let url = self.sibling("/status")?;
        let body = self.send(self.agent.get(url.as_str()).call())?;
        decode_json(&body)
    }

    /// `POST /reset`: clear detector-side detection history.
    pub fn reset_remote(&self) -> Result<(), InferenceError> {
        let url = self.sibling("/reset")?;
        self.send(self.agent.post(url.as_str()).call())?;
        Ok(())
    }

    /// `health` on tokio's blocking pool, for callers on an async runtime.
    pub async fn health_async(self: &Arc<Self>) -> Result<HealthReport, InferenceError> {
        let client = Arc::clone(self);
        off_runtime(move || client.health()).await
    }

    /// `reset_remote` on tokio's blocking pool.
    pub async fn reset_remote_async(self: &Arc<Self>) -> Result<(), InferenceError> {
        let client = Arc::clone(self);
        off_runtime(move || client.reset_remote()).await
    }

    fn sibling(&self, path: &str) -> Result<Url, InferenceError> {
        self.endpoint
            .join(path)
            .map_err(|e| InferenceError::Transport(format!("build {} url: {}", path, e)))
    }

    fn post_frame(&self, jpeg: &[u8]) -> Result<Vec<u8>, InferenceError> {
        let request = self.agent.post(self.endpoint.as_str());
        let result = match self.config.payload {
            PayloadFormat::Multipart => {
                let (content_type, body) = multipart_body(jpeg);
                request
                    .set("Content-Type", &content_type)
                    .send_bytes(&body)
            }
            PayloadFormat::Base64Json => {
                let body = serde_json::json!({ "image": BASE64_STANDARD.encode(jpeg) });
                request
                    .set("Content-Type", "application/json")
                    .send_string(&body.to_string())
            }
        };
        self.send(result)
    }

    fn send(&self, result: Result<ureq::Response, ureq::Error>) -> Result<Vec<u8>, InferenceError> {
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(service_error(status, &body));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(InferenceError::Transport(transport.to_string()));
            }
        };
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut body)
            .map_err(|e| InferenceError::Transport(format!("read response body: {}", e)))?;
        Ok(body)
    }
}

impl InferenceClient for HttpInferenceClient {
    fn name(&self) -> &str {
        self.endpoint.as_str()
    }

    fn infer(&self, frame: &CapturedFrame) -> Result<Vec<RawDetection>, InferenceError> {
        let jpeg = frame.encode_jpeg(self.config.jpeg_quality)?;
        let body = self.post_frame(&jpeg)?;
        parse_detections(&body)
    }
}

async fn off_runtime<T, F>(call: F) -> Result<T, InferenceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, InferenceError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| InferenceError::Transport(format!("blocking call failed: {}", e)))?
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, InferenceError> {
    serde_json::from_slice(body).map_err(|e| InferenceError::Decode(e.to_string()))
}

/// Build a single-part `multipart/form-data` body. Returns (content type, body).
fn multipart_body(jpeg: &[u8]) -> (String, Vec<u8>) {
    let boundary = format!("----detect-feed-{:016x}", rand::random::<u64>());
    let mut body = Vec::with_capacity(jpeg.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/jpeg\r\n\r\n",
            boundary, MULTIPART_FIELD, MULTIPART_FILENAME
        )
        .as_bytes(),
    );
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (format!("multipart/form-data; boundary={}", boundary), body)
}
