use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::detect::{HttpClientConfig, PayloadFormat};
use crate::filter::{Confidence, DEFAULT_CONFIDENCE};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::session::ControllerConfig;

const DEFAULT_ENDPOINT: &str = "http://localhost:5000/detect";
const DEFAULT_SOURCE_URL: &str = "stub://webcam";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const MIN_POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
struct DetectdConfigFile {
    source: Option<SourceConfigFile>,
    inference: Option<InferenceConfigFile>,
    polling: Option<PollingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    endpoint: Option<String>,
    payload: Option<PayloadFormat>,
    jpeg_quality: Option<u8>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PollingConfigFile {
    interval_ms: Option<u64>,
    confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct DetectdConfig {
    pub source_url: String,
    pub inference: InferenceSettings,
    pub poll_interval: Duration,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub endpoint: String,
    pub payload: PayloadFormat,
    pub jpeg_quality: u8,
    pub timeout: Duration,
}

impl Default for DetectdConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            inference: InferenceSettings {
                endpoint: DEFAULT_ENDPOINT.to_string(),
                payload: PayloadFormat::default(),
                jpeg_quality: DEFAULT_JPEG_QUALITY,
                timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            },
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

impl DetectdConfig {
    /// Defaults, then the file named by `DETECT_CONFIG`, then `DETECT_*`
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECT_CONFIG").ok();
        let config_path = config_path.as_deref().filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.map(Path::new))
    }

    /// Like `load`, with the config file named explicitly.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DetectdConfigFile) -> Self {
        let defaults = Self::default();
        let source_url = file
            .source
            .and_then(|source| source.url)
            .unwrap_or(defaults.source_url);
        let inference = file.inference.unwrap_or_default();
        let polling = file.polling.unwrap_or_default();
        Self {
            source_url,
            inference: InferenceSettings {
                endpoint: inference.endpoint.unwrap_or(defaults.inference.endpoint),
                payload: inference.payload.unwrap_or(defaults.inference.payload),
                jpeg_quality: inference
                    .jpeg_quality
                    .unwrap_or(defaults.inference.jpeg_quality),
                timeout: inference
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.inference.timeout),
            },
            poll_interval: polling
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            confidence: polling.confidence.unwrap_or(defaults.confidence),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("DETECT_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.inference.endpoint = endpoint;
            }
        }
        if let Ok(url) = std::env::var("DETECT_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source_url = url;
            }
        }
        if let Ok(payload) = std::env::var("DETECT_PAYLOAD") {
            if !payload.trim().is_empty() {
                self.inference.payload = payload.parse()?;
            }
        }
        if let Ok(interval) = std::env::var("DETECT_POLL_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("DETECT_POLL_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(confidence) = std::env::var("DETECT_CONFIDENCE") {
            self.confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(quality) = std::env::var("DETECT_JPEG_QUALITY") {
            self.inference.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECT_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Ok(timeout) = std::env::var("DETECT_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("DETECT_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.inference.timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Confidence::new(self.confidence)?;
        if self.poll_interval < Duration::from_millis(MIN_POLL_INTERVAL_MS) {
            return Err(anyhow!(
                "poll interval must be at least {} ms",
                MIN_POLL_INTERVAL_MS
            ));
        }
        if !(1..=100).contains(&self.inference.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be in 1..=100"));
        }
        if self.inference.timeout.is_zero() {
            return Err(anyhow!("inference timeout must be greater than zero"));
        }
        url::Url::parse(&self.inference.endpoint)
            .map_err(|e| anyhow!("invalid inference endpoint '{}': {}", self.inference.endpoint, e))?;
        if self.source_url.trim().is_empty() {
            return Err(anyhow!("video source url must not be empty"));
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            endpoint: self.inference.endpoint.clone(),
            payload: self.inference.payload,
            jpeg_quality: self.inference.jpeg_quality,
            timeout: self.inference.timeout,
        }
    }

    pub fn controller_config(&self) -> Result<ControllerConfig> {
        Ok(ControllerConfig {
            poll_interval: self.poll_interval,
            confidence: Confidence::new(self.confidence)?,
        })
    }
}

/// `.toml` files are parsed as TOML, everything else as JSON.
fn read_config_file(path: &Path) -> Result<DetectdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
