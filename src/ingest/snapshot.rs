//! HTTP snapshot camera source.
//!
//! Fetches one JPEG per capture from a camera snapshot URL (for example an
//! ESP32-CAM `/capture` endpoint) and decodes it in memory.
//!
//! Readiness follows the last fetch: after a failed fetch or decode the source
//! reports not-ready until `retry_backoff` has elapsed, so the polling loop
//! skips ticks instead of hammering an unreachable camera.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::time::{Duration, Instant};

use super::{SourceStats, VideoSource};

const MAX_JPEG_BYTES: u64 = 5 * 1024 * 1024;

/// Configuration for a snapshot source.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Snapshot URL returning a single JPEG per GET.
    pub url: String,
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/capture".to_string(),
            timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

pub struct SnapshotSource {
    config: SnapshotConfig,
    agent: ureq::Agent,
    connected: bool,
    last_failure: Option<Instant>,
    last_error: Option<String>,
    frame_count: u64,
}

impl SnapshotSource {
    pub fn new(config: SnapshotConfig) -> Result<Self> {
        let parsed = url::Url::parse(&config.url).context("parse snapshot url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported snapshot scheme '{}'; expected http(s)",
                parsed.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            config,
            agent,
            connected: false,
            last_failure: None,
            last_error: None,
            frame_count: 0,
        })
    }

    /// Last fetch or decode failure, if the source is currently backing off.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fetch_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.config.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }

    fn fetch_frame(&self) -> Result<RgbImage> {
        let bytes = self.fetch_jpeg()?;
        let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Jpeg)
            .context("decode jpeg snapshot")?;
        Ok(image.into_rgb8())
    }

    fn record(&mut self, result: &Result<RgbImage>) {
        match result {
            Ok(_) => {
                self.frame_count += 1;
                self.last_failure = None;
                self.last_error = None;
            }
            Err(err) => {
                if self.last_error.is_none() {
                    log::warn!("SnapshotSource: {} unavailable: {:#}", self.config.url, err);
                }
                self.last_failure = Some(Instant::now());
                self.last_error = Some(format!("{:#}", err));
            }
        }
    }
}

impl VideoSource for SnapshotSource {
    fn name(&self) -> &str {
        &self.config.url
    }

    /// Fetch one frame. A failed fetch is an error, and the source stays
    /// not-ready until the backoff elapses.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        let fetched = self.fetch_frame();
        self.record(&fetched);
        let frame = fetched?;
        log::info!(
            "SnapshotSource: connected to {} ({}x{})",
            self.config.url,
            frame.width(),
            frame.height()
        );
        Ok(())
    }

    fn is_ready(&self) -> bool {
        if !self.connected {
            return false;
        }
        match self.last_failure {
            Some(at) => at.elapsed() >= self.config.retry_backoff,
            None => true,
        }
    }

    fn current_frame(&mut self) -> Result<RgbImage> {
        let result = self.fetch_frame();
        self.record(&result);
        result
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}
