//! Live video sources.
//!
//! This module provides the sources a `FrameCapture` can read from:
//! - Synthetic test pattern (`stub://`)
//! - HTTP JPEG snapshot cameras (`http://`, `https://`)
//! - USB/V4L2 webcams (feature: ingest-v4l2)
//!
//! A source only exposes a readiness flag and its current frame. It never
//! buffers frames for later, and it never talks to the inference endpoint.

use anyhow::{anyhow, Result};
use image::RgbImage;

pub mod snapshot;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use snapshot::{SnapshotConfig, SnapshotSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// A live video source with a readiness flag.
pub trait VideoSource: Send {
    /// Source identifier (URL or device path).
    fn name(&self) -> &str;

    /// Open the underlying stream. Sources may still report not-ready afterwards.
    fn connect(&mut self) -> Result<()>;

    /// True when `current_frame` is expected to succeed.
    fn is_ready(&self) -> bool;

    /// The frame the source is showing right now, at native resolution.
    fn current_frame(&mut self) -> Result<RgbImage>;

    fn stats(&self) -> SourceStats;
}

impl VideoSource for Box<dyn VideoSource> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn current_frame(&mut self) -> Result<RgbImage> {
        (**self).current_frame()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Statistics for a video source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_read: u64,
    pub source: String,
}

/// Open a source by URL scheme.
///
/// - `stub://<name>` -> synthetic pattern
/// - `http(s)://...` -> JPEG snapshot camera
/// - `/dev/...` -> V4L2 device (requires the ingest-v4l2 feature)
pub fn open_source(url: &str) -> Result<Box<dyn VideoSource>> {
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            url: url.to_string(),
            ..SyntheticConfig::default()
        })));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(SnapshotSource::new(SnapshotConfig {
            url: url.to_string(),
            ..SnapshotConfig::default()
        })?));
    }
    if url.starts_with("/dev/") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(V4l2Config {
                device: url.to_string(),
                ..V4l2Config::default()
            })));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!("V4L2 devices require the ingest-v4l2 feature"));
        }
    }
    Err(anyhow!(
        "unsupported video source '{}'; expected stub://, http(s):// or /dev/video*",
        url
    ))
}
