//! Still-frame capture.
//!
//! - `CapturedFrame`: fixed 640x480 RGB still taken from a video source.
//! - `RenderSurface`: the off-screen raster a capture draws into.
//! - `FrameCapture`: the adapter the polling loop calls once per tick.
//!
//! A capture takes no buffering or averaging: it is the source's current frame
//! at the moment of the call. The render surface is checked out for the duration
//! of one capture and returned on every exit path, including failures.

use std::io::Cursor;
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::error::{CaptureError, InferenceError};
use crate::ingest::VideoSource;

/// Width of every captured still.
pub const FRAME_WIDTH: u32 = 640;
/// Height of every captured still.
pub const FRAME_HEIGHT: u32 = 480;
/// JPEG quality used for upload unless configured otherwise.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// One still image, always `FRAME_WIDTH` x `FRAME_HEIGHT`.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    image: RgbImage,
    captured_at: SystemTime,
    sequence: u64,
}

impl CapturedFrame {
    /// Wrap an image that is already at capture resolution.
    pub fn from_image(image: RgbImage, sequence: u64) -> Result<Self, CaptureError> {
        if image.dimensions() != (FRAME_WIDTH, FRAME_HEIGHT) {
            return Err(CaptureError::Unavailable(format!(
                "frame is {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                FRAME_WIDTH,
                FRAME_HEIGHT
            )));
        }
        Ok(Self {
            image,
            captured_at: SystemTime::now(),
            sequence,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Position of this frame in the capture adapter's lifetime.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Encode as baseline JPEG for upload.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, InferenceError> {
        let quality = quality.clamp(1, 100);
        let mut buf = Cursor::new(Vec::with_capacity(64 * 1024));
        JpegEncoder::new_with_quality(&mut buf, quality)
            .encode_image(&self.image)
            .map_err(|e| InferenceError::Encode(e.to_string()))?;
        Ok(buf.into_inner())
    }
}

// ----------------------------------------------------------------------------
// RenderSurface: scoped off-screen raster
// ----------------------------------------------------------------------------

/// Off-screen raster owned by a `FrameCapture`.
#[derive(Debug)]
pub struct RenderSurface {
    raster: RgbImage,
}

impl RenderSurface {
    fn new() -> Self {
        Self {
            raster: RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT),
        }
    }

    /// Draw `source` scaled to fill the surface.
    fn draw(&mut self, source: &RgbImage) {
        if source.dimensions() == (FRAME_WIDTH, FRAME_HEIGHT) {
            self.raster.copy_from_slice(source.as_raw());
        } else {
            self.raster = imageops::resize(source, FRAME_WIDTH, FRAME_HEIGHT, FilterType::Triangle);
        }
    }
}

/// Checked-out surface. Returns the surface to its slot on drop.
struct SurfaceGuard<'a> {
    slot: &'a mut Option<RenderSurface>,
    surface: Option<RenderSurface>,
}

impl<'a> SurfaceGuard<'a> {
    fn acquire(slot: &'a mut Option<RenderSurface>) -> Self {
        let surface = Some(slot.take().unwrap_or_else(RenderSurface::new));
        Self { slot, surface }
    }

    fn surface(&mut self) -> &mut RenderSurface {
        self.surface.get_or_insert_with(RenderSurface::new)
    }
}

impl Drop for SurfaceGuard<'_> {
    fn drop(&mut self) {
        *self.slot = self.surface.take();
    }
}

// ----------------------------------------------------------------------------
// FrameCapture: the adapter
// ----------------------------------------------------------------------------

/// Counters for a capture adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub unavailable: u64,
}

/// Pulls stills out of a live `VideoSource` on demand.
pub struct FrameCapture<S: VideoSource> {
    source: S,
    surface: Option<RenderSurface>,
    stats: CaptureStats,
}

impl<S: VideoSource> FrameCapture<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            surface: Some(RenderSurface::new()),
            stats: CaptureStats::default(),
        }
    }

    /// Readiness as reported by the underlying source.
    pub fn is_ready(&self) -> bool {
        self.source.is_ready()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.clone()
    }

    /// True when no capture currently holds the render surface.
    pub fn surface_available(&self) -> bool {
        self.surface.is_some()
    }

    /// Capture the source's current frame at 640x480.
    pub fn capture(&mut self) -> Result<CapturedFrame, CaptureError> {
        if !self.source.is_ready() {
            self.stats.unavailable += 1;
            return Err(CaptureError::Unavailable(format!(
                "{} not ready",
                self.source.name()
            )));
        }

        let mut guard = SurfaceGuard::acquire(&mut self.surface);
        let frame = match self.source.current_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.unavailable += 1;
                return Err(CaptureError::Unavailable(format!(
                    "{}: {:#}",
                    self.source.name(),
                    err
                )));
            }
        };

        let surface = guard.surface();
        surface.draw(&frame);
        let still = surface.raster.clone();
        drop(guard);

        self.stats.frames_captured += 1;
        CapturedFrame::from_image(still, self.stats.frames_captured)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
