//! USB webcam source over V4L2.
//!
//! Most UVC webcams offer MJPEG and some offer raw RGB24. Both are accepted:
//! MJPEG buffers are decoded with `image`, RGB24 buffers are wrapped as-is.
//! The source is ready once the mmap stream is up and the last dequeue
//! succeeded.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::FourCC;

use super::{SourceStats, VideoSource};

const MMAP_BUFFERS: u32 = 2;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    pub device: String,
    /// Requested capture size. The driver may pick the nearest it supports.
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Mjpeg,
    Rgb24,
}

impl PixelLayout {
    fn fourcc(self) -> FourCC {
        match self {
            PixelLayout::Mjpeg => FourCC::new(b"MJPG"),
            PixelLayout::Rgb24 => FourCC::new(b"RGB3"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [PixelLayout::Mjpeg, PixelLayout::Rgb24]
            .into_iter()
            .find(|layout| layout.fourcc() == fourcc)
    }
}

#[self_referencing]
struct Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    buffers: MmapStream<'this, v4l::Device>,
}

struct Negotiated {
    layout: PixelLayout,
    width: u32,
    height: u32,
}

pub struct V4l2Source {
    config: V4l2Config,
    stream: Option<Stream>,
    negotiated: Option<Negotiated>,
    healthy: bool,
    frames_read: u64,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            stream: None,
            negotiated: None,
            healthy: false,
            frames_read: 0,
        }
    }

    /// Ask for MJPEG first, then RGB24, and keep whichever the driver accepts.
    fn negotiate(&self, device: &mut v4l::Device) -> Result<Negotiated> {
        for wanted in [PixelLayout::Mjpeg, PixelLayout::Rgb24] {
            let mut format = device.format().context("query capture format")?;
            format.width = self.config.width;
            format.height = self.config.height;
            format.fourcc = wanted.fourcc();
            match device.set_format(&format) {
                Ok(applied) => {
                    if let Some(layout) = PixelLayout::from_fourcc(applied.fourcc) {
                        return Ok(Negotiated {
                            layout,
                            width: applied.width,
                            height: applied.height,
                        });
                    }
                }
                Err(err) => log::debug!(
                    "{}: {:?} rejected: {}",
                    self.config.device,
                    wanted,
                    err
                ),
            }
        }
        Err(anyhow!(
            "{} offers neither MJPEG nor RGB24 capture",
            self.config.device
        ))
    }
}

fn decode_buffer(layout: PixelLayout, width: u32, height: u32, bytes: &[u8]) -> Result<RgbImage> {
    match layout {
        PixelLayout::Mjpeg => Ok(image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
            .context("decode MJPEG buffer")?
            .to_rgb8()),
        PixelLayout::Rgb24 => {
            let len = (width as usize) * (height as usize) * 3;
            let pixels = bytes
                .get(..len)
                .ok_or_else(|| anyhow!("short RGB24 buffer: {} of {} bytes", bytes.len(), len))?;
            RgbImage::from_raw(width, height, pixels.to_vec())
                .ok_or_else(|| anyhow!("RGB24 buffer does not fit {}x{}", width, height))
        }
    }
}

impl VideoSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn connect(&mut self) -> Result<()> {
        self.healthy = false;
        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open {}", self.config.device))?;
        let negotiated = self.negotiate(&mut device)?;

        let stream = StreamTryBuilder {
            device,
            buffers_builder: |device| {
                MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
                    .context("map capture buffers")
            },
        }
        .try_build()?;

        log::info!(
            "{}: streaming {:?} at {}x{}",
            self.config.device,
            negotiated.layout,
            negotiated.width,
            negotiated.height
        );
        self.stream = Some(stream);
        self.negotiated = Some(negotiated);
        self.healthy = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.stream.is_some() && self.healthy
    }

    fn current_frame(&mut self) -> Result<RgbImage> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not connected", self.config.device))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not connected", self.config.device))?;

        let dequeued = stream.with_buffers_mut(|buffers| buffers.next().map(|(buf, _)| buf.to_vec()));
        let bytes = match dequeued {
            Ok(bytes) => bytes,
            Err(err) => {
                self.healthy = false;
                return Err(anyhow!("dequeue from {}: {}", self.config.device, err));
            }
        };

        let image = decode_buffer(negotiated.layout, negotiated.width, negotiated.height, &bytes)?;
        self.frames_read += 1;
        Ok(image)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frames_read,
            source: self.config.device.clone(),
        }
    }
}
