//! Synthetic video source (`stub://`).
//!
//! Produces a moving test pattern so the whole loop can run without a camera.
//! `warmup_polls` models the period before a real webcam starts delivering
//! frames (permission prompt, device still opening).

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{SourceStats, VideoSource};

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Number of readiness polls answered with "not ready" after connect.
    pub warmup_polls: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://webcam".to_string(),
            width: 640,
            height: 480,
            warmup_polls: 0,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    connected: bool,
    warmup_remaining: AtomicU32,
    frame_count: u64,
    /// Simulated scene state; advances every 50 frames.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            warmup_remaining: AtomicU32::new(config.warmup_polls),
            config,
            connected: false,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_pattern(&mut self) -> RgbImage {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let scene = self.scene_state as u64;
        let offset = self.frame_count + scene;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            let r = ((x as u64 + offset) % 256) as u8;
            let g = ((y as u64 + offset) % 256) as u8;
            let b = (((x + y) as u64 + scene * 40) % 256) as u8;
            Rgb([r, g, b])
        })
    }
}

impl VideoSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.url
    }

    /// Synthetic sources always connect.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        if !self.connected {
            return false;
        }
        self.warmup_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
    }

    fn current_frame(&mut self) -> Result<RgbImage> {
        self.frame_count += 1;
        Ok(self.generate_pattern())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}
