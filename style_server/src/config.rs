//! Pipeline configuration.
//!
use std::time::Duration;

use anyhow::{bail, Result};

/// Settings of the capture and stylization pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Period of the capture timer.
    pub tick_interval: Duration,
    /// Size of the render target, frames are stylized at this size.
    pub render_size: (u32, u32),
    /// Style images are resized to this before encoding, `None` keeps them as they are.
    pub style_size: Option<(u32, u32)>,
    /// Upper bound of concurrent stylizations, `None` for no bound.
    pub max_in_flight: Option<usize>,
    /// Time allowed for loading the models and the first style image.
    pub startup_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(400),
            render_size: (300, 225),
            style_size: Some((256, 256)),
            max_in_flight: Some(1),
            startup_timeout: Duration::from_secs(120),
        }
    }
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("the tick interval must be positive");
        }
        let (width, height) = self.render_size;
        if width == 0 || height == 0 {
            bail!("the render target needs a positive size, got {width}x{height}");
        }
        if matches!(self.style_size, Some((0, _)) | Some((_, 0))) {
            bail!("style images cannot be resized to an empty image");
        }
        if self.max_in_flight == Some(0) {
            bail!("at least one stylization must be allowed, use `None` for no bound");
        }

        Ok(())
    }
}
