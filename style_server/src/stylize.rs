//! Stylization of camera frames.
//!
use std::sync::Arc;

use anyhow::Result;
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::tvec;

use crate::{
    capture::FrameSnapshot,
    nn::{image_to_tensor, tensor_to_image, InferModel},
    style::StyleRepresentation,
};

/// Applies a style representation to camera frames with the transfer model.
#[derive(Clone)]
pub struct Stylizer {
    model: Arc<dyn InferModel>,
    width: u32,
    height: u32,
}

impl Stylizer {
    /// Frames are stylized at `(width, height)`, the size of the render target.
    pub fn new(model: Arc<dyn InferModel>, (width, height): (u32, u32)) -> Self {
        Self {
            model,
            width,
            height,
        }
    }

    /// Stylize one frame.
    ///
    /// A missing frame or one that does not decode yields `Ok(None)`: the
    /// tick is skipped and nothing gets rendered.
    pub fn stylize(
        &self,
        frame: Option<&FrameSnapshot>,
        style: &StyleRepresentation,
    ) -> Result<Option<RgbImage>> {
        let Some(frame) = frame else {
            return Ok(None);
        };
        let Some(content) = frame.decode() else {
            return Ok(None);
        };

        let content = self.fit(content);
        let output = self
            .model
            .predict(tvec!(image_to_tensor(&content), style.tensor().clone()))?;

        Ok(Some(self.fit(tensor_to_image(&output)?)))
    }

    fn fit(&self, image: RgbImage) -> RgbImage {
        if image.dimensions() == (self.width, self.height) {
            image
        } else {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        }
    }
}
