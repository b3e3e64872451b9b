//! Style representations and the slot holding the current one.
//!
use std::{collections::BTreeSet, sync::Arc, time::Instant};

use anyhow::Result;
use image::{imageops::FilterType, RgbImage};
use tokio::sync::watch;
use tract_onnx::prelude::{tvec, Tensor};

use crate::nn::{image_to_tensor, InferModel};

/// Encoded style of one style image, as produced by the prediction model.
#[derive(Clone, Debug)]
pub struct StyleRepresentation(Arc<Tensor>);

impl StyleRepresentation {
    pub fn new(tensor: Tensor) -> Self {
        Self(Arc::new(tensor))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.0
    }
}

#[derive(Debug, Default)]
struct SlotState {
    /// Last generation handed out by `begin`.
    generation: u64,
    /// Generation of `complete`, 0 before the first install.
    installed: u64,
    in_flight: BTreeSet<u64>,
    complete: Option<StyleRepresentation>,
}

impl SlotState {
    /// A refresh newer than the installed representation is still running.
    fn refreshing(&self) -> bool {
        self.in_flight
            .iter()
            .next_back()
            .map_or(false, |&newest| newest > self.installed)
    }
}

/// Holder of the current style representation.
///
/// Every refresh gets a generation. While a refresh newer than the installed
/// representation is in flight no representation is handed out. The newest
/// generation that succeeds wins: a result older than the installed one is
/// dropped, and a failed refresh leaves the last complete representation in
/// place.
#[derive(Debug)]
pub struct StyleSlot {
    state: watch::Sender<SlotState>,
}

impl Default for StyleSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl StyleSlot {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SlotState::default());
        Self { state }
    }

    /// Start a refresh and hide the current representation.
    pub fn begin(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            state.generation += 1;
            state.in_flight.insert(state.generation);
            generation = state.generation;
        });

        generation
    }

    /// Install the result of refresh `generation`.
    ///
    /// Returns `false` and drops the representation if a newer refresh
    /// already installed its result.
    pub fn complete(&self, generation: u64, representation: StyleRepresentation) -> bool {
        let mut installed = false;
        self.state.send_if_modified(|state| {
            if !state.in_flight.remove(&generation) {
                return false;
            }
            if generation > state.installed {
                state.installed = generation;
                state.complete = Some(representation);
                installed = true;
            }
            true
        });

        installed
    }

    /// Give up refresh `generation`.
    ///
    /// Returns `true` if that made the last complete representation current
    /// again, `false` while other refreshes are still running.
    pub fn abort(&self, generation: u64) -> bool {
        let mut restored = false;
        self.state.send_if_modified(|state| {
            if !state.in_flight.remove(&generation) {
                return false;
            }
            restored = !state.refreshing();
            true
        });

        restored
    }

    /// Latest complete representation, `None` while a refresh is in flight.
    pub fn current(&self) -> Option<StyleRepresentation> {
        let state = self.state.borrow();
        if state.refreshing() {
            return None;
        }

        state.complete.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.borrow().refreshing()
    }

    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }
}

/// Turns style images into style representations.
#[derive(Clone)]
pub struct StyleEncoder {
    model: Arc<dyn InferModel>,
    input_size: Option<(u32, u32)>,
}

impl StyleEncoder {
    /// Images are resized to `input_size` before inference if given.
    pub fn new(model: Arc<dyn InferModel>, input_size: Option<(u32, u32)>) -> Self {
        Self { model, input_size }
    }

    pub fn encode(&self, image: &RgbImage) -> Result<StyleRepresentation> {
        let start = Instant::now();

        let tensor = match self.input_size {
            Some((width, height)) if image.dimensions() != (width, height) => {
                let resized = image::imageops::resize(image, width, height, FilterType::Triangle);
                image_to_tensor(&resized)
            }
            _ => image_to_tensor(image),
        };
        let representation = StyleRepresentation::new(self.model.predict(tvec!(tensor))?);

        log::info!(
            "Generated style representation {:?} in {} milliseconds",
            representation.shape(),
            start.elapsed().as_millis()
        );

        Ok(representation)
    }

    /// Encode on the blocking thread pool.
    pub async fn encode_async(&self, image: RgbImage) -> Result<StyleRepresentation> {
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.encode(&image)).await?
    }
}
