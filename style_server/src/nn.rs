//! Inference models and the tensor conversions around them.
//!
use std::{path::Path, time::Instant};

use anyhow::{anyhow, bail, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A loaded inference graph.
///
/// Models are opaque to the pipeline: tensors go in, the first output tensor
/// comes out. Any `Fn(TVec<Tensor>) -> Result<Tensor>` is a model as well,
/// which is how alternative backends (and tests) plug in.
pub trait InferModel: Send + Sync {
    fn predict(&self, inputs: TVec<Tensor>) -> Result<Tensor>;
}

impl<F> InferModel for F
where
    F: Fn(TVec<Tensor>) -> Result<Tensor> + Send + Sync,
{
    fn predict(&self, inputs: TVec<Tensor>) -> Result<Tensor> {
        self(inputs)
    }
}

/// The two models of arbitrary style transfer.
#[derive(Clone)]
pub struct StyleModels {
    /// Style image `[1, h, w, 3]` to style representation.
    pub prediction: Arc<dyn InferModel>,
    /// Content image `[1, h, w, 3]` plus style representation to stylized image.
    pub transfer: Arc<dyn InferModel>,
}

/// ONNX graph executed with tract.
pub struct OnnxModel {
    name: String,
    model: NnModel,
}

impl OnnxModel {
    /// Load, optimize and prepare an ONNX graph for execution.
    ///
    /// External weight files referenced by the graph are resolved relative to
    /// the graph's directory. Without an `input_shape` the graph must declare
    /// concrete input shapes itself.
    pub fn load(name: &str, graph: &Path, input_shape: Option<&[usize]>) -> Result<Self> {
        let start = Instant::now();

        let mut model = tract_onnx::onnx().model_for_path(graph)?;
        if let Some(shape) = input_shape {
            let shape: TVec<usize> = shape.iter().copied().collect();
            let input_fact = InferenceFact::dt_shape(f32::datum_type(), shape);
            model = model.with_input_fact(0, input_fact)?;
        }
        let model = model.into_optimized()?.into_runnable()?;

        log::info!(
            "Model {} loaded from {} in {:.2} seconds",
            name,
            graph.display(),
            start.elapsed().as_secs_f32()
        );

        Ok(Self {
            name: name.to_owned(),
            model,
        })
    }
}

impl InferModel for OnnxModel {
    fn predict(&self, inputs: TVec<Tensor>) -> Result<Tensor> {
        let outputs = self
            .model
            .run(inputs.into_iter().map(|tensor| tensor.into()).collect())?;
        let first = outputs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("model {} produced no output", self.name))?;

        Ok((*first).clone())
    }
}

/// Convert an image to a `[1, height, width, 3]` tensor with values in `[0, 1]`.
pub fn image_to_tensor(image: &RgbImage) -> Tensor {
    let (width, height) = image.dimensions();

    tract_ndarray::Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| image[(x as _, y as _)][c] as f32 / 255.0,
    )
    .into()
}

/// Convert a model output back into an image.
///
/// Leading axes of length one are squeezed away, the remainder must be
/// `[height, width, 3]` with values in `[0, 1]`. Values outside are clamped.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let view = tensor.to_array_view::<f32>()?;

    let mut shape = view.shape();
    while shape.len() > 3 && shape[0] == 1 {
        shape = &shape[1..];
    }
    let (height, width) = match *shape {
        [height, width, 3] => (height, width),
        _ => bail!(
            "expected a stylized image of shape [h, w, 3], got {:?}",
            tensor.shape()
        ),
    };

    let pixels: Vec<u8> = view.iter().map(|value| to_pixel(*value)).collect();
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("stylized image buffer does not match {width}x{height}"))
}

fn to_pixel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
