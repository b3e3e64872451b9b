//! Loading of models and images from local paths or URLs.
//!
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use image::RgbImage;
use reqwest::Client;

use crate::{
    nn::{InferModel, OnnxModel, StyleModels},
    utils::download_file,
};

/// Where a resource lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceLocation {
    Path(PathBuf),
    Url(String),
}

impl From<&str> for ResourceLocation {
    fn from(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_owned())
        } else {
            Self::Path(PathBuf::from(location))
        }
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

impl ResourceLocation {
    /// Last path segment, used as the file name of downloads.
    fn file_name(&self) -> Option<String> {
        match self {
            Self::Path(path) => path.file_name().map(|name| name.to_string_lossy().into_owned()),
            Self::Url(url) => url
                .split(|c: char| c == '?' || c == '#')
                .next()
                .and_then(|url| url.rsplit('/').next())
                .filter(|name| !name.is_empty())
                .map(ToOwned::to_owned),
        }
    }
}

/// One model: a graph file and the weight files it references.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    pub name: String,
    pub graph: ResourceLocation,
    pub weights: Vec<ResourceLocation>,
    /// Shape of the first input, `None` to keep what the graph declares.
    pub input_shape: Option<Vec<usize>>,
}

/// Fetches models and images.
#[derive(Clone)]
pub struct ResourceLoader {
    client: Client,
    cache_dir: PathBuf,
}

impl ResourceLoader {
    /// Downloads are stored below `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::new(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Loader caching into the user's cache directory.
    pub fn with_default_cache() -> Self {
        Self::new(
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("style_cam"),
        )
    }

    pub async fn fetch_bytes(&self, location: &ResourceLocation) -> Result<Bytes> {
        match location {
            ResourceLocation::Path(path) => Ok(tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?
                .into()),
            ResourceLocation::Url(url) => Ok(self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?),
        }
    }

    /// Fetch and decode an image.
    pub async fn load_image(&self, location: &ResourceLocation) -> Result<RgbImage> {
        let bytes = self.fetch_bytes(location).await?;
        decode_image(bytes)
            .await
            .with_context(|| format!("failed to decode image {location}"))
    }

    /// Load both models concurrently, failing if either fails.
    pub async fn load_models(
        &self,
        prediction: &ModelSpec,
        transfer: &ModelSpec,
    ) -> Result<StyleModels> {
        let (prediction, transfer) =
            tokio::try_join!(self.load_model(prediction), self.load_model(transfer))?;

        Ok(StyleModels {
            prediction,
            transfer,
        })
    }

    pub async fn load_model(&self, spec: &ModelSpec) -> Result<Arc<dyn InferModel>> {
        let graph = self.local_model_files(spec).await?;

        let name = spec.name.clone();
        let input_shape = spec.input_shape.clone();
        let model = tokio::task::spawn_blocking(move || {
            OnnxModel::load(&name, &graph, input_shape.as_deref())
        })
        .await?
        .with_context(|| format!("failed to load model {}", spec.name))?;

        Ok(Arc::new(model))
    }

    /// Make all files of a model available in one local directory.
    ///
    /// Returns the path of the graph. Remote files are downloaded once and
    /// reused from the cache afterwards.
    async fn local_model_files(&self, spec: &ModelSpec) -> Result<PathBuf> {
        let (model_dir, graph) = match &spec.graph {
            ResourceLocation::Path(path) => {
                let dir = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (dir, path.clone())
            }
            ResourceLocation::Url(url) => {
                let dir = self.cache_dir.join("models").join(&spec.name);
                let graph = dir.join(file_name_of(&spec.graph)?);
                self.fetch_to(url, &graph).await?;
                (dir, graph)
            }
        };

        for weights in spec.weights.iter() {
            match weights {
                ResourceLocation::Path(path) => {
                    if tokio::fs::metadata(path).await.is_err() {
                        bail!("weights file {} of model {} not found", path.display(), spec.name);
                    }
                }
                ResourceLocation::Url(url) => {
                    let target = model_dir.join(file_name_of(weights)?);
                    self.fetch_to(url, &target).await?;
                }
            }
        }

        Ok(graph)
    }

    async fn fetch_to(&self, url: &str, target: &Path) -> Result<()> {
        if tokio::fs::metadata(target).await.is_ok() {
            log::debug!("Using cached {}", target.display());
            return Ok(());
        }
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        download_file(&self.client, url, target)
            .await
            .with_context(|| format!("failed to download {url}"))
    }
}

/// Decode an encoded image on the blocking thread pool.
pub async fn decode_image(bytes: Bytes) -> Result<RgbImage> {
    tokio::task::spawn_blocking(move || -> Result<RgbImage> {
        Ok(image::load_from_memory(&bytes)?.to_rgb8())
    })
    .await?
}

fn file_name_of(location: &ResourceLocation) -> Result<String> {
    location
        .file_name()
        .ok_or_else(|| anyhow!("cannot derive a file name from {location}"))
}
