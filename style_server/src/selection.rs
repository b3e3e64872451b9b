//! Choosing the active style image.
//!
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use crate::{
    resources::{decode_image, ResourceLoader, ResourceLocation},
    style::{StyleEncoder, StyleRepresentation, StyleSlot},
    utils::encode_jpeg,
};

const DISPLAY_JPEG_QUALITY: u8 = 90;

/// Which image the style comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StyleImageSource {
    Gallery(usize),
    Upload { name: String, bytes: Bytes },
}

impl fmt::Display for StyleImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gallery(index) => write!(f, "gallery entry {index}"),
            Self::Upload { name, bytes } => write!(f, "upload {name} ({} bytes)", bytes.len()),
        }
    }
}

/// Fixed, ordered list of bundled style images.
#[derive(Clone, Debug)]
pub struct StyleGallery {
    entries: Vec<ResourceLocation>,
}

impl StyleGallery {
    pub fn new(entries: Vec<ResourceLocation>) -> Result<Self> {
        if entries.is_empty() {
            bail!("the style gallery needs at least one image");
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResourceLocation> {
        self.entries.get(index)
    }

    /// Index after `index`, wrapping to the start after the last entry.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }
}

struct SelectionState {
    cursor: usize,
    active: StyleImageSource,
    display: Option<Bytes>,
}

/// Style selection by cycling through the gallery or uploading an image.
///
/// Activating a source runs load, encode and install one after another;
/// until the install the style slot hands out no representation and the
/// display counts as loading.
pub struct StyleSelection {
    gallery: StyleGallery,
    loader: ResourceLoader,
    encoder: StyleEncoder,
    slot: Arc<StyleSlot>,
    state: Mutex<SelectionState>,
}

impl StyleSelection {
    pub fn new(
        gallery: StyleGallery,
        loader: ResourceLoader,
        encoder: StyleEncoder,
        slot: Arc<StyleSlot>,
    ) -> Self {
        Self {
            gallery,
            loader,
            encoder,
            slot,
            state: Mutex::new(SelectionState {
                cursor: 0,
                active: StyleImageSource::Gallery(0),
                display: None,
            }),
        }
    }

    /// Activate the first gallery entry.
    pub async fn activate_initial(&self) -> Result<bool> {
        self.activate(StyleImageSource::Gallery(0)).await
    }

    /// Advance to the next gallery entry and activate it.
    pub async fn cycle(&self) -> Result<bool> {
        let index = {
            let mut state = self.lock();
            state.cursor = self.gallery.next_index(state.cursor);
            state.cursor
        };

        self.activate(StyleImageSource::Gallery(index)).await
    }

    /// Activate an uploaded image. An empty upload (no file chosen) is ignored.
    pub async fn upload(&self, name: String, bytes: Bytes) -> Result<bool> {
        if bytes.is_empty() {
            log::info!("Upload without a file, keeping {}", self.active_source());
            return Ok(false);
        }

        self.activate(StyleImageSource::Upload { name, bytes }).await
    }

    /// Load, encode and install a style image.
    ///
    /// Returns `false` if a newer activation overtook this one. On error the
    /// previous style stays active.
    pub async fn activate(&self, source: StyleImageSource) -> Result<bool> {
        let generation = self.slot.begin();
        log::info!("Loading style image from {source}");

        match self.load_and_encode(&source).await {
            Ok((representation, display)) => {
                let mut state = self.lock();
                if !self.slot.complete(generation, representation) {
                    log::info!("Style image from {source} was superseded");
                    return Ok(false);
                }
                log::info!("Style image from {source} is active");
                state.active = source;
                state.display = Some(display);

                Ok(true)
            }
            Err(err) => {
                self.slot.abort(generation);
                Err(err.context(format!("failed to activate style image from {source}")))
            }
        }
    }

    pub fn active_source(&self) -> StyleImageSource {
        self.lock().active.clone()
    }

    /// JPEG of the active style image, for display.
    pub fn display_jpeg(&self) -> Option<Bytes> {
        self.lock().display.clone()
    }

    /// Whether a style image is being loaded and encoded right now.
    pub fn is_loading(&self) -> bool {
        self.slot.is_refreshing()
    }

    pub fn gallery(&self) -> &StyleGallery {
        &self.gallery
    }

    async fn load_and_encode(&self, source: &StyleImageSource) -> Result<(StyleRepresentation, Bytes)> {
        let image = match source {
            StyleImageSource::Gallery(index) => {
                let location = self
                    .gallery
                    .get(*index)
                    .ok_or_else(|| anyhow!("no gallery entry {index}"))?;
                self.loader.load_image(location).await?
            }
            StyleImageSource::Upload { bytes, .. } => decode_image(bytes.clone()).await?,
        };

        let display = encode_jpeg(&image, DISPLAY_JPEG_QUALITY)?;
        let representation = self.encoder.encode_async(image).await?;

        Ok((representation, display))
    }

    fn lock(&self) -> MutexGuard<'_, SelectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, path::PathBuf, time::Duration};

    use image::{Rgb, RgbImage};
    use tract_onnx::prelude::{tract_ndarray, TVec, Tensor};

    use super::*;

    /// Prediction model encoding the mean brightness of the style image.
    fn mean_encoder() -> StyleEncoder {
        slow_mean_encoder(Duration::ZERO)
    }

    fn slow_mean_encoder(delay: Duration) -> StyleEncoder {
        let model = Arc::new(move |inputs: TVec<Tensor>| -> Result<Tensor> {
            std::thread::sleep(delay);
            let mean = inputs[0].to_array_view::<f32>()?.mean().unwrap_or(0.0);
            Ok(tract_ndarray::Array4::from_elem((1, 1, 1, 100), mean).into())
        });

        StyleEncoder::new(model, Some((16, 16)))
    }

    fn mean_of(representation: &StyleRepresentation) -> f32 {
        representation.tensor().to_array_view::<f32>().unwrap()[[0, 0, 0, 0]]
    }

    fn gallery_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("style_cam_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Gallery of solid gray images with the given brightness.
    fn gallery(name: &str, levels: &[u8]) -> StyleGallery {
        let dir = gallery_dir(name);
        let entries = levels
            .iter()
            .map(|level| {
                let path = dir.join(format!("style_{level}.png"));
                RgbImage::from_pixel(24, 12, Rgb([*level; 3])).save(&path).unwrap();
                ResourceLocation::Path(path)
            })
            .collect();

        StyleGallery::new(entries).unwrap()
    }

    fn selection(gallery: StyleGallery) -> (StyleSelection, Arc<StyleSlot>) {
        selection_with(gallery, mean_encoder())
    }

    fn selection_with(
        gallery: StyleGallery,
        encoder: StyleEncoder,
    ) -> (StyleSelection, Arc<StyleSlot>) {
        let slot = Arc::new(StyleSlot::new());
        let selection = StyleSelection::new(
            gallery,
            ResourceLoader::new(std::env::temp_dir()),
            encoder,
            Arc::clone(&slot),
        );

        (selection, slot)
    }

    fn png_bytes(level: u8) -> Bytes {
        let image = image::DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([level; 3])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageOutputFormat::Png).unwrap();
        Bytes::from(buf.into_inner())
    }

    #[test]
    fn empty_gallery_is_rejected() {
        assert!(StyleGallery::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn cycling_wraps_around() -> Result<()> {
        let (selection, slot) = selection(gallery("cycle", &[51, 102, 204]));
        assert!(selection.activate_initial().await?);
        assert_eq!(selection.active_source(), StyleImageSource::Gallery(0));
        assert!((mean_of(&slot.current().unwrap()) - 0.2).abs() < 1e-3);

        let mut seen = vec![];
        for _ in 0..selection.gallery().len() {
            assert!(selection.cycle().await?);
            seen.push(selection.active_source());
        }

        assert_eq!(
            seen,
            vec![
                StyleImageSource::Gallery(1),
                StyleImageSource::Gallery(2),
                StyleImageSource::Gallery(0),
            ]
        );
        assert!((mean_of(&slot.current().unwrap()) - 0.2).abs() < 1e-3);
        assert!(!selection.is_loading());

        Ok(())
    }

    #[tokio::test]
    async fn upload_replaces_the_style() -> Result<()> {
        let (selection, slot) = selection(gallery("upload", &[0]));
        selection.activate_initial().await?;

        assert!(selection.upload("white.png".into(), png_bytes(255)).await?);

        assert!(matches!(
            selection.active_source(),
            StyleImageSource::Upload { ref name, .. } if name == "white.png"
        ));
        assert!((mean_of(&slot.current().unwrap()) - 1.0).abs() < 1e-3);
        assert!(selection.display_jpeg().is_some());

        Ok(())
    }

    #[tokio::test]
    async fn upload_without_file_is_ignored() -> Result<()> {
        let (selection, slot) = selection(gallery("no_file", &[51]));
        selection.activate_initial().await?;
        let generation = slot.generation();

        assert!(!selection.upload(String::new(), Bytes::new()).await?);

        assert_eq!(slot.generation(), generation);
        assert_eq!(selection.active_source(), StyleImageSource::Gallery(0));

        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_keeps_previous_style() -> Result<()> {
        let (selection, slot) = selection(gallery("bad_upload", &[51]));
        selection.activate_initial().await?;

        let result = selection
            .upload("notes.txt".into(), Bytes::from_static(b"no image"))
            .await;

        assert!(result.is_err());
        assert_eq!(selection.active_source(), StyleImageSource::Gallery(0));
        assert!(!selection.is_loading());
        assert!((mean_of(&slot.current().unwrap()) - 0.2).abs() < 1e-3);

        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_does_not_drop_running_cycle() -> Result<()> {
        let (selection, slot) = selection_with(
            gallery("interleaved", &[51, 204]),
            slow_mean_encoder(Duration::from_millis(200)),
        );
        selection.activate_initial().await?;
        let started = slot.generation();

        let selection = Arc::new(selection);
        let cycling = tokio::spawn({
            let selection = Arc::clone(&selection);
            async move { selection.cycle().await }
        });
        while slot.generation() == started {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let upload = selection
            .upload("notes.txt".into(), Bytes::from_static(b"no image"))
            .await;
        assert!(upload.is_err());
        assert!(slot.is_refreshing());
        assert!(slot.current().is_none());

        assert!(cycling.await??);
        assert_eq!(selection.active_source(), StyleImageSource::Gallery(1));
        assert!(!slot.is_refreshing());
        assert!((mean_of(&slot.current().unwrap()) - 0.8).abs() < 1e-3);

        Ok(())
    }

    #[tokio::test]
    async fn missing_gallery_image_fails() {
        let gallery =
            StyleGallery::new(vec![ResourceLocation::from("/nonexistent/style.jpg")]).unwrap();
        let (selection, slot) = selection(gallery);

        assert!(selection.activate_initial().await.is_err());
        assert!(slot.current().is_none());
        assert!(selection.display_jpeg().is_none());
    }
}
