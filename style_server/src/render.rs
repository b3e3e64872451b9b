//! Render target showing the stylized stream.
//!
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use bytes::Bytes;
use image::{imageops::FilterType, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use tokio::sync::{broadcast, watch};

use crate::utils::{as_jpeg_stream_item, encode_jpeg};

const JPEG_QUALITY: u8 = 85;

/// Glyphs shown instead of a stylized frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placeholder {
    Loading,
    Failed,
}

#[derive(Clone, Debug, Default)]
struct Rendered {
    seq: u64,
    jpeg: Bytes,
    stream_item: Bytes,
}

/// Fixed-size surface which is replaced as a whole on every update.
///
/// The current image is kept for viewers joining later, every update is also
/// broadcast to the connected viewers.
pub struct RenderTarget {
    width: u32,
    height: u32,
    latest: watch::Sender<Option<Rendered>>,
    viewers_tx: broadcast::Sender<Bytes>,
    rendered: AtomicU64,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        let (latest, _) = watch::channel(None);
        let (viewers_tx, _) = broadcast::channel(4);
        Self {
            width,
            height,
            latest,
            viewers_tx,
            rendered: AtomicU64::new(0),
        }
    }

    /// Show the result of tick `seq`.
    ///
    /// Returns `false` if a later tick was already shown, the image is
    /// dropped in that case.
    pub fn present(&self, seq: u64, image: &RgbImage) -> Result<bool> {
        let jpeg = if image.dimensions() == (self.width, self.height) {
            encode_jpeg(image, JPEG_QUALITY)?
        } else {
            let resized =
                image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
            encode_jpeg(&resized, JPEG_QUALITY)?
        };

        let shown = self.replace(Some(seq), jpeg);
        if shown {
            self.rendered.fetch_add(1, Ordering::Relaxed);
        } else {
            log::debug!("Dropping tardy render of tick {seq}");
        }

        Ok(shown)
    }

    /// Replace whatever is shown with a placeholder glyph.
    pub fn show_placeholder(&self, placeholder: Placeholder) -> Result<()> {
        let image = draw_placeholder(self.width, self.height, placeholder);
        self.replace(None, encode_jpeg(&image, JPEG_QUALITY)?);

        Ok(())
    }

    /// Current image and a receiver for all following ones.
    pub fn subscribe(&self) -> (Option<Bytes>, broadcast::Receiver<Bytes>) {
        let latest = self.latest.borrow();
        let current = latest.as_ref().map(|rendered| rendered.stream_item.clone());

        (current, self.viewers_tx.subscribe())
    }

    pub fn latest_jpeg(&self) -> Option<Bytes> {
        self.latest
            .borrow()
            .as_ref()
            .map(|rendered| rendered.jpeg.clone())
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers_tx.receiver_count()
    }

    /// Number of stylized frames shown so far.
    pub fn rendered_count(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Swap in a new image. Placeholders (`seq == None`) always win, ticks
    /// only if they are newer than the shown one.
    fn replace(&self, seq: Option<u64>, jpeg: Bytes) -> bool {
        self.latest.send_if_modified(|latest| {
            let shown_seq = latest.as_ref().map(|rendered| rendered.seq).unwrap_or(0);
            let seq = match seq {
                Some(seq) if seq <= shown_seq => return false,
                Some(seq) => seq,
                None => shown_seq,
            };

            let stream_item = as_jpeg_stream_item(&jpeg);
            // Broadcast under the lock so viewers see the same order as the slot
            self.viewers_tx.send(stream_item.clone()).ok();
            *latest = Some(Rendered {
                seq,
                jpeg,
                stream_item,
            });

            true
        })
    }
}

/// Black surface with an hourglass while loading or a red cross on failure.
fn draw_placeholder(width: u32, height: u32, placeholder: Placeholder) -> RgbImage {
    let mut image = RgbImage::new(width, height);

    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let size = width.min(height) as f32 / 6.0;

    match placeholder {
        Placeholder::Loading => {
            let color = Rgb([200, 200, 200]);
            let (top, bottom) = (cy - size, cy + size);
            let (left, right) = (cx - size * 0.7, cx + size * 0.7);
            draw_line_segment_mut(&mut image, (left, top), (right, top), color);
            draw_line_segment_mut(&mut image, (left, bottom), (right, bottom), color);
            draw_line_segment_mut(&mut image, (left, top), (right, bottom), color);
            draw_line_segment_mut(&mut image, (right, top), (left, bottom), color);
        }
        Placeholder::Failed => {
            let color = Rgb([220, 30, 30]);
            for offset in [-1.0, 0.0, 1.0] {
                draw_line_segment_mut(
                    &mut image,
                    (cx - size + offset, cy - size),
                    (cx + size + offset, cy + size),
                    color,
                );
                draw_line_segment_mut(
                    &mut image,
                    (cx + size + offset, cy - size),
                    (cx - size + offset, cy + size),
                    color,
                );
            }
        }
    }

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(jpeg: &Bytes) -> RgbImage {
        image::load_from_memory(jpeg).unwrap().to_rgb8()
    }

    #[test]
    fn tardy_results_are_dropped() {
        let target = RenderTarget::new(30, 20);
        let white = RgbImage::from_pixel(30, 20, Rgb([255, 255, 255]));
        let black = RgbImage::new(30, 20);

        assert!(target.present(2, &white).unwrap());
        assert!(!target.present(1, &black).unwrap());
        assert_eq!(target.rendered_count(), 1);

        let shown = decode(&target.latest_jpeg().unwrap());
        assert!(shown.get_pixel(15, 10)[0] > 200);
    }

    #[test]
    fn frames_are_resized_to_the_target() {
        let target = RenderTarget::new(30, 20);
        target.present(1, &RgbImage::new(64, 48)).unwrap();

        assert_eq!(decode(&target.latest_jpeg().unwrap()).dimensions(), (30, 20));
    }

    #[test]
    fn placeholder_replaces_and_ticks_continue() {
        let target = RenderTarget::new(30, 20);
        target.show_placeholder(Placeholder::Loading).unwrap();
        assert_eq!(target.rendered_count(), 0);
        assert!(target.latest_jpeg().is_some());

        assert!(target.present(1, &RgbImage::new(30, 20)).unwrap());
        target.show_placeholder(Placeholder::Failed).unwrap();
        assert!(!target.present(1, &RgbImage::new(30, 20)).unwrap());
        assert!(target.present(2, &RgbImage::new(30, 20)).unwrap());
    }

    #[tokio::test]
    async fn viewers_receive_updates() {
        let target = RenderTarget::new(30, 20);
        assert_eq!(target.viewer_count(), 0);

        let (current, mut rx) = target.subscribe();
        assert!(current.is_none());
        assert_eq!(target.viewer_count(), 1);

        target.present(1, &RgbImage::new(30, 20)).unwrap();
        let item = rx.recv().await.unwrap();
        assert!(item.starts_with(b"--frame\r\n"));

        let (current, _rx2) = target.subscribe();
        assert_eq!(current, Some(item));

        drop(rx);
        assert_eq!(target.viewer_count(), 1);
    }
}
