//! Latest webcam frame.
//!
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use bytes::Bytes;
use image::RgbImage;
use tokio::sync::watch;

/// Encoded camera frame as it arrived from the camera.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    pub seq: u64,
    pub captured_at: Instant,
    pub jpeg: Bytes,
}

impl FrameSnapshot {
    /// Decode the frame, `None` if the data is not a complete image.
    pub fn decode(&self) -> Option<RgbImage> {
        match image::load_from_memory(&self.jpeg) {
            Ok(image) => Some(image.to_rgb8()),
            Err(e) => {
                log::debug!("Frame {} not decodable: {e}", self.seq);
                None
            }
        }
    }
}

/// Slot with the most recent camera frame.
pub struct LatestFrame {
    latest: watch::Sender<Option<FrameSnapshot>>,
    published: AtomicU64,
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrame {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            latest,
            published: AtomicU64::new(0),
        }
    }

    /// Replace the latest frame, returns its sequence number.
    pub fn publish(&self, jpeg: Bytes) -> u64 {
        let seq = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        self.latest.send_replace(Some(FrameSnapshot {
            seq,
            captured_at: Instant::now(),
            jpeg,
        }));

        seq
    }

    /// Forget the latest frame if it is still frame `seq`, e.g. because the
    /// camera that sent it went away.
    pub fn clear_if_latest(&self, seq: u64) -> bool {
        self.latest.send_if_modified(|latest| match latest {
            Some(frame) if frame.seq == seq => {
                *latest = None;
                true
            }
            _ => false,
        })
    }

    /// Snapshot of the latest frame, `None` if the camera has not produced one.
    pub fn capture(&self) -> Option<FrameSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn has_frame(&self) -> bool {
        self.latest.borrow().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_without_frames_is_none() {
        let frames = LatestFrame::new();
        assert!(frames.capture().is_none());
        assert!(frames.capture().is_none());
    }

    #[test]
    fn capture_returns_latest() {
        let frames = LatestFrame::new();
        frames.publish(Bytes::from_static(b"first"));
        let seq = frames.publish(Bytes::from_static(b"second"));

        let frame = frames.capture().unwrap();
        assert_eq!(frame.seq, seq);
        assert_eq!(&frame.jpeg[..], b"second");

        assert!(frames.clear_if_latest(seq));
        assert!(frames.capture().is_none());
    }

    #[test]
    fn newer_frame_survives_clearing_an_older_one() {
        let frames = LatestFrame::new();
        let old = frames.publish(Bytes::from_static(b"old"));
        let new = frames.publish(Bytes::from_static(b"new"));

        assert!(!frames.clear_if_latest(old));
        assert_eq!(frames.capture().unwrap().seq, new);
        assert!(frames.clear_if_latest(new));
        assert!(frames.capture().is_none());
    }

    #[test]
    fn garbage_does_not_decode() {
        let frames = LatestFrame::new();
        frames.publish(Bytes::from_static(&[0xff, 0xd8, 0xff]));
        assert!(frames.capture().unwrap().decode().is_none());
    }
}
