use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Counters of the frames flowing through the pipeline.
#[derive(Default)]
pub struct Meter {
    received_frames: AtomicU64,
    stylized_frames: AtomicU64,
    skipped_ticks: AtomicU64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            received_frames: AtomicU64::new(0),
            stylized_frames: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
        }
    }

    pub fn tick_received(&self) {
        self.received_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_stylized(&self) {
        self.stylized_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_skipped(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn get_reset(&self) -> (u64, u64, u64) {
        (
            self.received_frames.swap(0, Ordering::Relaxed),
            self.stylized_frames.swap(0, Ordering::Relaxed),
            self.skipped_ticks.swap(0, Ordering::Relaxed),
        )
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let (received, stylized, skipped) = METER.get_reset();
            let elapsed = start.elapsed().as_secs_f32();

            if received > 0 {
                log::info!("Received frames per second: {:.2}", received as f32 / elapsed);
            }
            if stylized > 0 {
                log::info!("Stylized frames per second: {:.2}", stylized as f32 / elapsed);
            }
            if skipped > 0 {
                log::debug!("Skipped {skipped} ticks in {elapsed:.1} seconds");
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_reset_on_read() {
        let meter = Meter::new();
        meter.tick_received();
        meter.tick_received();
        meter.tick_stylized();

        assert_eq!(meter.get_reset(), (2, 1, 0));
        assert_eq!(meter.get_reset(), (0, 0, 0));
    }
}
