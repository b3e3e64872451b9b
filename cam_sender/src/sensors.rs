//! Sensors module.
//!
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "v4l")]
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::Error;

/// Returns the next JPEG frame, `None` if capturing failed.
pub type CaptureFn = Box<dyn Fn() -> Option<Vec<u8>> + Send + Sync>;

/// Get a capture function to a video device on a Linux machine.
///
/// Resolution and frame rate default to the highest the device offers.
#[cfg(feature = "v4l")]
pub fn get_capture_fn_linux(
    device_name: &str,
    format: &str,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<(u32, u32)>,
) -> Result<(CaptureFn, String), Error> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam, format);
    let fourcc = format.as_bytes();

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, fourcc))?;

    let frame_rate = frame_rate
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, fourcc, resolution))?;

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format: fourcc,
        ..Default::default()
    })?;

    let description = format!(
        "{device_name} {format} {}x{} at {}/{} s",
        resolution.0, resolution.1, frame_rate.0, frame_rate.1
    );
    log::info!("Using camera {description}");

    let callback = move || cam.capture().ok().map(|frame| frame[..].to_vec());
    Ok((Box::new(callback), description))
}

/// Get a capture function replaying the JPEG files of a directory in a loop.
pub fn get_replay_capture_fn(dir: &Path) -> Result<(CaptureFn, String), Error> {
    let files = jpeg_files(dir)?;
    let frames = files
        .iter()
        .map(fs::read)
        .collect::<Result<Vec<_>, _>>()?;
    let description = format!("replay of {} frames from {}", frames.len(), dir.display());
    log::info!("Using {description}");

    let next = AtomicUsize::new(0);
    let callback = move || {
        let index = next.fetch_add(1, Ordering::Relaxed) % frames.len();
        Some(frames[index].clone())
    };
    Ok((Box::new(callback), description))
}

/// JPEG files of `dir` sorted by name.
fn jpeg_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
                .unwrap_or(false)
        })
        .collect();

    if files.is_empty() {
        return Err(simple_error!("No JPEG files in {}", dir.display()).into());
    }
    files.sort();

    Ok(files)
}

/// Get the maximum supported resolution for the given format.
#[cfg(feature = "v4l")]
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .into_iter()
            .max_by_key(|(width, height)| width * height),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
#[cfg(feature = "v4l")]
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .into_iter()
            .max_by_key(|&(numerator, denominator)| denominator / numerator.max(1)),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

#[cfg(feature = "v4l")]
fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
