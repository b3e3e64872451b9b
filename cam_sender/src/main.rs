//! Sends camera frames to the style server data socket.
//!
use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use cam_sender::sensors::{get_replay_capture_fn, CaptureFn};
use clap::Parser;
use common::protocol::{CameraInfo, FrameMsg, ProtoMsg};
use env_logger::TimestampPrecision;
use futures::sink::SinkExt;
use tokio::{
    net::TcpStream,
    time::{interval, MissedTickBehavior},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the style server data socket
    #[clap(long, default_value = "127.0.0.1:3001")]
    address: String,

    /// Name this camera announces itself with
    #[clap(long, default_value = "webcam")]
    camera: String,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Replay the JPEG files of this directory instead of capturing
    #[clap(long)]
    replay: Option<PathBuf>,

    /// Frames sent per second
    #[clap(long, default_value_t = 10)]
    fps: u32,
}

fn open_source(args: &Args) -> Result<(CaptureFn, String)> {
    if let Some(dir) = &args.replay {
        return get_replay_capture_fn(dir).map_err(|e| anyhow!("{e}"));
    }

    open_device(&args.device)
}

#[cfg(feature = "v4l")]
fn open_device(device: &str) -> Result<(CaptureFn, String)> {
    cam_sender::sensors::get_capture_fn_linux(device, "MJPG", None, None)
        .map_err(|e| anyhow!("could not open {device}: {e}"))
}

#[cfg(not(feature = "v4l"))]
fn open_device(device: &str) -> Result<(CaptureFn, String)> {
    Err(anyhow!(
        "capturing from {device} needs the `v4l` feature, use --replay otherwise"
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let (capture_fn, description) = open_source(&args)?;
    let capture_fn = Arc::new(capture_fn);

    let stream = TcpStream::connect(&args.address)
        .await
        .with_context(|| format!("could not connect to {}", &args.address))?;
    log::info!("Camera {} connected to {}", &args.camera, &args.address);

    // Wrap stream in transport handler with length-delimited codec
    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    let hello = ProtoMsg::Hello(CameraInfo {
        name: args.camera.clone(),
        description,
    });
    transport.send(bytes::Bytes::from(hello.serialize()?)).await?;

    let mut ticks = interval(Duration::from_secs(1) / args.fps.max(1));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq = 0;

    // Send captured frames in a loop
    loop {
        ticks.tick().await;

        let capture_fn = Arc::clone(&capture_fn);
        match tokio::task::spawn_blocking(move || (*capture_fn)()).await? {
            Some(jpeg) => {
                let data = ProtoMsg::Frame(FrameMsg::new(seq, jpeg)).serialize()?;
                transport.send(bytes::Bytes::from(data)).await?;
                seq += 1;
                log::debug!("Sent frame {seq}");
            }
            None => log::error!("Unable to capture frame, trying again..."),
        }
    }
}
