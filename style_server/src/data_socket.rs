//! Data socket receiving the camera stream via network.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::{bail, Result};
use bytes::Bytes;
use common::protocol::ProtoMsg;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{driver::AppState, meter::METER};

/// Bind the data socket and feed received frames into the latest frame slot.
///
/// Returns the bound address, useful when binding to port 0.
#[allow(unreachable_code)]
pub async fn spawn_data_socket(
    app: Arc<AppState>,
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let socket: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(socket).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Waiting for cameras on {local_addr}");

    let handle = tokio::spawn(async move {
        loop {
            let (socket, _peer_addr) = listener.accept().await?;
            let app = Arc::clone(&app);
            tokio::spawn(async move {
                if let Err(e) = handle_incoming(app, socket).await {
                    log::warn!("Camera connection failed: {e:#}");
                }
            });
        }

        Ok::<_, anyhow::Error>(())
    });

    Ok((local_addr, handle))
}

async fn handle_incoming(app: Arc<AppState>, stream: TcpStream) -> Result<()> {
    let addr = stream.peer_addr()?;
    log::info!("{}: New TCP connection", &addr);

    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    let camera = match transport.next().await {
        Some(Ok(data)) => match ProtoMsg::deserialize(&data) {
            Ok(ProtoMsg::Hello(camera)) => camera,
            _ => bail!("{addr}: expected a hello message"),
        },
        _ => bail!("{addr}: connection closed before hello"),
    };
    log::info!("{}: Camera {} connected ({})", &addr, camera.name, camera.description);

    let mut last_seq = None;
    while let Some(res) = transport.next().await {
        match res {
            Ok(data) => match ProtoMsg::deserialize(&data) {
                Ok(ProtoMsg::Frame(frame)) => {
                    last_seq = Some(app.frames.publish(Bytes::from(frame.jpeg)));
                    METER.tick_received();
                }
                Ok(ProtoMsg::Hello(_)) => log::warn!("{addr}: Ignoring repeated hello"),
                Err(e) => log::warn!("{addr}: Invalid message: {e}"),
            },
            Err(e) => {
                log::warn!("{addr}: Error in TCP codec: {e}");
                break;
            }
        }
    }

    log::info!("{}: Camera {} disconnected", &addr, camera.name);
    // Frames of other cameras stay
    if let Some(seq) = last_seq {
        app.frames.clear_if_latest(seq);
    }

    Ok(())
}
