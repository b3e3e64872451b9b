//! Utility functions
//!
use std::{io::Cursor, path::Path};

use anyhow::{Context, Result};
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    log::info!("Downloading {} to {}", url, filepath.display());

    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    // A partial download never carries the final file name
    let partial = filepath.with_extension("part");
    tokio::fs::write(&partial, &content)
        .await
        .with_context(|| format!("failed to write {}", partial.display()))?;
    tokio::fs::rename(&partial, filepath).await?;

    Ok(())
}

/// Encode an image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes> {
    let (width, height) = image.dimensions();
    let mut buf = Cursor::new(Vec::new());

    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        image,
        width,
        height,
        image::ColorType::Rgb8,
    )?;

    Ok(Bytes::from(buf.into_inner()))
}

/// Wrap a JPEG in a part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}
