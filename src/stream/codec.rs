//! Inbound frame decoding.
//!
//! Frames arrive either gzip-compressed or as plain UTF-8 text; both decode
//! to the same JSON payload shape.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

use crate::stream::proto::InboundMessage;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors produced while decoding a single inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame carried the gzip header but did not inflate.
    #[error("gzip decompression failed: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("frame is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns `true` when the frame starts with the gzip magic bytes.
pub fn is_gzip(frame: &[u8]) -> bool {
    frame.starts_with(&GZIP_MAGIC)
}

/// Normalizes a frame to text, inflating it first when gzip-compressed.
pub fn frame_to_text(frame: &[u8]) -> Result<String, DecodeError> {
    if !is_gzip(frame) {
        return Ok(String::from_utf8(frame.to_vec())?);
    }

    let mut inflated = Vec::new();
    GzDecoder::new(frame)
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Gzip)?;
    Ok(String::from_utf8(inflated)?)
}

/// Decodes a frame into a classified inbound message.
pub fn decode_frame(frame: &[u8]) -> Result<InboundMessage, DecodeError> {
    let text = frame_to_text(frame)?;
    let value: Value = serde_json::from_str(&text)?;
    Ok(InboundMessage::from_value(value))
}

/// Gzip-compresses a text payload.
pub fn gzip_text(text: &str) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()
}
