//! Payload serialization and gzip transport encoding.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, error};

use crate::payload::TelemetryPayload;

/// Gzip level used for stored artifacts.
const COMPRESSION_LEVEL: u32 = 6;
const MAX_DECOMPRESSED_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialize error: {0}")]
    Serialize(String),
    #[error("deserialize error: {0}")]
    Deserialize(String),
    #[error("compress error: {0}")]
    Compress(String),
    #[error("decompress error: {0}")]
    Decompress(String),
}

pub fn to_json(payload: &TelemetryPayload) -> Result<Bytes, CodecError> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|e| CodecError::Serialize(e.to_string()))
}

pub fn from_json(json: &[u8]) -> Result<TelemetryPayload, CodecError> {
    serde_json::from_slice(json).map_err(|e| CodecError::Deserialize(e.to_string()))
}

pub fn gzip(data: &[u8]) -> Result<Bytes, CodecError> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 4),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    debug!(
        uncompressed_size = data.len(),
        compressed_size = compressed.len(),
        "payload compressed"
    );
    Ok(Bytes::from(compressed))
}

pub fn gunzip(body: &[u8]) -> Result<Bytes, CodecError> {
    let decoder = GzDecoder::new(body);
    let mut decompressed = Vec::with_capacity(body.len().saturating_mul(4));
    let bytes_read = decoder
        .take((MAX_DECOMPRESSED_SIZE + 1) as u64)
        .read_to_end(&mut decompressed)
        .map_err(|e| {
            error!(error = %e, "gzip decompression failed");
            CodecError::Decompress(e.to_string())
        })?;
    if bytes_read > MAX_DECOMPRESSED_SIZE {
        error!(
            bytes_read,
            max = MAX_DECOMPRESSED_SIZE,
            "decompressed size exceeds limit"
        );
        return Err(CodecError::Decompress(format!(
            "exceeds {}MB limit",
            MAX_DECOMPRESSED_SIZE / 1024 / 1024
        )));
    }
    Ok(Bytes::from(decompressed))
}

/// Artifact form stored in the cache: gzip-compressed JSON.
pub fn encode_artifact(payload: &TelemetryPayload) -> Result<Bytes, CodecError> {
    gzip(&to_json(payload)?)
}

pub fn decode_artifact(artifact: &[u8]) -> Result<TelemetryPayload, CodecError> {
    from_json(&gunzip(artifact)?)
}

/// Transport form of a stored artifact: unchanged when the client accepts
/// gzip, plain JSON otherwise.
pub fn artifact_for_transport(artifact: Bytes, compress: bool) -> Result<Bytes, CodecError> {
    if compress {
        Ok(artifact)
    } else {
        gunzip(&artifact)
    }
}
