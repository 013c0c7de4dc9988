//! Payload compression helpers
//!
//! Large event payloads travel as gzipped, base64-encoded strings wrapped in
//! a marker object: `{"__compressed": true, "data": "<base64>"}`. Receivers
//! that see the marker expand the payload before dispatch; everything else
//! passes through untouched.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::{Read, Write};

/// Field marking a payload as compressed
pub const MARKER_FIELD: &str = "__compressed";

/// Gzip bytes and encode the result as base64
///
/// # Errors
/// Returns an error if compression fails
pub fn gzip_base64(bytes: &[u8]) -> Result<String, CompressError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Decode base64 and gunzip the result
///
/// # Errors
/// Returns an error if the input is not valid base64 or not a gzip stream
pub fn gunzip_base64(encoded: &str) -> Result<Vec<u8>, CompressError> {
    let compressed = STANDARD.decode(encoded)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Compress a payload if its serialized form reaches `threshold_bytes`
///
/// Returns the (possibly wrapped) payload and whether compression was
/// applied. A threshold of 0 disables compression entirely.
///
/// # Errors
/// Returns an error if serialization or compression fails
pub fn maybe_compress(data: &Value, threshold_bytes: usize) -> Result<(Value, bool), CompressError> {
    if threshold_bytes == 0 {
        return Ok((data.clone(), false));
    }

    let serialized = serde_json::to_vec(data)?;
    if serialized.len() < threshold_bytes {
        return Ok((data.clone(), false));
    }

    let encoded = gzip_base64(&serialized)?;
    Ok((json!({ MARKER_FIELD: true, "data": encoded }), true))
}

/// Expand a payload if it carries the compression marker
///
/// Returns `None` for payloads without the marker so callers can pass the
/// original value through without cloning.
///
/// # Errors
/// Returns an error if the marker is present but the wrapped data is missing
/// or fails to decode
pub fn decompress_payload(data: &Value) -> Result<Option<Value>, CompressError> {
    let Some(obj) = data.as_object() else {
        return Ok(None);
    };
    if obj.get(MARKER_FIELD) != Some(&Value::Bool(true)) {
        return Ok(None);
    }

    let encoded = obj
        .get("data")
        .and_then(Value::as_str)
        .ok_or(CompressError::MalformedPayload)?;

    let bytes = gunzip_base64(encoded)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Compression errors
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("Compression I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compressed payload missing data field")]
    MalformedPayload,
}
