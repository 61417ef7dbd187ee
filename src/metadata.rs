//! Inline section-metadata codec.
//!
//! A metadata line is any line beginning with [`PREFIX`]; the remainder is a
//! URL-safe base64 encoding of a UTF-8 JSON object. Embedding the payload
//! this way keeps it safe to interpolate directly into a shell `echo`: the
//! base64 alphabet used here never contains `$`, `'`, `^`, or whitespace.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

use crate::error::{Result, WorkerError};

pub const PREFIX: &[u8] = b"anaconda-build-metadata:";

/// Encode a flat string-keyed map into a metadata line (no trailing newline).
pub fn encode(metadata: &Map<String, Value>) -> Vec<u8> {
    let json = serde_json::to_string(metadata).expect("metadata map always serializes");
    let payload = URL_SAFE_NO_PAD.encode(json.as_bytes());
    let mut out = Vec::with_capacity(PREFIX.len() + payload.len());
    out.extend_from_slice(PREFIX);
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Decode a metadata line. Fails if the prefix is missing, the base64 is
/// invalid, or the decoded JSON is not an object.
pub fn decode(line: &[u8]) -> Result<Map<String, Value>> {
    let rest = line
        .strip_prefix(PREFIX)
        .ok_or_else(|| WorkerError::MalformedMetadata("missing metadata prefix".into()))?;
    // The payload may be followed by a trailing newline; strip it before
    // decoding, matching how writeline delivers one logical line at a time.
    let rest = rest.strip_suffix(b"\n").unwrap_or(rest);
    let rest = rest.strip_suffix(b"\r").unwrap_or(rest);

    let decoded = URL_SAFE_NO_PAD
        .decode(rest)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(rest))
        .map_err(|e| WorkerError::MalformedMetadata(format!("invalid base64: {e}")))?;

    let value: Value = serde_json::from_slice(&decoded)
        .map_err(|e| WorkerError::MalformedMetadata(format!("invalid json: {e}")))?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Err(WorkerError::MalformedMetadata(
            "metadata json is not an object".into(),
        )),
    }
}

/// Returns true iff `line` begins with the metadata prefix. Does not
/// validate that the remainder decodes; see [`decode`] for that.
pub fn looks_like_metadata(line: &[u8]) -> bool {
    line.starts_with(PREFIX)
}
