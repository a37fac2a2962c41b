//! Hashing, encoding, time helpers and input validation.

use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{CustodyError, Result};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Link a payload into a hash chain: `H(prev || H(payload))`.
///
/// Returns `(payload_hash, entry_hash)`.
pub fn chain_link(prev_hash: &[u8], payload: &[u8]) -> ([u8; 32], [u8; 32]) {
    let payload_hash = sha256(payload);
    let mut preimage = Vec::with_capacity(prev_hash.len() + 32);
    preimage.extend_from_slice(prev_hash);
    preimage.extend_from_slice(&payload_hash);
    (payload_hash, sha256(&preimage))
}

/// Genesis value for every hash chain.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| CustodyError::Other(format!("invalid base64: {e}")))
}

/// URL-safe, unpadded base64 (QR byte mode friendly).
pub fn b64url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

pub fn b64url_decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn parse_rfc3339(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339)
        .map_err(|e| CustodyError::Validation(format!("invalid RFC 3339 timestamp '{s}': {e}")))
}

/// Nanoseconds since the Unix epoch, saturated into `i64` for storage.
pub fn unix_nanos(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

pub fn from_unix_nanos(ns: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns))
        .map_err(|e| CustodyError::Validation(format!("timestamp {ns} out of range: {e}")))
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Serial numbers: starts with alphanumeric, then up to 127 more
/// alphanumeric / hyphen / dot / underscore characters.
static SERIAL_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,127}$").expect("serial regex is valid")
});

pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_NOTE_LEN: usize = 1024;

pub fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() {
        return Err(CustodyError::Validation(
            "serial number must not be empty".into(),
        ));
    }
    if !SERIAL_RE.is_match(serial) {
        return Err(CustodyError::Validation(format!(
            "invalid serial '{}': 1-128 chars, alphanumeric/hyphen/dot/underscore",
            audit_label(serial)
        )));
    }
    Ok(())
}

/// Validate a free-text identifier such as an actor, gate or custodian name.
pub fn validate_label(value: &str, label: &str) -> Result<()> {
    let v = value.trim();
    if v.is_empty() {
        return Err(CustodyError::Validation(format!("{label} must not be empty")));
    }
    if v.chars().count() > MAX_LABEL_LEN {
        return Err(CustodyError::Validation(format!(
            "{label} exceeds {MAX_LABEL_LEN} characters"
        )));
    }
    if v.chars().any(char::is_control) {
        return Err(CustodyError::Validation(format!(
            "{label} contains control characters"
        )));
    }
    Ok(())
}

pub fn validate_note(note: &str) -> Result<()> {
    if note.chars().count() > MAX_NOTE_LEN {
        return Err(CustodyError::Validation(format!(
            "note exceeds {MAX_NOTE_LEN} characters"
        )));
    }
    Ok(())
}

/// Make an arbitrary caller-supplied string safe to persist in an audit record:
/// control characters replaced, length capped.
pub fn audit_label(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .take(MAX_LABEL_LEN)
        .collect();
    if cleaned.is_empty() {
        "<empty>".to_string()
    } else {
        cleaned
    }
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(CustodyError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(CustodyError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Canonicalize a path if it exists, otherwise return it unchanged.
pub fn canonicalize_if_exists(p: &Path, label: &str) -> Result<PathBuf> {
    validate_path(p, label)?;
    if p.exists() {
        std::fs::canonicalize(p)
            .map_err(|e| CustodyError::Validation(format!("{label} path invalid: {e}")))
    } else {
        Ok(p.to_path_buf())
    }
}

/// Maximum number of rows allowed in CSV inputs.
pub const MAX_CSV_ROWS: usize = 10_000;

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("CUSTODY_GIT_HASH");
pub const BUILD_TS: &str = env!("CUSTODY_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version_string() -> String {
    format!("custody-core v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}
