//! QR identity codec: signed, versioned payloads binding an equipment serial
//! to its registration record.
//!
//! ## Lifecycle
//! 1. **Administrator** generates an Ed25519 keypair: [`generate_signing_keypair`]
//! 2. **Registration desk** issues a payload for a registered item:
//!    [`QrIssuer::encode`]
//! 3. **Gate** verifies the scanned text: [`QrVerifier::decode`]
//!
//! The codec is pure: it never consults the ledger, and time is always an
//! argument.  Checking that the serial is registered and that the embedded
//! registration hash still matches is the state machine's job.
//!
//! ## Wire format (v1, big-endian)
//!
//! ```text
//! "EQR" | 0x01 | serial_len:u8 | serial | registration_hash:32 | issued_at:i64 | signature:64
//! ```
//!
//! The signature covers every byte before it.  The text form is `EQR1.`
//! followed by URL-safe unpadded base64 of the binary.

use std::path::Path;

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::error::{CustodyError, DecodeError, Result, ResultExt as _};
use crate::model::Equipment;
use crate::util;

pub const TEXT_PREFIX: &str = "EQR1.";
const MAGIC: &[u8; 3] = b"EQR";
const FORMAT_VERSION: u8 = 1;
const HASH_LEN: usize = 32;
const TS_LEN: usize = 8;
const SIGNATURE_LEN: usize = 64;
const HEADER_LEN: usize = MAGIC.len() + 2;

pub const SIGNING_KEY_FILE: &str = "qr_signing.key";
pub const VERIFY_KEY_FILE: &str = "qr_verify.key";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    pub serial: String,
    pub registration_hash: [u8; HASH_LEN],
    /// Whole seconds, UTC.
    pub issued_at: OffsetDateTime,
    pub signature: [u8; SIGNATURE_LEN],
}

impl QrPayload {
    /// The bytes covered by the signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        signed_bytes(&self.serial, &self.registration_hash, self.issued_at)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn to_text(&self) -> String {
        format!("{TEXT_PREFIX}{}", util::b64url_encode(&self.to_bytes()))
    }

    pub fn registration_hash_hex(&self) -> String {
        hex::encode(self.registration_hash)
    }

    /// Structural parse of the binary layout.  Does not verify the signature.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let malformed = |m: &str| DecodeError::Malformed(m.to_string());

        if bytes.len() < HEADER_LEN {
            return Err(malformed("truncated header"));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(malformed("bad magic"));
        }
        if bytes[3] != FORMAT_VERSION {
            return Err(DecodeError::Malformed(format!(
                "unsupported format version {}",
                bytes[3]
            )));
        }
        let serial_len = usize::from(bytes[4]);
        if serial_len == 0 || serial_len > util::MAX_LABEL_LEN {
            return Err(malformed("serial length out of range"));
        }
        let expected = HEADER_LEN + serial_len + HASH_LEN + TS_LEN + SIGNATURE_LEN;
        if bytes.len() < expected {
            return Err(malformed("truncated payload"));
        }
        if bytes.len() > expected {
            return Err(malformed("trailing bytes"));
        }

        let mut at = HEADER_LEN;
        let serial = std::str::from_utf8(&bytes[at..at + serial_len])
            .map_err(|_| malformed("serial is not UTF-8"))?;
        util::validate_serial(serial).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        at += serial_len;

        let mut registration_hash = [0u8; HASH_LEN];
        registration_hash.copy_from_slice(&bytes[at..at + HASH_LEN]);
        at += HASH_LEN;

        let mut ts = [0u8; TS_LEN];
        ts.copy_from_slice(&bytes[at..at + TS_LEN]);
        let issued_at = OffsetDateTime::from_unix_timestamp(i64::from_be_bytes(ts))
            .map_err(|_| malformed("issue time out of range"))?;
        at += TS_LEN;

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[at..at + SIGNATURE_LEN]);

        Ok(Self {
            serial: serial.to_string(),
            registration_hash,
            issued_at,
            signature,
        })
    }

    pub fn parse_text(raw: &str) -> std::result::Result<Self, DecodeError> {
        let body = raw
            .trim()
            .strip_prefix(TEXT_PREFIX)
            .ok_or_else(|| DecodeError::Malformed(format!("missing '{TEXT_PREFIX}' prefix")))?;
        let bytes = util::b64url_decode(body)
            .map_err(|e| DecodeError::Malformed(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "serial": self.serial,
            "registration_hash": self.registration_hash_hex(),
            "issued_at": util::format_rfc3339(self.issued_at),
            "text": self.to_text(),
        })
    }
}

fn signed_bytes(serial: &str, registration_hash: &[u8; HASH_LEN], issued_at: OffsetDateTime) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + serial.len() + HASH_LEN + TS_LEN + SIGNATURE_LEN);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    // Serial grammar caps the length at 128 bytes.
    out.push(u8::try_from(serial.len()).unwrap_or(u8::MAX));
    out.extend_from_slice(serial.as_bytes());
    out.extend_from_slice(registration_hash);
    out.extend_from_slice(&issued_at.unix_timestamp().to_be_bytes());
    out
}

fn whole_seconds_utc(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts - Duration::nanoseconds(i64::from(ts.nanosecond()))
}

// ---------------------------------------------------------------------------
// Validity policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrValidity {
    /// Maximum age of a payload at verification time.
    pub validity: Duration,
    /// Tolerated forward drift between issuing desk and gate clocks.
    pub max_clock_skew: Duration,
}

impl Default for QrValidity {
    fn default() -> Self {
        Self {
            validity: Duration::days(365),
            max_clock_skew: Duration::minutes(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Issuer (holds the signing key)
// ---------------------------------------------------------------------------

pub struct QrIssuer {
    signing_key: SigningKey,
}

impl std::fmt::Debug for QrIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrIssuer")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

impl QrIssuer {
    /// A fresh random key.  Payloads it issues die with the process unless
    /// the key is persisted via [`QrIssuer::secret_key_b64`].
    pub fn generate() -> Self {
        use rand::RngCore as _;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// `sk_b64` is the base64-encoded 32-byte Ed25519 secret key.
    pub fn from_secret_b64(sk_b64: &str) -> Result<Self> {
        let sk_bytes = util::b64_decode(sk_b64.trim()).ctx_codec("decode QR signing key")?;
        let sk_arr: [u8; 32] = sk_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CustodyError::Codec("QR signing key must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&sk_arr),
        })
    }

    pub fn from_key_file(path: &Path) -> Result<Self> {
        // Key paths stay out of error strings.
        let text = std::fs::read_to_string(path)
            .map_err(|e| CustodyError::Codec(format!("read QR signing key failed: {e}")))?;
        Self::from_secret_b64(&text)
    }

    pub fn public_key_b64(&self) -> String {
        util::b64_encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn secret_key_b64(&self) -> String {
        util::b64_encode(self.signing_key.as_bytes())
    }

    pub fn verifier(&self, validity: QrValidity) -> QrVerifier {
        QrVerifier {
            verifying_key: self.signing_key.verifying_key(),
            validity,
        }
    }

    pub fn encode(&self, equipment: &Equipment, issued_at: OffsetDateTime) -> QrPayload {
        let issued_at = whole_seconds_utc(issued_at);
        let registration_hash = equipment.registration_hash();
        let msg = signed_bytes(&equipment.serial, &registration_hash, issued_at);
        let sig: Signature = self.signing_key.sign(&msg);
        QrPayload {
            serial: equipment.serial.clone(),
            registration_hash,
            issued_at,
            signature: sig.to_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier (public key only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QrVerifier {
    verifying_key: VerifyingKey,
    validity: QrValidity,
}

impl QrVerifier {
    pub fn from_public_b64(pk_b64: &str, validity: QrValidity) -> Result<Self> {
        let pk_bytes = util::b64_decode(pk_b64.trim()).ctx_codec("decode QR verify key")?;
        let pk_arr: [u8; 32] = pk_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CustodyError::Codec("QR verify key must be 32 bytes".into()))?;
        let verifying_key =
            VerifyingKey::from_bytes(&pk_arr).ctx_codec("parse ed25519 verify key")?;
        Ok(Self {
            verifying_key,
            validity,
        })
    }

    /// Parse, verify the signature, then check the validity window.
    pub fn decode(&self, raw: &str, now: OffsetDateTime) -> std::result::Result<QrPayload, DecodeError> {
        let payload = QrPayload::parse_text(raw)?;

        let sig = Signature::from_bytes(&payload.signature);
        self.verifying_key
            .verify_strict(&payload.signed_bytes(), &sig)
            .map_err(|_| DecodeError::SignatureInvalid)?;

        if payload.issued_at > now + self.validity.max_clock_skew {
            return Err(DecodeError::Malformed(
                "issue time lies in the future".into(),
            ));
        }
        if now - payload.issued_at > self.validity.validity {
            return Err(DecodeError::Expired {
                issued_at: util::format_rfc3339(payload.issued_at),
                validity_secs: self.validity.validity.whole_seconds(),
            });
        }
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

/// Generate an Ed25519 keypair for QR signing.
/// Writes `qr_signing.key` (base64) and `qr_verify.key` (base64) to `out_dir`.
pub fn generate_signing_keypair(out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .map_err(|e| CustodyError::Codec(format!("create dir {}: {e}", out_dir.display())))?;

    let issuer = QrIssuer::generate();

    let sk_path = out_dir.join(SIGNING_KEY_FILE);
    std::fs::write(&sk_path, issuer.secret_key_b64())
        .map_err(|e| CustodyError::Codec(format!("write {}: {e}", sk_path.display())))?;

    let pk_path = out_dir.join(VERIFY_KEY_FILE);
    std::fs::write(&pk_path, issuer.public_key_b64())
        .map_err(|e| CustodyError::Codec(format!("write {}: {e}", pk_path.display())))?;

    Ok(())
}
