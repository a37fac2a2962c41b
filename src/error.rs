//! Structured error types for the custody core.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`CustodyError`].  Component-level failures keep their own
//! enums ([`DecodeError`], [`TransitionError`], [`LedgerError`], [`LogError`])
//! so callers can match on the exact rejection reason.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Component errors
// ---------------------------------------------------------------------------

/// Failure to decode or verify a scanned QR payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed QR payload: {0}")]
    Malformed(String),

    #[error("QR signature does not verify")]
    SignatureInvalid,

    #[error("QR payload expired (issued {issued_at}, valid for {validity_secs}s)")]
    Expired { issued_at: String, validity_secs: i64 },
}

/// A requested custody transition that the state machine refuses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("identity unverified: {0}")]
    IdentityUnverified(String),

    #[error("equipment already inside: entry denied")]
    AlreadyInside,

    #[error("equipment not currently inside: exit denied")]
    NotCurrentlyInside,

    #[error("equipment already registered")]
    AlreadyRegistered,

    #[error("equipment is flagged: administrative override required")]
    Flagged,

    #[error("equipment '{0}' is not registered")]
    NotRegistered(String),

    #[error("a note is required for this transition")]
    MissingNote,

    #[error("event seq {0} does not belong to this equipment")]
    UnknownDisputedEvent(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The event is not causally after the current head of its serial.
    #[error("out-of-order append for '{serial}': {detail}")]
    OutOfOrder { serial: String, detail: String },

    /// Hash-chain or cross-reference verification failed.
    #[error("integrity check failed: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The audit sink cannot be written.  Fatal for the operation.
    #[error("traceability sink unavailable: {0}")]
    SinkUnavailable(String),
}

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("transition rejected: {0}")]
    Transition(#[from] TransitionError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("audit log: {0}")]
    Log(#[from] LogError),

    #[error("duplicate serial '{0}'")]
    DuplicateSerial(String),

    #[error("equipment '{0}' is not registered")]
    NotRegistered(String),

    #[error("codec: {0}")]
    Codec(String),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("report: {0}")]
    Report(String),

    /// Direct database errors (auto-converted via `?` in the store module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl CustodyError {
    /// True for rejections caused by a missing, forged, malformed or expired QR.
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            Self::Transition(TransitionError::IdentityUnverified(_))
        )
    }

    /// True when the operation aborted because the audit trail could not be written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Log(LogError::SinkUnavailable(_)))
    }

    pub fn transition(&self) -> Option<&TransitionError> {
        match self {
            Self::Transition(t) => Some(t),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, CustodyError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Adds domain context to any `Result<T, E>`, tagging the error with the
/// originating subsystem.
///
/// ```ignore
/// std::fs::read(path).ctx_codec("read signing key")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_codec(self, msg: &str) -> Result<T>;
    fn ctx_ledger(self, msg: &str) -> Result<T>;
    fn ctx_report(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
    fn ctx_sink(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_codec(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Codec(format!("{msg}: {e}")))
    }
    fn ctx_ledger(self, msg: &str) -> Result<T> {
        self.map_err(|e| LedgerError::Corrupt(format!("{msg}: {e}")).into())
    }
    fn ctx_report(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Report(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Config(format!("{msg}: {e}")))
    }
    fn ctx_sink(self, msg: &str) -> Result<T> {
        self.map_err(|e| LogError::SinkUnavailable(format!("{msg}: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_visible_messages() {
        let e: CustodyError = TransitionError::NotCurrentlyInside.into();
        assert!(e.to_string().contains("not currently inside"));
        let e: CustodyError = TransitionError::AlreadyInside.into();
        assert!(e.to_string().contains("already inside"));
    }

    #[test]
    fn identity_and_fatal_classification() {
        let id: CustodyError =
            TransitionError::IdentityUnverified("QR signature does not verify".into()).into();
        assert!(id.is_identity_error());
        assert!(!id.is_fatal());

        let sink: CustodyError = LogError::SinkUnavailable("disk gone".into()).into();
        assert!(sink.is_fatal());
        assert!(sink.transition().is_none());
    }

    #[test]
    fn context_tags_subsystem() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.ctx_sink("write trace").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("write trace: boom"));
    }
}
