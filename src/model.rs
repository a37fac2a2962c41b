//! Custody domain types: equipment identity, events, states, audit entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CustodyError, Result};
use crate::util;

// ---------------------------------------------------------------------------
// Equipment
// ---------------------------------------------------------------------------

/// Closed set of equipment categories.  Behavioural differences between
/// categories are expressed as [`Capability`] tags, not as separate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Technological,
    Biomedical,
}

/// Validation rules attached to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Registration must carry a photo reference.
    RequiresPhoto,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technological => "technological",
            Self::Biomedical => "biomedical",
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::Technological => &[],
            Self::Biomedical => &[Capability::RequiresPhoto],
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "technological" | "tech" => Ok(Self::Technological),
            "biomedical" | "bio" => Ok(Self::Biomedical),
            other => Err(CustodyError::Validation(format!(
                "unknown category '{}' (expected technological|biomedical)",
                util::audit_label(other)
            ))),
        }
    }
}

/// Registration request as received from the outer layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEquipment {
    pub serial: String,
    pub category: Category,
    pub custodian: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

impl NewEquipment {
    pub fn new(serial: impl Into<String>, category: Category, custodian: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            category,
            custodian: custodian.into(),
            description: None,
            photo_ref: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_photo(mut self, photo_ref: impl Into<String>) -> Self {
        self.photo_ref = Some(photo_ref.into());
        self
    }

    /// Field-level validation, including category capability rules.
    pub fn validate(&self) -> Result<()> {
        util::validate_serial(&self.serial)?;
        util::validate_label(&self.custodian, "custodian")?;
        if let Some(d) = &self.description {
            util::validate_note(d)?;
        }
        if let Some(p) = &self.photo_ref {
            util::validate_label(p, "photo reference")?;
        }
        if self.category.has(Capability::RequiresPhoto)
            && self.photo_ref.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(CustodyError::Validation(format!(
                "{} equipment requires a photo reference",
                self.category
            )));
        }
        Ok(())
    }

    pub fn into_equipment(self, registered_at: OffsetDateTime) -> Equipment {
        Equipment {
            serial: self.serial,
            category: self.category,
            custodian: self.custodian.trim().to_string(),
            description: self.description.map(|d| d.trim().to_string()),
            photo_ref: self.photo_ref.map(|p| p.trim().to_string()),
            registered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub serial: String,
    pub category: Category,
    pub custodian: String,
    pub description: Option<String>,
    pub photo_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

impl Equipment {
    /// Deterministic, order-stable rendering used for the registration hash.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut msg = String::new();
        msg.push_str("EQUIPMENT REGISTRATION v1\n");
        msg.push_str(&format!("serial={}\n", self.serial));
        msg.push_str(&format!("category={}\n", self.category));
        msg.push_str(&format!("custodian={}\n", self.custodian));
        msg.push_str(&format!(
            "description={}\n",
            self.description.as_deref().unwrap_or("")
        ));
        msg.push_str(&format!(
            "photo_ref={}\n",
            self.photo_ref.as_deref().unwrap_or("")
        ));
        msg.push_str(&format!(
            "registered_at={}\n",
            self.registered_at.unix_timestamp_nanos()
        ));
        msg.into_bytes()
    }

    pub fn registration_hash(&self) -> [u8; 32] {
        util::sha256(&self.canonical_bytes())
    }
}

// ---------------------------------------------------------------------------
// Events and states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Registered,
    Entry,
    Exit,
    Flagged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
            Self::Flagged => "FLAGGED",
        }
    }

    /// ENTRY and EXIT are gate transitions and need a verified QR payload.
    pub fn requires_identity(&self) -> bool {
        matches!(self, Self::Entry | Self::Exit)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REGISTERED" => Ok(Self::Registered),
            "ENTRY" => Ok(Self::Entry),
            "EXIT" => Ok(Self::Exit),
            "FLAGGED" => Ok(Self::Flagged),
            other => Err(CustodyError::Validation(format!(
                "unknown event kind '{}'",
                util::audit_label(other)
            ))),
        }
    }
}

/// Derived custody state of a serial.  Never stored; always the image of the
/// last event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustodyState {
    Unknown,
    Registered,
    Inside,
    Outside,
    Flagged,
}

impl CustodyState {
    pub fn after(kind: EventKind) -> Self {
        match kind {
            EventKind::Registered => Self::Registered,
            EventKind::Entry => Self::Inside,
            EventKind::Exit => Self::Outside,
            EventKind::Flagged => Self::Flagged,
        }
    }

    /// Replay a chronologically ordered event sequence.
    pub fn replay<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a CustodyEvent>,
    {
        events
            .into_iter()
            .fold(Self::Unknown, |_, e| Self::after(e.kind))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Registered => "REGISTERED",
            Self::Inside => "INSIDE",
            Self::Outside => "OUTSIDE",
            Self::Flagged => "FLAGGED",
        }
    }
}

impl fmt::Display for CustodyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be appended.  `version` is the per-serial position the
/// writer expects the event to take (head version + 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInput {
    pub serial: String,
    pub version: u64,
    pub kind: EventKind,
    pub actor: String,
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(default)]
    pub note: Option<String>,
    /// Ledger sequence of the event a FLAGGED correction disputes.
    #[serde(default)]
    pub references: Option<u64>,
}

/// An appended, immutable custody fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyEvent {
    /// Global ledger sequence (1-based).
    pub seq: u64,
    /// Position within the serial's own history (1-based).
    pub version: u64,
    pub serial: String,
    pub kind: EventKind,
    pub actor: String,
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub note: Option<String>,
    pub references: Option<u64>,
    pub entry_hash_hex: String,
}

impl CustodyEvent {
    pub fn committed(seq: u64, input: EventInput, entry_hash_hex: String) -> Self {
        Self {
            seq,
            version: input.version,
            serial: input.serial,
            kind: input.kind,
            actor: input.actor,
            location: input.location,
            ts: input.ts,
            note: input.note,
            references: input.references,
            entry_hash_hex,
        }
    }

    pub fn state_after(&self) -> CustodyState {
        CustodyState::after(self.kind)
    }
}

// ---------------------------------------------------------------------------
// Audit entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for Outcome {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(CustodyError::Validation(format!(
                "unknown outcome '{}'",
                util::audit_label(other)
            ))),
        }
    }
}

/// An audit record about to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInput {
    pub attempt_id: Uuid,
    pub serial: String,
    pub kind: EventKind,
    pub actor: String,
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(default)]
    pub note: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub reason: Option<String>,
    /// Ledger sequence of the event this attempt produced; filled in by the
    /// store when the event and trace commit together.
    #[serde(default)]
    pub event_seq: Option<u64>,
}

impl TraceInput {
    pub fn accepted(event: &EventInput) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            serial: event.serial.clone(),
            kind: event.kind,
            actor: event.actor.clone(),
            location: event.location.clone(),
            ts: event.ts,
            note: event.note.clone(),
            outcome: Outcome::Accepted,
            reason: None,
            event_seq: None,
        }
    }

    /// A rejected attempt.  Caller-supplied strings are sanitised so the
    /// audit record can always be written.
    pub fn rejected(
        serial: &str,
        kind: EventKind,
        actor: &str,
        location: &str,
        ts: OffsetDateTime,
        note: Option<&str>,
        reason: &str,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            serial: util::audit_label(serial),
            kind,
            actor: util::audit_label(actor),
            location: util::audit_label(location),
            ts,
            note: note.map(|n| n.chars().take(util::MAX_NOTE_LEN).collect()),
            outcome: Outcome::Rejected,
            reason: Some(reason.to_string()),
            event_seq: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub seq: u64,
    pub attempt_id: Uuid,
    pub serial: String,
    pub kind: EventKind,
    pub actor: String,
    pub location: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub note: Option<String>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub event_seq: Option<u64>,
    pub entry_hash_hex: String,
}

impl TraceEntry {
    pub fn committed(seq: u64, input: TraceInput, entry_hash_hex: String) -> Self {
        Self {
            seq,
            attempt_id: input.attempt_id,
            serial: input.serial,
            kind: input.kind,
            actor: input.actor,
            location: input.location,
            ts: input.ts,
            note: input.note,
            outcome: input.outcome,
            reason: input.reason,
            event_seq: input.event_seq,
            entry_hash_hex,
        }
    }

    /// Rejected attempts and FLAGGED events are reportable exceptions.
    pub fn is_exception(&self) -> bool {
        self.outcome == Outcome::Rejected || self.kind == EventKind::Flagged
    }
}

// ---------------------------------------------------------------------------
// Date ranges
// ---------------------------------------------------------------------------

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl DateRange {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if start > end {
            return Err(CustodyError::Validation(
                "date range start must not be after its end".into(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Everything from the Unix epoch up to `end`.
    pub fn until(end: OffsetDateTime) -> Self {
        Self {
            start: OffsetDateTime::UNIX_EPOCH.min(end),
            end,
        }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(version: u64, kind: EventKind) -> CustodyEvent {
        CustodyEvent {
            seq: version,
            version,
            serial: "S-1".into(),
            kind,
            actor: "op".into(),
            location: "gate".into(),
            ts: datetime!(2025-01-01 00:00 UTC),
            note: None,
            references: None,
            entry_hash_hex: String::new(),
        }
    }

    #[test]
    fn replay_follows_last_event() {
        let events = vec![
            event(1, EventKind::Registered),
            event(2, EventKind::Entry),
            event(3, EventKind::Exit),
        ];
        assert_eq!(CustodyState::replay(&events[..0]), CustodyState::Unknown);
        assert_eq!(CustodyState::replay(&events[..2]), CustodyState::Inside);
        assert_eq!(CustodyState::replay(&events), CustodyState::Outside);
    }

    #[test]
    fn category_parsing_and_capabilities() {
        assert_eq!("Biomedical".parse::<Category>().unwrap(), Category::Biomedical);
        assert_eq!("tech".parse::<Category>().unwrap(), Category::Technological);
        assert!("furniture".parse::<Category>().is_err());
        assert!(Category::Biomedical.has(Capability::RequiresPhoto));
        assert!(!Category::Technological.has(Capability::RequiresPhoto));
    }

    #[test]
    fn biomedical_requires_photo() {
        let bare = NewEquipment::new("BIO-9", Category::Biomedical, "Dr. Ruiz");
        assert!(bare.validate().is_err());
        assert!(bare.with_photo("photos/bio-9.jpg").validate().is_ok());
        assert!(NewEquipment::new("TEC-9", Category::Technological, "IT")
            .validate()
            .is_ok());
    }

    #[test]
    fn registration_hash_is_stable_and_field_sensitive() {
        let ts = datetime!(2025-01-01 00:00 UTC);
        let a = NewEquipment::new("TEC-1", Category::Technological, "Ana").into_equipment(ts);
        let mut b = a.clone();
        assert_eq!(a.registration_hash(), b.registration_hash());
        b.custodian = "Bea".into();
        assert_ne!(a.registration_hash(), b.registration_hash());
    }

    #[test]
    fn date_range_bounds() {
        let start = datetime!(2025-01-01 00:00 UTC);
        let end = datetime!(2025-01-02 00:00 UTC);
        let r = DateRange::new(start, end).unwrap();
        assert!(r.contains(start));
        assert!(r.contains(end));
        assert!(!r.contains(datetime!(2025-01-02 00:00:01 UTC)));
        assert!(DateRange::new(end, start).is_err());
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(serde_json::to_string(&EventKind::Flagged).unwrap(), "\"FLAGGED\"");
        assert_eq!("EXIT".parse::<EventKind>().unwrap(), EventKind::Exit);
        assert!(EventKind::Entry.requires_identity());
        assert!(!EventKind::Flagged.requires_identity());
    }
}
