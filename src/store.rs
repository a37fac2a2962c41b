//! Durable store abstraction consumed by the ledger and the traceability log.
//!
//! A store keeps three append-only collections: equipment records, custody
//! events and trace entries.  Events and traces are each hash-chained.  A
//! [`Commit`] is the unit of atomicity: the optional equipment record, the
//! optional event and its trace entry become visible together or not at all.
//!
//! Two backends ship with the crate: [`crate::sqlite::SqliteStore`] for
//! production and [`MemoryStore`] for tests and simulations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CustodyError, LedgerError, LogError, Result, ResultExt as _};
use crate::model::{
    CustodyEvent, DateRange, Equipment, EventInput, EventKind, Outcome, TraceEntry, TraceInput,
};
use crate::util;

/// Page size used by lazy readers.
pub const PAGE_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Commit unit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Commit {
    /// Present only for the initial registration.
    pub equipment: Option<Equipment>,
    /// Absent for rejected attempts.
    pub event: Option<EventInput>,
    pub trace: TraceInput,
}

impl Commit {
    pub fn rejected(trace: TraceInput) -> Self {
        Self {
            equipment: None,
            event: None,
            trace,
        }
    }

    pub fn accepted(event: EventInput) -> Self {
        let trace = TraceInput::accepted(&event);
        Self {
            equipment: None,
            event: Some(event),
            trace,
        }
    }

    pub fn registration(equipment: Equipment, event: EventInput) -> Self {
        let mut commit = Self::accepted(event);
        commit.equipment = Some(equipment);
        commit
    }

    /// Structural checks shared by every backend.
    pub(crate) fn validate(&self) -> Result<()> {
        match (&self.event, self.trace.outcome) {
            (Some(ev), Outcome::Accepted) => {
                if ev.serial != self.trace.serial {
                    return Err(CustodyError::Validation(
                        "trace entry does not describe the committed event".into(),
                    ));
                }
            }
            (None, Outcome::Rejected) => {}
            _ => {
                return Err(CustodyError::Validation(
                    "accepted trace entries require an event, rejected ones forbid it".into(),
                ))
            }
        }
        if let Some(eq) = &self.equipment {
            match &self.event {
                Some(ev) if ev.kind == EventKind::Registered && ev.serial == eq.serial => {}
                _ => {
                    return Err(CustodyError::Validation(
                        "equipment records are committed with their REGISTERED event".into(),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Committed {
    pub event: Option<CustodyEvent>,
    pub trace: TraceEntry,
}

/// Enforce per-serial causality against the current head.
pub(crate) fn check_causality(head: Option<&CustodyEvent>, input: &EventInput) -> Result<()> {
    let expected = head.map_or(1, |h| h.version + 1);
    if input.version != expected {
        return Err(LedgerError::OutOfOrder {
            serial: input.serial.clone(),
            detail: format!("version {} but head expects {expected}", input.version),
        }
        .into());
    }
    if let Some(h) = head {
        if input.ts < h.ts {
            return Err(LedgerError::OutOfOrder {
                serial: input.serial.clone(),
                detail: format!(
                    "timestamp {} precedes head {}",
                    util::format_rfc3339(input.ts),
                    util::format_rfc3339(h.ts)
                ),
            }
            .into());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    pub serial: Option<String>,
    pub range: Option<DateRange>,
    pub outcome: Option<Outcome>,
    /// Operator who made the attempt.
    pub actor: Option<String>,
}

impl TraceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Self::default()
        }
    }

    pub fn in_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn matches(&self, t: &TraceEntry) -> bool {
        self.serial.as_deref().map_or(true, |s| s == t.serial)
            && self.range.map_or(true, |r| r.contains(t.ts))
            && self.outcome.map_or(true, |o| o == t.outcome)
            && self.actor.as_deref().map_or(true, |a| a == t.actor)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub events: u64,
    pub traces: u64,
    pub serials: u64,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait CustodyStore: Send + Sync {
    /// Atomically persist a commit unit.
    ///
    /// Fails with `DuplicateSerial` when registering an existing serial,
    /// `NotRegistered` for events of unknown equipment, `LedgerError::OutOfOrder`
    /// when the event is not causally after the head, and
    /// `LogError::SinkUnavailable` when the trace cannot be written.  On any
    /// failure nothing is persisted.
    fn commit(&self, commit: Commit) -> Result<Committed>;

    fn equipment(&self, serial: &str) -> Result<Option<Equipment>>;

    /// All registered equipment, ordered by serial.
    fn equipment_list(&self) -> Result<Vec<Equipment>>;

    fn head(&self, serial: &str) -> Result<Option<CustodyEvent>>;

    /// Events of `serial` with `version > after_version`, oldest first.
    fn events_page(&self, serial: &str, after_version: u64, limit: usize)
        -> Result<Vec<CustodyEvent>>;

    /// Trace entries matching `filter` with `seq > after_seq`, in sequence order.
    fn traces_page(&self, filter: &TraceFilter, after_seq: u64, limit: usize)
        -> Result<Vec<TraceEntry>>;

    /// Recompute both hash chains and cross-check events against traces.
    fn verify_integrity(&self) -> Result<IntegrityReport>;
}

// ---------------------------------------------------------------------------
// Chain rows and verification
// ---------------------------------------------------------------------------

/// A hash-chained row as persisted (and as exported in backups).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRow {
    pub seq: u64,
    pub serial: String,
    pub payload_json: String,
    pub payload_hash_hex: String,
    pub prev_hash_hex: String,
    pub entry_hash_hex: String,
}

impl ChainRow {
    pub(crate) fn link(seq: u64, serial: &str, payload_json: String, prev: &[u8; 32]) -> (Self, [u8; 32]) {
        let (payload_hash, entry_hash) = util::chain_link(prev, payload_json.as_bytes());
        let row = Self {
            seq,
            serial: serial.to_string(),
            payload_json,
            payload_hash_hex: hex::encode(payload_hash),
            prev_hash_hex: hex::encode(prev),
            entry_hash_hex: hex::encode(entry_hash),
        };
        (row, entry_hash)
    }

    pub(crate) fn to_event(&self) -> Result<CustodyEvent> {
        let input: EventInput =
            serde_json::from_str(&self.payload_json).ctx_ledger("decode event payload")?;
        Ok(CustodyEvent::committed(self.seq, input, self.entry_hash_hex.clone()))
    }

    pub(crate) fn to_trace(&self) -> Result<TraceEntry> {
        let input: TraceInput =
            serde_json::from_str(&self.payload_json).ctx_ledger("decode trace payload")?;
        Ok(TraceEntry::committed(self.seq, input, self.entry_hash_hex.clone()))
    }
}

fn corrupt(msg: String) -> CustodyError {
    LedgerError::Corrupt(msg).into()
}

#[derive(Debug)]
struct ChainCursor {
    table: &'static str,
    prev: [u8; 32],
    next_seq: u64,
}

impl ChainCursor {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            prev: util::GENESIS_HASH,
            next_seq: 1,
        }
    }

    fn link(&mut self, row: &ChainRow) -> Result<()> {
        let t = self.table;
        if row.seq != self.next_seq {
            return Err(corrupt(format!(
                "{t}: expected seq {} but found {}",
                self.next_seq, row.seq
            )));
        }
        if hex::encode(self.prev) != row.prev_hash_hex {
            return Err(corrupt(format!("{t}: prev_hash mismatch at seq {}", row.seq)));
        }
        let (payload_hash, entry_hash) = util::chain_link(&self.prev, row.payload_json.as_bytes());
        if hex::encode(payload_hash) != row.payload_hash_hex {
            return Err(corrupt(format!("{t}: payload_hash mismatch at seq {}", row.seq)));
        }
        if hex::encode(entry_hash) != row.entry_hash_hex {
            return Err(corrupt(format!("{t}: entry_hash mismatch at seq {}", row.seq)));
        }
        self.prev = entry_hash;
        self.next_seq += 1;
        Ok(())
    }
}

/// Streaming verifier fed all event rows first, then all trace rows, each in
/// sequence order.
#[derive(Debug)]
pub(crate) struct IntegrityChecker {
    events: ChainCursor,
    traces: ChainCursor,
    heads: HashMap<String, (u64, OffsetDateTime)>,
    accepted: BTreeMap<u64, u32>,
}

impl IntegrityChecker {
    pub(crate) fn new() -> Self {
        Self {
            events: ChainCursor::new("events"),
            traces: ChainCursor::new("traces"),
            heads: HashMap::new(),
            accepted: BTreeMap::new(),
        }
    }

    pub(crate) fn event(&mut self, row: &ChainRow) -> Result<()> {
        self.events.link(row)?;
        let ev = row.to_event()?;
        if ev.serial != row.serial {
            return Err(corrupt(format!("events: serial column mismatch at seq {}", row.seq)));
        }
        let (expected, last_ts) = match self.heads.get(&ev.serial) {
            Some((v, ts)) => (v + 1, Some(*ts)),
            None => (1, None),
        };
        if ev.version != expected {
            return Err(corrupt(format!(
                "events: '{}' version {} at seq {} (expected {expected})",
                ev.serial, ev.version, row.seq
            )));
        }
        if last_ts.is_some_and(|ts| ev.ts < ts) {
            return Err(corrupt(format!("events: timestamp regression at seq {}", row.seq)));
        }
        if ev.version == 1 && ev.kind != EventKind::Registered {
            return Err(corrupt(format!(
                "events: history of '{}' does not start with REGISTERED",
                ev.serial
            )));
        }
        self.heads.insert(ev.serial, (ev.version, ev.ts));
        self.accepted.insert(row.seq, 0);
        Ok(())
    }

    pub(crate) fn trace(&mut self, row: &ChainRow) -> Result<()> {
        self.traces.link(row)?;
        let t = row.to_trace()?;
        if t.serial != row.serial {
            return Err(corrupt(format!("traces: serial column mismatch at seq {}", row.seq)));
        }
        match (t.outcome, t.event_seq) {
            (Outcome::Accepted, Some(event_seq)) => match self.accepted.get_mut(&event_seq) {
                Some(n) => *n += 1,
                None => {
                    return Err(corrupt(format!(
                        "traces: seq {} references unknown event {event_seq}",
                        row.seq
                    )))
                }
            },
            (Outcome::Accepted, None) => {
                return Err(corrupt(format!(
                    "traces: accepted entry {} has no event",
                    row.seq
                )))
            }
            (Outcome::Rejected, Some(_)) => {
                return Err(corrupt(format!(
                    "traces: rejected entry {} references an event",
                    row.seq
                )))
            }
            (Outcome::Rejected, None) => {}
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<IntegrityReport> {
        if let Some((seq, n)) = self.accepted.iter().find(|(_, n)| **n != 1) {
            return Err(corrupt(format!(
                "event seq {seq} has {n} accepted trace entries (expected 1)"
            )));
        }
        Ok(IntegrityReport {
            events: self.events.next_seq - 1,
            traces: self.traces.next_seq - 1,
            serials: self.heads.len() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    equipment: BTreeMap<String, Equipment>,
    events: Vec<ChainRow>,
    /// Indexes into `events` per serial, in version order.
    by_serial: HashMap<String, Vec<usize>>,
    traces: Vec<ChainRow>,
    event_tip: Option<[u8; 32]>,
    trace_tip: Option<[u8; 32]>,
}

impl MemoryInner {
    fn head(&self, serial: &str) -> Result<Option<CustodyEvent>> {
        self.by_serial
            .get(serial)
            .and_then(|idx| idx.last())
            .map(|&i| self.events[i].to_event())
            .transpose()
    }
}

/// Volatile store with the same semantics as the SQLite backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    sink_down: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate loss of the trace sink.  While unavailable every commit fails
    /// with `SinkUnavailable` and nothing is persisted.
    pub fn set_trace_sink_available(&self, available: bool) {
        self.sink_down.store(!available, Ordering::SeqCst);
    }
}

impl CustodyStore for MemoryStore {
    fn commit(&self, commit: Commit) -> Result<Committed> {
        commit.validate()?;
        let mut inner = self.inner.write();

        // Validate everything before touching state.
        if let Some(input) = &commit.event {
            match &commit.equipment {
                Some(eq) if inner.equipment.contains_key(&eq.serial) => {
                    return Err(CustodyError::DuplicateSerial(eq.serial.clone()));
                }
                None if !inner.equipment.contains_key(&input.serial) => {
                    return Err(CustodyError::NotRegistered(input.serial.clone()));
                }
                _ => {}
            }
            let head = inner.head(&input.serial)?;
            check_causality(head.as_ref(), input)?;
        }
        if self.sink_down.load(Ordering::SeqCst) {
            return Err(LogError::SinkUnavailable("trace sink offline".into()).into());
        }

        let mut trace = commit.trace;
        let event = match commit.event {
            Some(input) => {
                let seq = inner.events.len() as u64 + 1;
                let payload = serde_json::to_string(&input).ctx_ledger("encode event payload")?;
                let prev = inner.event_tip.unwrap_or(util::GENESIS_HASH);
                let (row, tip) = ChainRow::link(seq, &input.serial, payload, &prev);
                let event = CustodyEvent::committed(seq, input, row.entry_hash_hex.clone());
                trace.event_seq = Some(seq);
                Some((row, tip, event))
            }
            None => None,
        };

        let trace_seq = inner.traces.len() as u64 + 1;
        let trace_payload = serde_json::to_string(&trace).ctx_sink("encode trace payload")?;
        let trace_prev = inner.trace_tip.unwrap_or(util::GENESIS_HASH);
        let (trace_row, trace_tip) =
            ChainRow::link(trace_seq, &trace.serial, trace_payload, &trace_prev);
        let trace_entry = TraceEntry::committed(trace_seq, trace, trace_row.entry_hash_hex.clone());

        if let Some(eq) = commit.equipment {
            inner.equipment.insert(eq.serial.clone(), eq);
        }
        let event = event.map(|(row, tip, event)| {
            let idx = inner.events.len();
            inner.events.push(row);
            inner.event_tip = Some(tip);
            inner
                .by_serial
                .entry(event.serial.clone())
                .or_default()
                .push(idx);
            event
        });
        inner.traces.push(trace_row);
        inner.trace_tip = Some(trace_tip);

        Ok(Committed {
            event,
            trace: trace_entry,
        })
    }

    fn equipment(&self, serial: &str) -> Result<Option<Equipment>> {
        Ok(self.inner.read().equipment.get(serial).cloned())
    }

    fn equipment_list(&self) -> Result<Vec<Equipment>> {
        Ok(self.inner.read().equipment.values().cloned().collect())
    }

    fn head(&self, serial: &str) -> Result<Option<CustodyEvent>> {
        self.inner.read().head(serial)
    }

    fn events_page(&self, serial: &str, after_version: u64, limit: usize) -> Result<Vec<CustodyEvent>> {
        let inner = self.inner.read();
        let Some(idx) = inner.by_serial.get(serial) else {
            return Ok(Vec::new());
        };
        // Versions are 1-based and contiguous, so version v sits at idx[v - 1].
        let start = usize::try_from(after_version).unwrap_or(usize::MAX);
        idx.iter()
            .skip(start)
            .take(limit)
            .map(|&i| inner.events[i].to_event())
            .collect()
    }

    fn traces_page(&self, filter: &TraceFilter, after_seq: u64, limit: usize) -> Result<Vec<TraceEntry>> {
        let inner = self.inner.read();
        let start = usize::try_from(after_seq).unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for row in inner.traces.iter().skip(start) {
            if out.len() >= limit {
                break;
            }
            if filter.serial.as_deref().is_some_and(|s| s != row.serial) {
                continue;
            }
            let t = row.to_trace()?;
            if filter.matches(&t) {
                out.push(t);
            }
        }
        Ok(out)
    }

    fn verify_integrity(&self) -> Result<IntegrityReport> {
        let inner = self.inner.read();
        let mut checker = IntegrityChecker::new();
        for row in &inner.events {
            checker.event(row)?;
        }
        for row in &inner.traces {
            checker.trace(row)?;
        }
        let report = checker.finish()?;
        if inner.by_serial.keys().any(|s| !inner.equipment.contains_key(s)) {
            return Err(corrupt("events reference unregistered equipment".into()));
        }
        Ok(report)
    }
}
