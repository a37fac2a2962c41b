//! Custody state machine.
//!
//! ```text
//! UNKNOWN --register--> REGISTERED --entry--> INSIDE <--entry/exit--> OUTSIDE
//!                            ^                    |                       |
//!                            |                  flag                    flag
//!                        reinstate                v                       v
//!                            +--------------- FLAGGED <-------------------+
//! ```
//!
//! Every call to [`CustodyMachine::request_transition`] or
//! [`CustodyMachine::register`] leaves exactly one trace entry: the accepted
//! one committed with the event, or a rejected one.  The only exception is an
//! unavailable trace sink, which aborts the call.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{CustodyError, Result, TransitionError};
use crate::ledger::CustodyLedger;
use crate::locks::KeyedLocks;
use crate::model::{
    CustodyEvent, CustodyState, Equipment, EventInput, EventKind, NewEquipment, TraceInput,
};
use crate::qr::QrVerifier;
use crate::store::CustodyStore;
use crate::trace::TraceLog;
use crate::util;

/// The transition table.  Pure; identity and note requirements are checked
/// by the caller.
pub fn evaluate(
    serial: &str,
    current: CustodyState,
    kind: EventKind,
) -> std::result::Result<CustodyState, TransitionError> {
    use CustodyState as S;
    use EventKind as K;

    match (current, kind) {
        (S::Unknown, K::Registered) => Ok(S::Registered),
        (S::Unknown, _) => Err(TransitionError::NotRegistered(serial.to_string())),

        (S::Flagged, K::Registered) => Ok(S::Registered),
        (_, K::Registered) => Err(TransitionError::AlreadyRegistered),

        (S::Flagged, K::Entry | K::Exit) => Err(TransitionError::Flagged),

        (S::Registered | S::Outside, K::Entry) => Ok(S::Inside),
        (S::Inside, K::Entry) => Err(TransitionError::AlreadyInside),

        (S::Inside, K::Exit) => Ok(S::Outside),
        (S::Registered | S::Outside, K::Exit) => Err(TransitionError::NotCurrentlyInside),

        (_, K::Flagged) => Ok(S::Flagged),
    }
}

/// A requested custody change as received from the gate.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    pub serial: &'a str,
    pub kind: EventKind,
    pub actor: &'a str,
    pub location: &'a str,
    pub qr: Option<&'a str>,
    pub note: Option<&'a str>,
    /// Ledger sequence of a disputed event (FLAGGED only).
    pub references: Option<u64>,
}

impl<'a> TransitionRequest<'a> {
    pub fn new(serial: &'a str, kind: EventKind, actor: &'a str, location: &'a str) -> Self {
        Self {
            serial,
            kind,
            actor,
            location,
            qr: None,
            note: None,
            references: None,
        }
    }

    pub fn with_qr(mut self, qr: &'a str) -> Self {
        self.qr = Some(qr);
        self
    }

    pub fn with_note(mut self, note: &'a str) -> Self {
        self.note = Some(note);
        self
    }

    pub fn disputing(mut self, seq: u64) -> Self {
        self.references = Some(seq);
        self
    }
}

pub struct CustodyMachine {
    ledger: CustodyLedger,
    trace: TraceLog,
    verifier: QrVerifier,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl std::fmt::Debug for CustodyMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyMachine")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

fn invalid(e: CustodyError) -> CustodyError {
    match e {
        CustodyError::Validation(msg) => TransitionError::InvalidRequest(msg).into(),
        other => other,
    }
}

fn clean_note(note: Option<&str>) -> Option<String> {
    note.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string)
}

impl CustodyMachine {
    pub fn new(store: Arc<dyn CustodyStore>, verifier: QrVerifier, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: CustodyLedger::new(Arc::clone(&store)),
            trace: TraceLog::new(store),
            verifier,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    pub fn ledger(&self) -> &CustodyLedger {
        &self.ledger
    }

    pub fn trace_log(&self) -> &TraceLog {
        &self.trace
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Create the equipment record and its initial REGISTERED event.
    pub fn register(
        &self,
        new: NewEquipment,
        actor: &str,
        location: &str,
    ) -> Result<(Equipment, CustodyEvent)> {
        let serial = new.serial.clone();
        self.locks.with(&util::audit_label(&serial), || {
            let now = self.clock.now();
            let result = self
                .prepare_registration(new, actor, location, now)
                .and_then(|(equipment, event)| {
                    let audit = TraceInput::accepted(&event);
                    let committed = self.ledger.register(equipment.clone(), event, audit)?;
                    Ok((equipment, committed))
                });
            let attempt = Attempt {
                serial: &serial,
                kind: EventKind::Registered,
                actor,
                location,
                note: None,
            };
            let (equipment, event) = self.settle(attempt, now, result)?;
            info!(
                serial = %equipment.serial,
                category = %equipment.category,
                seq = event.seq,
                "equipment registered"
            );
            Ok((equipment, event))
        })
    }

    fn prepare_registration(
        &self,
        new: NewEquipment,
        actor: &str,
        location: &str,
        now: OffsetDateTime,
    ) -> Result<(Equipment, EventInput)> {
        new.validate()?;
        util::validate_label(actor, "actor")?;
        util::validate_label(location, "location")?;
        if self.ledger.equipment(&new.serial)?.is_some() {
            return Err(CustodyError::DuplicateSerial(new.serial));
        }
        let equipment = new.into_equipment(now);
        let event = EventInput {
            serial: equipment.serial.clone(),
            version: 1,
            kind: EventKind::Registered,
            actor: actor.trim().to_string(),
            location: location.trim().to_string(),
            ts: now,
            note: None,
            references: None,
        };
        Ok((equipment, event))
    }

    /// Validate and apply a transition for one serial.
    ///
    /// ENTRY and EXIT need a QR payload that decodes, verifies, is within its
    /// validity window and matches the stored registration record; otherwise
    /// the attempt fails with `IdentityUnverified` before the transition
    /// table is consulted.
    pub fn request_transition(&self, req: TransitionRequest<'_>) -> Result<CustodyEvent> {
        self.locks.with(&util::audit_label(req.serial), || {
            let now = self.clock.now();
            let result = self.prepare(&req, now).and_then(|input| {
                let audit = TraceInput::accepted(&input);
                self.ledger.append(input, audit)
            });
            let attempt = Attempt {
                serial: req.serial,
                kind: req.kind,
                actor: req.actor,
                location: req.location,
                note: req.note,
            };
            let event = self.settle(attempt, now, result)?;
            info!(
                serial = %event.serial,
                kind = %event.kind,
                actor = %event.actor,
                location = %event.location,
                seq = event.seq,
                version = event.version,
                "transition accepted"
            );
            Ok(event)
        })
    }

    fn prepare(&self, req: &TransitionRequest<'_>, now: OffsetDateTime) -> Result<EventInput> {
        util::validate_serial(req.serial).map_err(invalid)?;
        util::validate_label(req.actor, "actor").map_err(invalid)?;
        util::validate_label(req.location, "location").map_err(invalid)?;
        if let Some(note) = req.note {
            util::validate_note(note).map_err(invalid)?;
        }
        if req.references.is_some() && req.kind != EventKind::Flagged {
            return Err(TransitionError::InvalidRequest(
                "only FLAGGED events may reference a disputed event".into(),
            )
            .into());
        }

        if req.kind.requires_identity() {
            self.verify_identity(req.serial, req.qr, now)?;
        }

        let head = self.ledger.head(req.serial)?;
        let current = head
            .as_ref()
            .map_or(CustodyState::Unknown, CustodyEvent::state_after);
        if current == CustodyState::Unknown && req.kind == EventKind::Registered {
            // Initial registration carries the equipment record; see `register`.
            return Err(TransitionError::NotRegistered(req.serial.to_string()).into());
        }
        evaluate(req.serial, current, req.kind)?;

        let note = clean_note(req.note);
        let needs_note = req.kind == EventKind::Flagged
            || (req.kind == EventKind::Registered && current == CustodyState::Flagged);
        if needs_note && note.is_none() {
            return Err(TransitionError::MissingNote.into());
        }

        if let Some(seq) = req.references {
            self.ensure_own_event(req.serial, seq)?;
        }

        Ok(EventInput {
            serial: req.serial.to_string(),
            version: head.map_or(1, |h| h.version + 1),
            kind: req.kind,
            actor: req.actor.trim().to_string(),
            location: req.location.trim().to_string(),
            ts: now,
            note,
            references: req.references,
        })
    }

    fn verify_identity(&self, serial: &str, qr: Option<&str>, now: OffsetDateTime) -> Result<()> {
        let unverified = |reason: String| -> CustodyError {
            TransitionError::IdentityUnverified(reason).into()
        };

        let raw = qr.ok_or_else(|| unverified("QR payload required".into()))?;
        let payload = self
            .verifier
            .decode(raw, now)
            .map_err(|e| unverified(e.to_string()))?;
        if payload.serial != serial {
            return Err(unverified(format!(
                "QR payload belongs to '{}'",
                payload.serial
            )));
        }
        let equipment = self
            .ledger
            .equipment(serial)?
            .ok_or_else(|| TransitionError::NotRegistered(serial.to_string()))?;
        if equipment.registration_hash() != payload.registration_hash {
            return Err(unverified(
                "QR payload does not match the registration record".into(),
            ));
        }
        Ok(())
    }

    fn ensure_own_event(&self, serial: &str, seq: u64) -> Result<()> {
        for event in &self.ledger.history(serial) {
            if event?.seq == seq {
                return Ok(());
            }
        }
        Err(TransitionError::UnknownDisputedEvent(seq).into())
    }

    /// Turn a failed attempt into a rejected trace entry.  A sink failure is
    /// returned as is; nothing can be recorded then.
    fn settle<T>(&self, attempt: Attempt<'_>, now: OffsetDateTime, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if err.is_fatal() {
            error!(
                serial = %util::audit_label(attempt.serial),
                kind = %attempt.kind,
                error = %err,
                "audit sink unavailable; operation aborted"
            );
            return Err(err);
        }

        let reason = err.to_string();
        let trace = TraceInput::rejected(
            attempt.serial,
            attempt.kind,
            attempt.actor,
            attempt.location,
            now,
            attempt.note,
            &reason,
        );
        let entry = self.trace.record(trace)?;
        warn!(
            serial = %entry.serial,
            kind = %entry.kind,
            actor = %entry.actor,
            location = %entry.location,
            trace_seq = entry.seq,
            reason = %reason,
            "transition rejected"
        );
        Err(err)
    }
}

/// What a rejected trace entry records about the attempt.
struct Attempt<'a> {
    serial: &'a str,
    kind: EventKind,
    actor: &'a str,
    location: &'a str,
    note: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Category, Outcome};
    use crate::qr::{QrIssuer, QrValidity};
    use crate::store::{MemoryStore, TraceFilter};
    use time::macros::datetime;
    use time::Duration;

    const ALL_STATES: [CustodyState; 5] = [
        CustodyState::Unknown,
        CustodyState::Registered,
        CustodyState::Inside,
        CustodyState::Outside,
        CustodyState::Flagged,
    ];
    const ALL_KINDS: [EventKind; 4] = [
        EventKind::Registered,
        EventKind::Entry,
        EventKind::Exit,
        EventKind::Flagged,
    ];

    #[test]
    fn table_allows_exactly_the_documented_moves() {
        use CustodyState as S;
        use EventKind as K;
        let allowed = [
            (S::Unknown, K::Registered),
            (S::Flagged, K::Registered),
            (S::Registered, K::Entry),
            (S::Outside, K::Entry),
            (S::Inside, K::Exit),
            (S::Registered, K::Flagged),
            (S::Inside, K::Flagged),
            (S::Outside, K::Flagged),
            (S::Flagged, K::Flagged),
        ];
        for state in ALL_STATES {
            for kind in ALL_KINDS {
                let ok = evaluate("S", state, kind).is_ok();
                assert_eq!(ok, allowed.contains(&(state, kind)), "{state} + {kind}");
                if let Ok(next) = evaluate("S", state, kind) {
                    assert_eq!(next, CustodyState::after(kind));
                }
            }
        }
    }

    #[test]
    fn table_reasons() {
        assert_eq!(
            evaluate("S", CustodyState::Outside, EventKind::Exit),
            Err(TransitionError::NotCurrentlyInside)
        );
        assert_eq!(
            evaluate("S", CustodyState::Inside, EventKind::Entry),
            Err(TransitionError::AlreadyInside)
        );
        assert_eq!(
            evaluate("S", CustodyState::Flagged, EventKind::Entry),
            Err(TransitionError::Flagged)
        );
        assert_eq!(
            evaluate("S", CustodyState::Unknown, EventKind::Flagged),
            Err(TransitionError::NotRegistered("S".into()))
        );
    }

    struct Rig {
        machine: CustodyMachine,
        issuer: QrIssuer,
        clock: Arc<ManualClock>,
    }

    fn rig() -> Rig {
        let issuer = QrIssuer::generate();
        let clock = Arc::new(ManualClock::new(datetime!(2025-06-02 08:00 UTC)));
        let machine = CustodyMachine::new(
            Arc::new(MemoryStore::new()),
            issuer.verifier(QrValidity::default()),
            clock.clone(),
        );
        Rig {
            machine,
            issuer,
            clock,
        }
    }

    impl Rig {
        fn register(&self, serial: &str) -> String {
            let (eq, _) = self
                .machine
                .register(
                    NewEquipment::new(serial, Category::Technological, "IT desk"),
                    "clerk",
                    "front-desk",
                )
                .unwrap();
            self.issuer.encode(&eq, self.clock.now()).to_text()
        }

        fn traces(&self) -> usize {
            self.machine
                .trace_log()
                .query(TraceFilter::all())
                .count()
        }
    }

    #[test]
    fn entry_exit_cycle() {
        let r = rig();
        let qr = r.register("TEC-100");
        r.clock.advance(Duration::minutes(5));
        let entry = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-100", EventKind::Entry, "guard", "gate-1").with_qr(&qr),
            )
            .unwrap();
        assert_eq!(entry.version, 2);
        r.clock.advance(Duration::hours(2));
        r.machine
            .request_transition(
                TransitionRequest::new("TEC-100", EventKind::Exit, "guard", "gate-1").with_qr(&qr),
            )
            .unwrap();
        assert_eq!(
            r.machine.ledger().current_state("TEC-100").unwrap(),
            CustodyState::Outside
        );
        assert_eq!(r.traces(), 3);
    }

    #[test]
    fn missing_qr_is_identity_error_and_traced() {
        let r = rig();
        r.register("TEC-1");
        let err = r
            .machine
            .request_transition(TransitionRequest::new("TEC-1", EventKind::Entry, "guard", "gate-1"))
            .unwrap_err();
        assert!(err.is_identity_error());
        let rejected: Vec<_> = r
            .machine
            .trace_log()
            .query(TraceFilter::all().with_outcome(Outcome::Rejected))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].reason.as_deref().unwrap().contains("QR payload required"));
    }

    #[test]
    fn qr_for_other_serial_rejected() {
        let r = rig();
        let qr_a = r.register("TEC-A");
        r.register("TEC-B");
        let err = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-B", EventKind::Entry, "guard", "gate-1").with_qr(&qr_a),
            )
            .unwrap_err();
        assert!(err.is_identity_error());
    }

    #[test]
    fn flag_requires_note_and_blocks_gate_until_reinstated() {
        let r = rig();
        let qr = r.register("TEC-9");
        let err = r
            .machine
            .request_transition(TransitionRequest::new("TEC-9", EventKind::Flagged, "admin", "office"))
            .unwrap_err();
        assert_eq!(err.transition(), Some(&TransitionError::MissingNote));

        r.machine
            .request_transition(
                TransitionRequest::new("TEC-9", EventKind::Flagged, "admin", "office")
                    .with_note("seal broken"),
            )
            .unwrap();
        let err = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-9", EventKind::Entry, "guard", "gate-1").with_qr(&qr),
            )
            .unwrap_err();
        assert_eq!(err.transition(), Some(&TransitionError::Flagged));

        r.machine
            .request_transition(
                TransitionRequest::new("TEC-9", EventKind::Registered, "admin", "office")
                    .with_note("seal replaced, inspected"),
            )
            .unwrap();
        assert!(r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-9", EventKind::Entry, "guard", "gate-1").with_qr(&qr),
            )
            .is_ok());
    }

    #[test]
    fn dispute_must_reference_own_event() {
        let r = rig();
        r.register("TEC-1");
        r.register("TEC-2");
        let err = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-1", EventKind::Flagged, "admin", "office")
                    .with_note("wrong gate recorded")
                    .disputing(2),
            )
            .unwrap_err();
        assert_eq!(err.transition(), Some(&TransitionError::UnknownDisputedEvent(2)));

        let ev = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-1", EventKind::Flagged, "admin", "office")
                    .with_note("wrong gate recorded")
                    .disputing(1),
            )
            .unwrap();
        assert_eq!(ev.references, Some(1));
    }

    #[test]
    fn malformed_arguments_are_traced_sanitised() {
        let r = rig();
        let err = r
            .machine
            .request_transition(TransitionRequest::new("bad\nserial", EventKind::Exit, "", "gate-1"))
            .unwrap_err();
        assert!(matches!(
            err.transition(),
            Some(TransitionError::InvalidRequest(_))
        ));
        let entries: Vec<_> = r
            .machine
            .trace_log()
            .query(TraceFilter::all())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].serial, "bad?serial");
        assert_eq!(entries[0].actor, "<empty>");
    }

    #[test]
    fn clock_regression_is_out_of_order() {
        let r = rig();
        r.register("TEC-5");
        let eq = r.machine.ledger().equipment("TEC-5").unwrap().unwrap();
        let qr = r.issuer.encode(&eq, datetime!(2025-06-01 08:00 UTC)).to_text();
        // Registered at 08:00; the gate clock now reads an hour earlier.
        r.clock.set(datetime!(2025-06-02 07:00 UTC));
        let err = r
            .machine
            .request_transition(
                TransitionRequest::new("TEC-5", EventKind::Entry, "guard", "gate-1").with_qr(&qr),
            )
            .unwrap_err();
        assert!(matches!(err, CustodyError::Ledger(_)), "{err}");
        assert_eq!(r.traces(), 2);
    }
}
