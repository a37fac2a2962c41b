//! `CustodyService`: the operations exposed to the outer layers (HTTP, CLI).
//!
//! The service owns the signing key, the clock and the policy; it turns each
//! call into a state-machine request and serves the read side from the
//! ledger, the traceability log and the report aggregator.

use std::sync::Arc;

use time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{CustodyError, Result};
use crate::ledger::{CustodyLedger, History};
use crate::machine::{CustodyMachine, TransitionRequest};
use crate::model::{CustodyEvent, CustodyState, DateRange, Equipment, EventKind, NewEquipment};
use crate::qr::{QrIssuer, QrPayload, QrValidity};
use crate::report::{Report, ReportAggregator};
use crate::store::{CustodyStore, IntegrityReport, TraceFilter};
use crate::trace::TraceQuery;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyPolicy {
    /// Longest stay inside before an item is reported overdue.
    pub max_stay: Duration,
    /// Location recorded on flag, dispute and reinstate events.
    pub admin_location: String,
    pub qr_validity: QrValidity,
}

impl Default for CustodyPolicy {
    fn default() -> Self {
        Self {
            max_stay: Duration::days(3),
            admin_location: "administration".to_string(),
            qr_validity: QrValidity::default(),
        }
    }
}

pub struct CustodyService {
    machine: CustodyMachine,
    issuer: QrIssuer,
    reports: ReportAggregator,
    policy: CustodyPolicy,
}

impl std::fmt::Debug for CustodyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyService")
            .field("issuer", &self.issuer)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CustodyService {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        issuer: QrIssuer,
        clock: Arc<dyn Clock>,
        policy: CustodyPolicy,
    ) -> Self {
        let machine = CustodyMachine::new(
            store,
            issuer.verifier(policy.qr_validity),
            Arc::clone(&clock),
        );
        let reports = ReportAggregator::new(
            machine.ledger().clone(),
            machine.trace_log().clone(),
            clock,
            policy.max_stay,
        );
        Self {
            machine,
            issuer,
            reports,
            policy,
        }
    }

    pub fn machine(&self) -> &CustodyMachine {
        &self.machine
    }

    pub fn ledger(&self) -> &CustodyLedger {
        self.machine.ledger()
    }

    pub fn reports(&self) -> &ReportAggregator {
        &self.reports
    }

    pub fn policy(&self) -> &CustodyPolicy {
        &self.policy
    }

    // -- commands ---------------------------------------------------------

    pub fn register_equipment(
        &self,
        new: NewEquipment,
        actor: &str,
        location: &str,
    ) -> Result<Equipment> {
        self.machine
            .register(new, actor, location)
            .map(|(equipment, _)| equipment)
    }

    pub fn issue_qr_code(&self, serial: &str) -> Result<QrPayload> {
        util::validate_serial(serial)?;
        let equipment = self
            .ledger()
            .equipment(serial)?
            .ok_or_else(|| CustodyError::NotRegistered(serial.to_string()))?;
        let payload = self.issuer.encode(&equipment, self.machine.clock().now());
        info!(serial = %serial, issued_at = %util::format_rfc3339(payload.issued_at), "QR issued");
        Ok(payload)
    }

    pub fn record_entry(&self, serial: &str, actor: &str, location: &str, qr: &str) -> Result<CustodyEvent> {
        self.machine.request_transition(
            TransitionRequest::new(serial, EventKind::Entry, actor, location).with_qr(qr),
        )
    }

    pub fn record_exit(&self, serial: &str, actor: &str, location: &str, qr: &str) -> Result<CustodyEvent> {
        self.machine.request_transition(
            TransitionRequest::new(serial, EventKind::Exit, actor, location).with_qr(qr),
        )
    }

    pub fn flag(&self, serial: &str, actor: &str, note: &str) -> Result<CustodyEvent> {
        self.machine.request_transition(
            TransitionRequest::new(serial, EventKind::Flagged, actor, &self.policy.admin_location)
                .with_note(note),
        )
    }

    /// Flag `serial`, marking event `disputed_seq` of its history as contested.
    pub fn dispute(
        &self,
        serial: &str,
        actor: &str,
        note: &str,
        disputed_seq: u64,
    ) -> Result<CustodyEvent> {
        self.machine.request_transition(
            TransitionRequest::new(serial, EventKind::Flagged, actor, &self.policy.admin_location)
                .with_note(note)
                .disputing(disputed_seq),
        )
    }

    /// Administrative override that clears a FLAGGED state.
    pub fn reinstate(&self, serial: &str, actor: &str, note: &str) -> Result<CustodyEvent> {
        self.machine.request_transition(
            TransitionRequest::new(serial, EventKind::Registered, actor, &self.policy.admin_location)
                .with_note(note),
        )
    }

    // -- queries ----------------------------------------------------------

    pub fn get_history(&self, serial: &str) -> History {
        self.ledger().history(serial)
    }

    pub fn current_state(&self, serial: &str) -> Result<CustodyState> {
        self.ledger().current_state(serial)
    }

    pub fn equipment(&self, serial: &str) -> Result<Option<Equipment>> {
        self.ledger().equipment(serial)
    }

    pub fn trace(&self, filter: TraceFilter) -> TraceQuery {
        self.machine.trace_log().query(filter)
    }

    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.ledger().verify_integrity()
    }

    /// Report over `range` (default: everything up to now), as of now.
    pub fn get_report(&self, range: Option<DateRange>) -> Result<Report> {
        let now = self.machine.clock().now();
        let range = range.unwrap_or_else(|| DateRange::until(now));
        self.reports.build(range, now)
    }
}
