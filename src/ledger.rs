//! Custody ledger: the per-serial, append-only event history and the source
//! of truth for current state.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::error::{LedgerError, Result};
use crate::model::{CustodyEvent, CustodyState, Equipment, EventInput, TraceInput};
use crate::store::{Commit, CustodyStore, IntegrityReport, PAGE_SIZE};

#[derive(Clone)]
pub struct CustodyLedger {
    store: Arc<dyn CustodyStore>,
}

impl std::fmt::Debug for CustodyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyLedger").finish_non_exhaustive()
    }
}

impl CustodyLedger {
    pub fn new(store: Arc<dyn CustodyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CustodyStore> {
        &self.store
    }

    /// Append `event` together with its accepted audit record.
    ///
    /// The event must be causally after the serial's head: version exactly
    /// `head.version + 1` and a timestamp not earlier than the head's.
    pub fn append(&self, event: EventInput, audit: TraceInput) -> Result<CustodyEvent> {
        self.commit(Commit {
            equipment: None,
            event: Some(event),
            trace: audit,
        })
    }

    /// Insert the equipment record with its initial REGISTERED event.
    pub fn register(
        &self,
        equipment: Equipment,
        event: EventInput,
        audit: TraceInput,
    ) -> Result<CustodyEvent> {
        self.commit(Commit {
            equipment: Some(equipment),
            event: Some(event),
            trace: audit,
        })
    }

    fn commit(&self, commit: Commit) -> Result<CustodyEvent> {
        let committed = self.store.commit(commit)?;
        let event = committed
            .event
            .ok_or_else(|| LedgerError::Corrupt("store committed no event".into()))?;
        debug!(
            serial = %event.serial,
            seq = event.seq,
            version = event.version,
            trace_seq = committed.trace.seq,
            "event appended"
        );
        Ok(event)
    }

    pub fn head(&self, serial: &str) -> Result<Option<CustodyEvent>> {
        self.store.head(serial)
    }

    pub fn current_state(&self, serial: &str) -> Result<CustodyState> {
        Ok(self
            .head(serial)?
            .map_or(CustodyState::Unknown, |e| e.state_after()))
    }

    pub fn equipment(&self, serial: &str) -> Result<Option<Equipment>> {
        self.store.equipment(serial)
    }

    pub fn equipment_list(&self) -> Result<Vec<Equipment>> {
        self.store.equipment_list()
    }

    /// Chronological history of `serial`.  Nothing is read until iterated.
    pub fn history(&self, serial: &str) -> History {
        History {
            store: Arc::clone(&self.store),
            serial: serial.to_string(),
            page_size: PAGE_SIZE,
        }
    }

    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.store.verify_integrity()
    }
}

/// A restartable view of one serial's events.  Each iteration reads the
/// store afresh, page by page.
pub struct History {
    store: Arc<dyn CustodyStore>,
    serial: String,
    page_size: usize,
}

impl History {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn iter(&self) -> HistoryIter {
        HistoryIter {
            store: Arc::clone(&self.store),
            serial: self.serial.clone(),
            page_size: self.page_size,
            after_version: 0,
            buf: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<CustodyEvent>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = Result<CustodyEvent>;
    type IntoIter = HistoryIter;

    fn into_iter(self) -> HistoryIter {
        self.iter()
    }
}

pub struct HistoryIter {
    store: Arc<dyn CustodyStore>,
    serial: String,
    page_size: usize,
    after_version: u64,
    buf: VecDeque<CustodyEvent>,
    exhausted: bool,
}

impl Iterator for HistoryIter {
    type Item = Result<CustodyEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.exhausted {
            match self
                .store
                .events_page(&self.serial, self.after_version, self.page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buf.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let event = self.buf.pop_front()?;
        self.after_version = event.version;
        Some(Ok(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CustodyError;
    use crate::model::{Category, EventKind, NewEquipment};
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    const T0: OffsetDateTime = datetime!(2025-04-01 07:00 UTC);

    fn input(version: u64, kind: EventKind) -> EventInput {
        EventInput {
            serial: "TEC-7".into(),
            version,
            kind,
            actor: "guard".into(),
            location: "gate-b".into(),
            ts: T0 + Duration::minutes(version as i64),
            note: None,
            references: None,
        }
    }

    fn ledger_with_moves(moves: usize) -> CustodyLedger {
        let ledger = CustodyLedger::new(Arc::new(MemoryStore::new()));
        let eq = NewEquipment::new("TEC-7", Category::Technological, "IT").into_equipment(T0);
        let reg = input(1, EventKind::Registered);
        ledger
            .register(eq, reg.clone(), TraceInput::accepted(&reg))
            .unwrap();
        for i in 0..moves {
            let kind = if i % 2 == 0 { EventKind::Entry } else { EventKind::Exit };
            let ev = input(i as u64 + 2, kind);
            ledger.append(ev.clone(), TraceInput::accepted(&ev)).unwrap();
        }
        ledger
    }

    #[test]
    fn state_tracks_head() {
        let ledger = ledger_with_moves(3);
        assert_eq!(ledger.current_state("TEC-7").unwrap(), CustodyState::Inside);
        assert_eq!(ledger.current_state("NOPE").unwrap(), CustodyState::Unknown);
    }

    #[test]
    fn history_pages_and_restarts() {
        let ledger = ledger_with_moves(6);
        let history = ledger.history("TEC-7").with_page_size(2);

        let first: Vec<u64> = history.iter().map(|e| e.unwrap().version).collect();
        assert_eq!(first, (1..=7).collect::<Vec<_>>());

        // A second pass sees events appended in the meantime.
        let ev = input(8, EventKind::Exit);
        ledger.append(ev.clone(), TraceInput::accepted(&ev)).unwrap();
        assert_eq!(history.to_vec().unwrap().len(), 8);

        let replayed = CustodyState::replay(&history.to_vec().unwrap());
        assert_eq!(replayed, ledger.current_state("TEC-7").unwrap());
    }

    #[test]
    fn stale_append_is_out_of_order() {
        let ledger = ledger_with_moves(1);
        let ev = input(2, EventKind::Exit);
        let err = ledger.append(ev.clone(), TraceInput::accepted(&ev)).unwrap_err();
        assert!(matches!(
            err,
            CustodyError::Ledger(LedgerError::OutOfOrder { .. })
        ));
    }
}
