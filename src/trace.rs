//! Traceability log: the immutable audit stream of every transition attempt.
//!
//! Accepted attempts are written by the ledger in the same commit as their
//! event.  This module records the rejected ones and serves queries.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::error;

use crate::error::{CustodyError, Result};
use crate::model::{Outcome, TraceEntry, TraceInput};
use crate::store::{Commit, CustodyStore, IntegrityReport, TraceFilter, PAGE_SIZE};

#[derive(Clone)]
pub struct TraceLog {
    store: Arc<dyn CustodyStore>,
}

impl std::fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLog").finish_non_exhaustive()
    }
}

impl TraceLog {
    pub fn new(store: Arc<dyn CustodyStore>) -> Self {
        Self { store }
    }

    /// Append a rejected attempt.  Fails with `SinkUnavailable` if the record
    /// cannot be written; never drops it silently.
    pub fn record(&self, trace: TraceInput) -> Result<TraceEntry> {
        if trace.outcome != Outcome::Rejected {
            return Err(CustodyError::Validation(
                "accepted attempts are recorded with their ledger event".into(),
            ));
        }
        match self.store.commit(Commit::rejected(trace)) {
            Ok(c) => Ok(c.trace),
            Err(e) => {
                error!(error = %e, "failed to record trace entry");
                Err(e)
            }
        }
    }

    /// Matching entries in sequence order, read lazily.
    pub fn query(&self, filter: TraceFilter) -> TraceQuery {
        TraceQuery {
            store: Arc::clone(&self.store),
            filter,
            after_seq: 0,
            buf: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn verify_chain(&self) -> Result<IntegrityReport> {
        self.store.verify_integrity()
    }
}

pub struct TraceQuery {
    store: Arc<dyn CustodyStore>,
    filter: TraceFilter,
    after_seq: u64,
    buf: VecDeque<TraceEntry>,
    exhausted: bool,
}

impl Iterator for TraceQuery {
    type Item = Result<TraceEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.exhausted {
            match self.store.traces_page(&self.filter, self.after_seq, PAGE_SIZE) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    self.buf.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let entry = self.buf.pop_front()?;
        self.after_seq = entry.seq;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, EventKind};
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    fn rejected(serial: &str, minute: i64) -> TraceInput {
        TraceInput::rejected(
            serial,
            EventKind::Exit,
            "guard",
            "gate-c",
            datetime!(2025-05-01 10:00 UTC) + Duration::minutes(minute),
            None,
            "equipment not currently inside: exit denied",
        )
    }

    #[test]
    fn records_and_queries_in_order() {
        let store = Arc::new(MemoryStore::new());
        let log = TraceLog::new(store);
        for i in 0..600 {
            log.record(rejected(if i % 3 == 0 { "A" } else { "B" }, i)).unwrap();
        }
        let all: Vec<_> = log.query(TraceFilter::all()).map(|t| t.unwrap().seq).collect();
        assert_eq!(all.len(), 600);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(log.query(TraceFilter::for_serial("A")).count(), 200);

        let range = DateRange::new(
            datetime!(2025-05-01 10:00 UTC),
            datetime!(2025-05-01 10:09 UTC),
        )
        .unwrap();
        assert_eq!(log.query(TraceFilter::all().in_range(range)).count(), 10);
    }

    #[test]
    fn accepted_entries_are_refused() {
        let log = TraceLog::new(Arc::new(MemoryStore::new()));
        let mut t = rejected("A", 0);
        t.outcome = Outcome::Accepted;
        assert!(log.record(t).is_err());
    }

    #[test]
    fn sink_outage_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let log = TraceLog::new(store.clone());
        store.set_trace_sink_available(false);
        let err = log.record(rejected("A", 0)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(log.query(TraceFilter::all()).count(), 0);
    }
}
