//! Read-only custody reports derived from the ledger and the traceability log,
//! plus the JSON report pack consumed by external renderers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::clock::Clock;
use crate::error::{Result, ResultExt};
use crate::ledger::CustodyLedger;
use crate::model::{CustodyState, DateRange, Equipment, EventKind, Outcome, TraceEntry};
use crate::store::TraceFilter;
use crate::trace::TraceLog;
use crate::util;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueItem {
    pub serial: String,
    pub custodian: String,
    #[serde(with = "time::serde::rfc3339")]
    pub inside_since: OffsetDateTime,
    pub overdue_by_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DwellTime {
    pub serial: String,
    pub seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub equipment_total: usize,
    pub registrations: usize,
    pub accepted_entries: usize,
    pub accepted_exits: usize,
    pub rejected_attempts: usize,
    pub flags: usize,
    pub inside_now: usize,
    pub outside_now: usize,
    pub overdue: usize,
}

/// Attempts recorded under one actor within the report range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorActivity {
    pub actor: String,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub range: DateRange,
    pub outside_now: Vec<Equipment>,
    pub inside_now: Vec<Equipment>,
    pub overdue: Vec<OverdueItem>,
    pub exceptions: Vec<TraceEntry>,
    pub dwell_times: Vec<DwellTime>,
    pub actor_activity: Vec<ActorActivity>,
    pub summary: ReportSummary,
}

/// State of one serial at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Snapshot {
    state: CustodyState,
    inside_since: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReportAggregator {
    ledger: CustodyLedger,
    trace: TraceLog,
    clock: Arc<dyn Clock>,
    max_stay: Duration,
}

impl std::fmt::Debug for ReportAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportAggregator")
            .field("ledger", &self.ledger)
            .field("trace", &self.trace)
            .field("max_stay", &self.max_stay)
            .finish_non_exhaustive()
    }
}

impl ReportAggregator {
    /// `clock` stamps `generated_at` on built reports.
    pub fn new(
        ledger: CustodyLedger,
        trace: TraceLog,
        clock: Arc<dyn Clock>,
        max_stay: Duration,
    ) -> Self {
        Self {
            ledger,
            trace,
            clock,
            max_stay,
        }
    }

    fn snapshot(&self, serial: &str, as_of: OffsetDateTime) -> Result<Snapshot> {
        let mut snap = Snapshot {
            state: CustodyState::Unknown,
            inside_since: None,
        };
        for event in &self.ledger.history(serial) {
            let event = event?;
            // Per-serial timestamps never decrease.
            if event.ts > as_of {
                break;
            }
            snap.state = event.state_after();
            snap.inside_since = match event.kind {
                EventKind::Entry => Some(event.ts),
                _ => None,
            };
        }
        Ok(snap)
    }

    /// Replay of the events with `ts <= as_of`.
    pub fn state_as_of(&self, serial: &str, as_of: OffsetDateTime) -> Result<CustodyState> {
        Ok(self.snapshot(serial, as_of)?.state)
    }

    fn in_state(&self, wanted: CustodyState, as_of: OffsetDateTime) -> Result<Vec<Equipment>> {
        let mut out = Vec::new();
        for eq in self.ledger.equipment_list()? {
            if self.snapshot(&eq.serial, as_of)?.state == wanted {
                out.push(eq);
            }
        }
        Ok(out)
    }

    pub fn items_currently_outside(&self, as_of: OffsetDateTime) -> Result<Vec<Equipment>> {
        self.in_state(CustodyState::Outside, as_of)
    }

    pub fn items_currently_inside(&self, as_of: OffsetDateTime) -> Result<Vec<Equipment>> {
        self.in_state(CustodyState::Inside, as_of)
    }

    /// Items inside for longer than the maximum stay at `as_of`.
    pub fn overdue(&self, as_of: OffsetDateTime) -> Result<Vec<OverdueItem>> {
        let mut out = Vec::new();
        for eq in self.ledger.equipment_list()? {
            let snap = self.snapshot(&eq.serial, as_of)?;
            let Some(since) = snap.inside_since else {
                continue;
            };
            let stay = as_of - since;
            if stay > self.max_stay {
                out.push(OverdueItem {
                    serial: eq.serial,
                    custodian: eq.custodian,
                    inside_since: since,
                    overdue_by_secs: (stay - self.max_stay).whole_seconds(),
                });
            }
        }
        Ok(out)
    }

    /// Total INSIDE time of `serial` clipped to `range`.  An interval ends at
    /// EXIT or FLAGGED; one still open counts up to `min(as_of, range.end)`.
    pub fn dwell_time(
        &self,
        serial: &str,
        range: DateRange,
        as_of: OffsetDateTime,
    ) -> Result<Duration> {
        let cap = as_of.min(range.end);
        let clip = |start: OffsetDateTime, end: OffsetDateTime| -> Duration {
            let d = end.min(range.end) - start.max(range.start);
            if d.is_positive() {
                d
            } else {
                Duration::ZERO
            }
        };

        let mut total = Duration::ZERO;
        let mut open: Option<OffsetDateTime> = None;
        for event in &self.ledger.history(serial) {
            let event = event?;
            if event.ts > cap {
                break;
            }
            match event.kind {
                EventKind::Entry => {
                    open.get_or_insert(event.ts);
                }
                EventKind::Exit | EventKind::Flagged | EventKind::Registered => {
                    if let Some(start) = open.take() {
                        total += clip(start, event.ts);
                    }
                }
            }
        }
        if let Some(start) = open {
            total += clip(start, cap);
        }
        Ok(total)
    }

    /// Rejected attempts and FLAGGED events in `range`, in sequence order.
    pub fn exceptions(&self, range: DateRange) -> Result<Vec<TraceEntry>> {
        let mut out = Vec::new();
        for entry in self.trace.query(TraceFilter::all().in_range(range)) {
            let entry = entry?;
            if entry.is_exception() {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn summary(&self, range: DateRange, as_of: OffsetDateTime) -> Result<ReportSummary> {
        let mut s = ReportSummary::default();
        for entry in self.trace.query(TraceFilter::all().in_range(range)) {
            let entry = entry?;
            match (entry.outcome, entry.kind) {
                (Outcome::Rejected, _) => s.rejected_attempts += 1,
                (Outcome::Accepted, EventKind::Registered) => s.registrations += 1,
                (Outcome::Accepted, EventKind::Entry) => s.accepted_entries += 1,
                (Outcome::Accepted, EventKind::Exit) => s.accepted_exits += 1,
                (Outcome::Accepted, EventKind::Flagged) => s.flags += 1,
            }
        }
        s.equipment_total = self.ledger.equipment_list()?.len();
        s.inside_now = self.items_currently_inside(as_of)?.len();
        s.outside_now = self.items_currently_outside(as_of)?.len();
        s.overdue = self.overdue(as_of)?.len();
        Ok(s)
    }

    /// Accepted and rejected attempts per actor within `range`, sorted by actor.
    pub fn actor_activity(&self, range: DateRange) -> Result<Vec<ActorActivity>> {
        let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for t in self.trace.query(TraceFilter::all().in_range(range)) {
            let t = t?;
            let slot = counts.entry(t.actor).or_default();
            match t.outcome {
                Outcome::Accepted => slot.0 += 1,
                Outcome::Rejected => slot.1 += 1,
            }
        }
        Ok(counts
            .into_iter()
            .map(|(actor, (accepted, rejected))| ActorActivity {
                actor,
                accepted,
                rejected,
            })
            .collect())
    }

    /// Full report over `range`, with point-in-time sections as of `as_of`.
    pub fn build(&self, range: DateRange, as_of: OffsetDateTime) -> Result<Report> {
        let mut dwell_times = Vec::new();
        for eq in self.ledger.equipment_list()? {
            let d = self.dwell_time(&eq.serial, range, as_of)?;
            if d.is_positive() {
                dwell_times.push(DwellTime {
                    serial: eq.serial,
                    seconds: d.whole_seconds(),
                });
            }
        }
        Ok(Report {
            generated_at: self.clock.now(),
            as_of,
            range,
            outside_now: self.items_currently_outside(as_of)?,
            inside_now: self.items_currently_inside(as_of)?,
            overdue: self.overdue(as_of)?,
            exceptions: self.exceptions(range)?,
            dwell_times,
            actor_activity: self.actor_activity(range)?,
            summary: self.summary(range, as_of)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Report pack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPackManifest {
    pub format: String,
    pub generated_at_utc: String,
    pub software: String,
    pub range: DateRange,
    pub summary: ReportSummary,
    pub exception_count: usize,
    pub files: Vec<String>,
}

/// Write `manifest.json` and `report.json` into `out_dir`.
pub fn write_report_pack(out_dir: &Path, report: &Report) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .ctx_report(&format!("create out dir {}", out_dir.display()))?;

    let manifest = ReportPackManifest {
        format: "custody report-pack v1".to_string(),
        generated_at_utc: util::format_rfc3339(report.generated_at),
        software: util::version_string(),
        range: report.range,
        summary: report.summary.clone(),
        exception_count: report.exceptions.len(),
        files: vec!["report.json".to_string()],
    };

    let manifest_path = out_dir.join("manifest.json");
    let manifest_json = serde_json::to_vec_pretty(&manifest).ctx_report("serialize manifest")?;
    std::fs::write(&manifest_path, manifest_json)
        .ctx_report(&format!("write {}", manifest_path.display()))?;

    let report_path = out_dir.join("report.json");
    let report_json = serde_json::to_vec_pretty(report).ctx_report("serialize report")?;
    std::fs::write(&report_path, report_json)
        .ctx_report(&format!("write {}", report_path.display()))?;

    info!(dir = %out_dir.display(), exceptions = report.exceptions.len(), "report pack written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Category, EventInput, NewEquipment, TraceInput};
    use crate::store::MemoryStore;
    use tempfile::tempdir;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2025-07-01 08:00 UTC);

    /// Events for one serial at the given hour offsets from `T0`.
    fn seed(ledger: &CustodyLedger, serial: &str, moves: &[(EventKind, i64)]) {
        let eq = NewEquipment::new(serial, Category::Technological, "IT").into_equipment(T0);
        let mk = |version: u64, kind: EventKind, hours: i64| EventInput {
            serial: serial.into(),
            version,
            kind,
            actor: "guard".into(),
            location: "gate".into(),
            ts: T0 + Duration::hours(hours),
            note: (kind == EventKind::Flagged).then(|| "checked".to_string()),
            references: None,
        };
        let reg = mk(1, EventKind::Registered, 0);
        ledger.register(eq, reg.clone(), TraceInput::accepted(&reg)).unwrap();
        for (i, (kind, hours)) in moves.iter().enumerate() {
            let ev = mk(i as u64 + 2, *kind, *hours);
            ledger.append(ev.clone(), TraceInput::accepted(&ev)).unwrap();
        }
    }

    const BUILT_AT: OffsetDateTime = datetime!(2025-07-02 09:30 UTC);

    fn aggregator() -> ReportAggregator {
        aggregator_on(Arc::new(MemoryStore::new()))
    }

    fn aggregator_on(store: Arc<MemoryStore>) -> ReportAggregator {
        let ledger = CustodyLedger::new(store.clone());
        seed(&ledger, "A", &[(EventKind::Entry, 1), (EventKind::Exit, 3)]);
        seed(&ledger, "B", &[(EventKind::Entry, 2)]);
        seed(
            &ledger,
            "C",
            &[(EventKind::Entry, 1), (EventKind::Flagged, 2)],
        );
        ReportAggregator::new(
            ledger,
            TraceLog::new(store),
            Arc::new(ManualClock::new(BUILT_AT)),
            Duration::days(3),
        )
    }

    fn serials(items: &[Equipment]) -> Vec<&str> {
        items.iter().map(|e| e.serial.as_str()).collect()
    }

    #[test]
    fn point_in_time_sets() {
        let agg = aggregator();
        let later = T0 + Duration::hours(10);
        assert_eq!(serials(&agg.items_currently_outside(later).unwrap()), ["A"]);
        assert_eq!(serials(&agg.items_currently_inside(later).unwrap()), ["B"]);
        // Before A's exit it was inside.
        let early = T0 + Duration::hours(2);
        assert_eq!(
            serials(&agg.items_currently_inside(early).unwrap()),
            ["A", "B"]
        );
        assert_eq!(agg.state_as_of("C", later).unwrap(), CustodyState::Flagged);
    }

    #[test]
    fn dwell_time_pairs_clips_and_caps() {
        let agg = aggregator();
        let all = DateRange::new(T0, T0 + Duration::days(1)).unwrap();
        let as_of = T0 + Duration::hours(10);
        assert_eq!(agg.dwell_time("A", all, as_of).unwrap(), Duration::hours(2));
        // Still inside: counted up to as_of.
        assert_eq!(agg.dwell_time("B", all, as_of).unwrap(), Duration::hours(8));
        // FLAGGED closes the interval.
        assert_eq!(agg.dwell_time("C", all, as_of).unwrap(), Duration::hours(1));

        let narrow = DateRange::new(T0 + Duration::hours(2), T0 + Duration::hours(4)).unwrap();
        assert_eq!(agg.dwell_time("A", narrow, as_of).unwrap(), Duration::hours(1));
        assert_eq!(agg.dwell_time("B", narrow, as_of).unwrap(), Duration::hours(2));
    }

    #[test]
    fn overdue_after_max_stay() {
        let agg = aggregator();
        assert!(agg.overdue(T0 + Duration::days(2)).unwrap().is_empty());
        let late = agg.overdue(T0 + Duration::days(4)).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].serial, "B");
        assert_eq!(late[0].inside_since, T0 + Duration::hours(2));
    }

    #[test]
    fn summary_and_exceptions() {
        let agg = aggregator();
        let range = DateRange::new(T0, T0 + Duration::days(1)).unwrap();
        let s = agg.summary(range, T0 + Duration::hours(10)).unwrap();
        assert_eq!(s.equipment_total, 3);
        assert_eq!(s.registrations, 3);
        assert_eq!(s.accepted_entries, 3);
        assert_eq!(s.accepted_exits, 1);
        assert_eq!(s.flags, 1);
        assert_eq!((s.inside_now, s.outside_now), (1, 1));

        let ex = agg.exceptions(range).unwrap();
        assert_eq!(ex.len(), 1);
        assert_eq!(ex[0].serial, "C");
    }

    #[test]
    fn report_pack_files() {
        let agg = aggregator();
        let range = DateRange::new(T0, T0 + Duration::days(1)).unwrap();
        let report = agg.build(range, T0 + Duration::hours(10)).unwrap();
        assert_eq!(report.dwell_times.len(), 3);
        assert_eq!(report.generated_at, BUILT_AT);

        let dir = tempdir().unwrap();
        write_report_pack(dir.path(), &report).unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["format"], "custody report-pack v1");
        assert_eq!(manifest["exception_count"], 1);
        let back: Report =
            serde_json::from_slice(&std::fs::read(dir.path().join("report.json")).unwrap())
                .unwrap();
        assert_eq!(back.summary, report.summary);
        assert_eq!(back.actor_activity, report.actor_activity);
        assert_eq!(
            manifest["generated_at_utc"],
            util::format_rfc3339(BUILT_AT).as_str()
        );
    }

    #[test]
    fn activity_counted_per_actor() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator_on(store.clone());
        let trace = TraceLog::new(store);
        let attempt = |actor: &str, hours: i64| {
            TraceInput::rejected(
                "B",
                EventKind::Entry,
                actor,
                "gate",
                T0 + Duration::hours(hours),
                None,
                "already inside",
            )
        };
        trace.record(attempt("night-guard", 4)).unwrap();
        trace.record(attempt("night-guard", 5)).unwrap();
        trace.record(attempt("guard", 30)).unwrap();

        let range = DateRange::new(T0, T0 + Duration::days(1)).unwrap();
        let activity = agg.actor_activity(range).unwrap();
        assert_eq!(
            activity,
            [
                ActorActivity {
                    actor: "guard".into(),
                    accepted: 8,
                    rejected: 0,
                },
                ActorActivity {
                    actor: "night-guard".into(),
                    accepted: 0,
                    rejected: 2,
                },
            ]
        );
        let report = agg.build(range, T0 + Duration::hours(10)).unwrap();
        assert_eq!(report.actor_activity, activity);
    }
}
