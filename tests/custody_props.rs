use std::sync::Arc;

use proptest::prelude::*;
use time::macros::datetime;
use time::Duration;

use custody_core::{
    clock::ManualClock,
    machine,
    model::{Category, CustodyState, EventKind, NewEquipment},
    qr::QrIssuer,
    store::{MemoryStore, TraceFilter},
    CustodyPolicy, CustodyService,
};

#[derive(Debug, Clone, Copy)]
enum Op {
    Entry,
    Exit,
    Flag,
    Reinstate,
}

impl Op {
    fn kind(self) -> EventKind {
        match self {
            Op::Entry => EventKind::Entry,
            Op::Exit => EventKind::Exit,
            Op::Flag => EventKind::Flagged,
            Op::Reinstate => EventKind::Registered,
        }
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Entry),
        4 => Just(Op::Exit),
        1 => Just(Op::Flag),
        1 => Just(Op::Reinstate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the gate throws at it, the ledger agrees with the transition
    /// table, every attempt leaves exactly one trace entry, and the chains
    /// verify.
    #[test]
    fn ledger_follows_transition_table(ops in prop::collection::vec((op(), 0i64..120), 1..40)) {
        let clock = Arc::new(ManualClock::new(datetime!(2025-01-15 06:00 UTC)));
        let svc = CustodyService::new(
            Arc::new(MemoryStore::new()),
            QrIssuer::generate(),
            clock.clone(),
            CustodyPolicy::default(),
        );
        svc.register_equipment(
            NewEquipment::new("PROP-1", Category::Technological, "IT"),
            "clerk",
            "desk",
        ).unwrap();
        let qr = svc.issue_qr_code("PROP-1").unwrap().to_text();

        let mut model = CustodyState::Registered;
        for (op, minutes) in &ops {
            clock.advance(Duration::minutes(*minutes));
            let expected = machine::evaluate("PROP-1", model, op.kind());
            let got = match op {
                Op::Entry => svc.record_entry("PROP-1", "guard", "gate", &qr),
                Op::Exit => svc.record_exit("PROP-1", "guard", "gate", &qr),
                Op::Flag => svc.flag("PROP-1", "supervisor", "spot check"),
                Op::Reinstate => svc.reinstate("PROP-1", "supervisor", "cleared"),
            };
            prop_assert_eq!(got.is_ok(), expected.is_ok(), "op {:?} from {}", op, model);
            if let Ok(next) = expected {
                model = next;
            }
            prop_assert_eq!(svc.current_state("PROP-1").unwrap(), model);
        }

        let history = svc.get_history("PROP-1").to_vec().unwrap();
        prop_assert_eq!(CustodyState::replay(&history), model);

        // Every EXIT follows an ENTRY.
        for pair in history.windows(2) {
            if pair[1].kind == EventKind::Exit {
                prop_assert_eq!(pair[0].kind, EventKind::Entry);
            }
        }
        for (i, event) in history.iter().enumerate() {
            prop_assert_eq!(event.version, i as u64 + 1);
        }

        prop_assert_eq!(svc.trace(TraceFilter::all()).count(), ops.len() + 1);
        let report = svc.verify_integrity().unwrap();
        prop_assert_eq!(report.events as usize, history.len());
        prop_assert_eq!(report.traces as usize, ops.len() + 1);
    }
}
