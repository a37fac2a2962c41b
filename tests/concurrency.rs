use std::sync::Arc;

use anyhow::Result;
use tempfile::tempdir;
use time::macros::datetime;

use custody_core::{
    clock::ManualClock,
    error::TransitionError,
    model::{Category, CustodyState, NewEquipment, Outcome},
    qr::QrIssuer,
    sqlite::SqliteStore,
    store::{CustodyStore, MemoryStore, TraceFilter},
    CustodyPolicy, CustodyService,
};

const GUARDS: usize = 8;

fn service(store: Arc<dyn CustodyStore>) -> CustodyService {
    CustodyService::new(
        store,
        QrIssuer::generate(),
        Arc::new(ManualClock::new(datetime!(2025-06-01 12:00 UTC))),
        CustodyPolicy::default(),
    )
}

fn race_one_serial(svc: &CustodyService) -> Result<()> {
    svc.register_equipment(
        NewEquipment::new("TEC-RACE", Category::Technological, "IT"),
        "clerk",
        "desk",
    )?;
    let qr = svc.issue_qr_code("TEC-RACE")?.to_text();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..GUARDS)
            .map(|i| {
                let qr = qr.as_str();
                s.spawn(move || svc.record_entry("TEC-RACE", &format!("guard-{i}"), "gate-a", qr))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("guard thread panicked"))
            .collect()
    });

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.transition(), Some(&TransitionError::AlreadyInside));
    }

    assert_eq!(svc.current_state("TEC-RACE")?, CustodyState::Inside);
    assert_eq!(svc.get_history("TEC-RACE").to_vec()?.len(), 2);
    let rejected = svc
        .trace(TraceFilter::for_serial("TEC-RACE").with_outcome(Outcome::Rejected))
        .count();
    assert_eq!(rejected, GUARDS - 1);
    svc.verify_integrity()?;
    Ok(())
}

#[test]
fn one_winner_per_serial_in_memory() -> Result<()> {
    race_one_serial(&service(Arc::new(MemoryStore::new())))
}

#[test]
fn one_winner_per_serial_on_sqlite() -> Result<()> {
    let dir = tempdir()?;
    let store = SqliteStore::create_new(&dir.path().join("custody.db"), None)?;
    race_one_serial(&service(Arc::new(store)))
}

#[test]
fn distinct_serials_proceed_independently() -> Result<()> {
    let svc = service(Arc::new(MemoryStore::new()));
    let mut codes = Vec::new();
    for i in 0..GUARDS {
        let serial = format!("TEC-{i:03}");
        svc.register_equipment(
            NewEquipment::new(serial.as_str(), Category::Technological, "IT"),
            "clerk",
            "desk",
        )?;
        codes.push((serial.clone(), svc.issue_qr_code(&serial)?.to_text()));
    }

    std::thread::scope(|s| {
        for (serial, qr) in &codes {
            let svc = &svc;
            s.spawn(move || {
                svc.record_entry(serial, "guard", "gate-b", qr)?;
                svc.record_exit(serial, "guard", "gate-b", qr)
            });
        }
    });

    for (serial, _) in &codes {
        assert_eq!(svc.current_state(serial)?, CustodyState::Outside);
    }
    let report = svc.verify_integrity()?;
    assert_eq!(report.events as usize, GUARDS * 3);
    assert_eq!(report.serials as usize, GUARDS);
    Ok(())
}
