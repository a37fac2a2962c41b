//! Benchmarks for core custody operations.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use time::macros::datetime;
use time::Duration;

use custody_core::{
    clock::ManualClock,
    model::{Category, NewEquipment},
    qr::{QrIssuer, QrValidity},
    sqlite::SqliteStore,
    store::{CustodyStore, MemoryStore},
    util, CustodyPolicy, CustodyService,
};

fn bench_sha256(c: &mut Criterion) {
    let data = vec![0u8; 1024];
    c.bench_function("sha256_1kb", |b| {
        b.iter(|| util::sha256(black_box(&data)))
    });
}

fn bench_qr_codec(c: &mut Criterion) {
    let issuer = QrIssuer::generate();
    let verifier = issuer.verifier(QrValidity::default());
    let t0 = datetime!(2025-01-01 00:00 UTC);
    let eq = NewEquipment::new("BENCH-QR-001", Category::Biomedical, "Dr. Bench")
        .with_photo("bench.jpg")
        .into_equipment(t0);

    c.bench_function("qr_encode", |b| {
        b.iter(|| issuer.encode(black_box(&eq), t0).to_text())
    });

    let text = issuer.encode(&eq, t0).to_text();
    c.bench_function("qr_decode_verify", |b| {
        b.iter(|| verifier.decode(black_box(&text), t0).unwrap())
    });
}

fn gate(store: Arc<dyn CustodyStore>) -> (CustodyService, Arc<ManualClock>, String) {
    let clock = Arc::new(ManualClock::new(datetime!(2025-01-01 00:00 UTC)));
    let svc = CustodyService::new(
        store,
        QrIssuer::generate(),
        clock.clone(),
        CustodyPolicy::default(),
    );
    svc.register_equipment(
        NewEquipment::new("BENCH", Category::Technological, "IT"),
        "clerk",
        "desk",
    )
    .unwrap();
    let qr = svc.issue_qr_code("BENCH").unwrap().to_text();
    (svc, clock, qr)
}

fn bench_gate_cycle_memory(c: &mut Criterion) {
    let (svc, clock, qr) = gate(Arc::new(MemoryStore::new()));
    c.bench_function("entry_exit_cycle_memory", |b| {
        b.iter(|| {
            clock.advance(Duration::milliseconds(1));
            svc.record_entry("BENCH", "guard", "gate", &qr).unwrap();
            svc.record_exit("BENCH", "guard", "gate", &qr).unwrap()
        })
    });
}

fn bench_gate_cycle_sqlite(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::create_new(&dir.path().join("bench.db"), None).unwrap();
    let (svc, clock, qr) = gate(Arc::new(store));
    c.bench_function("entry_exit_cycle_sqlite", |b| {
        b.iter(|| {
            clock.advance(Duration::milliseconds(1));
            svc.record_entry("BENCH", "guard", "gate", &qr).unwrap();
            svc.record_exit("BENCH", "guard", "gate", &qr).unwrap()
        })
    });
}

fn bench_store_verify(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::create_new(&dir.path().join("bench_verify.db"), None).unwrap();
    let (svc, clock, qr) = gate(Arc::new(store));
    for _ in 0..50 {
        clock.advance(Duration::minutes(1));
        svc.record_entry("BENCH", "guard", "gate", &qr).unwrap();
        svc.record_exit("BENCH", "guard", "gate", &qr).unwrap();
        let _ = svc.record_exit("BENCH", "guard", "gate", &qr);
    }

    c.bench_function("store_verify", |b| {
        b.iter(|| svc.verify_integrity().unwrap())
    });
}

criterion_group!(
    benches,
    bench_sha256,
    bench_qr_codec,
    bench_gate_cycle_memory,
    bench_gate_cycle_sqlite,
    bench_store_verify,
);
criterion_main!(benches);
