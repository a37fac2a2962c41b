//! Equipment custody lifecycle core for a hospital gate.
//!
//! This crate provides:
//! - An event-sourced custody state machine (UNKNOWN, REGISTERED, INSIDE,
//!   OUTSIDE, FLAGGED) with serialised per-serial transitions
//! - Signed, expiring QR identity payloads (Ed25519)
//! - An append-only, hash-chained custody ledger and traceability log on
//!   SQLite (SQLCipher-compatible) or in memory
//! - Read-only custody reports and a JSON report pack
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod clock;
pub mod ledger;
pub mod locks;
pub mod machine;
pub mod model;
pub mod qr;
pub mod report;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod trace;
pub mod util;

pub use error::{CustodyError, Result};
pub use service::{CustodyPolicy, CustodyService};
