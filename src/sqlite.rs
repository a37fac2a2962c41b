//! Tamper-evident, hash-chained, append-only SQLite store.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rusqlite::{params, Connection, OptionalExtension as _, TransactionBehavior};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CustodyError, LedgerError, LogError, Result, ResultExt as _};
use crate::model::{CustodyEvent, Equipment, EventInput, TraceEntry, TraceInput};
use crate::store::{
    check_causality, ChainRow, Commit, Committed, CustodyStore, IntegrityChecker,
    IntegrityReport, TraceFilter,
};
use crate::util;

pub const STORE_SCHEMA_VERSION: i64 = 1;
const BACKUP_FORMAT: &str = "custody-store-backup-v1";

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;
    PRAGMA foreign_keys=ON;

    CREATE TABLE IF NOT EXISTS meta(
      k TEXT PRIMARY KEY,
      v TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS equipment(
      serial TEXT PRIMARY KEY,
      category TEXT NOT NULL,
      record_json TEXT NOT NULL,
      registration_hash TEXT NOT NULL,
      registered_ts_ns INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events(
      seq INTEGER PRIMARY KEY,
      serial TEXT NOT NULL,
      version INTEGER NOT NULL,
      kind TEXT NOT NULL,
      ts_ns INTEGER NOT NULL,
      payload_json TEXT NOT NULL,
      payload_hash TEXT NOT NULL,
      prev_hash TEXT NOT NULL,
      entry_hash TEXT NOT NULL,
      UNIQUE(serial, version)
    );

    CREATE TABLE IF NOT EXISTS traces(
      seq INTEGER PRIMARY KEY,
      attempt_id TEXT NOT NULL UNIQUE,
      serial TEXT NOT NULL,
      kind TEXT NOT NULL,
      outcome TEXT NOT NULL,
      ts_ns INTEGER NOT NULL,
      event_seq INTEGER,
      payload_json TEXT NOT NULL,
      payload_hash TEXT NOT NULL,
      prev_hash TEXT NOT NULL,
      entry_hash TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_traces_serial ON traces(serial, seq);
    CREATE INDEX IF NOT EXISTS idx_traces_ts ON traces(ts_ns);

    CREATE TRIGGER IF NOT EXISTS equipment_no_update BEFORE UPDATE ON equipment
      BEGIN SELECT RAISE(ABORT, 'equipment records are immutable'); END;
    CREATE TRIGGER IF NOT EXISTS equipment_no_delete BEFORE DELETE ON equipment
      BEGIN SELECT RAISE(ABORT, 'equipment records are immutable'); END;
    CREATE TRIGGER IF NOT EXISTS events_no_update BEFORE UPDATE ON events
      BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS events_no_delete BEFORE DELETE ON events
      BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS traces_no_update BEFORE UPDATE ON traces
      BEGIN SELECT RAISE(ABORT, 'trace entries are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS traces_no_delete BEFORE DELETE ON traces
      BEGIN SELECT RAISE(ABORT, 'trace entries are append-only'); END;
"#;

const CHAIN_COLUMNS: &str = "seq, serial, payload_json, payload_hash, prev_hash, entry_hash";

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub store_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
    pub sqlcipher_cipher_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
    meta: StoreMeta,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Create a fresh store.  Refuses to touch an existing, non-empty file.
    pub fn create_new(db_path: &Path, db_key: Option<&SecretString>) -> Result<Self> {
        util::validate_path(db_path, "store")?;
        if std::fs::metadata(db_path).map(|m| m.len() > 0).unwrap_or(false) {
            return Err(CustodyError::Config(format!(
                "store {} already exists",
                db_path.display()
            )));
        }
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CustodyError::Config(format!("create store dir {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(db_path)?;
        // One salt per database, persisted next to it so it can be read
        // before the key is applied.
        let new_salt = match db_key {
            Some(_) => {
                let salt = generate_db_salt();
                std::fs::write(salt_path(db_path), hex::encode(salt))
                    .map_err(|e| CustodyError::Config(format!("write db salt: {e}")))?;
                Some(salt)
            }
            None => None,
        };
        let cipher_version =
            apply_sqlcipher_key_and_probe(&conn, db_key, new_salt.as_ref().map(|s| s.as_slice()))?;

        conn.execute_batch(SCHEMA)?;

        let meta = StoreMeta {
            store_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: STORE_SCHEMA_VERSION,
            sqlcipher_cipher_version: cipher_version,
        };
        write_meta(&conn, &meta)?;

        info!(store_id = %meta.store_id, path = %db_path.display(), "store created");
        Ok(Self {
            conn: Mutex::new(conn),
            meta,
        })
    }

    pub fn open_existing(db_path: &Path, db_key: Option<&SecretString>) -> Result<Self> {
        util::validate_path(db_path, "store")?;
        if !db_path.exists() {
            return Err(CustodyError::Config(format!(
                "store {} does not exist (run `custody init-store`)",
                db_path.display()
            )));
        }
        let conn = Connection::open(db_path)?;
        let stored_salt = read_db_salt(db_path);
        let cipher_version = apply_sqlcipher_key_and_probe(&conn, db_key, stored_salt.as_deref())?;

        let store_id: String = conn
            .query_row("SELECT v FROM meta WHERE k='store_id'", [], |row| row.get(0))
            .ctx_ledger("read store_id")?;
        let created_at_utc: String = conn
            .query_row("SELECT v FROM meta WHERE k='created_at_utc'", [], |row| row.get(0))
            .ctx_ledger("read created_at_utc")?;
        let schema_version: i64 = conn
            .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| {
                row.get::<_, String>(0)
            })
            .ctx_ledger("read schema_version")?
            .parse()
            .ctx_ledger("parse schema_version")?;

        if schema_version != STORE_SCHEMA_VERSION {
            return Err(LedgerError::Corrupt(format!(
                "unsupported schema_version {schema_version} (expected {STORE_SCHEMA_VERSION})"
            ))
            .into());
        }

        let stored_cipher: Option<String> = conn
            .query_row("SELECT v FROM meta WHERE k='sqlcipher_cipher_version'", [], |row| row.get(0))
            .optional()?;

        let meta = StoreMeta {
            store_id: Uuid::parse_str(&store_id).ctx_ledger("parse store_id uuid")?,
            created_at_utc,
            schema_version,
            sqlcipher_cipher_version: cipher_version.or(stored_cipher),
        };
        Ok(Self {
            conn: Mutex::new(conn),
            meta,
        })
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }
}

impl CustodyStore for SqliteStore {
    fn commit(&self, commit: Commit) -> Result<Committed> {
        commit.validate()?;
        let mut conn = self.conn.lock();
        // The trace row is durable only once the transaction commits, so any
        // database failure on the way (busy, read-only, disk full) leaves the
        // attempt unaudited.
        apply_commit(&mut conn, commit).map_err(|e| match e {
            CustodyError::Database(db) => LogError::SinkUnavailable(db.to_string()).into(),
            other => other,
        })
    }

    fn equipment(&self, serial: &str) -> Result<Option<Equipment>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM equipment WHERE serial = ?1",
                params![serial],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).ctx_ledger("decode equipment record"))
            .transpose()
    }

    fn equipment_list(&self) -> Result<Vec<Equipment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT record_json FROM equipment ORDER BY serial ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            out.push(serde_json::from_str(&json).ctx_ledger("decode equipment record")?);
        }
        Ok(out)
    }

    fn head(&self, serial: &str) -> Result<Option<CustodyEvent>> {
        let conn = self.conn.lock();
        read_head(&conn, serial)
    }

    fn events_page(&self, serial: &str, after_version: u64, limit: usize) -> Result<Vec<CustodyEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAIN_COLUMNS} FROM events WHERE serial = ?1 AND version > ?2 \
             ORDER BY version ASC LIMIT ?3"
        ))?;
        let mut rows = stmt.query(params![serial, to_sql_int(after_version), to_sql_limit(limit)])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(chain_row(row)?.to_event()?);
        }
        Ok(out)
    }

    fn traces_page(&self, filter: &TraceFilter, after_seq: u64, limit: usize) -> Result<Vec<TraceEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAIN_COLUMNS} FROM traces \
             WHERE seq > ?1 \
               AND (?2 IS NULL OR serial = ?2) \
               AND (?3 IS NULL OR ts_ns >= ?3) \
               AND (?4 IS NULL OR ts_ns <= ?4) \
               AND (?5 IS NULL OR outcome = ?5) \
               AND (?6 IS NULL OR json_extract(payload_json, '$.actor') = ?6) \
             ORDER BY seq ASC LIMIT ?7"
        ))?;
        let mut rows = stmt.query(params![
            to_sql_int(after_seq),
            filter.serial.as_deref(),
            filter.range.map(|r| util::unix_nanos(r.start)),
            filter.range.map(|r| util::unix_nanos(r.end)),
            filter.outcome.map(|o| o.as_str()),
            filter.actor.as_deref(),
            to_sql_limit(limit),
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(chain_row(row)?.to_trace()?);
        }
        Ok(out)
    }

    fn verify_integrity(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let report = verify_connection(&conn)?;
        info!(
            events = report.events,
            traces = report.traces,
            serials = report.serials,
            "store integrity verified"
        );
        Ok(report)
    }
}

fn apply_commit(conn: &mut Connection, commit: Commit) -> Result<Committed> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut trace = commit.trace;
    let event = match commit.event {
        Some(input) => {
            match &commit.equipment {
                Some(eq) => insert_equipment(&tx, eq)?,
                None if !equipment_exists(&tx, &input.serial)? => {
                    return Err(CustodyError::NotRegistered(input.serial));
                }
                None => {}
            }
            let head = read_head(&tx, &input.serial)?;
            check_causality(head.as_ref(), &input)?;
            let event = insert_event(&tx, input)?;
            trace.event_seq = Some(event.seq);
            Some(event)
        }
        None => None,
    };

    // Dropping `tx` on any error rolls the event back with it.
    let trace = insert_trace(&tx, trace)?;
    tx.commit()?;

    Ok(Committed { event, trace })
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn chain_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChainRow> {
    let seq: i64 = row.get(0)?;
    Ok(ChainRow {
        seq: u64::try_from(seq).unwrap_or_default(),
        serial: row.get(1)?,
        payload_json: row.get(2)?,
        payload_hash_hex: row.get(3)?,
        prev_hash_hex: row.get(4)?,
        entry_hash_hex: row.get(5)?,
    })
}

fn read_head(conn: &Connection, serial: &str) -> Result<Option<CustodyEvent>> {
    conn.query_row(
        &format!(
            "SELECT {CHAIN_COLUMNS} FROM events WHERE serial = ?1 ORDER BY version DESC LIMIT 1"
        ),
        params![serial],
        chain_row,
    )
    .optional()?
    .map(|r| r.to_event())
    .transpose()
}

/// Sequence and entry hash of the last row of a chained table.
fn chain_tip(conn: &Connection, table: &str) -> Result<(u64, [u8; 32])> {
    let tip: Option<(i64, String)> = conn
        .query_row(
            &format!("SELECT seq, entry_hash FROM {table} ORDER BY seq DESC LIMIT 1"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match tip {
        None => Ok((0, util::GENESIS_HASH)),
        Some((seq, hash_hex)) => {
            let bytes = hex::decode(&hash_hex).ctx_ledger("decode chain tip")?;
            let hash: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| LedgerError::Corrupt(format!("{table}: chain tip is not 32 bytes")))?;
            Ok((u64::try_from(seq).unwrap_or_default(), hash))
        }
    }
}

fn for_each_chain_row<F>(conn: &Connection, table: &str, mut f: F) -> Result<()>
where
    F: FnMut(&ChainRow) -> Result<()>,
{
    let mut stmt = conn.prepare(&format!("SELECT {CHAIN_COLUMNS} FROM {table} ORDER BY seq ASC"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        f(&chain_row(row)?)?;
    }
    Ok(())
}

fn equipment_exists(conn: &Connection, serial: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM equipment WHERE serial = ?1",
            params![serial],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn insert_equipment(conn: &Connection, eq: &Equipment) -> Result<()> {
    if equipment_exists(conn, &eq.serial)? {
        return Err(CustodyError::DuplicateSerial(eq.serial.clone()));
    }
    let record_json = serde_json::to_string(eq).ctx_ledger("encode equipment record")?;
    conn.execute(
        "INSERT INTO equipment(serial, category, record_json, registration_hash, registered_ts_ns) \
         VALUES (?1,?2,?3,?4,?5)",
        params![
            eq.serial,
            eq.category.as_str(),
            record_json,
            hex::encode(eq.registration_hash()),
            util::unix_nanos(eq.registered_at),
        ],
    )?;
    Ok(())
}

fn insert_event_row(conn: &Connection, row: &ChainRow, input: &EventInput) -> Result<()> {
    conn.execute(
        "INSERT INTO events(seq, serial, version, kind, ts_ns, payload_json, payload_hash, prev_hash, entry_hash) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            to_sql_int(row.seq),
            row.serial,
            to_sql_int(input.version),
            input.kind.as_str(),
            util::unix_nanos(input.ts),
            row.payload_json,
            row.payload_hash_hex,
            row.prev_hash_hex,
            row.entry_hash_hex,
        ],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, input: EventInput) -> Result<CustodyEvent> {
    let (last_seq, prev) = chain_tip(conn, "events")?;
    let payload = serde_json::to_string(&input).ctx_ledger("encode event payload")?;
    let (row, _) = ChainRow::link(last_seq + 1, &input.serial, payload, &prev);
    insert_event_row(conn, &row, &input)?;
    Ok(CustodyEvent::committed(row.seq, input, row.entry_hash_hex))
}

fn insert_trace_row(conn: &Connection, row: &ChainRow, input: &TraceInput) -> Result<()> {
    conn.execute(
        "INSERT INTO traces(seq, attempt_id, serial, kind, outcome, ts_ns, event_seq, payload_json, \
         payload_hash, prev_hash, entry_hash) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            to_sql_int(row.seq),
            input.attempt_id.to_string(),
            row.serial,
            input.kind.as_str(),
            input.outcome.as_str(),
            util::unix_nanos(input.ts),
            input.event_seq.map(to_sql_int),
            row.payload_json,
            row.payload_hash_hex,
            row.prev_hash_hex,
            row.entry_hash_hex,
        ],
    )?;
    Ok(())
}

/// Any failure to write the audit record is a sink failure.
fn insert_trace(conn: &Connection, input: TraceInput) -> Result<TraceEntry> {
    let write = || -> Result<TraceEntry> {
        let (last_seq, prev) = chain_tip(conn, "traces")?;
        let payload = serde_json::to_string(&input).ctx_sink("encode trace payload")?;
        let (row, _) = ChainRow::link(last_seq + 1, &input.serial, payload, &prev);
        insert_trace_row(conn, &row, &input)?;
        Ok(TraceEntry::committed(row.seq, input.clone(), row.entry_hash_hex))
    };
    write().map_err(|e| match e {
        CustodyError::Log(_) => e,
        other => LogError::SinkUnavailable(other.to_string()).into(),
    })
}

fn verify_connection(conn: &Connection) -> Result<IntegrityReport> {
    let mut checker = IntegrityChecker::new();
    for_each_chain_row(conn, "events", |row| checker.event(row))?;
    for_each_chain_row(conn, "traces", |row| checker.trace(row))?;
    let report = checker.finish()?;

    let orphans: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE serial NOT IN (SELECT serial FROM equipment)",
        [],
        |row| row.get(0),
    )?;
    if orphans > 0 {
        return Err(LedgerError::Corrupt(format!(
            "{orphans} events reference unregistered equipment"
        ))
        .into());
    }

    let mut stmt = conn.prepare("SELECT serial, record_json, registration_hash FROM equipment")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let serial: String = row.get(0)?;
        let json: String = row.get(1)?;
        let stored_hash: String = row.get(2)?;
        let eq: Equipment = serde_json::from_str(&json).ctx_ledger("decode equipment record")?;
        if eq.serial != serial || hex::encode(eq.registration_hash()) != stored_hash {
            return Err(LedgerError::Corrupt(format!(
                "equipment record '{serial}' does not match its registration hash"
            ))
            .into());
        }
    }
    Ok(report)
}

fn write_meta(conn: &Connection, meta: &StoreMeta) -> Result<()> {
    let put = |k: &str, v: &str| -> Result<()> {
        conn.execute("INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)", params![k, v])?;
        Ok(())
    };
    put("store_id", &meta.store_id.to_string())?;
    put("created_at_utc", &meta.created_at_utc)?;
    put("schema_version", &meta.schema_version.to_string())?;
    if let Some(ref cv) = meta.sqlcipher_cipher_version {
        put("sqlcipher_cipher_version", cv)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backup / restore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StoreExport {
    format: String,
    exported_at_utc: String,
    meta: StoreMeta,
    equipment: Vec<Equipment>,
    events: Vec<ChainRow>,
    traces: Vec<ChainRow>,
}

/// Export the full store (meta, equipment, both chains) to a JSON file.
pub fn export_store_json(store: &SqliteStore, out_path: &Path) -> Result<()> {
    let export = {
        let conn = store.conn.lock();
        let mut events = Vec::new();
        for_each_chain_row(&conn, "events", |row| {
            events.push(row.clone());
            Ok(())
        })?;
        let mut traces = Vec::new();
        for_each_chain_row(&conn, "traces", |row| {
            traces.push(row.clone());
            Ok(())
        })?;
        drop(conn);
        StoreExport {
            format: BACKUP_FORMAT.to_string(),
            exported_at_utc: util::now_utc_rfc3339(),
            meta: store.meta().clone(),
            equipment: store.equipment_list()?,
            events,
            traces,
        }
    };
    let json = serde_json::to_vec_pretty(&export).ctx_ledger("serialize store export")?;
    std::fs::write(out_path, json)
        .map_err(|e| CustodyError::Other(format!("write export {}: {e}", out_path.display())))?;
    info!(
        path = %out_path.display(),
        events = export.events.len(),
        traces = export.traces.len(),
        "store exported"
    );
    Ok(())
}

/// Restore a JSON backup into a new database.
///
/// Rows are inserted verbatim (original hashes preserved) and the chains are
/// verified before the import transaction commits.
pub fn import_store_json(
    json_path: &Path,
    db_path: &Path,
    db_key: Option<&SecretString>,
) -> Result<SqliteStore> {
    let json_bytes = std::fs::read(json_path)
        .map_err(|e| CustodyError::Other(format!("read import {}: {e}", json_path.display())))?;
    let export: StoreExport =
        serde_json::from_slice(&json_bytes).ctx_ledger("parse store backup")?;
    if export.format != BACKUP_FORMAT {
        return Err(LedgerError::Corrupt(format!(
            "unsupported backup format '{}'",
            util::audit_label(&export.format)
        ))
        .into());
    }

    let store = SqliteStore::create_new(db_path, db_key)?;
    let store = match restore_rows(store, &export) {
        Ok(store) => store,
        Err(e) => {
            // A half-built target would block every retry.
            remove_store_files(db_path);
            return Err(e);
        }
    };

    info!(
        events = export.events.len(),
        traces = export.traces.len(),
        "store imported and verified"
    );
    Ok(store)
}

/// Insert the backup rows verbatim and verify them inside one transaction.
fn restore_rows(mut store: SqliteStore, export: &StoreExport) -> Result<SqliteStore> {
    let meta = {
        let mut conn = store.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for eq in &export.equipment {
            insert_equipment(&tx, eq)?;
        }
        for row in &export.events {
            let input: EventInput =
                serde_json::from_str(&row.payload_json).ctx_ledger("decode imported event")?;
            insert_event_row(&tx, row, &input)?;
        }
        for row in &export.traces {
            let input: TraceInput =
                serde_json::from_str(&row.payload_json).ctx_ledger("decode imported trace")?;
            insert_trace_row(&tx, row, &input)?;
        }

        let meta = StoreMeta {
            sqlcipher_cipher_version: store.meta.sqlcipher_cipher_version.clone(),
            ..export.meta.clone()
        };
        write_meta(&tx, &meta)?;

        if let Err(e) = verify_connection(&tx) {
            warn!(error = %e, "backup failed verification; import rolled back");
            return Err(e);
        }
        tx.commit()?;
        meta
    };
    store.meta = meta;
    Ok(store)
}

/// Best-effort removal of a database, its WAL files and its salt sidecar.
fn remove_store_files(db_path: &Path) {
    let mut paths = vec![db_path.to_path_buf(), salt_path(db_path)];
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        paths.push(PathBuf::from(name));
    }
    for p in paths {
        if let Err(e) = std::fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %p.display(), error = %e, "could not remove partial store file");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLCipher helpers
// ---------------------------------------------------------------------------

fn apply_sqlcipher_key_and_probe(
    conn: &Connection,
    db_key: Option<&SecretString>,
    stored_salt: Option<&[u8]>,
) -> Result<Option<String>> {
    if let Some(key) = db_key {
        let salt = stored_salt
            .ok_or_else(|| CustodyError::Config("missing db salt for encrypted store".into()))?;
        let derived = derive_db_key(key.expose_secret(), salt);
        conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", hex::encode(derived)))?;
        let _ = conn.execute_batch(
            r#"
            PRAGMA cipher_compatibility = 4;
            PRAGMA cipher_memory_security = ON;
            "#,
        );
    }

    let cipher_version: Option<String> = conn
        .query_row("PRAGMA cipher_version;", [], |row| row.get(0))
        .optional()
        .unwrap_or(None);

    if db_key.is_some() && cipher_version.is_none() {
        return Err(CustodyError::Config(
            "SQLCipher key provided but SQLCipher not active (cipher_version probe failed)".into(),
        ));
    }
    if let Some(ref cv) = cipher_version {
        info!(sqlcipher_cipher_version = %cv, "SQLCipher detected");
    }

    Ok(cipher_version)
}

fn salt_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".salt");
    PathBuf::from(name)
}

/// Per-database salt from the sidecar file, if any.
fn read_db_salt(db_path: &Path) -> Option<Vec<u8>> {
    std::fs::read_to_string(salt_path(db_path))
        .ok()
        .and_then(|s| hex::decode(s.trim()).ok())
}

const DB_SALT_LEN: usize = 16;

fn derive_db_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    const ITERATIONS: u32 = 100_000;
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, ITERATIONS, &mut out);
    out
}

fn generate_db_salt() -> [u8; DB_SALT_LEN] {
    use rand::RngCore as _;
    let mut salt = [0u8; DB_SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
