use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use custody_core::{
    clock::{Clock as _, SystemClock},
    config::CustodyConfig,
    ledger::CustodyLedger,
    model::{Category, DateRange, NewEquipment, Outcome},
    qr::{self, QrIssuer},
    report::{self, ReportAggregator},
    sqlite::{self, SqliteStore},
    store::{CustodyStore, TraceFilter},
    trace::TraceLog,
    util, CustodyService,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "custody",
    version = util::VERSION,
    about = "Hospital gate equipment custody core (offline)"
)]
struct Cli {
    /// Path to the custody store (SQLite / SQLCipher).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Read the DB encryption key from this environment variable.
    #[arg(long, global = true, default_value = "CUSTODY_DB_KEY")]
    db_key_env: String,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Operator recorded as the actor of commands.
    #[arg(long, global = true, default_value = "operator")]
    actor: String,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty custody store.
    InitStore,

    /// Generate the Ed25519 QR signing keypair.
    Keygen {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Register one piece of equipment.
    Register {
        #[arg(long)]
        serial: String,
        /// `technological` or `biomedical`.
        #[arg(long)]
        category: Category,
        #[arg(long)]
        custodian: String,
        #[arg(long)]
        description: Option<String>,
        /// Photo reference; required for biomedical equipment.
        #[arg(long)]
        photo: Option<String>,
        #[arg(long, default_value = "registration desk")]
        location: String,
    },

    /// Batch-register equipment from a CSV
    /// (serial, category, custodian, description, photo_ref).
    ImportEquipment {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "registration desk")]
        location: String,
    },

    /// Issue a signed QR payload for registered equipment.
    IssueQr {
        #[arg(long)]
        serial: String,
        /// Also write the QR text to this file.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Record an entry through a gate.
    Entry {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        location: String,
        /// Scanned QR text (`EQR1.` form).
        #[arg(long)]
        qr: String,
    },

    /// Record an exit through a gate.
    Exit {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        qr: String,
    },

    /// Flag equipment for administrative review.
    Flag {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        note: String,
    },

    /// Flag equipment, disputing one of its recorded events.
    Dispute {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        note: String,
        /// Ledger sequence of the disputed event.
        #[arg(long)]
        event_seq: u64,
    },

    /// Clear a FLAGGED state (administrative override).
    Reinstate {
        #[arg(long)]
        serial: String,
        #[arg(long)]
        note: String,
    },

    /// Print the current custody state of a serial.
    State {
        #[arg(long)]
        serial: String,
    },

    /// Print the ordered custody history of a serial.
    History {
        #[arg(long)]
        serial: String,
    },

    /// Query the traceability log.
    Trace {
        #[arg(long)]
        serial: Option<String>,
        /// RFC 3339 lower bound (inclusive).
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 upper bound (inclusive).
        #[arg(long)]
        to: Option<String>,
        /// `accepted` or `rejected`.
        #[arg(long)]
        outcome: Option<Outcome>,
        /// Only attempts made by this operator (`--actor` names the caller).
        #[arg(long)]
        by_actor: Option<String>,
    },

    /// Build a custody report and write the report pack.
    Report {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Verify both hash chains and the custody invariants.
    VerifyStore,

    /// Export the store to a JSON backup file.
    ExportStore {
        #[arg(long)]
        out: PathBuf,
    },

    /// Import a store from a JSON backup into a new database.
    ImportStore {
        #[arg(long)]
        json: PathBuf,
        /// Path for the new database (must not already exist).
        #[arg(long)]
        target_db: PathBuf,
    },

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = CustodyConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();
    cfg.validate().context("validate config")?;

    init_logging(&cfg.logging)?;

    let db_path = cli.db.clone().unwrap_or(cfg.paths.db.clone());
    util::validate_path(&db_path, "db")?;
    let db_key = std::env::var(&cli.db_key_env)
        .ok()
        .or(cfg.security.db_key.clone())
        .map(|s| SecretString::new(s.into()));
    let actor = cli.actor.as_str();

    match cli.cmd {
        Commands::InitStore => {
            let store =
                SqliteStore::create_new(&db_path, db_key.as_ref()).context("create store")?;
            info!(store_id = %store.meta().store_id, "store initialized");
        }

        Commands::Keygen { out_dir } => {
            let out_dir = out_dir.unwrap_or(cfg.paths.keys_dir.clone());
            qr::generate_signing_keypair(&out_dir).context("keygen")?;
            info!(out_dir = %out_dir.display(), "generated qr_signing.key and qr_verify.key");
        }

        Commands::Register {
            serial,
            category,
            custodian,
            description,
            photo,
            location,
        } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let mut new = NewEquipment::new(serial, category, custodian);
            new.description = description;
            new.photo_ref = photo;
            let equipment = svc
                .register_equipment(new, actor, &location)
                .context("register equipment")?;
            emit(cli.json, &equipment, || {
                format!("registered {} ({})", equipment.serial, equipment.category)
            })?;
        }

        Commands::ImportEquipment { csv, location } => {
            util::validate_path(&csv, "csv")?;
            let csv = util::canonicalize_if_exists(&csv, "csv")?;
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;

            let mut rdr = csv::Reader::from_path(&csv)
                .with_context(|| format!("open csv: {}", csv.display()))?;
            let headers = rdr.headers().context("read csv headers")?.clone();
            for required in ["serial", "category", "custodian"] {
                if !headers.iter().any(|h| h.eq_ignore_ascii_case(required)) {
                    anyhow::bail!("csv missing required header '{required}'");
                }
            }

            let (mut registered, mut skipped, mut row_count) = (0usize, 0usize, 0usize);
            for rec in rdr.deserialize::<CsvRow>() {
                row_count += 1;
                if row_count > util::MAX_CSV_ROWS {
                    anyhow::bail!("csv exceeds maximum row limit of {}", util::MAX_CSV_ROWS);
                }
                let row = rec.context("parse csv row")?;
                let category: Category = match row.category.parse() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(row = row_count, error = %e, "bad category; skipping");
                        skipped += 1;
                        continue;
                    }
                };
                let mut new = NewEquipment::new(row.serial, category, row.custodian);
                new.description = row.description.filter(|d| !d.trim().is_empty());
                new.photo_ref = row.photo_ref.filter(|p| !p.trim().is_empty());
                match svc.register_equipment(new, actor, &location) {
                    Ok(_) => registered += 1,
                    Err(e) if e.is_fatal() => {
                        return Err(e).context("register equipment");
                    }
                    Err(e) => {
                        warn!(row = row_count, error = %e, "registration rejected; skipping");
                        skipped += 1;
                    }
                }
            }
            info!(registered, skipped, "equipment import finished");
        }

        Commands::IssueQr { serial, out } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let payload = svc.issue_qr_code(&serial).context("issue QR")?;
            let text = payload.to_text();
            if let Some(out) = out {
                std::fs::write(&out, &text).with_context(|| format!("write {}", out.display()))?;
                info!(out = %out.display(), "QR payload written");
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&payload.summary())?);
            } else {
                println!("{text}");
            }
        }

        Commands::Entry { serial, location, qr } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let event = svc
                .record_entry(&serial, actor, &location, &qr)
                .context("record entry")?;
            emit(cli.json, &event, || format!("{} is INSIDE (seq {})", event.serial, event.seq))?;
        }

        Commands::Exit { serial, location, qr } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let event = svc
                .record_exit(&serial, actor, &location, &qr)
                .context("record exit")?;
            emit(cli.json, &event, || format!("{} is OUTSIDE (seq {})", event.serial, event.seq))?;
        }

        Commands::Flag { serial, note } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let event = svc.flag(&serial, actor, &note).context("flag equipment")?;
            emit(cli.json, &event, || format!("{} is FLAGGED (seq {})", event.serial, event.seq))?;
        }

        Commands::Dispute {
            serial,
            note,
            event_seq,
        } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let event = svc
                .dispute(&serial, actor, &note, event_seq)
                .context("dispute event")?;
            emit(cli.json, &event, || {
                format!("{} is FLAGGED, disputing seq {event_seq}", event.serial)
            })?;
        }

        Commands::Reinstate { serial, note } => {
            let svc = open_service(&cfg, &db_path, db_key.as_ref())?;
            let event = svc
                .reinstate(&serial, actor, &note)
                .context("reinstate equipment")?;
            emit(cli.json, &event, || {
                format!("{} is REGISTERED (seq {})", event.serial, event.seq)
            })?;
        }

        Commands::State { serial } => {
            let ledger = open_ledger(&db_path, db_key.as_ref())?;
            let state = ledger.current_state(&serial).context("read state")?;
            if cli.json {
                println!("{}", serde_json::json!({ "serial": serial, "state": state }));
            } else {
                println!("{serial}: {state}");
            }
        }

        Commands::History { serial } => {
            let ledger = open_ledger(&db_path, db_key.as_ref())?;
            for event in &ledger.history(&serial) {
                let event = event.context("read history")?;
                emit(cli.json, &event, || {
                    let note = event.note.as_deref().unwrap_or("");
                    format!(
                        "{:>6}  v{:<4} {}  {:<10} {:<16} {:<16} {note}",
                        event.seq,
                        event.version,
                        util::format_rfc3339(event.ts),
                        event.kind,
                        event.actor,
                        event.location,
                    )
                })?;
            }
        }

        Commands::Trace {
            serial,
            from,
            to,
            outcome,
            by_actor,
        } => {
            let store = open_store(&db_path, db_key.as_ref())?;
            let mut filter = match serial {
                Some(s) => TraceFilter::for_serial(s),
                None => TraceFilter::all(),
            };
            if from.is_some() || to.is_some() {
                filter = filter.in_range(parse_range(from.as_deref(), to.as_deref())?);
            }
            if let Some(outcome) = outcome {
                filter = filter.with_outcome(outcome);
            }
            if let Some(actor) = by_actor {
                filter = filter.by_actor(actor);
            }
            for entry in TraceLog::new(store).query(filter) {
                let entry = entry.context("read trace")?;
                emit(cli.json, &entry, || {
                    format!(
                        "{:>6}  {}  {:<8} {:<10} {:<20} {:<12} {}",
                        entry.seq,
                        util::format_rfc3339(entry.ts),
                        entry.outcome.as_str(),
                        entry.kind,
                        entry.serial,
                        entry.actor,
                        entry.reason.as_deref().unwrap_or(""),
                    )
                })?;
            }
        }

        Commands::Report { from, to, out_dir } => {
            let store = open_store(&db_path, db_key.as_ref())?;
            let clock = Arc::new(SystemClock);
            let now = clock.now();
            let range = if from.is_some() || to.is_some() {
                parse_range(from.as_deref(), to.as_deref())?
            } else {
                DateRange::until(now)
            };
            let reports = ReportAggregator::new(
                CustodyLedger::new(Arc::clone(&store)),
                TraceLog::new(store),
                clock,
                cfg.policy().max_stay,
            );
            let report = reports.build(range, now).context("build report")?;
            let out = out_dir.unwrap_or(cfg.paths.report_out_dir.clone());
            report::write_report_pack(&out, &report).context("write report pack")?;
            emit(cli.json, &report.summary, || {
                let s = &report.summary;
                format!(
                    "equipment {} | inside {} | outside {} | overdue {} | rejected {} | flags {}\nreport pack: {}",
                    s.equipment_total,
                    s.inside_now,
                    s.outside_now,
                    s.overdue,
                    s.rejected_attempts,
                    s.flags,
                    out.display()
                )
            })?;
        }

        Commands::VerifyStore => {
            let store = SqliteStore::open_existing(&db_path, db_key.as_ref())
                .context("open store")?;
            let meta = store.meta().clone();
            info!(store_id = %meta.store_id, schema_version = meta.schema_version, "verifying");
            let summary = store.verify_integrity().context("verify integrity")?;
            info!(
                events = summary.events,
                traces = summary.traces,
                serials = summary.serials,
                "store verification passed"
            );
            emit(cli.json, &summary, || {
                format!(
                    "ok: {} events, {} traces, {} serials",
                    summary.events, summary.traces, summary.serials
                )
            })?;
        }

        Commands::ExportStore { out } => {
            let store = SqliteStore::open_existing(&db_path, db_key.as_ref())
                .context("open store")?;
            sqlite::export_store_json(&store, &out).context("export store")?;
            info!(out = %out.display(), "store exported");
        }

        Commands::ImportStore { json, target_db } => {
            anyhow::ensure!(
                !target_db.exists(),
                "target database {} already exists -- will not overwrite",
                target_db.display()
            );
            let imported = sqlite::import_store_json(&json, &target_db, db_key.as_ref())
                .context("import store")?;
            info!(
                store_id = %imported.meta().store_id,
                "store imported to {}",
                target_db.display()
            );
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, serde::Deserialize)]
struct CsvRow {
    serial: String,
    category: String,
    custodian: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    photo_ref: Option<String>,
}

fn open_store(db_path: &Path, db_key: Option<&SecretString>) -> Result<Arc<dyn CustodyStore>> {
    let store = SqliteStore::open_existing(db_path, db_key).context("open store")?;
    Ok(Arc::new(store))
}

fn open_ledger(db_path: &Path, db_key: Option<&SecretString>) -> Result<CustodyLedger> {
    Ok(CustodyLedger::new(open_store(db_path, db_key)?))
}

fn open_service(
    cfg: &CustodyConfig,
    db_path: &Path,
    db_key: Option<&SecretString>,
) -> Result<CustodyService> {
    let key_path = cfg.signing_key_path();
    util::validate_path(&key_path, "QR signing key")?;
    let issuer = QrIssuer::from_key_file(&key_path)
        .context("load QR signing key (run `custody keygen`)")?;
    Ok(CustodyService::new(
        open_store(db_path, db_key)?,
        issuer,
        Arc::new(SystemClock),
        cfg.policy(),
    ))
}

fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<DateRange> {
    let end = match to {
        Some(t) => util::parse_rfc3339(t).context("parse --to")?,
        None => SystemClock.now(),
    };
    let start = match from {
        Some(f) => util::parse_rfc3339(f).context("parse --from")?,
        None => DateRange::until(end).start,
    };
    Ok(DateRange::new(start, end)?)
}

/// Print `value` as one JSON line, or the human rendering.
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(value).context("serialize output")?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn init_logging(cfg: &custody_core::config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // JSON output to stdout for container / SIEM pipelines.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON-lines output to file for SIEM integration.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr, keeping stdout for results.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
