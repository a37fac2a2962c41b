//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `custody.toml` next to the executable
//! 3. `~/.config/custody/config.toml`
//! 4. Built-in defaults
//!
//! Environment variables (`CUSTODY_DB`, `CUSTODY_DB_KEY`, `CUSTODY_LOG_LEVEL`,
//! `CUSTODY_QR_KEY_FILE`) override the file.  CLI arguments always take
//! precedence over both.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use time::Duration;

use crate::error::{CustodyError, Result, ResultExt as _};
use crate::qr::{QrValidity, SIGNING_KEY_FILE};
use crate::service::CustodyPolicy;

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    pub paths: PathsConfig,
    pub qr: QrConfig,
    pub custody: PolicyConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    pub keys_dir: PathBuf,
    pub report_out_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    pub validity_days: i64,
    pub max_clock_skew_secs: i64,
    /// Signing key file; defaults to `<keys_dir>/qr_signing.key`.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_stay_days: i64,
    /// Location recorded on administrative events (flag, dispute, reinstate).
    pub admin_location: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.  Empty means no file logging.
    pub json_log_file: String,
    /// Emit JSON to stdout instead of human-readable lines.
    pub json_stdout: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub db_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("custody.db"),
            keys_dir: PathBuf::from("custody-keys"),
            report_out_dir: PathBuf::from("custody-report"),
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            validity_days: 365,
            max_clock_skew_secs: 300,
            key_file: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_stay_days: 3,
            admin_location: "administration".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl CustodyConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: CustodyConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("custody.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        if let Some(home) = std::env::var_os("HOME") {
            let candidate = PathBuf::from(home)
                .join(".config")
                .join("custody")
                .join("config.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("CUSTODY_DB_KEY") {
            self.security.db_key = Some(key);
        }
        if let Ok(db) = std::env::var("CUSTODY_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("CUSTODY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(key_file) = std::env::var("CUSTODY_QR_KEY_FILE") {
            self.qr.key_file = Some(PathBuf::from(key_file));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.qr.validity_days <= 0 {
            return Err(CustodyError::Config("qr.validity_days must be positive".into()));
        }
        if self.qr.max_clock_skew_secs < 0 {
            return Err(CustodyError::Config(
                "qr.max_clock_skew_secs must not be negative".into(),
            ));
        }
        if self.custody.max_stay_days <= 0 {
            return Err(CustodyError::Config(
                "custody.max_stay_days must be positive".into(),
            ));
        }
        crate::util::validate_label(&self.custody.admin_location, "custody.admin_location")
            .map_err(|e| CustodyError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn signing_key_path(&self) -> PathBuf {
        self.qr
            .key_file
            .clone()
            .unwrap_or_else(|| self.paths.keys_dir.join(SIGNING_KEY_FILE))
    }

    pub fn qr_validity(&self) -> QrValidity {
        QrValidity {
            validity: Duration::days(self.qr.validity_days),
            max_clock_skew: Duration::seconds(self.qr.max_clock_skew_secs),
        }
    }

    pub fn policy(&self) -> CustodyPolicy {
        CustodyPolicy {
            max_stay: Duration::days(self.custody.max_stay_days),
            admin_location: self.custody.admin_location.clone(),
            qr_validity: self.qr_validity(),
        }
    }
}
