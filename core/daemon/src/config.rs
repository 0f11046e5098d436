//! Daemon configuration, read from TOML at startup.
//!
//! Every key is optional. A missing file yields defaults; the caller decides
//! what to do with a parse error (the daemon logs it and runs on defaults).

use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_ENV: &str = "ATTENDANCE_CONFIG";
const SOCKET_ENV: &str = "ATTENDANCE_SOCKET";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".attendance/daemon/config.toml";
const DEFAULT_DATA_RELATIVE_DIR: &str = ".attendance/daemon";
const DEFAULT_SOCKET_RELATIVE_PATH: &str = ".attendance/daemon.sock";

const DB_FILE: &str = "attendance.db";
const SNAPSHOT_FILE: &str = "current_attendees.json";
const MEMBERS_EXPORT_FILE: &str = "members.json";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default = "default_scan_history_len")]
    pub scan_history_len: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            socket_path: None,
            log_dir: None,
            sweep: SweepConfig::default(),
            scan_history_len: default_scan_history_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: default_sweep_hour(),
            minute: 0,
        }
    }
}

impl SweepConfig {
    pub fn time_of_day(&self) -> Result<NaiveTime, String> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).ok_or_else(|| {
            format!(
                "Invalid sweep time {:02}:{:02}; hour must be 0-23 and minute 0-59",
                self.hour, self.minute
            )
        })
    }

    /// The configured time, or the default 04:00 when it is out of range.
    pub fn time_of_day_or_default(&self) -> NaiveTime {
        self.time_of_day().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Using default sweep time");
            NaiveTime::from_hms_opt(default_sweep_hour(), 0, 0).unwrap_or_default()
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_sweep_hour() -> u32 {
    4
}

fn default_scan_history_len() -> usize {
    10
}

/// Concrete on-disk locations derived from the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub data_dir: PathBuf,
    pub socket: PathBuf,
    pub db: PathBuf,
    pub snapshot: PathBuf,
    pub members_export: PathBuf,
}

impl DaemonPaths {
    pub fn resolve(config: &DaemonConfig, home: &Path) -> Self {
        let data_dir = config
            .data_dir
            .clone()
            .unwrap_or_else(|| home.join(DEFAULT_DATA_RELATIVE_DIR));
        let socket = std::env::var_os(SOCKET_ENV)
            .map(PathBuf::from)
            .or_else(|| config.socket_path.clone())
            .unwrap_or_else(|| home.join(DEFAULT_SOCKET_RELATIVE_PATH));

        Self {
            db: data_dir.join(DB_FILE),
            snapshot: data_dir.join(SNAPSHOT_FILE),
            members_export: data_dir.join(MEMBERS_EXPORT_FILE),
            socket,
            data_dir,
        }
    }
}

pub fn home_dir() -> Result<PathBuf, String> {
    dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())
}

pub fn default_config_path() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config.sweep.time_of_day()?;
    Ok(config)
}
