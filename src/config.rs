use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::BookingPolicy;
use crate::model::{MINUTE_MS, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

/// Bearer secrets guarding machine-to-machine endpoints. `None` disables the endpoint.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub cron: Option<String>,
    pub webhook: Option<String>,
    pub sync: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub hold_window_minutes: u32,
    pub accept_window_hours: u32,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub secrets: Secrets,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secret = |var: &str| lookup(var).filter(|s| !s.is_empty());
        Ok(Self {
            bind: lookup("SLOPEBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&lookup, "SLOPEBOOK_PORT")?.unwrap_or(8080),
            data_dir: lookup("SLOPEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            hold_window_minutes: positive(&lookup, "SLOPEBOOK_HOLD_WINDOW_MINUTES")?.unwrap_or(30),
            accept_window_hours: positive(&lookup, "SLOPEBOOK_ACCEPT_WINDOW_HOURS")?.unwrap_or(48),
            compact_threshold: parse(&lookup, "SLOPEBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse(&lookup, "SLOPEBOOK_METRICS_PORT")?,
            secrets: Secrets {
                cron: secret("SLOPEBOOK_CRON_SECRET"),
                webhook: secret("SLOPEBOOK_WEBHOOK_SECRET"),
                sync: secret("SLOPEBOOK_SYNC_SECRET"),
            },
        })
    }

    pub fn policy(&self) -> BookingPolicy {
        BookingPolicy {
            hold_window: Ms::from(self.hold_window_minutes) * MINUTE_MS,
            acceptance_window: Ms::from(self.accept_window_hours) * 60 * MINUTE_MS,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<u32>, ConfigError> {
    match parse::<u32>(lookup, var)? {
        Some(0) => Err(ConfigError { var, value: "0".into() }),
        other => Ok(other),
    }
}
