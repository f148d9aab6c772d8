use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::model::{Ms, SECOND};

/// Runtime settings, read from `PARKGRID_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub sensor_port: u16,
    pub map_port: u16,
    /// `None` runs on an ephemeral store.
    pub data_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub sweep_interval: Ms,
    /// How far ahead of `begin` the starting-soon reminder goes out.
    pub reminder_lead: Ms,
    /// How long after `begin` an unhonored reservation survives.
    pub reservation_grace: Ms,
    pub max_grid_cells: usize,
    pub redis_url: Option<String>,
    pub push_url: Option<String>,
    pub push_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            sensor_port: 7401,
            map_port: 7402,
            data_dir: Some(PathBuf::from("./data")),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: 10 * SECOND,
            reminder_lead: 900 * SECOND,
            reservation_grace: 0,
            max_grid_cells: crate::limits::MAX_GRID_CELLS,
            redis_url: None,
            push_url: None,
            push_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let opt = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let secs = |key: &str, default: Ms| parsed::<u64>(&lookup, key).map_or(default, |s| s as Ms * SECOND);

        let data_dir = match lookup("PARKGRID_DATA_DIR") {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => d.data_dir.clone(),
        };

        Self {
            bind: opt("PARKGRID_BIND").unwrap_or(d.bind),
            sensor_port: parsed(&lookup, "PARKGRID_SENSOR_PORT").unwrap_or(d.sensor_port),
            map_port: parsed(&lookup, "PARKGRID_MAP_PORT").unwrap_or(d.map_port),
            data_dir,
            metrics_port: parsed(&lookup, "PARKGRID_METRICS_PORT"),
            max_connections: parsed(&lookup, "PARKGRID_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "PARKGRID_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            sweep_interval: secs("PARKGRID_SWEEP_INTERVAL_SECS", d.sweep_interval),
            reminder_lead: secs("PARKGRID_REMINDER_LEAD_SECS", d.reminder_lead),
            reservation_grace: secs("PARKGRID_RESERVATION_GRACE_SECS", d.reservation_grace),
            max_grid_cells: parsed(&lookup, "PARKGRID_MAX_GRID_CELLS").unwrap_or(d.max_grid_cells),
            redis_url: opt("PARKGRID_REDIS_URL"),
            push_url: opt("PARKGRID_PUSH_URL"),
            push_token: opt("PARKGRID_PUSH_TOKEN"),
        }
    }

    /// Ephemeral-store defaults, for tests and embedding.
    pub fn ephemeral() -> Self {
        Self {
            data_dir: None,
            ..Self::default()
        }
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("parkgrid.wal"))
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("invalid {key}={raw:?} ({e}), using default");
            None
        }
    }
}
