//! Shared configuration files updated by every host of a pass.
//!
//! `timezone.json` and `timediff.json` map host names to their UTC offset
//! and clock difference; the collection marker throttles the management
//! host. Each file is read-modify-written under `<file>.lock`.

use crate::error::{HarvestError, Result};
use crate::exec::RemoteExecutor;
use chrono::Local;
use fs2::FileExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const TIMEZONE_TABLE: &str = "timezone.json";
pub const TIMEDIFF_TABLE: &str = "timediff.json";

/// Clock differences below this are not recorded.
const MIN_CLOCK_SKEW_SECS: i64 = 10;

const MARKER_INTERVAL: Duration = Duration::from_secs(1200);
const FEDRAMP_MARKER_INTERVAL: Duration = Duration::from_secs(60);

/// Run `f` while holding an exclusive lock on `<path>.lock`.
pub fn with_file_lock<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| HarvestError::storage(dir, e))?;
    }
    let mut lock_name = path.as_os_str().to_owned();
    lock_name.push(".lock");
    let lock_path = PathBuf::from(lock_name);
    let lock = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&lock_path)
        .map_err(|e| HarvestError::storage(&lock_path, e))?;
    lock.lock_exclusive()
        .map_err(|e| HarvestError::storage(&lock_path, e))?;
    let result = f();
    let _ = FileExt::unlock(&lock);
    result
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(HarvestError::Parse(format!("{} is not a JSON object", path.display()))),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(HarvestError::storage(path, e)),
    }
}

fn write_object(path: &Path, map: &Map<String, Value>) -> Result<()> {
    let body = serde_json::to_string_pretty(map)?;
    fs::write(path, body).map_err(|e| HarvestError::storage(path, e))
}

/// Merge `entries` into the JSON object at `path`; rewrites only on change.
pub fn merge_table(path: &Path, entries: &BTreeMap<String, Value>) -> Result<bool> {
    with_file_lock(path, || {
        let mut table = read_object(path)?;
        let mut changed = false;
        for (key, value) in entries {
            if table.get(key) != Some(value) {
                table.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            write_object(path, &table)?;
        }
        Ok(changed)
    })
}

/// Timezone and clock difference of one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    /// UTC offset such as `+09:00`.
    pub timezone: Option<String>,
    /// `local - remote` in seconds.
    pub clock_skew_secs: Option<i64>,
}

impl HostInfo {
    pub fn query(executor: &mut dyn RemoteExecutor) -> Self {
        let host = executor.host().to_string();
        let timezone = match executor.run("/bin/date +%:z") {
            Ok(out) if out.success() => Some(out.stdout_lossy().trim().to_string()).filter(|s| !s.is_empty()),
            Ok(out) => {
                debug!(host = %host, stderr = %out.stderr.trim(), "Skip querying timezone");
                None
            }
            Err(e) => {
                debug!(host = %host, error = %e, "Skip querying timezone");
                None
            }
        };

        let clock_skew_secs = executor
            .run("/bin/date +%s")
            .ok()
            .filter(|out| out.success())
            .and_then(|out| out.stdout_lossy().trim().parse::<i64>().ok())
            .map(|remote| Local::now().timestamp() - remote);

        Self {
            timezone,
            clock_skew_secs,
        }
    }
}

/// Entries gathered over a pass, flushed once at the end.
#[derive(Debug, Clone, Default)]
pub struct HostTables {
    timezones: BTreeMap<String, Value>,
    time_diffs: BTreeMap<String, Value>,
}

impl HostTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the harvesting machine's own offset under each of its names.
    pub fn record_local(&mut self, names: &[String]) {
        let offset = Local::now().format("%:z").to_string();
        for name in names {
            self.timezones.insert(name.clone(), Value::String(offset.clone()));
        }
    }

    pub fn record(&mut self, host: &str, info: &HostInfo) {
        if let Some(tz) = &info.timezone {
            self.timezones.insert(host.to_string(), Value::String(tz.clone()));
        }
        if let Some(skew) = info.clock_skew_secs {
            if skew.abs() >= MIN_CLOCK_SKEW_SECS {
                info!(host, skew, "Clock difference recorded");
                self.time_diffs.insert(host.to_string(), Value::from(skew));
            }
        }
    }

    pub fn flush(&self, config_dir: &Path) -> Result<()> {
        merge_table(&config_dir.join(TIMEZONE_TABLE), &self.timezones)?;
        merge_table(&config_dir.join(TIMEDIFF_TABLE), &self.time_diffs)?;
        Ok(())
    }
}

pub fn marker_path(config_dir: &Path, profile: &str) -> PathBuf {
    if profile.is_empty() {
        config_dir.join("collection_marker.json")
    } else {
        config_dir.join(format!("collection_marker_{profile}.json"))
    }
}

pub fn marker_interval(profile: &str) -> Duration {
    if profile == "fedramp" {
        FEDRAMP_MARKER_INTERVAL
    } else {
        MARKER_INTERVAL
    }
}

/// Claim the management collection slot.
///
/// True (and the marker is advanced to `now_epoch`) when the last scan is
/// older than `interval`.
pub fn claim_marker(path: &Path, interval: Duration, now_epoch: f64) -> Result<bool> {
    with_file_lock(path, || {
        let mut marker = read_object(path)?;
        let last_scan = marker
            .get("last_scan_time")
            .and_then(Value::as_f64)
            .unwrap_or(-1.0);
        if last_scan >= now_epoch - interval.as_secs_f64() {
            info!(path = %path.display(), "Management host collected recently; skipping");
            return Ok(false);
        }
        marker.insert("last_scan_time".into(), Value::from(now_epoch));
        write_object(path, &marker)?;
        Ok(true)
    })
}
