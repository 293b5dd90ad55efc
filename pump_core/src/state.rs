//! Pump manager state persistence with file locking.
//!
//! State round-trips through an ordered key/value map so hosts can store it
//! alongside their own settings. `reservoirUnitsRemaining` is required; every
//! other key falls back to a default when absent.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chrono::FixedOffset;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{Error, Result, DEFAULT_MAXIMUM_BASAL_RATE_PER_HOUR, DEFAULT_MAXIMUM_BOLUS};

/// Ordered key/value form of persisted manager state
pub type RawState = BTreeMap<String, Value>;

const KEY_RESERVOIR: &str = "reservoirUnitsRemaining";
const KEY_TEMP_BASAL_ERROR: &str = "tempBasalShouldError";
const KEY_BOLUS_ERROR: &str = "bolusShouldError";
const KEY_SUSPEND_ERROR: &str = "suspendShouldError";
const KEY_RESUME_ERROR: &str = "resumeShouldError";
const KEY_MAXIMUM_BOLUS: &str = "maximumBolus";
const KEY_MAXIMUM_BASAL_RATE: &str = "maximumBasalRatePerHour";
const KEY_BATTERY: &str = "pumpBatteryChargeRemaining";
const KEY_SUSPENDED: &str = "deliverySuspended";
const KEY_TIME_ZONE: &str = "timeZoneOffsetSeconds";

/// Command lane whose device round trip can be forced to fail
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandLane {
    TempBasal,
    Bolus,
    Suspend,
    Resume,
}

/// Per-lane error injection for the simulated device
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInjection {
    pub temp_basal: bool,
    pub bolus: bool,
    pub suspend: bool,
    pub resume: bool,
}

impl ErrorInjection {
    pub fn should_error(&self, lane: CommandLane) -> bool {
        match lane {
            CommandLane::TempBasal => self.temp_basal,
            CommandLane::Bolus => self.bolus,
            CommandLane::Suspend => self.suspend,
            CommandLane::Resume => self.resume,
        }
    }

    pub fn set(&mut self, lane: CommandLane, should_error: bool) {
        match lane {
            CommandLane::TempBasal => self.temp_basal = should_error,
            CommandLane::Bolus => self.bolus = should_error,
            CommandLane::Suspend => self.suspend = should_error,
            CommandLane::Resume => self.resume = should_error,
        }
    }
}

/// Snapshot of long-lived manager state
#[derive(Clone, Debug, PartialEq)]
pub struct PumpManagerState {
    pub reservoir_units_remaining: f64,
    pub error_injection: ErrorInjection,
    pub maximum_bolus: f64,
    pub maximum_basal_rate_per_hour: f64,
    pub battery_charge_remaining: Option<f64>,
    pub delivery_suspended: bool,
    pub time_zone: FixedOffset,
}

impl PumpManagerState {
    /// Fresh state for a newly paired pump
    pub fn new(reservoir_units_remaining: f64) -> Self {
        Self {
            reservoir_units_remaining,
            error_injection: ErrorInjection::default(),
            maximum_bolus: DEFAULT_MAXIMUM_BOLUS,
            maximum_basal_rate_per_hour: DEFAULT_MAXIMUM_BASAL_RATE_PER_HOUR,
            battery_charge_remaining: None,
            delivery_suspended: false,
            time_zone: utc_offset(),
        }
    }

    /// Restore from the key/value form
    ///
    /// Fails if `reservoirUnitsRemaining` is missing or any present key has
    /// the wrong type.
    pub fn from_raw(raw: &RawState) -> Result<Self> {
        let reservoir_units_remaining = raw
            .get(KEY_RESERVOIR)
            .ok_or_else(|| Error::State(format!("missing required key `{}`", KEY_RESERVOIR)))
            .and_then(|v| as_f64(KEY_RESERVOIR, v))?;

        let error_injection = ErrorInjection {
            temp_basal: optional_bool(raw, KEY_TEMP_BASAL_ERROR)?.unwrap_or(false),
            bolus: optional_bool(raw, KEY_BOLUS_ERROR)?.unwrap_or(false),
            suspend: optional_bool(raw, KEY_SUSPEND_ERROR)?.unwrap_or(false),
            resume: optional_bool(raw, KEY_RESUME_ERROR)?.unwrap_or(false),
        };

        let time_zone = match raw.get(KEY_TIME_ZONE) {
            None | Some(Value::Null) => utc_offset(),
            Some(v) => {
                let secs = v
                    .as_i64()
                    .ok_or_else(|| type_error(KEY_TIME_ZONE, "an integer"))?;
                i32::try_from(secs)
                    .ok()
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| {
                        Error::State(format!("`{}` out of range: {}", KEY_TIME_ZONE, secs))
                    })?
            }
        };

        Ok(Self {
            reservoir_units_remaining,
            error_injection,
            maximum_bolus: optional_f64(raw, KEY_MAXIMUM_BOLUS)?.unwrap_or(DEFAULT_MAXIMUM_BOLUS),
            maximum_basal_rate_per_hour: optional_f64(raw, KEY_MAXIMUM_BASAL_RATE)?
                .unwrap_or(DEFAULT_MAXIMUM_BASAL_RATE_PER_HOUR),
            battery_charge_remaining: optional_f64(raw, KEY_BATTERY)?,
            delivery_suspended: optional_bool(raw, KEY_SUSPENDED)?.unwrap_or(false),
            time_zone,
        })
    }

    /// Convert to the key/value form
    pub fn to_raw(&self) -> RawState {
        let mut raw = RawState::new();
        raw.insert(KEY_RESERVOIR.into(), Value::from(self.reservoir_units_remaining));
        raw.insert(
            KEY_TEMP_BASAL_ERROR.into(),
            Value::from(self.error_injection.temp_basal),
        );
        raw.insert(KEY_BOLUS_ERROR.into(), Value::from(self.error_injection.bolus));
        raw.insert(KEY_SUSPEND_ERROR.into(), Value::from(self.error_injection.suspend));
        raw.insert(KEY_RESUME_ERROR.into(), Value::from(self.error_injection.resume));
        raw.insert(KEY_MAXIMUM_BOLUS.into(), Value::from(self.maximum_bolus));
        raw.insert(
            KEY_MAXIMUM_BASAL_RATE.into(),
            Value::from(self.maximum_basal_rate_per_hour),
        );
        if let Some(battery) = self.battery_charge_remaining {
            raw.insert(KEY_BATTERY.into(), Value::from(battery));
        }
        raw.insert(KEY_SUSPENDED.into(), Value::from(self.delivery_suspended));
        raw.insert(
            KEY_TIME_ZONE.into(),
            Value::from(self.time_zone.local_minus_utc()),
        );
        raw
    }

    /// Load state from a file with shared locking
    ///
    /// Unlike a settings file, a missing or unreadable state file is an error:
    /// guessing a reservoir level would misstate remaining insulin.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        file.lock_shared()?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        let read = reader.read_to_string(&mut contents);
        file.unlock()?;
        read?;

        let raw: RawState = serde_json::from_str(&contents)?;
        let state = Self::from_raw(&raw)?;
        tracing::debug!("Loaded pump manager state from {:?}", path);
        Ok(state)
    }

    /// Save state to a file with exclusive locking
    ///
    /// Atomically writes state by:
    /// 1. Writing to a temp file
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "state path missing parent")
        })?)?;

        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(&self.to_raw())?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved pump manager state to {:?}", path);
        Ok(())
    }
}

fn utc_offset() -> FixedOffset {
    use chrono::{Offset, Utc};
    Utc.fix()
}

fn type_error(key: &str, expected: &str) -> Error {
    Error::State(format!("`{}` must be {}", key, expected))
}

fn as_f64(key: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| type_error(key, "a number"))
}

fn optional_f64(raw: &RawState, key: &str) -> Result<Option<f64>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => as_f64(key, v).map(Some),
    }
}

fn optional_bool(raw: &RawState, key: &str) -> Result<Option<bool>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| type_error(key, "a boolean")),
    }
}
