//! Core domain types for the pump manager.
//!
//! This module defines the values that flow between the command executor,
//! the pending event log and the delegate:
//! - Dose records (bolus, basal, temp basal, suspend, resume)
//! - Pending pump events awaiting reconciliation
//! - Delivery constants and increment validation

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ============================================================================
// Delivery Constants
// ============================================================================

/// Smallest bolus volume step the pump accepts, in units
pub const BOLUS_INCREMENT: f64 = 0.05;

/// Smallest basal rate step the pump accepts, in units per hour
pub const BASAL_RATE_INCREMENT: f64 = 0.05;

/// Upper bound for any configured maximum bolus
pub const MAX_SUPPORTED_BOLUS: f64 = 30.0;

/// Upper bound for any configured maximum basal rate
pub const MAX_SUPPORTED_BASAL_RATE: f64 = 30.0;

pub const DEFAULT_MAXIMUM_BOLUS: f64 = 25.0;
pub const DEFAULT_MAXIMUM_BASAL_RATE_PER_HOUR: f64 = 5.0;

/// Longest temp basal the pump will run, in seconds
pub const MAX_TEMP_BASAL_DURATION_SECONDS: i64 = 24 * 60 * 60;

const INCREMENT_TOLERANCE: f64 = 1e-6;

/// Check that `value` is a whole multiple of `increment`
pub fn is_supported_increment(value: f64, increment: f64) -> bool {
    let steps = value / increment;
    (steps - steps.round()).abs() < INCREMENT_TOLERANCE
}

// ============================================================================
// Dose Records
// ============================================================================

/// Kind of delivery action a dose describes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseType {
    Bolus,
    Basal,
    TempBasal,
    Suspend,
    Resume,
}

/// Unit a dose quantity is expressed in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseUnit {
    Units,
    UnitsPerHour,
}

/// Immutable description of one delivery action
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseEntry {
    dose_type: DoseType,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    value: f64,
    unit: DoseUnit,
}

impl DoseEntry {
    /// A bolus of `units`, delivered at `units_per_minute` from `start_date`
    ///
    /// Fails when the delivery rate is not positive or the end date is not
    /// representable.
    pub fn bolus(units: f64, start_date: DateTime<Utc>, units_per_minute: f64) -> Result<Self> {
        if !(units_per_minute > 0.0) || !units_per_minute.is_finite() {
            return Err(Error::Validation(format!(
                "bolus delivery rate {} U/min must be positive",
                units_per_minute
            )));
        }
        let millis = (units / units_per_minute * 60_000.0).round();
        let end_date = Some(millis)
            .filter(|m| m.is_finite())
            .and_then(|m| Duration::try_milliseconds(m as i64))
            .and_then(|length| start_date.checked_add_signed(length))
            .ok_or_else(|| {
                Error::Validation(format!("bolus of {} U has no representable end date", units))
            })?;
        Ok(Self {
            dose_type: DoseType::Bolus,
            start_date,
            end_date,
            value: units,
            unit: DoseUnit::Units,
        })
    }

    pub fn temp_basal(rate: f64, start_date: DateTime<Utc>, duration: Duration) -> Result<Self> {
        let end_date = start_date.checked_add_signed(duration).ok_or_else(|| {
            Error::Validation(format!(
                "temp basal of {}s has no representable end date",
                duration.num_seconds()
            ))
        })?;
        Ok(Self {
            dose_type: DoseType::TempBasal,
            start_date,
            end_date,
            value: rate,
            unit: DoseUnit::UnitsPerHour,
        })
    }

    pub fn basal(rate: f64, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            dose_type: DoseType::Basal,
            start_date,
            end_date,
            value: rate,
            unit: DoseUnit::UnitsPerHour,
        }
    }

    pub fn suspend(at: DateTime<Utc>) -> Self {
        Self::marker(DoseType::Suspend, at)
    }

    pub fn resume(at: DateTime<Utc>) -> Self {
        Self::marker(DoseType::Resume, at)
    }

    fn marker(dose_type: DoseType, at: DateTime<Utc>) -> Self {
        Self {
            dose_type,
            start_date: at,
            end_date: at,
            value: 0.0,
            unit: DoseUnit::Units,
        }
    }

    pub fn dose_type(&self) -> DoseType {
        self.dose_type
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    pub fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> DoseUnit {
        self.unit
    }

    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }

    /// Absolute insulin units this dose delivers over its whole duration
    ///
    /// Rates are integrated over the dose duration. Suspend and resume
    /// markers deliver nothing.
    pub fn delivered_units(&self) -> f64 {
        match self.dose_type {
            DoseType::Suspend | DoseType::Resume => 0.0,
            DoseType::Bolus | DoseType::Basal | DoseType::TempBasal => match self.unit {
                DoseUnit::Units => self.value,
                DoseUnit::UnitsPerHour => {
                    let hours = self.duration().num_milliseconds() as f64 / 3_600_000.0;
                    self.value * hours.max(0.0)
                }
            },
        }
    }
}

// ============================================================================
// Pending Events
// ============================================================================

/// Kind of pump event recorded in the pending log
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PumpEventKind {
    Bolus,
    TempBasal,
    Basal,
    Suspend,
    Resume,
}

/// A device action not yet reconciled with the delegate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingEvent {
    pub id: Uuid,
    pub kind: PumpEventKind,
    pub created_at: DateTime<Utc>,
    pub dose: Option<DoseEntry>,
    /// Whether the dose may still change (e.g. a bolus that can be cancelled)
    pub is_mutable: bool,
}

impl PendingEvent {
    /// Wrap a dose in a pending event, deriving kind and mutability from it
    pub fn from_dose(dose: DoseEntry, created_at: DateTime<Utc>) -> Self {
        let (kind, is_mutable) = match dose.dose_type() {
            DoseType::Bolus => (PumpEventKind::Bolus, true),
            DoseType::TempBasal => (PumpEventKind::TempBasal, true),
            DoseType::Basal => (PumpEventKind::Basal, false),
            DoseType::Suspend => (PumpEventKind::Suspend, false),
            DoseType::Resume => (PumpEventKind::Resume, false),
        };

        Self {
            id: Uuid::new_v4(),
            kind,
            created_at,
            dose: Some(dose),
            is_mutable,
        }
    }

    /// Units consumed from the reservoir by this event
    pub fn delivered_units(&self) -> f64 {
        self.dose.as_ref().map_or(0.0, DoseEntry::delivered_units)
    }
}
