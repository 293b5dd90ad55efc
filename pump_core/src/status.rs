//! Composite pump status: basal delivery, bolus, battery and clock.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::DoseEntry;

/// Basal delivery lane state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BasalDeliveryState {
    Active,
    Suspending,
    Suspended,
    Resuming,
}

impl BasalDeliveryState {
    /// A suspend or resume round trip is in flight
    pub fn is_transitioning(self) -> bool {
        match self {
            BasalDeliveryState::Suspending | BasalDeliveryState::Resuming => true,
            BasalDeliveryState::Active | BasalDeliveryState::Suspended => false,
        }
    }

    /// Only active delivery accepts new temp basal or bolus commands
    pub fn accepts_dosing(self) -> bool {
        match self {
            BasalDeliveryState::Active => true,
            BasalDeliveryState::Suspending
            | BasalDeliveryState::Suspended
            | BasalDeliveryState::Resuming => false,
        }
    }
}

/// Bolus lane state
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "dose", rename_all = "snake_case")]
pub enum BolusState {
    None,
    InProgress(DoseEntry),
    Canceling,
}

impl BolusState {
    pub fn in_progress_dose(&self) -> Option<&DoseEntry> {
        match self {
            BolusState::InProgress(dose) => Some(dose),
            BolusState::None | BolusState::Canceling => None,
        }
    }
}

/// Current composite device status
#[derive(Clone, Debug, PartialEq)]
pub struct PumpStatus {
    pub basal_delivery_state: BasalDeliveryState,
    pub bolus_state: BolusState,
    /// Fraction of battery remaining in 0.0..=1.0, if the device reports it
    pub battery_charge_remaining: Option<f64>,
    pub time_zone: FixedOffset,
}

impl Default for PumpStatus {
    fn default() -> Self {
        Self {
            basal_delivery_state: BasalDeliveryState::Active,
            bolus_state: BolusState::None,
            battery_charge_remaining: None,
            time_zone: Utc.fix(),
        }
    }
}
