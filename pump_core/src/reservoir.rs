//! Reservoir accounting from reconciled dose usage.

use chrono::{DateTime, Utc};

/// Default cartridge capacity in units
pub const DEFAULT_RESERVOIR_CAPACITY: f64 = 200.0;

/// Tracks remaining reservoir units, bounded to `[0, capacity]`
///
/// Only reconciled usage is subtracted; in-flight or reverted commands never
/// reach the accountant.
#[derive(Clone, Debug, PartialEq)]
pub struct ReservoirAccountant {
    capacity: f64,
    remaining: f64,
    last_updated: Option<DateTime<Utc>>,
}

impl ReservoirAccountant {
    /// Create an accountant, clamping `remaining` into range
    pub fn new(capacity: f64, remaining: f64) -> Self {
        let capacity = capacity.max(0.0);
        let clamped = remaining.clamp(0.0, capacity);
        if clamped != remaining {
            tracing::warn!(
                "Reservoir value {:.2} outside [0, {:.2}], clamped to {:.2}",
                remaining,
                capacity,
                clamped
            );
        }
        Self {
            capacity,
            remaining: clamped,
            last_updated: None,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Subtract reconciled usage and return the new remaining quantity
    pub fn apply_usage(&mut self, units: f64, at: DateTime<Utc>) -> f64 {
        let units = units.max(0.0);
        let next = (self.remaining - units).max(0.0);
        if self.remaining - units < 0.0 {
            tracing::warn!(
                "Reconciled usage {:.2} exceeds remaining {:.2}, reservoir floored at 0",
                units,
                self.remaining
            );
        }
        tracing::debug!(
            "Reservoir {:.2} -> {:.2} after {:.2} units of reconciled usage",
            self.remaining,
            next,
            units
        );
        self.remaining = next;
        self.last_updated = Some(at);
        self.remaining
    }
}
