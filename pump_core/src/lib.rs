#![forbid(unsafe_code)]

//! Command coordination and status tracking for an insulin pump.
//!
//! This crate provides:
//! - Dose records and pending pump events
//! - The pump status model (basal delivery, bolus, battery, clock)
//! - The command executor (temp basal, bolus, cancel, suspend, resume)
//! - Observer registry for status and state changes
//! - Reconciliation with a delegate and reservoir accounting
//! - Persistence (state file, pending event WAL) and configuration

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod clock;
pub mod status;
pub mod observer;
pub mod reservoir;
pub mod wal;
pub mod pending;
pub mod state;
pub mod transport;
pub mod delegate;
pub mod manager;
pub mod executor;
pub mod reconcile;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::PumpConfig;
pub use clock::{Clock, ManualClock, SystemClock};
pub use status::{BasalDeliveryState, BolusState, PumpStatus};
pub use observer::{ObserverId, StateObserver, StatusObserver};
pub use reservoir::{ReservoirAccountant, DEFAULT_RESERVOIR_CAPACITY};
pub use pending::PendingEventLog;
pub use state::{CommandLane, ErrorInjection, PumpManagerState, RawState};
pub use transport::{DeviceCommand, DeviceTransport, SimulatedTransport};
pub use delegate::{PumpManagerDelegate, ReservoirReconciliation};
pub use manager::{PumpManager, PumpManagerBuilder};
pub use reconcile::ReconciliationSummary;
