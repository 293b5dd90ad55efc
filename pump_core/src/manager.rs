//! Pump manager: owner of status, reservoir and pending events.
//!
//! All mutation happens behind one async mutex that is never held across a
//! device round trip. [`PumpStatus`] is only ever changed through
//! `Shared::update_status`, which fans out to status observers, state
//! observers and the delegate in that order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::{DeviceConfig, PumpConfig};
use crate::delegate::PumpManagerDelegate;
use crate::observer::{ObserverId, ObserverRegistry, StateObserver, StatusObserver};
use crate::pending::PendingEventLog;
use crate::reservoir::ReservoirAccountant;
use crate::state::{CommandLane, ErrorInjection, PumpManagerState};
use crate::status::{BasalDeliveryState, BolusState, PumpStatus};
use crate::transport::DeviceTransport;
use crate::{
    is_supported_increment, Error, PendingEvent, Result, BASAL_RATE_INCREMENT, BOLUS_INCREMENT,
    MAX_SUPPORTED_BASAL_RATE, MAX_SUPPORTED_BOLUS,
};

/// Handle to a pump manager. Cheap to clone; clones share one pump.
#[derive(Clone)]
pub struct PumpManager {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) core: Mutex<Core>,
    /// Serializes reconciliations so one batch is never reported twice
    pub(crate) reconcile_lock: Mutex<()>,
    pub(crate) observers: ObserverRegistry,
    pub(crate) transport: Arc<dyn DeviceTransport>,
    pub(crate) delegate: Arc<dyn PumpManagerDelegate>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) delivery_units_per_minute: f64,
    pub(crate) command_timeout: Duration,
}

/// Everything guarded by the manager lock
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) status: PumpStatus,
    pub(crate) reservoir: ReservoirAccountant,
    pub(crate) pending: PendingEventLog,
    pub(crate) error_injection: ErrorInjection,
    pub(crate) maximum_bolus: f64,
    pub(crate) maximum_basal_rate_per_hour: f64,
    /// Bolus command between acceptance and device acknowledgement
    pub(crate) bolus_in_flight: bool,
    pub(crate) temp_basal_in_flight: bool,
}

impl Core {
    pub(crate) fn snapshot(&self) -> PumpManagerState {
        PumpManagerState {
            reservoir_units_remaining: self.reservoir.remaining(),
            error_injection: self.error_injection,
            maximum_bolus: self.maximum_bolus,
            maximum_basal_rate_per_hour: self.maximum_basal_rate_per_hour,
            battery_charge_remaining: self.status.battery_charge_remaining,
            delivery_suspended: matches!(
                self.status.basal_delivery_state,
                BasalDeliveryState::Suspended | BasalDeliveryState::Resuming
            ),
            time_zone: self.status.time_zone,
        }
    }
}

/// Assembles a [`PumpManager`]; obtained from [`PumpManager::builder`]
pub struct PumpManagerBuilder {
    state: PumpManagerState,
    device: DeviceConfig,
    transport: Arc<dyn DeviceTransport>,
    delegate: Arc<dyn PumpManagerDelegate>,
    clock: Arc<dyn Clock>,
    pending: PendingEventLog,
}

impl PumpManagerBuilder {
    /// Time source for dose dates and bolus completion (default: wall clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pending event log to start from (default: empty, in memory)
    pub fn pending_log(mut self, pending: PendingEventLog) -> Self {
        self.pending = pending;
        self
    }

    /// Validate the device settings and build the manager
    pub fn build(self) -> Result<PumpManager> {
        self.device.validate()?;
        let state = self.state;

        let status = PumpStatus {
            basal_delivery_state: if state.delivery_suspended {
                BasalDeliveryState::Suspended
            } else {
                BasalDeliveryState::Active
            },
            bolus_state: BolusState::None,
            battery_charge_remaining: state.battery_charge_remaining,
            time_zone: state.time_zone,
        };

        let core = Core {
            status,
            reservoir: ReservoirAccountant::new(
                self.device.reservoir_capacity,
                state.reservoir_units_remaining,
            ),
            pending: self.pending,
            error_injection: state.error_injection,
            maximum_bolus: state.maximum_bolus,
            maximum_basal_rate_per_hour: state.maximum_basal_rate_per_hour,
            bolus_in_flight: false,
            temp_basal_in_flight: false,
        };

        tracing::info!(
            reservoir = core.reservoir.remaining(),
            suspended = state.delivery_suspended,
            pending = core.pending.len(),
            "Pump manager created"
        );

        Ok(PumpManager {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                reconcile_lock: Mutex::new(()),
                observers: ObserverRegistry::new(),
                transport: self.transport,
                delegate: self.delegate,
                clock: self.clock,
                delivery_units_per_minute: self.device.delivery_units_per_minute,
                command_timeout: self.device.command_timeout(),
            }),
        })
    }
}

impl PumpManager {
    /// Start assembling a manager from restored or fresh state
    pub fn builder(
        state: PumpManagerState,
        device: &DeviceConfig,
        transport: Arc<dyn DeviceTransport>,
        delegate: Arc<dyn PumpManagerDelegate>,
    ) -> PumpManagerBuilder {
        PumpManagerBuilder {
            state,
            device: device.clone(),
            transport,
            delegate,
            clock: Arc::new(SystemClock),
            pending: PendingEventLog::in_memory(),
        }
    }

    /// Build a manager with the wall clock and an in-memory pending log
    pub fn new(
        state: PumpManagerState,
        device: &DeviceConfig,
        transport: Arc<dyn DeviceTransport>,
        delegate: Arc<dyn PumpManagerDelegate>,
    ) -> Result<Self> {
        Self::builder(state, device, transport, delegate).build()
    }

    /// Restore state and unreconciled events from the configured data directory
    pub fn restore(
        config: &PumpConfig,
        transport: Arc<dyn DeviceTransport>,
        delegate: Arc<dyn PumpManagerDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let state = PumpManagerState::load(&config.data.state_path())?;
        let pending = PendingEventLog::restore(&config.data.pending_events_path())?;
        Self::builder(state, &config.device, transport, delegate)
            .pending_log(pending)
            .build()
    }

    pub async fn status(&self) -> PumpStatus {
        self.shared.core.lock().await.status.clone()
    }

    pub async fn state(&self) -> PumpManagerState {
        self.shared.core.lock().await.snapshot()
    }

    /// Read-only copy of events awaiting reconciliation
    pub async fn pending_events(&self) -> Vec<PendingEvent> {
        self.shared.core.lock().await.pending.events().to_vec()
    }

    pub async fn reservoir_units_remaining(&self) -> f64 {
        self.shared.core.lock().await.reservoir.remaining()
    }

    /// Save the current state snapshot
    pub async fn persist_state(&self, path: &std::path::Path) -> Result<()> {
        let state = self.state().await;
        state.save(path)
    }

    pub fn add_status_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: StatusObserver + 'static,
    {
        self.shared.observers.add_status_observer(observer)
    }

    pub fn add_state_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: StateObserver + 'static,
    {
        self.shared.observers.add_state_observer(observer)
    }

    /// Idempotent; returns whether the subscription existed
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove(id)
    }

    pub async fn set_error_injection(&self, lane: CommandLane, should_error: bool) {
        let mut core = self.shared.core.lock().await;
        core.error_injection.set(lane, should_error);
        tracing::info!(?lane, should_error, "Error injection updated");
        self.shared.publish_state(&core);
    }

    pub async fn set_battery_charge_remaining(&self, fraction: Option<f64>) -> Result<()> {
        if let Some(value) = fraction {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!(
                    "battery charge {} outside 0.0..=1.0",
                    value
                )));
            }
        }
        let mut core = self.shared.core.lock().await;
        self.shared
            .update_status(&mut core, |s| s.battery_charge_remaining = fraction);
        Ok(())
    }

    pub async fn set_time_zone(&self, time_zone: FixedOffset) {
        let mut core = self.shared.core.lock().await;
        self.shared.update_status(&mut core, |s| s.time_zone = time_zone);
    }

    pub async fn set_maximum_bolus(&self, units: f64) -> Result<()> {
        if !(units > 0.0 && units <= MAX_SUPPORTED_BOLUS)
            || !is_supported_increment(units, BOLUS_INCREMENT)
        {
            return Err(Error::Validation(format!(
                "maximum bolus {} must be in (0, {}] in {} U steps",
                units, MAX_SUPPORTED_BOLUS, BOLUS_INCREMENT
            )));
        }
        let mut core = self.shared.core.lock().await;
        core.maximum_bolus = units;
        self.shared.publish_state(&core);
        Ok(())
    }

    pub async fn set_maximum_basal_rate(&self, units_per_hour: f64) -> Result<()> {
        if !(units_per_hour > 0.0 && units_per_hour <= MAX_SUPPORTED_BASAL_RATE)
            || !is_supported_increment(units_per_hour, BASAL_RATE_INCREMENT)
        {
            return Err(Error::Validation(format!(
                "maximum basal rate {} must be in (0, {}] in {} U/h steps",
                units_per_hour, MAX_SUPPORTED_BASAL_RATE, BASAL_RATE_INCREMENT
            )));
        }
        let mut core = self.shared.core.lock().await;
        core.maximum_basal_rate_per_hour = units_per_hour;
        self.shared.publish_state(&core);
        Ok(())
    }

    /// Run a command on its own task so it resolves even if the caller stops
    /// waiting; a dropped caller must not strand a lane mid-transition.
    ///
    /// A panic inside the command is resumed on the caller rather than
    /// reported as a device error.
    pub(crate) async fn run<F, Fut, T>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Arc<Shared>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::spawn(command(Arc::clone(&self.shared))).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::State(format!("command task did not complete: {}", e))),
        }
    }
}

impl Shared {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The only place [`PumpStatus`] is assigned
    pub(crate) fn update_status(&self, core: &mut Core, change: impl FnOnce(&mut PumpStatus)) {
        change(&mut core.status);
        tracing::debug!(status = ?core.status, "Pump status changed");
        self.observers.notify_status(&core.status);
        self.publish_state(core);
    }

    /// Notify state observers and the delegate of a manager state change
    pub(crate) fn publish_state(&self, core: &Core) {
        let snapshot = core.snapshot();
        self.observers.notify_state(&snapshot);
        self.delegate.state_did_change(&snapshot);
    }

    /// Record an event for an action the device acknowledged
    ///
    /// A journal failure is logged and reported to the delegate but never
    /// undoes the action: the event stays pending in memory.
    pub(crate) fn record_delivered(&self, core: &mut Core, event: PendingEvent) {
        let kind = event.kind;
        if let Err(e) = core.pending.append(event) {
            tracing::error!(?kind, error = %e, "Pump event pending but not journaled");
            self.delegate.report_error(&e);
        }
    }

    /// Settle a bolus whose computed delivery has finished
    pub(crate) fn complete_finished_bolus(&self, core: &mut Core, now: DateTime<Utc>) {
        let finished = core
            .status
            .bolus_state
            .in_progress_dose()
            .is_some_and(|dose| dose.end_date() <= now);
        if finished {
            tracing::info!("Bolus delivery finished");
            self.update_status(core, |s| s.bolus_state = BolusState::None);
        }
    }
}
