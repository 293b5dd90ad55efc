//! Shared fixtures for pump manager integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pump_core::config::DeviceConfig;
use pump_core::wal::EventJournal;
use pump_core::*;
use tokio::sync::Notify;

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn fast_device() -> DeviceConfig {
    DeviceConfig {
        latency_ms: 1,
        command_timeout_ms: 1_000,
        delivery_units_per_minute: 1.5,
        reservoir_capacity: 200.0,
    }
}

/// Ordered trace of notifications across observers and the delegate
pub type Trace = Arc<Mutex<Vec<String>>>;

/// Holds `report_new_events` open until the test releases it
#[derive(Clone, Default)]
pub struct EventGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct RecordingDelegate {
    pub reported: Mutex<Vec<Vec<PendingEvent>>>,
    pub readings: Mutex<Vec<f64>>,
    pub errors: Mutex<Vec<String>>,
    pub loop_recommendations: AtomicUsize,
    pub state_changes: AtomicUsize,
    pub fail_events: AtomicBool,
    pub trace: Option<Trace>,
    pub gate: Option<EventGate>,
}

impl RecordingDelegate {
    pub fn with_trace(trace: Trace) -> Self {
        Self {
            trace: Some(trace),
            ..Self::default()
        }
    }

    pub fn with_gate(gate: EventGate) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PumpManagerDelegate for RecordingDelegate {
    async fn report_new_events(&self, events: &[PendingEvent]) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Error::Delegate("store unavailable".into()));
        }
        self.reported.lock().unwrap().push(events.to_vec());
        Ok(())
    }

    async fn report_reservoir_reading(
        &self,
        units: f64,
        _at: DateTime<Utc>,
    ) -> Result<ReservoirReconciliation> {
        let mut readings = self.readings.lock().unwrap();
        let last_value = readings.last().copied();
        readings.push(units);
        Ok(ReservoirReconciliation {
            new_value: units,
            last_value,
            are_stored_values_continuous: true,
        })
    }

    fn report_recommended_loop_execution(&self) {
        self.loop_recommendations.fetch_add(1, Ordering::SeqCst);
    }

    fn report_error(&self, error: &Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn state_did_change(&self, _state: &PumpManagerState) {
        self.state_changes.fetch_add(1, Ordering::SeqCst);
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().push("delegate".into());
        }
    }
}

/// Records every status it sees
#[derive(Default)]
pub struct StatusRecorder {
    pub seen: Mutex<Vec<PumpStatus>>,
    pub trace: Option<Trace>,
}

impl StatusRecorder {
    pub fn with_trace(trace: Trace) -> Self {
        Self {
            seen: Mutex::default(),
            trace: Some(trace),
        }
    }

    pub fn basal_states(&self) -> Vec<BasalDeliveryState> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.basal_delivery_state)
            .collect()
    }

    pub fn bolus_states(&self) -> Vec<BolusState> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.bolus_state.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl StatusObserver for StatusRecorder {
    fn pump_status_did_change(&self, status: &PumpStatus) {
        self.seen.lock().unwrap().push(status.clone());
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().push("status".into());
        }
    }
}

#[derive(Default)]
pub struct StateRecorder {
    pub seen: Mutex<Vec<PumpManagerState>>,
    pub trace: Option<Trace>,
}

impl StateRecorder {
    pub fn with_trace(trace: Trace) -> Self {
        Self {
            seen: Mutex::default(),
            trace: Some(trace),
        }
    }
}

impl StateObserver for StateRecorder {
    fn pump_state_did_change(&self, state: &PumpManagerState) {
        self.seen.lock().unwrap().push(state.clone());
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().push("state".into());
        }
    }
}

/// Transport that never answers in time
pub struct StalledTransport;

#[async_trait]
impl DeviceTransport for StalledTransport {
    async fn send(&self, _command: &DeviceCommand) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Transport that panics on every command
pub struct PanickingTransport;

#[async_trait]
impl DeviceTransport for PanickingTransport {
    async fn send(&self, command: &DeviceCommand) -> Result<()> {
        panic!("transport fault on {:?}", command);
    }
}

/// Journal whose writes can be made to fail on demand
#[derive(Clone, Default)]
pub struct FlakyJournal {
    pub fail_append: Arc<AtomicBool>,
    pub fail_rewrite: Arc<AtomicBool>,
}

impl FlakyJournal {
    fn outcome(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "journal storage unavailable",
            )))
        } else {
            Ok(())
        }
    }
}

impl EventJournal for FlakyJournal {
    fn append(&mut self, _event: &PendingEvent) -> Result<()> {
        Self::outcome(&self.fail_append)
    }

    fn rewrite(&mut self, _events: &[PendingEvent]) -> Result<()> {
        Self::outcome(&self.fail_rewrite)
    }
}

pub struct Harness {
    pub manager: PumpManager,
    pub delegate: Arc<RecordingDelegate>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(state: PumpManagerState) -> Harness {
    harness_with(state, Arc::new(RecordingDelegate::default()))
}

pub fn harness_with(state: PumpManagerState, delegate: Arc<RecordingDelegate>) -> Harness {
    harness_with_log(state, delegate, PendingEventLog::in_memory())
}

pub fn harness_with_log(
    state: PumpManagerState,
    delegate: Arc<RecordingDelegate>,
    pending: PendingEventLog,
) -> Harness {
    pump_core::logging::init_test();
    let device = fast_device();
    let clock = Arc::new(ManualClock::new(start_time()));
    let manager = PumpManager::builder(
        state,
        &device,
        Arc::new(SimulatedTransport::new(device.latency())),
        delegate.clone(),
    )
    .clock(clock.clone())
    .pending_log(pending)
    .build()
    .unwrap();

    Harness {
        manager,
        delegate,
        clock,
    }
}
