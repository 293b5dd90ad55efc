//! Command executor: temp basal, bolus, cancel, suspend and resume.
//!
//! Every command follows the same shape: check preconditions and claim the
//! lane under the lock, release the lock for the device round trip, then
//! take the lock again to settle into the terminal state or revert.

use chrono::{DateTime, Duration, Utc};

use crate::manager::{PumpManager, Shared};
use crate::state::CommandLane;
use crate::status::{BasalDeliveryState, BolusState};
use crate::transport::DeviceCommand;
use crate::{
    is_supported_increment, DoseEntry, Error, PendingEvent, Result, BASAL_RATE_INCREMENT,
    BOLUS_INCREMENT, MAX_TEMP_BASAL_DURATION_SECONDS,
};

impl PumpManager {
    /// Set a temporary basal rate for `duration`
    ///
    /// Only valid while delivery is active. No intermediate state is
    /// entered, so a failure leaves everything as it was.
    pub async fn enact_temp_basal(&self, rate: f64, duration: Duration) -> Result<DoseEntry> {
        self.run(move |shared| async move { shared.enact_temp_basal(rate, duration).await })
            .await
    }

    /// Deliver a bolus of `units` starting at `start_date`
    ///
    /// `on_accepted` runs once the command has passed every precondition and
    /// before the device round trip completes, so callers can show progress
    /// early. The returned future resolves after the device acknowledges.
    pub async fn enact_bolus<F>(
        &self,
        units: f64,
        start_date: DateTime<Utc>,
        on_accepted: F,
    ) -> Result<DoseEntry>
    where
        F: FnOnce(&DoseEntry) + Send + 'static,
    {
        self.run(move |shared| async move {
            shared.enact_bolus(units, start_date, on_accepted).await
        })
        .await
    }

    /// Cancel the in-progress bolus by suspending delivery
    ///
    /// Returns `Ok(None)`: the amount delivered before the cancel took
    /// effect is not reported by the device.
    pub async fn cancel_bolus(&self) -> Result<Option<DoseEntry>> {
        self.run(|shared| async move { shared.cancel_bolus().await })
            .await
    }

    pub async fn suspend_delivery(&self) -> Result<()> {
        self.run(|shared| async move { shared.suspend_delivery().await })
            .await
    }

    pub async fn resume_delivery(&self) -> Result<()> {
        self.run(|shared| async move { shared.resume_delivery().await })
            .await
    }
}

fn validate_bolus(units: f64, maximum: f64) -> Result<()> {
    if !(units > 0.0) || units > maximum {
        return Err(Error::Validation(format!(
            "bolus of {} U outside (0, {}]",
            units, maximum
        )));
    }
    if !is_supported_increment(units, BOLUS_INCREMENT) {
        return Err(Error::Validation(format!(
            "bolus of {} U is not a multiple of {} U",
            units, BOLUS_INCREMENT
        )));
    }
    Ok(())
}

fn validate_temp_basal(rate: f64, duration: Duration, maximum: f64) -> Result<()> {
    if !(rate >= 0.0) || rate > maximum {
        return Err(Error::Validation(format!(
            "temp basal rate {} U/h outside [0, {}]",
            rate, maximum
        )));
    }
    if !is_supported_increment(rate, BASAL_RATE_INCREMENT) {
        return Err(Error::Validation(format!(
            "temp basal rate {} U/h is not a multiple of {} U/h",
            rate, BASAL_RATE_INCREMENT
        )));
    }
    let longest = Duration::seconds(MAX_TEMP_BASAL_DURATION_SECONDS);
    if duration < Duration::zero() || duration > longest {
        return Err(Error::Validation(format!(
            "temp basal duration {}s outside [0, {}]",
            duration.num_seconds(),
            MAX_TEMP_BASAL_DURATION_SECONDS
        )));
    }
    Ok(())
}

impl Shared {
    async fn round_trip(&self, command: DeviceCommand) -> Result<()> {
        match tokio::time::timeout(self.command_timeout, self.transport.send(&command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Communication(format!(
                "{:?} not acknowledged within {:?}",
                command, self.command_timeout
            ))),
        }
    }

    pub(crate) async fn enact_temp_basal(
        &self,
        rate: f64,
        duration: Duration,
    ) -> Result<DoseEntry> {
        let dose = {
            let mut core = self.core.lock().await;
            validate_temp_basal(rate, duration, core.maximum_basal_rate_per_hour)?;
            let dose = DoseEntry::temp_basal(rate, self.now(), duration)?;

            if !core.status.basal_delivery_state.accepts_dosing() {
                return Err(Error::DeviceState(format!(
                    "cannot set temp basal while delivery is {:?}",
                    core.status.basal_delivery_state
                )));
            }
            if core.temp_basal_in_flight {
                return Err(Error::DeviceState(
                    "a temp basal command is already in flight".into(),
                ));
            }
            if core.error_injection.should_error(CommandLane::TempBasal) {
                tracing::warn!(rate, "Temp basal failed: injected communication error");
                return Err(Error::Communication("temp basal not acknowledged".into()));
            }

            core.temp_basal_in_flight = true;
            dose
        };

        let sent = self
            .round_trip(DeviceCommand::SetTempBasal {
                rate,
                duration_seconds: duration.num_seconds(),
            })
            .await;

        let mut core = self.core.lock().await;
        core.temp_basal_in_flight = false;
        if let Err(e) = sent {
            tracing::warn!(rate, error = %e, "Temp basal failed");
            return Err(e);
        }

        self.record_delivered(&mut core, PendingEvent::from_dose(dose.clone(), self.now()));
        tracing::info!(
            rate,
            minutes = duration.num_minutes(),
            "Temp basal enacted"
        );
        Ok(dose)
    }

    pub(crate) async fn enact_bolus<F>(
        &self,
        units: f64,
        start_date: DateTime<Utc>,
        on_accepted: F,
    ) -> Result<DoseEntry>
    where
        F: FnOnce(&DoseEntry),
    {
        let dose = {
            let mut core = self.core.lock().await;
            validate_bolus(units, core.maximum_bolus)?;
            let dose = DoseEntry::bolus(units, start_date, self.delivery_units_per_minute)?;
            self.complete_finished_bolus(&mut core, self.now());

            if !core.status.basal_delivery_state.accepts_dosing() {
                return Err(Error::DeviceState(format!(
                    "cannot bolus while delivery is {:?}",
                    core.status.basal_delivery_state
                )));
            }
            if core.bolus_in_flight || core.status.bolus_state != BolusState::None {
                return Err(Error::DeviceState(format!(
                    "bolus lane busy: {:?}",
                    core.status.bolus_state
                )));
            }
            if core.error_injection.should_error(CommandLane::Bolus) {
                tracing::warn!(units, "Bolus failed: injected communication error");
                return Err(Error::Communication("bolus not acknowledged".into()));
            }

            core.bolus_in_flight = true;
            dose
        };

        on_accepted(&dose);

        let sent = self.round_trip(DeviceCommand::Bolus { units }).await;

        let mut core = self.core.lock().await;
        core.bolus_in_flight = false;
        if let Err(e) = sent {
            tracing::warn!(units, error = %e, "Bolus failed");
            return Err(e);
        }

        let in_progress = dose.clone();
        self.update_status(&mut core, move |s| {
            s.bolus_state = BolusState::InProgress(in_progress)
        });
        self.record_delivered(&mut core, PendingEvent::from_dose(dose.clone(), self.now()));
        tracing::info!(units, end = %dose.end_date(), "Bolus in progress");
        Ok(dose)
    }

    pub(crate) async fn cancel_bolus(&self) -> Result<Option<DoseEntry>> {
        let prior = {
            let mut core = self.core.lock().await;
            self.complete_finished_bolus(&mut core, self.now());

            let prior = match &core.status.bolus_state {
                BolusState::InProgress(_) => core.status.bolus_state.clone(),
                BolusState::None | BolusState::Canceling => {
                    return Err(Error::DeviceState(format!(
                        "no bolus to cancel: {:?}",
                        core.status.bolus_state
                    )))
                }
            };
            self.update_status(&mut core, |s| s.bolus_state = BolusState::Canceling);
            prior
        };

        tracing::info!("Canceling bolus");
        match self.suspend_delivery().await {
            Ok(()) => {
                let mut core = self.core.lock().await;
                self.update_status(&mut core, |s| s.bolus_state = BolusState::None);
                tracing::info!("Bolus canceled");
                Ok(None)
            }
            Err(e) => {
                let mut core = self.core.lock().await;
                self.update_status(&mut core, move |s| s.bolus_state = prior);
                tracing::warn!(error = %e, "Bolus cancel failed, bolus still in progress");
                Err(e)
            }
        }
    }

    pub(crate) async fn suspend_delivery(&self) -> Result<()> {
        self.change_delivery(DeliveryChange::Suspend).await
    }

    pub(crate) async fn resume_delivery(&self) -> Result<()> {
        self.change_delivery(DeliveryChange::Resume).await
    }

    /// Shared suspend/resume path: intermediate state, round trip, settle
    async fn change_delivery(&self, change: DeliveryChange) -> Result<()> {
        let prior = {
            let mut core = self.core.lock().await;
            let prior = core.status.basal_delivery_state;
            if prior.is_transitioning() {
                return Err(Error::DeviceState(format!(
                    "cannot {} while delivery is {:?}",
                    change.verb(),
                    prior
                )));
            }
            self.update_status(&mut core, |s| {
                s.basal_delivery_state = change.intermediate()
            });
            prior
        };

        let mut sent = self.round_trip(change.command()).await;

        let mut core = self.core.lock().await;
        if sent.is_ok() && core.error_injection.should_error(change.lane()) {
            sent = Err(Error::Communication(format!(
                "{} not acknowledged",
                change.verb()
            )));
        }
        if let Err(e) = sent {
            self.update_status(&mut core, |s| s.basal_delivery_state = prior);
            tracing::warn!(error = %e, reverted_to = ?prior, "Failed to {}", change.verb());
            return Err(e);
        }

        let now = self.now();
        self.record_delivered(&mut core, PendingEvent::from_dose(change.dose(now), now));
        self.update_status(&mut core, |s| s.basal_delivery_state = change.terminal());
        tracing::info!("Delivery {}", change.past_tense());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum DeliveryChange {
    Suspend,
    Resume,
}

impl DeliveryChange {
    fn intermediate(self) -> BasalDeliveryState {
        match self {
            DeliveryChange::Suspend => BasalDeliveryState::Suspending,
            DeliveryChange::Resume => BasalDeliveryState::Resuming,
        }
    }

    fn terminal(self) -> BasalDeliveryState {
        match self {
            DeliveryChange::Suspend => BasalDeliveryState::Suspended,
            DeliveryChange::Resume => BasalDeliveryState::Active,
        }
    }

    fn lane(self) -> CommandLane {
        match self {
            DeliveryChange::Suspend => CommandLane::Suspend,
            DeliveryChange::Resume => CommandLane::Resume,
        }
    }

    fn command(self) -> DeviceCommand {
        match self {
            DeliveryChange::Suspend => DeviceCommand::Suspend,
            DeliveryChange::Resume => DeviceCommand::Resume,
        }
    }

    fn dose(self, at: DateTime<Utc>) -> DoseEntry {
        match self {
            DeliveryChange::Suspend => DoseEntry::suspend(at),
            DeliveryChange::Resume => DoseEntry::resume(at),
        }
    }

    fn verb(self) -> &'static str {
        match self {
            DeliveryChange::Suspend => "suspend",
            DeliveryChange::Resume => "resume",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            DeliveryChange::Suspend => "suspended",
            DeliveryChange::Resume => "resumed",
        }
    }
}
