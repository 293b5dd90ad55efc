//! Reconciliation of pending pump events with the delegate.

use std::collections::HashSet;

use uuid::Uuid;

use crate::manager::{PumpManager, Shared};
use crate::Result;

/// Outcome of one reconciliation pass
#[derive(Clone, Debug, PartialEq)]
pub struct ReconciliationSummary {
    pub events_reconciled: usize,
    pub units_delivered: f64,
    pub reservoir_units_remaining: f64,
}

impl PumpManager {
    /// Report pending events to the delegate and fold them into the reservoir
    ///
    /// Events leave the pending log only after the delegate acknowledges
    /// them, and only the acknowledged batch is removed. On failure the log
    /// and reservoir are untouched, so calling again retries the same events.
    pub async fn assert_current_data(&self) -> Result<ReconciliationSummary> {
        self.run(|shared| async move { shared.assert_current_data().await })
            .await
    }
}

impl Shared {
    pub(crate) async fn assert_current_data(&self) -> Result<ReconciliationSummary> {
        let _reconciling = self.reconcile_lock.lock().await;

        let batch = {
            let mut core = self.core.lock().await;
            self.complete_finished_bolus(&mut core, self.now());
            core.pending.events().to_vec()
        };

        tracing::debug!("Reporting {} pending events", batch.len());
        if let Err(e) = self.delegate.report_new_events(&batch).await {
            tracing::warn!(error = %e, events = batch.len(), "Delegate did not record pump events");
            self.delegate.report_error(&e);
            return Err(e);
        }

        let acknowledged: HashSet<Uuid> = batch.iter().map(|e| e.id).collect();
        let now = self.now();
        let summary = {
            let mut core = self.core.lock().await;
            let units_delivered: f64 = core
                .pending
                .events()
                .iter()
                .filter(|e| acknowledged.contains(&e.id))
                .map(|e| e.delivered_units())
                .sum();

            let events_reconciled = match core.pending.remove_reconciled(&acknowledged) {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to clear reconciled events");
                    self.delegate.report_error(&e);
                    return Err(e);
                }
            };
            let remaining = core.reservoir.apply_usage(units_delivered, now);
            self.publish_state(&core);

            ReconciliationSummary {
                events_reconciled,
                units_delivered,
                reservoir_units_remaining: remaining,
            }
        };

        tracing::info!(
            events = summary.events_reconciled,
            units = summary.units_delivered,
            reservoir = summary.reservoir_units_remaining,
            "Reconciled pump events"
        );

        match self
            .delegate
            .report_reservoir_reading(summary.reservoir_units_remaining, now)
            .await
        {
            Ok(reading) => {
                if !reading.are_stored_values_continuous {
                    tracing::info!(
                        last = ?reading.last_value,
                        new = reading.new_value,
                        "Delegate reports discontinuous reservoir history"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Delegate rejected reservoir reading");
                self.delegate.report_error(&e);
            }
        }

        self.delegate.report_recommended_loop_execution();
        Ok(summary)
    }
}
