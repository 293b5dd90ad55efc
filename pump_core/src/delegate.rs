//! Consumer of reconciled pump data.
//!
//! The delegate is injected when the manager is built and lives as long as
//! the manager does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Error, PendingEvent, PumpManagerState, Result};

/// What the consumer made of a reservoir reading
#[derive(Clone, Debug, PartialEq)]
pub struct ReservoirReconciliation {
    pub new_value: f64,
    pub last_value: Option<f64>,
    /// False when the consumer detected a refill or a gap in readings
    pub are_stored_values_continuous: bool,
}

#[async_trait]
pub trait PumpManagerDelegate: Send + Sync {
    /// Record newly reconciled pump events. Events are only dropped from the
    /// pending log once this returns `Ok`.
    ///
    /// The same event may be delivered more than once (for example when the
    /// pending journal could not be rewritten after an earlier `Ok`), so
    /// implementations must deduplicate by [`PendingEvent::id`].
    async fn report_new_events(&self, events: &[PendingEvent]) -> Result<()>;

    async fn report_reservoir_reading(
        &self,
        units: f64,
        at: DateTime<Utc>,
    ) -> Result<ReservoirReconciliation>;

    /// Hint that fresh data is available and dosing may be recomputed
    fn report_recommended_loop_execution(&self);

    fn report_error(&self, error: &Error);

    /// Generic "device state changed" hook, called after observers
    fn state_did_change(&self, state: &PumpManagerState);
}
