//! Device transport boundary.
//!
//! The radio link to the physical pump lives outside this crate. The
//! executor only needs "send a command, await the acknowledgement".

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Command sent to the device
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetTempBasal { rate: f64, duration_seconds: i64 },
    Bolus { units: f64 },
    Suspend,
    Resume,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Send a command and wait for the device to acknowledge it
    async fn send(&self, command: &DeviceCommand) -> Result<()>;
}

/// Transport that acknowledges every command after a fixed latency
#[derive(Clone, Debug)]
pub struct SimulatedTransport {
    latency: Duration,
}

impl SimulatedTransport {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    async fn send(&self, command: &DeviceCommand) -> Result<()> {
        tracing::debug!(
            ?command,
            latency_ms = self.latency.as_millis() as u64,
            "Simulating device round trip"
        );
        tokio::time::sleep(self.latency).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_transport_acknowledges() {
        let transport = SimulatedTransport::new(Duration::from_millis(1));
        transport.send(&DeviceCommand::Suspend).await.unwrap();
    }
}
