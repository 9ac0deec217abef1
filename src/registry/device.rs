//! Device actor - leaf worker holding one optional reading
//!
//! Each device owns a single `Option<f64>` slot that only its own command
//! loop mutates. Devices stop when told to passivate; dropping handles alone
//! never kills one, because watchers hold a sender clone for the lifetime of
//! their interest.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::{DeviceCommand, Reading, Recorded, RegistryError};

/// Handle to send commands to a device actor
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    group_id: String,
    device_id: String,
    tx: mpsc::Sender<DeviceCommand>,
}

impl DeviceHandle {
    /// Spawn a new device actor and return its handle
    pub fn spawn(group_id: &str, device_id: &str, channel_buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_buffer);

        let device = Device {
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            last_reading: None,
        };
        tokio::spawn(device.run(rx));

        Self {
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            tx,
        }
    }

    /// Group id this device belongs to
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Device id within the group
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Read the last recorded value
    pub async fn read(&self, request_id: u64) -> Result<Reading, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::Read {
                request_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::DeviceStopped)?;
        reply_rx.await.map_err(|_| RegistryError::DeviceStopped)
    }

    /// Record a new value, replacing any previous one
    pub async fn record(&self, request_id: u64, value: f64) -> Result<Recorded, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DeviceCommand::Record {
                request_id,
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::DeviceStopped)?;
        reply_rx.await.map_err(|_| RegistryError::DeviceStopped)
    }

    /// Stop the device actor
    pub async fn passivate(&self) -> Result<(), RegistryError> {
        self.tx
            .send(DeviceCommand::Passivate)
            .await
            .map_err(|_| RegistryError::DeviceStopped)
    }

    /// Send a raw command (used by the query coordinator)
    pub(crate) async fn send(&self, cmd: DeviceCommand) -> Result<(), RegistryError> {
        self.tx.send(cmd).await.map_err(|_| RegistryError::DeviceStopped)
    }

    /// Resolves once the device actor has stopped
    ///
    /// This is the watch primitive: awaiting it is how containers and
    /// queries observe termination.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Build a handle over a raw channel, without an actor behind it
    #[cfg(test)]
    pub(crate) fn from_channel(group_id: &str, device_id: &str, tx: mpsc::Sender<DeviceCommand>) -> Self {
        Self {
            group_id: group_id.to_string(),
            device_id: device_id.to_string(),
            tx,
        }
    }
}

impl PartialEq for DeviceHandle {
    /// Handles are equal when they address the same actor
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// The device actor owning the reading slot
struct Device {
    group_id: String,
    device_id: String,
    last_reading: Option<f64>,
}

impl Device {
    async fn run(mut self, mut rx: mpsc::Receiver<DeviceCommand>) {
        info!(group_id = %self.group_id, device_id = %self.device_id, "Device started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                DeviceCommand::Read { request_id, reply } => {
                    debug!(
                        group_id = %self.group_id,
                        device_id = %self.device_id,
                        request_id,
                        "Read command"
                    );
                    let _ = reply.send(Reading {
                        request_id,
                        value: self.last_reading,
                    });
                }

                DeviceCommand::Record { request_id, value, reply } => {
                    debug!(
                        group_id = %self.group_id,
                        device_id = %self.device_id,
                        request_id,
                        value,
                        "Record command"
                    );
                    self.last_reading = Some(value);
                    let _ = reply.send(Recorded { request_id });
                }

                DeviceCommand::Passivate => {
                    debug!(group_id = %self.group_id, device_id = %self.device_id, "Passivate command");
                    break;
                }
            }
        }

        info!(group_id = %self.group_id, device_id = %self.device_id, "Device stopped");
    }
}
