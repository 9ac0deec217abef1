//! DeviceGroup actor - namespace owning one group's devices
//!
//! The group owns `device_id → DeviceHandle` for exactly one group id. It
//! creates devices lazily on track requests, watches each one it creates,
//! and removes the map entry when the watch reports the device's inbox
//! closed. Aggregate queries are handed a snapshot of the map and run in
//! their own task, so the group never blocks on a slow device.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::device::DeviceHandle;
use super::messages::{
    AggregateResult, DeviceList, DeviceRegistered, GroupCommand, RegistryError,
};
use super::query::GroupQuery;

/// Handle to send commands to a group actor
#[derive(Debug, Clone)]
pub struct GroupHandle {
    group_id: String,
    tx: mpsc::Sender<GroupCommand>,
}

impl GroupHandle {
    /// Spawn a new group actor and return its handle
    pub fn spawn(group_id: &str, channel_buffer: usize, device_channel_buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_buffer);

        let group = DeviceGroup {
            group_id: group_id.to_string(),
            device_channel_buffer,
            devices: HashMap::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(group.run(rx));

        Self {
            group_id: group_id.to_string(),
            tx,
        }
    }

    /// Group id this handle addresses
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Register a device, creating it if absent
    ///
    /// The registration is delivered to `reply_to`; a request whose
    /// `group_id` does not match the group produces no reply at all.
    pub async fn track(
        &self,
        group_id: &str,
        device_id: &str,
        reply_to: mpsc::Sender<DeviceRegistered>,
    ) -> Result<(), RegistryError> {
        self.tx
            .send(GroupCommand::Track {
                group_id: group_id.to_string(),
                device_id: device_id.to_string(),
                reply_to,
            })
            .await
            .map_err(|_| RegistryError::GroupStopped)
    }

    /// List the ids of all tracked devices
    pub async fn list(&self, request_id: u64, group_id: &str) -> Result<DeviceList, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GroupCommand::List {
                request_id,
                group_id: group_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::GroupStopped)?;
        reply_rx.await.map_err(|_| RegistryError::ReplyDropped)
    }

    /// Query every tracked device, resolving each within `timeout`
    pub async fn query_all(
        &self,
        request_id: u64,
        timeout: Duration,
    ) -> Result<AggregateResult, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GroupCommand::QueryAll {
                request_id,
                reply: reply_tx,
                timeout,
            })
            .await
            .map_err(|_| RegistryError::GroupStopped)?;
        reply_rx.await.map_err(|_| RegistryError::ReplyDropped)
    }

    /// Stop the group actor
    pub async fn passivate(&self) -> Result<(), RegistryError> {
        self.tx
            .send(GroupCommand::Passivate)
            .await
            .map_err(|_| RegistryError::GroupStopped)
    }

    /// Send a raw command (used by the manager for transparent forwarding)
    pub(crate) async fn send(&self, cmd: GroupCommand) -> Result<(), RegistryError> {
        self.tx.send(cmd).await.map_err(|_| RegistryError::GroupStopped)
    }

    /// Resolves once the group actor has stopped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl PartialEq for GroupHandle {
    /// Handles are equal when they address the same actor
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// The group actor owning the device map
struct DeviceGroup {
    group_id: String,
    device_channel_buffer: usize,
    devices: HashMap<String, DeviceHandle>,
    /// Clone of the group's own inbox sender, handed to watch relays
    self_tx: mpsc::Sender<GroupCommand>,
}

impl DeviceGroup {
    async fn run(mut self, mut rx: mpsc::Receiver<GroupCommand>) {
        info!(group_id = %self.group_id, "DeviceGroup started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                GroupCommand::Track {
                    group_id,
                    device_id,
                    reply_to,
                } => {
                    if group_id != self.group_id {
                        warn!(
                            group_id = %self.group_id,
                            requested = %group_id,
                            device_id = %device_id,
                            "Ignoring track request for wrong group"
                        );
                        continue;
                    }

                    let device = match self.devices.get(&device_id) {
                        Some(device) => device.clone(),
                        None => {
                            let device = DeviceHandle::spawn(
                                &self.group_id,
                                &device_id,
                                self.device_channel_buffer,
                            );
                            self.watch(device.clone());
                            self.devices.insert(device_id.clone(), device.clone());
                            info!(group_id = %self.group_id, device_id = %device_id, "Device created");
                            device
                        }
                    };
                    let _ = reply_to.send(DeviceRegistered { device }).await;
                }

                GroupCommand::List {
                    request_id,
                    group_id,
                    reply,
                } => {
                    if group_id != self.group_id {
                        warn!(
                            group_id = %self.group_id,
                            requested = %group_id,
                            "Ignoring list request for wrong group"
                        );
                        continue;
                    }
                    let _ = reply.send(DeviceList {
                        request_id,
                        ids: self.devices.keys().cloned().collect(),
                    });
                }

                GroupCommand::QueryAll {
                    request_id,
                    reply,
                    timeout,
                } => {
                    // Snapshot at spawn time; devices tracked afterwards are
                    // not part of this query.
                    GroupQuery::spawn(
                        request_id,
                        self.group_id.clone(),
                        self.devices.clone(),
                        reply,
                        timeout,
                    );
                }

                GroupCommand::DeviceStopped { group_id, device_id } => {
                    debug_assert_eq!(group_id, self.group_id);
                    if self.devices.remove(&device_id).is_some() {
                        info!(group_id = %self.group_id, device_id = %device_id, "Device terminated");
                    }
                }

                GroupCommand::Passivate => {
                    debug!(group_id = %self.group_id, "Passivate command");
                    break;
                }
            }
        }

        info!(group_id = %self.group_id, "DeviceGroup stopped");
    }

    /// Post a stop notice to our own inbox when the device's inbox closes
    ///
    /// The relay also watches our own inbox so it never outlives the group.
    fn watch(&self, device: DeviceHandle) {
        let notify = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = device.closed() => {
                    let _ = notify
                        .send(GroupCommand::DeviceStopped {
                            group_id: device.group_id().to_string(),
                            device_id: device.device_id().to_string(),
                        })
                        .await;
                }
                _ = notify.closed() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::messages::ReadingStatus;

    fn group(group_id: &str) -> GroupHandle {
        GroupHandle::spawn(group_id, 16, 8)
    }

    async fn track(group: &GroupHandle, group_id: &str, device_id: &str) -> DeviceHandle {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        group.track(group_id, device_id, reply_tx).await.unwrap();
        reply_rx.recv().await.unwrap().device
    }

    #[tokio::test]
    async fn test_track_creates_device() {
        let group = group("g");
        let device = track(&group, "g", "d1").await;

        assert_eq!(device.group_id(), "g");
        assert_eq!(device.device_id(), "d1");
    }

    #[tokio::test]
    async fn test_track_is_idempotent() {
        let group = group("g");

        let first = track(&group, "g", "d1").await;
        let second = track(&group, "g", "d1").await;
        assert_eq!(first, second);

        let other = track(&group, "g", "d2").await;
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_track_for_wrong_group_is_dropped() {
        let group = group("g");
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        group.track("other", "d1", reply_tx).await.unwrap();

        // No reply within a grace window, and no device was created.
        let probe = tokio::time::timeout(Duration::from_millis(100), reply_rx.recv()).await;
        assert!(probe.is_err() || probe.unwrap().is_none());

        let list = group.list(1, "g").await.unwrap();
        assert!(list.ids.is_empty());
    }

    #[tokio::test]
    async fn test_list_for_wrong_group_is_dropped() {
        let group = group("g");
        track(&group, "g", "d1").await;

        let result = group.list(1, "other").await;
        assert!(matches!(result, Err(RegistryError::ReplyDropped)));
    }

    #[tokio::test]
    async fn test_list_reflects_tracked_devices() {
        let group = group("g");
        track(&group, "g", "d1").await;
        track(&group, "g", "d2").await;

        let list = group.list(7, "g").await.unwrap();
        assert_eq!(list.request_id, 7);
        assert_eq!(list.ids.len(), 2);
        assert!(list.ids.contains("d1"));
        assert!(list.ids.contains("d2"));
    }

    #[tokio::test]
    async fn test_passivated_device_is_removed_from_list() {
        let group = group("g");
        track(&group, "g", "d1").await;
        let doomed = track(&group, "g", "d2").await;

        doomed.passivate().await.unwrap();
        doomed.closed().await;

        // The stop notice travels through a relay task; retry until the
        // group has processed it.
        let mut ids = Default::default();
        for _ in 0..50 {
            ids = group.list(1, "g").await.unwrap().ids;
            if ids.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ids.contains("d1"));
        assert!(!ids.contains("d2"));
    }

    #[tokio::test]
    async fn test_query_all_covers_the_snapshot() {
        let group = group("g");
        let a = track(&group, "g", "a").await;
        track(&group, "g", "b").await;
        a.record(1, 24.0).await.unwrap();

        let result = group.query_all(7, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.request_id, 7);
        assert_eq!(result.readings.len(), 2);
        assert_eq!(result.readings["a"], ReadingStatus::Value(24.0));
        assert_eq!(result.readings["b"], ReadingStatus::NotTracked);
    }

    #[tokio::test]
    async fn test_query_all_on_empty_group_is_immediate() {
        let group = group("g");

        let started = std::time::Instant::now();
        let result = group.query_all(1, Duration::from_secs(10)).await.unwrap();
        assert!(result.readings.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_passivate_stops_group() {
        let group = group("g");
        group.passivate().await.unwrap();
        group.closed().await;

        let result = group.list(1, "g").await;
        assert!(matches!(result, Err(RegistryError::GroupStopped)));
    }
}
