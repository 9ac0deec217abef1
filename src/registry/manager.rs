//! DeviceManager actor - top-level owner of groups
//!
//! Mirrors the group's create-if-absent / remove-on-terminate pattern one
//! level up. Track requests create the addressed group on first reference
//! and are forwarded transparently, so the group answers the original
//! requester directly. List and query requests for an unknown group are
//! answered immediately with an empty result rather than dropped; only the
//! group itself drops mismatched track requests.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;

use super::device::DeviceHandle;
use super::group::GroupHandle;
use super::messages::{
    AggregateResult, DeviceList, GroupCommand, RegistryCommand, RegistryError,
};
use std::time::Duration;

/// The manager actor owning the group map
pub struct DeviceManager {
    config: RegistryConfig,
    groups: HashMap<String, GroupHandle>,
    /// Clone of the manager's own inbox sender, handed to watch relays
    self_tx: mpsc::Sender<RegistryCommand>,
}

impl DeviceManager {
    /// Spawn the manager actor and return the client handle
    pub fn spawn(config: RegistryConfig) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(config.channel_buffer);

        let manager = DeviceManager {
            config,
            groups: HashMap::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(manager.run(rx));

        RegistryHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        info!("DeviceManager started");

        while let Some(cmd) = rx.recv().await {
            match cmd {
                RegistryCommand::Track {
                    group_id,
                    device_id,
                    reply_to,
                } => {
                    let group = self.group(&group_id);
                    if group
                        .send(GroupCommand::Track {
                            group_id: group_id.clone(),
                            device_id,
                            reply_to,
                        })
                        .await
                        .is_err()
                    {
                        warn!(group_id = %group_id, "Track request hit a stopped group");
                    }
                }

                RegistryCommand::List {
                    request_id,
                    group_id,
                    reply,
                } => match self.groups.get(&group_id) {
                    Some(group) => {
                        if group
                            .send(GroupCommand::List {
                                request_id,
                                group_id: group_id.clone(),
                                reply,
                            })
                            .await
                            .is_err()
                        {
                            warn!(group_id = %group_id, "List request hit a stopped group");
                        }
                    }
                    None => {
                        let _ = reply.send(DeviceList {
                            request_id,
                            ids: Default::default(),
                        });
                    }
                },

                RegistryCommand::Query {
                    request_id,
                    group_id,
                    reply,
                    timeout,
                } => match self.groups.get(&group_id) {
                    Some(group) => {
                        if group
                            .send(GroupCommand::QueryAll {
                                request_id,
                                reply,
                                timeout,
                            })
                            .await
                            .is_err()
                        {
                            warn!(group_id = %group_id, "Query request hit a stopped group");
                        }
                    }
                    None => {
                        let _ = reply.send(AggregateResult {
                            request_id,
                            readings: Default::default(),
                        });
                    }
                },

                RegistryCommand::PassivateGroup { group_id } => match self.groups.get(&group_id) {
                    Some(group) => {
                        let _ = group.passivate().await;
                    }
                    None => {
                        debug!(group_id = %group_id, "Passivate for unknown group ignored");
                    }
                },

                RegistryCommand::GroupStopped { group_id } => {
                    if self.groups.remove(&group_id).is_some() {
                        info!(group_id = %group_id, "Group terminated");
                    }
                }

                RegistryCommand::Shutdown => {
                    debug!("Shutdown command");
                    break;
                }
            }
        }

        info!("DeviceManager stopped");
    }

    /// Look up a group, creating and watching it on first reference
    fn group(&mut self, group_id: &str) -> GroupHandle {
        match self.groups.get(group_id) {
            Some(group) => group.clone(),
            None => {
                let group = GroupHandle::spawn(
                    group_id,
                    self.config.channel_buffer,
                    self.config.device_channel_buffer,
                );
                self.watch(group.clone());
                self.groups.insert(group_id.to_string(), group.clone());
                info!(group_id = %group_id, "Group created");
                group
            }
        }
    }

    /// Post a stop notice to our own inbox when the group's inbox closes
    fn watch(&self, group: GroupHandle) {
        let notify = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = group.closed() => {
                    let _ = notify
                        .send(RegistryCommand::GroupStopped {
                            group_id: group.group_id().to_string(),
                        })
                        .await;
                }
                _ = notify.closed() => {}
            }
        });
    }
}

/// Client handle to the registry
///
/// Cloneable; all operations are async sends into the manager's inbox
/// followed by a wait on the per-request reply channel.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Register a device, creating its group if absent
    pub async fn track(
        &self,
        group_id: &str,
        device_id: &str,
    ) -> Result<DeviceHandle, RegistryError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.tx
            .send(RegistryCommand::Track {
                group_id: group_id.to_string(),
                device_id: device_id.to_string(),
                reply_to: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::RegistryStopped)?;
        reply_rx
            .recv()
            .await
            .map(|registered| registered.device)
            .ok_or(RegistryError::ReplyDropped)
    }

    /// List the device ids of a group; empty when the group is unknown
    pub async fn list(&self, request_id: u64, group_id: &str) -> Result<DeviceList, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::List {
                request_id,
                group_id: group_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::RegistryStopped)?;
        reply_rx.await.map_err(|_| RegistryError::ReplyDropped)
    }

    /// Aggregate-query a group; empty when the group is unknown
    pub async fn query(
        &self,
        request_id: u64,
        group_id: &str,
        timeout: Duration,
    ) -> Result<AggregateResult, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Query {
                request_id,
                group_id: group_id.to_string(),
                reply: reply_tx,
                timeout,
            })
            .await
            .map_err(|_| RegistryError::RegistryStopped)?;
        reply_rx.await.map_err(|_| RegistryError::ReplyDropped)
    }

    /// Stop one group; its devices keep running until their own passivation
    pub async fn passivate_group(&self, group_id: &str) -> Result<(), RegistryError> {
        self.tx
            .send(RegistryCommand::PassivateGroup {
                group_id: group_id.to_string(),
            })
            .await
            .map_err(|_| RegistryError::RegistryStopped)
    }

    /// Stop the manager actor
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.tx
            .send(RegistryCommand::Shutdown)
            .await
            .map_err(|_| RegistryError::RegistryStopped)
    }

    /// Resolves once the manager actor has stopped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
