//! Registry messages
//!
//! Commands, replies, and errors for the actor pattern.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::device::DeviceHandle;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device stopped")]
    DeviceStopped,

    #[error("Group stopped")]
    GroupStopped,

    #[error("Registry stopped")]
    RegistryStopped,

    #[error("Reply channel dropped")]
    ReplyDropped,
}

/// Commands sent to a device actor
#[derive(Debug)]
pub enum DeviceCommand {
    /// Read the last recorded value
    Read {
        request_id: u64,
        reply: oneshot::Sender<Reading>,
    },

    /// Overwrite the stored value
    Record {
        request_id: u64,
        value: f64,
        reply: oneshot::Sender<Recorded>,
    },

    /// Stop the device actor
    Passivate,
}

/// Reply to a read request
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub request_id: u64,
    pub value: Option<f64>,
}

/// Acknowledgement of a record request
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub request_id: u64,
}

/// Reply to a track request, carrying the device's handle
#[derive(Debug, Clone)]
pub struct DeviceRegistered {
    pub device: DeviceHandle,
}

/// Reply to a device-list request
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceList {
    pub request_id: u64,
    pub ids: HashSet<String>,
}

/// Per-device outcome of an aggregate query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "kebab-case")]
pub enum ReadingStatus {
    /// The device answered with a recorded value
    Value(f64),
    /// The device answered but nothing was ever recorded
    NotTracked,
    /// The device's inbox closed before it answered
    Terminated,
    /// The device neither answered nor stopped within the deadline
    TimedOut,
}

impl std::fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::NotTracked => write!(f, "not tracked"),
            Self::Terminated => write!(f, "terminated"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Consolidated reply to an aggregate query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    #[serde(rename = "request-id")]
    pub request_id: u64,
    pub readings: HashMap<String, ReadingStatus>,
}

/// Commands sent to a group actor
#[derive(Debug)]
pub enum GroupCommand {
    /// Register a device, creating it if absent
    ///
    /// A request whose `group_id` does not match the group is dropped
    /// without a reply, so the acknowledgement travels over mpsc.
    Track {
        group_id: String,
        device_id: String,
        reply_to: mpsc::Sender<DeviceRegistered>,
    },

    /// List the ids of all tracked devices
    List {
        request_id: u64,
        group_id: String,
        reply: oneshot::Sender<DeviceList>,
    },

    /// Query every tracked device for its reading
    QueryAll {
        request_id: u64,
        reply: oneshot::Sender<AggregateResult>,
        timeout: Duration,
    },

    /// A tracked device's inbox closed (internal)
    DeviceStopped { group_id: String, device_id: String },

    /// Stop the group actor
    Passivate,
}

/// Commands sent to the registry actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a device, creating its group if absent
    Track {
        group_id: String,
        device_id: String,
        reply_to: mpsc::Sender<DeviceRegistered>,
    },

    /// List the device ids of a group (empty when the group is unknown)
    List {
        request_id: u64,
        group_id: String,
        reply: oneshot::Sender<DeviceList>,
    },

    /// Aggregate-query a group (empty when the group is unknown)
    Query {
        request_id: u64,
        group_id: String,
        reply: oneshot::Sender<AggregateResult>,
        timeout: Duration,
    },

    /// Stop a group actor
    PassivateGroup { group_id: String },

    /// A group's inbox closed (internal)
    GroupStopped { group_id: String },

    /// Shutdown the registry actor
    Shutdown,
}
