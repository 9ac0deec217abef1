//! fleetd - hierarchical device registry with scatter-gather group queries
//!
//! A single-process registry of independent stateful devices grouped into
//! namespaces. Devices are created lazily on first reference, removed from
//! their group the moment their termination is observed, and queried either
//! point-wise or in aggregate. The aggregate query is the interesting part:
//! a short-lived coordinator fans a read out to a snapshot of one group's
//! devices and folds replies, terminations, and a single deadline into
//! exactly one status per device.
//!
//! # Core Concepts
//!
//! - **One actor per worker**: every device, group, the manager, and each
//!   in-flight query is its own tokio task draining its own inbox
//! - **Absence is data**: a query never fails; devices that are gone or
//!   silent show up as `Terminated` / `TimedOut` statuses in the result
//! - **Watch, don't poll**: termination is observed by awaiting closure of
//!   a worker's inbox channel, relayed into the watcher's own inbox
//!
//! # Modules
//!
//! - [`registry`] - the actors: manager, groups, devices, aggregate queries
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod registry;

// Re-export commonly used types
pub use config::{Config, RegistryConfig, SimulateConfig};
pub use registry::{
    AggregateResult, DeviceHandle, DeviceList, DeviceManager, DeviceRegistered, GroupHandle,
    Reading, ReadingStatus, Recorded, RegistryError, RegistryHandle,
};
