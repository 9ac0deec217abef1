//! Hierarchical device registry
//!
//! Four kinds of actor, leaves first:
//!
//! - [`device`] - one worker per device, holding one optional reading
//! - [`group`] - owns the `device_id → handle` map for one group id
//! - [`manager`] - owns the `group_id → handle` map and routes requests
//! - `query` - a transient scatter-gather worker spawned per aggregate query
//!
//! Each actor processes its inbox strictly one message at a time; all
//! cross-actor coordination is message passing plus termination watching
//! (awaiting closure of a worker's inbox channel). Maps are only ever
//! touched by their owning actor.

pub mod device;
pub mod group;
pub mod manager;
pub mod messages;
mod query;

pub use device::DeviceHandle;
pub use group::GroupHandle;
pub use manager::{DeviceManager, RegistryHandle};
pub use messages::{
    AggregateResult, DeviceCommand, DeviceList, DeviceRegistered, GroupCommand, Reading,
    ReadingStatus, Recorded, RegistryCommand, RegistryError,
};
