//! Airlift core: configuration, content hashing, the entity model and
//! instance request expansion.
//!
//! Everything here is provider-agnostic and I/O-free; remote transports
//! and instance backends plug in through the traits in `airlift-remote`.

pub mod config;
pub mod entity;
pub mod error;
pub mod expand;
pub mod hash;
pub mod registry;

pub use config::{AirliftConfig, AssignPolicy};
pub use entity::{
    Environment, Instance, InstanceSpec, InstanceState, Job, Process, RunState, StateMask,
};
pub use error::{ConfigError, ConfigResult};
pub use expand::CpuCatalog;
pub use registry::Inventory;
