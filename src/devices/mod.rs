//! Device registry
//!
//! Devices are the controllable entities a node exposes. Their metadata
//! outlives node sessions; their online flag and state do not

pub mod registry;
pub mod types;

pub use registry::{DeviceRegistry, LoadReport};
pub use types::{Device, DeviceDescriptor, DeviceKey, DeviceRecord};
