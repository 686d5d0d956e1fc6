//! Per-user device/endpoint registry and the publisher that routes
//! outputs over it.

pub mod device;
pub mod publisher;
pub mod registry;

pub use device::{Capabilities, Device, Endpoint};
pub use publisher::Publisher;
pub use registry::{DeviceRegistry, RegistryStats};
