//! Network management module
//!
//! Bridged isolation domains in which services resolve each other by name.

pub mod bridge;
pub mod config;

pub use bridge::{BridgeNetwork, NetworkManager};
pub use config::{NetworkConfig, NetworkContainer, NetworkDriver};
