//! palaver-core — wire format and configuration shared by the services.
//! Both the discovery and messaging crates depend on this one.

pub mod config;
pub mod wire;

pub use config::{Config, ConfigError};
pub use wire::{DiscoveryMessage, ImageHeader, PeerInfo, TextFrame, WireError};
