//! iap-core: Core abstractions and configuration for IAP tunnels
//!
//! This crate provides the domain types shared by the transport engine and
//! its callers: instance locators, protocol and policy capabilities, tunnel
//! profiles, byte counters, the error taxonomy and configuration.

pub mod config;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod statistics;
pub mod types;

pub use error::{HelpTopic, ProfileError, TransportFailed, TunnelError};
pub use profile::{ProfileKey, TunnelProfile};
pub use protocol::{AllowAllPolicy, PortAllowListPolicy, Protocol, Rdp, Ssh, TransportPolicy};
pub use statistics::NetworkStatistics;
pub use types::InstanceLocator;
