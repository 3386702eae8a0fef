//! Common types for the netplane network control plane.
//!
//! This crate provides the records and value types shared between the
//! driver state machine, the collaborator traits and the test fakes:
//!
//! - [`NetworkRecord`], [`NetworkPut`], [`NetworkStatus`], [`ClientType`]
//! - [`InstanceRecord`]: instance device/config view used for reservations
//! - [`ForwardPut`], [`LoadBalancerPut`]: address forward and load balancer specs
//! - [`NetworkPeer`]: peering requests between networks
//! - [`BgpPeer`], [`BgpPrefix`]: BGP speaker state
//! - [`MacAddress`], [`VlanId`]: validated link-layer primitives

mod bgp;
mod forward;
mod instance;
mod mac;
mod network;
mod peer;
mod vlan;

pub use bgp::{BgpPeer, BgpPrefix};
pub use forward::{
    ForwardPort, ForwardPut, LoadBalancerBackend, LoadBalancerPort, LoadBalancerPut,
    NetworkForward, NetworkLoadBalancer,
};
pub use instance::{DeviceConfig, InstanceFilter, InstanceRecord, ProfileDevices};
pub use mac::MacAddress;
pub use network::{ClientType, ConfigMap, NetworkPut, NetworkRecord, NetworkStatus};
pub use peer::{NetworkPeer, NetworkPeerPut};
pub use vlan::VlanId;

/// Name of the project that owns networks shared across projects.
pub const DEFAULT_PROJECT: &str = "default";

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 0-4094)")]
    InvalidVlanId(String),

    #[error("invalid network status: {0}")]
    InvalidStatus(String),

    #[error("invalid client type: {0}")]
    InvalidClientType(String),
}
