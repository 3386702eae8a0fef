//! Network drivers.
//!
//! Every managed network is driven through the [`Network`] trait. Drivers
//! embed a [`NetworkCommon`] holding the record and shared state; the
//! trait's default methods delegate to it, and each driver overrides the
//! lifecycle steps it specializes.

mod bridge;
mod common;
mod macvlan;
mod physical;
mod sriov;

pub use bridge::BridgeNetwork;
pub use common::{ConfigChange, NetworkCommon};
pub use macvlan::MacvlanNetwork;
pub use physical::PhysicalNetwork;
pub use sriov::SriovNetwork;

use async_trait::async_trait;
use ipnet::IpNet;
use netplane_common::config::get;
use netplane_common::{NetError, NetResult, RuleSet};
use netplane_types::{
    ClientType, ConfigMap, ForwardPut, LoadBalancerPut, NetworkPeer, NetworkPeerPut, NetworkPut,
    NetworkRecord,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::dhcp::{self, IpRange};
use crate::state::NetworkState;

/// Capabilities a driver advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Info {
    /// Networks of this type may live outside the default project.
    pub projects: bool,
    /// Some config keys are set per cluster member.
    pub node_specific_config: bool,
    pub address_forwards: bool,
    pub load_balancers: bool,
    pub peering: bool,
}

/// Lifecycle contract of a managed network.
#[async_trait]
pub trait Network: Send + Sync {
    fn common(&self) -> &NetworkCommon;
    fn common_mut(&mut self) -> &mut NetworkCommon;

    fn info(&self) -> Info;

    /// Static rules of this driver. Wildcard families are added by
    /// [`Network::validate`].
    fn validation_rules(&self) -> RuleSet;

    /// Checks `config` against the driver's rules. Drivers speaking BGP
    /// also accept the `bgp.peers.*` family.
    fn validate(&self, config: &ConfigMap) -> NetResult<()> {
        self.common().validate(config, self.validation_rules(), false)
    }

    /// Fills defaults into a config about to be created or updated.
    async fn fill_config(&self, _config: &mut ConfigMap) -> NetResult<()> {
        Ok(())
    }

    /// One-time checks before the network is created cluster-wide.
    async fn create(&mut self, _client_type: ClientType) -> NetResult<()> {
        Ok(())
    }

    async fn start(&mut self) -> NetResult<()>;
    async fn stop(&mut self) -> NetResult<()>;

    async fn update(
        &mut self,
        new: NetworkPut,
        target: Option<&str>,
        client_type: ClientType,
    ) -> NetResult<()>;

    async fn rename(&mut self, new_name: &str) -> NetResult<()> {
        self.common_mut().rename(new_name).await
    }

    async fn delete(&mut self, client_type: ClientType) -> NetResult<()>;

    /// Called when the local member is evacuated.
    async fn evacuate(&mut self) -> NetResult<()> {
        Ok(())
    }

    /// Called when the local member is restored after evacuation.
    async fn restore(&mut self) -> NetResult<()> {
        Ok(())
    }

    /// Called when a network this one uses as its uplink changed.
    async fn handle_dependency_change(
        &mut self,
        _uplink: &str,
        _changed_keys: &[String],
    ) -> NetResult<()> {
        Ok(())
    }

    async fn is_used(&self) -> NetResult<bool> {
        self.common().is_used().await
    }

    fn dhcpv4_subnet(&self) -> Option<IpNet> {
        None
    }

    fn dhcpv6_subnet(&self) -> Option<IpNet> {
        None
    }

    fn dhcpv4_ranges(&self) -> Vec<IpRange> {
        dhcp::parse_ranges(get(self.common().config(), "ipv4.dhcp.ranges"), false)
    }

    fn dhcpv6_ranges(&self) -> Vec<IpRange> {
        dhcp::parse_ranges(get(self.common().config(), "ipv6.dhcp.ranges"), true)
    }

    async fn forward_create(
        &mut self,
        _listen_address: &str,
        _forward: ForwardPut,
        _client_type: ClientType,
    ) -> NetResult<IpAddr> {
        Err(NetError::NotImplemented)
    }

    async fn forward_update(
        &mut self,
        _listen_address: &str,
        _forward: ForwardPut,
        _client_type: ClientType,
    ) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn forward_delete(
        &mut self,
        _listen_address: &str,
        _client_type: ClientType,
    ) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn load_balancer_create(
        &mut self,
        _listen_address: &str,
        _lb: LoadBalancerPut,
        _client_type: ClientType,
    ) -> NetResult<IpAddr> {
        Err(NetError::NotImplemented)
    }

    async fn load_balancer_update(
        &mut self,
        _listen_address: &str,
        _lb: LoadBalancerPut,
        _client_type: ClientType,
    ) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn load_balancer_delete(
        &mut self,
        _listen_address: &str,
        _client_type: ClientType,
    ) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn peer_create(&mut self, _peer: NetworkPeer) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn peer_update(&mut self, _name: &str, _peer: NetworkPeerPut) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }

    async fn peer_delete(&mut self, _name: &str) -> NetResult<()> {
        Err(NetError::NotImplemented)
    }
}

/// Builds a driver around a loaded record.
pub type DriverFactory = fn(NetworkCommon) -> Box<dyn Network>;

/// Static validation rules of a driver, usable without a record.
pub type RulesFactory = fn() -> RuleSet;

#[derive(Clone, Copy)]
struct DriverEntry {
    factory: DriverFactory,
    rules: RulesFactory,
    bgp: bool,
}

/// Driver lookup by network type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, DriverEntry>,
}

impl DriverRegistry {
    /// Registry with the bridge, physical, macvlan and sriov drivers.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.insert("bridge", BridgeNetwork::boxed, bridge::validation_rules, true);
        registry.insert("physical", PhysicalNetwork::boxed, physical::validation_rules, true);
        registry.insert("macvlan", MacvlanNetwork::boxed, macvlan::validation_rules, false);
        registry.insert("sriov", SriovNetwork::boxed, sriov::validation_rules, false);
        registry
    }

    fn insert(
        &mut self,
        net_type: &'static str,
        factory: DriverFactory,
        rules: RulesFactory,
        bgp: bool,
    ) {
        self.drivers.insert(net_type, DriverEntry { factory, rules, bgp });
    }

    /// Registers (or replaces) a driver without static rules.
    pub fn register(&mut self, net_type: &'static str, factory: DriverFactory) {
        self.insert(net_type, factory, RuleSet::new, false);
    }

    pub fn contains(&self, net_type: &str) -> bool {
        self.drivers.contains_key(net_type)
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.drivers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn entry(&self, net_type: &str) -> NetResult<DriverEntry> {
        self.drivers
            .get(net_type)
            .copied()
            .ok_or_else(|| NetError::not_found("Network driver", net_type))
    }
}

/// Instantiates the driver of an already loaded record.
pub fn load(state: &Arc<NetworkState>, record: NetworkRecord) -> NetResult<Box<dyn Network>> {
    let entry = state.drivers().entry(&record.net_type)?;
    Ok((entry.factory)(NetworkCommon::new(state.clone(), record)))
}

/// Loads a network record from the store and instantiates its driver.
pub async fn load_by_name(
    state: &Arc<NetworkState>,
    project: &str,
    name: &str,
) -> NetResult<Box<dyn Network>> {
    let record = state.store.get_network(project, name).await?;
    load(state, record)
}

/// Validates a config for a network of `net_type` without loading it.
pub fn validate_config(
    registry: &DriverRegistry,
    net_type: &str,
    name: &str,
    config: &ConfigMap,
) -> NetResult<()> {
    let entry = registry.entry(net_type)?;
    common::validate_network_config(name, config, (entry.rules)(), entry.bgp)
}
