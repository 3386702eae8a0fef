//! Physical uplink networks.
//!
//! A physical network binds an existing host interface, optionally through
//! a VLAN sub-interface it creates and later removes. The
//! `volatile.last_state.created` flag records whether the sub-interface was
//! created here, so a restart never removes an interface it did not create.

use async_trait::async_trait;
use futures::FutureExt;
use ipnet::IpNet;
use netplane_common::config::{get, is_true, LAST_STATE_CREATED_KEY};
use netplane_common::validate::{
    is_any, is_bool, is_interface_name, is_list_of, is_network_address_cidr_v4,
    is_network_address_cidr_v6, is_network_address_v4, is_network_address_v6, is_network_mtu,
    is_network_range_v4, is_network_range_v6, is_network_v4, is_network_v6, is_network_vlan,
    is_one_of, optional, required,
};
use netplane_common::{NetError, NetResult, Reverter, RuleSet};
use netplane_types::{ClientType, ConfigMap, NetworkPut, VlanId};
use tracing::{debug, info, instrument, warn};

use super::common::{push_update_replay, vlan_interface_name, NetworkCommon};
use super::{Info, Network};
use crate::dhcp;

const DEFAULT_MTU: u32 = 1500;

/// Static keys of physical networks.
pub fn validation_rules() -> RuleSet {
    RuleSet::new()
        .with("parent", required(is_interface_name))
        .with("mtu", optional(is_network_mtu))
        .with("vlan", optional(is_network_vlan))
        .with("gvrp", optional(is_bool))
        .with("maas.subnet.ipv4", is_any)
        .with("maas.subnet.ipv6", is_any)
        .with("ipv4.gateway", optional(is_network_address_cidr_v4))
        .with("ipv6.gateway", optional(is_network_address_cidr_v6))
        .with("ipv4.ovn.ranges", optional(is_list_of(is_network_range_v4)))
        .with("ipv6.ovn.ranges", optional(is_list_of(is_network_range_v6)))
        .with("ipv4.routes", optional(is_list_of(is_network_v4)))
        .with("ipv6.routes", optional(is_list_of(is_network_v6)))
        .with("ipv4.routes.anycast", optional(is_bool))
        .with("ipv6.routes.anycast", optional(is_bool))
        .with("dns.nameservers", optional(is_list_of(is_nameserver)))
        .with("ovn.ingress_mode", optional(is_one_of(&["l2proxy", "routed"])))
        .with("bgp.ipv4.nexthop", optional(is_network_address_v4))
        .with("bgp.ipv6.nexthop", optional(is_network_address_v6))
        .with(LAST_STATE_CREATED_KEY, optional(is_bool))
}

fn is_nameserver(value: &str) -> Result<(), String> {
    is_network_address_v4(value).or_else(|_| is_network_address_v6(value))
}

/// Parses the optional `vlan` key.
pub(super) fn parse_vlan(config: &ConfigMap) -> NetResult<Option<VlanId>> {
    let vlan = get(config, "vlan");
    if vlan.is_empty() {
        return Ok(None);
    }
    vlan.parse::<VlanId>()
        .map(Some)
        .map_err(|e| NetError::invalid_config("vlan", e.to_string()))
}

/// Host interface used by a network: `parent`, or `parent.vlan`.
pub(super) fn host_name(config: &ConfigMap) -> NetResult<String> {
    let parent = get(config, "parent");
    Ok(match parse_vlan(config)? {
        Some(vlan) => vlan_interface_name(parent, vlan),
        None => parent.to_string(),
    })
}

pub struct PhysicalNetwork {
    common: NetworkCommon,
}

impl PhysicalNetwork {
    pub fn new(common: NetworkCommon) -> Self {
        Self { common }
    }

    pub(super) fn boxed(common: NetworkCommon) -> Box<dyn Network> {
        Box::new(Self::new(common))
    }

    /// Brings up the host interface, records its provenance and sets up BGP.
    async fn setup(&mut self, old_config: Option<ConfigMap>) -> NetResult<()> {
        let state = self.common.state().clone();
        let config = self.common.config().clone();
        let parent = get(&config, "parent");

        if !state.os.interface_exists(parent).await? {
            return Err(NetError::not_found("Parent interface", parent));
        }

        let host = host_name(&config)?;
        let mut revert: Reverter<Self> = Reverter::new();

        let mut created = false;
        if let Some(vlan) = parse_vlan(&config)? {
            created = self
                .common
                .ensure_vlan_interface(parent, vlan, is_true(get(&config, "gvrp")))
                .await?;
        }

        if created {
            let os = state.os.clone();
            let host = host.clone();
            revert.add_detached(move || async move {
                let _ = os.interface_remove(&host).await;
            });
        }

        if let Err(e) = self.apply_mtu(&host, get(&config, "mtu")).await {
            revert.fail(self).await;
            return Err(e);
        }

        if !is_true(get(&config, LAST_STATE_CREATED_KEY)) {
            if let Err(e) = self.record_created(created).await {
                revert.fail(self).await;
                return Err(e);
            }
        }

        if !state.member.is_evacuated() {
            if let Err(e) = self.common.bgp_setup(old_config.as_ref()).await {
                revert.fail(self).await;
                return Err(e);
            }
        }

        revert.success();
        Ok(())
    }

    async fn apply_mtu(&self, host: &str, mtu: &str) -> NetResult<()> {
        if mtu.is_empty() {
            return Ok(());
        }

        let value: u32 = mtu
            .parse()
            .map_err(|_| NetError::invalid_config("mtu", format!("Invalid MTU {:?}", mtu)))?;
        self.common
            .state()
            .os
            .set_mtu(host, value)
            .await
            .map_err(|e| e.context(format!("Failed setting MTU {:?} on {:?}", mtu, host)))
    }

    /// Persists `volatile.last_state.created` without relaying it.
    async fn record_created(&mut self, created: bool) -> NetResult<()> {
        let mut put = self.common.record().put();
        put.config
            .insert(LAST_STATE_CREATED_KEY.to_string(), created.to_string());
        self.store_local(put)
            .await
            .map_err(|e| e.context("Failed saving volatile config"))
    }

    /// Writes member-local state straight to the store, bypassing the
    /// cluster broadcast.
    async fn store_local(&mut self, put: NetworkPut) -> NetResult<()> {
        self.common.apply_local(put.clone());
        self.common
            .state()
            .store
            .update_network(self.common.project(), self.common.name(), &put)
            .await
    }
}

#[async_trait]
impl Network for PhysicalNetwork {
    fn common(&self) -> &NetworkCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut NetworkCommon {
        &mut self.common
    }

    fn info(&self) -> Info {
        Info {
            node_specific_config: true,
            ..Default::default()
        }
    }

    fn validation_rules(&self) -> RuleSet {
        validation_rules()
    }

    fn validate(&self, config: &ConfigMap) -> NetResult<()> {
        self.common.validate(config, validation_rules(), true)
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn create(&mut self, client_type: ClientType) -> NetResult<()> {
        if client_type == ClientType::Normal {
            self.common.check_parent_use(self.common.config()).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn start(&mut self) -> NetResult<()> {
        self.common.set_unavailable();
        self.common.ensure_network_dir().await?;
        self.setup(None).await?;
        self.common.set_available();
        info!("Started physical network");
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn stop(&mut self) -> NetResult<()> {
        let state = self.common.state().clone();
        let config = self.common.config().clone();

        self.common.bgp_clear(&config).await?;

        let host = host_name(&config)?;
        let vlan_set = !get(&config, "vlan").is_empty();
        if vlan_set && self.common.created_interface() && state.os.interface_exists(&host).await? {
            state.os.interface_remove(&host).await?;
            debug!(interface = %host, "Removed VLAN interface");
        }

        if !get(&config, "mtu").is_empty() && state.os.interface_exists(&host).await? {
            state.os.set_mtu(&host, DEFAULT_MTU).await.map_err(|e| {
                e.context(format!("Failed setting MTU {} on {:?}", DEFAULT_MTU, host))
            })?;
        }

        let mut put = self.common.record().put();
        put.config.remove(LAST_STATE_CREATED_KEY);
        self.store_local(put)
            .await
            .map_err(|e| e.context("Failed removing volatile config"))?;

        info!("Stopped physical network");
        Ok(())
    }

    #[instrument(skip(self, new), fields(network = %self.common.name()))]
    async fn update(
        &mut self,
        mut new: NetworkPut,
        target: Option<&str>,
        client_type: ClientType,
    ) -> NetResult<()> {
        self.common.keep_local_keys(&mut new, client_type);
        let change = self.common.config_changed(&new);
        if !change.changed {
            return Ok(());
        }

        if self.common.is_pending() {
            return self.common.update(new, target, client_type).await;
        }

        let host_changed = change.keys.iter().any(|k| k == "vlan" || k == "parent");

        if client_type == ClientType::Normal && host_changed {
            if self.common.is_used().await.unwrap_or(true) {
                return Err(NetError::conflict(
                    "Cannot update network parent interface when in use",
                ));
            }
            self.common.check_parent_use(&new.config).await?;
        }

        if host_changed {
            self.stop().await?;
            new.config.remove(LAST_STATE_CREATED_KEY);
        }

        let mut revert: Reverter<Self> = Reverter::new();
        if host_changed {
            // Replay the old config, then bring its host interface back.
            let old = change.old.clone();
            let replay_target = target.map(str::to_string);
            revert.add(move |net: &mut Self| {
                async move {
                    if let Err(e) = net
                        .common
                        .update(old, replay_target.as_deref(), client_type)
                        .await
                    {
                        warn!(error = %e, "Failed restoring previous network config");
                    }
                    match net.setup(None).await {
                        Ok(()) => net.common.set_available(),
                        Err(e) => warn!(error = %e, "Failed restoring previous host interface"),
                    }
                }
                .boxed()
            });
        } else {
            push_update_replay(&mut revert, change.old.clone(), target.map(str::to_string), client_type);
        }

        if let Err(e) = self.common.update(new, target, client_type).await {
            revert.fail(self).await;
            return Err(e);
        }

        let old_config = if host_changed { None } else { Some(change.old.config.clone()) };
        if let Err(e) = self.setup(old_config).await {
            revert.fail(self).await;
            return Err(e);
        }
        revert.success();

        if client_type == ClientType::Normal && !change.keys.is_empty() {
            self.common.notify_dependent_networks(&change.keys).await;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn delete(&mut self, client_type: ClientType) -> NetResult<()> {
        self.stop().await?;
        self.common.delete(client_type).await
    }

    async fn evacuate(&mut self) -> NetResult<()> {
        let config = self.common.config().clone();
        self.common.bgp_clear(&config).await
    }

    async fn restore(&mut self) -> NetResult<()> {
        self.common.bgp_setup(None).await
    }

    fn dhcpv4_subnet(&self) -> Option<IpNet> {
        dhcp::subnet_of(get(self.common.config(), "ipv4.gateway"))
    }

    fn dhcpv6_subnet(&self) -> Option<IpNet> {
        dhcp::subnet_of(get(self.common.config(), "ipv6.gateway"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_test::{config_map, FakeCluster, NetworkFixture};
    use netplane_types::DEFAULT_PROJECT;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use crate::state::NetworkState;

    fn physical(cluster: &FakeCluster, dir: &std::path::Path, pairs: &[(&str, &str)]) -> PhysicalNetwork {
        let mut fixture = NetworkFixture::physical("phys0");
        for (k, v) in pairs {
            fixture = fixture.with_config(*k, *v);
        }
        let mut record = fixture.build();
        record.id = cluster.store.insert_network(record.clone());

        let state = NetworkState::new(
            cluster.store.clone(),
            cluster.notifier.clone(),
            cluster.bgp.clone(),
            cluster.os.clone(),
        )
        .with_var_dir(dir);
        PhysicalNetwork::new(NetworkCommon::new(Arc::new(state), record))
    }

    #[test]
    fn test_validation_rules() {
        let rules = validation_rules();
        assert!(rules.check("parent", "").unwrap().is_err());
        assert!(rules.check("vlan", "4095").unwrap().is_err());
        assert!(rules.check("ipv4.gateway", "192.0.2.1/24").unwrap().is_ok());
        assert!(rules.check("dns.nameservers", "192.0.2.53, 2001:db8::53").unwrap().is_ok());
        assert!(rules.check("ovn.ingress_mode", "bogus").unwrap().is_err());
    }

    #[test]
    fn test_parse_vlan() {
        assert_eq!(parse_vlan(&config_map(&[])).unwrap(), None);
        assert_eq!(
            parse_vlan(&config_map(&[("vlan", "100")])).unwrap(),
            Some(VlanId::new(100).unwrap())
        );
        assert!(matches!(
            parse_vlan(&config_map(&[("vlan", "4095")])),
            Err(NetError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_host_name() {
        assert_eq!(host_name(&config_map(&[("parent", "eth0")])).unwrap(), "eth0");
        assert_eq!(
            host_name(&config_map(&[("parent", "eth0"), ("vlan", "100")])).unwrap(),
            "eth0.100"
        );
    }

    #[tokio::test]
    async fn test_start_creates_vlan_and_records_flag() {
        let cluster = FakeCluster::with_links(["eth0"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("vlan", "100"), ("mtu", "9000")]);

        net.start().await.unwrap();

        let link = cluster.os.link("eth0.100").unwrap();
        assert_eq!(link.mtu, Some(9000));
        assert!(net.common().is_available());
        assert_eq!(net.common().config()[LAST_STATE_CREATED_KEY], "true");

        let stored = cluster.store.network(DEFAULT_PROJECT, "phys0").unwrap();
        assert_eq!(stored.config[LAST_STATE_CREATED_KEY], "true");
    }

    #[tokio::test]
    async fn test_stop_keeps_interfaces_it_did_not_create() {
        let cluster = FakeCluster::with_links(["eth0", "eth0.100"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("vlan", "100")]);

        net.start().await.unwrap();
        assert_eq!(net.common().config()[LAST_STATE_CREATED_KEY], "false");

        net.stop().await.unwrap();
        assert!(cluster.os.has_link("eth0.100"));
        assert!(!net.common().config().contains_key(LAST_STATE_CREATED_KEY));
    }

    #[tokio::test]
    async fn test_stop_removes_created_vlan_and_resets_mtu() {
        let cluster = FakeCluster::with_links(["eth0"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("mtu", "9000")]);

        net.start().await.unwrap();
        net.stop().await.unwrap();
        assert_eq!(cluster.os.link("eth0").unwrap().mtu, Some(1500));

        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("vlan", "7")]);
        net.start().await.unwrap();
        assert!(cluster.os.has_link("eth0.7"));
        net.stop().await.unwrap();
        assert!(!cluster.os.has_link("eth0.7"));
    }

    #[tokio::test]
    async fn test_start_missing_parent() {
        let cluster = FakeCluster::default();
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth9")]);

        let err = net.start().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!net.common().is_available());
    }

    #[tokio::test]
    async fn test_failed_mtu_removes_created_vlan() {
        let cluster = FakeCluster::with_links(["eth0"]);
        cluster.os.fail_on("set_mtu");
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("vlan", "100"), ("mtu", "9000")]);

        assert!(net.start().await.is_err());
        assert!(!cluster.os.has_link("eth0.100"));
        assert!(!net.common().is_available());
    }

    #[tokio::test]
    async fn test_start_skips_bgp_when_evacuated() {
        let cluster = FakeCluster::with_links(["eth0"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(
            &cluster,
            dir.path(),
            &[
                ("parent", "eth0"),
                ("bgp.peers.core.address", "192.0.2.1"),
                ("bgp.peers.core.asn", "65000"),
            ],
        );

        net.common().state().member.set_evacuated(true);
        net.start().await.unwrap();
        assert!(cluster.bgp.peers().is_empty());

        net.restore().await.unwrap();
        assert_eq!(cluster.bgp.peers().len(), 1);

        net.evacuate().await.unwrap();
        assert!(cluster.bgp.peers().is_empty());
    }

    #[tokio::test]
    async fn test_update_parent_in_use_conflicts() {
        let cluster = FakeCluster::with_links(["eth0", "eth1"]);
        let dir = tempfile::tempdir().unwrap();
        cluster.store.insert_network(
            NetworkFixture::new("ovn", "ovn0")
                .with_config("network", "phys0")
                .build(),
        );
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0")]);

        let new = NetworkPut::new("", config_map(&[("parent", "eth1")]));
        let err = net.update(new, None, ClientType::Normal).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot update network parent interface when in use"
        );
        assert_eq!(net.common().config()["parent"], "eth0");
    }

    #[tokio::test]
    async fn test_update_mtu_reapplies() {
        let cluster = FakeCluster::with_links(["eth0"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0")]);
        net.start().await.unwrap();

        let mut config = net.common().config().clone();
        config.insert("mtu".into(), "9000".into());
        net.update(NetworkPut::new("", config), None, ClientType::Normal)
            .await
            .unwrap();

        assert_eq!(cluster.os.link("eth0").unwrap().mtu, Some(9000));
        let stored = cluster.store.network(DEFAULT_PROJECT, "phys0").unwrap();
        assert_eq!(stored.config["mtu"], "9000");
    }

    #[tokio::test]
    async fn test_failed_parent_change_restores_old_interface() {
        let cluster = FakeCluster::with_links(["eth0"]);
        let dir = tempfile::tempdir().unwrap();
        let mut net = physical(&cluster, dir.path(), &[("parent", "eth0"), ("vlan", "100")]);
        net.start().await.unwrap();
        assert!(cluster.os.has_link("eth0.100"));

        // eth1 does not exist, so bringing the new host interface up fails.
        let new = NetworkPut::new("", config_map(&[("parent", "eth1"), ("vlan", "100")]));
        let err = net.update(new, None, ClientType::Normal).await.unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(net.common().config()["parent"], "eth0");
        assert!(cluster.os.has_link("eth0.100"));
        assert!(net.common().is_available());
        let stored = cluster.store.network(DEFAULT_PROJECT, "phys0").unwrap();
        assert_eq!(stored.config["parent"], "eth0");
    }

    #[test]
    fn test_dhcp_subnet_from_gateway() {
        let cluster = FakeCluster::default();
        let dir = tempfile::tempdir().unwrap();
        let net = physical(
            &cluster,
            dir.path(),
            &[("parent", "eth0"), ("ipv4.gateway", "192.0.2.1/24")],
        );
        assert_eq!(net.dhcpv4_subnet().unwrap().to_string(), "192.0.2.0/24");
        assert!(net.dhcpv6_subnet().is_none());
    }
}
