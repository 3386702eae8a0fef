//! Bridge networks.
//!
//! A bridge is a host Linux (or Open vSwitch) bridge named after the
//! network. It owns its addresses, may enslave unconfigured external
//! interfaces and is the only driver carrying address forwards and load
//! balancers.

use async_trait::async_trait;
use futures::FutureExt;
use ipnet::IpNet;
use netplane_common::config::{get, is_true, split_list};
use netplane_common::validate::{
    is_any, is_bool, is_dns_domain, is_interface_name, is_list_of, is_network_address_cidr_v4,
    is_network_address_cidr_v6, is_network_address_v4, is_network_address_v6, is_network_mac,
    is_network_mtu, is_network_range_v4, is_network_range_v6, is_network_v4, is_network_v6,
    is_one_of, optional, RuleResult,
};
use netplane_common::{NetError, NetResult, Reverter, RuleSet};
use netplane_types::{
    ClientType, ConfigMap, ForwardPut, LoadBalancerPut, MacAddress, NetworkPut, ParseError,
};
use rand::Rng;
use std::net::IpAddr;
use tracing::{debug, info, instrument, warn};

use super::common::{parse_address, NetworkCommon};
use super::{Info, Network};
use crate::bgp;
use crate::dhcp;

const DEFAULT_MTU: u32 = 1500;
const SUBNET_ATTEMPTS: usize = 100;

/// Static keys of bridge networks.
pub fn validation_rules() -> RuleSet {
    RuleSet::new()
        .with("bridge.driver", optional(is_one_of(&["native", "openvswitch"])))
        .with("bridge.external_interfaces", optional(is_list_of(is_interface_name)))
        .with("bridge.hwaddr", optional(is_network_mac))
        .with("bridge.mtu", optional(is_network_mtu))
        .with("ipv4.address", optional(is_address_or_auto_v4))
        .with("ipv4.firewall", optional(is_bool))
        .with("ipv4.nat", optional(is_bool))
        .with("ipv4.nat.address", optional(is_network_address_v4))
        .with("ipv4.routing", optional(is_bool))
        .with("ipv4.routes", optional(is_list_of(is_network_v4)))
        .with("ipv4.dhcp", optional(is_bool))
        .with("ipv4.dhcp.gateway", optional(is_network_address_v4))
        .with("ipv4.dhcp.expiry", is_any)
        .with("ipv4.dhcp.ranges", optional(is_list_of(is_network_range_v4)))
        .with("ipv6.address", optional(is_address_or_auto_v6))
        .with("ipv6.firewall", optional(is_bool))
        .with("ipv6.nat", optional(is_bool))
        .with("ipv6.nat.address", optional(is_network_address_v6))
        .with("ipv6.routing", optional(is_bool))
        .with("ipv6.routes", optional(is_list_of(is_network_v6)))
        .with("ipv6.dhcp", optional(is_bool))
        .with("ipv6.dhcp.stateful", optional(is_bool))
        .with("ipv6.dhcp.expiry", is_any)
        .with("ipv6.dhcp.ranges", optional(is_list_of(is_network_range_v6)))
        .with("dns.domain", optional(is_dns_domain))
        .with("dns.search", is_any)
        .with("dns.mode", optional(is_one_of(&["dynamic", "managed", "none"])))
        .with("bgp.ipv4.nexthop", optional(is_network_address_v4))
        .with("bgp.ipv6.nexthop", optional(is_network_address_v6))
}

fn is_address_or_auto_v4(value: &str) -> RuleResult {
    match value {
        "none" | "auto" => Ok(()),
        _ => is_network_address_cidr_v4(value),
    }
}

fn is_address_or_auto_v6(value: &str) -> RuleResult {
    match value {
        "none" | "auto" => Ok(()),
        _ => is_network_address_cidr_v6(value),
    }
}

fn is_ovs(config: &ConfigMap) -> bool {
    get(config, "bridge.driver") == "openvswitch"
}

/// True when two subnets share any address.
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Random private gateway address, `10.x.y.1/24` or `fd42:a:b:c::1/64`.
fn random_subnet(ipv6: bool) -> String {
    let mut rng = rand::thread_rng();
    if ipv6 {
        format!(
            "fd42:{:x}:{:x}:{:x}::1/64",
            rng.gen::<u16>(),
            rng.gen::<u16>(),
            rng.gen::<u16>()
        )
    } else {
        format!("10.{}.{}.1/24", rng.gen::<u8>(), rng.gen::<u8>())
    }
}

fn parse_listen(listen_address: &str) -> NetResult<IpAddr> {
    listen_address.parse().map_err(|_| {
        NetError::invalid_config(
            "listen_address",
            format!("Invalid listen address {:?}", listen_address),
        )
    })
}

pub struct BridgeNetwork {
    common: NetworkCommon,
}

impl BridgeNetwork {
    pub fn new(common: NetworkCommon) -> Self {
        Self { common }
    }

    pub(super) fn boxed(common: NetworkCommon) -> Box<dyn Network> {
        Box::new(Self::new(common))
    }

    async fn is_running(&self) -> NetResult<bool> {
        self.common.state().os.interface_exists(self.common.name()).await
    }

    /// Picks a random subnet overlapping none configured on other networks.
    async fn unused_subnet(&self, ipv6: bool) -> NetResult<String> {
        let key = if ipv6 { "ipv6.address" } else { "ipv4.address" };
        let networks = self
            .common
            .state()
            .store
            .get_created_networks(self.common.project())
            .await?;
        let used: Vec<IpNet> = networks
            .values()
            .filter(|n| n.name != self.common.name())
            .filter_map(|n| get(&n.config, key).parse::<IpNet>().ok())
            .collect();

        for _ in 0..SUBNET_ATTEMPTS {
            let candidate = random_subnet(ipv6);
            let Ok(subnet) = candidate.parse::<IpNet>() else {
                continue;
            };
            if !used.iter().any(|u| overlaps(u, &subnet)) {
                return Ok(candidate);
            }
        }

        let family = if ipv6 { "IPv6" } else { "IPv4" };
        Err(NetError::internal(format!(
            "Failed to automatically find an unused {} subnet, manual configuration required",
            family
        )))
    }

    async fn attach_interface(&self, config: &ConfigMap, iface: &str) -> NetResult<()> {
        let os = self.common.state().os.as_ref();
        if is_ovs(config) {
            os.ovs_port_add(self.common.name(), iface).await
        } else {
            os.set_master(iface, self.common.name()).await
        }
    }

    async fn detach_interface(&self, config: &ConfigMap, iface: &str) -> NetResult<()> {
        let os = self.common.state().os.as_ref();
        if is_ovs(config) {
            os.ovs_port_delete(self.common.name(), iface).await
        } else {
            os.set_nomaster(iface).await
        }
    }

    /// Creates the bridge if missing and applies the current config to it.
    /// A bridge created here is removed again on failure.
    async fn setup(&mut self, old_config: Option<ConfigMap>) -> NetResult<()> {
        let state = self.common.state().clone();
        let config = self.common.config().clone();
        let name = self.common.name().to_string();

        self.common.ensure_network_dir().await?;

        let mut revert: Reverter<Self> = Reverter::new();
        if !self.is_running().await? {
            if is_ovs(&config) {
                if !state.ovs_enabled {
                    return Err(NetError::internal(
                        "Open vSwitch isn't installed on this system",
                    ));
                }
                state.os.ovs_bridge_add(&name).await?;
            } else {
                state.os.bridge_add(&name).await?;
            }
            debug!(bridge = %name, "Created bridge");

            let os = state.os.clone();
            let ovs = is_ovs(&config);
            let bridge = name.clone();
            revert.add_detached(move || async move {
                let _ = if ovs {
                    os.ovs_bridge_delete(&bridge).await
                } else {
                    os.interface_remove(&bridge).await
                };
            });
        }

        if let Err(e) = self.apply(&config, old_config.as_ref()).await {
            revert.fail(self).await;
            return Err(e);
        }

        revert.success();
        Ok(())
    }

    async fn apply(&self, config: &ConfigMap, old_config: Option<&ConfigMap>) -> NetResult<()> {
        let state = self.common.state();
        let os = state.os.as_ref();
        let name = self.common.name();

        let mtu = match get(config, "bridge.mtu") {
            "" => DEFAULT_MTU,
            value => value.parse().map_err(|_| {
                NetError::invalid_config("bridge.mtu", format!("Invalid MTU {:?}", value))
            })?,
        };
        os.set_mtu(name, mtu)
            .await
            .map_err(|e| e.context(format!("Failed setting MTU {} on {:?}", mtu, name)))?;

        let hwaddr = get(config, "bridge.hwaddr");
        if !hwaddr.is_empty() {
            let mac: MacAddress = hwaddr
                .parse()
                .map_err(|e: ParseError| NetError::invalid_config("bridge.hwaddr", e.to_string()))?;
            os.set_address(name, &mac).await?;
        }

        os.set_up(name).await?;

        for iface in split_list(get(config, "bridge.external_interfaces")) {
            if !os.interface_exists(&iface).await? {
                warn!(interface = %iface, "Skipping missing external interface");
                continue;
            }

            if os.link_status(&iface).await?.has_global_unicast() {
                return Err(NetError::invalid_config(
                    "bridge.external_interfaces",
                    format!(
                        "Only unconfigured network interfaces can be bridged, {:?} has addresses",
                        iface
                    ),
                ));
            }

            self.attach_interface(config, &iface)
                .await
                .map_err(|e| e.context(format!("Failed attaching {:?}", iface)))?;
        }

        os.addr_flush(name).await?;
        for key in ["ipv4.address", "ipv6.address"] {
            let value = get(config, key);
            if value.is_empty() || value == "none" {
                continue;
            }
            let address = parse_address(key, value)?;
            os.addr_add(name, &address).await?;
        }

        if !state.member.is_evacuated() {
            self.common.bgp_setup(old_config).await?;
            self.common
                .load_balancer_bgp_setup_prefixes()
                .await
                .map_err(|e| e.context("Failed applying BGP prefixes for load balancers"))?;
        }
        Ok(())
    }

    /// Fails if a forward or load balancer already listens on `listen`.
    async fn check_listen_free(&self, listen: &str) -> NetResult<()> {
        let store = &self.common.state().store;
        if store.get_network_forward(self.common.id(), listen).await.is_ok() {
            return Err(NetError::conflict(format!(
                "A forward for {:?} already exists",
                listen
            )));
        }
        if store
            .get_network_load_balancer(self.common.id(), listen)
            .await
            .is_ok()
        {
            return Err(NetError::conflict(format!(
                "A load balancer for {:?} already exists",
                listen
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Network for BridgeNetwork {
    fn common(&self) -> &NetworkCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut NetworkCommon {
        &mut self.common
    }

    fn info(&self) -> Info {
        Info {
            node_specific_config: true,
            address_forwards: true,
            load_balancers: true,
            ..Default::default()
        }
    }

    fn validation_rules(&self) -> RuleSet {
        validation_rules()
    }

    fn validate(&self, config: &ConfigMap) -> NetResult<()> {
        self.common.validate(config, validation_rules(), true)
    }

    /// Defaults to an automatic NATed IPv4 subnet and resolves `auto`
    /// addresses to random unused subnets.
    async fn fill_config(&self, config: &mut ConfigMap) -> NetResult<()> {
        if get(config, "ipv4.address").is_empty() {
            config.insert("ipv4.address".into(), "auto".into());
        }

        for (ipv6, version) in [(false, 4), (true, 6)] {
            let key = format!("ipv{}.address", version);
            if get(config, &key) != "auto" {
                continue;
            }

            let nat = format!("ipv{}.nat", version);
            if get(config, &nat).is_empty() {
                config.insert(nat, "true".into());
            }
            config.insert(key, self.unused_subnet(ipv6).await?);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn create(&mut self, _client_type: ClientType) -> NetResult<()> {
        if self.is_running().await? {
            return Err(NetError::conflict(format!(
                "Network interface {:?} already exists",
                self.common.name()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn start(&mut self) -> NetResult<()> {
        self.common.set_unavailable();
        self.setup(None).await?;
        self.common.set_available();
        info!("Started bridge network");
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn stop(&mut self) -> NetResult<()> {
        let state = self.common.state().clone();
        let config = self.common.config().clone();
        let name = self.common.name().to_string();

        self.common.bgp_clear(&config).await?;
        state
            .bgp
            .remove_prefix_by_owner(&bgp::load_balancer_owner(self.common.id()))
            .await?;

        if !self.is_running().await? {
            return Ok(());
        }

        if is_ovs(&config) {
            state.os.ovs_bridge_delete(&name).await?;
        } else {
            state.os.interface_remove(&name).await?;
        }

        info!("Stopped bridge network");
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
        self.fill_config(&mut new.config).await?;

        let change = self.common.config_changed(&new);
        if !change.changed {
            return Ok(());
        }

        if self.common.is_pending() {
            return self.common.update(new, target, client_type).await;
        }

        // Replay the old config, then rebuild the bridge from it.
        let mut revert: Reverter<Self> = Reverter::new();
        let old = change.old.clone();
        let replay_target = target.map(str::to_string);
        let new_config = new.config.clone();
        revert.add(move |net: &mut Self| {
            async move {
                if let Err(e) = net
                    .common
                    .update(old, replay_target.as_deref(), client_type)
                    .await
                {
                    warn!(error = %e, "Failed restoring previous network config");
                }
                if let Err(e) = net.setup(Some(new_config)).await {
                    warn!(error = %e, "Failed restoring previous bridge setup");
                }
            }
            .boxed()
        });

        let changed = |key: &str| change.keys.iter().any(|k| k == key);

        let running = self.is_running().await?;
        if running && changed("bridge.driver") {
            if let Err(e) = self.stop().await {
                revert.fail(self).await;
                return Err(e);
            }
        } else if running && changed("bridge.external_interfaces") {
            let old_config = &change.old.config;
            let kept = split_list(get(&new.config, "bridge.external_interfaces"));
            for iface in split_list(get(old_config, "bridge.external_interfaces")) {
                if kept.contains(&iface) {
                    continue;
                }
                if !self.common.state().os.interface_exists(&iface).await? {
                    continue;
                }
                if let Err(e) = self.detach_interface(old_config, &iface).await {
                    revert.fail(self).await;
                    return Err(e.context(format!("Failed detaching {:?}", iface)));
                }
            }
        }

        if let Err(e) = self.common.update(new, target, client_type).await {
            revert.fail(self).await;
            return Err(e);
        }

        if !change.keys.is_empty() {
            if let Err(e) = self.setup(Some(change.old.config.clone())).await {
                revert.fail(self).await;
                return Err(e);
            }
        }
        revert.success();

        if client_type == ClientType::Normal && !change.keys.is_empty() {
            self.common.notify_dependent_networks(&change.keys).await;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn rename(&mut self, new_name: &str) -> NetResult<()> {
        if self.common.state().os.interface_exists(new_name).await? {
            return Err(NetError::conflict(format!(
                "Network interface {:?} already exists",
                new_name
            )));
        }

        let running = self.is_running().await?;
        if running {
            self.stop().await?;
        }

        self.common.rename(new_name).await?;

        if running {
            self.start().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn delete(&mut self, client_type: ClientType) -> NetResult<()> {
        if self.is_running().await? {
            self.stop().await?;
        }
        self.common.delete(client_type).await
    }

    async fn evacuate(&mut self) -> NetResult<()> {
        let config = self.common.config().clone();
        self.common.bgp_clear(&config).await?;
        self.common
            .state()
            .bgp
            .remove_prefix_by_owner(&bgp::load_balancer_owner(self.common.id()))
            .await
    }

    async fn restore(&mut self) -> NetResult<()> {
        self.common.bgp_setup(None).await?;
        self.common.load_balancer_bgp_setup_prefixes().await
    }

    fn dhcpv4_subnet(&self) -> Option<IpNet> {
        let config = self.common.config();
        let dhcp = get(config, "ipv4.dhcp");
        if !dhcp.is_empty() && !is_true(dhcp) {
            return None;
        }
        dhcp::subnet_of(get(config, "ipv4.address"))
    }

    fn dhcpv6_subnet(&self) -> Option<IpNet> {
        let config = self.common.config();
        let dhcp = get(config, "ipv6.dhcp");
        if !dhcp.is_empty() && !is_true(dhcp) {
            return None;
        }
        dhcp::subnet_of(get(config, "ipv6.address"))
    }

    #[instrument(skip(self, forward), fields(network = %self.common.name()))]
    async fn forward_create(
        &mut self,
        listen_address: &str,
        forward: ForwardPut,
        client_type: ClientType,
    ) -> NetResult<IpAddr> {
        let listen = parse_listen(listen_address)?;
        let listen_str = listen.to_string();
        let state = self.common.state().clone();
        let id = self.common.id();

        let mut revert: Reverter<Self> = Reverter::new();
        if client_type == ClientType::Normal {
            self.common.forward_validate(listen, &forward)?;
            self.check_listen_free(&listen_str).await?;
            state.store.create_network_forward(id, &listen_str, &forward).await?;

            let store = state.store.clone();
            let listen_str = listen_str.clone();
            revert.add_detached(move || async move {
                let _ = store.delete_network_forward(id, &listen_str).await;
            });
        }

        if let Err(e) = self.common.forward_bgp_setup_prefixes().await {
            revert.fail(self).await;
            return Err(e.context("Failed applying BGP prefixes for address forwards"));
        }

        revert.success();
        info!(listen_address = %listen_str, "Created address forward");
        Ok(listen)
    }

    #[instrument(skip(self, forward), fields(network = %self.common.name()))]
    async fn forward_update(
        &mut self,
        listen_address: &str,
        forward: ForwardPut,
        client_type: ClientType,
    ) -> NetResult<()> {
        let listen = parse_listen(listen_address)?;
        let listen_str = listen.to_string();

        if client_type == ClientType::Normal {
            let store = &self.common.state().store;
            store.get_network_forward(self.common.id(), &listen_str).await?;
            self.common.forward_validate(listen, &forward)?;
            store
                .update_network_forward(self.common.id(), &listen_str, &forward)
                .await?;
        }

        self.common
            .forward_bgp_setup_prefixes()
            .await
            .map_err(|e| e.context("Failed applying BGP prefixes for address forwards"))
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn forward_delete(&mut self, listen_address: &str, client_type: ClientType) -> NetResult<()> {
        let listen = parse_listen(listen_address)?.to_string();

        if client_type == ClientType::Normal {
            self.common
                .state()
                .store
                .delete_network_forward(self.common.id(), &listen)
                .await?;
        }

        self.common
            .forward_bgp_setup_prefixes()
            .await
            .map_err(|e| e.context("Failed applying BGP prefixes for address forwards"))?;
        info!(listen_address = %listen, "Deleted address forward");
        Ok(())
    }

    #[instrument(skip(self, lb), fields(network = %self.common.name()))]
    async fn load_balancer_create(
        &mut self,
        listen_address: &str,
        lb: LoadBalancerPut,
        client_type: ClientType,
    ) -> NetResult<IpAddr> {
        let listen = parse_listen(listen_address)?;
        let listen_str = listen.to_string();
        let state = self.common.state().clone();
        let id = self.common.id();

        let mut revert: Reverter<Self> = Reverter::new();
        if client_type == ClientType::Normal {
            self.common.load_balancer_validate(listen, &lb)?;
            self.check_listen_free(&listen_str).await?;
            state
                .store
                .create_network_load_balancer(id, &listen_str, &lb)
                .await?;

            let store = state.store.clone();
            let listen_str = listen_str.clone();
            revert.add_detached(move || async move {
                let _ = store.delete_network_load_balancer(id, &listen_str).await;
            });
        }

        if let Err(e) = self.common.load_balancer_bgp_setup_prefixes().await {
            revert.fail(self).await;
            return Err(e.context("Failed applying BGP prefixes for load balancers"));
        }

        revert.success();
        info!(listen_address = %listen_str, "Created load balancer");
        Ok(listen)
    }

    #[instrument(skip(self, lb), fields(network = %self.common.name()))]
    async fn load_balancer_update(
        &mut self,
        listen_address: &str,
        lb: LoadBalancerPut,
        client_type: ClientType,
    ) -> NetResult<()> {
        let listen = parse_listen(listen_address)?;
        let listen_str = listen.to_string();

        if client_type == ClientType::Normal {
            let store = &self.common.state().store;
            store
                .get_network_load_balancer(self.common.id(), &listen_str)
                .await?;
            self.common.load_balancer_validate(listen, &lb)?;
            store
                .update_network_load_balancer(self.common.id(), &listen_str, &lb)
                .await?;
        }

        self.common
            .load_balancer_bgp_setup_prefixes()
            .await
            .map_err(|e| e.context("Failed applying BGP prefixes for load balancers"))
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn load_balancer_delete(
        &mut self,
        listen_address: &str,
        client_type: ClientType,
    ) -> NetResult<()> {
        let listen = parse_listen(listen_address)?.to_string();

        if client_type == ClientType::Normal {
            self.common
                .state()
                .store
                .delete_network_load_balancer(self.common.id(), &listen)
                .await?;
        }

        self.common
            .load_balancer_bgp_setup_prefixes()
            .await
            .map_err(|e| e.context("Failed applying BGP prefixes for load balancers"))?;
        info!(listen_address = %listen, "Deleted load balancer");
        Ok(())
    }
}
