//! State and behavior shared by every driver.

use futures::FutureExt;
use ipnet::IpNet;
use netplane_common::config::{
    get, is_user_key, merge_node_specific, strip_node_specific, LAST_STATE_CREATED_KEY,
};
use netplane_common::{notify_all, MemberClient, NetError, NetResult, Reverter, RuleSet};
use netplane_types::{
    ClientType, ConfigMap, ForwardPut, InstanceFilter, InstanceRecord, LoadBalancerPut,
    NetworkPut, NetworkRecord, NetworkStatus, VlanId, DEFAULT_PROJECT,
};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::Network;
use crate::bgp;
use crate::portspec::{self, LoadBalancerPortMap, PortMap};
use crate::state::NetworkState;

/// Outcome of [`NetworkCommon::config_changed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub changed: bool,
    /// Changed keys other than `user.*`, sorted.
    pub keys: Vec<String>,
    /// Description and config before the change.
    pub old: NetworkPut,
}

/// Runs the merged static and BGP peer rules over `config`.
pub(crate) fn validate_network_config(
    name: &str,
    config: &ConfigMap,
    mut rules: RuleSet,
    bgp_peers: bool,
) -> NetResult<()> {
    if bgp_peers {
        rules.merge(bgp::validation_rules(config)?);
    }
    rules.validate("network", name, config)
}

/// The record of a network plus handles to the daemon state.
pub struct NetworkCommon {
    state: Arc<NetworkState>,
    record: NetworkRecord,
}

impl NetworkCommon {
    pub fn new(state: Arc<NetworkState>, record: NetworkRecord) -> Self {
        Self { state, record }
    }

    pub fn state(&self) -> &Arc<NetworkState> {
        &self.state
    }

    pub fn record(&self) -> &NetworkRecord {
        &self.record
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn project(&self) -> &str {
        &self.record.project
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn net_type(&self) -> &str {
        &self.record.net_type
    }

    pub fn description(&self) -> &str {
        &self.record.description
    }

    pub fn config(&self) -> &ConfigMap {
        &self.record.config
    }

    pub fn status(&self) -> NetworkStatus {
        self.record.status
    }

    /// Status of the network on the local member.
    pub fn local_status(&self) -> NetworkStatus {
        self.record.member_status(self.state.member.id)
    }

    /// True while the network, or its setup on this member, is pending.
    pub fn is_pending(&self) -> bool {
        self.record.status == NetworkStatus::Pending || self.local_status() == NetworkStatus::Pending
    }

    pub fn validate(&self, config: &ConfigMap, rules: RuleSet, bgp_peers: bool) -> NetResult<()> {
        validate_network_config(self.name(), config, rules, bgp_peers)
    }

    /// Replaces the in-memory description and config only.
    pub(crate) fn apply_local(&mut self, put: NetworkPut) {
        self.record.description = put.description;
        self.record.config = put.config;
    }

    /// Keeps this member's node-specific keys in an update relayed by
    /// another member, which never carries them.
    pub fn keep_local_keys(&self, new: &mut NetworkPut, client_type: ClientType) {
        if client_type == ClientType::Notifier {
            merge_node_specific(&self.record.config, &mut new.config);
        }
    }

    /// Diffs `new` against the in-memory record.
    pub fn config_changed(&self, new: &NetworkPut) -> ConfigChange {
        let old_config = &self.record.config;
        let mut changed = self.record.description != new.description;
        let mut keys = BTreeSet::new();

        let differs = |key: &String, value: &String, other: &ConfigMap| other.get(key) != Some(value);
        let both = old_config
            .iter()
            .filter(|(k, v)| differs(k, v, &new.config))
            .chain(new.config.iter().filter(|(k, v)| differs(k, v, old_config)));

        for (key, _) in both {
            changed = true;
            if !is_user_key(key) {
                keys.insert(key.clone());
            }
        }

        ConfigChange {
            changed,
            keys: keys.into_iter().collect(),
            old: self.record.put(),
        }
    }

    /// Applies `new` locally, relays it to the other members and stores it.
    ///
    /// The in-memory record changes first. A `Notifier` call stops there.
    /// Without a target member, every other member receives `new` minus
    /// its node-specific keys before the store write.
    #[instrument(skip(self, new), fields(project = %self.record.project, network = %self.record.name))]
    pub async fn update(
        &mut self,
        new: NetworkPut,
        target: Option<&str>,
        client_type: ClientType,
    ) -> NetResult<()> {
        self.record.description = new.description.clone();
        self.record.config = new.config.clone();

        if client_type == ClientType::Notifier {
            debug!("Applied relayed network update");
            return Ok(());
        }

        let project = self.record.project.clone();
        let name = self.record.name.clone();

        if target.is_none() {
            let relayed = NetworkPut {
                description: new.description.clone(),
                config: strip_node_specific(&new.config),
            };
            let (project, name, relayed) = (&project, &name, &relayed);
            notify_all(self.state.notifier.as_ref(), |client: Arc<dyn MemberClient>| async move {
                client.update_network(project, name, relayed).await
            })
            .await?;
        }

        self.state.store.update_network(&project, &name, &new).await?;
        debug!("Stored network update");
        Ok(())
    }

    /// Renames the state directory and the store record.
    #[instrument(skip(self), fields(project = %self.record.project, network = %self.record.name))]
    pub async fn rename(&mut self, new_name: &str) -> NetResult<()> {
        let old_dir = self.state.network_dir(&self.record.name);
        let new_dir = self.state.network_dir(new_name);

        if path_exists(&new_dir).await? {
            if let Err(e) = tokio::fs::remove_dir_all(&new_dir).await {
                warn!(path = %new_dir.display(), error = %e, "Failed removing stale network directory");
            }
        }

        if path_exists(&old_dir).await? {
            tokio::fs::rename(&old_dir, &new_dir)
                .await
                .map_err(|e| NetError::io(old_dir.display().to_string(), e))?;
        }

        self.state
            .store
            .rename_network(&self.record.project, &self.record.name, new_name)
            .await?;

        let old_name = std::mem::replace(&mut self.record.name, new_name.to_string());
        self.state
            .availability
            .set_available(&self.record.project, &old_name);
        info!(new_name = %new_name, "Renamed network");
        Ok(())
    }

    /// Removes the state directory, the store record (for `Normal`
    /// requests) and the member-local availability entry.
    #[instrument(skip(self), fields(project = %self.record.project, network = %self.record.name))]
    pub async fn delete(&mut self, client_type: ClientType) -> NetResult<()> {
        let dir = self.state.network_dir(&self.record.name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(NetError::io(dir.display().to_string(), e)),
        }

        if client_type == ClientType::Normal {
            match self
                .state
                .store
                .delete_network(&self.record.project, &self.record.name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Network record already absent"),
                Err(e) => return Err(e),
            }
        }

        self.state
            .availability
            .remove(&self.record.project, &self.record.name);
        info!("Deleted network");
        Ok(())
    }

    /// Creates the network's state directory if missing.
    pub async fn ensure_network_dir(&self) -> NetResult<()> {
        let dir = self.state.network_dir(&self.record.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| NetError::io(dir.display().to_string(), e))
    }

    pub fn set_available(&self) {
        self.state
            .availability
            .set_available(&self.record.project, &self.record.name);
    }

    pub fn set_unavailable(&self) {
        self.state
            .availability
            .set_unavailable(&self.record.project, &self.record.name);
    }

    pub fn is_available(&self) -> bool {
        self.state
            .availability
            .is_available(&self.record.project, &self.record.name)
    }

    /// Names of created default-project networks whose `network` key
    /// points at this one.
    async fn dependent_networks(&self) -> NetResult<Vec<String>> {
        if self.record.project != DEFAULT_PROJECT {
            return Ok(Vec::new());
        }

        let networks = self.state.store.get_created_networks(DEFAULT_PROJECT).await?;
        let mut names: Vec<String> = networks
            .values()
            .filter(|n| n.name != self.record.name && get(&n.config, "network") == self.record.name)
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Hands `changed_keys` to every network using this one as uplink.
    /// Failures are logged and never returned.
    pub async fn notify_dependent_networks(&self, changed_keys: &[String]) {
        let names = match self.dependent_networks().await {
            Ok(names) => names,
            Err(e) => {
                warn!(network = %self.record.name, error = %e, "Failed listing dependent networks");
                return;
            }
        };

        for dependent in names {
            let mut net = match super::load_by_name(&self.state, DEFAULT_PROJECT, &dependent).await {
                Ok(net) => net,
                Err(e) => {
                    warn!(dependent = %dependent, error = %e, "Failed loading dependent network");
                    continue;
                }
            };

            debug!(dependent = %dependent, "Notifying dependent network");
            if let Err(e) = net
                .handle_dependency_change(&self.record.name, changed_keys)
                .await
            {
                warn!(dependent = %dependent, error = %e, "Failed notifying dependent network");
            }
        }
    }

    /// True when an instance NIC or another network uses this network.
    pub async fn is_used(&self) -> NetResult<bool> {
        let mut used = false;
        let name = self.record.name.clone();
        let project = self.record.project.clone();

        self.state
            .store
            .instance_list(&InstanceFilter::default(), &mut |instance: &InstanceRecord| {
                if project != DEFAULT_PROJECT && instance.project != project {
                    return Ok(());
                }
                used |= instance.expanded_devices().values().any(|device| {
                    get(device, "type") == "nic" && get(device, "network") == name
                });
                Ok(())
            })
            .await?;

        if used {
            return Ok(true);
        }
        Ok(!self.dependent_networks().await?.is_empty())
    }

    /// Fails if another created default-project network claims the same
    /// parent with an overlapping VLAN scope. An empty VLAN overlaps all.
    pub async fn check_parent_use(&self, config: &ConfigMap) -> NetResult<()> {
        let parent = get(config, "parent");
        let vlan = get(config, "vlan");

        let networks = self.state.store.get_created_networks(DEFAULT_PROJECT).await?;
        for network in networks.values() {
            if self.record.project == DEFAULT_PROJECT && network.name == self.record.name {
                continue;
            }

            if get(&network.config, "parent") != parent {
                continue;
            }

            let other_vlan = get(&network.config, "vlan");
            if vlan.is_empty() || other_vlan.is_empty() || vlan == other_vlan {
                return Err(NetError::conflict(format!(
                    "Parent interface {:?} in use by another network",
                    parent
                )));
            }
        }
        Ok(())
    }

    /// Creates `parent.vlan` if missing. Returns true if it was created.
    pub async fn ensure_vlan_interface(
        &self,
        parent: &str,
        vlan: VlanId,
        gvrp: bool,
    ) -> NetResult<bool> {
        let name = vlan_interface_name(parent, vlan);
        let os = self.state.os.as_ref();
        if os.interface_exists(&name).await? {
            return Ok(false);
        }

        os.set_up(parent).await?;
        os.vlan_interface_create(parent, &name, vlan, gvrp).await?;
        os.set_up(&name).await?;
        Ok(true)
    }

    /// Sets up BGP peers and every prefix scope the network exports.
    pub async fn bgp_setup(&self, old_config: Option<&ConfigMap>) -> NetResult<()> {
        let speaker = self.state.bgp.as_ref();

        bgp::setup_peers(speaker, old_config, self.config())
            .await
            .map_err(|e| e.context("Failed setting up BGP peers"))?;

        bgp::setup_prefixes(speaker, self.id(), self.config())
            .await
            .map_err(|e| e.context("Failed setting up BGP prefixes"))?;

        self.forward_bgp_setup_prefixes()
            .await
            .map_err(|e| e.context("Failed applying BGP prefixes for address forwards"))?;
        Ok(())
    }

    pub async fn bgp_clear(&self, config: &ConfigMap) -> NetResult<()> {
        bgp::clear(self.state.bgp.as_ref(), self.id(), config).await
    }

    /// Re-exports the listen addresses of every forward of this network.
    pub async fn forward_bgp_setup_prefixes(&self) -> NetResult<()> {
        let addresses = self
            .state
            .store
            .get_network_forward_listen_addresses(self.id())
            .await?;
        bgp::export_listen_addresses(
            self.state.bgp.as_ref(),
            &bgp::forward_owner(self.id()),
            self.config(),
            addresses.values(),
        )
        .await
    }

    /// Re-exports the listen addresses of every load balancer of this network.
    pub async fn load_balancer_bgp_setup_prefixes(&self) -> NetResult<()> {
        let addresses = self
            .state
            .store
            .get_network_load_balancer_listen_addresses(self.id())
            .await?;
        bgp::export_listen_addresses(
            self.state.bgp.as_ref(),
            &bgp::load_balancer_owner(self.id()),
            self.config(),
            addresses.values(),
        )
        .await
    }

    /// Configured subnet of the network for the family of `listen`.
    pub fn subnet_for(&self, listen: &IpAddr) -> Option<IpNet> {
        let key = if listen.is_ipv6() { "ipv6.address" } else { "ipv4.address" };
        get(self.config(), key).parse::<IpNet>().ok().map(|n| n.trunc())
    }

    pub fn forward_validate(&self, listen: IpAddr, forward: &ForwardPut) -> NetResult<Vec<PortMap>> {
        portspec::forward_validate(listen, self.subnet_for(&listen), forward)
    }

    pub fn load_balancer_validate(
        &self,
        listen: IpAddr,
        lb: &LoadBalancerPut,
    ) -> NetResult<Vec<LoadBalancerPortMap>> {
        portspec::load_balancer_validate(listen, self.subnet_for(&listen), lb)
    }

    /// True if `volatile.last_state.created` records a created interface.
    pub fn created_interface(&self) -> bool {
        netplane_common::config::is_true(get(self.config(), LAST_STATE_CREATED_KEY))
    }
}

/// Pushes an undo step that re-applies `old` through the update protocol.
pub(crate) fn push_update_replay<N>(
    revert: &mut Reverter<N>,
    old: NetworkPut,
    target: Option<String>,
    client_type: ClientType,
) where
    N: Network + 'static,
{
    revert.add(move |net: &mut N| {
        async move {
            if let Err(e) = net
                .common_mut()
                .update(old, target.as_deref(), client_type)
                .await
            {
                warn!(error = %e, "Failed restoring previous network config");
            }
        }
        .boxed()
    });
}

/// Host name of a VLAN sub-interface.
pub fn vlan_interface_name(parent: &str, vlan: VlanId) -> String {
    format!("{}.{}", parent, vlan)
}

/// Parses an `address/prefix` config value.
pub(crate) fn parse_address(key: &str, value: &str) -> NetResult<IpNet> {
    value
        .parse()
        .map_err(|_| NetError::invalid_config(key, format!("Invalid address {:?}", value)))
}

async fn path_exists(path: &Path) -> NetResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| NetError::io(path.display().to_string(), e))
}
