//! Macvlan networks.
//!
//! Instances attach macvlan devices on top of `parent` (or `parent.vlan`),
//! so the network itself keeps no OS state. The helpers here are shared
//! with the SR-IOV driver, which has the same lifecycle.

use async_trait::async_trait;
use netplane_common::config::get;
use netplane_common::validate::{
    is_any, is_bool, is_interface_name, is_network_mtu, is_network_vlan, optional, required,
};
use netplane_common::{NetError, NetResult, Reverter, RuleSet};
use netplane_types::{ClientType, NetworkPut};
use tracing::{debug, instrument};

use super::common::{push_update_replay, NetworkCommon};
use super::{Info, Network};

/// Keys of networks layered on a parent interface.
pub fn validation_rules() -> RuleSet {
    RuleSet::new()
        .with("parent", required(is_interface_name))
        .with("mtu", optional(is_network_mtu))
        .with("vlan", optional(is_network_vlan))
        .with("gvrp", optional(is_bool))
        .with("maas.subnet.ipv4", is_any)
        .with("maas.subnet.ipv6", is_any)
}

/// Marks the network available once its parent interface exists.
pub(super) async fn start_on_parent(common: &NetworkCommon) -> NetResult<()> {
    common.set_unavailable();

    let parent = get(common.config(), "parent");
    if !common.state().os.interface_exists(parent).await? {
        return Err(NetError::not_found("Parent interface", parent));
    }

    common.set_available();
    Ok(())
}

/// Runs the update protocol alone, replaying the old config on failure.
pub(super) async fn update_config_only<N>(
    net: &mut N,
    mut new: NetworkPut,
    target: Option<&str>,
    client_type: ClientType,
) -> NetResult<()>
where
    N: Network + 'static,
{
    net.common().keep_local_keys(&mut new, client_type);
    let change = net.common().config_changed(&new);
    if !change.changed {
        debug!("Network config unchanged");
        return Ok(());
    }

    let mut revert: Reverter<N> = Reverter::new();
    push_update_replay(&mut revert, change.old, target.map(str::to_string), client_type);

    if let Err(e) = net.common_mut().update(new, target, client_type).await {
        revert.fail(net).await;
        return Err(e);
    }

    revert.success();
    Ok(())
}

pub struct MacvlanNetwork {
    common: NetworkCommon,
}

impl MacvlanNetwork {
    pub fn new(common: NetworkCommon) -> Self {
        Self { common }
    }

    pub(super) fn boxed(common: NetworkCommon) -> Box<dyn Network> {
        Box::new(Self::new(common))
    }
}

#[async_trait]
impl Network for MacvlanNetwork {
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

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn create(&mut self, client_type: ClientType) -> NetResult<()> {
        if client_type == ClientType::Normal {
            self.common.check_parent_use(self.common.config()).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn start(&mut self) -> NetResult<()> {
        start_on_parent(&self.common).await
    }

    async fn stop(&mut self) -> NetResult<()> {
        Ok(())
    }

    #[instrument(skip(self, new), fields(network = %self.common.name()))]
    async fn update(
        &mut self,
        new: NetworkPut,
        target: Option<&str>,
        client_type: ClientType,
    ) -> NetResult<()> {
        update_config_only(self, new, target, client_type).await
    }

    #[instrument(skip(self), fields(network = %self.common.name()))]
    async fn delete(&mut self, client_type: ClientType) -> NetResult<()> {
        self.common.delete(client_type).await
    }
}
