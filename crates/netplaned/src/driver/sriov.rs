//! SR-IOV networks.
//!
//! Same keys and lifecycle as macvlan, minus the parent exclusivity check:
//! several SR-IOV networks may share one physical function. Instance
//! devices claim VFs through [`SriovNetwork::allocate_virtual_function`].

use async_trait::async_trait;
use netplane_common::config::get;
use netplane_common::{NetResult, RuleSet};
use netplane_types::{ClientType, NetworkPut};
use std::future::Future;
use tracing::instrument;

use super::common::NetworkCommon;
use super::macvlan::{start_on_parent, update_config_only};
use super::{Info, Network};
use crate::sriov::{self, VirtualFunction};

pub fn validation_rules() -> RuleSet {
    super::macvlan::validation_rules()
}

pub struct SriovNetwork {
    common: NetworkCommon,
}

impl SriovNetwork {
    pub fn new(common: NetworkCommon) -> Self {
        Self { common }
    }

    pub(super) fn boxed(common: NetworkCommon) -> Box<dyn Network> {
        Box::new(Self::new(common))
    }

    /// Picks a free VF on the network's parent and hands it to `claim`
    /// under the allocation lock.
    #[instrument(skip(self, claim), fields(network = %self.common.name()))]
    pub async fn allocate_virtual_function<F, Fut, T>(&self, claim: F) -> NetResult<T>
    where
        F: FnOnce(VirtualFunction) -> Fut,
        Fut: Future<Output = NetResult<T>>,
    {
        let parent = get(self.common.config(), "parent");
        sriov::allocate_with(self.common.state(), parent, claim).await
    }
}

#[async_trait]
impl Network for SriovNetwork {
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

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_common::NetError;
    use netplane_test::{FakeCluster, InstanceFixture, NetworkFixture, SysfsFixture};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::state::NetworkState;

    #[tokio::test]
    async fn test_allocate_records_claim() {
        let sysfs = SysfsFixture::new().unwrap();
        sysfs.add_pf("eth0", 2, 2).unwrap();
        sysfs.add_vf("eth0", 0, "eth0v0").unwrap();
        sysfs.add_vf("eth0", 1, "eth0v1").unwrap();

        let cluster = FakeCluster::with_links(["eth0", "eth0v0", "eth0v1"]);
        let mut record = NetworkFixture::sriov("sriov0").with_config("parent", "eth0").build();
        record.id = cluster.store.insert_network(record.clone());

        let state = NetworkState::new(
            cluster.store.clone(),
            cluster.notifier.clone(),
            cluster.bgp.clone(),
            cluster.os.clone(),
        )
        .with_sysfs_net(sysfs.root())
        .with_sriov_settle(Duration::ZERO);
        let net = SriovNetwork::new(NetworkCommon::new(Arc::new(state), record));

        // Several networks may share a physical function.
        let sibling = NetworkFixture::sriov("sriov1").with_config("parent", "eth0").build();
        let mut sibling = SriovNetwork::new(NetworkCommon::new(net.common().state().clone(), sibling));
        sibling.create(ClientType::Normal).await.unwrap();

        for (instance, expected) in [("c1", "eth0v0"), ("c2", "eth0v1")] {
            let store = cluster.store.clone();
            let vf = net
                .allocate_virtual_function(|vf| async move {
                    store.add_instance(
                        InstanceFixture::new(instance)
                            .with_network_nic("eth0", "sriov0")
                            .with_config("volatile.eth0.host_name", &vf.name)
                            .build(),
                    );
                    Ok(vf)
                })
                .await
                .unwrap();
            assert_eq!(vf.name, expected);
        }

        let err = net.allocate_virtual_function(|vf| async move { Ok(vf) }).await;
        assert!(matches!(err, Err(NetError::ResourceExhausted { .. })));
    }
}
