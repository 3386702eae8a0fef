//! Cluster store contract.
//!
//! The store owns the authoritative network, instance, forward and load
//! balancer records. Every method is one transaction; implementations
//! serialize writers.

use async_trait::async_trait;
use netplane_types::{
    ForwardPut, InstanceFilter, InstanceRecord, LoadBalancerPut, NetworkForward,
    NetworkLoadBalancer, NetworkPut, NetworkRecord,
};
use std::collections::HashMap;

use crate::error::NetResult;

/// Callback invoked for every instance matched by [`ClusterStore::instance_list`].
pub type InstanceCallback<'a> = dyn FnMut(&InstanceRecord) -> NetResult<()> + Send + 'a;

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Loads a network. Fails with `NotFound` when absent.
    async fn get_network(&self, project: &str, name: &str) -> NetResult<NetworkRecord>;

    /// Creates a network in `Pending` state and returns its ID.
    async fn create_network(
        &self,
        project: &str,
        name: &str,
        net_type: &str,
        put: &NetworkPut,
    ) -> NetResult<i64>;

    /// Replaces description and config of a network.
    async fn update_network(&self, project: &str, name: &str, put: &NetworkPut) -> NetResult<()>;

    async fn rename_network(&self, project: &str, name: &str, new_name: &str) -> NetResult<()>;

    /// Deletes a network. Fails with `NotFound` when absent.
    async fn delete_network(&self, project: &str, name: &str) -> NetResult<()>;

    /// Networks of `project` whose status is `Created`, keyed by name.
    async fn get_created_networks(&self, project: &str)
        -> NetResult<HashMap<String, NetworkRecord>>;

    /// `Created` networks of every project, keyed by project then name.
    async fn get_all_created_networks(
        &self,
    ) -> NetResult<HashMap<String, HashMap<String, NetworkRecord>>>;

    /// Calls `f` for every instance matched by `filter`, stopping on the
    /// first error.
    async fn instance_list(
        &self,
        filter: &InstanceFilter,
        f: &mut InstanceCallback<'_>,
    ) -> NetResult<()>;

    async fn get_network_forwards(&self, network_id: i64) -> NetResult<Vec<NetworkForward>>;

    async fn get_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<NetworkForward>;

    async fn create_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &ForwardPut,
    ) -> NetResult<i64>;

    async fn update_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &ForwardPut,
    ) -> NetResult<()>;

    async fn delete_network_forward(&self, network_id: i64, listen_address: &str) -> NetResult<()>;

    /// Listen addresses of the network's forwards keyed by forward ID.
    async fn get_network_forward_listen_addresses(
        &self,
        network_id: i64,
    ) -> NetResult<HashMap<i64, String>>;

    async fn get_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<NetworkLoadBalancer>;

    async fn create_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &LoadBalancerPut,
    ) -> NetResult<i64>;

    async fn update_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &LoadBalancerPut,
    ) -> NetResult<()>;

    async fn delete_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<()>;

    /// Listen addresses of the network's load balancers keyed by ID.
    async fn get_network_load_balancer_listen_addresses(
        &self,
        network_id: i64,
    ) -> NetResult<HashMap<i64, String>>;
}
