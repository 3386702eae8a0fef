//! In-memory cluster store

use async_trait::async_trait;
use netplane_common::{ClusterStore, InstanceCallback, NetError, NetResult};
use netplane_types::{
    ForwardPut, InstanceFilter, InstanceRecord, LoadBalancerPut, NetworkForward,
    NetworkLoadBalancer, NetworkPut, NetworkRecord, NetworkStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct StoreInner {
    next_id: i64,
    networks: BTreeMap<(String, String), NetworkRecord>,
    instances: Vec<InstanceRecord>,
    forwards: BTreeMap<(i64, String), NetworkForward>,
    load_balancers: BTreeMap<(i64, String), NetworkLoadBalancer>,
    update_calls: usize,
    fail_updates: Option<String>,
}

impl StoreInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`ClusterStore`] over plain maps, one mutex per store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) a network record, assigning an ID if it has none.
    pub fn insert_network(&self, mut record: NetworkRecord) -> i64 {
        let mut inner = self.inner.lock();
        if record.id == 0 {
            record.id = inner.next_id();
        } else if record.id > inner.next_id {
            inner.next_id = record.id;
        }
        let id = record.id;
        inner
            .networks
            .insert((record.project.clone(), record.name.clone()), record);
        id
    }

    pub fn network(&self, project: &str, name: &str) -> Option<NetworkRecord> {
        self.inner
            .lock()
            .networks
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_status(&self, project: &str, name: &str, status: NetworkStatus) {
        if let Some(record) = self
            .inner
            .lock()
            .networks
            .get_mut(&(project.to_string(), name.to_string()))
        {
            record.status = status;
        }
    }

    pub fn add_instance(&self, instance: InstanceRecord) {
        self.inner.lock().instances.push(instance);
    }

    /// Makes every following `update_network` fail with a backing store error.
    pub fn fail_updates(&self, message: impl Into<String>) {
        self.inner.lock().fail_updates = Some(message.into());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().fail_updates = None;
    }

    /// Number of `update_network` calls, failed ones included.
    pub fn update_count(&self) -> usize {
        self.inner.lock().update_calls
    }

    pub fn forward(&self, network_id: i64, listen_address: &str) -> Option<NetworkForward> {
        self.inner
            .lock()
            .forwards
            .get(&(network_id, listen_address.to_string()))
            .cloned()
    }
}

fn network_key(project: &str, name: &str) -> (String, String) {
    (project.to_string(), name.to_string())
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_network(&self, project: &str, name: &str) -> NetResult<NetworkRecord> {
        self.network(project, name)
            .ok_or_else(|| NetError::not_found("Network", name))
    }

    async fn create_network(
        &self,
        project: &str,
        name: &str,
        net_type: &str,
        put: &NetworkPut,
    ) -> NetResult<i64> {
        let mut inner = self.inner.lock();
        let key = network_key(project, name);
        if inner.networks.contains_key(&key) {
            return Err(NetError::conflict(format!(
                "Network {:?} already exists",
                name
            )));
        }
        let id = inner.next_id();
        inner.networks.insert(
            key,
            NetworkRecord {
                id,
                project: project.to_string(),
                name: name.to_string(),
                net_type: net_type.to_string(),
                description: put.description.clone(),
                config: put.config.clone(),
                status: NetworkStatus::Pending,
                managed: true,
                member_status: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn update_network(&self, project: &str, name: &str, put: &NetworkPut) -> NetResult<()> {
        let mut inner = self.inner.lock();
        inner.update_calls += 1;
        if let Some(message) = &inner.fail_updates {
            return Err(NetError::store("update_network", message.clone()));
        }
        let record = inner
            .networks
            .get_mut(&network_key(project, name))
            .ok_or_else(|| NetError::not_found("Network", name))?;
        record.description = put.description.clone();
        record.config = put.config.clone();
        Ok(())
    }

    async fn rename_network(&self, project: &str, name: &str, new_name: &str) -> NetResult<()> {
        let mut inner = self.inner.lock();
        if inner.networks.contains_key(&network_key(project, new_name)) {
            return Err(NetError::conflict(format!(
                "Network {:?} already exists",
                new_name
            )));
        }
        let mut record = inner
            .networks
            .remove(&network_key(project, name))
            .ok_or_else(|| NetError::not_found("Network", name))?;
        record.name = new_name.to_string();
        inner.networks.insert(network_key(project, new_name), record);
        Ok(())
    }

    async fn delete_network(&self, project: &str, name: &str) -> NetResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .networks
            .remove(&network_key(project, name))
            .ok_or_else(|| NetError::not_found("Network", name))?;
        inner.forwards.retain(|(id, _), _| *id != record.id);
        inner.load_balancers.retain(|(id, _), _| *id != record.id);
        Ok(())
    }

    async fn get_created_networks(
        &self,
        project: &str,
    ) -> NetResult<HashMap<String, NetworkRecord>> {
        Ok(self
            .inner
            .lock()
            .networks
            .values()
            .filter(|r| r.project == project && r.status == NetworkStatus::Created)
            .map(|r| (r.name.clone(), r.clone()))
            .collect())
    }

    async fn get_all_created_networks(
        &self,
    ) -> NetResult<HashMap<String, HashMap<String, NetworkRecord>>> {
        let mut all: HashMap<String, HashMap<String, NetworkRecord>> = HashMap::new();
        for record in self.inner.lock().networks.values() {
            if record.status == NetworkStatus::Created {
                all.entry(record.project.clone())
                    .or_default()
                    .insert(record.name.clone(), record.clone());
            }
        }
        Ok(all)
    }

    async fn instance_list(
        &self,
        filter: &InstanceFilter,
        f: &mut InstanceCallback<'_>,
    ) -> NetResult<()> {
        let instances: Vec<InstanceRecord> = self
            .inner
            .lock()
            .instances
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        for instance in &instances {
            f(instance)?;
        }
        Ok(())
    }

    async fn get_network_forwards(&self, network_id: i64) -> NetResult<Vec<NetworkForward>> {
        Ok(self
            .inner
            .lock()
            .forwards
            .values()
            .filter(|f| f.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn get_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<NetworkForward> {
        self.forward(network_id, listen_address)
            .ok_or_else(|| NetError::not_found("Network forward", listen_address))
    }

    async fn create_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &ForwardPut,
    ) -> NetResult<i64> {
        let mut inner = self.inner.lock();
        let key = (network_id, listen_address.to_string());
        if inner.forwards.contains_key(&key) {
            return Err(NetError::conflict(format!(
                "A forward for {:?} already exists",
                listen_address
            )));
        }
        let id = inner.next_id();
        inner.forwards.insert(
            key,
            NetworkForward {
                id,
                network_id,
                listen_address: listen_address.to_string(),
                put: put.clone(),
            },
        );
        Ok(id)
    }

    async fn update_network_forward(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &ForwardPut,
    ) -> NetResult<()> {
        let mut inner = self.inner.lock();
        let forward = inner
            .forwards
            .get_mut(&(network_id, listen_address.to_string()))
            .ok_or_else(|| NetError::not_found("Network forward", listen_address))?;
        forward.put = put.clone();
        Ok(())
    }

    async fn delete_network_forward(&self, network_id: i64, listen_address: &str) -> NetResult<()> {
        self.inner
            .lock()
            .forwards
            .remove(&(network_id, listen_address.to_string()))
            .map(|_| ())
            .ok_or_else(|| NetError::not_found("Network forward", listen_address))
    }

    async fn get_network_forward_listen_addresses(
        &self,
        network_id: i64,
    ) -> NetResult<HashMap<i64, String>> {
        Ok(self
            .inner
            .lock()
            .forwards
            .values()
            .filter(|f| f.network_id == network_id)
            .map(|f| (f.id, f.listen_address.clone()))
            .collect())
    }

    async fn get_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<NetworkLoadBalancer> {
        self.inner
            .lock()
            .load_balancers
            .get(&(network_id, listen_address.to_string()))
            .cloned()
            .ok_or_else(|| NetError::not_found("Network load balancer", listen_address))
    }

    async fn create_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &LoadBalancerPut,
    ) -> NetResult<i64> {
        let mut inner = self.inner.lock();
        let key = (network_id, listen_address.to_string());
        if inner.load_balancers.contains_key(&key) {
            return Err(NetError::conflict(format!(
                "A load balancer for {:?} already exists",
                listen_address
            )));
        }
        let id = inner.next_id();
        inner.load_balancers.insert(
            key,
            NetworkLoadBalancer {
                id,
                network_id,
                listen_address: listen_address.to_string(),
                put: put.clone(),
            },
        );
        Ok(id)
    }

    async fn update_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
        put: &LoadBalancerPut,
    ) -> NetResult<()> {
        let mut inner = self.inner.lock();
        let lb = inner
            .load_balancers
            .get_mut(&(network_id, listen_address.to_string()))
            .ok_or_else(|| NetError::not_found("Network load balancer", listen_address))?;
        lb.put = put.clone();
        Ok(())
    }

    async fn delete_network_load_balancer(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> NetResult<()> {
        self.inner
            .lock()
            .load_balancers
            .remove(&(network_id, listen_address.to_string()))
            .map(|_| ())
            .ok_or_else(|| NetError::not_found("Network load balancer", listen_address))
    }

    async fn get_network_load_balancer_listen_addresses(
        &self,
        network_id: i64,
    ) -> NetResult<HashMap<i64, String>> {
        Ok(self
            .inner
            .lock()
            .load_balancers
            .values()
            .filter(|lb| lb.network_id == network_id)
            .map(|lb| (lb.id, lb.listen_address.clone()))
            .collect())
    }
}
