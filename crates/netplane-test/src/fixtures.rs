//! Test fixtures for common network control plane scenarios

use netplane_types::{
    ConfigMap, DeviceConfig, InstanceRecord, NetworkRecord, NetworkStatus, ProfileDevices,
    DEFAULT_PROJECT,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{FakeBgpSpeaker, FakeNetworkTool, FakeNotifier, MemoryStore};

/// Builds a [`NetworkRecord`]
#[derive(Debug, Clone)]
pub struct NetworkFixture {
    record: NetworkRecord,
}

impl NetworkFixture {
    /// A network of `net_type` in the default project, status `Created`.
    pub fn new(net_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record: NetworkRecord {
                id: 0,
                project: DEFAULT_PROJECT.to_string(),
                name: name.into(),
                net_type: net_type.into(),
                description: String::new(),
                config: ConfigMap::new(),
                status: NetworkStatus::Created,
                managed: true,
                member_status: HashMap::new(),
            },
        }
    }

    pub fn physical(name: impl Into<String>) -> Self {
        Self::new("physical", name)
    }

    pub fn bridge(name: impl Into<String>) -> Self {
        Self::new("bridge", name)
    }

    pub fn macvlan(name: impl Into<String>) -> Self {
        Self::new("macvlan", name)
    }

    pub fn sriov(name: impl Into<String>) -> Self {
        Self::new("sriov", name)
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.record.project = project.into();
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.record.id = id;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.record.config.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.record.description = description.into();
        self
    }

    pub fn with_status(mut self, status: NetworkStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn with_member_status(mut self, member_id: i64, status: NetworkStatus) -> Self {
        self.record.member_status.insert(member_id, status);
        self
    }

    pub fn build(self) -> NetworkRecord {
        self.record
    }
}

/// Builds an [`InstanceRecord`]
#[derive(Debug, Clone)]
pub struct InstanceFixture {
    instance: InstanceRecord,
}

impl InstanceFixture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            instance: InstanceRecord {
                project: DEFAULT_PROJECT.to_string(),
                name: name.into(),
                location: "none".to_string(),
                ..Default::default()
            },
        }
    }

    /// Places the instance on a cluster member.
    pub fn on(mut self, member: impl Into<String>) -> Self {
        self.instance.location = member.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.instance.config.insert(key.into(), value.into());
        self
    }

    pub fn with_device(mut self, name: impl Into<String>, device: DeviceConfig) -> Self {
        self.instance.devices.insert(name.into(), device);
        self
    }

    /// Adds a `nic` device on a host parent interface.
    pub fn with_nic(self, name: impl Into<String>, parent: &str) -> Self {
        self.with_device(name, nic_device(&[("parent", parent)]))
    }

    /// Adds a `nic` device attached to a managed network.
    pub fn with_network_nic(self, name: impl Into<String>, network: &str) -> Self {
        self.with_device(name, nic_device(&[("network", network)]))
    }

    pub fn with_profile(mut self, name: impl Into<String>, devices: HashMap<String, DeviceConfig>) -> Self {
        self.instance.profiles.push(ProfileDevices {
            name: name.into(),
            devices,
        });
        self
    }

    pub fn build(self) -> InstanceRecord {
        self.instance
    }
}

/// A `nic` device config with the given extra fields.
pub fn nic_device(fields: &[(&str, &str)]) -> DeviceConfig {
    let mut device = DeviceConfig::new();
    device.insert("type".to_string(), "nic".to_string());
    for (k, v) in fields {
        device.insert(k.to_string(), v.to_string());
    }
    device
}

/// Builds a config map from pairs.
pub fn config_map(pairs: &[(&str, &str)]) -> ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Shared handles to every fake collaborator.
#[derive(Clone, Default)]
pub struct FakeCluster {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<FakeNotifier>,
    pub bgp: Arc<FakeBgpSpeaker>,
    pub os: Arc<FakeNetworkTool>,
}

impl FakeCluster {
    /// A standalone member with the given host interfaces.
    pub fn with_links<I, S>(links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            os: Arc::new(FakeNetworkTool::with_links(links)),
            ..Default::default()
        }
    }

    /// Replaces the notifier with one knowing the given peer members.
    pub fn with_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notifier = Arc::new(FakeNotifier::with_members(peers));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_network_fixture() {
        let record = NetworkFixture::physical("phys0")
            .with_config("parent", "eth0")
            .with_config("vlan", "100")
            .build();
        assert_eq!(record.net_type, "physical");
        assert_eq!(record.status, NetworkStatus::Created);
        assert_eq!(record.config["vlan"], "100");
    }

    #[test]
    fn test_instance_fixture() {
        let instance = InstanceFixture::new("c1")
            .on("node1")
            .with_nic("eth0", "enp5s0f0v1")
            .with_config("volatile.eth0.host_name", "enp5s0f0v1")
            .build();
        assert_eq!(instance.location, "node1");
        assert_eq!(instance.devices["eth0"]["parent"], "enp5s0f0v1");
        assert_eq!(instance.devices["eth0"]["type"], "nic");
    }
}
