//! Instance view consumed by reservation scans and in-use checks.

use crate::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device configuration (`type`, `parent`, `network`, ...).
pub type DeviceConfig = HashMap<String, String>;

/// A profile applied to an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDevices {
    pub name: String,
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
}

/// An instance with its local devices and applied profiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub project: String,
    pub name: String,
    /// Name of the cluster member hosting the instance.
    pub location: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
    /// Profiles in application order; later profiles win.
    #[serde(default)]
    pub profiles: Vec<ProfileDevices>,
}

impl InstanceRecord {
    /// Devices after applying profiles, instance-local devices last.
    pub fn expanded_devices(&self) -> HashMap<String, DeviceConfig> {
        let mut devices = HashMap::new();
        for profile in &self.profiles {
            for (name, dev) in &profile.devices {
                devices.insert(name.clone(), dev.clone());
            }
        }
        for (name, dev) in &self.devices {
            devices.insert(name.clone(), dev.clone());
        }
        devices
    }
}

/// Filter for instance listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub project: Option<String>,
    pub member: Option<String>,
}

impl InstanceFilter {
    /// Restricts the listing to instances placed on `member`.
    pub fn on_member(member: impl Into<String>) -> Self {
        Self {
            project: None,
            member: Some(member.into()),
        }
    }

    pub fn matches(&self, instance: &InstanceRecord) -> bool {
        self.project.as_deref().map_or(true, |p| p == instance.project)
            && self.member.as_deref().map_or(true, |m| m == instance.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nic(parent: &str) -> DeviceConfig {
        let mut dev = DeviceConfig::new();
        dev.insert("type".to_string(), "nic".to_string());
        dev.insert("parent".to_string(), parent.to_string());
        dev
    }

    #[test]
    fn test_expanded_devices_local_wins() {
        let mut profile = ProfileDevices {
            name: "default".to_string(),
            ..Default::default()
        };
        profile.devices.insert("eth0".to_string(), nic("enp1s0"));
        profile.devices.insert("eth1".to_string(), nic("enp2s0"));

        let mut instance = InstanceRecord {
            project: "default".to_string(),
            name: "c1".to_string(),
            location: "node1".to_string(),
            profiles: vec![profile],
            ..Default::default()
        };
        instance.devices.insert("eth0".to_string(), nic("enp3s0"));

        let devices = instance.expanded_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices["eth0"]["parent"], "enp3s0");
        assert_eq!(devices["eth1"]["parent"], "enp2s0");
    }

    #[test]
    fn test_filter_on_member() {
        let instance = InstanceRecord {
            project: "p1".to_string(),
            name: "c1".to_string(),
            location: "node1".to_string(),
            ..Default::default()
        };
        assert!(InstanceFilter::default().matches(&instance));
        assert!(InstanceFilter::on_member("node1").matches(&instance));
        assert!(!InstanceFilter::on_member("node2").matches(&instance));
    }
}
