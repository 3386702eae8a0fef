//! Daemon-wide state shared by every network driver.

use netplane_common::{BgpSpeaker, ClusterNotifier, ClusterStore, OsNetworkTool};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::{DriverFactory, DriverRegistry};

/// Default pause after growing the VF count, for new interfaces to appear.
pub const DEFAULT_SRIOV_SETTLE: Duration = Duration::from_secs(1);

/// The cluster member this daemon runs on.
#[derive(Debug)]
pub struct LocalMember {
    pub id: i64,
    pub name: String,
    evacuated: AtomicBool,
}

impl LocalMember {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            evacuated: AtomicBool::new(false),
        }
    }

    pub fn is_evacuated(&self) -> bool {
        self.evacuated.load(Ordering::SeqCst)
    }

    pub fn set_evacuated(&self, evacuated: bool) {
        self.evacuated.store(evacuated, Ordering::SeqCst);
    }
}

/// Member-local registry of networks that are currently unavailable.
///
/// Networks are available unless marked otherwise. The lock is never held
/// across an await.
#[derive(Debug, Default)]
pub struct Availability {
    unavailable: Mutex<HashSet<(String, String)>>,
}

impl Availability {
    pub fn set_available(&self, project: &str, name: &str) {
        self.unavailable
            .lock()
            .remove(&(project.to_string(), name.to_string()));
    }

    pub fn set_unavailable(&self, project: &str, name: &str) {
        self.unavailable
            .lock()
            .insert((project.to_string(), name.to_string()));
    }

    pub fn is_available(&self, project: &str, name: &str) -> bool {
        !self
            .unavailable
            .lock()
            .contains(&(project.to_string(), name.to_string()))
    }

    /// Forgets a network, as on delete.
    pub fn remove(&self, project: &str, name: &str) {
        self.set_available(project, name);
    }
}

/// Collaborators, paths and registries used by the drivers.
pub struct NetworkState {
    pub store: Arc<dyn ClusterStore>,
    pub notifier: Arc<dyn ClusterNotifier>,
    pub bgp: Arc<dyn BgpSpeaker>,
    pub os: Arc<dyn OsNetworkTool>,
    pub member: LocalMember,
    pub availability: Availability,
    pub sriov_settle: Duration,
    pub ovs_enabled: bool,
    var_dir: PathBuf,
    sysfs_net: PathBuf,
    drivers: DriverRegistry,
}

impl NetworkState {
    /// State for a standalone member with the built-in drivers.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        notifier: Arc<dyn ClusterNotifier>,
        bgp: Arc<dyn BgpSpeaker>,
        os: Arc<dyn OsNetworkTool>,
    ) -> Self {
        Self {
            store,
            notifier,
            bgp,
            os,
            member: LocalMember::new(0, "none"),
            availability: Availability::default(),
            sriov_settle: DEFAULT_SRIOV_SETTLE,
            ovs_enabled: true,
            var_dir: PathBuf::from("/var/lib/netplane"),
            sysfs_net: PathBuf::from("/sys/class/net"),
            drivers: DriverRegistry::builtin(),
        }
    }

    pub fn with_member(mut self, id: i64, name: impl Into<String>) -> Self {
        self.member = LocalMember::new(id, name);
        self
    }

    pub fn with_var_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.var_dir = dir.into();
        self
    }

    pub fn with_sysfs_net(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sysfs_net = dir.into();
        self
    }

    pub fn with_sriov_settle(mut self, settle: Duration) -> Self {
        self.sriov_settle = settle;
        self
    }

    pub fn with_ovs_enabled(mut self, enabled: bool) -> Self {
        self.ovs_enabled = enabled;
        self
    }

    /// Registers (or replaces) the driver for `net_type`.
    pub fn with_driver(mut self, net_type: &'static str, factory: DriverFactory) -> Self {
        self.drivers.register(net_type, factory);
        self
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn sysfs_net(&self) -> &Path {
        &self.sysfs_net
    }

    pub fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    /// State directory of a network.
    pub fn network_dir(&self, name: &str) -> PathBuf {
        self.var_dir.join("networks").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_availability_defaults_to_available() {
        let availability = Availability::default();
        assert!(availability.is_available("default", "br0"));

        availability.set_unavailable("default", "br0");
        assert!(!availability.is_available("default", "br0"));
        assert!(availability.is_available("other", "br0"));

        availability.set_available("default", "br0");
        assert!(availability.is_available("default", "br0"));
    }

    #[test]
    fn test_member_evacuation_flag() {
        let member = LocalMember::new(2, "node2");
        assert!(!member.is_evacuated());
        member.set_evacuated(true);
        assert!(member.is_evacuated());
        assert_eq!(member.name, "node2");
    }
}
