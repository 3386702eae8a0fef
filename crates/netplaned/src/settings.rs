//! Daemon settings file.

use netplane_common::{NetError, NetResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings read from the optional YAML file. Missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Name of the local cluster member.
    pub member_name: String,
    pub member_id: i64,
    /// Root of the per-network state directories.
    pub var_dir: PathBuf,
    pub sysfs_net: PathBuf,
    /// Wait after growing a physical function's VF count.
    pub sriov_settle_ms: u64,
    pub log_level: String,
    pub ovs_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            member_name: "none".to_string(),
            member_id: 0,
            var_dir: PathBuf::from("/var/lib/netplane"),
            sysfs_net: PathBuf::from("/sys/class/net"),
            sriov_settle_ms: 1000,
            log_level: "info".to_string(),
            ovs_enabled: true,
        }
    }
}

impl DaemonConfig {
    pub fn from_yaml(text: &str) -> NetResult<Self> {
        serde_yaml::from_str(text).map_err(|e| NetError::invalid_config("settings", e.to_string()))
    }

    /// Reads `path`. An empty file yields the defaults.
    pub async fn load(path: &Path) -> NetResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NetError::io(path.display().to_string(), e))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_yaml(&text)
    }

    pub fn sriov_settle(&self) -> Duration {
        Duration::from_millis(self.sriov_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = DaemonConfig::from_yaml("member_name: node2\nmember_id: 2\n").unwrap();
        assert_eq!(config.member_name, "node2");
        assert_eq!(config.member_id, 2);
        assert_eq!(config.var_dir, PathBuf::from("/var/lib/netplane"));
        assert_eq!(config.sriov_settle(), Duration::from_secs(1));
        assert!(config.ovs_enabled);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            DaemonConfig::from_yaml("member: node2\n"),
            Err(NetError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netplaned.yaml");
        tokio::fs::write(&path, "").await.unwrap();
        assert_eq!(DaemonConfig::load(&path).await.unwrap(), DaemonConfig::default());
    }
}
