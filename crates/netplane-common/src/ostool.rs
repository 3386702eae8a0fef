//! OS network tool contract and its `ip`/`ovs-vsctl` implementation.

use async_trait::async_trait;
use ipnet::IpNet;
use netplane_types::{MacAddress, VlanId};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;

use crate::commands::*;
use crate::error::{NetError, NetResult};
use crate::shell;

/// Administrative state and addresses of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    pub addresses: Vec<IpAddr>,
}

impl LinkStatus {
    /// Returns true if any address is a global unicast address.
    pub fn has_global_unicast(&self) -> bool {
        self.addresses.iter().any(is_global_unicast)
    }
}

/// Global unicast in the routing sense: not unspecified, loopback,
/// multicast, broadcast or link-local. Private ranges count as global.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_link_local())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Interface, bridge and VLAN operations. Implementations never retry.
#[async_trait]
pub trait OsNetworkTool: Send + Sync {
    async fn interface_exists(&self, name: &str) -> NetResult<bool>;
    async fn interface_remove(&self, name: &str) -> NetResult<()>;
    async fn vlan_interface_create(
        &self,
        parent: &str,
        name: &str,
        vlan: VlanId,
        gvrp: bool,
    ) -> NetResult<()>;
    async fn bridge_add(&self, name: &str) -> NetResult<()>;
    async fn set_mtu(&self, name: &str, mtu: u32) -> NetResult<()>;
    async fn set_up(&self, name: &str) -> NetResult<()>;
    async fn set_address(&self, name: &str, mac: &MacAddress) -> NetResult<()>;
    async fn set_master(&self, name: &str, master: &str) -> NetResult<()>;
    async fn set_nomaster(&self, name: &str) -> NetResult<()>;
    async fn addr_flush(&self, name: &str) -> NetResult<()>;
    async fn addr_add(&self, name: &str, addr: &IpNet) -> NetResult<()>;
    async fn link_status(&self, name: &str) -> NetResult<LinkStatus>;

    async fn ovs_bridge_exists(&self, name: &str) -> NetResult<bool>;
    async fn ovs_bridge_add(&self, name: &str) -> NetResult<()>;
    async fn ovs_bridge_delete(&self, name: &str) -> NetResult<()>;
    async fn ovs_port_add(&self, bridge: &str, port: &str) -> NetResult<()>;
    async fn ovs_port_delete(&self, bridge: &str, port: &str) -> NetResult<()>;
    async fn ovs_port_set(&self, port: &str, settings: &[(String, String)]) -> NetResult<()>;
    async fn ovs_bridge_port_list(&self, bridge: &str) -> NetResult<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct IpAddrShow {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: String,
}

/// [`OsNetworkTool`] backed by the `ip` and `ovs-vsctl` commands.
///
/// Interface existence is read from `sysfs_net` (normally `/sys/class/net`).
pub struct ShellNetworkTool {
    sysfs_net: PathBuf,

    /// Mock mode for testing
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: parking_lot::Mutex<Vec<String>>,
}

impl ShellNetworkTool {
    pub fn new(sysfs_net: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net: sysfs_net.into(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Default::default(),
        }
    }

    /// Enables mock mode for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands.lock().clone()
    }

    /// Execute a shell command (with mock mode support)
    async fn exec(&self, cmd: &str) -> NetResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.lock().push(cmd.to_string());
            info!("Mock exec: {}", cmd);
            return Ok(String::new());
        }

        shell::exec_or_throw(cmd).await
    }
}

#[async_trait]
impl OsNetworkTool for ShellNetworkTool {
    async fn interface_exists(&self, name: &str) -> NetResult<bool> {
        let path = self.sysfs_net.join(name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| NetError::io(path.display().to_string(), e))
    }

    async fn interface_remove(&self, name: &str) -> NetResult<()> {
        self.exec(&build_link_delete_cmd(name)).await?;
        info!(interface = %name, "Removed interface");
        Ok(())
    }

    async fn vlan_interface_create(
        &self,
        parent: &str,
        name: &str,
        vlan: VlanId,
        gvrp: bool,
    ) -> NetResult<()> {
        self.exec(&build_vlan_add_cmd(parent, name, vlan, gvrp)).await?;
        info!(interface = %name, parent = %parent, vlan = %vlan, "Created VLAN interface");
        Ok(())
    }

    async fn bridge_add(&self, name: &str) -> NetResult<()> {
        self.exec(&build_bridge_add_cmd(name)).await?;
        Ok(())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetResult<()> {
        self.exec(&build_set_mtu_cmd(name, mtu)).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> NetResult<()> {
        self.exec(&build_set_up_cmd(name)).await?;
        Ok(())
    }

    async fn set_address(&self, name: &str, mac: &MacAddress) -> NetResult<()> {
        self.exec(&build_set_address_cmd(name, mac)).await?;
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> NetResult<()> {
        self.exec(&build_set_master_cmd(name, master)).await?;
        Ok(())
    }

    async fn set_nomaster(&self, name: &str) -> NetResult<()> {
        self.exec(&build_set_nomaster_cmd(name)).await?;
        Ok(())
    }

    async fn addr_flush(&self, name: &str) -> NetResult<()> {
        self.exec(&build_addr_flush_cmd(name)).await?;
        Ok(())
    }

    async fn addr_add(&self, name: &str, addr: &IpNet) -> NetResult<()> {
        self.exec(&build_addr_add_cmd(name, addr)).await?;
        Ok(())
    }

    async fn link_status(&self, name: &str) -> NetResult<LinkStatus> {
        let output = self.exec(&build_addr_show_cmd(name)).await?;
        parse_addr_show(name, &output)
    }

    async fn ovs_bridge_exists(&self, name: &str) -> NetResult<bool> {
        let result = shell::exec(&build_ovs_bridge_exists_cmd(name)).await?;
        match result.exit_code {
            0 => Ok(true),
            2 => Ok(false),
            code => Err(NetError::ShellCommandFailed {
                command: build_ovs_bridge_exists_cmd(name),
                exit_code: code,
                output: result.combined_output(),
            }),
        }
    }

    async fn ovs_bridge_add(&self, name: &str) -> NetResult<()> {
        self.exec(&build_ovs_bridge_add_cmd(name)).await?;
        Ok(())
    }

    async fn ovs_bridge_delete(&self, name: &str) -> NetResult<()> {
        self.exec(&build_ovs_bridge_delete_cmd(name)).await?;
        Ok(())
    }

    async fn ovs_port_add(&self, bridge: &str, port: &str) -> NetResult<()> {
        self.exec(&build_ovs_port_add_cmd(bridge, port)).await?;
        Ok(())
    }

    async fn ovs_port_delete(&self, bridge: &str, port: &str) -> NetResult<()> {
        self.exec(&build_ovs_port_delete_cmd(bridge, port)).await?;
        Ok(())
    }

    async fn ovs_port_set(&self, port: &str, settings: &[(String, String)]) -> NetResult<()> {
        self.exec(&build_ovs_port_set_cmd(port, settings)).await?;
        Ok(())
    }

    async fn ovs_bridge_port_list(&self, bridge: &str) -> NetResult<Vec<String>> {
        let output = self.exec(&build_ovs_list_ports_cmd(bridge)).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Parses `ip -j addr show dev <name>` output.
pub fn parse_addr_show(name: &str, output: &str) -> NetResult<LinkStatus> {
    if output.trim().is_empty() {
        return Ok(LinkStatus::default());
    }

    let links: Vec<IpAddrShow> = serde_json::from_str(output)
        .map_err(|e| NetError::internal(format!("Failed parsing addresses of {:?}: {}", name, e)))?;

    let mut status = LinkStatus::default();
    for link in links {
        status.up |= link.flags.iter().any(|f| f == "UP");
        for info in link.addr_info {
            if let Ok(ip) = info.local.parse() {
                status.addresses.push(ip);
            }
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_addr_show() {
        let output = r#"[{"ifindex":3,"ifname":"eth0v1","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "addr_info":[{"family":"inet","local":"192.0.2.4","prefixlen":24},
                         {"family":"inet6","local":"fe80::1","prefixlen":64}]}]"#;
        let status = parse_addr_show("eth0v1", output).unwrap();
        assert!(status.up);
        assert_eq!(status.addresses.len(), 2);
        assert!(status.has_global_unicast());
    }

    #[test]
    fn test_link_local_only_is_not_global() {
        let status = LinkStatus {
            up: false,
            addresses: vec!["fe80::1".parse().unwrap(), "169.254.0.3".parse().unwrap()],
        };
        assert!(!status.has_global_unicast());
    }

    #[tokio::test]
    async fn test_mock_mode_captures_commands() {
        let tool = ShellNetworkTool::new("/sys/class/net").with_mock_mode();
        let vlan: VlanId = "100".parse().unwrap();

        tool.vlan_interface_create("eth0", "eth0.100", vlan, false)
            .await
            .unwrap();
        tool.set_mtu("eth0.100", 9000).await.unwrap();
        tool.interface_remove("eth0.100").await.unwrap();

        let cmds = tool.captured_commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("type vlan id 100"));
        assert!(cmds[1].contains("mtu 9000"));
        assert!(cmds[2].contains("link delete dev \"eth0.100\""));
    }

    #[tokio::test]
    async fn test_interface_exists_reads_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("eth0")).unwrap();

        let tool = ShellNetworkTool::new(dir.path());
        assert!(tool.interface_exists("eth0").await.unwrap());
        assert!(!tool.interface_exists("eth9").await.unwrap());
    }
}
