//! Shell command builders for link, address and Open vSwitch operations

use ipnet::IpNet;
use netplane_types::{MacAddress, VlanId};

use crate::shell::{shellquote, IP_CMD, OVS_VSCTL_CMD};

/// Build link deletion command
pub fn build_link_delete_cmd(name: &str) -> String {
    format!("{} link delete dev {}", IP_CMD, shellquote(name))
}

/// Build VLAN sub-interface creation command
pub fn build_vlan_add_cmd(parent: &str, name: &str, vlan: VlanId, gvrp: bool) -> String {
    let mut cmd = format!(
        "{} link add link {} name {} up type vlan id {}",
        IP_CMD,
        shellquote(parent),
        shellquote(name),
        vlan
    );
    if gvrp {
        cmd.push_str(" gvrp on");
    }
    cmd
}

/// Build native bridge creation command
pub fn build_bridge_add_cmd(name: &str) -> String {
    format!("{} link add dev {} type bridge", IP_CMD, shellquote(name))
}

/// Build link MTU command
pub fn build_set_mtu_cmd(name: &str, mtu: u32) -> String {
    format!("{} link set dev {} mtu {}", IP_CMD, shellquote(name), mtu)
}

/// Build link admin up command
pub fn build_set_up_cmd(name: &str) -> String {
    format!("{} link set dev {} up", IP_CMD, shellquote(name))
}

/// Build link hardware address command
pub fn build_set_address_cmd(name: &str, mac: &MacAddress) -> String {
    format!("{} link set dev {} address {}", IP_CMD, shellquote(name), mac)
}

/// Build bridge port attach command
pub fn build_set_master_cmd(name: &str, master: &str) -> String {
    format!(
        "{} link set dev {} master {}",
        IP_CMD,
        shellquote(name),
        shellquote(master)
    )
}

/// Build bridge port detach command
pub fn build_set_nomaster_cmd(name: &str) -> String {
    format!("{} link set dev {} nomaster", IP_CMD, shellquote(name))
}

/// Build address flush command (global scope only, link-local addresses stay)
pub fn build_addr_flush_cmd(name: &str) -> String {
    format!("{} addr flush dev {} scope global", IP_CMD, shellquote(name))
}

/// Build address assignment command
pub fn build_addr_add_cmd(name: &str, addr: &IpNet) -> String {
    format!("{} addr add {} dev {}", IP_CMD, addr, shellquote(name))
}

/// Build JSON address listing command
pub fn build_addr_show_cmd(name: &str) -> String {
    format!("{} -j addr show dev {}", IP_CMD, shellquote(name))
}

/// Build OVS bridge existence check (exit code 2 when absent)
pub fn build_ovs_bridge_exists_cmd(name: &str) -> String {
    format!("{} br-exists {}", OVS_VSCTL_CMD, shellquote(name))
}

/// Build OVS bridge creation command
pub fn build_ovs_bridge_add_cmd(name: &str) -> String {
    format!("{} --may-exist add-br {}", OVS_VSCTL_CMD, shellquote(name))
}

/// Build OVS bridge deletion command
pub fn build_ovs_bridge_delete_cmd(name: &str) -> String {
    format!("{} --if-exists del-br {}", OVS_VSCTL_CMD, shellquote(name))
}

/// Build OVS port attach command
pub fn build_ovs_port_add_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} --may-exist add-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build OVS port detach command
pub fn build_ovs_port_delete_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} --if-exists del-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build OVS port column update command
pub fn build_ovs_port_set_cmd(port: &str, settings: &[(String, String)]) -> String {
    let mut cmd = format!("{} set port {}", OVS_VSCTL_CMD, shellquote(port));
    for (key, value) in settings {
        cmd.push(' ');
        cmd.push_str(&shellquote(&format!("{}={}", key, value)));
    }
    cmd
}

/// Build OVS bridge port listing command
pub fn build_ovs_list_ports_cmd(bridge: &str) -> String {
    format!("{} list-ports {}", OVS_VSCTL_CMD, shellquote(bridge))
}
