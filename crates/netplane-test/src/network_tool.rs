//! OS network tool fake with in-memory link state

use async_trait::async_trait;
use ipnet::IpNet;
use netplane_common::{LinkStatus, NetError, NetResult, OsNetworkTool};
use netplane_types::{MacAddress, VlanId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

/// How a fake link came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Pre-existing host interface.
    Physical,
    Vlan,
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub kind: LinkKind,
    pub up: bool,
    pub mtu: Option<u32>,
    pub mac: Option<MacAddress>,
    pub master: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub vlan: Option<(String, VlanId)>,
}

impl FakeLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            up: false,
            mtu: None,
            mac: None,
            master: None,
            addresses: Vec::new(),
            vlan: None,
        }
    }
}

#[derive(Default)]
struct ToolState {
    links: BTreeMap<String, FakeLink>,
    ovs_bridges: BTreeMap<String, Vec<String>>,
    calls: Vec<String>,
    fail_on: HashSet<&'static str>,
}

/// Records every call as `"<verb> <args>"` and applies it to in-memory
/// links. Verbs named in `fail_on` fail before touching state.
#[derive(Default)]
pub struct FakeNetworkTool {
    state: Mutex<ToolState>,
}

impl FakeNetworkTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the tool with pre-existing physical interfaces.
    pub fn with_links<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tool = Self::new();
        for name in names {
            tool.add_link(name);
        }
        tool
    }

    pub fn add_link(&self, name: impl Into<String>) {
        self.state
            .lock()
            .links
            .insert(name.into(), FakeLink::new(LinkKind::Physical));
    }

    pub fn set_link_up(&self, name: &str, up: bool) {
        if let Some(link) = self.state.lock().links.get_mut(name) {
            link.up = up;
        }
    }

    pub fn add_link_address(&self, name: &str, ip: IpAddr) {
        if let Some(link) = self.state.lock().links.get_mut(name) {
            link.addresses.push(ip);
        }
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state.lock().links.get(name).cloned()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn ovs_ports(&self, bridge: &str) -> Option<Vec<String>> {
        self.state.lock().ovs_bridges.get(bridge).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Calls starting with `verb`.
    pub fn calls_of(&self, verb: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .cloned()
            .collect()
    }

    pub fn fail_on(&self, verb: &'static str) {
        self.state.lock().fail_on.insert(verb);
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_on.clear();
    }

    fn record(&self, verb: &'static str, args: String) -> NetResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("{} {}", verb, args).trim_end().to_string());
        if state.fail_on.contains(verb) {
            return Err(NetError::ShellCommandFailed {
                command: format!("{} {}", verb, args),
                exit_code: 1,
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut FakeLink) -> T) -> NetResult<T> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| NetError::not_found("Interface", name))?;
        Ok(f(link))
    }
}

#[async_trait]
impl OsNetworkTool for FakeNetworkTool {
    async fn interface_exists(&self, name: &str) -> NetResult<bool> {
        Ok(self.has_link(name))
    }

    async fn interface_remove(&self, name: &str) -> NetResult<()> {
        self.record("interface_remove", name.to_string())?;
        let mut state = self.state.lock();
        state
            .links
            .remove(name)
            .ok_or_else(|| NetError::not_found("Interface", name))?;
        for link in state.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        Ok(())
    }

    async fn vlan_interface_create(
        &self,
        parent: &str,
        name: &str,
        vlan: VlanId,
        gvrp: bool,
    ) -> NetResult<()> {
        self.record(
            "vlan_interface_create",
            format!("{} {} {} {}", parent, name, vlan, gvrp),
        )?;
        let mut state = self.state.lock();
        if !state.links.contains_key(parent) {
            return Err(NetError::not_found("Interface", parent));
        }
        if state.links.contains_key(name) {
            return Err(NetError::conflict(format!("Interface {:?} exists", name)));
        }
        let mut link = FakeLink::new(LinkKind::Vlan);
        link.up = true;
        link.vlan = Some((parent.to_string(), vlan));
        state.links.insert(name.to_string(), link);
        Ok(())
    }

    async fn bridge_add(&self, name: &str) -> NetResult<()> {
        self.record("bridge_add", name.to_string())?;
        let mut state = self.state.lock();
        if state.links.contains_key(name) {
            return Err(NetError::conflict(format!("Interface {:?} exists", name)));
        }
        state
            .links
            .insert(name.to_string(), FakeLink::new(LinkKind::Bridge));
        Ok(())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetResult<()> {
        self.record("set_mtu", format!("{} {}", name, mtu))?;
        self.with_link(name, |l| l.mtu = Some(mtu))
    }

    async fn set_up(&self, name: &str) -> NetResult<()> {
        self.record("set_up", name.to_string())?;
        self.with_link(name, |l| l.up = true)
    }

    async fn set_address(&self, name: &str, mac: &MacAddress) -> NetResult<()> {
        self.record("set_address", format!("{} {}", name, mac))?;
        let mac = *mac;
        self.with_link(name, |l| l.mac = Some(mac))
    }

    async fn set_master(&self, name: &str, master: &str) -> NetResult<()> {
        self.record("set_master", format!("{} {}", name, master))?;
        let master = master.to_string();
        self.with_link(name, |l| l.master = Some(master))
    }

    async fn set_nomaster(&self, name: &str) -> NetResult<()> {
        self.record("set_nomaster", name.to_string())?;
        self.with_link(name, |l| l.master = None)
    }

    async fn addr_flush(&self, name: &str) -> NetResult<()> {
        self.record("addr_flush", name.to_string())?;
        self.with_link(name, |l| l.addresses.clear())
    }

    async fn addr_add(&self, name: &str, addr: &IpNet) -> NetResult<()> {
        self.record("addr_add", format!("{} {}", name, addr))?;
        let ip = addr.addr();
        self.with_link(name, |l| l.addresses.push(ip))
    }

    async fn link_status(&self, name: &str) -> NetResult<LinkStatus> {
        self.with_link(name, |l| LinkStatus {
            up: l.up,
            addresses: l.addresses.clone(),
        })
    }

    async fn ovs_bridge_exists(&self, name: &str) -> NetResult<bool> {
        Ok(self.state.lock().ovs_bridges.contains_key(name))
    }

    async fn ovs_bridge_add(&self, name: &str) -> NetResult<()> {
        self.record("ovs_bridge_add", name.to_string())?;
        let mut state = self.state.lock();
        state.ovs_bridges.entry(name.to_string()).or_default();
        state
            .links
            .entry(name.to_string())
            .or_insert_with(|| FakeLink::new(LinkKind::Bridge));
        Ok(())
    }

    async fn ovs_bridge_delete(&self, name: &str) -> NetResult<()> {
        self.record("ovs_bridge_delete", name.to_string())?;
        let mut state = self.state.lock();
        state.ovs_bridges.remove(name);
        state.links.remove(name);
        Ok(())
    }

    async fn ovs_port_add(&self, bridge: &str, port: &str) -> NetResult<()> {
        self.record("ovs_port_add", format!("{} {}", bridge, port))?;
        let mut state = self.state.lock();
        let ports = state
            .ovs_bridges
            .get_mut(bridge)
            .ok_or_else(|| NetError::not_found("OVS bridge", bridge))?;
        if !ports.iter().any(|p| p == port) {
            ports.push(port.to_string());
        }
        Ok(())
    }

    async fn ovs_port_delete(&self, bridge: &str, port: &str) -> NetResult<()> {
        self.record("ovs_port_delete", format!("{} {}", bridge, port))?;
        if let Some(ports) = self.state.lock().ovs_bridges.get_mut(bridge) {
            ports.retain(|p| p != port);
        }
        Ok(())
    }

    async fn ovs_port_set(&self, port: &str, settings: &[(String, String)]) -> NetResult<()> {
        let args: Vec<String> = settings.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.record("ovs_port_set", format!("{} {}", port, args.join(" ")))
    }

    async fn ovs_bridge_port_list(&self, bridge: &str) -> NetResult<Vec<String>> {
        self.state
            .lock()
            .ovs_bridges
            .get(bridge)
            .cloned()
            .ok_or_else(|| NetError::not_found("OVS bridge", bridge))
    }
}
