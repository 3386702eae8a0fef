//! BGP speaker fake

use async_trait::async_trait;
use ipnet::IpNet;
use netplane_common::{BgpSpeaker, NetError, NetResult};
use netplane_types::{BgpPeer, BgpPrefix};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

#[derive(Default)]
struct SpeakerState {
    peers: BTreeMap<IpAddr, BgpPeer>,
    prefixes: Vec<BgpPrefix>,
    fail_on: HashSet<&'static str>,
}

/// Keeps peers and prefixes in memory. Operations named in `fail_on`
/// (`add_peer`, `remove_peer`, `add_prefix`, `remove_prefix_by_owner`) fail.
#[derive(Default)]
pub struct FakeBgpSpeaker {
    state: Mutex<SpeakerState>,
}

impl FakeBgpSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().fail_on.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_on.clear();
    }

    pub fn peers(&self) -> Vec<BgpPeer> {
        self.state.lock().peers.values().cloned().collect()
    }

    pub fn prefixes(&self) -> Vec<BgpPrefix> {
        self.state.lock().prefixes.clone()
    }

    /// Prefixes of one owner scope, sorted by subnet.
    pub fn prefixes_for(&self, owner: &str) -> Vec<BgpPrefix> {
        let mut prefixes: Vec<BgpPrefix> = self
            .state
            .lock()
            .prefixes
            .iter()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        prefixes.sort_by_key(|p| p.subnet);
        prefixes
    }

    fn check(&self, op: &'static str) -> NetResult<()> {
        if self.state.lock().fail_on.contains(op) {
            return Err(NetError::internal(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl BgpSpeaker for FakeBgpSpeaker {
    async fn add_peer(
        &self,
        address: IpAddr,
        asn: u32,
        password: &str,
        hold_time: u32,
    ) -> NetResult<()> {
        self.check("add_peer")?;
        self.state.lock().peers.insert(
            address,
            BgpPeer {
                address,
                asn,
                password: password.to_string(),
                hold_time,
            },
        );
        Ok(())
    }

    async fn remove_peer(&self, address: IpAddr) -> NetResult<()> {
        self.check("remove_peer")?;
        self.state
            .lock()
            .peers
            .remove(&address)
            .map(|_| ())
            .ok_or_else(|| NetError::not_found("BGP peer", address.to_string()))
    }

    async fn add_prefix(&self, subnet: IpNet, next_hop: IpAddr, owner: &str) -> NetResult<()> {
        self.check("add_prefix")?;
        self.state.lock().prefixes.push(BgpPrefix {
            subnet,
            next_hop,
            owner: owner.to_string(),
        });
        Ok(())
    }

    async fn remove_prefix_by_owner(&self, owner: &str) -> NetResult<()> {
        self.check("remove_prefix_by_owner")?;
        self.state.lock().prefixes.retain(|p| p.owner != owner);
        Ok(())
    }
}
