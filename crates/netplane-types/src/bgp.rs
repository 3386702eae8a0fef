//! BGP speaker state.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A BGP neighbor configured through `bgp.peers.<name>.*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BgpPeer {
    pub address: IpAddr,
    pub asn: u32,
    #[serde(default)]
    pub password: String,
    /// Hold time in seconds, 0 for the speaker default.
    #[serde(default)]
    pub hold_time: u32,
}

/// A prefix advertised on behalf of an owner scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BgpPrefix {
    pub subnet: IpNet,
    pub next_hop: IpAddr,
    pub owner: String,
}
