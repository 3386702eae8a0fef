//! BGP speaker contract.

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::NetResult;

#[async_trait]
pub trait BgpSpeaker: Send + Sync {
    async fn add_peer(
        &self,
        address: IpAddr,
        asn: u32,
        password: &str,
        hold_time: u32,
    ) -> NetResult<()>;

    /// Removes a peer. Fails with `NotFound` if the speaker has no such peer.
    async fn remove_peer(&self, address: IpAddr) -> NetResult<()>;

    async fn add_prefix(&self, subnet: IpNet, next_hop: IpAddr, owner: &str) -> NetResult<()>;

    /// Withdraws every prefix registered under `owner`.
    async fn remove_prefix_by_owner(&self, owner: &str) -> NetResult<()>;
}
