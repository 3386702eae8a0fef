//! Integration tests for BGP peer and prefix synchronization
//!
//! The fake speaker keeps peers by address and prefixes by owner, so each
//! test asserts the full exported state after a lifecycle step.

use netplane_test::{FakeCluster, NetworkFixture};
use netplane_types::{ClientType, ForwardPort, ForwardPut, NetworkPut, NetworkRecord};
use netplaned::{bgp, driver, Network, NetworkState};
use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::Arc;
use tempfile::TempDir;

fn state(cluster: &FakeCluster, dir: &TempDir) -> Arc<NetworkState> {
    Arc::new(
        NetworkState::new(
            cluster.store.clone(),
            cluster.notifier.clone(),
            cluster.bgp.clone(),
            cluster.os.clone(),
        )
        .with_var_dir(dir.path()),
    )
}

fn load(cluster: &FakeCluster, state: &Arc<NetworkState>, mut record: NetworkRecord) -> Box<dyn Network> {
    record.id = cluster.store.insert_network(record.clone());
    driver::load(state, record).unwrap()
}

fn peer_addresses(cluster: &FakeCluster) -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = cluster.bgp.peers().iter().map(|p| p.address).collect();
    addresses.sort();
    addresses
}

fn subnets(cluster: &FakeCluster, owner: &str) -> Vec<String> {
    cluster
        .bgp
        .prefixes_for(owner)
        .iter()
        .map(|p| p.subnet.to_string())
        .collect()
}

async fn set_config(net: &mut Box<dyn Network>, pairs: &[(&str, Option<&str>)]) {
    let mut config = net.common().config().clone();
    for (key, value) in pairs {
        match value {
            Some(value) => config.insert(key.to_string(), value.to_string()),
            None => config.remove(*key),
        };
    }
    net.update(NetworkPut::new("", config), None, ClientType::Normal)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_peer_changes_are_applied_as_a_diff() {
    let cluster = FakeCluster::with_links(["eth0"]);
    let dir = tempfile::tempdir().unwrap();
    let state = state(&cluster, &dir);
    let mut net = load(
        &cluster,
        &state,
        NetworkFixture::physical("phys0")
            .with_config("parent", "eth0")
            .with_config("bgp.peers.core.address", "192.0.2.1")
            .with_config("bgp.peers.core.asn", "65000")
            .build(),
    );

    net.start().await.unwrap();
    assert_eq!(peer_addresses(&cluster), vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);

    // Unrelated change keeps the peer.
    set_config(&mut net, &[("mtu", Some("9000"))]).await;
    assert_eq!(cluster.bgp.peers().len(), 1);

    set_config(
        &mut net,
        &[
            ("bgp.peers.edge.address", Some("2001:db8::1")),
            ("bgp.peers.edge.asn", Some("65001")),
            ("bgp.peers.edge.holdtime", Some("9")),
        ],
    )
    .await;
    assert_eq!(
        peer_addresses(&cluster),
        vec![
            "192.0.2.1".parse::<IpAddr>().unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        ]
    );
    let edge = cluster
        .bgp
        .peers()
        .into_iter()
        .find(|p| p.asn == 65001)
        .unwrap();
    assert_eq!(edge.hold_time, 9);

    set_config(
        &mut net,
        &[
            ("bgp.peers.core.address", None),
            ("bgp.peers.core.asn", None),
        ],
    )
    .await;
    assert_eq!(peer_addresses(&cluster), vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);

    net.stop().await.unwrap();
    assert!(cluster.bgp.peers().is_empty());
}

#[tokio::test]
async fn test_bridge_prefix_follows_nat() {
    let cluster = FakeCluster::default();
    let dir = tempfile::tempdir().unwrap();
    let state = state(&cluster, &dir);
    let mut net = load(
        &cluster,
        &state,
        NetworkFixture::bridge("br0")
            .with_config("ipv4.address", "10.1.2.1/24")
            .with_config("ipv6.address", "none")
            .with_config("bgp.ipv4.nexthop", "192.0.2.254")
            .build(),
    );
    let owner = bgp::owner(net.common().id());

    net.start().await.unwrap();
    let prefixes = cluster.bgp.prefixes_for(&owner);
    assert_eq!(prefixes.len(), 1);
    assert_eq!(prefixes[0].subnet.to_string(), "10.1.2.0/24");
    assert_eq!(prefixes[0].next_hop.to_string(), "192.0.2.254");

    set_config(
        &mut net,
        &[("ipv4.nat", Some("true")), ("ipv4.nat.address", Some("198.51.100.7"))],
    )
    .await;
    assert_eq!(subnets(&cluster, &owner), vec!["198.51.100.7/32"]);

    // NAT without a fixed address has nothing routable to export.
    set_config(&mut net, &[("ipv4.nat.address", None)]).await;
    assert!(subnets(&cluster, &owner).is_empty());
}

#[tokio::test]
async fn test_forward_exports_host_routes() {
    let cluster = FakeCluster::default();
    let dir = tempfile::tempdir().unwrap();
    let state = state(&cluster, &dir);
    let mut net = load(
        &cluster,
        &state,
        NetworkFixture::bridge("br0")
            .with_config("ipv4.address", "10.1.2.1/24")
            .with_config("ipv4.nat", "true")
            .with_config("ipv6.address", "none")
            .build(),
    );
    let owner = bgp::forward_owner(net.common().id());
    net.start().await.unwrap();

    let forward = |target: &str| ForwardPut {
        ports: vec![ForwardPort {
            protocol: "udp".into(),
            listen_port: "53".into(),
            target_address: target.into(),
            ..Default::default()
        }],
        ..Default::default()
    };

    net.forward_create("203.0.113.5", forward("10.1.2.53"), ClientType::Normal)
        .await
        .unwrap();
    // Inside the NATed subnet, so not exported on its own.
    net.forward_create("10.1.2.200", forward("10.1.2.54"), ClientType::Normal)
        .await
        .unwrap();
    net.forward_create("203.0.113.4", forward("10.1.2.55"), ClientType::Normal)
        .await
        .unwrap();
    assert_eq!(subnets(&cluster, &owner), vec!["203.0.113.4/32", "203.0.113.5/32"]);

    // Re-running the export is idempotent.
    net.common().forward_bgp_setup_prefixes().await.unwrap();
    assert_eq!(subnets(&cluster, &owner).len(), 2);

    net.forward_delete("203.0.113.5", ClientType::Normal).await.unwrap();
    assert_eq!(subnets(&cluster, &owner), vec!["203.0.113.4/32"]);

    net.stop().await.unwrap();
    assert!(cluster.bgp.prefixes().is_empty());
}

#[tokio::test]
async fn test_evacuation_withdraws_and_restore_reexports() {
    let cluster = FakeCluster::default();
    let dir = tempfile::tempdir().unwrap();
    let state = state(&cluster, &dir);
    let mut net = load(
        &cluster,
        &state,
        NetworkFixture::bridge("br0")
            .with_config("ipv4.address", "10.1.2.1/24")
            .with_config("ipv6.address", "none")
            .with_config("bgp.peers.core.address", "192.0.2.1")
            .with_config("bgp.peers.core.asn", "65000")
            .build(),
    );

    net.start().await.unwrap();
    assert_eq!(cluster.bgp.peers().len(), 1);
    assert_eq!(cluster.bgp.prefixes().len(), 1);

    state.member.set_evacuated(true);
    net.evacuate().await.unwrap();
    assert!(cluster.bgp.peers().is_empty());
    assert!(cluster.bgp.prefixes().is_empty());

    state.member.set_evacuated(false);
    net.restore().await.unwrap();
    assert_eq!(cluster.bgp.peers().len(), 1);
    assert_eq!(cluster.bgp.prefixes().len(), 1);
}
