//! Integration tests for SR-IOV virtual function allocation
//!
//! Uses a temporary sysfs tree for the physical function and records the
//! claims as instance `volatile.<device>.host_name` keys, the way device
//! setup persists them.

use netplane_common::NetError;
use netplane_test::{FakeCluster, InstanceFixture, MemoryStore, SysfsFixture};
use netplaned::sriov::{self, VirtualFunction};
use netplaned::NetworkState;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// PF `eth0` with four VFs, two of them enabled.
fn setup() -> (FakeCluster, SysfsFixture, NetworkState) {
    let sysfs = SysfsFixture::new().unwrap();
    sysfs.add_pf("eth0", 2, 4).unwrap();
    for index in 0..4 {
        sysfs.add_vf("eth0", index, &format!("eth0v{}", index)).unwrap();
    }

    let cluster = FakeCluster::with_links(["eth0", "eth0v0", "eth0v1", "eth0v2", "eth0v3"]);
    let state = NetworkState::new(
        cluster.store.clone(),
        cluster.notifier.clone(),
        cluster.bgp.clone(),
        cluster.os.clone(),
    )
    .with_sysfs_net(sysfs.root())
    .with_sriov_settle(Duration::ZERO);
    (cluster, sysfs, state)
}

fn reserve(store: &MemoryStore, instance: &str, vf: &str) {
    store.add_instance(
        InstanceFixture::new(instance)
            .with_network_nic("eth0", "sriov0")
            .with_config("volatile.eth0.host_name", vf)
            .build(),
    );
}

async fn claim(state: &NetworkState, store: Arc<MemoryStore>, instance: &str) -> Result<VirtualFunction, NetError> {
    let instance = instance.to_string();
    sriov::allocate_with(state, "eth0", |vf| async move {
        reserve(&store, &instance, &vf.name);
        Ok(vf)
    })
    .await
}

#[tokio::test]
async fn test_grows_vf_count_when_enabled_vfs_are_taken() {
    let (cluster, sysfs, state) = setup();
    reserve(&cluster.store, "c0", "eth0v0");
    reserve(&cluster.store, "c1", "eth0v1");

    let vf = claim(&state, cluster.store.clone(), "c2").await.unwrap();
    assert_eq!(vf, VirtualFunction { name: "eth0v2".into(), index: 2 });
    assert_eq!(sysfs.num_vfs("eth0").unwrap(), 4);

    let vf = claim(&state, cluster.store.clone(), "c3").await.unwrap();
    assert_eq!(vf.name, "eth0v3");

    let err = claim(&state, cluster.store.clone(), "c4").await.unwrap_err();
    assert!(matches!(err, NetError::ResourceExhausted { .. }));
    assert_eq!(
        err.to_string(),
        "All virtual functions on parent device \"eth0\" are already in use"
    );
}

#[tokio::test]
async fn test_exhausted_at_full_capacity_leaves_vf_count() {
    let sysfs = SysfsFixture::new().unwrap();
    sysfs.add_pf("eth0", 2, 2).unwrap();
    sysfs.add_vf("eth0", 0, "eth0v0").unwrap();
    sysfs.add_vf("eth0", 1, "eth0v1").unwrap();
    let cluster = FakeCluster::with_links(["eth0", "eth0v0", "eth0v1"]);
    let state = NetworkState::new(
        cluster.store.clone(),
        cluster.notifier.clone(),
        cluster.bgp.clone(),
        cluster.os.clone(),
    )
    .with_sysfs_net(sysfs.root())
    .with_sriov_settle(Duration::ZERO);
    reserve(&cluster.store, "c0", "eth0v0");
    reserve(&cluster.store, "c1", "eth0v1");

    let err = sriov::allocate(&state, "eth0").await.unwrap_err();
    assert!(matches!(err, NetError::ResourceExhausted { .. }));
    assert_eq!(sysfs.num_vfs("eth0").unwrap(), 2);
}

#[tokio::test]
async fn test_skips_vfs_in_use_by_the_host() {
    let (cluster, sysfs, state) = setup();
    cluster.os.set_link_up("eth0v0", true);
    cluster.os.add_link_address("eth0v1", "192.0.2.10".parse().unwrap());

    let vf = sriov::allocate(&state, "eth0").await.unwrap();
    assert_eq!(vf.name, "eth0v2");
    assert_eq!(sysfs.num_vfs("eth0").unwrap(), 4);
}

#[tokio::test]
async fn test_network_parents_are_reserved() {
    let (cluster, _sysfs, state) = setup();
    cluster.store.insert_network(
        netplane_test::NetworkFixture::macvlan("mac0")
            .with_config("parent", "eth0v0")
            .build(),
    );

    let vf = sriov::allocate(&state, "eth0").await.unwrap();
    assert_eq!(vf.name, "eth0v1");
}

#[tokio::test]
async fn test_network_parents_in_other_projects_are_reserved() {
    let (cluster, _sysfs, state) = setup();
    cluster.store.insert_network(
        netplane_test::NetworkFixture::macvlan("mac0")
            .in_project("tenant")
            .with_config("parent", "eth0v0")
            .build(),
    );
    cluster.store.insert_network(
        netplane_test::NetworkFixture::physical("phys0")
            .in_project("lab")
            .with_config("parent", "eth0v1")
            .build(),
    );

    let reserved = sriov::reserved_devices(&state).await.unwrap();
    assert!(reserved.contains("eth0v0"));
    assert!(reserved.contains("eth0v1"));

    let vf = sriov::allocate(&state, "eth0").await.unwrap();
    assert_eq!(vf.name, "eth0v2");
}

#[tokio::test]
async fn test_concurrent_claims_get_distinct_vfs() {
    let (cluster, _sysfs, state) = setup();

    let (a, b) = tokio::join!(
        claim(&state, cluster.store.clone(), "c0"),
        claim(&state, cluster.store.clone(), "c1"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.name, b.name);

    let mut names = vec![a.name, b.name];
    names.sort();
    assert_eq!(names, vec!["eth0v0", "eth0v1"]);
}

#[tokio::test]
async fn test_parent_without_sriov() {
    let (cluster, sysfs, state) = setup();
    sysfs.add_plain("eth1").unwrap();
    cluster.os.add_link("eth1");

    let err = sriov::allocate(&state, "eth1").await.unwrap_err();
    assert!(matches!(err, NetError::InvalidConfig { .. }));
}
