//! SR-IOV virtual function allocation.
//!
//! Finding a free VF and recording the claim must not interleave with
//! another allocation, so [`allocate_with`] runs the reservation scan, the
//! sysfs scan, an optional VF count growth and the caller's claim step
//! under one process-wide lock.

use netplane_common::config::get;
use netplane_common::{NetError, NetResult, OsNetworkTool};
use netplane_types::{InstanceFilter, InstanceRecord};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::state::NetworkState;

static VIRTUAL_FUNCTION_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A claimed virtual function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualFunction {
    /// Host interface name of the VF.
    pub name: String,
    /// VF index on its parent.
    pub index: u32,
}

/// Why a VF can or cannot be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Free,
    /// Unbound from the host (passed to a VM).
    Unbound,
    Reserved,
    /// Belongs to another port of the same card.
    OtherPort,
    Up,
    HasAddresses,
}

/// One row of [`inspect_virtual_functions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualFunctionInfo {
    pub index: u32,
    pub name: Option<String>,
    pub eligibility: Eligibility,
}

/// `dev_port` and `dev_id` identity of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortIdentity {
    dev_port: String,
    dev_id: String,
}

impl PortIdentity {
    async fn read(dir: &Path) -> NetResult<Self> {
        Ok(Self {
            dev_port: read_trimmed(&dir.join("dev_port")).await?,
            dev_id: read_trimmed(&dir.join("dev_id")).await?,
        })
    }
}

async fn read_trimmed(path: &Path) -> NetResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| NetError::io(path.display().to_string(), e))
}

async fn read_count(path: &Path) -> NetResult<u32> {
    let raw = read_trimmed(path).await?;
    raw.parse().map_err(|_| {
        NetError::internal(format!("Invalid VF count {:?} in {}", raw, path.display()))
    })
}

async fn path_exists(path: &Path) -> NetResult<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| NetError::io(path.display().to_string(), e))
}

/// sysfs paths of one physical function.
struct PhysicalFunction {
    name: String,
    base: PathBuf,
}

impl PhysicalFunction {
    fn new(sysfs_net: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: sysfs_net.join(name),
        }
    }

    fn num_vfs_path(&self) -> PathBuf {
        self.base.join("device").join("sriov_numvfs")
    }

    fn total_vfs_path(&self) -> PathBuf {
        self.base.join("device").join("sriov_totalvfs")
    }

    fn vf_net_dir(&self, index: u32) -> PathBuf {
        self.base
            .join("device")
            .join(format!("virtfn{}", index))
            .join("net")
    }

    async fn ensure_sriov(&self) -> NetResult<()> {
        if !path_exists(&self.num_vfs_path()).await? {
            return Err(NetError::invalid_config(
                "parent",
                format!("Parent device {:?} doesn't support SR-IOV", self.name),
            ));
        }
        Ok(())
    }

    /// Interface names bound under `virtfn<index>/net`, sorted.
    async fn vf_interfaces(&self, index: u32) -> NetResult<Option<Vec<String>>> {
        let dir = self.vf_net_dir(index);
        if !path_exists(&dir).await? {
            return Ok(None);
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| NetError::io(dir.display().to_string(), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NetError::io(dir.display().to_string(), e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(Some(names))
    }

    async fn examine(
        &self,
        os: &dyn OsNetworkTool,
        index: u32,
        nic: &str,
        pf_identity: &PortIdentity,
        reserved: &HashSet<String>,
    ) -> NetResult<Eligibility> {
        if reserved.contains(nic) {
            return Ok(Eligibility::Reserved);
        }

        let identity = PortIdentity::read(&self.vf_net_dir(index).join(nic)).await?;
        if &identity != pf_identity {
            return Ok(Eligibility::OtherPort);
        }

        let status = os.link_status(nic).await?;
        if status.up {
            return Ok(Eligibility::Up);
        }
        if status.has_global_unicast() {
            return Ok(Eligibility::HasAddresses);
        }
        Ok(Eligibility::Free)
    }

    /// First free VF with index in `start..end`.
    async fn first_free(
        &self,
        os: &dyn OsNetworkTool,
        start: u32,
        end: u32,
        pf_identity: &PortIdentity,
        reserved: &HashSet<String>,
    ) -> NetResult<Option<VirtualFunction>> {
        for index in start..end {
            let Some(nics) = self.vf_interfaces(index).await? else {
                continue;
            };
            for nic in nics {
                let eligibility = self.examine(os, index, &nic, pf_identity, reserved).await?;
                if eligibility == Eligibility::Free {
                    return Ok(Some(VirtualFunction { name: nic, index }));
                }
                debug!(parent = %self.name, vf = %nic, ?eligibility, "Skipping virtual function");
            }
        }
        Ok(None)
    }
}

/// Host interfaces claimed on the local member by instance devices,
/// volatile host-name bindings and network parents.
pub async fn reserved_devices(state: &NetworkState) -> NetResult<HashSet<String>> {
    let mut reserved = HashSet::new();

    let filter = InstanceFilter::on_member(state.member.name.clone());
    state
        .store
        .instance_list(&filter, &mut |instance: &InstanceRecord| {
            for (name, device) in instance.expanded_devices() {
                let parent = get(&device, "parent");
                if !parent.is_empty() {
                    reserved.insert(parent.to_string());
                }

                let host_name = get(&instance.config, &format!("volatile.{}.host_name", name));
                if !host_name.is_empty() {
                    reserved.insert(host_name.to_string());
                }
            }
            Ok(())
        })
        .await?;

    let projects = state.store.get_all_created_networks().await?;
    for network in projects.values().flat_map(HashMap::values) {
        let parent = get(&network.config, "parent");
        if !parent.is_empty() {
            reserved.insert(parent.to_string());
        }
    }

    Ok(reserved)
}

/// Finds a free VF on `parent`, growing the enabled VF count to its
/// maximum when every enabled VF is taken. The caller must hold the
/// allocation lock.
async fn find_free_virtual_function(
    state: &NetworkState,
    parent: &str,
    reserved: &HashSet<String>,
) -> NetResult<VirtualFunction> {
    let pf = PhysicalFunction::new(state.sysfs_net(), parent);
    pf.ensure_sriov().await?;

    let pf_identity = PortIdentity::read(&pf.base).await?;
    let num_vfs = read_count(&pf.num_vfs_path()).await?;
    let total_vfs = read_count(&pf.total_vfs_path()).await?;

    // Some cards only expose VFs while the PF is up.
    state.os.set_up(parent).await?;

    if let Some(vf) = pf
        .first_free(state.os.as_ref(), 0, num_vfs, &pf_identity, reserved)
        .await?
    {
        return Ok(vf);
    }

    if num_vfs < total_vfs {
        debug!(parent = %parent, from = num_vfs, to = total_vfs, "Growing available virtual functions");

        let path = pf.num_vfs_path();
        tokio::fs::write(&path, total_vfs.to_string())
            .await
            .map_err(|e| NetError::io(path.display().to_string(), e))?;

        tokio::time::sleep(state.sriov_settle).await;

        if let Some(vf) = pf
            .first_free(state.os.as_ref(), num_vfs, total_vfs, &pf_identity, reserved)
            .await?
        {
            return Ok(vf);
        }
    }

    Err(NetError::exhausted(format!(
        "All virtual functions on parent device {:?} are already in use",
        parent
    )))
}

/// Finds a free VF on `parent` and runs `claim` with it, both under the
/// process-wide allocation lock.
///
/// `claim` should persist the choice (for example as
/// `volatile.<device>.host_name`) so the next allocation sees it reserved.
#[instrument(skip(state, claim), fields(parent = %parent))]
pub async fn allocate_with<F, Fut, T>(state: &NetworkState, parent: &str, claim: F) -> NetResult<T>
where
    F: FnOnce(VirtualFunction) -> Fut,
    Fut: Future<Output = NetResult<T>>,
{
    let _guard = VIRTUAL_FUNCTION_LOCK.lock().await;

    let reserved = reserved_devices(state)
        .await
        .map_err(|e| e.context("Failed getting in use device list"))?;
    let vf = find_free_virtual_function(state, parent, &reserved).await?;
    info!(vf = %vf.name, index = vf.index, "Allocated virtual function");

    claim(vf).await
}

/// Finds a free VF on `parent` without a claim step.
pub async fn allocate(state: &NetworkState, parent: &str) -> NetResult<VirtualFunction> {
    allocate_with(state, parent, |vf| async move { Ok(vf) }).await
}

/// Lists the enabled VFs of `parent` with their eligibility, ignoring
/// reservations and never growing the VF count.
pub async fn inspect_virtual_functions(
    sysfs_net: &Path,
    os: &dyn OsNetworkTool,
    parent: &str,
) -> NetResult<Vec<VirtualFunctionInfo>> {
    let pf = PhysicalFunction::new(sysfs_net, parent);
    pf.ensure_sriov().await?;

    let pf_identity = PortIdentity::read(&pf.base).await?;
    let num_vfs = read_count(&pf.num_vfs_path()).await?;
    let none = HashSet::new();

    let mut rows = Vec::new();
    for index in 0..num_vfs {
        match pf.vf_interfaces(index).await? {
            None => rows.push(VirtualFunctionInfo {
                index,
                name: None,
                eligibility: Eligibility::Unbound,
            }),
            Some(nics) => {
                for nic in nics {
                    let eligibility = pf.examine(os, index, &nic, &pf_identity, &none).await?;
                    rows.push(VirtualFunctionInfo {
                        index,
                        name: Some(nic),
                        eligibility,
                    });
                }
            }
        }
    }
    Ok(rows)
}
