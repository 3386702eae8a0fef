//! Test infrastructure for the netplane control plane
//!
//! Provides:
//! - In-memory cluster store with failure injection
//! - Recording cluster notifier and member clients
//! - BGP speaker and OS network tool fakes that keep observable state
//! - A temporary sysfs tree for SR-IOV scenarios
//! - Fixture builders for networks and instances

pub mod fixtures;
mod network_tool;
mod notifier;
mod speaker;
mod store;
mod sysfs;

pub use fixtures::*;
pub use network_tool::{FakeLink, FakeNetworkTool, LinkKind};
pub use notifier::{FakeMember, FakeNotifier, ReceivedUpdate};
pub use speaker::FakeBgpSpeaker;
pub use store::MemoryStore;
pub use sysfs::SysfsFixture;
