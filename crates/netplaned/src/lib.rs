//! Network control plane daemon.
//!
//! # Responsibilities
//!
//! - Drive managed networks (bridge, physical, macvlan, sriov) through
//!   their lifecycle: validate, create, start, update, rename, stop, delete
//! - Relay config updates to the other cluster members, minus member-local
//!   keys, before persisting them
//! - Keep BGP peers and exported prefixes in step with network config,
//!   address forwards and load balancers
//! - Compile forward and load balancer port-specs into listen/target maps
//! - Hand out SR-IOV virtual functions without double allocation
//!
//! # Example
//!
//! ```ignore
//! use netplaned::driver;
//! use netplaned::state::NetworkState;
//!
//! let state = Arc::new(NetworkState::new(store, notifier, bgp, os));
//! let mut net = driver::load_by_name(&state, "default", "br0").await?;
//! net.start().await?;
//! ```

pub mod bgp;
pub mod dhcp;
pub mod driver;
pub mod portspec;
pub mod settings;
pub mod sriov;
pub mod state;

pub use driver::{DriverRegistry, Network, NetworkCommon};
pub use settings::DaemonConfig;
pub use state::NetworkState;
