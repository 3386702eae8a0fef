//! Common infrastructure for the netplane network control plane.
//!
//! This crate provides:
//! - The [`NetError`] taxonomy and [`NetResult`] alias
//! - The config key [`validate`] engine and shared key conventions ([`config`])
//! - [`Reverter`], the undo stack used by multi-step operations
//! - Collaborator contracts: [`ClusterStore`], [`ClusterNotifier`],
//!   [`BgpSpeaker`] and [`OsNetworkTool`]
//! - [`ShellNetworkTool`], the `ip`/`ovs-vsctl` implementation of the OS tool

pub mod commands;
pub mod config;
pub mod error;
pub mod notify;
pub mod ostool;
pub mod revert;
pub mod shell;
pub mod speaker;
pub mod store;
pub mod validate;

pub use error::{NetError, NetResult};
pub use notify::{notify_all, ClusterNotifier, MemberClient};
pub use ostool::{LinkStatus, OsNetworkTool, ShellNetworkTool};
pub use revert::Reverter;
pub use speaker::BgpSpeaker;
pub use store::{ClusterStore, InstanceCallback};
pub use validate::{Rule, RuleResult, RuleSet};
