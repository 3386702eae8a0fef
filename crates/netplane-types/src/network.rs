//! Network records and the mutable put payload.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Flat `key -> value` configuration map of a network or sub-resource.
pub type ConfigMap = HashMap<String, String>;

/// Cluster-wide (or per-member) status of a network record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    /// Accepted by the store but not yet set up on every member.
    #[default]
    Pending,
    /// Set up on every member.
    Created,
    /// Creation failed on at least one member.
    Errored,
    /// Created but not currently usable on this member.
    Unavailable,
    /// No status is recorded for the member.
    Unknown,
}

impl NetworkStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Pending => "Pending",
            NetworkStatus::Created => "Created",
            NetworkStatus::Errored => "Errored",
            NetworkStatus::Unavailable => "Unavailable",
            NetworkStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(NetworkStatus::Pending),
            "created" => Ok(NetworkStatus::Created),
            "errored" => Ok(NetworkStatus::Errored),
            "unavailable" => Ok(NetworkStatus::Unavailable),
            "unknown" => Ok(NetworkStatus::Unknown),
            _ => Err(ParseError::InvalidStatus(s.to_string())),
        }
    }
}

/// Origin of a lifecycle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Request issued by a user against this member.
    #[default]
    Normal,
    /// Request relayed by another member while it broadcasts a change.
    Notifier,
}

impl ClientType {
    /// Returns the client type as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Normal => "normal",
            ClientType::Notifier => "notifier",
        }
    }
}

impl FromStr for ClientType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(ClientType::Normal),
            "notifier" => Ok(ClientType::Notifier),
            _ => Err(ParseError::InvalidClientType(s.to_string())),
        }
    }
}

/// The user-modifiable part of a network: description and config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
}

impl NetworkPut {
    pub fn new(description: impl Into<String>, config: ConfigMap) -> Self {
        Self {
            description: description.into(),
            config,
        }
    }
}

/// A network as stored in the cluster store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    /// Driver type name (`bridge`, `physical`, `macvlan`, `sriov`).
    pub net_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub status: NetworkStatus,
    #[serde(default = "default_managed")]
    pub managed: bool,
    /// Per-member status keyed by member ID.
    #[serde(default)]
    pub member_status: HashMap<i64, NetworkStatus>,
}

fn default_managed() -> bool {
    true
}

impl NetworkRecord {
    /// Returns the mutable part of the record.
    pub fn put(&self) -> NetworkPut {
        NetworkPut {
            description: self.description.clone(),
            config: self.config.clone(),
        }
    }

    /// Status of the network on the given member.
    pub fn member_status(&self, member_id: i64) -> NetworkStatus {
        self.member_status
            .get(&member_id)
            .copied()
            .unwrap_or(NetworkStatus::Unknown)
    }
}
