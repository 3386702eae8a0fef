//! Address forward and load balancer specifications.

use crate::ConfigMap;
use serde::{Deserialize, Serialize};

/// A port-spec of an address forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPort {
    #[serde(default)]
    pub description: String,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Comma separated ports and ranges, e.g. `80,8000-8010`.
    pub listen_port: String,
    /// Comma separated target ports; empty keeps the listen ports.
    #[serde(default)]
    pub target_port: String,
    pub target_address: String,
}

/// User-modifiable part of an address forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPut {
    #[serde(default)]
    pub description: String,
    /// Accepts `target_address` (default target) and `user.*`.
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub ports: Vec<ForwardPort>,
}

/// A stored address forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkForward {
    pub id: i64,
    pub network_id: i64,
    pub listen_address: String,
    #[serde(flatten)]
    pub put: ForwardPut,
}

/// A named target of a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerBackend {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_port: String,
    pub target_address: String,
}

/// A port-spec of a load balancer referencing backends by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerPort {
    #[serde(default)]
    pub description: String,
    pub protocol: String,
    pub listen_port: String,
    #[serde(default)]
    pub target_backend: Vec<String>,
}

/// User-modifiable part of a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub backends: Vec<LoadBalancerBackend>,
    #[serde(default)]
    pub ports: Vec<LoadBalancerPort>,
}

/// A stored load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancer {
    pub id: i64,
    pub network_id: i64,
    pub listen_address: String,
    #[serde(flatten)]
    pub put: LoadBalancerPut,
}
