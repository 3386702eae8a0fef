//! Network peering requests.

use crate::ConfigMap;
use serde::{Deserialize, Serialize};

/// User-modifiable part of a network peering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPeerPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A peering from one network to a network in another project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPeer {
    pub name: String,
    pub target_project: String,
    pub target_network: String,
    #[serde(flatten)]
    pub put: NetworkPeerPut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_peer_flattens_put() {
        let json = r#"{"name":"p1","target_project":"blue","target_network":"ovn1","description":"x"}"#;
        let peer: NetworkPeer = serde_json::from_str(json).unwrap();
        assert_eq!(peer.put.description, "x");
        assert!(peer.put.config.is_empty());
    }
}
