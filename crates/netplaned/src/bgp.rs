//! BGP peer and prefix synchronization.
//!
//! Peers come from the `bgp.peers.<name>.{address,asn,password,holdtime}`
//! keys and are diffed between the old and new config. Prefixes are grouped
//! by owner scope and always refreshed by removing the whole scope first,
//! then adding from scratch, so a repeated refresh never duplicates.

use ipnet::IpNet;
use netplane_common::config::{get, is_true};
use netplane_common::validate::{is_any, is_in_range, is_network_address, optional};
use netplane_common::{BgpSpeaker, NetError, NetResult, RuleSet};
use netplane_types::{BgpPeer, ConfigMap};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

const PEERS_PREFIX: &str = "bgp.peers.";

/// Owner scope of a network's own prefixes.
pub fn owner(network_id: i64) -> String {
    format!("network_{}", network_id)
}

/// Owner scope of a network's address forward prefixes.
pub fn forward_owner(network_id: i64) -> String {
    format!("network_{}_forward", network_id)
}

/// Owner scope of a network's load balancer prefixes.
pub fn load_balancer_owner(network_id: i64) -> String {
    format!("network_{}_load_balancer", network_id)
}

/// Generates one rule per `bgp.peers.<name>.<field>` key present in `config`.
///
/// Unknown fields get no rule, so the caller's validation rejects them as
/// unknown keys.
pub fn validation_rules(config: &ConfigMap) -> NetResult<RuleSet> {
    let mut rules = RuleSet::new();
    for key in config.keys() {
        if !key.starts_with(PEERS_PREFIX) {
            continue;
        }

        let fields: Vec<&str> = key.split('.').collect();
        if fields.len() != 4 {
            return Err(NetError::invalid_config(
                key.clone(),
                format!("Invalid network configuration key: {:?}", key),
            ));
        }

        match fields[3] {
            "address" => rules.insert(key.clone(), optional(is_network_address)),
            "asn" => rules.insert(key.clone(), optional(is_in_range(1, 4_294_967_294))),
            "password" => rules.insert(key.clone(), is_any),
            "holdtime" => rules.insert(key.clone(), optional(is_in_range(9, 65535))),
            _ => {}
        }
    }
    Ok(rules)
}

/// Comparable `address,asn,password,holdtime` strings for every peer that
/// has both an address and an ASN, sorted by peer name.
pub fn peer_strings(config: &ConfigMap) -> Vec<String> {
    let names: BTreeSet<&str> = config
        .keys()
        .filter_map(|k| k.strip_prefix(PEERS_PREFIX))
        .filter_map(|rest| rest.split('.').next())
        .collect();

    names
        .into_iter()
        .filter_map(|name| {
            let field = |f: &str| get(config, &format!("{}{}.{}", PEERS_PREFIX, name, f)).to_string();
            let address = field("address");
            let asn = field("asn");
            if address.is_empty() || asn.is_empty() {
                return None;
            }
            Some(format!(
                "{},{},{},{}",
                address,
                asn,
                field("password"),
                field("holdtime")
            ))
        })
        .collect()
}

fn peer_address(peer: &str) -> NetResult<IpAddr> {
    let address = peer.split(',').next().unwrap_or_default();
    address
        .parse()
        .map_err(|_| NetError::invalid_config("bgp.peers", format!("Invalid peer address {:?}", address)))
}

/// Parses a peer string produced by [`peer_strings`].
pub fn parse_peer(peer: &str) -> NetResult<BgpPeer> {
    let fields: Vec<&str> = peer.splitn(4, ',').collect();
    if fields.len() != 4 {
        return Err(NetError::internal(format!("Malformed BGP peer {:?}", peer)));
    }

    let asn: u32 = fields[1]
        .parse()
        .map_err(|_| NetError::invalid_config("bgp.peers", format!("Invalid ASN {:?}", fields[1])))?;
    let hold_time: u32 = if fields[3].is_empty() {
        0
    } else {
        fields[3].parse().map_err(|_| {
            NetError::invalid_config("bgp.peers", format!("Invalid hold time {:?}", fields[3]))
        })?
    };

    Ok(BgpPeer {
        address: peer_address(peer)?,
        asn,
        password: fields[2].to_string(),
        hold_time,
    })
}

/// Removes peers present only in `old` and adds peers present only in `new`.
pub async fn setup_peers(
    speaker: &dyn BgpSpeaker,
    old: Option<&ConfigMap>,
    new: &ConfigMap,
) -> NetResult<()> {
    let new_peers = peer_strings(new);
    let old_peers = old.map(peer_strings).unwrap_or_default();

    for peer in old_peers.iter().filter(|p| !new_peers.contains(p)) {
        let address = peer_address(peer)?;
        speaker.remove_peer(address).await?;
        info!(peer = %address, "Removed BGP peer");
    }

    for peer in new_peers.iter().filter(|p| !old_peers.contains(p)) {
        let parsed = parse_peer(peer)?;
        speaker
            .add_peer(parsed.address, parsed.asn, &parsed.password, parsed.hold_time)
            .await?;
        info!(peer = %parsed.address, asn = parsed.asn, "Added BGP peer");
    }

    Ok(())
}

/// Removes every peer of `config`, ignoring peers the speaker does not know.
pub async fn clear_peers(speaker: &dyn BgpSpeaker, config: &ConfigMap) -> NetResult<()> {
    for peer in peer_strings(config) {
        let address = peer_address(&peer)?;
        match speaker.remove_peer(address).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(peer = %address, "BGP peer already absent");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Next hop for prefixes of one IP family: `bgp.ipv{4,6}.nexthop`, then
/// `volatile.network.ipv{4,6}.address`, then the wildcard address.
pub fn next_hop(config: &ConfigMap, ipv6: bool) -> IpAddr {
    let version = if ipv6 { 6 } else { 4 };
    let explicit = get(config, &format!("bgp.ipv{}.nexthop", version));
    let recorded = get(config, &format!("volatile.network.ipv{}.address", version));

    explicit
        .parse()
        .or_else(|_| recorded.parse())
        .unwrap_or(if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        })
}

/// Host route (`/32` or `/128`) for an address.
pub fn host_route(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

/// Prefixes a network advertises for itself, per IP family:
/// its NAT address when NAT is on and one is set, otherwise its own subnet.
pub fn network_prefixes(config: &ConfigMap) -> NetResult<Vec<(IpNet, IpAddr)>> {
    let mut prefixes = Vec::new();
    for ipv6 in [false, true] {
        let version = if ipv6 { 6 } else { 4 };
        let hop = next_hop(config, ipv6);

        if is_true(get(config, &format!("ipv{}.nat", version))) {
            let key = format!("ipv{}.nat.address", version);
            let nat_address = get(config, &key);
            if !nat_address.is_empty() {
                let ip: IpAddr = nat_address.parse().map_err(|_| {
                    NetError::invalid_config(key.clone(), format!("Invalid NAT address {:?}", nat_address))
                })?;
                prefixes.push((host_route(ip), hop));
            }
            continue;
        }

        let key = format!("ipv{}.address", version);
        let address = get(config, &key);
        if address.is_empty() || address == "none" {
            continue;
        }
        let subnet: IpNet = address.parse().map_err(|_| {
            NetError::invalid_config(key.clone(), format!("Failed parsing network address {:?}", address))
        })?;
        prefixes.push((subnet.trunc(), hop));
    }
    Ok(prefixes)
}

/// Replaces the network's own prefixes.
pub async fn setup_prefixes(
    speaker: &dyn BgpSpeaker,
    network_id: i64,
    config: &ConfigMap,
) -> NetResult<()> {
    let owner = owner(network_id);
    speaker.remove_prefix_by_owner(&owner).await?;

    for (subnet, hop) in network_prefixes(config)? {
        speaker.add_prefix(subnet, hop, &owner).await?;
        debug!(owner = %owner, subnet = %subnet, next_hop = %hop, "Exported BGP prefix");
    }
    Ok(())
}

/// Replaces the prefixes of `owner` with host routes for `listen_addresses`.
///
/// An address inside the network's own subnet is skipped when NAT is on
/// for its family, as the network's advertised subnet already covers it.
pub async fn export_listen_addresses<'a, I>(
    speaker: &dyn BgpSpeaker,
    owner: &str,
    config: &ConfigMap,
    listen_addresses: I,
) -> NetResult<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut by_family: [Vec<IpAddr>; 2] = [Vec::new(), Vec::new()];
    for address in listen_addresses {
        match address.parse::<IpAddr>() {
            Ok(ip) => by_family[usize::from(ip.is_ipv6())].push(ip),
            Err(_) => warn!(owner = %owner, address = %address, "Skipping unparsable listen address"),
        }
    }

    speaker.remove_prefix_by_owner(owner).await?;

    for ipv6 in [false, true] {
        let version = if ipv6 { 6 } else { 4 };
        let hop = next_hop(config, ipv6);
        let nat = is_true(get(config, &format!("ipv{}.nat", version)));
        let subnet: Option<IpNet> = get(config, &format!("ipv{}.address", version)).parse().ok();

        let mut addresses = by_family[usize::from(ipv6)].clone();
        addresses.sort();
        for ip in addresses {
            if nat && subnet.map_or(false, |s| s.contains(&ip)) {
                continue;
            }
            speaker.add_prefix(host_route(ip), hop, owner).await?;
        }
    }
    Ok(())
}

/// Removes every peer and the network and forward prefix scopes.
pub async fn clear(speaker: &dyn BgpSpeaker, network_id: i64, config: &ConfigMap) -> NetResult<()> {
    clear_peers(speaker, config).await?;
    speaker.remove_prefix_by_owner(&owner(network_id)).await?;
    speaker
        .remove_prefix_by_owner(&forward_owner(network_id))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_test::{config_map, FakeBgpSpeaker};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validation_rules_per_field() {
        let config = config_map(&[
            ("bgp.peers.core.address", "192.0.2.1"),
            ("bgp.peers.core.asn", "65000"),
            ("bgp.peers.core.holdtime", "8"),
            ("bgp.peers.core.bogus", "x"),
        ]);
        let rules = validation_rules(&config).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.check("bgp.peers.core.asn", "65000").unwrap().is_ok());
        assert!(rules.check("bgp.peers.core.asn", "0").unwrap().is_err());
        assert!(rules.check("bgp.peers.core.holdtime", "8").unwrap().is_err());
        assert!(rules.check("bgp.peers.core.bogus", "x").is_none());
    }

    #[test]
    fn test_validation_rules_bad_key_shape() {
        let config = config_map(&[("bgp.peers.core.extra.asn", "65000")]);
        assert!(matches!(
            validation_rules(&config),
            Err(NetError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_peer_strings_require_address_and_asn() {
        let config = config_map(&[
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65000"),
            ("bgp.peers.a.holdtime", "30"),
            ("bgp.peers.b.address", "192.0.2.2"),
        ]);
        assert_eq!(peer_strings(&config), vec!["192.0.2.1,65000,,30"]);
    }

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("2001:db8::1,4200000000,secret,").unwrap();
        assert_eq!(peer.asn, 4_200_000_000);
        assert_eq!(peer.password, "secret");
        assert_eq!(peer.hold_time, 0);
        assert!(parse_peer("192.0.2.1,notanumber,,").is_err());
    }

    #[test]
    fn test_next_hop_order() {
        let mut config = config_map(&[("volatile.network.ipv4.address", "198.51.100.7")]);
        assert_eq!(next_hop(&config, false), "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(next_hop(&config, true), "::".parse::<IpAddr>().unwrap());

        config.insert("bgp.ipv4.nexthop".into(), "198.51.100.1".into());
        assert_eq!(next_hop(&config, false), "198.51.100.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_setup_peers_diff() {
        let speaker = FakeBgpSpeaker::new();
        let old = config_map(&[
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65001"),
            ("bgp.peers.b.address", "192.0.2.2"),
            ("bgp.peers.b.asn", "65002"),
        ]);
        setup_peers(&speaker, None, &old).await.unwrap();
        assert_eq!(speaker.peers().len(), 2);

        let new = config_map(&[
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65001"),
            ("bgp.peers.c.address", "192.0.2.3"),
            ("bgp.peers.c.asn", "65003"),
            ("bgp.peers.c.holdtime", "90"),
        ]);
        setup_peers(&speaker, Some(&old), &new).await.unwrap();

        let peers = speaker.peers();
        let addresses: Vec<String> = peers.iter().map(|p| p.address.to_string()).collect();
        assert_eq!(addresses, vec!["192.0.2.1", "192.0.2.3"]);
        assert_eq!(peers[1].hold_time, 90);
    }

    #[tokio::test]
    async fn test_setup_prefixes_nat_and_subnet() {
        let speaker = FakeBgpSpeaker::new();
        let config = config_map(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("ipv4.nat", "true"),
            ("ipv4.nat.address", "198.51.100.10"),
            ("ipv6.address", "fd42::1/64"),
            ("bgp.ipv6.nexthop", "2001:db8::1"),
        ]);
        setup_prefixes(&speaker, 7, &config).await.unwrap();

        let prefixes = speaker.prefixes_for("network_7");
        let subnets: Vec<String> = prefixes.iter().map(|p| p.subnet.to_string()).collect();
        assert_eq!(subnets, vec!["198.51.100.10/32", "fd42::/64"]);
        assert_eq!(prefixes[1].next_hop, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_setup_prefixes_idempotent() {
        let speaker = FakeBgpSpeaker::new();
        let config = config_map(&[("ipv4.address", "10.1.0.1/16")]);

        setup_prefixes(&speaker, 3, &config).await.unwrap();
        let first = speaker.prefixes_for("network_3");
        setup_prefixes(&speaker, 3, &config).await.unwrap();

        assert_eq!(speaker.prefixes_for("network_3"), first);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].subnet.to_string(), "10.1.0.0/16");
    }

    #[tokio::test]
    async fn test_export_skips_internal_nat_addresses() {
        let speaker = FakeBgpSpeaker::new();
        let config = config_map(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let listen = vec!["10.0.0.50".to_string(), "198.51.100.20".to_string()];

        export_listen_addresses(&speaker, &forward_owner(4), &config, &listen)
            .await
            .unwrap();

        let prefixes = speaker.prefixes_for("network_4_forward");
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].subnet.to_string(), "198.51.100.20/32");
    }

    #[tokio::test]
    async fn test_clear_ignores_unknown_peers() {
        let speaker = FakeBgpSpeaker::new();
        let config = config_map(&[
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65001"),
            ("ipv4.address", "10.0.0.1/24"),
        ]);
        setup_prefixes(&speaker, 9, &config).await.unwrap();
        speaker
            .add_prefix("192.0.2.9/32".parse().unwrap(), "0.0.0.0".parse().unwrap(), "network_9_load_balancer")
            .await
            .unwrap();

        clear(&speaker, 9, &config).await.unwrap();
        assert!(speaker.prefixes_for("network_9").is_empty());
        assert_eq!(speaker.prefixes_for("network_9_load_balancer").len(), 1);
    }
}
