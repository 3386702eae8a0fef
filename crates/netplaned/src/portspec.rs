//! Forward and load balancer port specification compiler.
//!
//! Turns user supplied port-spec strings (`"80-90,443"`) into concrete
//! [`PortMap`]s and [`LoadBalancerPortMap`]s, checking protocols, target
//! address families and subnets, listen port uniqueness per protocol and
//! listen/target port counts. Every error names the 0-based port-spec or
//! backend index it came from.

use ipnet::IpNet;
use netplane_common::config::{is_user_key, split_list};
use netplane_common::{NetError, NetResult};
use netplane_types::{ForwardPut, LoadBalancerPut};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

/// Protocols a port-spec may use.
pub const VALID_PROTOCOLS: &[&str] = &["tcp", "udp"];

/// Config key naming a forward's default target.
pub const TARGET_ADDRESS_KEY: &str = "target_address";

/// Target side of a compiled port map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapTarget {
    pub address: IpAddr,
    /// Empty means "same as the listen port".
    pub ports: Vec<u64>,
}

/// Compiled forward port-spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMap {
    pub protocol: String,
    pub listen_ports: Vec<u64>,
    pub target: PortMapTarget,
}

/// Compiled load balancer port-spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancerPortMap {
    pub protocol: String,
    pub listen_ports: Vec<u64>,
    pub targets: Vec<PortMapTarget>,
}

/// Compiled maps exposing their listen side.
pub trait ListenPorts {
    fn protocol(&self) -> &str;
    fn listen_ports(&self) -> &[u64];
}

impl ListenPorts for PortMap {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn listen_ports(&self) -> &[u64] {
        &self.listen_ports
    }
}

impl ListenPorts for LoadBalancerPortMap {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn listen_ports(&self) -> &[u64] {
        &self.listen_ports
    }
}

/// The `(protocol, listen_port)` set covered by `maps`.
pub fn flatten<M: ListenPorts>(maps: &[M]) -> BTreeSet<(String, u64)> {
    maps.iter()
        .flat_map(|m| {
            m.listen_ports()
                .iter()
                .map(move |p| (m.protocol().to_string(), *p))
        })
        .collect()
}

/// Parses `"port"` or `"start-end"` into `(first, count)`.
///
/// A range requires `end > start`, and every port must fit in a `u16`.
pub fn parse_port_range(range: &str) -> Result<(u64, u64), String> {
    let entries: Vec<&str> = range.split('-').collect();
    if entries.len() > 2 {
        return Err(format!("Invalid port range {:?}", range));
    }

    let base: u64 = entries[0]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid port {:?}", entries[0]))?;

    let mut last = base;
    if let Some(end) = entries.get(1) {
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| format!("Invalid port {:?}", end))?;
        if end <= base {
            return Err("End port should be higher than start port".to_string());
        }
        last = end;
    }

    if last > u64::from(u16::MAX) {
        return Err(format!("Port range {:?} exceeds {}", range, u16::MAX));
    }

    Ok((base, last - base + 1))
}

/// Expands a comma separated list of port ranges.
fn expand_ports(spec: &str) -> Result<Vec<u64>, String> {
    let mut ports = Vec::new();
    for range in split_list(spec) {
        let (first, count) = parse_port_range(&range)?;
        ports.extend(first..first + count);
    }
    Ok(ports)
}

fn port_spec_error(index: usize, message: impl Into<String>) -> NetError {
    NetError::invalid_config(format!("ports[{}]", index), message)
}

fn backend_error(index: usize, message: impl Into<String>) -> NetError {
    NetError::invalid_config(format!("backends[{}]", index), message)
}

/// Tracks used listen ports per protocol across a whole spec.
#[derive(Default)]
struct ListenPortRegistry {
    used: HashMap<String, HashSet<u64>>,
}

impl ListenPortRegistry {
    fn claim(&mut self, index: usize, protocol: &str, listen_port: &str) -> NetResult<Vec<u64>> {
        if !VALID_PROTOCOLS.contains(&protocol) {
            return Err(port_spec_error(
                index,
                format!(
                    "Invalid port protocol in port specification {}, protocol must be one of: {}",
                    index,
                    VALID_PROTOCOLS.join(", ")
                ),
            ));
        }

        let ranges = split_list(listen_port);
        if ranges.is_empty() {
            return Err(port_spec_error(
                index,
                format!("Missing listen port in port specification {}", index),
            ));
        }

        let used = self.used.entry(protocol.to_string()).or_default();
        let mut ports = Vec::new();
        for range in ranges {
            let (first, count) = parse_port_range(&range).map_err(|e| {
                port_spec_error(
                    index,
                    format!("Invalid listen port in port specification {}: {}", index, e),
                )
            })?;
            for port in first..first + count {
                if !used.insert(port) {
                    return Err(NetError::conflict(format!(
                        "Duplicate listen port {} for protocol {:?} in port specification {}",
                        port, protocol, index
                    )));
                }
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

/// Where compiled targets must live.
#[derive(Debug, Clone, Copy)]
struct ListenContext {
    listen: IpAddr,
    subnet: Option<IpNet>,
}

impl ListenContext {
    fn new(listen_address: IpAddr, subnet: Option<IpNet>) -> Self {
        Self {
            listen: listen_address,
            subnet: subnet.filter(|s| s.addr().is_ipv4() == listen_address.is_ipv4()),
        }
    }

    fn same_family(&self, ip: &IpAddr) -> bool {
        ip.is_ipv4() == self.listen.is_ipv4()
    }

    fn in_subnet(&self, ip: &IpAddr) -> bool {
        self.subnet.map_or(true, |s| s.contains(ip))
    }
}

fn check_unknown_keys(config: &netplane_types::ConfigMap, allowed: &[&str]) -> NetResult<()> {
    let mut keys: Vec<&String> = config.keys().collect();
    keys.sort();
    for key in keys {
        if allowed.contains(&key.as_str()) || is_user_key(key) {
            continue;
        }
        return Err(NetError::invalid_config(
            key.clone(),
            format!("Invalid option {:?}", key),
        ));
    }
    Ok(())
}

fn check_listen_address(listen_address: IpAddr) -> NetResult<()> {
    if listen_address.is_unspecified() {
        return Err(NetError::invalid_config(
            "listen_address",
            format!("Cannot use unspecified address: {:?}", listen_address.to_string()),
        ));
    }
    Ok(())
}

/// Compiles and validates a forward listening on `listen_address`.
///
/// `subnet` is the network's configured subnet for the listen address's
/// family, if any; targets must fall inside it.
pub fn forward_validate(
    listen_address: IpAddr,
    subnet: Option<IpNet>,
    forward: &ForwardPut,
) -> NetResult<Vec<PortMap>> {
    check_listen_address(listen_address)?;
    let ctx = ListenContext::new(listen_address, subnet);

    check_unknown_keys(&forward.config, &[TARGET_ADDRESS_KEY])?;

    let default_target = forward
        .config
        .get(TARGET_ADDRESS_KEY)
        .map(String::as_str)
        .unwrap_or("");
    let default_target: Option<IpAddr> = if default_target.is_empty() {
        None
    } else {
        let ip: IpAddr = default_target.parse().map_err(|_| {
            NetError::invalid_config(TARGET_ADDRESS_KEY, "Invalid default target address")
        })?;
        if !ctx.same_family(&ip) {
            return Err(NetError::invalid_config(
                TARGET_ADDRESS_KEY,
                "Cannot mix IP versions in listen address and default target address",
            ));
        }
        if !ctx.in_subnet(&ip) {
            return Err(NetError::invalid_config(
                TARGET_ADDRESS_KEY,
                "Default target address is not within the network subnet",
            ));
        }
        Some(ip)
    };

    let mut registry = ListenPortRegistry::default();
    let mut maps = Vec::with_capacity(forward.ports.len());

    for (index, spec) in forward.ports.iter().enumerate() {
        let listen_ports = registry.claim(index, &spec.protocol, &spec.listen_port)?;

        let target: IpAddr = spec.target_address.parse().map_err(|_| {
            port_spec_error(
                index,
                format!("Invalid target address in port specification {}", index),
            )
        })?;
        if Some(target) == default_target {
            return Err(port_spec_error(
                index,
                format!(
                    "Target address is same as default target address in port specification {}",
                    index
                ),
            ));
        }
        if !ctx.same_family(&target) {
            return Err(port_spec_error(
                index,
                format!(
                    "Cannot mix IP versions in listen address and port specification {} target address",
                    index
                ),
            ));
        }
        if !ctx.in_subnet(&target) {
            return Err(port_spec_error(
                index,
                format!(
                    "Target address is not within the network subnet in port specification {}",
                    index
                ),
            ));
        }

        let target_ports = expand_ports(&spec.target_port).map_err(|_| {
            port_spec_error(
                index,
                format!("Invalid target port in port specification {}", index),
            )
        })?;

        // One target port fans in any number of listen ports.
        if !target_ports.is_empty()
            && target_ports.len() != 1
            && target_ports.len() != listen_ports.len()
        {
            return Err(port_spec_error(
                index,
                format!(
                    "Mismatch of listen port(s) and target port(s) count in port specification {}",
                    index
                ),
            ));
        }

        maps.push(PortMap {
            protocol: spec.protocol.clone(),
            listen_ports,
            target: PortMapTarget {
                address: target,
                ports: target_ports,
            },
        });
    }

    Ok(maps)
}

/// Compiles and validates a load balancer listening on `listen_address`.
pub fn load_balancer_validate(
    listen_address: IpAddr,
    subnet: Option<IpNet>,
    lb: &LoadBalancerPut,
) -> NetResult<Vec<LoadBalancerPortMap>> {
    check_listen_address(listen_address)?;
    let ctx = ListenContext::new(listen_address, subnet);

    check_unknown_keys(&lb.config, &[])?;

    let mut backends: HashMap<&str, PortMapTarget> = HashMap::with_capacity(lb.backends.len());
    for (index, backend) in lb.backends.iter().enumerate() {
        if backend.name.chars().any(char::is_whitespace) {
            return Err(backend_error(
                index,
                format!("Name cannot contain white space in backend specification {}", index),
            ));
        }
        if backends.contains_key(backend.name.as_str()) {
            return Err(backend_error(
                index,
                format!(
                    "Duplicate name {:?} in backend specification {}",
                    backend.name, index
                ),
            ));
        }

        let address: IpAddr = backend.target_address.parse().map_err(|_| {
            backend_error(
                index,
                format!("Invalid target address for backend {:?}", backend.name),
            )
        })?;
        if !ctx.same_family(&address) {
            return Err(backend_error(
                index,
                format!(
                    "Cannot mix IP versions in listen address and backend {:?} target address",
                    backend.name
                ),
            ));
        }
        if !ctx.in_subnet(&address) {
            return Err(backend_error(
                index,
                format!(
                    "Target address is not within the network subnet for backend {:?}",
                    backend.name
                ),
            ));
        }

        let mut ports = Vec::new();
        for (range_index, range) in split_list(&backend.target_port).iter().enumerate() {
            let (first, count) = parse_port_range(range).map_err(|e| {
                backend_error(
                    index,
                    format!(
                        "Invalid backend port specification {} in backend specification {}: {}",
                        range_index, index, e
                    ),
                )
            })?;
            ports.extend(first..first + count);
        }

        backends.insert(backend.name.as_str(), PortMapTarget { address, ports });
    }

    let mut registry = ListenPortRegistry::default();
    let mut maps = Vec::with_capacity(lb.ports.len());

    for (index, spec) in lb.ports.iter().enumerate() {
        let listen_ports = registry.claim(index, &spec.protocol, &spec.listen_port)?;

        let mut targets = Vec::with_capacity(spec.target_backend.len());
        for name in &spec.target_backend {
            let backend = backends.get(name.as_str()).ok_or_else(|| {
                port_spec_error(
                    index,
                    format!(
                        "Invalid target backend name {:?} in port specification {}",
                        name, index
                    ),
                )
            })?;

            if backend.ports.len() > 1 && backend.ports.len() != listen_ports.len() {
                return Err(port_spec_error(
                    index,
                    format!(
                        "Mismatch of listen port(s) and target port(s) count for backend {:?} in port specification {}",
                        name, index
                    ),
                ));
            }
            targets.push(backend.clone());
        }

        maps.push(LoadBalancerPortMap {
            protocol: spec.protocol.clone(),
            listen_ports,
            targets,
        });
    }

    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplane_types::{ForwardPort, LoadBalancerBackend, LoadBalancerPort};
    use pretty_assertions::assert_eq;

    fn listen() -> IpAddr {
        "198.51.100.10".parse().unwrap()
    }

    fn subnet() -> Option<IpNet> {
        Some("10.0.0.0/24".parse().unwrap())
    }

    fn port(protocol: &str, listen_port: &str, target_port: &str) -> ForwardPort {
        ForwardPort {
            description: String::new(),
            protocol: protocol.to_string(),
            listen_port: listen_port.to_string(),
            target_port: target_port.to_string(),
            target_address: "10.0.0.5".to_string(),
        }
    }

    fn forward(ports: Vec<ForwardPort>) -> ForwardPut {
        ForwardPut {
            ports,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("80").unwrap(), (80, 1));
        assert_eq!(parse_port_range("80-90").unwrap(), (80, 11));
        assert!(parse_port_range("90-80").is_err());
        assert!(parse_port_range("80-80").is_err());
        assert!(parse_port_range("1-2-3").is_err());
        assert!(parse_port_range("abc").is_err());
        assert!(parse_port_range("65535").is_ok());
        assert!(parse_port_range("65530-65536").is_err());
        assert!(parse_port_range("18446744073709551615").is_err());
        assert!(parse_port_range("0-18446744073709551615").is_err());
        assert_eq!(parse_port_range("0-65535").unwrap(), (0, 65536));
    }

    #[test]
    fn test_forward_rejects_huge_listen_port() {
        let spec = forward(vec![port("udp", "18446744073709551615", "")]);
        let err = forward_validate(listen(), subnet(), &spec).unwrap_err();
        assert!(matches!(err, NetError::InvalidConfig { .. }));
    }

    #[test]
    fn test_forward_flatten_reproduces_input() {
        let spec = forward(vec![
            port("tcp", "80-82,443", ""),
            port("udp", "80", ""),
            port("tcp", "8080", "80"),
        ]);
        let maps = forward_validate(listen(), subnet(), &spec).unwrap();

        let expected: BTreeSet<(String, u64)> = [
            ("tcp", 80),
            ("tcp", 81),
            ("tcp", 82),
            ("tcp", 443),
            ("udp", 80),
            ("tcp", 8080),
        ]
        .iter()
        .map(|(p, n)| (p.to_string(), *n))
        .collect();
        assert_eq!(flatten(&maps), expected);
        assert_eq!(maps[2].target.ports, vec![80]);
    }

    #[test]
    fn test_forward_duplicate_listen_port_conflicts() {
        let spec = forward(vec![port("tcp", "80-90", ""), port("tcp", "85", "")]);
        let err = forward_validate(listen(), subnet(), &spec).unwrap_err();
        assert!(matches!(err, NetError::ResourceConflict { .. }));
        assert!(err.to_string().contains("port specification 1"));

        let reversed = forward(vec![port("tcp", "85", ""), port("tcp", "80-90", "")]);
        assert!(matches!(
            forward_validate(listen(), subnet(), &reversed),
            Err(NetError::ResourceConflict { .. })
        ));
    }

    #[test]
    fn test_forward_fan_in_and_mismatch() {
        let fan_in = forward(vec![port("tcp", "80-82", "9000")]);
        let maps = forward_validate(listen(), subnet(), &fan_in).unwrap();
        assert_eq!(maps[0].listen_ports, vec![80, 81, 82]);
        assert_eq!(maps[0].target.ports, vec![9000]);

        let mismatch = forward(vec![port("tcp", "80-82", "9000-9001")]);
        match forward_validate(listen(), subnet(), &mismatch) {
            Err(NetError::InvalidConfig { field, message }) => {
                assert_eq!(field, "ports[0]");
                assert!(message.contains("Mismatch"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_forward_target_checks() {
        let mut outside = port("tcp", "80", "");
        outside.target_address = "10.9.0.5".to_string();
        assert!(forward_validate(listen(), subnet(), &forward(vec![outside])).is_err());

        let mut v6 = port("tcp", "80", "");
        v6.target_address = "fd42::5".to_string();
        assert!(forward_validate(listen(), subnet(), &forward(vec![v6])).is_err());

        let mut same = forward(vec![port("tcp", "80", "")]);
        same.config
            .insert(TARGET_ADDRESS_KEY.to_string(), "10.0.0.5".to_string());
        assert!(forward_validate(listen(), subnet(), &same).is_err());

        let bad_proto = forward(vec![port("sctp", "80", "")]);
        assert!(forward_validate(listen(), subnet(), &bad_proto).is_err());
    }

    #[test]
    fn test_forward_rejects_unknown_keys_and_unspecified_listen() {
        let mut spec = forward(vec![]);
        spec.config.insert("user.note".to_string(), "x".to_string());
        assert!(forward_validate(listen(), subnet(), &spec).is_ok());

        spec.config.insert("bogus".to_string(), "x".to_string());
        assert!(forward_validate(listen(), subnet(), &spec).is_err());

        let unspecified: IpAddr = "0.0.0.0".parse().unwrap();
        assert!(forward_validate(unspecified, subnet(), &forward(vec![])).is_err());
    }

    fn backend(name: &str, target_port: &str) -> LoadBalancerBackend {
        LoadBalancerBackend {
            name: name.to_string(),
            description: String::new(),
            target_port: target_port.to_string(),
            target_address: "10.0.0.20".to_string(),
        }
    }

    fn lb_port(listen_port: &str, backends: &[&str]) -> LoadBalancerPort {
        LoadBalancerPort {
            description: String::new(),
            protocol: "tcp".to_string(),
            listen_port: listen_port.to_string(),
            target_backend: backends.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[test]
    fn test_load_balancer_compiles_backends() {
        let lb = LoadBalancerPut {
            backends: vec![backend("web1", "8080"), backend("web2", "")],
            ports: vec![lb_port("80-81", &["web1", "web2"])],
            ..Default::default()
        };
        let maps = load_balancer_validate(listen(), subnet(), &lb).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].targets.len(), 2);
        assert_eq!(maps[0].targets[0].ports, vec![8080]);
        assert!(maps[0].targets[1].ports.is_empty());
    }

    #[test]
    fn test_load_balancer_backend_errors() {
        let dup = LoadBalancerPut {
            backends: vec![backend("web", ""), backend("web", "")],
            ..Default::default()
        };
        assert!(load_balancer_validate(listen(), subnet(), &dup).is_err());

        let spaced = LoadBalancerPut {
            backends: vec![backend("web 1", "")],
            ..Default::default()
        };
        assert!(load_balancer_validate(listen(), subnet(), &spaced).is_err());

        let missing = LoadBalancerPut {
            backends: vec![backend("web", "")],
            ports: vec![lb_port("80", &["db"])],
            ..Default::default()
        };
        assert!(load_balancer_validate(listen(), subnet(), &missing).is_err());

        let mismatch = LoadBalancerPut {
            backends: vec![backend("web", "8080-8082")],
            ports: vec![lb_port("80-81", &["web"])],
            ..Default::default()
        };
        match load_balancer_validate(listen(), subnet(), &mismatch) {
            Err(NetError::InvalidConfig { field, .. }) => assert_eq!(field, "ports[0]"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
