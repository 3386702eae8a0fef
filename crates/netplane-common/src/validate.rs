//! Config key validation.
//!
//! A [`RuleSet`] maps config keys to validators. Drivers build one from
//! static rules plus rules generated for wildcard key families (such as
//! `bgp.peers.<name>.<field>`) and validate a whole config map with it:
//!
//! - every rule runs against the key's value, or `""` when absent;
//! - any key without a rule is rejected unless it starts with `user.`.
//!
//! Validators are plain functions `&str -> Result<(), String>`; the
//! combinators ([`optional`], [`required`], [`is_list_of`], ...) compose them.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netplane_types::{ConfigMap, MacAddress, VlanId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::is_user_key;
use crate::error::{NetError, NetResult};

/// Outcome of a single validator.
pub type RuleResult = Result<(), String>;

/// A boxed validator.
pub type Rule = Box<dyn Fn(&str) -> RuleResult + Send + Sync>;

static INTERFACE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-_a-zA-Z0-9.]+$").expect("Invalid regex pattern"));

static DNS_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").expect("Invalid regex pattern")
});

/// Registry of validators keyed by config key.
#[derive(Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the rule for `key`.
    pub fn insert<F>(&mut self, key: impl Into<String>, rule: F)
    where
        F: Fn(&str) -> RuleResult + Send + Sync + 'static,
    {
        self.rules.insert(key.into(), Box::new(rule));
    }

    /// Builder form of [`RuleSet::insert`].
    pub fn with<F>(mut self, key: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&str) -> RuleResult + Send + Sync + 'static,
    {
        self.insert(key, rule);
        self
    }

    /// Moves every rule of `other` into this set, replacing duplicates.
    pub fn merge(&mut self, other: RuleSet) {
        self.rules.extend(other.rules);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rules.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs the rule for a single key.
    pub fn check(&self, key: &str, value: &str) -> Option<RuleResult> {
        self.rules.get(key).map(|rule| rule(value))
    }

    /// Validates `config` of the `kind` object called `name`.
    ///
    /// Keys are visited in sorted order so the first failure is stable.
    pub fn validate(&self, kind: &str, name: &str, config: &ConfigMap) -> NetResult<()> {
        for (key, rule) in &self.rules {
            let value = config.get(key).map(String::as_str).unwrap_or("");
            if let Err(msg) = rule(value) {
                return Err(NetError::invalid_config(
                    key.clone(),
                    format!("Invalid value for {} {:?} option {:?}: {}", kind, name, key, msg),
                ));
            }
        }

        let mut keys: Vec<&String> = config.keys().collect();
        keys.sort();
        for key in keys {
            if self.rules.contains_key(key) || is_user_key(key) {
                continue;
            }
            return Err(NetError::invalid_config(
                key.clone(),
                format!("Invalid option for {} {:?} option {:?}", kind, name, key),
            ));
        }

        Ok(())
    }
}

/// Skips `f` for empty values.
pub fn optional<F>(f: F) -> impl Fn(&str) -> RuleResult + Send + Sync + 'static
where
    F: Fn(&str) -> RuleResult + Send + Sync + 'static,
{
    move |value| if value.is_empty() { Ok(()) } else { f(value) }
}

/// Rejects empty values, then runs `f`.
pub fn required<F>(f: F) -> impl Fn(&str) -> RuleResult + Send + Sync + 'static
where
    F: Fn(&str) -> RuleResult + Send + Sync + 'static,
{
    move |value| {
        is_not_empty(value)?;
        f(value)
    }
}

/// Runs `f` on every comma separated, trimmed element.
pub fn is_list_of<F>(f: F) -> impl Fn(&str) -> RuleResult + Send + Sync + 'static
where
    F: Fn(&str) -> RuleResult + Send + Sync + 'static,
{
    move |value| {
        for item in value.split(',') {
            f(item.trim()).map_err(|e| format!("Item {:?}: {}", item.trim(), e))?;
        }
        Ok(())
    }
}

/// Accepts an integer within `min..=max`.
pub fn is_in_range(min: i64, max: i64) -> impl Fn(&str) -> RuleResult + Send + Sync + 'static {
    move |value| {
        let n: i64 = value
            .parse()
            .map_err(|_| format!("Invalid value for an integer {:?}", value))?;
        if n < min || n > max {
            return Err(format!("Value must be between {} and {}", min, max));
        }
        Ok(())
    }
}

/// Accepts one of `choices`.
pub fn is_one_of(choices: &'static [&'static str]) -> impl Fn(&str) -> RuleResult + Send + Sync + 'static {
    move |value| {
        if choices.contains(&value) {
            Ok(())
        } else {
            Err(format!("Invalid value {:?} (not one of {:?})", value, choices))
        }
    }
}

pub fn is_any(_value: &str) -> RuleResult {
    Ok(())
}

pub fn is_not_empty(value: &str) -> RuleResult {
    if value.is_empty() {
        return Err("Required value".to_string());
    }
    Ok(())
}

/// Accepts the boolean spellings understood by [`crate::config::is_true`]
/// and [`crate::config::is_false`].
pub fn is_bool(value: &str) -> RuleResult {
    match value.to_ascii_lowercase().as_str() {
        "true" | "false" | "yes" | "no" | "1" | "0" | "on" | "off" => Ok(()),
        _ => Err(format!("Invalid value for a boolean {:?}", value)),
    }
}

pub fn is_u32(value: &str) -> RuleResult {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| format!("Invalid value for uint32 {:?}", value))
}

pub fn is_interface_name(value: &str) -> RuleResult {
    if value.len() < 2 {
        return Err("Network interface is too short (minimum 2 characters)".to_string());
    }
    if value.len() > 15 {
        return Err("Network interface is too long (maximum 15 characters)".to_string());
    }
    if !INTERFACE_NAME_RE.is_match(value) {
        return Err("Network interface contains invalid characters".to_string());
    }
    Ok(())
}

pub fn is_network_mac(value: &str) -> RuleResult {
    value
        .parse::<MacAddress>()
        .map(|_| ())
        .map_err(|_| format!("Invalid MAC address {:?}", value))
}

pub fn is_network_address(value: &str) -> RuleResult {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| format!("Not an IP address {:?}", value))
}

pub fn is_network_address_v4(value: &str) -> RuleResult {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| format!("Not an IPv4 address {:?}", value))
}

pub fn is_network_address_v6(value: &str) -> RuleResult {
    value
        .parse::<Ipv6Addr>()
        .map(|_| ())
        .map_err(|_| format!("Not an IPv6 address {:?}", value))
}

/// Address with prefix length, host bits allowed (`10.0.0.1/24`).
pub fn is_network_address_cidr_v4(value: &str) -> RuleResult {
    value
        .parse::<Ipv4Net>()
        .map(|_| ())
        .map_err(|_| format!("Not an IPv4 CIDR address {:?}", value))
}

pub fn is_network_address_cidr_v6(value: &str) -> RuleResult {
    value
        .parse::<Ipv6Net>()
        .map(|_| ())
        .map_err(|_| format!("Not an IPv6 CIDR address {:?}", value))
}

/// Network address with prefix length, host bits clear (`10.0.0.0/24`).
pub fn is_network_v4(value: &str) -> RuleResult {
    let net: Ipv4Net = value
        .parse()
        .map_err(|_| format!("Not an IPv4 network {:?}", value))?;
    if net.addr() != net.network() {
        return Err(format!("Not an IPv4 network address {:?}", value));
    }
    Ok(())
}

pub fn is_network_v6(value: &str) -> RuleResult {
    let net: Ipv6Net = value
        .parse()
        .map_err(|_| format!("Not an IPv6 network {:?}", value))?;
    if net.addr() != net.network() {
        return Err(format!("Not an IPv6 network address {:?}", value));
    }
    Ok(())
}

fn parse_ip_range(value: &str) -> Result<(IpAddr, IpAddr), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| "IP range must contain start and end IP addresses".to_string())?;
    let start: IpAddr = start
        .trim()
        .parse()
        .map_err(|_| format!("Start not an IP address {:?}", start))?;
    let end: IpAddr = end
        .trim()
        .parse()
        .map_err(|_| format!("End not an IP address {:?}", end))?;
    if start.is_ipv4() != end.is_ipv4() {
        return Err("Start and end IP addresses are not in same family".to_string());
    }
    if start > end {
        return Err("Start IP address must be before or equal to end IP address".to_string());
    }
    Ok((start, end))
}

/// `start-end` IPv4 range.
pub fn is_network_range_v4(value: &str) -> RuleResult {
    let (start, _) = parse_ip_range(value)?;
    if !start.is_ipv4() {
        return Err(format!("Not an IPv4 range {:?}", value));
    }
    Ok(())
}

pub fn is_network_range_v6(value: &str) -> RuleResult {
    let (start, _) = parse_ip_range(value)?;
    if !start.is_ipv6() {
        return Err(format!("Not an IPv6 range {:?}", value));
    }
    Ok(())
}

pub fn is_network_vlan(value: &str) -> RuleResult {
    value
        .parse::<VlanId>()
        .map(|_| ())
        .map_err(|_| format!("Invalid VLAN ID {:?} (must be between 0 and 4094)", value))
}

pub fn is_network_mtu(value: &str) -> RuleResult {
    is_in_range(1280, 16384)(value)
}

/// Single port or `start-end` with `start < end`.
pub fn is_network_port_range(value: &str) -> RuleResult {
    match value.split_once('-') {
        None => value
            .parse::<u16>()
            .map(|_| ())
            .map_err(|_| format!("Invalid port number {:?}", value)),
        Some((start, end)) => {
            let start: u16 = start
                .parse()
                .map_err(|_| format!("Invalid port number {:?}", value))?;
            let end: u16 = end
                .parse()
                .map_err(|_| format!("Invalid end port number {:?}", value))?;
            if start >= end {
                return Err(format!(
                    "Start port {} must be lower than end port {}",
                    start, end
                ));
            }
            Ok(())
        }
    }
}

pub fn is_dns_domain(value: &str) -> RuleResult {
    let trimmed = value.trim_end_matches('.');
    if trimmed.is_empty() || trimmed.len() > 253 {
        return Err(format!("Invalid domain {:?}", value));
    }
    if trimmed.split('.').all(|label| DNS_LABEL_RE.is_match(label)) {
        Ok(())
    } else {
        Err(format!("Invalid domain {:?}", value))
    }
}

/// Parses a CIDR address keeping the host bits.
pub fn parse_cidr(value: &str) -> Option<IpNet> {
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rules() -> RuleSet {
        RuleSet::new()
            .with("mtu", optional(is_network_mtu))
            .with("parent", required(is_interface_name))
    }

    #[test]
    fn test_validate_accepts_known_and_user_keys() {
        let cfg = config(&[("parent", "eth0"), ("mtu", "9000"), ("user.owner", "ops")]);
        assert!(rules().validate("network", "phys0", &cfg).is_ok());
    }

    #[test]
    fn test_validate_missing_key_runs_rule_on_empty() {
        let err = rules()
            .validate("network", "phys0", &config(&[("mtu", "1500")]))
            .unwrap_err();
        match err {
            NetError::InvalidConfig { field, message } => {
                assert_eq!(field, "parent");
                assert!(message.contains("Required value"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let cfg = config(&[("parent", "eth0"), ("bogus.key", "1")]);
        let err = rules().validate("network", "phys0", &cfg).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration for bogus.key: Invalid option for network \"phys0\" option \"bogus.key\""
        );
    }

    #[test]
    fn test_merge_replaces() {
        let mut set = rules();
        set.merge(RuleSet::new().with("mtu", is_any).with("vlan", optional(is_network_vlan)));
        assert_eq!(set.len(), 3);
        assert_eq!(set.check("mtu", "1"), Some(Ok(())));
        assert_eq!(set.check("unknown", "1"), None);
    }

    #[test]
    fn test_bool_and_ranges() {
        for v in ["true", "no", "1", "OFF"] {
            assert!(is_bool(v).is_ok(), "{}", v);
        }
        assert!(is_bool("maybe").is_err());
        assert!(is_in_range(9, 65535)("8").is_err());
        assert!(is_in_range(9, 65535)("90").is_ok());
        assert!(is_network_mtu("1279").is_err());
        assert!(is_network_vlan("0").is_ok());
        assert!(is_network_vlan("4095").is_err());
    }

    #[test]
    fn test_interface_name() {
        assert!(is_interface_name("eth0").is_ok());
        assert!(is_interface_name("e").is_err());
        assert!(is_interface_name("averyveryverylongname").is_err());
        assert!(is_interface_name("eth 0").is_err());
    }

    #[test]
    fn test_networks() {
        assert!(is_network_v4("10.0.0.0/24").is_ok());
        assert!(is_network_v4("10.0.0.1/24").is_err());
        assert!(is_network_address_cidr_v4("10.0.0.1/24").is_ok());
        assert!(is_network_address_cidr_v6("fd00::1/64").is_ok());
        assert!(is_network_v6("fd00::/64").is_ok());
        assert!(is_list_of(is_network_v4)("10.0.0.0/24, 10.1.0.0/16").is_ok());
        assert!(is_list_of(is_network_v4)("10.0.0.0/24,bad").is_err());
    }

    #[test]
    fn test_ranges() {
        assert!(is_network_range_v4("10.0.0.10-10.0.0.20").is_ok());
        assert!(is_network_range_v4("10.0.0.20-10.0.0.10").is_err());
        assert!(is_network_range_v4("10.0.0.10-fd00::1").is_err());
        assert!(is_network_range_v6("fd00::10-fd00::20").is_ok());
        assert!(is_network_port_range("80-90").is_ok());
        assert!(is_network_port_range("90-80").is_err());
        assert!(is_network_port_range("70000").is_err());
    }

    #[test]
    fn test_dns_domain() {
        assert!(is_dns_domain("lxd.example.net").is_ok());
        assert!(is_dns_domain("-bad.example").is_err());
        assert!(is_dns_domain("").is_err());
    }
}
