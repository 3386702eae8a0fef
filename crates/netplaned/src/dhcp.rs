//! DHCP subnet and range accessors over config strings.

use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;

/// Inclusive address range handed out by DHCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        ip >= &self.start && ip <= &self.end
    }
}

/// Parses a `start-end[,start-end...]` list for one IP family.
///
/// Entries that do not parse, mix families or belong to the other family
/// are dropped.
pub fn parse_ranges(value: &str, ipv6: bool) -> Vec<IpRange> {
    value
        .split(',')
        .filter_map(|entry| {
            let (start, end) = entry.trim().split_once('-')?;
            let start: IpAddr = start.trim().parse().ok()?;
            let end: IpAddr = end.trim().parse().ok()?;
            if start.is_ipv6() != ipv6 || end.is_ipv6() != ipv6 {
                return None;
            }
            Some(IpRange { start, end })
        })
        .collect()
}

/// Network part of a CIDR config value (`10.0.0.1/24` → `10.0.0.0/24`).
pub fn subnet_of(value: &str) -> Option<IpNet> {
    value.parse::<IpNet>().ok().map(|n| n.trunc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ranges_drops_malformed() {
        let ranges = parse_ranges("10.0.0.10-10.0.0.20, bogus, 10.0.0.30, fd42::1-fd42::5", false);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, "10.0.0.10".parse::<IpAddr>().unwrap());
        assert!(ranges[0].contains(&"10.0.0.15".parse().unwrap()));

        let v6 = parse_ranges("fd42::1-fd42::5", true);
        assert_eq!(v6.len(), 1);
        assert!(parse_ranges("", false).is_empty());
    }

    #[test]
    fn test_subnet_of() {
        assert_eq!(subnet_of("10.0.0.1/24").unwrap().to_string(), "10.0.0.0/24");
        assert!(subnet_of("none").is_none());
        assert!(subnet_of("10.0.0.1").is_none());
    }
}
