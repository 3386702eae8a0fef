//! Config key conventions shared by every driver.

use netplane_types::ConfigMap;

/// Prefix of free-form user keys, never validated and never reapplied.
pub const USER_KEY_PREFIX: &str = "user.";

/// Prefix of member-local runtime state.
pub const VOLATILE_KEY_PREFIX: &str = "volatile.";

/// Keys whose value is set per member and never broadcast.
pub const NODE_SPECIFIC_KEYS: &[&str] = &["bridge.external_interfaces", "parent"];

/// Tracks whether the driver created the host interface it uses.
pub const LAST_STATE_CREATED_KEY: &str = "volatile.last_state.created";

pub fn is_user_key(key: &str) -> bool {
    key.starts_with(USER_KEY_PREFIX)
}

pub fn is_node_specific_key(key: &str) -> bool {
    key.starts_with(VOLATILE_KEY_PREFIX) || NODE_SPECIFIC_KEYS.contains(&key)
}

/// Copy of `config` without node-specific keys, as sent to other members.
pub fn strip_node_specific(config: &ConfigMap) -> ConfigMap {
    config
        .iter()
        .filter(|(k, _)| !is_node_specific_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Copies the node-specific keys of `local` that `relayed` lacks.
pub fn merge_node_specific(local: &ConfigMap, relayed: &mut ConfigMap) {
    for (key, value) in local.iter().filter(|(k, _)| is_node_specific_key(k)) {
        relayed
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

pub fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

pub fn is_false(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

/// Value of `key`, or `""` when unset.
pub fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or("")
}

/// Splits a comma separated list value, trimming items and dropping empties.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_specific_keys() {
        assert!(is_node_specific_key("parent"));
        assert!(is_node_specific_key("bridge.external_interfaces"));
        assert!(is_node_specific_key("volatile.last_state.created"));
        assert!(!is_node_specific_key("mtu"));
    }

    #[test]
    fn test_strip_node_specific() {
        let mut config = ConfigMap::new();
        config.insert("parent".into(), "eth0".into());
        config.insert("mtu".into(), "9000".into());
        config.insert("volatile.last_state.created".into(), "true".into());

        let stripped = strip_node_specific(&config);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped["mtu"], "9000");
    }

    #[test]
    fn test_merge_node_specific() {
        let mut local = ConfigMap::new();
        local.insert("parent".into(), "eth0".into());
        local.insert("mtu".into(), "1500".into());
        local.insert("volatile.last_state.created".into(), "true".into());

        let mut relayed = ConfigMap::new();
        relayed.insert("mtu".into(), "9000".into());
        merge_node_specific(&local, &mut relayed);

        assert_eq!(relayed.len(), 3);
        assert_eq!(relayed["parent"], "eth0");
        assert_eq!(relayed["mtu"], "9000");
        assert_eq!(relayed["volatile.last_state.created"], "true");
    }

    #[test]
    fn test_bools() {
        assert!(is_true("TRUE"));
        assert!(is_true("on"));
        assert!(!is_true(""));
        assert!(is_false("no"));
        assert!(!is_false(""));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" eth1, eth2,,"), vec!["eth1", "eth2"]);
        assert!(split_list("").is_empty());
    }
}
