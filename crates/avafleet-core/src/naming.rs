use std::net::Ipv4Addr;
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

/// Validate a cluster name: alphanumeric, hyphens, underscores, 1-63 chars.
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        bail!("Cluster name must be 1-63 characters, got {}", name.len());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "Cluster name must be alphanumeric, hyphens, or underscores: {:?}",
            name
        );
    }
    if name.starts_with('-') || name.starts_with('_') {
        bail!("Cluster name must start with a letter or digit: {:?}", name);
    }
    Ok(())
}

/// Validate an Avalanche node ID: `NodeID-` followed by a cb58 body.
pub fn validate_avalanche_node_id(id: &str) -> Result<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^NodeID-[1-9A-HJ-NP-Za-km-z]{20,40}$").expect("invalid node ID pattern")
    });
    if !re.is_match(id) {
        bail!("Invalid Avalanche node ID: {:?}", id);
    }
    Ok(())
}

/// Parse an IPv4 address given on the command line.
pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    ip.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| anyhow::anyhow!("Invalid IPv4 address: {:?}", ip))
}

/// Single-host CIDR used in firewall rules.
pub fn host_cidr(ip: &str) -> String {
    format!("{}/32", ip)
}

/// GCP network name for a project prefix.
pub fn gcp_network_name(prefix: &str) -> String {
    format!("{}-network", prefix)
}

/// GCP firewall rule name that whitelists one IP.
pub fn gcp_whitelist_rule_name(prefix: &str, ip: &str) -> String {
    format!("{}-{}", gcp_network_name(prefix), ip.replace('.', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_cluster_names() {
        assert!(validate_cluster_name("devnet1").is_ok());
        assert!(validate_cluster_name("my_cluster-2").is_ok());
    }

    #[test]
    fn test_invalid_cluster_names() {
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name("-x").is_err());
        assert!(validate_cluster_name("a b").is_err());
        assert!(validate_cluster_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_avalanche_node_id() {
        assert!(validate_avalanche_node_id("NodeID-7Xhw2mDxuDS44j42TCB6U5579esbSt3Lg").is_ok());
        assert!(validate_avalanche_node_id("NodeID-0OIl").is_err());
        assert!(validate_avalanche_node_id("i-0abc").is_err());
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4(" 1.2.3.4 ").unwrap(), Ipv4Addr::new(1, 2, 3, 4));
        assert!(parse_ipv4("1.2.3").is_err());
    }

    #[test]
    fn test_gcp_rule_name() {
        assert_eq!(gcp_network_name("avafleet"), "avafleet-network");
        assert_eq!(
            gcp_whitelist_rule_name("avafleet", "1.2.3.4"),
            "avafleet-network-1234"
        );
        assert_eq!(host_cidr("1.2.3.4"), "1.2.3.4/32");
    }
}
