//! Packet-filter rules for proxied networks
//!
//! All redirection lives in one dedicated chain per table (nat and filter).
//! The chain is created once when the driver starts and removed once when it
//! stops; networks only add and remove their own jump and redirect rules.
//!
//! # Layout
//!
//! ```text
//! nat/PREROUTING   -i <bridge> -j <chain>
//! nat/<chain>      -d <escaped net> -j RETURN          (shared, inserted)
//! nat/<chain>      -i <bridge> -p udp --dport 53 -j REDIRECT --to-ports <dns>
//! nat/<chain>      -i <bridge> -p tcp --syn -j REDIRECT --to-ports <tunnel>
//!
//! filter/FORWARD   -i <bridge> -j <chain>               (blockUDP only, inserted)
//! filter/<chain>   -d <escaped net> -j RETURN          (shared, inserted)
//! filter/<chain>   -i <bridge> -p udp --dport <dns> -j RETURN
//! filter/<chain>   -i <bridge> -p udp -j DROP
//! ```
//!
//! Only the PREROUTING jump is mandatory. Every other per-network rule is
//! best effort: a failure is logged and the network still comes up.

use super::options::NetworkConfiguration;
use crate::backends::iptables::{
    Action, FilterError, PacketFilter, Table, args, ensure_chain, flush_chain, program_rule,
    remove_chain,
};

/// Chain name used when no namespace is configured
pub const DEFAULT_CHAIN_NAME: &str = "SOXY_CHAIN";

/// Joins namespace parts in derived names
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Hex digits of the namespace hash kept in the chain name.
/// 15 + 2 + 10 = 27 characters, under the 28-character iptables limit.
const CHAIN_HASH_LEN: usize = 15;

const DNS_PORT: &str = "53";

/// Destinations that always bypass redirection
pub const ESCAPED_NETWORKS: [&str; 8] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// Name of the dedicated chain, optionally isolated per namespace
///
/// With a namespace the name is the first 15 hex digits of
/// `md5("<namespace>__SOXY_CHAIN")` followed by `__SOXY_CHAIN`.
pub fn chain_name(namespace: Option<&str>) -> String {
    let namespace = match namespace.map(str::trim) {
        Some(ns) if !ns.is_empty() => ns,
        _ => return DEFAULT_CHAIN_NAME.to_string(),
    };

    let seed = format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, DEFAULT_CHAIN_NAME);
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    format!(
        "{}{}{}",
        &digest[..CHAIN_HASH_LEN],
        NAMESPACE_SEPARATOR,
        DEFAULT_CHAIN_NAME
    )
}

/// Create the chain in nat then filter, and insert the escape rules
///
/// A chain left behind by a previous run is flushed, so its redirects to
/// dead ports can't shadow the ones recovery programs. Jumps into it from
/// the built-in chains are kept. Escape rule failures are logged only.
pub fn setup_chain(filter: &dyn PacketFilter, chain: &str) -> Result<(), FilterError> {
    for table in [Table::Nat, Table::Filter] {
        if !ensure_chain(filter, table, chain)? {
            log::warn!("Chain {} left over in table {}, flushing it", chain, table);
            flush_chain(filter, table, chain)?;
        }

        for network in ESCAPED_NETWORKS {
            let rule = args(["-d", network, "-j", "RETURN"]);
            if let Err(e) = program_rule(filter, table, Action::Insert, chain, &rule) {
                log::error!(
                    "Failed to add escape rule for {} in {}/{}: {}",
                    network,
                    table,
                    chain,
                    e
                );
            }
        }
    }
    Ok(())
}

/// Flush and delete the chain in both tables, reporting the first failure
pub fn teardown_chain(filter: &dyn PacketFilter, chain: &str) -> Result<(), FilterError> {
    let mut first_error = None;
    for table in [Table::Nat, Table::Filter] {
        if let Err(e) = remove_chain(filter, table, chain) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// One per-network rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRule {
    pub table: Table,
    pub action: Action,
    pub chain: String,
    pub rule: Vec<String>,
    /// Failing to add this rule aborts bring-up
    pub mandatory: bool,
    pub description: &'static str,
}

/// Ordered rule set of a network for the given action
///
/// `Action::Append` builds the bring-up set, `Action::Delete` the teardown
/// set. Both are in the same relative order.
pub fn network_rules(chain: &str, action: Action, config: &NetworkConfiguration) -> Vec<NetworkRule> {
    let bridge = config.bridge_name.as_str();
    let dns_port = config.tunnel_dns_port.to_string();
    let tunnel_port = config.tunnel_port.to_string();

    let mut rules = vec![
        NetworkRule {
            table: Table::Nat,
            action,
            chain: "PREROUTING".to_string(),
            rule: args(["-i", bridge, "-j", chain]),
            mandatory: true,
            description: "prerouting jump",
        },
        NetworkRule {
            table: Table::Nat,
            action,
            chain: chain.to_string(),
            rule: args([
                "-i",
                bridge,
                "-p",
                "udp",
                "--dport",
                DNS_PORT,
                "-j",
                "REDIRECT",
                "--to-ports",
                dns_port.as_str(),
            ]),
            mandatory: false,
            description: "DNS redirect",
        },
        NetworkRule {
            table: Table::Nat,
            action,
            chain: chain.to_string(),
            rule: args([
                "-i",
                bridge,
                "-p",
                "tcp",
                "--syn",
                "-j",
                "REDIRECT",
                "--to-ports",
                tunnel_port.as_str(),
            ]),
            mandatory: false,
            description: "TCP redirect",
        },
    ];

    if config.block_udp {
        rules.extend([
            NetworkRule {
                table: Table::Filter,
                // Must precede the host's own FORWARD rules
                action: action.to_insert(),
                chain: "FORWARD".to_string(),
                rule: args(["-i", bridge, "-j", chain]),
                mandatory: false,
                description: "forward jump",
            },
            NetworkRule {
                table: Table::Filter,
                action,
                chain: chain.to_string(),
                rule: args([
                    "-i",
                    bridge,
                    "-p",
                    "udp",
                    "--dport",
                    dns_port.as_str(),
                    "-j",
                    "RETURN",
                ]),
                mandatory: false,
                description: "relay DNS allowance",
            },
            NetworkRule {
                table: Table::Filter,
                action,
                chain: chain.to_string(),
                rule: args(["-i", bridge, "-p", "udp", "-j", "DROP"]),
                mandatory: false,
                description: "UDP drop",
            },
        ]);
    }

    rules
}

/// Apply (`Append`) or remove (`Delete`) the rules of a network
///
/// On append, a mandatory rule failure stops immediately and is returned.
/// On delete every rule is attempted and the first mandatory failure is
/// returned at the end. Best-effort failures are only logged.
pub fn program_network_rules(
    filter: &dyn PacketFilter,
    chain: &str,
    action: Action,
    config: &NetworkConfiguration,
) -> Result<(), FilterError> {
    let mut first_error = None;

    for rule in network_rules(chain, action, config) {
        let result = program_rule(filter, rule.table, rule.action, &rule.chain, &rule.rule);
        let Err(e) = result else {
            continue;
        };

        if rule.mandatory {
            log::error!(
                "Failed to program {} for network {} ({}): {}",
                rule.description,
                config.network_id,
                config.bridge_name,
                e
            );
            if action != Action::Delete {
                return Err(e);
            }
            first_error.get_or_insert(e);
        } else {
            log::warn!(
                "Failed to program {} for network {} in {}/{}: {}",
                rule.description,
                config.network_id,
                rule.table,
                rule.chain,
                e
            );
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            log::debug!(
                "Programmed rules ({}) for network {} on {}",
                action.flag(),
                config.network_id,
                config.bridge_name
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryFilter;

    fn config(block_udp: bool) -> NetworkConfiguration {
        NetworkConfiguration {
            network_id: "net1".to_string(),
            bridge_name: "br-net1".to_string(),
            proxy_address: "203.0.113.5".to_string(),
            proxy_port: 1080,
            proxy_type: None,
            proxy_user: None,
            proxy_password: None,
            tunnel_bind_address: None,
            tunnel_port: 41000,
            tunnel_dns_port: 5353,
            onion_port: 9050,
            block_udp,
        }
    }

    #[test]
    fn test_default_chain_name() {
        assert_eq!(chain_name(None), "SOXY_CHAIN");
        assert_eq!(chain_name(Some("  ")), "SOXY_CHAIN");
    }

    #[test]
    fn test_namespaced_chain_name_is_deterministic() {
        let first = chain_name(Some("staging"));
        assert_eq!(first, chain_name(Some("staging")));
        assert_eq!(first, chain_name(Some(" staging ")));
        assert_ne!(first, chain_name(Some("production")));
        assert_ne!(first, DEFAULT_CHAIN_NAME);

        assert_eq!(first.len(), 27);
        assert!(first.ends_with("__SOXY_CHAIN"));
        assert!(first[..15].chars().all(|c| c.is_ascii_hexdigit()));

        let digest = format!("{:x}", md5::compute(b"staging__SOXY_CHAIN"));
        assert_eq!(&first[..15], &digest[..15]);
    }

    #[test]
    fn test_setup_chain_creates_both_tables_with_escapes() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();

        for table in [Table::Nat, Table::Filter] {
            let rules = filter.rules(table, "SOXY_CHAIN");
            assert_eq!(rules.len(), ESCAPED_NETWORKS.len());
            assert!(rules.contains(&"-d 127.0.0.0/8 -j RETURN".to_string()));
        }

        // Running again changes nothing
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        assert_eq!(
            filter.rules(Table::Nat, "SOXY_CHAIN").len(),
            ESCAPED_NETWORKS.len()
        );
    }

    #[test]
    fn test_setup_chain_flushes_leftover_rules() {
        let filter = MemoryFilter::new();
        let stale = "-i br-net1 -p tcp --syn -j REDIRECT --to-ports 2222";
        for table in ["nat", "filter"] {
            filter.raw(&args(["-t", table, "-N", "SOXY_CHAIN"])).unwrap();
        }
        filter
            .raw(&args(["-t", "nat", "-A", "SOXY_CHAIN"].into_iter().chain(stale.split(' '))))
            .unwrap();
        filter
            .raw(&args(["-t", "nat", "-A", "PREROUTING", "-i", "br-net1", "-j", "SOXY_CHAIN"]))
            .unwrap();

        setup_chain(&filter, "SOXY_CHAIN").unwrap();

        let rules = filter.rules(Table::Nat, "SOXY_CHAIN");
        assert_eq!(rules.len(), ESCAPED_NETWORKS.len());
        assert!(!rules.contains(&stale.to_string()));
        // The jump into the chain survives
        assert_eq!(filter.rules(Table::Nat, "PREROUTING").len(), 1);
    }

    #[test]
    fn test_relay_socks_port_is_never_wired() {
        let rules = network_rules("SOXY_CHAIN", Action::Append, &config(true));
        assert!(!rules.is_empty());
        assert!(rules.iter().all(|r| !r.rule.contains(&"9050".to_string())));
    }

    #[test]
    fn test_escape_failures_are_not_fatal() {
        let filter = MemoryFilter::new();
        filter.fail_on("224.0.0.0/4");
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        assert_eq!(
            filter.rules(Table::Filter, "SOXY_CHAIN").len(),
            ESCAPED_NETWORKS.len() - 1
        );
    }

    #[test]
    fn test_teardown_chain_removes_both_tables() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        teardown_chain(&filter, "SOXY_CHAIN").unwrap();
        assert!(!filter.has_chain(Table::Nat, "SOXY_CHAIN"));
        assert!(!filter.has_chain(Table::Filter, "SOXY_CHAIN"));
    }

    #[test]
    fn test_append_programs_nat_rules_in_order() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(false)).unwrap();

        assert_eq!(
            filter.rules(Table::Nat, "PREROUTING"),
            vec!["-i br-net1 -j SOXY_CHAIN".to_string()]
        );
        let chain = filter.rules(Table::Nat, "SOXY_CHAIN");
        let own: Vec<&String> = chain.iter().filter(|r| r.contains("br-net1")).collect();
        assert_eq!(
            own,
            vec![
                "-i br-net1 -p udp --dport 53 -j REDIRECT --to-ports 5353",
                "-i br-net1 -p tcp --syn -j REDIRECT --to-ports 41000",
            ]
        );
        // Escape rules still come first
        assert!(chain[0].ends_with("-j RETURN"));

        assert!(filter.rules(Table::Filter, "FORWARD").is_empty());
    }

    #[test]
    fn test_block_udp_programs_filter_rules() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(true)).unwrap();

        assert_eq!(
            filter.rules(Table::Filter, "FORWARD"),
            vec!["-i br-net1 -j SOXY_CHAIN".to_string()]
        );
        let chain = filter.rules(Table::Filter, "SOXY_CHAIN");
        let own: Vec<&String> = chain.iter().filter(|r| r.contains("br-net1")).collect();
        assert_eq!(
            own,
            vec![
                "-i br-net1 -p udp --dport 5353 -j RETURN",
                "-i br-net1 -p udp -j DROP",
            ]
        );
        assert!(filter.commands().iter().any(|c| c.starts_with("-t filter -I FORWARD")));
    }

    #[test]
    fn test_append_then_delete_is_a_no_op() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        let nat_before = filter.rules(Table::Nat, "SOXY_CHAIN");
        let filter_before = filter.rules(Table::Filter, "SOXY_CHAIN");

        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(true)).unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Delete, &config(true)).unwrap();

        assert!(filter.rules(Table::Nat, "PREROUTING").is_empty());
        assert!(filter.rules(Table::Filter, "FORWARD").is_empty());
        assert_eq!(filter.rules(Table::Nat, "SOXY_CHAIN"), nat_before);
        assert_eq!(filter.rules(Table::Filter, "SOXY_CHAIN"), filter_before);
    }

    #[test]
    fn test_reapply_does_not_duplicate() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(true)).unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(true)).unwrap();
        assert_eq!(filter.rules(Table::Nat, "PREROUTING").len(), 1);
        assert_eq!(filter.rules(Table::Filter, "FORWARD").len(), 1);
    }

    #[test]
    fn test_mandatory_failure_aborts_append() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        filter.fail_on("PREROUTING");

        assert!(program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(false)).is_err());
        // Nothing after the jump was attempted
        assert!(!filter.commands().iter().any(|c| c.contains("--syn")));
    }

    #[test]
    fn test_best_effort_failure_is_swallowed() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        filter.fail_on("--syn");

        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(true)).unwrap();
        assert_eq!(filter.rules(Table::Nat, "PREROUTING").len(), 1);
        assert!(filter.rules(Table::Filter, "SOXY_CHAIN").iter().any(|r| r.ends_with("DROP")));
    }

    #[test]
    fn test_delete_continues_past_mandatory_failure() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Append, &config(false)).unwrap();
        filter.fail_on("-D PREROUTING");

        assert!(program_network_rules(&filter, "SOXY_CHAIN", Action::Delete, &config(false)).is_err());
        assert!(
            !filter
                .rules(Table::Nat, "SOXY_CHAIN")
                .iter()
                .any(|r| r.contains("br-net1"))
        );
    }

    #[test]
    fn test_delete_of_absent_rules_is_tolerated() {
        let filter = MemoryFilter::new();
        setup_chain(&filter, "SOXY_CHAIN").unwrap();
        program_network_rules(&filter, "SOXY_CHAIN", Action::Delete, &config(true)).unwrap();
    }
}
