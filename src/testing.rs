// Test doubles for the host-facing seams: packet filter, bridge delegate and
// interface lookup. None of them touch the host.

use crate::backends::bridge::{
    BridgeDelegate, EndpointInterface, ExposedPort, GenericOptions, IpamData, JoinInfo, PortBinding,
};
use crate::backends::interfaces::InterfaceResolver;
use crate::backends::iptables::{FilterError, PacketFilter, Table};
use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

const BUILTIN_TARGETS: &[&str] = &["ACCEPT", "DROP", "RETURN", "REDIRECT", "MASQUERADE", "DNAT"];

#[derive(Default)]
struct FilterState {
    chains: HashMap<(Table, String), Vec<String>>,
    builtin: Vec<(Table, String)>,
    log: Vec<String>,
    failures: Vec<String>,
}

/// In-memory iptables understanding -N -A -I -D -C -F -X
pub struct MemoryFilter {
    state: Mutex<FilterState>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        let mut state = FilterState::default();
        for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            state.chains.insert((Table::Nat, chain.to_string()), Vec::new());
            state.builtin.push((Table::Nat, chain.to_string()));
        }
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            state
                .chains
                .insert((Table::Filter, chain.to_string()), Vec::new());
            state.builtin.push((Table::Filter, chain.to_string()));
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Make every command whose arguments contain `needle` fail
    pub fn fail_on(&self, needle: &str) {
        self.state.lock().unwrap().failures.push(needle.to_string());
    }

    /// Rules of a chain, each joined with spaces, in kernel order
    pub fn rules(&self, table: Table, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .chains
            .contains_key(&(table, chain.to_string()))
    }

    /// Every command received, checks included
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }
}

fn refuse(args: &[String], stderr: &str) -> FilterError {
    FilterError::Command {
        args: args.join(" "),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

impl PacketFilter for MemoryFilter {
    fn raw(&self, args: &[String]) -> Result<String, FilterError> {
        let mut state = self.state.lock().unwrap();
        let line = args.join(" ");
        state.log.push(line.clone());

        if state.failures.iter().any(|f| line.contains(f.as_str())) {
            return Err(refuse(args, "injected failure"));
        }

        let (table, flag, chain, rule) = match args {
            [t, table, flag, chain, rule @ ..] if t == "-t" => {
                let table = match table.as_str() {
                    "nat" => Table::Nat,
                    "filter" => Table::Filter,
                    other => return Err(refuse(args, &format!("unknown table {}", other))),
                };
                (table, flag.as_str(), chain.clone(), rule.join(" "))
            }
            _ => return Err(refuse(args, "malformed command")),
        };
        let key = (table, chain.clone());

        match flag {
            "-N" => {
                if state.chains.contains_key(&key) {
                    return Err(refuse(args, "iptables: Chain already exists."));
                }
                state.chains.insert(key, Vec::new());
            }
            "-X" => {
                if state.builtin.contains(&key) {
                    return Err(refuse(args, "iptables: Can't delete built-in chain."));
                }
                let referenced = state
                    .chains
                    .iter()
                    .filter(|((t, _), _)| *t == table)
                    .flat_map(|(_, rules)| rules.iter())
                    .any(|r| r.ends_with(&format!("-j {}", chain)));
                if referenced {
                    return Err(refuse(args, "iptables: Too many links."));
                }
                if state.chains.remove(&key).is_none() {
                    return Err(refuse(args, "iptables: No chain/target/match by that name."));
                }
            }
            "-F" => match state.chains.get_mut(&key) {
                Some(rules) => rules.clear(),
                None => return Err(refuse(args, "iptables: No chain/target/match by that name.")),
            },
            "-A" | "-I" | "-C" | "-D" => {
                if let Some(target) = jump_target(&rule) {
                    let known = BUILTIN_TARGETS.contains(&target)
                        || state.chains.contains_key(&(table, target.to_string()));
                    if !known {
                        return Err(refuse(args, "iptables: No chain/target/match by that name."));
                    }
                }
                let rules = state
                    .chains
                    .get_mut(&key)
                    .ok_or_else(|| refuse(args, "iptables: No chain/target/match by that name."))?;
                let position = rules.iter().position(|r| *r == rule);
                match (flag, position) {
                    ("-A", _) => rules.push(rule),
                    ("-I", _) => rules.insert(0, rule),
                    ("-C", Some(_)) => {}
                    ("-D", Some(idx)) => {
                        rules.remove(idx);
                    }
                    _ => {
                        return Err(refuse(
                            args,
                            "iptables: Bad rule (does a matching rule exist in that chain?).",
                        ));
                    }
                }
            }
            other => return Err(refuse(args, &format!("unsupported flag {}", other))),
        }

        Ok(String::new())
    }
}

fn jump_target(rule: &str) -> Option<&str> {
    let mut parts = rule.split(' ');
    while let Some(part) = parts.next() {
        if part == "-j" {
            return parts.next();
        }
    }
    None
}

/// Bridge delegate that records calls instead of touching the host
#[derive(Default)]
pub struct FakeBridge {
    calls: Mutex<Vec<String>>,
    fail: Mutex<Vec<&'static str>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named operation fail from now on
    pub fn fail(&self, operation: &'static str) {
        self.fail.lock().unwrap().push(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{} {}", operation, id));
        if self.fail.lock().unwrap().contains(&operation) {
            return Err(anyhow!("{} refused for {}", operation, id));
        }
        Ok(())
    }
}

impl BridgeDelegate for FakeBridge {
    fn name(&self) -> &'static str {
        "fake_bridge"
    }

    fn create_network(
        &self,
        network_id: &str,
        _options: &GenericOptions,
        _ipv4: &[IpamData],
        _ipv6: &[IpamData],
    ) -> Result<()> {
        self.record("create_network", network_id)
    }

    fn delete_network(&self, network_id: &str) -> Result<()> {
        self.record("delete_network", network_id)
    }

    fn create_endpoint(
        &self,
        _network_id: &str,
        endpoint_id: &str,
        _interface: &EndpointInterface,
    ) -> Result<EndpointInterface> {
        self.record("create_endpoint", endpoint_id)?;
        Ok(EndpointInterface {
            mac_address: Some("02:42:ac:12:00:02".to_string()),
            ..Default::default()
        })
    }

    fn delete_endpoint(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        self.record("delete_endpoint", endpoint_id)
    }

    fn endpoint_oper_info(&self, _network_id: &str, endpoint_id: &str) -> Result<GenericOptions> {
        self.record("endpoint_oper_info", endpoint_id)?;
        Ok(GenericOptions::new())
    }

    fn join(&self, _network_id: &str, endpoint_id: &str, _sandbox_key: &str) -> Result<JoinInfo> {
        self.record("join", endpoint_id)?;
        Ok(JoinInfo {
            src_name: "vc-test".to_string(),
            dst_prefix: "eth".to_string(),
            gateway: "172.18.0.1".parse().ok(),
            ..Default::default()
        })
    }

    fn leave(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        self.record("leave", endpoint_id)
    }

    fn program_external_connectivity(
        &self,
        _network_id: &str,
        endpoint_id: &str,
        _bindings: &[PortBinding],
        _exposed: &[ExposedPort],
    ) -> Result<()> {
        self.record("program_external_connectivity", endpoint_id)
    }

    fn revoke_external_connectivity(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        self.record("revoke_external_connectivity", endpoint_id)
    }
}

/// Fixed interface table
pub struct StaticInterfaces {
    interfaces: Vec<(IpNet, String)>,
}

impl StaticInterfaces {
    /// `(address/prefix, interface)` pairs
    pub fn new(entries: &[(&str, &str)]) -> Self {
        Self {
            interfaces: entries
                .iter()
                .map(|(net, name)| (net.parse().unwrap(), name.to_string()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            interfaces: Vec::new(),
        }
    }
}

impl InterfaceResolver for StaticInterfaces {
    fn interface_for(&self, address: IpAddr) -> Option<String> {
        self.interfaces
            .iter()
            .find(|(net, _)| net.contains(&address))
            .map(|(_, name)| name.clone())
    }
}
