// Linux bridge delegate
//
// REQUIREMENTS:
// - iproute2 (`ip` command)
// - iptables (masquerading, forwarding and published ports)
// - Root privileges
//
// Each network gets a kernel bridge `br-<id prefix>` carrying the gateway
// address. Each endpoint is a veth pair: the host side is enslaved to the
// bridge, the container side is handed to the orchestrator on join, which
// moves it into the sandbox and renames it.

use super::{
    BRIDGE_NAME_OPTION, BridgeDelegate, EndpointInterface, ExposedPort, GenericOptions, IpamData,
    JoinInfo, MAC_ADDRESS_INFO_KEY, PortBinding, Protocol,
};
use crate::backends::iptables::{Action, PacketFilter, Table, args, program_rule};
use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

const ID_PREFIX_LEN: usize = 12;
const CONTAINER_IFACE_PREFIX: &str = "eth";
const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

struct BridgeNetwork {
    bridge: String,
    ipv4: IpamData,
    ipv6: Option<IpamData>,
}

struct Endpoint {
    network_id: String,
    host_veth: String,
    container_veth: String,
    mac_address: Option<String>,
    address: Option<IpAddr>,
    /// (table, chain, rule) triples added for published ports
    published: Vec<(Table, &'static str, Vec<String>)>,
}

/// Bridge delegate backed by iproute2 and iptables
pub struct LinuxBridge {
    filter: Arc<dyn PacketFilter>,
    networks: Mutex<HashMap<String, BridgeNetwork>>,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl LinuxBridge {
    pub fn new(filter: Arc<dyn PacketFilter>) -> Self {
        Self {
            filter,
            networks: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn network_table(&self) -> MutexGuard<'_, HashMap<String, BridgeNetwork>> {
        self.networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn endpoint_table(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if the `ip` command is available
    pub fn is_available() -> bool {
        Command::new("ip").arg("-V").output().is_ok()
    }

    /// Turn on IPv4 forwarding, containers cannot reach anything without it
    pub fn enable_ip_forwarding(&self) -> Result<()> {
        let current = fs::read_to_string(IP_FORWARD_SYSCTL).unwrap_or_default();
        if current.trim() == "1" {
            log::debug!("IPv4 forwarding already enabled");
            return Ok(());
        }

        fs::write(IP_FORWARD_SYSCTL, "1").context("Failed to enable IPv4 forwarding")?;
        log::info!("Enabled IPv4 forwarding");
        Ok(())
    }

    /// Rules that let traffic in and out of a bridge
    fn bridge_rules(bridge: &str, pool: &IpNet) -> Vec<(Table, Action, &'static str, Vec<String>)> {
        let pool = pool.trunc().to_string();
        vec![
            (
                Table::Nat,
                Action::Append,
                "POSTROUTING",
                args([
                    "-s",
                    pool.as_str(),
                    "!",
                    "-o",
                    bridge,
                    "-j",
                    "MASQUERADE",
                ]),
            ),
            (
                Table::Filter,
                Action::Insert,
                "FORWARD",
                args(["-i", bridge, "-j", "ACCEPT"]),
            ),
            (
                Table::Filter,
                Action::Insert,
                "FORWARD",
                args([
                    "-o",
                    bridge,
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ]),
            ),
        ]
    }

    fn program_bridge_rules(&self, bridge: &str, pool: &IpNet, remove: bool) -> Result<()> {
        for (table, action, chain, rule) in Self::bridge_rules(bridge, pool) {
            let action = if remove { Action::Delete } else { action };
            let result = program_rule(&*self.filter, table, action, chain, &rule);
            if let Err(e) = result {
                if remove {
                    log::warn!("Failed to remove bridge rule for {}: {}", bridge, e);
                } else {
                    return Err(e).context(format!("Failed to program bridge rule for {}", bridge));
                }
            }
        }
        Ok(())
    }

    fn published_rules(
        bridge: &str,
        address: IpAddr,
        binding: &PortBinding,
    ) -> Vec<(Table, &'static str, Vec<String>)> {
        let proto = binding.proto.to_string();
        let host_port = binding.host_port.to_string();
        let port = binding.port.to_string();
        let destination = format!("{}:{}", address, binding.port);

        let address = address.to_string();

        let mut dnat = args(["-p", proto.as_str(), "!", "-i", bridge]);
        if let Some(host_ip) = binding.host_ip.filter(|ip| !ip.is_unspecified()) {
            dnat.push("-d".to_string());
            dnat.push(host_ip.to_string());
        }
        dnat.extend(args([
            "--dport",
            host_port.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ]));

        let accept = args([
            "-d",
            address.as_str(),
            "!",
            "-i",
            bridge,
            "-o",
            bridge,
            "-p",
            proto.as_str(),
            "--dport",
            port.as_str(),
            "-j",
            "ACCEPT",
        ]);

        vec![(Table::Nat, "PREROUTING", dnat), (Table::Filter, "FORWARD", accept)]
    }
}

impl BridgeDelegate for LinuxBridge {
    fn name(&self) -> &'static str {
        "linux_bridge"
    }

    fn create_network(
        &self,
        network_id: &str,
        options: &GenericOptions,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> Result<()> {
        let ipv4 = ipv4
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("network {} has no IPv4 pool", network_id))?;

        let bridge = options
            .get(BRIDGE_NAME_OPTION)
            .cloned()
            .unwrap_or_else(|| bridge_name(network_id));

        if link_exists(&bridge) {
            log::debug!("Bridge {} already exists, reusing it", bridge);
        } else {
            run_ip(&["link", "add", "name", &bridge, "type", "bridge"])?;
            log::info!("Created bridge {} for network {}", bridge, network_id);
        }

        add_address(&bridge, &ipv4.gateway)?;
        if let Some(v6) = ipv6.first() {
            add_address(&bridge, &v6.gateway)?;
        }
        run_ip(&["link", "set", "dev", &bridge, "up"])?;

        self.program_bridge_rules(&bridge, &ipv4.pool, false)?;

        self.network_table().insert(
            network_id.to_string(),
            BridgeNetwork {
                bridge,
                ipv4,
                ipv6: ipv6.first().cloned(),
            },
        );
        Ok(())
    }

    fn delete_network(&self, network_id: &str) -> Result<()> {
        let network = self.network_table().remove(network_id);

        let bridge = match network {
            Some(network) => {
                self.program_bridge_rules(&network.bridge, &network.ipv4.pool, true)?;
                network.bridge
            }
            None => {
                log::warn!(
                    "Network {} unknown to the bridge delegate, removing link only",
                    network_id
                );
                bridge_name(network_id)
            }
        };

        delete_link(&bridge)?;
        log::info!("Deleted bridge {} for network {}", bridge, network_id);
        Ok(())
    }

    fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        interface: &EndpointInterface,
    ) -> Result<EndpointInterface> {
        let bridge = self
            .network_table()
            .get(network_id)
            .map(|n| n.bridge.clone())
            .ok_or_else(|| anyhow!("network {} not found", network_id))?;

        let (host_veth, container_veth) = veth_names(endpoint_id);

        if !link_exists(&host_veth) {
            run_ip(&[
                "link",
                "add",
                &host_veth,
                "type",
                "veth",
                "peer",
                "name",
                &container_veth,
            ])?;
        }

        if let Some(mac) = &interface.mac_address {
            run_ip(&["link", "set", "dev", &container_veth, "address", mac])?;
        }
        run_ip(&["link", "set", "dev", &host_veth, "master", &bridge])?;
        run_ip(&["link", "set", "dev", &host_veth, "up"])?;

        // Only report what we decided ourselves
        let mut reply = EndpointInterface::default();
        let mac_address = match &interface.mac_address {
            Some(mac) => Some(mac.clone()),
            None => {
                let mac = read_mac(&container_veth)?;
                reply.mac_address = Some(mac.clone());
                Some(mac)
            }
        };

        log::debug!(
            "Created endpoint {} ({} <-> {}) on {}",
            endpoint_id,
            host_veth,
            container_veth,
            bridge
        );

        self.endpoint_table().insert(
            endpoint_id.to_string(),
            Endpoint {
                network_id: network_id.to_string(),
                host_veth,
                container_veth,
                mac_address,
                address: interface.address.map(|a| a.addr()),
                published: Vec::new(),
            },
        );

        Ok(reply)
    }

    fn delete_endpoint(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        let host_veth = match self.endpoint_table().remove(endpoint_id) {
            Some(endpoint) => {
                log::debug!(
                    "Deleting endpoint {} from network {}",
                    endpoint_id,
                    endpoint.network_id
                );
                endpoint.host_veth
            }
            None => veth_names(endpoint_id).0,
        };

        // Deleting one end removes the pair
        delete_link(&host_veth)
    }

    fn endpoint_oper_info(&self, _network_id: &str, endpoint_id: &str) -> Result<GenericOptions> {
        let mut info = GenericOptions::new();
        if let Some(mac) = self
            .endpoint_table()
            .get(endpoint_id)
            .and_then(|e| e.mac_address.clone())
        {
            info.insert(MAC_ADDRESS_INFO_KEY.to_string(), mac);
        }
        Ok(info)
    }

    fn join(&self, network_id: &str, endpoint_id: &str, sandbox_key: &str) -> Result<JoinInfo> {
        let container_veth = self
            .endpoint_table()
            .get(endpoint_id)
            .map(|e| e.container_veth.clone())
            .ok_or_else(|| anyhow!("endpoint {} not found", endpoint_id))?;

        let networks = self.network_table();
        let network = networks
            .get(network_id)
            .ok_or_else(|| anyhow!("network {} not found", network_id))?;

        log::debug!("Endpoint {} joining sandbox {}", endpoint_id, sandbox_key);

        Ok(JoinInfo {
            src_name: container_veth,
            dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
            gateway: Some(network.ipv4.gateway.addr()),
            gateway_ipv6: network.ipv6.as_ref().map(|v6| v6.gateway.addr()),
            static_routes: Vec::new(),
            disable_gateway_service: false,
        })
    }

    fn leave(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        log::debug!("Endpoint {} left its sandbox", endpoint_id);
        Ok(())
    }

    fn program_external_connectivity(
        &self,
        network_id: &str,
        endpoint_id: &str,
        bindings: &[PortBinding],
        exposed: &[ExposedPort],
    ) -> Result<()> {
        let bridge = self
            .network_table()
            .get(network_id)
            .map(|n| n.bridge.clone())
            .ok_or_else(|| anyhow!("network {} not found", network_id))?;

        let mut endpoints = self.endpoint_table();
        let endpoint = endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| anyhow!("endpoint {} not found", endpoint_id))?;
        let address = endpoint
            .address
            .ok_or_else(|| anyhow!("endpoint {} has no address", endpoint_id))?;

        log::debug!(
            "Endpoint {} exposes {} port(s), publishes {}",
            endpoint_id,
            exposed.len(),
            bindings.len()
        );

        for binding in bindings {
            if binding.proto == Protocol::Icmp || binding.host_port == 0 {
                continue;
            }
            for (table, chain, rule) in Self::published_rules(&bridge, address, binding) {
                program_rule(&*self.filter, table, Action::Append, chain, &rule)
                    .context(format!("Failed to publish port {}", binding.host_port))?;
                endpoint.published.push((table, chain, rule));
            }
        }
        Ok(())
    }

    fn revoke_external_connectivity(&self, _network_id: &str, endpoint_id: &str) -> Result<()> {
        let published = match self.endpoint_table().get_mut(endpoint_id) {
            Some(endpoint) => std::mem::take(&mut endpoint.published),
            None => return Ok(()),
        };

        for (table, chain, rule) in published {
            if let Err(e) = program_rule(&*self.filter, table, Action::Delete, chain, &rule) {
                log::warn!("Failed to revoke published port for {}: {}", endpoint_id, e);
            }
        }
        Ok(())
    }
}

/// Default bridge interface name for a network
pub fn bridge_name(network_id: &str) -> String {
    format!("br-{}", id_prefix(network_id))
}

/// Host and container side names of an endpoint's veth pair
pub fn veth_names(endpoint_id: &str) -> (String, String) {
    let prefix = id_prefix(endpoint_id);
    (format!("vh{}", prefix), format!("vc{}", prefix))
}

fn id_prefix(id: &str) -> &str {
    match id.char_indices().nth(ID_PREFIX_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("Failed to execute ip")?;

    if !output.status.success() {
        return Err(anyhow!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", "dev", name])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn add_address(link: &str, address: &IpNet) -> Result<()> {
    let address = address.to_string();
    match run_ip(&["addr", "add", &address, "dev", link]) {
        Err(e) if e.to_string().contains("File exists") => {
            log::debug!("Address {} already assigned to {}", address, link);
            Ok(())
        }
        other => other,
    }
}

fn delete_link(name: &str) -> Result<()> {
    match run_ip(&["link", "del", "dev", name]) {
        Err(e) if e.to_string().contains("Cannot find device") => {
            log::debug!("Link {} already gone", name);
            Ok(())
        }
        other => other,
    }
}

fn read_mac(link: &str) -> Result<String> {
    let path = format!("/sys/class/net/{}/address", link);
    let mac = fs::read_to_string(&path).context(format!("Failed to read {}", path))?;
    Ok(mac.trim().to_string())
}
