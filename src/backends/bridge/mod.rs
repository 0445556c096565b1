//! Bridge delegate abstraction
//!
//! The driver never builds bridges or veth pairs itself. Everything
//! structural (bridge creation, endpoint attachment, address assignment,
//! port publishing) is handed to a `BridgeDelegate`, which is injected into
//! the driver at construction time. The delegate speaks in native shapes
//! (parsed CIDRs, typed port bindings) rather than the plugin protocol's
//! JSON shapes; the driver translates between the two.
//!
//! # Implementations
//!
//! - `LinuxBridge`: Linux bridge + veth pairs managed with the `ip` command,
//!   with masquerading and forwarding rules programmed through iptables

use anyhow::Result;
use ipnet::IpNet;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

pub mod linux;

pub use linux::LinuxBridge;

/// Generic option carrying an explicit bridge interface name
pub const BRIDGE_NAME_OPTION: &str = "com.docker.network.bridge.name";

/// Aux address key under which the gateway is registered
pub const DEFAULT_GATEWAY_V4_AUX_KEY: &str = "DefaultGatewayIPv4";

/// Operational info key for the endpoint MAC address
pub const MAC_ADDRESS_INFO_KEY: &str = "com.docker.network.endpoint.macaddress";

/// String-keyed driver options
pub type GenericOptions = HashMap<String, String>;

/// One IPAM pool assigned to a network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamData {
    pub address_space: String,
    /// Network pool, e.g. 172.18.0.0/16
    pub pool: IpNet,
    /// Gateway host address with the pool prefix, e.g. 172.18.0.1/16
    pub gateway: IpNet,
    pub aux_addresses: HashMap<String, IpNet>,
}

/// Interface data exchanged on endpoint creation
///
/// On the way in it carries what the orchestrator already decided; on the
/// way out only the fields the delegate filled in itself are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInterface {
    pub address: Option<IpNet>,
    pub address_ipv6: Option<IpNet>,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub destination: IpNet,
    pub route_type: i64,
    pub next_hop: Option<IpAddr>,
}

/// What the sandbox needs to know when an endpoint joins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinInfo {
    pub src_name: String,
    pub dst_prefix: String,
    pub gateway: Option<IpAddr>,
    pub gateway_ipv6: Option<IpAddr>,
    pub static_routes: Vec<StaticRoute>,
    pub disable_gateway_service: bool,
}

/// IP protocol of a published or exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    /// Map an IANA protocol number; anything unknown is treated as ICMP
    pub fn from_number(value: u8) -> Self {
        match value {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            _ => Protocol::Icmp,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A published port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub proto: Protocol,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub host_ip: Option<IpAddr>,
    pub host_port: u16,
    pub host_port_end: u16,
}

/// A port the container exposes without publishing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedPort {
    pub proto: Protocol,
    pub port: u16,
}

/// Structural network and endpoint operations
pub trait BridgeDelegate: Send + Sync {
    /// Delegate name (e.g., "linux_bridge")
    fn name(&self) -> &'static str;

    fn create_network(
        &self,
        network_id: &str,
        options: &GenericOptions,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> Result<()>;

    fn delete_network(&self, network_id: &str) -> Result<()>;

    /// Global-scope allocation; local-scope delegates just echo nothing back
    fn allocate_network(&self, _network_id: &str, _options: &GenericOptions) -> Result<GenericOptions> {
        Ok(GenericOptions::new())
    }

    fn free_network(&self, _network_id: &str) -> Result<()> {
        Ok(())
    }

    fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        interface: &EndpointInterface,
    ) -> Result<EndpointInterface>;

    fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()>;

    fn endpoint_oper_info(&self, network_id: &str, endpoint_id: &str) -> Result<GenericOptions>;

    fn join(&self, network_id: &str, endpoint_id: &str, sandbox_key: &str) -> Result<JoinInfo>;

    fn leave(&self, network_id: &str, endpoint_id: &str) -> Result<()>;

    fn program_external_connectivity(
        &self,
        network_id: &str,
        endpoint_id: &str,
        bindings: &[PortBinding],
        exposed: &[ExposedPort],
    ) -> Result<()>;

    fn revoke_external_connectivity(&self, network_id: &str, endpoint_id: &str) -> Result<()>;
}
