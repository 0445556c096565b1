// Per-network proxy options
//
// The orchestrator hands us a flat string map. It is parsed here, once, into
// a typed NetworkConfiguration; nothing downstream sees the raw map.

use crate::backends::bridge::GenericOptions;
use crate::port::find_available_port;
use crate::proxy::RedsocksConfig;
use thiserror::Error;

/// Every recognized key may also be given with this prefix, which wins
pub const OPTION_PREFIX: &str = "soxy.";

pub const PROXY_ADDRESS: &str = "proxyaddress";
pub const PROXY_PORT: &str = "proxyport";
pub const PROXY_TYPE: &str = "proxytype";
pub const PROXY_USER: &str = "proxyuser";
pub const PROXY_PASSWORD: &str = "proxypassword";
pub const TUNNEL_BIND_ADDRESS: &str = "tunnelBindAddress";
pub const TUNNEL_PORT: &str = "tunnelPort";
pub const BLOCK_UDP: &str = "blockUDP";

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("option {0} is mandatory")]
    Missing(&'static str),

    #[error("invalid value {value:?} for option {key}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to allocate a local port: {0}")]
    PortAllocation(#[from] std::io::Error),
}

/// Ports of the shared Tor relay, the same for every network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedPorts {
    pub onion_port: u16,
    pub dns_port: u16,
}

/// Fully parsed proxy settings of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfiguration {
    pub network_id: String,
    pub bridge_name: String,
    pub proxy_address: String,
    pub proxy_port: u16,
    pub proxy_type: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub tunnel_bind_address: Option<String>,
    pub tunnel_port: u16,
    pub tunnel_dns_port: u16,
    /// SOCKS port of the shared relay, informational only
    ///
    /// A network without a proxy is refused, so the relay is never used as
    /// a fallback upstream. Only its DNS port is wired into rules.
    pub onion_port: u16,
    pub block_udp: bool,
}

impl NetworkConfiguration {
    /// Parse and validate the options of a network
    ///
    /// Fails when `proxyaddress` or `proxyport` is missing or unusable.
    /// A bad `tunnelPort` only earns a warning and an ephemeral port.
    pub fn configure(
        network_id: &str,
        bridge_name: &str,
        params: &GenericOptions,
        defaults: SharedPorts,
    ) -> Result<Self, OptionsError> {
        let mut keys: Vec<&String> = params.keys().collect();
        keys.sort();
        log::debug!("Network {} options: {:?}", network_id, keys);

        let proxy_address = lookup(params, PROXY_ADDRESS)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(OptionsError::Missing(PROXY_ADDRESS))?
            .to_string();

        let proxy_port = match lookup(params, PROXY_PORT) {
            None => return Err(OptionsError::Missing(PROXY_PORT)),
            Some(value) => match value.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(OptionsError::Invalid {
                        key: PROXY_PORT,
                        value: value.to_string(),
                    });
                }
            },
        };

        let tunnel_port = match lookup(params, TUNNEL_PORT) {
            Some(value) => match value.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    log::warn!(
                        "Invalid {} '{}' for network {}, using an ephemeral port",
                        TUNNEL_PORT,
                        value,
                        network_id
                    );
                    find_available_port()?
                }
            },
            None => find_available_port()?,
        };

        let block_udp = match lookup(params, BLOCK_UDP) {
            Some(value) => parse_bool(value).unwrap_or_else(|| {
                log::warn!(
                    "Option {} is not a valid boolean '{}', blocking UDP",
                    BLOCK_UDP,
                    value
                );
                true
            }),
            None => false,
        };

        Ok(Self {
            network_id: network_id.to_string(),
            bridge_name: bridge_name.to_string(),
            proxy_address,
            proxy_port,
            proxy_type: optional(params, PROXY_TYPE),
            proxy_user: optional(params, PROXY_USER),
            proxy_password: optional(params, PROXY_PASSWORD),
            tunnel_bind_address: optional(params, TUNNEL_BIND_ADDRESS),
            tunnel_port,
            tunnel_dns_port: defaults.dns_port,
            onion_port: defaults.onion_port,
            block_udp,
        })
    }

    /// Settings for this network's redsocks instance
    pub fn redirector_config(&self) -> RedsocksConfig {
        RedsocksConfig {
            bind_address: self.tunnel_bind_address.clone(),
            bind_port: self.tunnel_port,
            proxy_address: self.proxy_address.clone(),
            proxy_port: self.proxy_port,
            proxy_type: self.proxy_type.clone(),
            proxy_user: self.proxy_user.clone(),
            proxy_password: self.proxy_password.clone(),
        }
    }
}

fn lookup<'a>(params: &'a GenericOptions, key: &str) -> Option<&'a str> {
    params
        .get(&format!("{}{}", OPTION_PREFIX, key))
        .or_else(|| params.get(key))
        .map(String::as_str)
}

fn optional(params: &GenericOptions, key: &str) -> Option<String> {
    lookup(params, key)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strict boolean parsing: 1/t/T/TRUE/true/True and 0/f/F/FALSE/false/False
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
