// Plugin payloads <-> bridge delegate arguments

use crate::backends::bridge::{
    DEFAULT_GATEWAY_V4_AUX_KEY, EndpointInterface, ExposedPort, GenericOptions, IpamData, JoinInfo,
    PortBinding, Protocol,
};
use crate::error::{DriverError, Result};
use crate::plugin::api;
use ipnet::IpNet;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

/// Parse `a.b.c.d/len`, or a bare address taking `default_prefix`
fn parse_cidr(value: &str, default_prefix: u8) -> Option<IpNet> {
    let value = value.trim();
    if value.contains('/') {
        return value.parse().ok();
    }
    let address: IpAddr = value.parse().ok()?;
    IpNet::new(address, default_prefix).ok()
}

/// Translate IPAM pools, parsing pool and gateway CIDRs
///
/// A gateway without a prefix takes the pool's. Unparsable aux addresses
/// are skipped with a warning; the gateway is always registered under
/// `DefaultGatewayIPv4`.
pub fn ipam_data(input: &[api::IpamData]) -> Result<Vec<IpamData>> {
    input
        .iter()
        .map(|data| {
            let pool: IpNet = data.pool.trim().parse().map_err(|_| {
                DriverError::InvalidRequest(format!("invalid pool {:?}", data.pool))
            })?;
            let gateway = parse_cidr(&data.gateway, pool.prefix_len()).ok_or_else(|| {
                DriverError::InvalidRequest(format!("invalid gateway {:?}", data.gateway))
            })?;

            let mut aux_addresses = HashMap::new();
            for (key, value) in &data.aux_addresses {
                match value.as_str().and_then(|v| parse_cidr(v, pool.prefix_len())) {
                    Some(address) => {
                        aux_addresses.insert(key.clone(), address);
                    }
                    None => log::warn!("Skipping invalid aux address {}={}", key, value),
                }
            }
            aux_addresses.insert(DEFAULT_GATEWAY_V4_AUX_KEY.to_string(), gateway);

            Ok(IpamData {
                address_space: data.address_space.clone(),
                pool,
                gateway,
                aux_addresses,
            })
        })
        .collect()
}

/// Flatten a JSON value into the string form option consumers expect
fn option_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// User options of a network, from the generic-data entry of `Options`
pub fn generic_options(options: &HashMap<String, Value>) -> GenericOptions {
    let Some(Value::Object(generic)) = options.get(api::GENERIC_DATA_OPTION) else {
        return GenericOptions::new();
    };

    generic
        .iter()
        .filter_map(|(key, value)| match option_string(value) {
            Some(value) => Some((key.clone(), value)),
            None => {
                log::warn!("Ignoring non-scalar network option {}", key);
                None
            }
        })
        .collect()
}

fn parse_optional_cidr(field: &str, value: &str) -> Result<Option<IpNet>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| DriverError::InvalidRequest(format!("invalid {} {:?}", field, value)))
}

pub fn endpoint_interface(input: Option<&api::EndpointInterface>) -> Result<EndpointInterface> {
    let Some(input) = input else {
        return Ok(EndpointInterface::default());
    };
    Ok(EndpointInterface {
        address: parse_optional_cidr("Address", &input.address)?,
        address_ipv6: parse_optional_cidr("AddressIPv6", &input.address_ipv6)?,
        mac_address: Some(input.mac_address.clone()).filter(|m| !m.is_empty()),
    })
}

/// Reply interface; `None` when the delegate decided nothing itself
pub fn endpoint_reply(output: &EndpointInterface) -> Option<api::EndpointInterface> {
    let reply = api::EndpointInterface {
        address: output.address.map(|a| a.to_string()).unwrap_or_default(),
        address_ipv6: output.address_ipv6.map(|a| a.to_string()).unwrap_or_default(),
        mac_address: output.mac_address.clone().unwrap_or_default(),
    };
    if reply.is_empty() { None } else { Some(reply) }
}

pub fn join_response(info: JoinInfo) -> api::JoinResponse {
    api::JoinResponse {
        interface_name: api::InterfaceName {
            src_name: info.src_name,
            dst_prefix: info.dst_prefix,
        },
        gateway: info.gateway.map(|g| g.to_string()).unwrap_or_default(),
        gateway_ipv6: info.gateway_ipv6.map(|g| g.to_string()).unwrap_or_default(),
        static_routes: info
            .static_routes
            .into_iter()
            .map(|route| api::StaticRoute {
                destination: route.destination.to_string(),
                route_type: route.route_type,
                next_hop: route.next_hop.map(|h| h.to_string()).unwrap_or_default(),
            })
            .collect(),
        disable_gateway_service: info.disable_gateway_service,
    }
}

fn parse_optional_ip(value: &str) -> Option<IpAddr> {
    if value.is_empty() {
        None
    } else {
        value.parse().ok()
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(
    options: &HashMap<String, Value>,
    key: &str,
) -> Result<Vec<T>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| DriverError::InvalidRequest(format!("invalid {}: {}", key, e))),
    }
}

/// Published port bindings of a ProgramExternalConnectivity request
pub fn port_bindings(options: &HashMap<String, Value>) -> Result<Vec<PortBinding>> {
    let raw: Vec<api::PortBindingData> = decode_list(options, api::PORT_MAP_OPTION)?;
    Ok(raw
        .into_iter()
        .map(|b| PortBinding {
            proto: Protocol::from_number(b.proto),
            ip: parse_optional_ip(&b.ip),
            port: b.port,
            host_ip: parse_optional_ip(&b.host_ip),
            host_port: b.host_port,
            host_port_end: b.host_port_end,
        })
        .collect())
}

/// Exposed ports of a ProgramExternalConnectivity request
pub fn exposed_ports(options: &HashMap<String, Value>) -> Result<Vec<ExposedPort>> {
    let raw: Vec<api::TransportPortData> = decode_list(options, api::EXPOSED_PORTS_OPTION)?;
    Ok(raw
        .into_iter()
        .map(|p| ExposedPort {
            proto: Protocol::from_number(p.proto),
            port: p.port,
        })
        .collect())
}
