// Rebuild creation requests for networks that existed before a restart

use crate::backends::bridge::DEFAULT_GATEWAY_V4_AUX_KEY;
use crate::docker::NetworkResource;
use crate::plugin::api;
use serde_json::Value;
use std::collections::HashMap;

/// Networks served by the driver registered under `driver_name`
pub fn owned_networks<'a>(
    networks: &'a [NetworkResource],
    driver_name: &'a str,
) -> impl Iterator<Item = &'a NetworkResource> + 'a {
    networks.iter().filter(move |n| n.driver == driver_name)
}

/// Express an engine network description as a CreateNetwork request
///
/// IPv4 configs are recognized by a dotted gateway, IPv6 ones by a colon,
/// the latter only when the network has IPv6 enabled. Configs without a
/// gateway are dropped.
pub fn create_request(network: &NetworkResource) -> api::CreateNetworkRequest {
    let mut ipv4_data = Vec::new();
    let mut ipv6_data = Vec::new();

    for config in &network.ipam.config {
        let mut aux_addresses: HashMap<String, Value> = config
            .auxiliary_addresses
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        aux_addresses.insert(
            DEFAULT_GATEWAY_V4_AUX_KEY.to_string(),
            Value::String(config.gateway.clone()),
        );

        let data = api::IpamData {
            address_space: String::new(),
            pool: config.subnet.clone(),
            gateway: config.gateway.clone(),
            aux_addresses,
        };

        if config.gateway.contains('.') {
            ipv4_data.push(data);
        } else if config.gateway.contains(':') && network.enable_ipv6 {
            ipv6_data.push(data);
        } else {
            log::debug!(
                "Network {}: ignoring IPAM config {} with gateway {:?}",
                network.id,
                config.subnet,
                config.gateway
            );
        }
    }

    let generic: serde_json::Map<String, Value> = network
        .options
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let mut options = HashMap::new();
    options.insert(api::GENERIC_DATA_OPTION.to_string(), Value::Object(generic));

    api::CreateNetworkRequest {
        network_id: network.id.clone(),
        options,
        ipv4_data,
        ipv6_data,
    }
}
