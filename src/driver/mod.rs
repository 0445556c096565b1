//! Network driver facade
//!
//! Implements the remote network driver operations. Structural work goes
//! to the injected [`BridgeDelegate`]; proxy wiring (rules plus a redsocks
//! instance) is layered on top through one [`NetworkContext`] per network.
//!
//! # Shared state
//!
//! - the dedicated chain, created in both tables by [`Driver::new`] and
//!   removed by [`Driver::shut_down`]
//! - the Tor relay, whose SOCKS and DNS ports every network uses
//! - the network index (network ID -> context), behind one mutex held for
//!   the whole of a create or delete so the two never interleave
//!
//! # Failure model
//!
//! A network whose proxy wiring fails to come up stays structurally
//! created and indexed. The orchestrator is expected to delete it, which
//! tears down whatever was programmed.

pub mod recovery;
pub mod translate;

use crate::backends::bridge::BridgeDelegate;
use crate::backends::interfaces::InterfaceResolver;
use crate::backends::iptables::PacketFilter;
use crate::docker::NetworkResource;
use crate::error::{DriverError, Result};
use crate::network::options::{OptionsError, SharedPorts};
use crate::network::rules::{self, NAMESPACE_SEPARATOR};
use crate::network::{NetworkContext, WiringEnv};
use crate::plugin::api;
use crate::proxy::{ProxyProcess, TorConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Driver name when no namespace is configured
pub const DEFAULT_DRIVER_NAME: &str = "soxy-driver";

/// Name the driver registers under, optionally namespaced
pub fn driver_name(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.trim().is_empty() => {
            format!("{}{}{}", ns, NAMESPACE_SEPARATOR, DEFAULT_DRIVER_NAME)
        }
        _ => DEFAULT_DRIVER_NAME.to_string(),
    }
}

/// Host-facing settings of a driver instance
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub namespace: Option<String>,
    pub redsocks_bin: PathBuf,
    pub tor_bin: PathBuf,
    pub tor_data_dir: Option<PathBuf>,
    pub runtime_dir: PathBuf,
}

pub struct Driver {
    name: String,
    bridge: Arc<dyn BridgeDelegate>,
    interfaces: Arc<dyn InterfaceResolver>,
    env: WiringEnv,
    relay: ProxyProcess<TorConfig>,
    networks: Mutex<HashMap<String, NetworkContext>>,
}

impl Driver {
    /// Set up the dedicated chain and start the Tor relay
    pub fn new(
        settings: DriverSettings,
        filter: Arc<dyn PacketFilter>,
        bridge: Arc<dyn BridgeDelegate>,
        interfaces: Arc<dyn InterfaceResolver>,
    ) -> Result<Self> {
        let namespace = settings.namespace.as_deref();
        let name = driver_name(namespace);
        let chain = rules::chain_name(namespace);

        log::info!(
            "Initializing driver {} (chain {}, bridge delegate {})",
            name,
            chain,
            bridge.name()
        );

        rules::setup_chain(&*filter, &chain)?;

        let relay = TorConfig::allocate(settings.tor_data_dir.clone())
            .map_err(|e| DriverError::from(OptionsError::PortAllocation(e)))
            .and_then(|config| {
                Ok(ProxyProcess::new(
                    &settings.tor_bin,
                    &settings.runtime_dir,
                    config,
                )?)
            })
            .and_then(|relay| {
                relay.start()?;
                Ok(relay)
            });

        let relay = match relay {
            Ok(relay) => relay,
            Err(e) => {
                log::error!("Failed to start the Tor relay: {}", e);
                if let Err(cleanup) = rules::teardown_chain(&*filter, &chain) {
                    log::warn!("Failed to remove chain {}: {}", chain, cleanup);
                }
                return Err(e);
            }
        };

        Ok(Self {
            name,
            bridge,
            interfaces,
            env: WiringEnv {
                filter,
                chain,
                redsocks_bin: settings.redsocks_bin,
                runtime_dir: settings.runtime_dir,
            },
            relay,
            networks: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A panicked handler leaves every context either fully indexed or absent,
    // so a poisoned index is still usable
    fn index(&self) -> MutexGuard<'_, HashMap<String, NetworkContext>> {
        self.networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn chain(&self) -> &str {
        &self.env.chain
    }

    /// Ports of the shared relay handed to every network
    pub fn shared_ports(&self) -> SharedPorts {
        let config = self.relay.template();
        SharedPorts {
            onion_port: config.socks_port,
            dns_port: config.dns_port,
        }
    }

    pub fn relay(&self) -> &ProxyProcess<TorConfig> {
        &self.relay
    }

    /// IDs of networks with proxy wiring
    pub fn proxied_networks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run `f` on the context of a proxied network
    pub fn with_network<R>(&self, network_id: &str, f: impl FnOnce(&NetworkContext) -> R) -> Option<R> {
        self.index().get(network_id).map(f)
    }

    pub fn get_capabilities(&self) -> api::CapabilitiesResponse {
        api::CapabilitiesResponse {
            scope: api::LOCAL_SCOPE.to_string(),
            connectivity_scope: api::LOCAL_SCOPE.to_string(),
        }
    }

    /// Create the bridge, then wire it through the proxy if it resolves
    pub fn create_network(&self, request: &api::CreateNetworkRequest) -> Result<()> {
        log::debug!("CreateNetwork {}", request.network_id);

        let ipv4 = translate::ipam_data(&request.ipv4_data)?;
        let ipv6 = translate::ipam_data(&request.ipv6_data)?;
        let options = translate::generic_options(&request.options);

        let mut networks = self.index();

        self.bridge
            .create_network(&request.network_id, &options, &ipv4, &ipv6)
            .map_err(DriverError::Bridge)?;

        let Some(gateway) = ipv4.first().map(|data| data.gateway.addr()) else {
            log::warn!(
                "Network {} has no IPv4 pool, not proxying it",
                request.network_id
            );
            return Ok(());
        };

        let Some(bridge_name) = self.interfaces.interface_for(gateway) else {
            log::warn!(
                "No interface owns gateway {} of network {}, not proxying it",
                gateway,
                request.network_id
            );
            return Ok(());
        };
        log::debug!(
            "Network {} is backed by bridge {}",
            request.network_id,
            bridge_name
        );

        let context = NetworkContext::create(
            &request.network_id,
            &bridge_name,
            &options,
            self.shared_ports(),
            &self.env,
        )?;

        if let Some(previous) = networks.remove(&request.network_id) {
            log::warn!(
                "Network {} was already proxied, replacing its wiring",
                request.network_id
            );
            if let Err(e) = previous.cleanup() {
                log::warn!("Cleanup of replaced wiring failed: {}", e);
            }
        }

        // Indexed even on failure so a later delete can undo partial wiring
        let result = context.init();
        networks.insert(request.network_id.clone(), context);
        result
    }

    pub fn allocate_network(
        &self,
        request: &api::AllocateNetworkRequest,
    ) -> Result<api::AllocateNetworkResponse> {
        let options = self
            .bridge
            .allocate_network(&request.network_id, &request.options)
            .map_err(DriverError::Bridge)?;
        Ok(api::AllocateNetworkResponse { options })
    }

    /// Delete the bridge and tear down any proxy wiring
    ///
    /// The context is cleaned up and forgotten whatever the structural
    /// deletion returned; the first error is reported.
    pub fn delete_network(&self, request: &api::NetworkRequest) -> Result<()> {
        log::debug!("DeleteNetwork {}", request.network_id);

        let mut networks = self.index();

        let structural = self.bridge.delete_network(&request.network_id);
        if let Err(e) = &structural {
            log::error!(
                "Bridge delegate failed to delete network {}: {:#}",
                request.network_id,
                e
            );
        }

        let wiring = match networks.remove(&request.network_id) {
            Some(context) => context.cleanup(),
            None => {
                log::debug!("Network {} had no proxy wiring", request.network_id);
                Ok(())
            }
        };

        structural.map_err(DriverError::Bridge)?;
        wiring
    }

    pub fn free_network(&self, request: &api::NetworkRequest) -> Result<()> {
        self.bridge
            .free_network(&request.network_id)
            .map_err(DriverError::Bridge)
    }

    pub fn create_endpoint(
        &self,
        request: &api::CreateEndpointRequest,
    ) -> Result<api::CreateEndpointResponse> {
        log::debug!(
            "CreateEndpoint {} on {}",
            request.endpoint_id,
            request.network_id
        );
        let interface = translate::endpoint_interface(request.interface.as_ref())?;
        let reply = self
            .bridge
            .create_endpoint(&request.network_id, &request.endpoint_id, &interface)
            .map_err(DriverError::Bridge)?;
        Ok(api::CreateEndpointResponse {
            interface: translate::endpoint_reply(&reply),
        })
    }

    pub fn delete_endpoint(&self, request: &api::EndpointRequest) -> Result<()> {
        log::debug!(
            "DeleteEndpoint {} on {}",
            request.endpoint_id,
            request.network_id
        );
        self.bridge
            .delete_endpoint(&request.network_id, &request.endpoint_id)
            .map_err(DriverError::Bridge)
    }

    pub fn endpoint_info(&self, request: &api::EndpointRequest) -> Result<api::InfoResponse> {
        let value = self
            .bridge
            .endpoint_oper_info(&request.network_id, &request.endpoint_id)
            .map_err(DriverError::Bridge)?;
        Ok(api::InfoResponse { value })
    }

    pub fn join(&self, request: &api::JoinRequest) -> Result<api::JoinResponse> {
        log::debug!("Join {} on {}", request.endpoint_id, request.network_id);
        let info = self
            .bridge
            .join(&request.network_id, &request.endpoint_id, &request.sandbox_key)
            .map_err(DriverError::Bridge)?;
        Ok(translate::join_response(info))
    }

    pub fn leave(&self, request: &api::EndpointRequest) -> Result<()> {
        log::debug!("Leave {} on {}", request.endpoint_id, request.network_id);
        self.bridge
            .leave(&request.network_id, &request.endpoint_id)
            .map_err(DriverError::Bridge)
    }

    pub fn discover_new(&self, _notification: &api::DiscoveryNotification) -> Result<()> {
        Err(DriverError::NotSupported("DiscoverNew"))
    }

    pub fn discover_delete(&self, _notification: &api::DiscoveryNotification) -> Result<()> {
        Err(DriverError::NotSupported("DiscoverDelete"))
    }

    pub fn program_external_connectivity(
        &self,
        request: &api::ProgramExternalConnectivityRequest,
    ) -> Result<()> {
        let bindings = translate::port_bindings(&request.options)?;
        let exposed = translate::exposed_ports(&request.options)?;
        self.bridge
            .program_external_connectivity(
                &request.network_id,
                &request.endpoint_id,
                &bindings,
                &exposed,
            )
            .map_err(DriverError::Bridge)
    }

    pub fn revoke_external_connectivity(&self, request: &api::EndpointRequest) -> Result<()> {
        self.bridge
            .revoke_external_connectivity(&request.network_id, &request.endpoint_id)
            .map_err(DriverError::Bridge)
    }

    /// Replay creation for every engine network served by this driver
    ///
    /// Returns how many networks were replayed successfully.
    pub fn recover(&self, networks: &[NetworkResource]) -> usize {
        let mut recovered = 0;
        for network in recovery::owned_networks(networks, &self.name) {
            log::info!("Recovering network {} ({})", network.name, network.id);
            match self.create_network(&recovery::create_request(network)) {
                Ok(()) => recovered += 1,
                Err(e) => log::error!("Failed to recover network {}: {}", network.id, e),
            }
        }
        recovered
    }

    /// Tear down every network's wiring, the chain, then the relay
    pub fn shut_down(&self) -> Result<()> {
        log::info!("Shutting down driver {}", self.name);
        let mut first_error: Option<DriverError> = None;

        let contexts: Vec<(String, NetworkContext)> =
            self.index().drain().collect();
        for (network_id, context) in contexts {
            if let Err(e) = context.cleanup() {
                log::error!("Cleanup of network {} failed: {}", network_id, e);
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = rules::teardown_chain(&*self.env.filter, &self.env.chain) {
            log::error!("Failed to remove chain {}: {}", self.env.chain, e);
            first_error.get_or_insert(e.into());
        }

        match self.relay.stop() {
            Ok(()) => {}
            Err(e) if e.is_not_running() => log::debug!("Tor relay was not running"),
            Err(e) => {
                log::error!("Failed to stop the Tor relay: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
