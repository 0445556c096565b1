// Per-network proxy wiring
//
// A NetworkContext ties one network's parsed options to its packet-filter
// rules and its redsocks instance. Bring-up is rules then redirector;
// teardown is rules then redirector too, so redirects never outlive the
// process they point at for longer than the teardown itself.

pub mod options;
pub mod rules;

use crate::backends::bridge::GenericOptions;
use crate::backends::iptables::{Action, PacketFilter};
use crate::error::{DriverError, Result};
use crate::proxy::{ProxyProcess, RedsocksConfig};
use options::{NetworkConfiguration, SharedPorts};
use std::path::PathBuf;
use std::sync::Arc;

/// Host resources every network context shares
#[derive(Clone)]
pub struct WiringEnv {
    pub filter: Arc<dyn PacketFilter>,
    /// Dedicated chain name
    pub chain: String,
    pub redsocks_bin: PathBuf,
    /// Where generated configuration files go
    pub runtime_dir: PathBuf,
}

pub struct NetworkContext {
    config: NetworkConfiguration,
    env: WiringEnv,
    redirector: ProxyProcess<RedsocksConfig>,
}

impl NetworkContext {
    /// Validate the options and prepare (without starting) the redirector
    pub fn create(
        network_id: &str,
        bridge_name: &str,
        params: &GenericOptions,
        shared: SharedPorts,
        env: &WiringEnv,
    ) -> Result<Self> {
        let config = NetworkConfiguration::configure(network_id, bridge_name, params, shared)?;
        let redirector = ProxyProcess::new(
            &env.redsocks_bin,
            &env.runtime_dir,
            config.redirector_config(),
        )?;

        log::debug!(
            "Network {} on {}: upstream {}:{}, tunnel port {}, relay SOCKS {} / DNS {}, block UDP {}",
            network_id,
            bridge_name,
            config.proxy_address,
            config.proxy_port,
            config.tunnel_port,
            config.onion_port,
            config.tunnel_dns_port,
            config.block_udp
        );

        Ok(Self {
            config,
            env: env.clone(),
            redirector,
        })
    }

    pub fn config(&self) -> &NetworkConfiguration {
        &self.config
    }

    pub fn redirector(&self) -> &ProxyProcess<RedsocksConfig> {
        &self.redirector
    }

    /// Program the rules, then start the redirector
    ///
    /// The redirector is not started when the mandatory rule fails.
    pub fn init(&self) -> Result<()> {
        rules::program_network_rules(
            &*self.env.filter,
            &self.env.chain,
            Action::Append,
            &self.config,
        )?;
        self.redirector.start()?;

        log::info!(
            "Network {} proxied through {}:{} via {}",
            self.config.network_id,
            self.config.proxy_address,
            self.config.proxy_port,
            self.config.bridge_name
        );
        Ok(())
    }

    /// Remove the rules and stop the redirector
    ///
    /// Both steps always run; the first failure is returned.
    pub fn cleanup(&self) -> Result<()> {
        let mut first_error: Option<DriverError> = None;

        if let Err(e) = rules::program_network_rules(
            &*self.env.filter,
            &self.env.chain,
            Action::Delete,
            &self.config,
        ) {
            log::error!(
                "Failed to remove rules of network {}: {}",
                self.config.network_id,
                e
            );
            first_error = Some(e.into());
        }

        match self.redirector.stop() {
            Ok(()) => {}
            Err(e) if e.is_not_running() => {
                log::debug!("Redirector of network {} was not running", self.config.network_id);
            }
            Err(e) => {
                log::error!(
                    "Failed to stop redirector of network {}: {}",
                    self.config.network_id,
                    e
                );
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("Network {} no longer proxied", self.config.network_id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::iptables::Table;
    use crate::testing::MemoryFilter;

    const PORTS: SharedPorts = SharedPorts {
        onion_port: 9050,
        dns_port: 5353,
    };

    fn env(filter: Arc<MemoryFilter>, dir: &tempfile::TempDir) -> WiringEnv {
        rules::setup_chain(&*filter, "SOXY_CHAIN").unwrap();
        WiringEnv {
            filter,
            chain: "SOXY_CHAIN".to_string(),
            redsocks_bin: PathBuf::from("true"),
            runtime_dir: dir.path().to_path_buf(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> GenericOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_rejects_missing_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let env = env(filter.clone(), &dir);

        let result = NetworkContext::create("net1", "br-net1", &params(&[]), PORTS, &env);
        assert!(matches!(result, Err(DriverError::Validation(_))));
        // Nothing touched the kernel or the disk
        assert!(filter.rules(Table::Nat, "PREROUTING").is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_rejects_unrenderable_options() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::new(MemoryFilter::new()), &dir);
        let result = NetworkContext::create(
            "net1",
            "br-net1",
            &params(&[
                ("proxyaddress", "203.0.113.5"),
                ("proxyport", "1080"),
                ("proxyuser", "a;b"),
            ]),
            PORTS,
            &env,
        );
        assert!(matches!(result, Err(DriverError::Process(_))));
    }

    #[test]
    fn test_init_then_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let env = env(filter.clone(), &dir);
        let escapes = filter.rules(Table::Nat, "SOXY_CHAIN");

        let context = NetworkContext::create(
            "net1",
            "br-net1",
            &params(&[("proxyaddress", "203.0.113.5"), ("proxyport", "1080")]),
            PORTS,
            &env,
        )
        .unwrap();
        assert!(!context.redirector().is_running());

        context.init().unwrap();
        assert!(context.redirector().is_running());
        assert_eq!(filter.rules(Table::Nat, "PREROUTING").len(), 1);

        context.cleanup().unwrap();
        assert!(!context.redirector().is_running());
        assert!(filter.rules(Table::Nat, "PREROUTING").is_empty());
        assert_eq!(filter.rules(Table::Nat, "SOXY_CHAIN"), escapes);
    }

    #[test]
    fn test_mandatory_rule_failure_keeps_redirector_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let env = env(filter.clone(), &dir);
        filter.fail_on("PREROUTING");

        let context = NetworkContext::create(
            "net1",
            "br-net1",
            &params(&[("proxyaddress", "203.0.113.5"), ("proxyport", "1080")]),
            PORTS,
            &env,
        )
        .unwrap();

        assert!(matches!(context.init(), Err(DriverError::RuleProgramming(_))));
        assert!(!context.redirector().is_running());
    }

    #[test]
    fn test_cleanup_without_init_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::new(MemoryFilter::new()), &dir);
        let context = NetworkContext::create(
            "net1",
            "br-net1",
            &params(&[("proxyaddress", "203.0.113.5"), ("proxyport", "1080")]),
            PORTS,
            &env,
        )
        .unwrap();

        context.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_stops_redirector_even_when_rules_fail() {
        let dir = tempfile::tempdir().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let env = env(filter.clone(), &dir);
        let context = NetworkContext::create(
            "net1",
            "br-net1",
            &params(&[("proxyaddress", "203.0.113.5"), ("proxyport", "1080")]),
            PORTS,
            &env,
        )
        .unwrap();
        context.init().unwrap();

        filter.fail_on("-D PREROUTING");
        assert!(context.cleanup().is_err());
        assert!(!context.redirector().is_running());
    }
}
