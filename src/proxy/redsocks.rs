// redsocks configuration
//
// redsocks accepts connections redirected by iptables REDIRECT and relays
// them to an upstream SOCKS/HTTP proxy.

use super::{ProcessError, ProcessTemplate, check_directive};
use std::ffi::OsString;
use std::fmt::Write;
use std::path::Path;

pub const DEFAULT_PROXY_TYPE: &str = "socks5";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Settings for one redsocks instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedsocksConfig {
    /// Address the redirector listens on; all interfaces when unset
    pub bind_address: Option<String>,
    pub bind_port: u16,
    pub proxy_address: String,
    pub proxy_port: u16,
    /// Upstream protocol, socks5 when unset
    pub proxy_type: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
}

impl ProcessTemplate for RedsocksConfig {
    fn name(&self) -> &'static str {
        "redsocks"
    }

    fn render(&self) -> Result<String, ProcessError> {
        let bind_address = self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS);
        let proxy_type = self.proxy_type.as_deref().unwrap_or(DEFAULT_PROXY_TYPE);

        check_directive("tunnelBindAddress", bind_address)?;
        check_directive("proxyaddress", &self.proxy_address)?;
        check_directive("proxytype", proxy_type)?;

        let mut out = String::new();
        out.push_str("base {\n");
        out.push_str("  log_debug = off;\n");
        out.push_str("  log_info = on;\n");
        out.push_str("  log = stderr;\n");
        out.push_str("  daemon = off;\n");
        out.push_str("  redirector = iptables;\n");
        out.push_str("}\n");
        out.push_str("redsocks {\n");
        // Writing to a String cannot fail
        let _ = writeln!(out, "  local_ip = {};", bind_address);
        let _ = writeln!(out, "  local_port = {};", self.bind_port);
        let _ = writeln!(out, "  ip = {};", self.proxy_address);
        let _ = writeln!(out, "  port = {};", self.proxy_port);
        let _ = writeln!(out, "  type = {};", proxy_type);
        if let Some(user) = &self.proxy_user {
            check_directive("proxyuser", user)?;
            let _ = writeln!(out, "  login = \"{}\";", user);
        }
        if let Some(password) = &self.proxy_password {
            check_directive("proxypassword", password)?;
            let _ = writeln!(out, "  password = \"{}\";", password);
        }
        out.push_str("}\n");

        Ok(out)
    }

    fn args(&self, config_path: &Path) -> Vec<OsString> {
        vec!["-c".into(), config_path.into()]
    }
}
