// Tor relay configuration
//
// One relay is shared by every network. It offers a SOCKS entry point and a
// DNS resolver; networks redirect their DNS traffic to the latter.

use super::{ProcessError, ProcessTemplate, check_directive};
use crate::port::find_available_port;
use std::ffi::OsString;
use std::fmt::Write;
use std::io;
use std::path::{Path, PathBuf};

/// Settings for the shared Tor relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConfig {
    pub socks_port: u16,
    pub dns_port: u16,
    pub data_dir: Option<PathBuf>,
}

impl TorConfig {
    /// Pick fresh SOCKS and DNS ports
    pub fn allocate(data_dir: Option<PathBuf>) -> io::Result<Self> {
        let socks_port = find_available_port()?;
        let mut dns_port = find_available_port()?;
        while dns_port == socks_port {
            dns_port = find_available_port()?;
        }

        log::debug!(
            "Tor relay will use SOCKS port {} and DNS port {}",
            socks_port,
            dns_port
        );

        Ok(Self {
            socks_port,
            dns_port,
            data_dir,
        })
    }
}

impl ProcessTemplate for TorConfig {
    fn name(&self) -> &'static str {
        "tor"
    }

    fn render(&self) -> Result<String, ProcessError> {
        let mut out = String::new();
        out.push_str("Log notice stdout\n");
        out.push_str("ExitPolicy reject *:*\n");
        let _ = writeln!(out, "SocksPort 0.0.0.0:{}", self.socks_port);
        let _ = writeln!(out, "DNSPort 0.0.0.0:{}", self.dns_port);
        out.push_str("AutomapHostsOnResolve 1\n");
        out.push_str("GeoIPExcludeUnknown 1\n");
        if let Some(dir) = &self.data_dir {
            let dir = dir.to_string_lossy();
            check_directive("DataDirectory", &dir)?;
            let _ = writeln!(out, "DataDirectory {}", dir);
        }
        Ok(out)
    }

    fn args(&self, config_path: &Path) -> Vec<OsString> {
        vec!["-f".into(), config_path.into()]
    }
}
