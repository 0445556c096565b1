// Driver settings: command line, optional JSON file, built-in defaults
//
// Precedence is CLI, then file, then defaults.

use crate::docker::DEFAULT_DOCKER_SOCKET;
use crate::driver::DriverSettings;
use crate::plugin::DEFAULT_PLUGIN_DIR;
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_RUNTIME_DIR: &str = "/tmp";
const DEFAULT_REDSOCKS_BIN: &str = "redsocks";
const DEFAULT_TOR_BIN: &str = "tor";

#[derive(Parser, Debug, Default)]
#[command(name = "soxy-driver")]
#[command(about = "Docker network driver routing container traffic through a proxy and Tor", long_about = None)]
#[command(version)]
pub struct Args {
    /// Namespace isolating this instance's driver name and iptables chain
    #[arg(long, env = "DRIVER_NAMESPACE", value_name = "NAME")]
    pub namespace: Option<String>,

    /// JSON settings file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Docker engine socket, used to recover existing networks
    #[arg(long, value_name = "PATH")]
    pub docker_socket: Option<PathBuf>,

    /// Directory Docker scans for plugin sockets
    #[arg(long, value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Where generated redsocks/tor configuration files are written
    #[arg(long, value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// redsocks binary
    #[arg(long, value_name = "PATH")]
    pub redsocks_bin: Option<PathBuf>,

    /// tor binary
    #[arg(long, value_name = "PATH")]
    pub tor_bin: Option<PathBuf>,

    /// Tor data directory (tor's default when unset)
    #[arg(long, value_name = "DIR")]
    pub tor_data_dir: Option<PathBuf>,

    /// Don't recover existing networks on startup
    #[arg(long)]
    pub no_recover: bool,

    /// Debug logging
    #[arg(long, short)]
    pub verbose: bool,
}

/// Settings file structure; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub docker_socket: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub redsocks_bin: Option<PathBuf>,
    pub tor_bin: Option<PathBuf>,
    pub tor_data_dir: Option<PathBuf>,
    /// Recover existing networks on startup
    pub recover: Option<bool>,
    pub verbose: Option<bool>,
}

impl FileConfig {
    /// Load a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: FileConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub namespace: Option<String>,
    pub docker_socket: PathBuf,
    pub plugin_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub redsocks_bin: PathBuf,
    pub tor_bin: PathBuf,
    pub tor_data_dir: Option<PathBuf>,
    pub recover: bool,
    pub verbose: bool,
}

impl Settings {
    /// Merge CLI arguments over file values over defaults
    pub fn resolve(args: &Args, file: FileConfig) -> Self {
        fn pick(cli: &Option<PathBuf>, file: Option<PathBuf>, default: &str) -> PathBuf {
            cli.clone()
                .or(file)
                .unwrap_or_else(|| PathBuf::from(default))
        }

        let namespace = args
            .namespace
            .clone()
            .or(file.namespace)
            .filter(|ns| !ns.trim().is_empty());

        Self {
            namespace,
            docker_socket: pick(&args.docker_socket, file.docker_socket, DEFAULT_DOCKER_SOCKET),
            plugin_dir: pick(&args.plugin_dir, file.plugin_dir, DEFAULT_PLUGIN_DIR),
            runtime_dir: pick(&args.runtime_dir, file.runtime_dir, DEFAULT_RUNTIME_DIR),
            redsocks_bin: pick(&args.redsocks_bin, file.redsocks_bin, DEFAULT_REDSOCKS_BIN),
            tor_bin: pick(&args.tor_bin, file.tor_bin, DEFAULT_TOR_BIN),
            tor_data_dir: args.tor_data_dir.clone().or(file.tor_data_dir),
            recover: !args.no_recover && file.recover.unwrap_or(true),
            verbose: args.verbose || file.verbose.unwrap_or(false),
        }
    }

    /// Parse arguments, reading the settings file they point at
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(args, file))
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            namespace: self.namespace.clone(),
            redsocks_bin: self.redsocks_bin.clone(),
            tor_bin: self.tor_bin.clone(),
            tor_data_dir: self.tor_data_dir.clone(),
            runtime_dir: self.runtime_dir.clone(),
        }
    }
}
