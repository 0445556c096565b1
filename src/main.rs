mod backends;
mod config;
mod docker;
mod driver;
mod error;
mod network;
mod plugin;
mod port;
mod proxy;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::backends::bridge::LinuxBridge;
use crate::backends::interfaces::HostInterfaces;
use crate::backends::iptables::{IptablesCommand, PacketFilter};
use crate::config::{Args, Settings};
use crate::docker::DockerClient;
use crate::driver::Driver;

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // RUST_LOG still wins when set
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Replay creation for networks that existed before this process started
async fn recover_networks(driver: &Arc<Driver>, client: &DockerClient) {
    let networks = match client.list_networks().await {
        Ok(networks) => networks,
        Err(e) => {
            log::error!(
                "Could not list networks from {:?}, skipping recovery: {:#}",
                client.socket(),
                e
            );
            return;
        }
    };

    let driver = driver.clone();
    match tokio::task::spawn_blocking(move || driver.recover(&networks)).await {
        Ok(count) => log::info!("Recovered {} network(s)", count),
        Err(e) => log::error!("Recovery aborted: {}", e),
    }
}

async fn wait_for_termination() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    tokio::select! {
        _ = terminate.recv() => log::info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to watch SIGINT")?;
            log::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::from_args(&args)?;
    init_logging(settings.verbose);

    let filter = IptablesCommand::new();
    if !filter.is_available() {
        log::warn!("iptables not found in PATH, rule programming will fail");
    }
    if !LinuxBridge::is_available() {
        log::warn!("ip (iproute2) not found in PATH, bridge operations will fail");
    }
    let filter: Arc<dyn PacketFilter> = Arc::new(filter);

    let bridge = LinuxBridge::new(filter.clone());
    bridge.enable_ip_forwarding()?;

    let driver_settings = settings.driver_settings();
    let driver = tokio::task::spawn_blocking(move || {
        Driver::new(
            driver_settings,
            filter,
            Arc::new(bridge),
            Arc::new(HostInterfaces),
        )
    })
    .await
    .context("Driver initialization panicked")?
    .context("Failed to initialize the driver")?;
    let driver = Arc::new(driver);

    if settings.recover {
        recover_networks(&driver, &DockerClient::new(&settings.docker_socket)).await;
    } else {
        log::info!("Recovery disabled");
    }

    let socket = plugin::socket_path(&settings.plugin_dir, driver.name());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = {
        let driver = driver.clone();
        let socket = socket.clone();
        tokio::spawn(async move { plugin::serve(driver, &socket, shutdown_rx).await })
    };

    // The server only returns on its own when it failed to start
    let (outcome, server_done) = tokio::select! {
        waited = wait_for_termination() => (waited, false),
        served = &mut server => {
            let served = served.context("Plugin server panicked").and_then(|r| r);
            (served, true)
        }
    };

    let _ = shutdown_tx.send(true);
    if !server_done {
        match server.await {
            Ok(Err(e)) => log::warn!("Plugin server stopped with an error: {:#}", e),
            Err(e) => log::warn!("Plugin server panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }

    let shutdown_driver = driver.clone();
    match tokio::task::spawn_blocking(move || shutdown_driver.shut_down()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Shutdown finished with errors: {}", e),
        Err(e) => log::error!("Shutdown panicked: {}", e),
    }

    if socket.exists() {
        if let Err(e) = std::fs::remove_file(&socket) {
            log::warn!("Failed to remove socket {:?}: {}", socket, e);
        }
    }

    log::info!("Driver {} stopped", driver.name());
    outcome
}
