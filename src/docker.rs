// Minimal Docker engine client
//
// Only what recovery needs: list networks over the engine's Unix socket.

use crate::plugin::api::null_as_default;
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamConfig {
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub auxiliary_addresses: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ipam {
    #[serde(default)]
    pub driver: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: Vec<IpamConfig>,
}

/// A network as reported by `GET /networks`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkResource {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: String,
    #[serde(rename = "EnableIPv6", default)]
    pub enable_ipv6: bool,
    #[serde(rename = "IPAM", default, deserialize_with = "null_as_default")]
    pub ipam: Ipam,
    #[serde(rename = "Options", default, deserialize_with = "null_as_default")]
    pub options: HashMap<String, String>,
}

pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// List every network the engine knows about
    pub async fn list_networks(&self) -> Result<Vec<NetworkResource>> {
        let body = self.get("/networks").await?;
        serde_json::from_slice(&body).context("Failed to decode network list")
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to {:?}", self.socket))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake with the engine failed")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("Engine connection ended: {}", e);
            }
        });

        let request = Request::get(path)
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .context("Failed to build engine request")?;

        let response = sender
            .send_request(request)
            .await
            .with_context(|| format!("GET {} failed", path))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .context("Failed to read engine response")?
            .to_bytes();

        if !status.is_success() {
            return Err(anyhow!(
                "GET {} returned {}: {}",
                path,
                status,
                String::from_utf8_lossy(&body).trim()
            ));
        }

        Ok(body)
    }
}
