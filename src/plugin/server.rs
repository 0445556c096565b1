// Plugin socket server
//
// Every request is a POST whose path names the operation. Driver calls
// block on iptables and process management, so they run on the blocking
// pool rather than on the reactor.

use super::api;
use crate::driver::Driver;
use crate::error::{DriverError, Result as DriverResult};
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

/// Body of operations that return nothing
#[derive(Serialize)]
struct EmptyResponse {}

fn empty(_: ()) -> EmptyResponse {
    EmptyResponse {}
}

fn encode<T: Serialize>(status: StatusCode, value: &T) -> (StatusCode, String) {
    match serde_json::to_string(value) {
        Ok(body) => (status, body),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &format!("encoding failed: {}", e)),
    }
}

fn failure(status: StatusCode, message: &str) -> (StatusCode, String) {
    let body = serde_json::json!({ "Err": message }).to_string();
    (status, body)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> DriverResult<T> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| DriverError::InvalidRequest(e.to_string()))
}

/// Decode the request, run the operation, encode the reply
fn call<Req, Resp>(
    operation: &str,
    body: &[u8],
    f: impl FnOnce(&Req) -> DriverResult<Resp>,
) -> (StatusCode, String)
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    match decode(body).and_then(|request| f(&request)) {
        Ok(response) => encode(StatusCode::OK, &response),
        Err(e) => {
            log::error!("{} failed: {}", operation, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Route one plugin call to the driver
pub fn dispatch(driver: &Driver, path: &str, body: &[u8]) -> (StatusCode, String) {
    let operation = path.trim_start_matches('/');
    log::trace!("{} {}", operation, String::from_utf8_lossy(body));

    match operation {
        "Plugin.Activate" => encode(
            StatusCode::OK,
            &api::ActivateResponse {
                implements: vec!["NetworkDriver".to_string()],
            },
        ),
        "NetworkDriver.GetCapabilities" => encode(StatusCode::OK, &driver.get_capabilities()),
        "NetworkDriver.CreateNetwork" => call(operation, body, |r| driver.create_network(r).map(empty)),
        "NetworkDriver.AllocateNetwork" => call(operation, body, |r| driver.allocate_network(r)),
        "NetworkDriver.DeleteNetwork" => call(operation, body, |r| driver.delete_network(r).map(empty)),
        "NetworkDriver.FreeNetwork" => call(operation, body, |r| driver.free_network(r).map(empty)),
        "NetworkDriver.CreateEndpoint" => call(operation, body, |r| driver.create_endpoint(r)),
        "NetworkDriver.DeleteEndpoint" => {
            call(operation, body, |r| driver.delete_endpoint(r).map(empty))
        }
        "NetworkDriver.EndpointOperInfo" => call(operation, body, |r| driver.endpoint_info(r)),
        "NetworkDriver.Join" => call(operation, body, |r| driver.join(r)),
        "NetworkDriver.Leave" => call(operation, body, |r| driver.leave(r).map(empty)),
        "NetworkDriver.DiscoverNew" => call(operation, body, |r| driver.discover_new(r).map(empty)),
        "NetworkDriver.DiscoverDelete" => {
            call(operation, body, |r| driver.discover_delete(r).map(empty))
        }
        "NetworkDriver.ProgramExternalConnectivity" => call(operation, body, |r| {
            driver.program_external_connectivity(r).map(empty)
        }),
        "NetworkDriver.RevokeExternalConnectivity" => call(operation, body, |r| {
            driver.revoke_external_connectivity(r).map(empty)
        }),
        _ => {
            log::warn!("Unknown plugin call {}", path);
            failure(StatusCode::NOT_FOUND, &format!("unknown operation {}", path))
        }
    }
}

async fn handle(req: Request<Incoming>, driver: Arc<Driver>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();

    let (status, body) = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let call_path = path.clone();
            match tokio::task::spawn_blocking(move || dispatch(&driver, &call_path, &bytes)).await {
                Ok(reply) => reply,
                Err(e) => {
                    log::error!("{} handler panicked: {}", path, e);
                    failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                }
            }
        }
        Err(e) => failure(StatusCode::BAD_REQUEST, &format!("failed to read body: {}", e)),
    };

    log::debug!("{} -> {}", path, status);

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(api::PLUGIN_CONTENT_TYPE),
    );
    Ok(response)
}

fn spawn_connection(stream: UnixStream, driver: Arc<Driver>) {
    tokio::spawn(async move {
        let service = service_fn(move |req| handle(req, driver.clone()));
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            log::debug!("Plugin connection ended: {}", e);
        }
    });
}

/// Plugin socket location for a driver name
pub fn socket_path(plugin_dir: &Path, driver_name: &str) -> PathBuf {
    plugin_dir.join(format!("{}.sock", driver_name))
}

/// Serve plugin calls until `shutdown` flips to true
///
/// A stale socket is replaced; the socket is removed on return.
pub async fn serve(
    driver: Arc<Driver>,
    socket: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    if socket.exists() {
        log::debug!("Removing stale socket {:?}", socket);
        fs::remove_file(socket).with_context(|| format!("Failed to remove {:?}", socket))?;
    }

    let listener =
        UnixListener::bind(socket).with_context(|| format!("Failed to bind {:?}", socket))?;
    log::info!("Driver {} listening on {:?}", driver.name(), socket);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => spawn_connection(stream, driver.clone()),
                Err(e) => log::warn!("Failed to accept plugin connection: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    log::info!("Plugin server stopping");
                    break;
                }
            }
        }
    }

    if let Err(e) = fs::remove_file(socket) {
        log::warn!("Failed to remove socket {:?}: {}", socket, e);
    }
    Ok(())
}
