// Docker remote network driver protocol: JSON payloads and the socket server

pub mod api;
pub mod server;

pub use server::{dispatch, serve, socket_path};

/// Default directory Docker scans for plugin sockets
pub const DEFAULT_PLUGIN_DIR: &str = "/run/docker/plugins";
