// Local TCP port allocation

use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Find a TCP port that is currently free on the loopback interface.
///
/// The port is released before returning, so another process may grab it
/// in between. The helpers we launch bind it a few milliseconds later.
pub fn find_available_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    log::trace!("Allocated ephemeral port {}", port);
    Ok(port)
}
