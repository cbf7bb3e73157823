//! Listening socket setup shared by both runtimes.

use crate::config::Endpoint;
use crate::error::ServiceError;
use std::io;
use std::net::{SocketAddr, TcpListener};
use tracing::{error, info};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking TCP listener on `endpoint`.
///
/// `recv_buffer_size` is applied as SO_RCVBUF before binding so accepted
/// sockets inherit it. Any failure is a bind failure and is logged here.
pub fn bind(endpoint: &Endpoint, recv_buffer_size: usize) -> Result<TcpListener, ServiceError> {
    match create_listener(endpoint, recv_buffer_size) {
        Ok(listener) => {
            let local = listener.local_addr().ok();
            info!(
                endpoint = %endpoint,
                addr = ?local,
                recv_buffer_size,
                "Successfully bound listening socket"
            );
            Ok(listener)
        }
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "Failed to bind listening socket");
            Err(ServiceError::Bind {
                endpoint: endpoint.clone(),
                source: e,
            })
        }
    }
}

fn create_listener(endpoint: &Endpoint, recv_buffer_size: usize) -> io::Result<TcpListener> {
    let addr = endpoint.resolve()?;
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(recv_buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
