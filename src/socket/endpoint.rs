//! Creating listening and connecting sockets

use std::net::SocketAddr;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listening socket. IPv6 addresses are bound dual-stack so that the unspecified address
///  `[::]` accepts IPv4 peers as well.
pub fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("listening on {:?}", listener.local_addr()?);
    Ok(listener)
}

pub async fn connect(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    debug!("connecting to {:?}", addr);
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
