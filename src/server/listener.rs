use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Context;
use mio::net::TcpListener;
use mio::{Interest, Registry};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::server::sockets::{Handle, HandleAllocator, SocketRegistry};

/// Pending accepts queued per listener.
const BACKLOG: i32 = 1;

/// A bound listening socket and the handle it is watched under.
#[derive(Debug)]
pub struct Listener {
    pub handle: Handle,
    pub socket: TcpListener,
    pub addr: SocketAddr,
}

/// Local addresses to listen on for `config`.
///
/// Without an explicit bind host this is the IPv4 and IPv6 wildcard address.
pub fn local_addresses(config: &ServerConfig) -> anyhow::Result<Vec<SocketAddr>> {
    match &config.bind {
        Some(host) => {
            let addrs: Vec<SocketAddr> = (host.as_str(), config.listen_port)
                .to_socket_addrs()
                .with_context(|| format!("Failed to resolve bind address {host}"))?
                .collect();
            if addrs.is_empty() {
                anyhow::bail!("Bind address {host} resolved to nothing");
            }
            Ok(addrs)
        }
        None => Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.listen_port)),
        ]),
    }
}

/// Create a non-blocking listening socket on `addr`.
///
/// IPv6 sockets are IPv6-only so both families can share a port.
pub fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Bind every local address and watch each listener for incoming clients.
///
/// Listeners are added to `sockets` before anything else, which keeps them in
/// the table's fixed prefix.
pub fn setup(
    config: &ServerConfig,
    registry: &Registry,
    sockets: &mut SocketRegistry,
    handles: &mut HandleAllocator,
) -> anyhow::Result<Vec<Listener>> {
    let wildcard = config.bind.is_none();
    let mut listeners: Vec<Listener> = Vec::new();

    for mut addr in local_addresses(config)? {
        // An ephemeral wildcard port is picked once and shared by both families.
        if wildcard && config.listen_port == 0 {
            if let Some(first) = listeners.first() {
                addr.set_port(first.addr.port());
            }
        }

        let std_listener = match bind(addr) {
            Ok(listener) => listener,
            // No configured interface for this family.
            Err(e) if wildcard && addr.is_ipv6() && is_family_unavailable(&e) => {
                warn!(address = %addr, error = %e, "Skipping unavailable address family");
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to listen on {addr}")),
        };

        let addr = std_listener.local_addr().unwrap_or(addr);
        let mut socket = TcpListener::from_std(std_listener);
        let handle = handles.next();

        registry
            .register(&mut socket, handle.into(), Interest::READABLE)
            .with_context(|| format!("Failed to watch listener on {addr}"))?;
        sockets.add(handle, Interest::READABLE);

        info!(address = %addr, "Listening");
        listeners.push(Listener {
            handle,
            socket,
            addr,
        });
    }

    if listeners.is_empty() {
        anyhow::bail!("No address to listen on for port {}", config.listen_port);
    }

    sockets.seal_interfaces();
    Ok(listeners)
}

fn is_family_unavailable(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) {
        return true;
    }

    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::EAFNOSUPPORT) {
        return true;
    }

    false
}
