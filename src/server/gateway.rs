use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::{ConnectionContext, Outcome};
use crate::proxy::upstream::Upstream;
use crate::server::connections::ConnectionRegistry;
use crate::server::listener::{self, Listener};
use crate::server::sockets::{Handle, HandleAllocator, SocketRegistry};

/// Token of the waker used to stop the loop.
const SHUTDOWN: Token = Token(0);

const EVENT_CAPACITY: usize = 256;

/// Stops a running [`Gateway`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn trigger(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// The single-threaded event loop and every table it owns.
///
/// All mutation of the socket and connection tables happens on the thread
/// calling [`Gateway::run`].
#[derive(Debug)]
pub struct Gateway {
    poll: Poll,
    events: Events,
    sockets: SocketRegistry,
    connections: ConnectionRegistry,
    listeners: Vec<Listener>,
    upstream: Upstream,
    handles: HandleAllocator,
    waker: Arc<Waker>,
}

impl Gateway {
    /// Resolve the remote, bind every listener and prepare the poller.
    pub fn bind(config: &Config) -> anyhow::Result<Self> {
        let poll = Poll::new().context("Failed to create poller")?;
        let waker = Arc::new(
            Waker::new(poll.registry(), SHUTDOWN).context("Failed to create shutdown waker")?,
        );

        let upstream = Upstream::from_config(&config.remote);
        let remote_addrs = upstream
            .resolve()
            .with_context(|| format!("Failed to resolve remote {upstream}"))?;
        info!(
            remote = upstream.host(),
            port = upstream.port(),
            addresses = remote_addrs.len(),
            "Relaying to Gopher server"
        );

        let mut sockets = SocketRegistry::new();
        let mut handles = HandleAllocator::after(SHUTDOWN);
        let listeners =
            listener::setup(&config.server, poll.registry(), &mut sockets, &mut handles)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            sockets,
            connections: ConnectionRegistry::new(),
            listeners,
            upstream,
            handles,
            waker,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Addresses the listeners are bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|listener| listener.addr).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until shut down or a fatal fault occurs.
    ///
    /// Connecting to the remote happens inline, so a slow lookup or handshake
    /// stalls every other connection for its duration.
    pub fn run(&mut self) -> anyhow::Result<()> {
        while self.turn(None)? {}
        Ok(())
    }

    /// Wait up to `timeout` for readiness, then serve what arrived once.
    ///
    /// Returns `false` once shut down, after every connection is closed.
    pub fn turn(&mut self, timeout: Option<Duration>) -> anyhow::Result<bool> {
        // Readiness not yet consumed is served without blocking.
        let timeout = if self.sockets.has_pending() {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(e).context("Failed to wait for socket readiness");
        }

        let mut shutdown = false;
        for event in self.events.iter() {
            if event.token() == SHUTDOWN {
                shutdown = true;
            } else if let Some(readiness) = self.sockets.readiness_mut(event.token().into()) {
                readiness.merge_event(event);
            }
        }

        if shutdown {
            info!(connections = self.connections.len(), "Shutting down");
            self.connections.clear(&mut self.sockets, self.poll.registry())?;
            return Ok(false);
        }

        self.dispatch()?;
        Ok(true)
    }

    /// Serve every ready socket once, in table order.
    fn dispatch(&mut self) -> anyhow::Result<()> {
        let mut index = 0;

        while let Some(entry) = self.sockets.get(index).copied() {
            if !entry.readiness.matches(entry.interest) {
                index += 1;
                continue;
            }

            if self.sockets.is_interface(index) {
                self.accept(entry.handle)?;
                index += 1;
                continue;
            }

            let conn_index = self.connections.index_of(entry.handle).with_context(|| {
                format!("Socket {} does not correspond to any connection", entry.handle)
            })?;

            if entry.readiness.hangup {
                if let Some(connection) = self.connections.get(conn_index) {
                    debug!(peer = %connection.peer(), handle = %entry.handle, "Socket hung up");
                }
                // The slot now holds another entry; look at it next.
                self.connections
                    .remove(conn_index, &mut self.sockets, self.poll.registry())?;
                continue;
            }

            let Some(connection) = self.connections.get_mut(conn_index) else {
                anyhow::bail!("Connection index {conn_index} out of range");
            };
            let mut cx = ConnectionContext {
                registry: self.poll.registry(),
                sockets: &mut self.sockets,
                upstream: &self.upstream,
                handles: &mut self.handles,
            };

            match connection.handle(&mut cx)? {
                Outcome::Continue | Outcome::Retargeted => index += 1,
                Outcome::Blocked => {
                    self.sockets.clear_readiness(entry.handle);
                    index += 1;
                }
                Outcome::Closed => {
                    self.connections
                        .remove(conn_index, &mut self.sockets, self.poll.registry())?;
                }
            }
        }

        Ok(())
    }

    /// Accept one client from the listener watched under `handle`.
    fn accept(&mut self, handle: Handle) -> anyhow::Result<()> {
        let listener = self
            .listeners
            .iter()
            .find(|listener| listener.handle == handle)
            .with_context(|| format!("Socket {handle} is not a listener"))?;

        match listener.socket.accept() {
            Ok((stream, peer)) => {
                let client = self.handles.next();
                match self.connections.add(
                    client,
                    stream,
                    peer,
                    self.poll.registry(),
                    &mut self.sockets,
                ) {
                    Ok(()) => info!(peer = %peer, handle = %client, "Accepted connection"),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Failed to watch accepted connection")
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.sockets.clear_readiness(handle);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                // Wait for the next connection attempt instead of spinning.
                warn!(listener = %listener.addr, error = %e, "Accept failed");
                self.sockets.clear_readiness(handle);
            }
        }

        Ok(())
    }
}
