use std::io::{self, Read, Write};
use std::net::SocketAddr;

use anyhow::Context;
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry};
use tracing::{debug, info, trace, warn};

use crate::http::parser::{RequestParser, RequestPhase, READ_CHUNK};
use crate::proxy::relay::RelayBuffer;
use crate::proxy::upstream::{selector_request, ConnectError, Upstream};
use crate::server::sockets::{Handle, HandleAllocator, SocketRegistry};

/// Phase of a client's round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    Path,
    RequestEnd,
    Connect,
    RequestWrite,
    Read,
    Write,
}

impl From<RequestPhase> for ConnectionState {
    fn from(phase: RequestPhase) -> Self {
        match phase {
            RequestPhase::Start => ConnectionState::Start,
            RequestPhase::Path => ConnectionState::Path,
            RequestPhase::RequestEnd => ConnectionState::RequestEnd,
            RequestPhase::Complete => ConnectionState::Connect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Remote,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Client => Side::Remote,
            Side::Remote => Side::Client,
        }
    }
}

/// What the event loop should do after [`Connection::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Progress was made; the tracked socket may still be ready.
    Continue,
    /// The tracked socket has nothing more to offer until the next event.
    Blocked,
    /// The tracked socket or its interest changed. Readiness seen so far is stale.
    Retargeted,
    /// The round trip is over; remove the connection.
    Closed,
}

/// Shared tables a connection touches while being driven.
pub struct ConnectionContext<'a> {
    pub registry: &'a Registry,
    pub sockets: &'a mut SocketRegistry,
    pub upstream: &'a Upstream,
    pub handles: &'a mut HandleAllocator,
}

#[derive(Debug)]
pub struct Endpoint {
    pub handle: Handle,
    pub stream: TcpStream,
}

enum Io {
    Done(usize),
    Blocked,
    Closed,
    Failed(io::Error),
}

impl From<io::Result<usize>> for Io {
    fn from(result: io::Result<usize>) -> Self {
        match result {
            Ok(0) => Io::Closed,
            Ok(n) => Io::Done(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Io::Blocked,
            Err(e) => Io::Failed(e),
        }
    }
}

/// One client's round trip: request capture, remote fetch, response relay.
///
/// Exactly one of the two sockets is registered with the poller at a time.
/// That one is "active"; its peer is parked until the relay flips direction.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    peer: SocketAddr,
    client: Endpoint,
    remote: Option<Endpoint>,
    active: Side,
    parser: RequestParser,
    request: Option<Bytes>,
    relay: Option<RelayBuffer>,
}

impl Connection {
    pub fn new(handle: Handle, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            state: ConnectionState::Start,
            peer,
            client: Endpoint { handle, stream },
            remote: None,
            active: Side::Client,
            parser: RequestParser::new(),
            request: None,
            relay: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The socket currently registered for readiness.
    pub fn active_handle(&self) -> Handle {
        match (self.active, &self.remote) {
            (Side::Remote, Some(remote)) => remote.handle,
            _ => self.client.handle,
        }
    }

    pub fn remote_handle(&self) -> Option<Handle> {
        self.remote.as_ref().map(|remote| remote.handle)
    }

    fn active_stream(&mut self) -> &mut TcpStream {
        match (self.active, self.remote.as_mut()) {
            (Side::Remote, Some(remote)) => &mut remote.stream,
            _ => &mut self.client.stream,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state changed");
            self.state = next;
        }
    }

    /// Drive the connection as far as its active socket allows.
    ///
    /// Returns `Err` only for faults that must stop the whole gateway.
    pub fn handle(&mut self, cx: &mut ConnectionContext<'_>) -> anyhow::Result<Outcome> {
        match self.state {
            ConnectionState::Start | ConnectionState::Path | ConnectionState::RequestEnd => {
                let outcome = self.read_request();
                if outcome != Outcome::Continue || self.state != ConnectionState::Connect {
                    return Ok(outcome);
                }
                self.connect(cx)
            }
            ConnectionState::Connect => self.connect(cx),
            ConnectionState::RequestWrite => self.write_request(cx),
            ConnectionState::Read => self.read_chunk(cx),
            ConnectionState::Write => self.write_chunk(cx),
        }
    }

    fn read_request(&mut self) -> Outcome {
        let mut chunk = [0u8; READ_CHUNK];
        let limit = self.parser.read_limit();

        match Io::from(self.client.stream.read(&mut chunk[..limit])) {
            Io::Done(n) => {
                let phase = self.parser.feed(&chunk[..n]);
                self.transition(phase.into());
                Outcome::Continue
            }
            Io::Blocked => Outcome::Blocked,
            Io::Closed => {
                debug!(
                    peer = %self.peer,
                    state = ?self.state,
                    "Client closed before request completed"
                );
                Outcome::Closed
            }
            Io::Failed(e) if e.kind() == io::ErrorKind::Interrupted => Outcome::Continue,
            Io::Failed(e) => {
                warn!(peer = %self.peer, error = %e, "Failed to read request");
                Outcome::Closed
            }
        }
    }

    fn connect(&mut self, cx: &mut ConnectionContext<'_>) -> anyhow::Result<Outcome> {
        let selector = self
            .parser
            .take_selector()
            .context("Request completed without a selector")?;

        self.relay = Some(RelayBuffer::new());

        let stream = match cx.upstream.connect() {
            Ok(stream) => stream,
            Err(ConnectError::Resolve(e)) => {
                return Err(e)
                    .with_context(|| format!("Failed to resolve remote {}", cx.upstream));
            }
            Err(e) => {
                warn!(
                    peer = %self.peer,
                    remote = %cx.upstream,
                    error = %e,
                    "Remote connection failed"
                );
                return Ok(Outcome::Closed);
            }
        };

        info!(
            peer = %self.peer,
            remote = %cx.upstream,
            selector = %String::from_utf8_lossy(&selector),
            "Forwarding selector"
        );

        self.remote = Some(Endpoint {
            handle: cx.handles.next(),
            stream,
        });
        self.request = Some(selector_request(&selector));

        let outcome = self.swap_active(cx, Interest::WRITABLE)?;
        if outcome == Outcome::Retargeted {
            self.transition(ConnectionState::RequestWrite);
        }
        // The active socket just changed; its readiness is unknown.
        Ok(outcome)
    }

    fn write_request(&mut self, cx: &mut ConnectionContext<'_>) -> anyhow::Result<Outcome> {
        let Some(mut request) = self.request.take() else {
            anyhow::bail!("Connection {} writing without a request", self.peer);
        };

        let result = self.active_stream().write(&request);
        match Io::from(result) {
            Io::Done(n) => request.advance(n),
            Io::Blocked => {
                self.request = Some(request);
                return Ok(Outcome::Blocked);
            }
            Io::Failed(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.request = Some(request);
                return Ok(Outcome::Continue);
            }
            Io::Closed | Io::Failed(_) => {
                warn!(peer = %self.peer, "Failed to send selector to remote");
                return Ok(Outcome::Closed);
            }
        }

        if request.has_remaining() {
            self.request = Some(request);
            return Ok(Outcome::Continue);
        }

        let handle = self.active_handle();
        if let Err(e) = cx
            .registry
            .reregister(self.active_stream(), handle.into(), Interest::READABLE)
        {
            warn!(peer = %self.peer, error = %e, "Failed to watch remote for reading");
            return Ok(Outcome::Closed);
        }
        cx.sockets
            .change_interest(handle, Interest::READABLE)
            .with_context(|| format!("Socket {handle} is not in the socket table"))?;

        self.transition(ConnectionState::Read);
        Ok(Outcome::Retargeted)
    }

    fn read_chunk(&mut self, cx: &mut ConnectionContext<'_>) -> anyhow::Result<Outcome> {
        let Some(mut relay) = self.relay.take() else {
            anyhow::bail!("Connection {} relaying without a buffer", self.peer);
        };

        let result = relay.fill_from(self.active_stream());
        self.relay = Some(relay);

        match Io::from(result) {
            Io::Done(n) => {
                trace!(peer = %self.peer, from = ?self.active, bytes = n, "Read chunk");
            }
            Io::Blocked => return Ok(Outcome::Blocked),
            Io::Closed => {
                debug!(peer = %self.peer, from = ?self.active, "Peer finished sending");
                return Ok(Outcome::Closed);
            }
            Io::Failed(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Outcome::Continue);
            }
            Io::Failed(e) => {
                warn!(peer = %self.peer, from = ?self.active, error = %e, "Relay read failed");
                return Ok(Outcome::Closed);
            }
        }

        let outcome = self.swap_active(cx, Interest::WRITABLE)?;
        if outcome == Outcome::Retargeted {
            self.transition(ConnectionState::Write);
        }
        Ok(outcome)
    }

    fn write_chunk(&mut self, cx: &mut ConnectionContext<'_>) -> anyhow::Result<Outcome> {
        let Some(mut relay) = self.relay.take() else {
            anyhow::bail!("Connection {} relaying without a buffer", self.peer);
        };

        let result = relay.drain_into(self.active_stream());
        let drained = relay.is_drained();
        self.relay = Some(relay);

        match result {
            Ok(n) => trace!(peer = %self.peer, to = ?self.active, bytes = n, "Wrote chunk"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Outcome::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Outcome::Continue),
            Err(e) => {
                warn!(peer = %self.peer, to = ?self.active, error = %e, "Relay write failed");
                return Ok(Outcome::Closed);
            }
        }

        if !drained {
            return Ok(Outcome::Continue);
        }

        let outcome = self.swap_active(cx, Interest::READABLE)?;
        if outcome == Outcome::Retargeted {
            self.transition(ConnectionState::Read);
        }
        Ok(outcome)
    }

    /// Park the active socket and watch its peer for `interest`.
    ///
    /// Poller failures end this connection only. A socket table that does not
    /// know the active handle is a bookkeeping fault and returns `Err`.
    fn swap_active(
        &mut self,
        cx: &mut ConnectionContext<'_>,
        interest: Interest,
    ) -> anyhow::Result<Outcome> {
        let Some(remote) = self.remote.as_mut() else {
            anyhow::bail!("Connection {} has no remote socket to switch to", self.peer);
        };
        let (old, new) = match self.active {
            Side::Client => (&mut self.client, remote),
            Side::Remote => (remote, &mut self.client),
        };

        if let Err(e) = cx.registry.deregister(&mut old.stream) {
            warn!(peer = %self.peer, error = %e, "Failed to park socket");
            return Ok(Outcome::Closed);
        }
        if let Err(e) = cx
            .registry
            .register(&mut new.stream, new.handle.into(), interest)
        {
            // Re-arm the old socket so teardown deregisters what is registered.
            if let Err(e) = cx
                .registry
                .register(&mut old.stream, old.handle.into(), Interest::READABLE)
            {
                debug!(
                    peer = %self.peer,
                    handle = %old.handle,
                    error = %e,
                    "Re-arming parked socket failed"
                );
            }
            warn!(peer = %self.peer, error = %e, "Failed to watch peer socket");
            return Ok(Outcome::Closed);
        }

        let (old_handle, new_handle) = (old.handle, new.handle);
        cx.sockets
            .change(old_handle, new_handle, interest)
            .with_context(|| format!("Socket {old_handle} is not in the socket table"))?;

        self.active = self.active.other();
        Ok(Outcome::Retargeted)
    }

    /// Stop watching the active socket. Both sockets close when `self` drops.
    pub fn close(mut self, registry: &Registry) {
        let handle = self.active_handle();
        if let Err(e) = registry.deregister(self.active_stream()) {
            debug!(peer = %self.peer, handle = %handle, error = %e, "Deregister on close failed");
        }
        debug!(peer = %self.peer, state = ?self.state, "Connection closed");
    }
}
