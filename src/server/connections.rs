//! Table of in-flight connections, looked up by their active socket.

use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use mio::net::TcpStream;
use mio::{Interest, Registry};

use crate::http::connection::Connection;
use crate::server::sockets::{Handle, SocketRegistry};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted client and watch it for its request.
    ///
    /// On failure nothing is recorded and the stream is dropped.
    pub fn add(
        &mut self,
        handle: Handle,
        mut stream: TcpStream,
        peer: SocketAddr,
        registry: &Registry,
        sockets: &mut SocketRegistry,
    ) -> io::Result<()> {
        registry.register(&mut stream, handle.into(), Interest::READABLE)?;
        sockets.add(handle, Interest::READABLE);
        self.connections.push(Connection::new(handle, stream, peer));
        Ok(())
    }

    /// Tear down the connection at `index`: drop its socket table entry,
    /// close both sockets and free its buffers. The last connection takes
    /// the freed slot.
    ///
    /// A connection whose active socket is missing from the socket table is
    /// a bookkeeping fault and is reported as an error.
    pub fn remove(
        &mut self,
        index: usize,
        sockets: &mut SocketRegistry,
        registry: &Registry,
    ) -> anyhow::Result<()> {
        let handle = self
            .connections
            .get(index)
            .with_context(|| format!("No connection at index {index}"))?
            .active_handle();

        sockets
            .remove(handle)
            .with_context(|| format!("Socket {handle} to remove is not in the socket table"))?;

        self.connections.swap_remove(index).close(registry);
        Ok(())
    }

    pub fn index_of(&self, active: Handle) -> Option<usize> {
        self.connections
            .iter()
            .position(|connection| connection.active_handle() == active)
    }

    pub fn get(&self, index: usize) -> Option<&Connection> {
        self.connections.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.connections.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection.
    pub fn clear(
        &mut self,
        sockets: &mut SocketRegistry,
        registry: &Registry,
    ) -> anyhow::Result<()> {
        while !self.connections.is_empty() {
            self.remove(self.connections.len() - 1, sockets, registry)?;
        }
        Ok(())
    }
}
