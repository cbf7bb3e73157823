//! Connection state machine for the readiness-driven runtime.
//!
//! Each connection alternates between reading one buffer and writing it
//! back transformed. Only one operation is ever outstanding per connection:
//! the mode decides which readiness event is acted on, and the buffer is
//! never read into while it still holds unwritten bytes.

use crate::completion::{self, ReadOutcome};
use crate::runtime::buffer::Buffer;
use crate::transform::flip_case;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Current mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Waiting for bytes from the peer.
    Reading,
    /// Draining the transformed buffer back to the peer.
    Writing,
}

impl Mode {
    /// Name of the operation this mode issues, for logging.
    pub fn op(self) -> &'static str {
        match self {
            Mode::Reading => "read",
            Mode::Writing => "write",
        }
    }
}

/// What the event loop must arm next for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Read,
    Write,
    /// The peer disconnected; release the connection.
    Close,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    mode: Mode,
    buffer: Buffer,
}

impl<S> Connection<S> {
    /// Create a new connection in initial reading mode.
    pub fn new(stream: S, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            mode: Mode::Reading,
            buffer: Buffer::new(buffer_size),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Apply the result of a read issued in `Reading` mode.
    ///
    /// Data is transformed in place and the connection switches to writing.
    /// An empty read keeps the connection reading without any write.
    pub fn complete_read(&mut self, outcome: ReadOutcome) -> Step {
        debug_assert_eq!(self.mode, Mode::Reading);
        match outcome {
            ReadOutcome::Closed => Step::Close,
            ReadOutcome::Empty => Step::Read,
            ReadOutcome::Data(n) => {
                self.buffer.fill(n);
                flip_case(self.buffer.valid_mut());
                self.mode = Mode::Writing;
                Step::Write
            }
        }
    }

    /// Apply the result of a write of `n` bytes issued in `Writing` mode.
    ///
    /// Stays in writing until every valid byte has been written, then clears
    /// the buffer and switches back to reading.
    pub fn complete_write(&mut self, n: usize) -> Step {
        debug_assert_eq!(self.mode, Mode::Writing);
        self.buffer.advance(n);
        if self.buffer.has_pending() {
            return Step::Write;
        }
        self.buffer.clear();
        self.mode = Mode::Reading;
        Step::Read
    }
}

impl<S: Read + Write> Connection<S> {
    /// Handle a readable event: issue one read and apply its result.
    pub fn on_readable(&mut self) -> io::Result<Step> {
        if self.mode != Mode::Reading {
            return Ok(Step::Write);
        }
        let outcome = completion::read_nonblocking(&mut self.stream, self.buffer.spare_mut())?;
        Ok(self.complete_read(outcome))
    }

    /// Handle a writable event: write the remainder until drained or the socket is full.
    pub fn on_writable(&mut self) -> io::Result<Step> {
        if self.mode != Mode::Writing {
            return Ok(Step::Read);
        }
        loop {
            let n = completion::write_nonblocking(&mut self.stream, self.buffer.pending())?;
            if n == 0 {
                return Ok(Step::Write);
            }
            match self.complete_write(n) {
                Step::Write => continue,
                step => return Ok(step),
            }
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
