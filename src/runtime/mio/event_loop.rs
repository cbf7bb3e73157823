//! mio worker event loop.
//!
//! Readiness-based model: poll tells us when a socket is ready, then the
//! connection's state machine performs one non-blocking syscall and says
//! what to wait for next. Interest is only re-registered when the mode
//! changes, so each connection has exactly one operation armed at a time.

use super::{Lifecycle, WAKER_TOKEN};
use crate::completion::is_disconnect;
use crate::runtime::{Connection, ConnectionRegistry, Mode, Step};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Sending side of a worker's inbox, held by the acceptor.
pub(super) struct WorkerLink {
    sender: Sender<(TcpStream, SocketAddr)>,
    waker: Arc<Waker>,
}

impl WorkerLink {
    /// Hand an accepted stream to the worker and wake it.
    ///
    /// Gives the stream back if the worker has exited.
    pub(super) fn send(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), (TcpStream, SocketAddr)> {
        self.sender.send((stream, peer)).map_err(|e| e.0)?;
        if let Err(e) = self.waker.wake() {
            error!(peer = %peer, error = %e, "Failed to wake worker");
        }
        Ok(())
    }

    pub(super) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

/// One worker thread's poll instance and the connections it owns.
pub(super) struct Worker {
    id: usize,
    poll: Poll,
    inbox: Receiver<(TcpStream, SocketAddr)>,
    connections: ConnectionRegistry<TcpStream>,
    buffer_size: usize,
    lifecycle: Arc<Lifecycle>,
}

impl Worker {
    pub(super) fn new(
        id: usize,
        max_connections: usize,
        buffer_size: usize,
        lifecycle: Arc<Lifecycle>,
    ) -> io::Result<(Self, WorkerLink)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (sender, inbox) = mpsc::channel();

        let worker = Self {
            id,
            poll,
            inbox,
            connections: ConnectionRegistry::new(max_connections),
            buffer_size,
            lifecycle,
        };
        Ok((worker, WorkerLink { sender, waker }))
    }

    /// Run the event loop until shutdown, then close every connection.
    pub(super) fn run(mut self) {
        info!(worker = self.id, "Worker started");
        if let Err(e) = self.event_loop() {
            error!(worker = self.id, error = %e, "Worker failed");
        }
        self.close_all();
        info!(worker = self.id, "Worker stopped");
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while self.lifecycle.is_running() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => self.register_new(),
                    Token(conn_id) => self.drive(conn_id, event),
                }
            }
        }
        Ok(())
    }

    /// Take ownership of streams the acceptor handed over.
    fn register_new(&mut self) {
        while let Ok((mut stream, peer)) = self.inbox.try_recv() {
            if !self.lifecycle.is_running() {
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(worker = self.id, peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let conn = Connection::new(stream, peer, self.buffer_size);
            let conn_id = match self.connections.insert(conn) {
                Ok(id) => id,
                Err(_) => {
                    warn!(worker = self.id, peer = %peer, "Connection limit reached, closing");
                    continue;
                }
            };

            let registered = match self.connections.get_mut(conn_id) {
                Some(conn) => self.poll.registry().register(
                    conn.stream_mut(),
                    Token(conn_id),
                    Interest::READABLE,
                ),
                None => continue,
            };
            if let Err(e) = registered {
                error!(worker = self.id, peer = %peer, error = %e, "Failed to register connection");
                self.close(conn_id);
                continue;
            }

            debug!(
                worker = self.id,
                conn_id,
                peer = %peer,
                active = self.connections.len(),
                "Registered connection"
            );
        }
    }

    /// Dispatch a readiness event to the connection's current mode.
    fn drive(&mut self, conn_id: usize, event: &Event) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            debug!(worker = self.id, conn_id, "Event for closed connection");
            return;
        };

        let peer = conn.peer();
        let before = conn.mode();
        let result = match before {
            Mode::Reading => conn.on_readable(),
            Mode::Writing => conn.on_writable(),
        };

        match result {
            Ok(Step::Close) => {
                info!(worker = self.id, conn_id, peer = %peer, "Client disconnected");
                self.close(conn_id);
            }
            Ok(step) => {
                if conn.mode() == before {
                    return;
                }
                let interest = match step {
                    Step::Write => Interest::WRITABLE,
                    _ => Interest::READABLE,
                };
                let rearmed =
                    self.poll
                        .registry()
                        .reregister(conn.stream_mut(), Token(conn_id), interest);
                if let Err(e) = rearmed {
                    error!(worker = self.id, conn_id, peer = %peer, error = %e, "Failed to re-arm connection");
                    self.close(conn_id);
                }
            }
            Err(e) if is_disconnect(&e) => {
                info!(
                    worker = self.id,
                    conn_id,
                    peer = %peer,
                    op = before.op(),
                    error = %e,
                    "Client disconnected"
                );
                self.close(conn_id);
            }
            Err(e) => {
                error!(
                    worker = self.id,
                    conn_id,
                    peer = %peer,
                    op = before.op(),
                    error = %e,
                    readable = event.is_readable(),
                    writable = event.is_writable(),
                    "I/O failure"
                );
                self.close(conn_id);
            }
        }
    }

    fn close(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(worker = self.id, conn_id, peer = %conn.peer(), "Connection closed");
        }
    }

    fn close_all(&mut self) {
        let registry = self.poll.registry();
        for mut conn in self.connections.drain() {
            let _ = registry.deregister(conn.stream_mut());
            warn!(worker = self.id, peer = %conn.peer(), "Connection cancelled by shutdown");
        }
        // Streams handed over after the last wakeup are closed unserved.
        while self.inbox.try_recv().is_ok() {}
    }
}
