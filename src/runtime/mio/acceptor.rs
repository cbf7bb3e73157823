//! Accept loop for the mio runtime.

use super::event_loop::WorkerLink;
use super::{Lifecycle, WAKER_TOKEN};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Owns the listening socket and distributes accepted streams to workers.
pub(super) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    workers: Vec<WorkerLink>,
    next: usize,
    lifecycle: Arc<Lifecycle>,
}

impl Acceptor {
    pub(super) fn new(
        mut listener: TcpListener,
        workers: Vec<WorkerLink>,
        lifecycle: Arc<Lifecycle>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            waker,
            workers,
            next: 0,
            lifecycle,
        })
    }

    pub(super) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Accept until the listener is closed. The socket is released on return.
    pub(super) fn run(mut self) {
        let addr = self.listener.local_addr().ok();
        if let Err(e) = self.accept_loop() {
            error!(error = %e, "Accept loop failed");
        }
        info!(addr = ?addr, "Listener closed");
    }

    fn accept_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(128);

        while self.lifecycle.is_accepting() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let ready = events.iter().any(|event| event.token() == LISTENER_TOKEN);
            if ready {
                self.accept_connections();
            }
        }
        Ok(())
    }

    /// Drain the accept queue until it would block.
    fn accept_connections(&mut self) {
        while self.lifecycle.is_accepting() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted connection");
                    self.dispatch(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(error = %e, "Failed to accept connection");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    /// Hand a stream to the next worker, round-robin.
    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        let worker = self.next;
        self.next = (self.next + 1) % self.workers.len();
        if self.workers[worker].send(stream, peer).is_err() {
            warn!(worker, peer = %peer, "Worker has exited, closing connection");
        }
    }
}
