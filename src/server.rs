//! TCP server for the channel-pipeline connection model.
//!
//! Accepts connections on the tokio runtime and hands each one to its own
//! reader/writer pipeline. Acceptance never waits on a connection: every
//! connection runs as a separate task tracked in a `JoinSet`.

use crate::completion;
use crate::config::Config;
use crate::error::ServiceError;
use crate::listener;
use crate::pipeline::{self, Exit, PipelineSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Cloneable control handle for a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    stop_accepting: Arc<watch::Sender<bool>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    fn new() -> Self {
        let (stop_accepting, _) = watch::channel(false);
        let (cancel, _) = watch::channel(false);
        Self {
            stop_accepting: Arc::new(stop_accepting),
            cancel: Arc::new(cancel),
        }
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Connections that were already accepted keep being served.
    pub fn close_listener(&self) {
        self.stop_accepting.send_replace(true);
    }

    /// Close the listening socket and cancel every connection.
    pub fn shutdown(&self) {
        self.close_listener();
        self.cancel.send_replace(true);
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: PipelineSettings,
    connection_limit: Arc<Semaphore>,
    handle: ServerHandle,
}

impl Server {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub async fn bind(config: &Config) -> Result<Self, ServiceError> {
        let std_listener = listener::bind(&config.endpoint(), config.recv_buffer_size)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        Ok(Server {
            listener,
            local_addr,
            settings: PipelineSettings {
                read_chunk_size: config.read_chunk_size,
                channel_capacity: config.channel_capacity,
            },
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            handle: ServerHandle::new(),
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept connections until the listener is closed, then wait for the
    /// remaining connections to finish.
    pub async fn run(self) {
        let Server {
            listener,
            local_addr,
            settings,
            connection_limit,
            handle,
        } = self;

        let mut stop = handle.stop_accepting.subscribe();
        let mut connections = JoinSet::new();

        info!(addr = %local_addr, "Accepting connections");

        loop {
            tokio::select! {
                _ = pipeline::signalled(&mut stop) => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    reap(joined);
                }
                accepted = completion::accept(&listener) => match accepted {
                    Ok((stream, peer)) => {
                        let permit = match Arc::clone(&connection_limit).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(peer = %peer, "Connection limit reached, closing");
                                continue;
                            }
                        };
                        info!(peer = %peer, "Accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let cancel = handle.cancel.subscribe();
                        connections.spawn(
                            async move {
                                let exit = pipeline::process_connection(stream, peer, settings, cancel).await;
                                drop(permit);
                                exit
                            }
                            .instrument(info_span!("client", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        drop(listener);
        info!(addr = %local_addr, active = connections.len(), "Listener closed");

        while let Some(joined) = connections.join_next().await {
            reap(joined);
        }
        info!("All connections finished");
    }
}

fn reap(joined: Result<Exit, tokio::task::JoinError>) {
    match joined {
        Ok(exit) => debug!(?exit, "Connection task ended"),
        Err(e) => error!(error = %e, "Connection task failed"),
    }
}
