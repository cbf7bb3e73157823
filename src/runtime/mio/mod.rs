//! mio-based runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). One
//! acceptor thread owns the listening socket and hands accepted streams to a
//! fixed pool of worker threads round-robin. Each worker owns its
//! connections outright, so every readiness event for a connection is
//! handled on the same thread and per-connection state is never shared.

mod acceptor;
mod event_loop;

use crate::config::Config;
use crate::error::ServiceError;
use crate::listener;
use acceptor::Acceptor;
use event_loop::Worker;
use mio::{Token, Waker};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Token reserved on every poll instance for cross-thread wakeups.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Flags shared by the acceptor, the workers and every handle.
struct Lifecycle {
    accepting: AtomicBool,
    running: AtomicBool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(true),
        }
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Cloneable control handle for a running [`Service`].
#[derive(Clone)]
pub struct ServiceHandle {
    lifecycle: Arc<Lifecycle>,
    acceptor: Arc<Waker>,
    workers: Vec<Arc<Waker>>,
}

impl ServiceHandle {
    /// Stop accepting and close the listening socket.
    ///
    /// Connections that were already accepted keep being served.
    pub fn close_listener(&self) {
        if self.lifecycle.accepting.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.acceptor.wake() {
                error!(error = %e, "Failed to wake acceptor");
            }
        }
    }

    /// Close the listening socket and every open connection.
    pub fn shutdown(&self) {
        self.close_listener();
        if self.lifecycle.running.swap(false, Ordering::AcqRel) {
            for (worker, waker) in self.workers.iter().enumerate() {
                if let Err(e) = waker.wake() {
                    error!(worker, error = %e, "Failed to wake worker");
                }
            }
        }
    }
}

/// A running state-machine echo service.
///
/// Dropping the service shuts it down and waits for its threads.
pub struct Service {
    local_addr: SocketAddr,
    handle: ServiceHandle,
    threads: Vec<JoinHandle<()>>,
}

impl Service {
    /// Bind the listening socket and start the acceptor and worker threads.
    pub fn start(config: &Config) -> Result<Self, ServiceError> {
        let std_listener = listener::bind(&config.endpoint(), config.recv_buffer_size)?;
        let local_addr = std_listener.local_addr()?;
        let lifecycle = Arc::new(Lifecycle::new());

        let per_worker = (config.max_connections / config.workers).max(1);
        let mut workers = Vec::with_capacity(config.workers);
        let mut links = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let (worker, link) =
                Worker::new(worker_id, per_worker, config.buffer_size, Arc::clone(&lifecycle))?;
            workers.push(worker);
            links.push(link);
        }
        let worker_wakers = links.iter().map(|link| link.waker()).collect();

        let acceptor = Acceptor::new(
            mio::net::TcpListener::from_std(std_listener),
            links,
            Arc::clone(&lifecycle),
        )?;

        // From here on, dropping `service` stops whatever was already spawned.
        let mut service = Service {
            local_addr,
            handle: ServiceHandle {
                lifecycle,
                acceptor: acceptor.waker(),
                workers: worker_wakers,
            },
            threads: Vec::with_capacity(config.workers + 1),
        };

        for (worker_id, worker) in workers.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker.run())?;
            service.threads.push(handle);
        }

        let handle = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run())?;
        service.threads.push(handle);

        info!(
            addr = %local_addr,
            workers = config.workers,
            buffer_size = config.buffer_size,
            "Started state-machine runtime"
        );

        Ok(service)
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Block until every thread has exited, i.e. until [`ServiceHandle::shutdown`] is called.
    pub fn join(mut self) {
        self.join_threads();
    }

    fn join_threads(&mut self) {
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Runtime thread panicked");
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.handle.shutdown();
        self.join_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeType;
    use std::io::{self, Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            runtime: RuntimeType::StateMachine,
            buffer_size: 16,
            ..Config::default()
        }
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn round_trip(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        client.write_all(payload).unwrap();
        let mut out = vec![0u8; payload.len()];
        client.read_exact(&mut out).unwrap();
        out
    }

    fn wait_until_refused(addr: SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if TcpStream::connect(addr).is_err() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("listener still accepting after close");
    }

    #[test]
    fn test_echo_after_half_close() {
        let service = Service::start(&test_config()).unwrap();
        let mut client = connect(service.local_addr());

        let payload: Vec<u8> = b"Hello, World! "
            .iter()
            .copied()
            .cycle()
            .take(1000)
            .collect();
        client.write_all(&payload).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();

        let mut expected = payload.clone();
        crate::transform::flip_case(&mut expected);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_simultaneous_clients_are_isolated() {
        let service = Service::start(&test_config()).unwrap();
        let mut a = connect(service.local_addr());
        let mut b = connect(service.local_addr());

        a.write_all(b"Hello").unwrap();
        b.write_all(b"world").unwrap();

        let mut out_a = [0u8; 5];
        let mut out_b = [0u8; 5];
        a.read_exact(&mut out_a).unwrap();
        b.read_exact(&mut out_b).unwrap();

        assert_eq!(&out_a, b"hELLO");
        assert_eq!(&out_b, b"WORLD");
    }

    #[test]
    fn test_close_listener_keeps_active_connections() {
        let service = Service::start(&test_config()).unwrap();
        let addr = service.local_addr();
        let mut client = connect(addr);
        assert_eq!(round_trip(&mut client, b"ab"), b"AB");

        service.handle().close_listener();
        wait_until_refused(addr);

        assert_eq!(round_trip(&mut client, b"Still Here"), b"sTILL hERE");
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let service = Service::start(&test_config()).unwrap();
        let mut client = connect(service.local_addr());
        assert_eq!(round_trip(&mut client, b"x"), b"X");

        service.handle().shutdown();
        service.join();

        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(0) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            other => panic!("expected closed connection, got {:?}", other),
        }
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        let first = Service::start(&test_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..test_config()
        };
        assert!(matches!(
            Service::start(&config),
            Err(ServiceError::Bind { .. })
        ));
    }
}
