//! flipcase-echo: an asynchronous echo server
//!
//! Every byte a client sends is echoed back with ASCII letters flipped to
//! the opposite case. Two interchangeable connection models are provided:
//! - `state-machine`: readiness-driven per-connection state machines on a
//!   fixed pool of mio worker threads
//! - `pipeline`: a reader task and a writer task per connection, joined by
//!   a FIFO channel, on the tokio runtime
//!
//! Configuration via CLI arguments or TOML file.

mod completion;
mod config;
mod error;
mod listener;
mod pipeline;
mod runtime;
mod server;
mod transform;

use config::{Config, RuntimeType};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        endpoint = %config.endpoint(),
        runtime = ?config.runtime,
        workers = config.workers,
        recv_buffer_size = config.recv_buffer_size,
        "Starting flipcase-echo server"
    );

    match config.runtime {
        RuntimeType::StateMachine => run_state_machine(config),
        RuntimeType::Pipeline => run_pipeline(config),
    }
}

/// Run with the mio state-machine runtime (epoll on Linux, kqueue on macOS)
fn run_state_machine(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let service = runtime::Service::start(&config)?;
    let handle = service.handle();

    // The service runs on its own threads; this thread only waits for Ctrl-C.
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(wait_for_ctrl_c());

    handle.shutdown();
    service.join();
    Ok(())
}

/// Run with the tokio channel-pipeline runtime
fn run_pipeline(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .thread_name("worker")
        .enable_all()
        .build()?;

    rt.block_on(async {
        let server = server::Server::bind(&config).await?;
        let handle = server.handle();

        tokio::spawn(async move {
            wait_for_ctrl_c().await;
            handle.shutdown();
        });

        server.run().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
