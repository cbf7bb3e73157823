//! Service-level errors.

use crate::config::Endpoint;
use std::io;

/// Errors that stop a service from starting.
#[derive(Debug)]
pub enum ServiceError {
    /// The listening socket could not be created, configured or bound.
    Bind { endpoint: Endpoint, source: io::Error },
    /// Runtime resources (poll instance, waker, worker thread) could not be created.
    Io(io::Error),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Bind { endpoint, source } => {
                write!(f, "Failed to bind to {endpoint}: {source}")
            }
            ServiceError::Io(e) => write!(f, "Runtime setup failed: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Bind { source, .. } => Some(source),
            ServiceError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        ServiceError::Io(e)
    }
}
