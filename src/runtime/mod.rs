//! Readiness-driven runtime for the state-machine connection model.
//!
//! Shared abstractions:
//! - `Buffer`: fixed-capacity buffer holding one echo round
//! - `Connection`: per-connection state machine
//! - `ConnectionRegistry`: slab of connections owned by one worker

mod buffer;
mod connection;
mod mio;

pub(crate) use connection::{Connection, ConnectionRegistry, Mode, Step};

pub use self::mio::{Service, ServiceHandle};
