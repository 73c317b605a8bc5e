//! Error types for mill-raw.
//!
//! Only synchronous setup failures are reported through [`Error`]. Anything
//! that happens to a live connection (including a failed `connect`) is
//! reported through the handler callbacks instead.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::event::SocketId;

#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was missing or invalid.
    #[error("argument error: {0}")]
    Argument(&'static str),

    /// The listen address is already bound by another socket.
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),

    /// Binding the listening socket failed for any other reason.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The host/port pair did not resolve to any socket address.
    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket is closing or already gone.
    #[error("connection {0} is closed")]
    Closed(SocketId),

    #[error("event loop is gone")]
    EventLoopGone,

    #[error("configuration error: {0}")]
    Config(String),

    /// A worker channel hung up; only happens while the pool is being torn down.
    #[error("thread pool is gone")]
    PoolGone,
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
