//! # Mill-Raw
//! Raw TCP connections for a reactor-based event loop, exposed to application code
//! as plain handler callbacks.
//!
//! Mill-Raw sits between a [`mio`] reactor and your code. You implement
//! [`ConnectionHandler`](handler::ConnectionHandler); the event loop listens,
//! connects or adopts existing descriptors, and calls your handler whenever
//! something happens on the connection it owns.
//! ## Guarantees
//! - **Serialized callbacks**: callbacks for one connection never overlap and arrive in order
//! - **Bounded reads**: data is delivered in chunks of at most `read_chunk_size` bytes (8192 by default)
//! - **Fair scheduling**: a busy connection re-queues its reads instead of draining the socket in one go
//! - **One terminal callback**: `on_close` for connections, or `on_closed(None)` for a connect that never opened
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Reactor    │───▶│ PollHandle  │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!                        │       │
//!                        │       ▼
//!                        │  ┌──────────────┐    ┌───────────────────┐
//!                        │  │ ThreadPool   │───▶│ Workers (id % n)  │
//!                        │  └──────────────┘    └───────────────────┘
//!                        ▼                              │
//!                ┌─────────────────┐          ┌──────────────────────┐
//!                │ HandlerRegistry │          │ RawProtocol          │
//!                │ factories,      │          │ read loop + dispatch │
//!                │ pending connects│          │ ──▶ your handler     │
//!                └─────────────────┘          └──────────────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_raw::prelude::*;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
//!         conn.write(data)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EventLoopConfig::builder().workers(4).build();
//!     mill_raw::logging::init(&config.logging);
//!
//!     let event_loop = EventLoop::new(config)?;
//!     let listener = event_loop.listen(
//!         ListenArgs::new().address("127.0.0.1").port(3000).handler(|| Some(Echo)),
//!     )?;
//!     println!("echo server on {}", listener.local_addr());
//!
//!     // Blocks until stop() is called.
//!     event_loop.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: Entry point: listen, connect, attach descriptors, run and stop
//! - [`handler`]: The callback contract and handler factories
//! - [`connection`]: The handle callbacks receive
//! - [`protocol`]: Dispatcher and buffered read loop
//! - [`reactor`]: The mio-backed socket driver
//! - [`config`]: Configuration, in code or from TOML
//! - [`error`]: Error types and result handling

#![cfg_attr(feature = "unstable-mpmc", feature(mpmc_channel))]

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod event;
pub mod handler;
pub mod logging;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod protocol;
pub mod reactor;
pub mod registry;
mod socket;
pub mod thread_pool;

use std::sync::Arc;

pub use config::EventLoopConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use event::{SocketEvent, SocketId};
pub use handler::{BoxedHandler, ConnectionHandler, HandlerFactory, HandlerResult};
pub use net::tcp::config::{ConnectArgs, ListenArgs, Listener};
pub use object_pool::{ObjectPool, PooledObject};

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_raw::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::EventLoopConfig;
    pub use crate::connection::Connection;
    pub use crate::event::SocketId;
    pub use crate::handler::{BoxedHandler, ConnectionHandler, HandlerFactory, HandlerResult};
    pub use crate::net::tcp::config::{ConnectArgs, ListenArgs, Listener};
    pub use crate::EventLoop;
}

/// The main entry point.
///
/// Owns the reactor, its worker pool and every socket it creates. `run`
/// blocks the calling thread; every other method may be called from any
/// thread, including from inside a handler callback.
///
/// ## Example
///
/// Connecting out:
///
/// ```rust,no_run
/// use mill_raw::prelude::*;
///
/// struct Hello;
///
/// impl ConnectionHandler for Hello {
///     fn on_open(&mut self, conn: &Connection) -> HandlerResult {
///         conn.write(b"hello\r\n")?;
///         Ok(())
///     }
///
///     fn on_closed(&mut self, _conn: Option<&Connection>) -> HandlerResult {
///         eprintln!("could not connect");
///         Ok(())
///     }
/// }
///
/// let event_loop = EventLoop::new(EventLoopConfig::default())?;
/// event_loop.connect(ConnectArgs::new(3000).handler(Hello))?;
/// event_loop.run()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EventLoop {
    reactor: Arc<reactor::Reactor>,
}

impl EventLoop {
    /// Creates an event loop and starts its workers.
    ///
    /// ## Errors
    ///
    /// Returns an error if the configuration is invalid, or the poller or
    /// the worker threads cannot be created.
    pub fn new(config: EventLoopConfig) -> Result<Self> {
        Ok(Self {
            reactor: reactor::Reactor::new(config)?,
        })
    }

    /// Listens for incoming connections.
    ///
    /// Every accepted connection asks the factory in `args` for a handler.
    /// A factory returning `None` rejects that connection without any
    /// callback.
    ///
    /// ## Errors
    ///
    /// - [`Error::Argument`] if no handler factory was given
    /// - [`Error::AddressInUse`] if the address is already bound
    /// - [`Error::Bind`] or [`Error::Resolve`] for other setup failures
    pub fn listen(&self, args: ListenArgs) -> Result<Listener> {
        self.reactor.listen(args)
    }

    /// Connects to a remote host.
    ///
    /// Returns as soon as the connect is underway. On success the handler
    /// gets `on_open`; on any failure it gets exactly one `on_closed(None)`
    /// and nothing else.
    ///
    /// ## Errors
    ///
    /// [`Error::Argument`] if no handler was given.
    pub fn connect(&self, args: ConnectArgs) -> Result<SocketId> {
        self.reactor.connect(args)
    }

    /// Takes over an already-connected TCP socket.
    ///
    /// `fd` is duplicated, so the caller may close its own copy. The handler
    /// gets `on_open` on a worker thread shortly after this returns.
    ///
    /// ## Errors
    ///
    /// - [`Error::Argument`] if `handler` is `None`
    /// - [`Error::Io`] if `fd` is not a valid descriptor
    #[cfg(unix)]
    pub fn attach_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        handler: Option<BoxedHandler>,
    ) -> Result<SocketId> {
        self.reactor.attach_fd(fd, handler)
    }

    /// Runs the event loop, blocking the current thread.
    ///
    /// Returns after [`stop`](Self::stop) once every connection has
    /// received `on_close`.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    /// Signals the event loop to stop.
    ///
    /// Non-blocking and idempotent. Open connections get `on_shutdown`
    /// followed by `on_close`; listeners are destroyed and pending connects
    /// fail with `on_closed(None)`.
    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Number of sockets currently owned, including connects in flight.
    pub fn connection_count(&self) -> usize {
        self.reactor.connection_count()
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.reactor.config
    }

    /// The underlying reactor (advanced usage).
    pub fn reactor(&self) -> &Arc<reactor::Reactor> {
        &self.reactor
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.reactor.stop();
    }
}
