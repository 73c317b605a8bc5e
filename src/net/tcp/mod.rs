//! Raw TCP connections: listening, connecting and adopting descriptors.
//!
//! Each path ends in [`attach`], which binds a handler to a socket the
//! reactor already owns and fires `on_open`.
//!
//! ```text
//!   listen ──> bind ──> register listener ──> accept task
//!                                               └─ per socket: factory.make_handler() ──> attach
//!
//!   connect ──> retain handler (registry) ──> non-blocking connect ──> writable edge
//!                 ├─ connected ──> take handler ──> attach
//!                 └─ refused / timed out / loop stopped ──> take handler ──> on_closed(None)
//!
//!   attach_fd ──> dup ──> non-blocking ──> attach
//! ```
//!
//! ## Example
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
//! # fn main() -> mill_raw::error::Result<()> {
//! let event_loop = EventLoop::new(EventLoopConfig::default())?;
//! let listener = event_loop.listen(ListenArgs::new().port(3000).handler(|| Some(Echo)))?;
//! println!("echo on {}", listener.local_addr());
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

pub mod config;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::driver::SocketDriver;
use crate::error::{Error, Result};
use crate::event::SocketId;
use crate::handler::BoxedHandler;
use crate::object_pool::ObjectPool;
use crate::protocol::RawProtocol;
use crate::reactor::Reactor;
use crate::socket::{ListenerEntry, SocketEntry};
use config::{ConnectArgs, ListenArgs, Listener};

/// Binds `handler` to socket `id` and opens the connection.
///
/// Without a handler the socket is closed and nothing fires. Otherwise the
/// protocol is attached first, then `on_open` runs, then write-readiness is
/// armed. Must run on the socket's home worker.
pub(crate) fn attach(
    id: SocketId,
    handler: Option<BoxedHandler>,
    driver: &Arc<dyn SocketDriver>,
    buffers: &ObjectPool<Vec<u8>>,
) -> Option<Arc<RawProtocol>> {
    let Some(handler) = handler else {
        trace!(%id, "no handler, closing");
        driver.close(id);
        return None;
    };

    let protocol = Arc::new(RawProtocol::new(id, handler, driver, buffers.clone()));
    if let Err(e) = driver.attach(id, protocol.clone()) {
        warn!(%id, error = %e, "failed to attach protocol");
        driver.close(id);
        return None;
    }

    protocol.open(driver.as_ref());
    Some(protocol)
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{address}:{port} ({e})")))?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{address}:{port}")))
}

fn bind_error(addr: SocketAddr, source: io::Error) -> Error {
    if source.kind() == io::ErrorKind::AddrInUse {
        Error::AddressInUse(addr)
    } else {
        Error::Bind { addr, source }
    }
}

impl Reactor {
    /// Opens a listening socket; every accepted connection gets a handler
    /// from the factory in `args`.
    pub fn listen(&self, args: ListenArgs) -> Result<Listener> {
        let factory = args
            .factory
            .ok_or(Error::Argument("listen requires a handler factory"))?;
        if self.is_stopped() {
            return Err(Error::EventLoopGone);
        }

        let addr = resolve(&args.address, args.port)?;
        let listener = TcpListener::bind(addr).map_err(|e| bind_error(addr, e))?;
        let local_addr = listener.local_addr()?;

        let id = self.next_id();
        let entry = Arc::new(ListenerEntry {
            listener: Mutex::new(listener),
            local_addr,
        });

        self.registry.retain_factory(id, factory.clone());
        self.listeners.insert(id.0, entry.clone());
        let registered = {
            let mut listener = entry.listener.lock();
            self.poll.register(&mut *listener, id.token(), Interest::READABLE)
        };
        if let Err(e) = registered {
            self.listeners.remove(&id.0);
            self.registry.release(id);
            return Err(e);
        }

        info!(%id, %local_addr, "listening");
        Ok(Listener {
            id,
            local_addr,
            factory,
        })
    }

    /// Starts a non-blocking connect.
    ///
    /// Only a missing handler is reported here. Every other failure,
    /// including an address that does not resolve, reaches the handler as
    /// `on_closed(None)`.
    pub fn connect(&self, args: ConnectArgs) -> Result<SocketId> {
        let handler = args
            .handler
            .ok_or(Error::Argument("connect requires a handler"))?;

        let id = self.next_id();
        let timeout = args.timeout.unwrap_or_else(|| self.config.connect_timeout());
        self.registry
            .retain_pending(id, handler, Instant::now() + timeout);

        if self.is_stopped() {
            self.fail_connect(id, "event loop stopped".into());
            return Ok(id);
        }

        let addr = match resolve(&args.address, args.port) {
            Ok(addr) => addr,
            Err(e) => {
                self.fail_connect(id, e.to_string());
                return Ok(id);
            }
        };

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_connect(id, e.to_string());
                return Ok(id);
            }
        };

        let entry = Arc::new(SocketEntry::connecting(id, stream, self.now_ms()));
        self.insert_socket(entry.clone());
        if let Err(e) = entry.register(&self.poll) {
            self.fail_connect(id, e.to_string());
            return Ok(id);
        }

        debug!(%id, %addr, "connecting");
        Ok(id)
    }

    /// Adopts an already-connected TCP descriptor.
    ///
    /// The descriptor is duplicated; the caller keeps ownership of `fd`. It
    /// is registered with the poller before an id is handed out, so a
    /// descriptor that cannot be polled (a regular file, say) is an
    /// [`Error::Io`] and the handler is dropped without any callback.
    #[cfg(unix)]
    pub fn attach_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        handler: Option<BoxedHandler>,
    ) -> Result<SocketId> {
        use std::os::unix::io::FromRawFd;

        let handler = handler.ok_or(Error::Argument("attach requires a handler"))?;
        if self.is_stopped() {
            return Err(Error::EventLoopGone);
        }

        // SAFETY: dup has no preconditions; an invalid fd yields -1/EBADF.
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // SAFETY: `dup` is a fresh descriptor owned by nobody else.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(dup) };
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream);
        let peer_addr = stream.peer_addr().ok();

        let id = self.next_id();
        let entry = Arc::new(SocketEntry::open(id, stream, peer_addr, self.now_ms()));
        if let Err(e) = entry.set_nodelay(self.config.no_delay) {
            trace!(%id, error = %e, "TCP_NODELAY not applied");
        }
        entry.register(&self.poll)?;
        self.insert_socket(entry);
        self.exec(id, move |reactor| reactor.open_socket(id, Some(handler)));

        debug!(%id, fd, "descriptor attached");
        Ok(id)
    }

    pub(crate) fn open_socket(&self, id: SocketId, handler: Option<BoxedHandler>) {
        let Some(driver) = self.driver() else {
            return;
        };
        if attach(id, handler, &driver, &self.buffers).is_none() {
            return;
        }
        debug!(%id, peer = ?self.peer_addr(id), "connection open");

        // Opened after `stop` took its snapshot of open sockets.
        if self.is_stopped() {
            self.shutdown_socket(id);
        }
    }

    /// Accepts until the listener would block.
    pub(crate) fn accept_ready(&self, listener_id: SocketId) {
        let Some(entry) = self.listeners.get(&listener_id.0).map(|g| g.val().clone()) else {
            return;
        };
        let Some(factory) = self.registry.factory(listener_id) else {
            return;
        };

        loop {
            let accepted = entry.listener.lock().accept();
            match accepted {
                Ok((stream, peer_addr)) => {
                    if self.is_stopped() {
                        continue;
                    }
                    if let Some(max) = self.config.max_connections {
                        if self.connection_count() >= max {
                            warn!(%peer_addr, max, "max connections reached, rejecting");
                            continue;
                        }
                    }
                    if let Err(e) = stream.set_nodelay(self.config.no_delay) {
                        warn!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }

                    let id = self.next_id();
                    self.insert_socket(Arc::new(SocketEntry::open(
                        id,
                        stream,
                        Some(peer_addr),
                        self.now_ms(),
                    )));

                    let factory = factory.clone();
                    self.exec(id, move |reactor| {
                        reactor.open_socket(id, factory.make_handler());
                    });
                    trace!(%id, %peer_addr, listener = %listener_id, "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(listener = %listener_id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Resolves an in-flight connect after its socket reported readiness.
    pub(crate) fn connect_ready(&self, id: SocketId) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        if !entry.is_connecting() {
            return;
        }

        match entry.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return self.resolve_connect_failure(id, &e.to_string()),
        }

        match entry.connected_peer() {
            Ok(peer_addr) => {
                // A timeout may have claimed the handler already.
                let Some(handler) = self.registry.take_pending(id) else {
                    return;
                };
                entry.mark_open(peer_addr);
                if let Err(e) = entry.set_nodelay(self.config.no_delay) {
                    trace!(%id, error = %e, "TCP_NODELAY not applied");
                }
                self.open_socket(id, Some(handler));
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!(%id, "connect still in progress");
            }
            Err(e) => self.resolve_connect_failure(id, &e.to_string()),
        }
    }

    /// Reports a failed connect on the socket's home worker.
    pub(crate) fn fail_connect(&self, id: SocketId, reason: String) {
        self.exec(id, move |reactor| reactor.resolve_connect_failure(id, &reason));
    }

    fn resolve_connect_failure(&self, id: SocketId, reason: &str) {
        let Some(mut handler) = self.registry.take_pending(id) else {
            return;
        };
        if let Some(entry) = self.remove_socket(id) {
            if let Err(e) = entry.deregister(&self.poll) {
                trace!(%id, error = %e, "deregister failed");
            }
        }

        debug!(%id, reason, "connect failed");
        match panic::catch_unwind(AssertUnwindSafe(|| handler.on_closed(None))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%id, callback = "on_closed", error = %e, "handler callback failed"),
            Err(_) => error!(%id, callback = "on_closed", "handler callback panicked"),
        }
    }

    pub(crate) fn destroy_listener(&self, id: SocketId) {
        if let Some(removed) = self.listeners.remove(&id.0) {
            let entry = removed.val();
            let mut listener = entry.listener.lock();
            if let Err(e) = self.poll.deregister(&mut *listener) {
                trace!(%id, error = %e, "deregister failed");
            }
            info!(%id, local_addr = %entry.local_addr, "listener closed");
        }
        self.registry.release(id);
    }
}
