//! Protocol callback dispatcher and buffered read loop.
//!
//! A [`Protocol`] is what a reactor attaches to a socket. [`RawProtocol`] is
//! the raw-connection protocol: it owns the application's handler and turns
//! every [`SocketEvent`] into at most one handler callback.
//!
//! ```text
//! SocketEvent::Data     ──> read one chunk ──> on_message (re-raise Data if chunk was full)
//! SocketEvent::Ready    ──> on_drained       (only after on_open returned)
//! SocketEvent::Ping     ──> ping
//! SocketEvent::Shutdown ──> on_shutdown      (once)
//! SocketEvent::Close    ──> on_close         (once, then the handler is dropped)
//! ```
//!
//! Every callback runs with the connection's state locked, which is what keeps
//! callbacks for one connection from overlapping.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::connection::Connection;
use crate::driver::SocketDriver;
use crate::event::{SocketEvent, SocketId};
use crate::handler::{BoxedHandler, ConnectionHandler, HandlerResult};
use crate::object_pool::ObjectPool;

/// Service name reported by raw connections.
pub const RAW_SERVICE: &str = "mill-raw TCP/IP raw connection";

/// Reactor-facing side of a connection.
///
/// Implementations can rely on the reactor never running two of these
/// methods for the same socket at once, but must not assume which thread
/// they run on.
pub trait Protocol: Send + Sync {
    fn service(&self) -> &'static str;

    fn on_data(&self, driver: &dyn SocketDriver);

    fn on_ready(&self, driver: &dyn SocketDriver);

    fn on_shutdown(&self, driver: &dyn SocketDriver);

    fn on_close(&self, driver: &dyn SocketDriver);

    fn ping(&self, driver: &dyn SocketDriver);

    fn handle_event(&self, event: SocketEvent, driver: &dyn SocketDriver) {
        match event {
            SocketEvent::Data => self.on_data(driver),
            SocketEvent::Ready => self.on_ready(driver),
            SocketEvent::Shutdown => self.on_shutdown(driver),
            SocketEvent::Close => self.on_close(driver),
            SocketEvent::Ping => self.ping(driver),
        }
    }
}

/// The live binding between one socket and one handler.
pub(crate) struct ConnectionState {
    conn: Connection,
    handler: Option<BoxedHandler>,
    write_ready_registered: bool,
    shutdown_fired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Failed,
    Panicked,
    /// The connection was already closed.
    Skipped,
}

pub struct RawProtocol {
    id: SocketId,
    state: Mutex<ConnectionState>,
    buffers: ObjectPool<Vec<u8>>,
}

impl RawProtocol {
    pub(crate) fn new(
        id: SocketId,
        handler: BoxedHandler,
        driver: &Arc<dyn SocketDriver>,
        buffers: ObjectPool<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState {
                conn: Connection::new(id, driver),
                handler: Some(handler),
                write_ready_registered: false,
                shutdown_fired: false,
            }),
            buffers,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Fires `on_open`, then starts write-readiness notification.
    pub(crate) fn open(&self, driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        let outcome = self.dispatch(&mut state, "on_open", |h, c| h.on_open(c));
        if outcome == Outcome::Skipped {
            return;
        }
        state.write_ready_registered = true;
        drop(state);

        if outcome == Outcome::Panicked {
            driver.close(self.id);
            return;
        }
        driver.arm_write_ready(self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().handler.is_none()
    }

    /// Runs one handler callback inside the connection's execution context.
    fn dispatch<F>(&self, state: &mut ConnectionState, callback: &'static str, f: F) -> Outcome
    where
        F: FnOnce(&mut dyn ConnectionHandler, &Connection) -> HandlerResult,
    {
        let ConnectionState { conn, handler, .. } = state;
        let Some(handler) = handler.as_mut() else {
            return Outcome::Skipped;
        };

        trace!(id = %self.id, callback, "dispatch");
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler.as_mut(), conn))) {
            Ok(Ok(())) => Outcome::Done,
            Ok(Err(e)) => {
                warn!(id = %self.id, callback, error = %e, "handler callback failed");
                Outcome::Failed
            }
            Err(_) => {
                error!(id = %self.id, callback, "handler callback panicked");
                Outcome::Panicked
            }
        }
    }
}

impl Protocol for RawProtocol {
    fn service(&self) -> &'static str {
        RAW_SERVICE
    }

    fn on_data(&self, driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        if state.handler.is_none() {
            return;
        }

        let mut buffer = self.buffers.acquire();
        let len = match driver.read(self.id, &mut buffer) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                trace!(id = %self.id, error = %e, "read failed");
                return;
            }
        };

        let data = &buffer[..len];
        let outcome = self.dispatch(&mut state, "on_message", |h, c| h.on_message(c, data));
        drop(state);

        match outcome {
            Outcome::Done => {
                // A full chunk means the socket may hold more; queue another
                // read instead of draining it here.
                if len == buffer.len() {
                    driver.force_event(self.id, SocketEvent::Data);
                }
            }
            Outcome::Failed | Outcome::Panicked => driver.close(self.id),
            Outcome::Skipped => {}
        }
    }

    fn on_ready(&self, driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        if !state.write_ready_registered {
            return;
        }
        if self.dispatch(&mut state, "on_drained", |h, c| h.on_drained(c)) == Outcome::Panicked {
            drop(state);
            driver.close(self.id);
        }
    }

    fn on_shutdown(&self, driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        if state.shutdown_fired {
            return;
        }
        state.shutdown_fired = true;
        if self.dispatch(&mut state, "on_shutdown", |h, c| h.on_shutdown(c)) == Outcome::Panicked {
            drop(state);
            driver.close(self.id);
        }
    }

    fn on_close(&self, _driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        if state.handler.is_none() {
            return;
        }
        self.dispatch(&mut state, "on_close", |h, c| h.on_close(c));

        // The handler is released only after on_close has returned.
        state.handler = None;
        state.write_ready_registered = false;
        debug!(id = %self.id, "connection released");
    }

    fn ping(&self, driver: &dyn SocketDriver) {
        let mut state = self.state.lock();
        if self.dispatch(&mut state, "ping", |h, c| h.ping(c)) == Outcome::Panicked {
            drop(state);
            driver.close(self.id);
        }
    }
}
