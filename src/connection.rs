use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::driver::SocketDriver;
use crate::error::{Error, Result};
use crate::event::SocketId;
use crate::protocol::RAW_SERVICE;

/// The connection a handler is talking to.
///
/// Passed by reference into every callback. It only holds a weak reference
/// to the driver, so writes after the event loop was dropped fail with
/// [`Error::EventLoopGone`] instead of keeping the loop alive.
pub struct Connection {
    id: SocketId,
    peer_addr: Option<SocketAddr>,
    driver: Weak<dyn SocketDriver>,
}

impl Connection {
    pub(crate) fn new(id: SocketId, driver: &Arc<dyn SocketDriver>) -> Self {
        Self {
            id,
            peer_addr: driver.peer_addr(id),
            driver: Arc::downgrade(driver),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Name of the protocol driving this connection.
    pub fn service(&self) -> &'static str {
        RAW_SERVICE
    }

    /// Queues `data` for writing. `on_drained` fires once it is flushed.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.driver()?.write(self.id, data)
    }

    /// Closes the connection; `on_close` follows.
    pub fn close(&self) {
        if let Ok(driver) = self.driver() {
            driver.close(self.id);
        }
    }

    /// Sets the idle timeout after which `ping` is called. `None` disables it.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        if let Ok(driver) = self.driver() {
            driver.set_timeout(self.id, timeout);
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.driver().ok().and_then(|d| d.timeout(self.id))
    }

    /// Bytes written but not yet flushed to the socket.
    pub fn pending(&self) -> usize {
        self.driver().map(|d| d.pending(self.id)).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.driver().map(|d| d.is_open(self.id)).unwrap_or(false)
    }

    fn driver(&self) -> Result<Arc<dyn SocketDriver>> {
        self.driver.upgrade().ok_or(Error::EventLoopGone)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
