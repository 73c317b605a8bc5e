//! The primitive socket interface the bridge is layered on.
//!
//! The bridge never touches sockets directly; everything goes through a
//! [`SocketDriver`]. [`Reactor`](crate::reactor::Reactor) is the mio-backed
//! implementation used by [`EventLoop`](crate::EventLoop).
//!
//! ```text
//!   reactor ──(SocketEvent)──▶ Protocol ──(callbacks)──▶ ConnectionHandler
//!      ▲                          │
//!      └──── read/write/close ────┘
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::{SocketEvent, SocketId};
use crate::protocol::Protocol;

/// Thread-safe, non-blocking socket primitives.
///
/// Every method may be called from any worker thread.
pub trait SocketDriver: Send + Sync {
    /// Reads at most `buf.len()` bytes.
    ///
    /// `Ok(0)` or an error means nothing was read this time. The driver is
    /// responsible for closing the socket itself on EOF or a hard error.
    fn read(&self, id: SocketId, buf: &mut [u8]) -> io::Result<usize>;

    /// Queues `data` for writing. Completion is signalled by a
    /// [`SocketEvent::Ready`] once the outbound buffer is empty.
    fn write(&self, id: SocketId, data: &[u8]) -> Result<()>;

    /// Binds `protocol` to the socket; from now on events for `id` go to it.
    fn attach(&self, id: SocketId, protocol: Arc<dyn Protocol>) -> Result<()>;

    /// Queues `event` for `id` behind whatever is already queued for it.
    fn force_event(&self, id: SocketId, event: SocketEvent);

    /// Starts delivering [`SocketEvent::Ready`] for `id`.
    fn arm_write_ready(&self, id: SocketId);

    /// Closes the socket. The attached protocol receives
    /// [`SocketEvent::Close`] exactly once.
    fn close(&self, id: SocketId);

    /// Sets the idle timeout that triggers [`SocketEvent::Ping`].
    fn set_timeout(&self, id: SocketId, timeout: Option<Duration>);

    fn timeout(&self, id: SocketId) -> Option<Duration>;

    /// Bytes queued but not yet written to the socket.
    fn pending(&self, id: SocketId) -> usize;

    fn is_open(&self, id: SocketId) -> bool;

    fn peer_addr(&self, id: SocketId) -> Option<SocketAddr>;
}
