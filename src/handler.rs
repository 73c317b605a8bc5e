//! The callback contract application code implements.
//!
//! Every method has an empty default, so a handler only implements the
//! callbacks it cares about. A callback that is not overridden behaves exactly
//! like a callback the handler does not respond to.

use crate::connection::Connection;

/// Error type handler callbacks may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a handler callback.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A handler owned by exactly one connection.
pub type BoxedHandler = Box<dyn ConnectionHandler>;

/// Per-connection callbacks.
///
/// ## Execution Context
///
/// Callbacks run on reactor worker threads. Callbacks for one connection never
/// overlap and arrive in order: `on_open` first, `on_shutdown` (if any) before
/// `on_close`, and nothing after `on_close`. Callbacks for different
/// connections may run in parallel, which is why handlers must be `Send`.
///
/// ## Error Handling
///
/// Returned errors are logged. An error from `on_message` also closes the
/// connection. A panic inside any callback is caught and closes the
/// connection.
pub trait ConnectionHandler: Send + 'static {
    /// Called once the connection is attached, before any other callback.
    fn on_open(&mut self, conn: &Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called with each chunk read from the socket. Data may be fragmented.
    fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
        let _ = (conn, data);
        Ok(())
    }

    /// Called when all pending writes were flushed to the socket.
    fn on_drained(&mut self, conn: &Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called when the connection's idle timeout elapsed. Does not close it.
    fn ping(&mut self, conn: &Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called while the event loop shuts down, right before `on_close`.
    fn on_shutdown(&mut self, conn: &Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called once the connection is closed. Always the last callback.
    fn on_close(&mut self, conn: &Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called when an outgoing `connect` failed, with `None` as the connection.
    fn on_closed(&mut self, conn: Option<&Connection>) -> HandlerResult {
        let _ = conn;
        Ok(())
    }
}

/// Produces one handler per accepted connection.
///
/// Returning `None` rejects the connection: the socket is closed and no
/// callback fires.
pub trait HandlerFactory: Send + Sync + 'static {
    fn make_handler(&self) -> Option<BoxedHandler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn() -> Option<H> + Send + Sync + 'static,
    H: ConnectionHandler,
{
    fn make_handler(&self) -> Option<BoxedHandler> {
        self().map(|handler| Box::new(handler) as BoxedHandler)
    }
}
