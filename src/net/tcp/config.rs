use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::event::SocketId;
use crate::handler::{BoxedHandler, ConnectionHandler, HandlerFactory};

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_CONNECT_ADDRESS: &str = "127.0.0.1";

/// Arguments for [`EventLoop::listen`](crate::EventLoop::listen).
///
/// The port defaults to 0 (any free port) and the address to every
/// interface. A handler factory is required; `listen` fails with
/// [`Error::Argument`](crate::error::Error::Argument) without one.
///
/// ```rust
/// use mill_raw::net::tcp::config::ListenArgs;
/// use mill_raw::handler::ConnectionHandler;
///
/// struct Echo;
/// impl ConnectionHandler for Echo {}
///
/// let args = ListenArgs::new()
///     .port(3000)
///     .address("127.0.0.1")
///     .handler(|| Some(Echo));
/// assert_eq!(args.port_number(), 3000);
/// ```
#[derive(Clone)]
pub struct ListenArgs {
    pub(crate) port: u16,
    pub(crate) address: String,
    pub(crate) factory: Option<Arc<dyn HandlerFactory>>,
}

impl ListenArgs {
    pub fn new() -> Self {
        Self {
            port: 0,
            address: DEFAULT_LISTEN_ADDRESS.into(),
            factory: None,
        }
    }

    /// Set the port to listen on
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the address to bind to; host names are resolved
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set address and port at once
    pub fn addr(self, addr: SocketAddr) -> Self {
        self.address(addr.ip().to_string()).port(addr.port())
    }

    /// Set the factory asked for a handler on every accepted connection
    pub fn handler<F: HandlerFactory>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Like [`handler`](Self::handler), sharing an existing factory
    pub fn shared_handler(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn port_number(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.address
    }
}

impl Default for ListenArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenArgs")
            .field("port", &self.port)
            .field("address", &self.address)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

/// Arguments for [`EventLoop::connect`](crate::EventLoop::connect).
///
/// The address defaults to the loopback interface. The handler is moved
/// into the connection once it opens; if the connect fails, the handler
/// only ever sees `on_closed(None)`.
pub struct ConnectArgs {
    pub(crate) port: u16,
    pub(crate) address: String,
    pub(crate) handler: Option<BoxedHandler>,
    pub(crate) timeout: Option<Duration>,
}

impl ConnectArgs {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            address: DEFAULT_CONNECT_ADDRESS.into(),
            handler: None,
            timeout: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set address and port at once
    pub fn addr(self, addr: SocketAddr) -> Self {
        self.address(addr.ip().to_string()).port(addr.port())
    }

    pub fn handler<H: ConnectionHandler>(mut self, handler: H) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn boxed_handler(mut self, handler: BoxedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bound on connection establishment; defaults to the loop's
    /// `connect_timeout_ms`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for ConnectArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectArgs")
            .field("port", &self.port)
            .field("address", &self.address)
            .field("handler", &self.handler.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A listening socket created by [`EventLoop::listen`](crate::EventLoop::listen).
///
/// Lives until the event loop stops; the factory is released with it.
#[derive(Clone)]
pub struct Listener {
    pub(crate) id: SocketId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) factory: Arc<dyn HandlerFactory>,
}

impl Listener {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The bound address; useful after listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn factory(&self) -> &Arc<dyn HandlerFactory> {
        &self.factory
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
