use mio::Token;
use std::fmt;

/// Identifier the reactor hands out for every socket it owns.
///
/// Ids are unique while the socket is open. The mio reactor never reuses
/// them, but callers should not rely on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl SocketId {
    pub fn new(id: u64) -> Self {
        SocketId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        SocketId(token.0 as u64)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events a reactor delivers to an attached [`Protocol`](crate::protocol::Protocol).
///
/// Also the unit of work the reactor queues on a socket's home worker, so the
/// same enum is used when a protocol asks for an event to be raised again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Bytes may be available for reading.
    Data,
    /// The outbound buffer is empty and the socket is writable.
    Ready,
    /// The reactor is going away; the connection will be closed next.
    Shutdown,
    /// The socket is closed. Always the last event for an id.
    Close,
    /// The idle timeout elapsed.
    Ping,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketEvent::Data => "data",
            SocketEvent::Ready => "ready",
            SocketEvent::Shutdown => "shutdown",
            SocketEvent::Close => "close",
            SocketEvent::Ping => "ping",
        };
        f.write_str(name)
    }
}
