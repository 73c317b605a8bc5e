//! Per-socket bookkeeping inside the reactor.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use parking_lot::Mutex;

use crate::error::Result;
use crate::event::SocketId;
use crate::poll::PollHandle;
use crate::protocol::Protocol;

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;

/// What a flush accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flush {
    /// Nothing was queued.
    Idle,
    /// Queued bytes were written and the buffer is now empty.
    Drained,
    /// The socket stopped accepting bytes before the buffer emptied.
    Partial,
}

struct SocketIo {
    stream: TcpStream,
    outbound: VecDeque<u8>,
}

pub(crate) struct SocketEntry {
    pub(crate) id: SocketId,
    io: Mutex<SocketIo>,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    phase: AtomicU8,
    registered: AtomicBool,
    write_ready: AtomicBool,
    /// Idle timeout in milliseconds, 0 when disabled.
    timeout_ms: AtomicU64,
    /// Milliseconds since the reactor epoch.
    last_active_ms: AtomicU64,
}

impl SocketEntry {
    pub(crate) fn connecting(id: SocketId, stream: TcpStream, now_ms: u64) -> Self {
        Self::new(id, stream, CONNECTING, None, now_ms)
    }

    pub(crate) fn open(
        id: SocketId,
        stream: TcpStream,
        peer_addr: Option<SocketAddr>,
        now_ms: u64,
    ) -> Self {
        Self::new(id, stream, OPEN, peer_addr, now_ms)
    }

    fn new(
        id: SocketId,
        stream: TcpStream,
        phase: u8,
        peer_addr: Option<SocketAddr>,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            io: Mutex::new(SocketIo {
                stream,
                outbound: VecDeque::new(),
            }),
            protocol: Mutex::new(None),
            peer_addr: Mutex::new(peer_addr),
            phase: AtomicU8::new(phase),
            registered: AtomicBool::new(false),
            write_ready: AtomicBool::new(false),
            timeout_ms: AtomicU64::new(0),
            last_active_ms: AtomicU64::new(now_ms),
        }
    }

    pub(crate) fn register(&self, poll: &PollHandle) -> Result<()> {
        let mut io = self.io.lock();
        poll.register(
            &mut io.stream,
            self.id.token(),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn deregister(&self, poll: &PollHandle) -> Result<()> {
        if self.registered.swap(false, Ordering::AcqRel) {
            let mut io = self.io.lock();
            poll.deregister(&mut io.stream)?;
        }
        Ok(())
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.lock().stream.read(buf)
    }

    /// Writes as much as the socket takes right now and queues the rest.
    pub(crate) fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut io = self.io.lock();
        let mut written = 0;

        if io.outbound.is_empty() {
            while written < data.len() {
                match io.stream.write(&data[written..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        io.outbound.extend(&data[written..]);
        Ok(())
    }

    pub(crate) fn flush(&self) -> io::Result<Flush> {
        let mut io = self.io.lock();
        if io.outbound.is_empty() {
            return Ok(Flush::Idle);
        }

        while !io.outbound.is_empty() {
            let SocketIo { stream, outbound } = &mut *io;
            let (front, _) = outbound.as_slices();
            match stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Partial),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Flush::Drained)
    }

    pub(crate) fn pending(&self) -> usize {
        self.io.lock().outbound.len()
    }

    /// Pending connect error, if the connect failed.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.io.lock().stream.take_error()
    }

    /// Peer address as the kernel sees it; `NotConnected` while a connect is in flight.
    pub(crate) fn connected_peer(&self) -> io::Result<SocketAddr> {
        self.io.lock().stream.peer_addr()
    }

    pub(crate) fn set_nodelay(&self, enabled: bool) -> io::Result<()> {
        self.io.lock().stream.set_nodelay(enabled)
    }

    /// Tells the peer we are done; the descriptor itself closes on drop.
    pub(crate) fn shutdown(&self) {
        let _ = self.io.lock().stream.shutdown(Shutdown::Both);
    }

    pub(crate) fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self.protocol.lock() = Some(protocol);
    }

    pub(crate) fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.lock().clone()
    }

    pub(crate) fn take_protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.lock().take()
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CONNECTING
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.phase.load(Ordering::Acquire) == CLOSING
    }

    /// Moves a connecting socket to open. Returns `false` if it was not connecting.
    pub(crate) fn mark_open(&self, peer_addr: SocketAddr) -> bool {
        let moved = self
            .phase
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            *self.peer_addr.lock() = Some(peer_addr);
        }
        moved
    }

    /// Marks the socket as closing. Returns `true` only for the first caller.
    pub(crate) fn begin_close(&self) -> bool {
        self.phase.swap(CLOSING, Ordering::AcqRel) != CLOSING
    }

    pub(crate) fn arm_write_ready(&self) {
        self.write_ready.store(true, Ordering::Release);
    }

    pub(crate) fn write_ready_armed(&self) -> bool {
        self.write_ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_active_ms.store(now_ms, Ordering::Relaxed);
    }

    /// True when an open socket has been idle for its whole timeout.
    pub(crate) fn idle_expired(&self, now_ms: u64) -> bool {
        let timeout = self.timeout_ms();
        if timeout == 0 || self.phase.load(Ordering::Acquire) != OPEN {
            return false;
        }
        now_ms.saturating_sub(self.last_active_ms.load(Ordering::Relaxed)) >= timeout
    }
}

pub(crate) struct ListenerEntry {
    pub(crate) listener: Mutex<TcpListener>,
    pub(crate) local_addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::time::Duration;

    fn pair() -> (SocketEntry, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let entry = SocketEntry::open(SocketId(1), TcpStream::from_std(server), Some(peer), 0);
        (entry, client)
    }

    #[test]
    fn test_write_reaches_peer() {
        let (entry, mut client) = pair();
        entry.write(b"hello").unwrap();
        assert_eq!(entry.pending(), 0);

        let mut buf = [0u8; 5];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(entry.flush().unwrap(), Flush::Idle);
    }

    #[test]
    fn test_read_would_block_when_empty() {
        let (entry, _client) = pair();
        let mut buf = [0u8; 16];
        let err = entry.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_begin_close_once() {
        let (entry, _client) = pair();
        assert!(entry.begin_close());
        assert!(!entry.begin_close());
        assert!(entry.is_closing());
    }

    #[test]
    fn test_idle_expiry() {
        let (entry, _client) = pair();
        assert!(!entry.idle_expired(1_000_000));

        entry.set_timeout_ms(100);
        entry.touch(1_000);
        assert!(!entry.idle_expired(1_050));
        assert!(entry.idle_expired(1_100));

        entry.begin_close();
        assert!(!entry.idle_expired(5_000));
    }
}
