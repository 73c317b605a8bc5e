use std::sync::Arc;
use std::time::Duration;

use mio::{event::Source, Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::error::Result;

/// Token reserved for the reactor's waker.
pub const WAKER_TOKEN: Token = Token(0);

/// Wraps the mio poller.
///
/// Registration goes through a cloned [`Registry`], so sockets can be
/// registered from worker threads while the reactor thread sits in `poll`.
pub struct PollHandle {
    poller: Mutex<Poll>,
    registry: Registry,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> Result<Self> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok(PollHandle {
            poller: Mutex::new(poller),
            registry,
            waker: Arc::new(waker),
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.register(&self.registry, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S) -> Result<()>
    where
        S: Source + ?Sized,
    {
        src.deregister(&self.registry)?;
        Ok(())
    }

    /// Blocks for at most `timeout` waiting for readiness events.
    ///
    /// Only the reactor thread polls; the lock is uncontended.
    pub fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> Result<usize> {
        let mut poller = self.poller.lock();
        match poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_poll_times_out() {
        let poller = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(16);
        let n = poller
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_wake_interrupts_poll() {
        let poller = PollHandle::new().unwrap();
        poller.wake().unwrap();

        let mut events = Events::with_capacity(16);
        let start = Instant::now();
        poller
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|e| e.token() == WAKER_TOKEN));
    }
}
