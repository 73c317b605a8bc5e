//! The mio-backed [`SocketDriver`].
//!
//! One thread polls; workers run everything else. Every readiness event,
//! forced event and timer expiry for a socket becomes a task on that socket's
//! home worker (`id % workers`), so the tasks of one socket run in the order
//! they were queued and never at the same time.
//!
//! ```text
//!   poll ──> token ──┬─> listener      ──> accept task (on the listener's worker)
//!                    ├─> connecting    ──> connect result task
//!                    └─> open socket   ──┬─> readable / closed ──> SocketEvent::Data
//!                                        └─> writable          ──> flush, then Ready
//!   each tick ──> idle sockets ──> SocketEvent::Ping
//!             ──> expired connects ──> on_closed(None)
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lockfree::map::Map as LockfreeMap;
use mio::{event::Event, Events};
use tracing::{debug, info, trace, warn};

use crate::config::EventLoopConfig;
use crate::driver::SocketDriver;
use crate::error::{Error, Result};
use crate::event::{SocketEvent, SocketId};
use crate::object_pool::ObjectPool;
use crate::poll::{PollHandle, WAKER_TOKEN};
use crate::protocol::Protocol;
use crate::registry::HandlerRegistry;
use crate::socket::{Flush, ListenerEntry, SocketEntry};
use crate::thread_pool::ThreadPool;

pub struct Reactor {
    me: Weak<Reactor>,
    pub(crate) poll: PollHandle,
    pub(crate) pool: ThreadPool,
    pub(crate) sockets: LockfreeMap<u64, Arc<SocketEntry>>,
    pub(crate) listeners: LockfreeMap<u64, Arc<ListenerEntry>>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) buffers: ObjectPool<Vec<u8>>,
    pub(crate) config: EventLoopConfig,
    next_id: AtomicU64,
    open: AtomicUsize,
    stopped: AtomicBool,
    epoch: Instant,
}

impl Reactor {
    pub fn new(config: EventLoopConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let poll = PollHandle::new()?;
        let pool = ThreadPool::new(config.workers)?;
        let buffers = ObjectPool::buffers(config.buffer_pool_size, config.read_chunk_size);

        Ok(Arc::new_cyclic(|me| Reactor {
            me: me.clone(),
            poll,
            pool,
            sockets: LockfreeMap::new(),
            listeners: LockfreeMap::new(),
            registry: HandlerRegistry::new(),
            buffers,
            config,
            // Token 0 belongs to the waker.
            next_id: AtomicU64::new(1),
            open: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            epoch: Instant::now(),
        }))
    }

    /// Polls and dispatches until [`stop`](Self::stop) is called, then waits
    /// for the shutdown work it queued to finish.
    pub fn run(&self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        let tick = self.config.poll_timeout();
        info!(workers = self.pool.workers_len(), "reactor running");

        while !self.is_stopped() {
            self.poll.poll(&mut events, Some(tick))?;
            for event in events.iter() {
                self.dispatch_readiness(event);
            }
            self.sweep_timers();
        }

        // Tasks caught mid-flight by the stop can queue follow-ups on other
        // workers; the second barrier drains those.
        self.pool.quiesce()?;
        self.pool.quiesce()?;
        info!("reactor stopped");
        Ok(())
    }

    /// Begins an orderly shutdown.
    ///
    /// Listeners are destroyed and pending connects fail right away. Open
    /// connections get `on_shutdown` and are then closed. Safe to call from
    /// a handler callback; calling it more than once does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("reactor stopping");

        let listener_ids: Vec<u64> = self.listeners.iter().map(|g| *g.key()).collect();
        for id in listener_ids {
            self.destroy_listener(SocketId(id));
        }

        for id in self.registry.pending_ids() {
            self.fail_connect(id, "event loop stopped".into());
        }

        let open: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|g| !g.val().is_connecting())
            .map(|g| SocketId(*g.key()))
            .collect();
        for id in open {
            self.exec(id, move |reactor| reactor.shutdown_socket(id));
        }

        if let Err(e) = self.poll.wake() {
            warn!(error = %e, "failed to wake the reactor");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of sockets currently owned, including in-flight connects.
    pub fn connection_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn next_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn socket(&self, id: SocketId) -> Option<Arc<SocketEntry>> {
        self.sockets.get(&id.0).map(|g| g.val().clone())
    }

    pub(crate) fn insert_socket(&self, entry: Arc<SocketEntry>) {
        self.open.fetch_add(1, Ordering::AcqRel);
        self.sockets.insert(entry.id.0, entry);
    }

    pub(crate) fn remove_socket(&self, id: SocketId) -> Option<Arc<SocketEntry>> {
        let removed = self.sockets.remove(&id.0)?;
        self.open.fetch_sub(1, Ordering::AcqRel);
        Some(removed.val().clone())
    }

    /// This reactor as a driver handle, for binding new connections.
    pub(crate) fn driver(&self) -> Option<Arc<dyn SocketDriver>> {
        let me: Arc<dyn SocketDriver> = self.me.upgrade()?;
        Some(me)
    }

    /// Queues `task` on the home worker of `id`.
    pub(crate) fn exec<F>(&self, id: SocketId, task: F)
    where
        F: FnOnce(&Reactor) + Send + 'static,
    {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        if let Err(e) = self.pool.exec_on(id.0, move || task(&me)) {
            warn!(%id, error = %e, "failed to queue socket task");
        }
    }

    fn schedule(&self, id: SocketId, event: SocketEvent) {
        self.exec(id, move |reactor| reactor.run_event(id, event));
    }

    fn dispatch_readiness(&self, event: &Event) {
        let token = event.token();
        if token == WAKER_TOKEN {
            return;
        }
        let id = SocketId::from_token(token);

        if self.listeners.get(&id.0).is_some() {
            self.exec(id, move |reactor| reactor.accept_ready(id));
            return;
        }

        let Some(entry) = self.socket(id) else {
            trace!(%id, "event for unknown socket");
            return;
        };

        if entry.is_connecting() {
            self.exec(id, move |reactor| reactor.connect_ready(id));
            return;
        }

        // Errors and hang-ups surface on the next read.
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.schedule(id, SocketEvent::Data);
        }
        if event.is_writable() {
            self.exec(id, move |reactor| reactor.flush_ready(id));
        }
    }

    fn run_event(&self, id: SocketId, event: SocketEvent) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        match event {
            SocketEvent::Close => self.finish_close(&entry),
            SocketEvent::Data | SocketEvent::Ready | SocketEvent::Ping if entry.is_closing() => {}
            _ => {
                if let Some(protocol) = entry.protocol() {
                    protocol.handle_event(event, self);
                }
            }
        }
    }

    fn flush_ready(&self, id: SocketId) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        match entry.flush() {
            Ok(Flush::Drained) => {
                if entry.write_ready_armed() && !entry.is_closing() {
                    if let Some(protocol) = entry.protocol() {
                        protocol.on_ready(self);
                    }
                }
            }
            Ok(Flush::Idle) | Ok(Flush::Partial) => {}
            Err(e) => {
                debug!(%id, error = %e, "flush failed");
                self.close(id);
            }
        }
    }

    /// Closes inline rather than queueing, so `run` finds the connection
    /// fully released once its final barrier passes.
    pub(crate) fn shutdown_socket(&self, id: SocketId) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        if let Some(protocol) = entry.protocol() {
            protocol.on_shutdown(self);
        }
        if entry.begin_close() {
            self.finish_close(&entry);
        }
    }

    fn finish_close(&self, entry: &SocketEntry) {
        let id = entry.id;
        if let Err(e) = entry.flush() {
            trace!(%id, error = %e, "final flush failed");
        }
        entry.shutdown();
        if let Err(e) = entry.deregister(&self.poll) {
            trace!(%id, error = %e, "deregister failed");
        }
        self.remove_socket(id);

        if let Some(protocol) = entry.take_protocol() {
            protocol.on_close(self);
        }
        debug!(%id, "socket closed");
    }

    pub(crate) fn sweep_timers(&self) {
        let now = self.now_ms();
        let idle: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|g| g.val().idle_expired(now))
            .map(|g| {
                g.val().touch(now);
                SocketId(*g.key())
            })
            .collect();
        for id in idle {
            self.schedule(id, SocketEvent::Ping);
        }

        for id in self.registry.expired(Instant::now()) {
            self.fail_connect(id, "connect timed out".into());
        }
    }
}

impl SocketDriver for Reactor {
    fn read(&self, id: SocketId, buf: &mut [u8]) -> io::Result<usize> {
        let Some(entry) = self.socket(id) else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        match entry.read(buf) {
            Ok(0) if !buf.is_empty() => {
                trace!(%id, "peer closed");
                self.close(id);
                Ok(0)
            }
            Ok(n) => {
                entry.touch(self.now_ms());
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.schedule(id, SocketEvent::Data);
                Err(e)
            }
            Err(e) => {
                debug!(%id, error = %e, "read failed");
                self.close(id);
                Err(e)
            }
        }
    }

    fn write(&self, id: SocketId, data: &[u8]) -> Result<()> {
        let entry = self.socket(id).ok_or(Error::Closed(id))?;
        if let Err(e) = entry.write(data) {
            debug!(%id, error = %e, "write failed");
            self.close(id);
            return Err(e.into());
        }
        entry.touch(self.now_ms());

        // Nothing left for a writable edge to flush; report the drain now.
        if entry.pending() == 0 && entry.write_ready_armed() {
            self.schedule(id, SocketEvent::Ready);
        }
        Ok(())
    }

    fn attach(&self, id: SocketId, protocol: Arc<dyn Protocol>) -> Result<()> {
        let entry = self.socket(id).ok_or(Error::Closed(id))?;
        // A socket that cannot be polled never gets a protocol, so closing
        // it afterwards fires nothing.
        if !entry.is_registered() {
            entry.register(&self.poll)?;
        }
        entry.set_protocol(protocol);
        if let Some(timeout) = self.config.idle_timeout() {
            self.set_timeout(id, Some(timeout));
        }

        // Bytes that arrived before the protocol was bound produced an edge
        // nobody consumed.
        self.schedule(id, SocketEvent::Data);
        Ok(())
    }

    fn force_event(&self, id: SocketId, event: SocketEvent) {
        match event {
            SocketEvent::Close => self.close(id),
            other => self.schedule(id, other),
        }
    }

    fn arm_write_ready(&self, id: SocketId) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        entry.arm_write_ready();
        if entry.pending() == 0 {
            self.schedule(id, SocketEvent::Ready);
        }
    }

    fn close(&self, id: SocketId) {
        let Some(entry) = self.socket(id) else {
            return;
        };
        if entry.begin_close() {
            trace!(%id, "close requested");
            self.schedule(id, SocketEvent::Close);
        }
    }

    fn set_timeout(&self, id: SocketId, timeout: Option<Duration>) {
        if let Some(entry) = self.socket(id) {
            let ms = timeout.map_or(0, |t| (t.as_millis() as u64).max(1));
            entry.set_timeout_ms(ms);
            entry.touch(self.now_ms());
        }
    }

    fn timeout(&self, id: SocketId) -> Option<Duration> {
        let ms = self.socket(id)?.timeout_ms();
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    fn pending(&self, id: SocketId) -> usize {
        self.socket(id).map_or(0, |entry| entry.pending())
    }

    fn is_open(&self, id: SocketId) -> bool {
        self.socket(id).is_some_and(|entry| !entry.is_closing())
    }

    fn peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.socket(id)?.peer_addr()
    }
}
