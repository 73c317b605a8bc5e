use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mill_raw::prelude::*;
use mill_raw::Error;
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

struct ServerHandle {
    event_loop: Arc<EventLoop>,
    handle: Option<thread::JoinHandle<mill_raw::Result<()>>>,
}

impl ServerHandle {
    fn start(config: EventLoopConfig) -> Self {
        let event_loop = Arc::new(EventLoop::new(config).unwrap());
        let el = event_loop.clone();
        let handle = thread::spawn(move || el.run());
        Self {
            event_loop,
            handle: Some(handle),
        }
    }

    fn new() -> Self {
        Self::start(
            EventLoopConfig::builder()
                .workers(4)
                .poll_timeout(Duration::from_millis(20))
                .build(),
        )
    }

    fn listen<F: HandlerFactory>(&self, factory: F) -> SocketAddr {
        self.event_loop
            .listen(ListenArgs::new().address("127.0.0.1").handler(factory))
            .unwrap()
            .local_addr()
    }

    fn stop(&mut self) {
        self.event_loop.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.event_loop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Records every callback by name.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    echo: bool,
}

impl Recorder {
    fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == name).count()
    }

    fn received(&self) -> Vec<u8> {
        self.payloads.lock().concat()
    }
}

impl ConnectionHandler for Recorder {
    fn on_open(&mut self, _conn: &Connection) -> HandlerResult {
        self.calls.lock().push("open".into());
        Ok(())
    }

    fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
        self.calls.lock().push("message".into());
        self.payloads.lock().push(data.to_vec());
        if self.echo {
            conn.write(data)?;
        }
        Ok(())
    }

    fn ping(&mut self, _conn: &Connection) -> HandlerResult {
        self.calls.lock().push("ping".into());
        Ok(())
    }

    fn on_shutdown(&mut self, conn: &Connection) -> HandlerResult {
        self.calls.lock().push("shutdown".into());
        conn.write(b"bye")?;
        Ok(())
    }

    fn on_close(&mut self, _conn: &Connection) -> HandlerResult {
        self.calls.lock().push("close".into());
        Ok(())
    }

    fn on_closed(&mut self, conn: Option<&Connection>) -> HandlerResult {
        let name = if conn.is_some() { "closed" } else { "closed-none" };
        self.calls.lock().push(name.into());
        Ok(())
    }
}

fn free_port() -> u16 {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_small_message_single_delivery() {
    let server = ServerHandle::new();
    let recorder = Recorder::default();
    let factory_recorder = recorder.clone();
    let addr = server.listen(move || Some(factory_recorder.clone()));

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hi").unwrap();

    assert!(wait_until(|| recorder.count("message") == 1));
    assert_eq!(recorder.calls()[0], "open");
    assert_eq!(*recorder.payloads.lock(), vec![b"hi".to_vec()]);
}

#[test]
fn test_large_message_split_into_chunks() {
    let server = ServerHandle::new();
    let recorder = Recorder::default();
    let factory_recorder = recorder.clone();
    let addr = server.listen(move || Some(factory_recorder.clone()));

    let message: Vec<u8> = (0..16384u32).map(|i| (i % 253) as u8).collect();
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(&message).unwrap();

    assert!(wait_until(|| recorder.received().len() == message.len()));
    let payloads = recorder.payloads.lock().clone();
    assert!(payloads.len() >= 2);
    assert!(payloads.iter().all(|p| !p.is_empty() && p.len() <= 8192));
    assert_eq!(payloads.concat(), message);
}

#[test]
fn test_echo_round_trip() {
    let server = ServerHandle::new();
    let addr = server.listen(|| Some(Recorder::echoing()));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"hello raw").unwrap();

    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello raw");
}

#[test]
fn test_peer_close_fires_on_close_once() {
    let server = ServerHandle::new();
    let recorder = Recorder::default();
    let factory_recorder = recorder.clone();
    let addr = server.listen(move || Some(factory_recorder.clone()));

    let client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(|| recorder.count("open") == 1));
    drop(client);

    assert!(wait_until(|| recorder.count("close") == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.calls(), vec!["open", "close"]);
    assert!(wait_until(|| server.event_loop.connection_count() == 0));
}

#[test]
fn test_factory_returning_none_closes_socket() {
    let server = ServerHandle::new();
    let addr = server.listen(|| None::<Recorder>);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);
}

#[test]
fn test_connect_refused_reports_closed_once() {
    let server = ServerHandle::new();
    let recorder = Recorder::default();

    server
        .event_loop
        .connect(ConnectArgs::new(free_port()).handler(recorder.clone()))
        .unwrap();

    assert!(wait_until(|| recorder.count("closed-none") == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.calls(), vec!["closed-none"]);
}

#[test]
fn test_connect_without_handler_is_argument_error() {
    let server = ServerHandle::new();
    let result = server.event_loop.connect(ConnectArgs::new(free_port()));
    assert!(matches!(result, Err(Error::Argument(_))));
}

#[test]
fn test_connect_opens_and_talks() {
    let server = ServerHandle::new();
    let addr = server.listen(|| Some(Recorder::echoing()));

    struct Greeter {
        recorder: Recorder,
    }

    impl ConnectionHandler for Greeter {
        fn on_open(&mut self, conn: &Connection) -> HandlerResult {
            self.recorder.on_open(conn)?;
            conn.write(b"greetings")?;
            Ok(())
        }

        fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
            self.recorder.on_message(conn, data)
        }

        fn on_closed(&mut self, conn: Option<&Connection>) -> HandlerResult {
            self.recorder.on_closed(conn)
        }
    }

    let recorder = Recorder::default();
    server
        .event_loop
        .connect(
            ConnectArgs::new(addr.port()).handler(Greeter {
                recorder: recorder.clone(),
            }),
        )
        .unwrap();

    assert!(wait_until(|| recorder.received() == b"greetings"));
    assert_eq!(recorder.calls()[0], "open");
    assert_eq!(recorder.count("closed-none"), 0);
}

#[test]
fn test_listen_on_busy_port() {
    let server = ServerHandle::new();
    let taken = StdListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let result = server.event_loop.listen(
        ListenArgs::new()
            .address("127.0.0.1")
            .port(port)
            .handler(|| Some(Recorder::default())),
    );
    assert!(matches!(result, Err(Error::AddressInUse(_))));
}

#[test]
fn test_listen_without_factory_is_argument_error() {
    let server = ServerHandle::new();
    let result = server.event_loop.listen(ListenArgs::new().address("127.0.0.1"));
    assert!(matches!(result, Err(Error::Argument(_))));
}

#[cfg(unix)]
#[test]
fn test_attach_invalid_descriptor() {
    let server = ServerHandle::new();
    let recorder = Recorder::default();

    let result = server
        .event_loop
        .attach_fd(-1, Some(Box::new(recorder.clone()) as BoxedHandler));
    assert!(matches!(result, Err(Error::Io(_))));

    thread::sleep(Duration::from_millis(50));
    assert!(recorder.calls().is_empty());
}

#[cfg(unix)]
#[test]
fn test_attach_regular_file_descriptor() {
    use std::os::unix::io::AsRawFd;

    let server = ServerHandle::new();
    let recorder = Recorder::default();
    let file = std::fs::File::open("Cargo.toml").unwrap();

    let result = server
        .event_loop
        .attach_fd(file.as_raw_fd(), Some(Box::new(recorder.clone()) as BoxedHandler));
    assert!(matches!(result, Err(Error::Io(_))));

    thread::sleep(Duration::from_millis(50));
    assert!(recorder.calls().is_empty());
    assert_eq!(server.event_loop.connection_count(), 0);
}

#[cfg(unix)]
#[test]
fn test_attach_missing_handler() {
    let server = ServerHandle::new();
    assert!(matches!(
        server.event_loop.attach_fd(0, None),
        Err(Error::Argument(_))
    ));
}

#[cfg(unix)]
#[test]
fn test_attach_existing_descriptor() {
    use std::os::unix::io::AsRawFd;

    let server = ServerHandle::new();
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();

    let recorder = Recorder::echoing();
    server
        .event_loop
        .attach_fd(
            accepted.as_raw_fd(),
            Some(Box::new(recorder.clone()) as BoxedHandler),
        )
        .unwrap();
    // The loop owns a duplicate.
    drop(accepted);

    assert!(wait_until(|| recorder.count("open") == 1));
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.write_all(b"adopted").unwrap();

    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"adopted");
}

#[test]
fn test_stop_fires_shutdown_before_close() {
    let mut server = ServerHandle::new();
    let recorder = Recorder::default();
    let factory_recorder = recorder.clone();
    let addr = server.listen(move || Some(factory_recorder.clone()));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    assert!(wait_until(|| recorder.count("open") == 1));

    server.stop();

    assert_eq!(recorder.calls(), vec!["open", "shutdown", "close"]);
    let mut farewell = Vec::new();
    let _ = client.read_to_end(&mut farewell);
    assert_eq!(farewell, b"bye");
}

#[test]
fn test_idle_timeout_pings() {
    let server = ServerHandle::start(
        EventLoopConfig::builder()
            .workers(2)
            .poll_timeout(Duration::from_millis(10))
            .idle_timeout(Some(Duration::from_millis(50)))
            .build(),
    );
    let recorder = Recorder::default();
    let factory_recorder = recorder.clone();
    let addr = server.listen(move || Some(factory_recorder.clone()));

    let _client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(|| recorder.count("ping") >= 2));
    assert_eq!(recorder.count("close"), 0);
}

#[test]
fn test_callbacks_never_overlap_per_connection() {
    #[derive(Clone)]
    struct Exclusive {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        messages: Arc<AtomicUsize>,
    }

    impl Exclusive {
        fn enter(&self) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    impl ConnectionHandler for Exclusive {
        fn on_open(&mut self, _conn: &Connection) -> HandlerResult {
            self.enter();
            Ok(())
        }

        fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
            self.enter();
            self.messages.fetch_add(1, Ordering::SeqCst);
            conn.write(data)?;
            Ok(())
        }

        fn on_drained(&mut self, _conn: &Connection) -> HandlerResult {
            self.enter();
            Ok(())
        }
    }

    let server = ServerHandle::new();
    let overlaps = Arc::new(AtomicUsize::new(0));
    let messages = Arc::new(AtomicUsize::new(0));
    let factory_overlaps = overlaps.clone();
    let factory_messages = messages.clone();
    let addr = server.listen(move || {
        Some(Exclusive {
            busy: Arc::new(AtomicBool::new(false)),
            overlaps: factory_overlaps.clone(),
            messages: factory_messages.clone(),
        })
    });

    let clients: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(WAIT)).unwrap();
                let mut echoed = vec![0u8; 64];
                for round in 0..20u8 {
                    stream.write_all(&[round; 64]).unwrap();
                    stream.read_exact(&mut echoed).unwrap();
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    assert!(messages.load(Ordering::SeqCst) >= 8);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}
