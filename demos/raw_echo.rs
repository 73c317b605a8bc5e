//! Echo server plus a client that greets it, on one event loop.
//!
//! ```text
//! cargo run --example raw_echo -- [port] [config.toml]
//! ```

use std::path::Path;
use std::sync::Arc;

use mill_raw::prelude::*;
use tracing::{info, warn};

/// Echoes everything back to the sender.
struct Echo;

impl ConnectionHandler for Echo {
    fn on_open(&mut self, conn: &Connection) -> HandlerResult {
        info!(id = %conn.id(), peer = ?conn.peer_addr(), "client connected");
        Ok(())
    }

    fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
        info!(
            id = %conn.id(),
            bytes = data.len(),
            message = %String::from_utf8_lossy(data).trim_end(),
            "received"
        );
        conn.write(data)?;
        Ok(())
    }

    fn ping(&mut self, conn: &Connection) -> HandlerResult {
        conn.write(b"are you there?\r\n")?;
        Ok(())
    }

    fn on_shutdown(&mut self, conn: &Connection) -> HandlerResult {
        conn.write(b"server going away\r\n")?;
        Ok(())
    }

    fn on_close(&mut self, conn: &Connection) -> HandlerResult {
        info!(id = %conn.id(), "client disconnected");
        Ok(())
    }
}

/// Sends one line, then stops the loop once the echo comes back.
struct Greeter {
    event_loop: Arc<EventLoop>,
}

impl ConnectionHandler for Greeter {
    fn on_open(&mut self, conn: &Connection) -> HandlerResult {
        conn.write(b"hello from the client\r\n")?;
        Ok(())
    }

    fn on_message(&mut self, conn: &Connection, data: &[u8]) -> HandlerResult {
        info!(id = %conn.id(), echo = %String::from_utf8_lossy(data).trim_end(), "greeter got echo");
        self.event_loop.stop();
        Ok(())
    }

    fn on_closed(&mut self, _conn: Option<&Connection>) -> HandlerResult {
        warn!("greeter could not connect");
        self.event_loop.stop();
        Ok(())
    }
}

fn main() -> mill_raw::Result<()> {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let config = match args.next() {
        Some(path) => EventLoopConfig::load(Path::new(&path))?,
        None => EventLoopConfig::default(),
    };
    mill_raw::logging::init(&config.logging);

    let event_loop = Arc::new(EventLoop::new(config)?);
    let listener = event_loop.listen(
        ListenArgs::new()
            .address("127.0.0.1")
            .port(port)
            .handler(|| Some(Echo)),
    )?;
    info!(addr = %listener.local_addr(), "echo server ready");

    event_loop.connect(
        ConnectArgs::new(listener.local_addr().port()).handler(Greeter {
            event_loop: event_loop.clone(),
        }),
    )?;

    event_loop.run()
}
