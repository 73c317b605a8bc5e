//! Network transports for the event loop.
//!
//! Transports turn OS sockets into reactor-owned sockets and bind a
//! [`ConnectionHandler`](crate::handler::ConnectionHandler) to each one. The
//! application never touches the socket; it sees callbacks and a
//! [`Connection`](crate::connection::Connection) handle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌──────────────────────┐         │
//! │  │ listen /     │          │ Your Handler         │         │
//! │  │ connect /    │          │ (ConnectionHandler)  │         │
//! │  │ attach_fd    │          └──────────▲───────────┘         │
//! │  └──────┬───────┘                     │ on_open, on_message │
//! └─────────┼─────────────────────────────┼─────────────────────┘
//!           ▼                             │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventLoop                           │
//! │  ┌──────────┐      ┌──────────────┐      ┌──────────────┐   │
//! │  │ Reactor  │────▶│ Thread Pool  │────▶│ RawProtocol  │   │
//! │  │ (Poll)   │      │ (id % n)     │      │              │   │
//! │  └──────────┘      └──────────────┘      └──────────────┘   │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS Events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only TCP is provided.

pub mod tcp;
