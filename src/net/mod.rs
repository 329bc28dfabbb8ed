//! Asynchronous framed-message socket engine.
//!
//! Built on tokio's async I/O primitives, this module provides:
//! - Endpoint and connection management for TCP transports
//! - A length-prefixed framing protocol with two delivery policies
//!   (buffer-then-deliver and deliver-as-received)
//! - A framed client and a listening, multi-connection framed server
//!
//! # Architecture
//!
//! Each connection is owned by one receive task: the task reads raw chunks,
//! feeds them to the connection's [`Framer`], and re-issues the next read
//! once the completion handling is done, so bytes of one stream are always
//! processed in arrival order. Sends may be issued concurrently from any
//! task holding the [`Connection`]; shutdown drains in-flight operations
//! instead of cancelling them.

pub use buffer_pool::BufferPool;
pub use client::FramedClient;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use engine::{IoEngine, SocketEvent};
pub use frame::{FrameHeader, SendElement};
pub use framer::{FrameEvent, FrameMode, Framer, FRAME_HEADER_LEN};
pub use lifecycle::{ChannelState, Lifecycle};
pub use server::{FramedServer, ServerEvent};

mod buffer_pool;
mod client;
mod connection;
mod endpoint;
mod engine;
mod frame;
mod framer;
mod lifecycle;
mod server;
