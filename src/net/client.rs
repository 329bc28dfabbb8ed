use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{AppError, AppResult, NetworkConfig};

use super::connection::{Connection, EventSink};
use super::endpoint::Endpoint;
use super::engine::{IoEngine, SocketEvent};
use super::frame::SendElement;
use super::lifecycle::{ChannelState, Lifecycle};

/// A framed client for one connection: prepends the frame header on send,
/// runs the receive loop, and delivers reassembled messages, chunks, and
/// state changes on its event channel.
///
/// The lifecycle spans open/close cycles; the underlying [`Connection`] is
/// created fresh on every open and never reused.
pub struct FramedClient {
    endpoint: Endpoint,
    engine: Arc<IoEngine>,
    lifecycle: Arc<Lifecycle>,
    events_tx: async_channel::Sender<SocketEvent>,
    events_rx: async_channel::Receiver<SocketEvent>,
    connection: Mutex<Option<Arc<Connection>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl FramedClient {
    pub fn new(endpoint: Endpoint, config: NetworkConfig) -> FramedClient {
        let (events_tx, events_rx) = async_channel::bounded(config.event_channel_capacity);
        FramedClient {
            endpoint,
            engine: IoEngine::new(config),
            lifecycle: Arc::new(Lifecycle::new()),
            events_tx,
            events_rx,
            connection: Mutex::new(None),
            receive_task: Mutex::new(None),
        }
    }

    /// Event stream for this client. Keep draining it: delivery is bounded
    /// and in order, so an abandoned receiver eventually stalls the
    /// connection.
    pub fn events(&self) -> async_channel::Receiver<SocketEvent> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    async fn emit_state(&self, state: ChannelState, error: Option<Arc<AppError>>) {
        let _ = self
            .events_tx
            .send(SocketEvent::StateChanged { state, error })
            .await;
    }

    /// Opens the connection.
    ///
    /// No-op when already running. A connect failure is reported as a
    /// `Failed` state change, followed by a forced close, and comes back as
    /// the `Err` value instead of a panic.
    pub async fn open(&self) -> AppResult<()> {
        if !self.lifecycle.try_begin_open() {
            return Ok(());
        }
        self.emit_state(ChannelState::Opening, None).await;
        match self.connect().await {
            Ok((conn, read_half)) => {
                self.lifecycle.mark_opened();
                self.emit_state(ChannelState::Opened, None).await;
                let engine = self.engine.clone();
                let handle = tokio::spawn(async move {
                    engine.run_receive_loop(conn, read_half, None).await;
                });
                *self.receive_task.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                let shared = Arc::new(err);
                self.lifecycle.mark_failed();
                self.emit_state(ChannelState::Failed, Some(shared.clone()))
                    .await;
                self.lifecycle.try_begin_close();
                self.emit_state(ChannelState::Closing, None).await;
                self.lifecycle.mark_closed();
                self.emit_state(ChannelState::Closed, None).await;
                Err(AppError::DetailedIoError(format!(
                    "open {} failed: {}",
                    self.endpoint.address(),
                    shared
                )))
            }
        }
    }

    async fn connect(&self) -> AppResult<(Arc<Connection>, tokio::net::tcp::OwnedReadHalf)> {
        let stream = self.endpoint.connect().await?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let conn = Connection::new(
            write_half,
            peer_addr,
            self.engine.clone(),
            self.lifecycle.clone(),
            EventSink::Client(self.events_tx.clone()),
        );
        *self.connection.lock() = Some(conn.clone());
        info!("connection {} opened to {}", conn.id(), peer_addr);
        Ok((conn, read_half))
    }

    /// Sends one Full-mode message.
    pub async fn send(&self, payload: Bytes) -> AppResult<()> {
        match self.connection() {
            Some(conn) => conn.send(payload).await,
            None => Err(AppError::InvalidOperation(
                "client is not connected".to_string(),
            )),
        }
    }

    /// Sends one Once-mode message; the peer observes it chunk by chunk.
    pub async fn send_once(&self, payload: Bytes) -> AppResult<()> {
        match self.connection() {
            Some(conn) => conn.send_once(payload).await,
            None => Err(AppError::InvalidOperation(
                "client is not connected".to_string(),
            )),
        }
    }

    /// Scatter-gather send of buffers and/or files under one frame header.
    pub async fn send_multi(&self, elements: Vec<SendElement>) -> AppResult<()> {
        match self.connection() {
            Some(conn) => conn.send_multi(elements).await,
            None => Err(AppError::InvalidOperation(
                "client is not connected".to_string(),
            )),
        }
    }

    /// Closes the connection: drains in-flight sends, then tears down.
    /// No-op when not running.
    pub async fn close(&self) -> AppResult<()> {
        let conn = self.connection.lock().take();
        let handle = self.receive_task.lock().take();
        match conn {
            Some(conn) => {
                self.engine.process_shutdown(&conn, None).await;
                if let Some(handle) = handle {
                    let _ = handle.await;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for FramedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
