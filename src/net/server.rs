use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::{AppError, AppResult, NetworkConfig, Shutdown};

use super::connection::{Connection, EventSink};
use super::endpoint::Endpoint;
use super::engine::{IoEngine, SocketEvent};
use super::lifecycle::{ChannelState, Lifecycle};

/// One event from an accepted connection, paired with the connection it
/// happened on so any worker holding it can reply or close.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub connection: Arc<Connection>,
    pub event: SocketEvent,
}

/// A framed, listening, multi-connection server.
///
/// Owns acceptance of new connections: every accepted socket gets its own
/// [`Connection`], its own framer state, and a dedicated receive task. All
/// events go out on one MPMC channel so a pool of workers can consume them.
pub struct FramedServer {
    listener: TcpListener,
    config: NetworkConfig,
    engine: Arc<IoEngine>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    events_tx: async_channel::Sender<ServerEvent>,
    events_rx: async_channel::Receiver<ServerEvent>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
}

impl FramedServer {
    pub fn new(
        listener: TcpListener,
        config: NetworkConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> FramedServer {
        let (events_tx, events_rx) = async_channel::bounded(config.event_channel_capacity);
        FramedServer {
            listener,
            engine: IoEngine::new(config.clone()),
            limit_connections: Arc::new(Semaphore::new(config.max_connection)),
            config,
            notify_shutdown,
            shutdown_complete_tx,
            events_tx,
            events_rx,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn local_addr(&self) -> AppResult<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Event stream; clone the receiver once per worker.
    pub fn events(&self) -> async_channel::Receiver<ServerEvent> {
        self.events_rx.clone()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn inflight_sends(&self) -> usize {
        self.engine.inflight_sends()
    }

    /// Stops issuing new operations; receive loops wind down on the
    /// shutdown broadcast and drain their connections.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Accepts connections until the listener fails.
    ///
    /// A permit bounds the number of live connections; each accepted socket
    /// is handled by its own task, and the shutdown broadcast reaches every
    /// one of them for a graceful drain.
    pub async fn run(&self) -> AppResult<()> {
        let endpoint = Endpoint::from_config(&self.config);
        info!("server listening on {}", endpoint.address());

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = self.accept().await?;
            if let Err(err) = endpoint.apply_keep_alive(&socket) {
                debug!("keep-alive setup failed: {}", err);
            }
            let peer_addr = match socket.peer_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("accepted socket has no peer address: {}", err);
                    continue;
                }
            };

            let (read_half, write_half) = socket.into_split();
            let conn = Connection::new(
                write_half,
                peer_addr,
                self.engine.clone(),
                Arc::new(Lifecycle::new()),
                EventSink::Server(self.events_tx.clone()),
            );
            debug!("accepted connection {} from {}", conn.id(), peer_addr);

            conn.emit(SocketEvent::Accepted).await;
            conn.lifecycle.try_begin_open();
            conn.emit(SocketEvent::StateChanged {
                state: ChannelState::Opening,
                error: None,
            })
            .await;
            conn.lifecycle.mark_opened();
            conn.emit(SocketEvent::StateChanged {
                state: ChannelState::Opened,
                error: None,
            })
            .await;

            self.connections.insert(conn.id(), conn.clone());

            let engine = self.engine.clone();
            let connections = self.connections.clone();
            let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                engine
                    .run_receive_loop(conn.clone(), read_half, Some(shutdown))
                    .await;
                connections.remove(&conn.id());
                // whether gracefully or unexpectedly closed, release the slot
                drop(permit);
                drop(shutdown_complete_tx);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl std::fmt::Debug for FramedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedServer")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Drop for FramedServer {
    fn drop(&mut self) {
        debug!("framed server dropped");
    }
}
