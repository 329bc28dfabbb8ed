use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::io::BufWriter;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::{IoEngine, SocketEvent};
use super::lifecycle::{ChannelState, Lifecycle};
use super::server::ServerEvent;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection's events go: the client delivers bare events (the
/// connection is implicit), the server wraps them with the connection handle
/// so any worker can reply on it.
#[derive(Debug, Clone)]
pub(crate) enum EventSink {
    Client(async_channel::Sender<SocketEvent>),
    Server(async_channel::Sender<ServerEvent>),
}

/// One accepted or connected socket.
///
/// Created on accept/connect and destroyed on close, never reused across
/// connections. Holds the buffered write half; the read half is owned by the
/// connection's receive task.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    engine: Arc<IoEngine>,
    pub(crate) writer: Mutex<BufWriter<OwnedWriteHalf>>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    /// Stops the receive loop on local close.
    pub(crate) cancel: CancellationToken,
    events: EventSink,
    weak_self: Weak<Connection>,
    /// Case-insensitive key/value bag, lifetime = connection lifetime.
    data_bag: DashMap<String, Arc<dyn Any + Send + Sync>>,
    tag: parking_lot::Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    /// Busy guard: sends currently issued on this connection.
    ops_in_flight: AtomicUsize,
    drained: Notify,
    alive: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        write_half: OwnedWriteHalf,
        peer_addr: SocketAddr,
        engine: Arc<IoEngine>,
        lifecycle: Arc<Lifecycle>,
        events: EventSink,
    ) -> Arc<Connection> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| Connection {
            id,
            peer_addr,
            engine,
            writer: Mutex::new(BufWriter::new(write_half)),
            lifecycle,
            cancel: CancellationToken::new(),
            events,
            weak_self: weak.clone(),
            data_bag: DashMap::new(),
            tag: parking_lot::Mutex::new(None),
            ops_in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn engine(&self) -> &Arc<IoEngine> {
        &self.engine
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    /// False once the transport reported an error or the peer disconnected.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Opaque user tag.
    pub fn set_tag<V: Any + Send + Sync>(&self, tag: V) {
        *self.tag.lock() = Some(Arc::new(tag));
    }

    pub fn tag<V: Any + Send + Sync>(&self) -> Option<Arc<V>> {
        let guard = self.tag.lock();
        guard.clone().and_then(|tag| tag.downcast::<V>().ok())
    }

    /// Stores a value in the connection's data bag. Keys compare
    /// case-insensitively.
    pub fn set_data<V: Any + Send + Sync>(&self, key: &str, value: V) {
        self.data_bag
            .insert(key.to_ascii_lowercase(), Arc::new(value));
    }

    pub fn get_data<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        self.data_bag
            .get(&key.to_ascii_lowercase())
            .and_then(|entry| entry.value().clone().downcast::<V>().ok())
    }

    pub fn remove_data(&self, key: &str) -> bool {
        self.data_bag.remove(&key.to_ascii_lowercase()).is_some()
    }

    pub(crate) fn clear_data(&self) {
        self.data_bag.clear();
        *self.tag.lock() = None;
    }

    pub fn ops_in_flight(&self) -> usize {
        self.ops_in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn begin_op(&self) {
        self.ops_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_op(&self) {
        if self.ops_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Waits for every outstanding operation on this connection to finish.
    /// This is a drain, not a cancellation: nothing in flight is aborted.
    pub(crate) async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.ops_in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn emit(&self, event: SocketEvent) {
        match &self.events {
            EventSink::Client(tx) => {
                if tx.send(event).await.is_err() {
                    debug!("event receiver dropped, connection {}", self.id);
                }
            }
            EventSink::Server(tx) => {
                if let Some(connection) = self.weak_self.upgrade() {
                    if tx.send(ServerEvent { connection, event }).await.is_err() {
                        debug!("event receiver dropped, connection {}", self.id);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("ops_in_flight", &self.ops_in_flight())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection {} dropped", self.id);
    }
}
