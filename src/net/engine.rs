use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, error, warn};

use crate::{AppError, AppResult, NetworkConfig, Shutdown};

use super::buffer_pool::BufferPool;
use super::connection::Connection;
use super::frame::{combined_len, FrameHeader, SendElement};
use super::framer::{FrameEvent, FrameMode, Framer};
use super::lifecycle::ChannelState;

const MAX_POOLED_BUFFERS: usize = 32;

/// Events observed on one connection, delivered in arrival order on the
/// connection's event channel.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Server only: the connection was just accepted.
    Accepted,
    /// Fires on every lifecycle transition; `error` is present exactly when
    /// entering [`ChannelState::Failed`].
    StateChanged {
        state: ChannelState,
        error: Option<Arc<AppError>>,
    },
    /// Full mode: one complete reassembled message.
    Message { payload: Bytes },
    /// Once mode: one payload piece as it arrived off the wire.
    Chunk {
        total_len: u32,
        received_len: u32,
        chunk: Bytes,
    },
}

/// Issues sends, drives the continuous receive loop, and owns shutdown
/// processing. One engine instance backs one client or one server; all of
/// its connections share the receive-buffer pool and the in-flight-send
/// counter.
#[derive(Debug)]
pub struct IoEngine {
    running: AtomicBool,
    /// The only cross-connection shared mutable value.
    inflight_sends: AtomicUsize,
    buffer_pool: BufferPool,
    config: NetworkConfig,
}

impl IoEngine {
    pub fn new(config: NetworkConfig) -> Arc<IoEngine> {
        Arc::new(IoEngine {
            running: AtomicBool::new(true),
            inflight_sends: AtomicUsize::new(0),
            buffer_pool: BufferPool::new(config.conn_read_buffer_size, MAX_POOLED_BUFFERS),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops issuing new operations engine-wide; in-flight ones drain.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn inflight_sends(&self) -> usize {
        self.inflight_sends.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn check_liveness(&self, conn: &Connection) -> AppResult<()> {
        if !self.is_running() {
            return Err(AppError::InvalidOperation(
                "engine is not running".to_string(),
            ));
        }
        if !conn.lifecycle.is_opened() {
            return Err(AppError::InvalidOperation(format!(
                "connection {} is not open",
                conn.id()
            )));
        }
        if !conn.is_alive() {
            return Err(AppError::InvalidOperation(format!(
                "connection {} transport has failed",
                conn.id()
            )));
        }
        Ok(())
    }

    /// Frames and sends one payload.
    ///
    /// Transport write failures are not returned: they route to shutdown
    /// processing and surface through the `StateChanged` events. Misuse and
    /// overflow errors come back synchronously.
    pub(crate) async fn send_frame(
        &self,
        conn: &Connection,
        mode: FrameMode,
        payload: Bytes,
    ) -> AppResult<()> {
        if let Err(err) = self.check_liveness(conn) {
            self.process_shutdown(conn, None).await;
            return Err(err);
        }
        if payload.len() as u64 > u32::MAX as u64 {
            return Err(AppError::FrameTooLarge(format!(
                "payload length {} exceeds the representable frame length",
                payload.len()
            )));
        }
        conn.begin_op();
        self.inflight_sends.fetch_add(1, Ordering::AcqRel);
        let result = self.write_frame(conn, mode, payload).await;
        conn.end_op();
        self.inflight_sends.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = result {
            warn!("send on connection {} failed: {}", conn.id(), err);
            conn.mark_dead();
            self.process_shutdown(conn, Some(err)).await;
        }
        Ok(())
    }

    /// Scatter-gather send: one frame header covering the summed length of
    /// all elements, then every element in order. Memory buffers are written
    /// as-is, files are streamed from disk.
    pub(crate) async fn send_multi(
        &self,
        conn: &Connection,
        elements: Vec<SendElement>,
    ) -> AppResult<()> {
        if let Err(err) = self.check_liveness(conn) {
            self.process_shutdown(conn, None).await;
            return Err(err);
        }
        // overflow fails before the operation is issued
        let total_len = combined_len(&elements).await?;
        conn.begin_op();
        self.inflight_sends.fetch_add(1, Ordering::AcqRel);
        let result = self.write_multi(conn, total_len, elements).await;
        conn.end_op();
        self.inflight_sends.fetch_sub(1, Ordering::AcqRel);
        if let Err(err) = result {
            warn!("multi send on connection {} failed: {}", conn.id(), err);
            conn.mark_dead();
            self.process_shutdown(conn, Some(err)).await;
        }
        Ok(())
    }

    async fn write_frame(&self, conn: &Connection, mode: FrameMode, payload: Bytes) -> AppResult<()> {
        let header = FrameHeader::new(mode, payload.len() as u32).encode();
        let mut writer = conn.writer.lock().await;
        writer.write_all(&header).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn write_multi(
        &self,
        conn: &Connection,
        total_len: u32,
        elements: Vec<SendElement>,
    ) -> AppResult<()> {
        // the header goes out as its own element ahead of the caller's
        let header = FrameHeader::new(FrameMode::Full, total_len).encode();
        let mut writer = conn.writer.lock().await;
        writer.write_all(&header).await?;
        let mut written: u64 = 0;
        for element in elements {
            match element {
                SendElement::Buffer(buffer) => {
                    writer.write_all(&buffer).await?;
                    written += buffer.len() as u64;
                }
                SendElement::File(path) => {
                    let mut file = tokio::fs::File::open(&path).await?;
                    written += tokio::io::copy(&mut file, &mut *writer).await?;
                }
            }
        }
        if written != total_len as u64 {
            // a file changed size after the header was built; the stream is
            // now desynchronized for the peer
            return Err(AppError::DetailedIoError(format!(
                "scatter-gather send wrote {} bytes, header declared {}",
                written, total_len
            )));
        }
        writer.flush().await?;
        Ok(())
    }

    /// The continuous receive loop: reads raw chunks, feeds the framer,
    /// emits events, and re-issues the next receive until the peer
    /// disconnects, the transport or framer fails, or the connection is
    /// cancelled locally. Ends in shutdown processing either way.
    pub(crate) async fn run_receive_loop(
        &self,
        conn: Arc<Connection>,
        mut read_half: OwnedReadHalf,
        mut shutdown: Option<Shutdown>,
    ) {
        let mut framer = Framer::new(self.config.max_frame_size);
        let mut buffer = self.buffer_pool.acquire();
        let result = loop {
            if !self.is_running() || !conn.is_alive() {
                break Ok(());
            }
            let read = tokio::select! {
                _ = conn.cancel.cancelled() => {
                    debug!("connection {} receive loop cancelled", conn.id());
                    break Ok(());
                }
                _ = async {
                    match shutdown.as_mut() {
                        Some(shutdown) => shutdown.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    debug!("connection {} receive loop got shutdown signal", conn.id());
                    break Ok(());
                }
                res = read_half.read_buf(&mut buffer) => res,
            };
            match read {
                // peer closed the connection
                Ok(0) => {
                    conn.mark_dead();
                    break Ok(());
                }
                Ok(_) => {
                    let chunk = buffer.split().freeze();
                    let mut events = Vec::new();
                    let parse = framer.process(chunk, &mut |event| events.push(event));
                    for event in events {
                        let event = match event {
                            FrameEvent::Message { payload } => SocketEvent::Message { payload },
                            FrameEvent::Chunk {
                                total_len,
                                received_len,
                                chunk,
                            } => SocketEvent::Chunk {
                                total_len,
                                received_len,
                                chunk,
                            },
                        };
                        conn.emit(event).await;
                    }
                    if let Err(err) = parse {
                        // garbage input, no resynchronization
                        error!("connection {} framing corrupted: {}", conn.id(), err);
                        conn.mark_dead();
                        break Err(err);
                    }
                }
                Err(err) => {
                    conn.mark_dead();
                    break Err(AppError::IoError(err));
                }
            }
        };
        self.buffer_pool.release(buffer);
        match result {
            Ok(()) => self.process_shutdown(&conn, None).await,
            Err(err) => self.process_shutdown(&conn, Some(err)).await,
        }
    }

    /// Tears one connection down: report `Failed` when an error caused it,
    /// stop the receive loop, drain in-flight sends (never cancel them),
    /// shut the write half, clear the data bag, and report `Closed`.
    ///
    /// Safe to call from several places at once; the lifecycle guard lets
    /// only the first caller run the teardown.
    pub(crate) async fn process_shutdown(&self, conn: &Connection, error: Option<AppError>) {
        if let Some(err) = error {
            if conn.lifecycle.mark_failed() {
                conn.emit(SocketEvent::StateChanged {
                    state: ChannelState::Failed,
                    error: Some(Arc::new(err)),
                })
                .await;
            }
        }
        if !conn.lifecycle.try_begin_close() {
            return;
        }
        conn.emit(SocketEvent::StateChanged {
            state: ChannelState::Closing,
            error: None,
        })
        .await;
        conn.cancel.cancel();
        conn.drain().await;
        {
            let mut writer = conn.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                debug!("connection {} writer shutdown: {}", conn.id(), err);
            }
        }
        conn.clear_data();
        conn.lifecycle.mark_closed();
        conn.emit(SocketEvent::StateChanged {
            state: ChannelState::Closed,
            error: None,
        })
        .await;
        debug!("connection {} closed", conn.id());
    }
}

impl Connection {
    /// Sends one Full-mode message: header + payload as one logical unit.
    ///
    /// Transport failures close the connection and surface through
    /// `StateChanged`; only misuse and overflow errors are returned.
    pub async fn send(&self, payload: Bytes) -> AppResult<()> {
        self.engine().send_frame(self, FrameMode::Full, payload).await
    }

    /// Sends one Once-mode message; the peer receives it as a stream of
    /// chunks instead of one buffered message.
    pub async fn send_once(&self, payload: Bytes) -> AppResult<()> {
        self.engine().send_frame(self, FrameMode::Once, payload).await
    }

    /// Scatter-gather send of memory buffers and/or files under one frame
    /// header (Full mode).
    pub async fn send_multi(&self, elements: Vec<SendElement>) -> AppResult<()> {
        self.engine().send_multi(self, elements).await
    }

    /// Drains in-flight operations and closes the connection. No-op when
    /// the connection is not running.
    pub async fn close(&self) -> AppResult<()> {
        self.engine().process_shutdown(self, None).await;
        Ok(())
    }
}
