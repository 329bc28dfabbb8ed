use bytes::{Buf, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// mode byte plus big-endian u32 payload length
pub const FRAME_HEADER_LEN: usize = 5;

/// Delivery policy declared by the sender in the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameMode {
    /// Buffer the whole payload, deliver it as one contiguous message.
    Full = 1,
    /// Deliver every piece as it arrives, never buffer.
    Once = 2,
}

impl FrameMode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(value: u8) -> Option<FrameMode> {
        match value {
            1 => Some(FrameMode::Full),
            2 => Some(FrameMode::Once),
            _ => None,
        }
    }
}

/// What the framer hands back while consuming a raw read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Full mode: the complete payload, emitted exactly once per frame.
    Message { payload: Bytes },
    /// Once mode: one piece in arrival order. `received_len` counts payload
    /// bytes seen so far including this chunk; the frame is complete when it
    /// reaches `total_len`.
    Chunk {
        total_len: u32,
        received_len: u32,
        chunk: Bytes,
    },
}

#[derive(Debug)]
struct InProgress {
    mode: FrameMode,
    total_len: u32,
    received_len: u32,
    /// Full mode accumulates here; stays empty in Once mode.
    buffer: BytesMut,
}

/// Reassembles discrete frames out of an arbitrary sequence of raw transport
/// reads. One instance per connection, driven only by that connection's
/// receive loop.
///
/// The parser state is empty exactly between frames; header bytes split
/// across reads are carried in `pending_header` until all
/// [`FRAME_HEADER_LEN`] bytes are available.
#[derive(Debug)]
pub struct Framer {
    max_frame_len: u32,
    pending_header: BytesMut,
    in_progress: Option<InProgress>,
}

impl Framer {
    pub fn new(max_frame_len: u32) -> Framer {
        Framer {
            max_frame_len,
            pending_header: BytesMut::with_capacity(FRAME_HEADER_LEN),
            in_progress: None,
        }
    }

    /// True when no frame is in progress and no header bytes are pending.
    pub fn is_idle(&self) -> bool {
        self.in_progress.is_none() && self.pending_header.is_empty()
    }

    /// Consumes one raw read and emits zero or more events.
    ///
    /// A read may contain a partial header, a partial payload, exactly one
    /// frame, or several coalesced frames; leftover bytes are processed in
    /// arrival order before returning. An invalid mode byte or an oversized
    /// declared length is unrecoverable for the stream: the caller must
    /// close the connection.
    pub fn process<F>(&mut self, mut chunk: Bytes, emit: &mut F) -> AppResult<()>
    where
        F: FnMut(FrameEvent),
    {
        loop {
            match self.in_progress.as_mut() {
                None => {
                    if chunk.is_empty() {
                        return Ok(());
                    }
                    if self.pending_header.len() + chunk.len() < FRAME_HEADER_LEN {
                        // the header itself may be split across reads
                        self.pending_header.extend_from_slice(&chunk);
                        return Ok(());
                    }
                    let (mode, total_len) = self.parse_header(&mut chunk)?;
                    if total_len == 0 {
                        // empty frame completes on the spot
                        match mode {
                            FrameMode::Full => emit(FrameEvent::Message {
                                payload: Bytes::new(),
                            }),
                            FrameMode::Once => emit(FrameEvent::Chunk {
                                total_len: 0,
                                received_len: 0,
                                chunk: Bytes::new(),
                            }),
                        }
                        continue;
                    }
                    let buffer = match mode {
                        FrameMode::Full => BytesMut::with_capacity(total_len as usize),
                        FrameMode::Once => BytesMut::new(),
                    };
                    self.in_progress = Some(InProgress {
                        mode,
                        total_len,
                        received_len: 0,
                        buffer,
                    });
                }
                Some(frame) => {
                    if chunk.is_empty() {
                        return Ok(());
                    }
                    let still_needed = (frame.total_len - frame.received_len) as usize;
                    let take = still_needed.min(chunk.len());
                    let piece = chunk.split_to(take);
                    frame.received_len += take as u32;
                    match frame.mode {
                        FrameMode::Full => frame.buffer.extend_from_slice(&piece),
                        FrameMode::Once => emit(FrameEvent::Chunk {
                            total_len: frame.total_len,
                            received_len: frame.received_len,
                            chunk: piece,
                        }),
                    }
                    if frame.received_len == frame.total_len {
                        if let Some(done) = self.in_progress.take() {
                            if done.mode == FrameMode::Full {
                                emit(FrameEvent::Message {
                                    payload: done.buffer.freeze(),
                                });
                            }
                        }
                        // leftover bytes may start the next frame
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Assembles the 5-byte header from pending bytes plus the current chunk.
    /// Caller has verified that enough bytes are available.
    fn parse_header(&mut self, chunk: &mut Bytes) -> AppResult<(FrameMode, u32)> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let pending = self.pending_header.len();
        header[..pending].copy_from_slice(&self.pending_header);
        let need = FRAME_HEADER_LEN - pending;
        header[pending..].copy_from_slice(&chunk[..need]);
        self.pending_header.clear();
        chunk.advance(need);

        let mode = FrameMode::from_byte(header[0]).ok_or_else(|| {
            AppError::CorruptFrame(format!("invalid frame mode byte {}", header[0]))
        })?;
        let total_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if total_len > self.max_frame_len {
            return Err(AppError::CorruptFrame(format!(
                "frame of length {} is too large, limit is {}",
                total_len, self.max_frame_len
            )));
        }
        Ok((mode, total_len))
    }
}
