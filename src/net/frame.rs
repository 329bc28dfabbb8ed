use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs;

use crate::{AppError, AppResult};

use super::framer::{FrameMode, FRAME_HEADER_LEN};

/// Header written ahead of every outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub mode: FrameMode,
    pub len: u32,
}

impl FrameHeader {
    pub fn new(mode: FrameMode, len: u32) -> FrameHeader {
        FrameHeader { mode, len }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = self.mode.as_byte();
        header[1..].copy_from_slice(&self.len.to_be_bytes());
        header
    }
}

/// One element of a scatter-gather send. The frame header covering the
/// combined length goes out as its own write ahead of all elements.
#[derive(Debug, Clone)]
pub enum SendElement {
    Buffer(Bytes),
    /// Streamed from disk at send time, never loaded whole into memory.
    File(PathBuf),
}

/// Sums the payload lengths of all elements for the combined frame header.
///
/// Fails with [`AppError::FrameTooLarge`] before any byte is written when
/// the sum does not fit the 4-byte length field.
pub(crate) async fn combined_len(elements: &[SendElement]) -> AppResult<u32> {
    let mut total: u64 = 0;
    for element in elements {
        let len = match element {
            SendElement::Buffer(buffer) => buffer.len() as u64,
            SendElement::File(path) => fs::metadata(path).await?.len(),
        };
        total += len;
        if total > u32::MAX as u64 {
            return Err(AppError::FrameTooLarge(format!(
                "combined send length {} exceeds the representable frame length",
                total
            )));
        }
    }
    Ok(total as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_mode_then_be_length() {
        let header = FrameHeader::new(FrameMode::Full, 0x0102_0304).encode();
        assert_eq!(header, [1, 0x01, 0x02, 0x03, 0x04]);
        let header = FrameHeader::new(FrameMode::Once, 7).encode();
        assert_eq!(header, [2, 0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_combined_len_sums_buffers_and_files() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        let elements = vec![
            SendElement::Buffer(Bytes::from_static(b"abcde")),
            SendElement::File(file.path().to_path_buf()),
            SendElement::Buffer(Bytes::from_static(b"xy")),
        ];
        assert_eq!(combined_len(&elements).await.unwrap(), 107);
    }

    #[tokio::test]
    async fn test_combined_len_overflow_is_fatal() {
        // sparse file, no actual disk usage
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(u32::MAX as u64).unwrap();
        let elements = vec![
            SendElement::File(file.path().to_path_buf()),
            SendElement::Buffer(Bytes::from_static(b"one more byte")),
        ];
        match combined_len(&elements).await {
            Err(AppError::FrameTooLarge(_)) => {}
            other => panic!("expected frame too large, got {:?}", other),
        }
    }
}
