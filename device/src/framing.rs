//! Stream framing
//!
//! The control channel is `\r\n`-delimited text; reads can end anywhere, so
//! bytes are accumulated until a terminator arrives. The imaging channel uses a
//! fixed 20-byte big-endian header followed by the payload.

use crate::error::{DeviceError, DeviceResult};

const TERMINATOR: &[u8] = b"\r\n";

/// Accumulates partial reads and yields complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and drain every complete line
    ///
    /// Empty lines are dropped. Invalid UTF-8 is replaced rather than rejected
    /// so one corrupt line cannot wedge the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = find_terminator(&self.pending[start..]) {
            let end = start + pos;
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            start = end + TERMINATOR.len();
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(TERMINATOR.len())
        .position(|window| window == TERMINATOR)
}

/// Size of the imaging channel header
pub const FRAME_HEADER_LEN: usize = 20;

/// Imaging channel header (`>HHHIHHBBHH`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFrameHeader {
    /// Payload length in bytes
    pub size: u32,
    pub code: u8,
    pub id: u8,
    pub width: u16,
    pub height: u16,
}

impl ImageFrameHeader {
    /// Decode a header from exactly [`FRAME_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> DeviceResult<Self> {
        if bytes.len() != FRAME_HEADER_LEN {
            return Err(DeviceError::InvalidFrame(format!(
                "expected {} header bytes, got {}",
                FRAME_HEADER_LEN,
                bytes.len()
            )));
        }

        // Three reserved shorts precede the size; two more follow it.
        let size = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Ok(Self {
            size,
            code: bytes[14],
            id: bytes[15],
            width: u16::from_be_bytes([bytes[16], bytes[17]]),
            height: u16::from_be_bytes([bytes[18], bytes[19]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[6..10].copy_from_slice(&self.size.to_be_bytes());
        out[14] = self.code;
        out[15] = self.id;
        out[16..18].copy_from_slice(&self.width.to_be_bytes());
        out[18..20].copy_from_slice(&self.height.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_reads() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"Event\":\"Auto").is_empty());
        assert!(buffer.pending_len() > 0);

        let lines = buffer.push(b"Goto\"}\r\n{\"id\":1}\r\n{\"id\"");
        assert_eq!(lines, vec![r#"{"Event":"AutoGoto"}"#, r#"{"id":1}"#]);

        let lines = buffer.push(b":2}\r\n");
        assert_eq!(lines, vec![r#"{"id":2}"#]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_terminator_split_between_reads() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"id\":5}\r").is_empty());
        assert_eq!(buffer.push(b"\n"), vec![r#"{"id":5}"#]);
    }

    #[test]
    fn test_blank_lines_dropped() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push(b"\r\n\r\n{\"id\":9}\r\n"), vec![r#"{"id":9}"#]);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let mut buffer = LineBuffer::new();
        let text = "{\"name\":\"M31 – Andromeda\"}\r\n".as_bytes();
        let mid = text.iter().position(|b| *b == 0xE2).unwrap() + 1;
        assert!(buffer.push(&text[..mid]).is_empty());
        let lines = buffer.push(&text[mid..]);
        assert_eq!(lines, vec!["{\"name\":\"M31 – Andromeda\"}"]);
    }

    #[test]
    fn test_frame_header_layout() {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw[6..10].copy_from_slice(&1_228_800u32.to_be_bytes());
        raw[14] = 3;
        raw[15] = 21;
        raw[16..18].copy_from_slice(&1080u16.to_be_bytes());
        raw[18..20].copy_from_slice(&1920u16.to_be_bytes());

        let header = ImageFrameHeader::parse(&raw).unwrap();
        assert_eq!(header.size, 1_228_800);
        assert_eq!(header.code, 3);
        assert_eq!(header.id, 21);
        assert_eq!(header.width, 1080);
        assert_eq!(header.height, 1920);
        assert_eq!(header.to_bytes(), raw);
    }

    #[test]
    fn test_short_frame_header_rejected() {
        assert!(ImageFrameHeader::parse(&[0u8; 12]).is_err());
    }
}
