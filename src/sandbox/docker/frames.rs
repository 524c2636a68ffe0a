//! Decoder for Docker's multiplexed attach/exec stream
//!
//! Without a TTY, stdout and stderr share one byte stream, each chunk
//! prefixed by an 8-byte header:
//!
//! ```text
//! ┌────────┬──────────┬───────────────────┐
//! │ stream │ 0  0  0  │ size (u32, BE)    │ payload...
//! └────────┴──────────┴───────────────────┘
//!   0 = stdin, 1 = stdout, 2 = stderr
//! ```
//!
//! Headers and payloads may be split across network reads at any byte.

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if buffered
    ///
    /// An unknown stream byte is treated as stdout so no output is lost.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let size = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < HEADER_LEN + size {
            return None;
        }

        let stream = match self.buf[0] {
            0 => StreamKind::Stdin,
            2 => StreamKind::Stderr,
            _ => StreamKind::Stdout,
        };
        let payload = self.buf[HEADER_LEN..HEADER_LEN + size].to_vec();
        self.buf.drain(..HEADER_LEN + size);
        Some(Frame { stream, payload })
    }

    /// Bytes received but not yet forming a complete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decodes_interleaved_streams() {
        let mut decoder = FrameDecoder::new();
        let mut data = frame(1, b"out\n");
        data.extend(frame(2, b"err\n"));
        decoder.push(&data);

        assert_eq!(
            decoder.next_frame(),
            Some(Frame { stream: StreamKind::Stdout, payload: b"out\n".to_vec() })
        );
        assert_eq!(
            decoder.next_frame(),
            Some(Frame { stream: StreamKind::Stderr, payload: b"err\n".to_vec() })
        );
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let data = frame(1, b"hello world");
        let mut decoder = FrameDecoder::new();

        decoder.push(&data[..3]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&data[3..10]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&data[10..]);
        assert_eq!(decoder.next_frame().unwrap().payload, b"hello world".to_vec());
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame(2, b""));
        let f = decoder.next_frame().unwrap();
        assert_eq!(f.stream, StreamKind::Stderr);
        assert!(f.payload.is_empty());
    }
}
