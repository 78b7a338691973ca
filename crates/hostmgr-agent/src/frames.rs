//! Demultiplexer for the runtime's combined stdio stream.
//!
//! Each frame is an 8-byte header (stream selector, 3 reserved bytes,
//! big-endian u32 payload length) followed by the payload.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 8;
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

/// Encode one frame. Used by tests and fake runtimes.
pub fn encode_frame(stream: StreamKind, payload: &[u8]) -> Vec<u8> {
    let selector = match stream {
        StreamKind::Stdout => 1u8,
        StreamKind::Stderr => 2u8,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(selector);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Pull-based frame reader.
///
/// `next_frame` is cancel-safe: bytes already read stay in the internal
/// buffer, so it can sit in a `select!` next to a flush timer.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            eof: false,
        }
    }

    fn try_parse(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let stream = match self.buf[0] {
            // stdin echo only appears on stdout-style streams.
            0 | 1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown stream selector {other}"),
                ));
            }
        };
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} bytes"),
            ));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(Frame { stream, payload }))
    }

    /// `Ok(None)` on clean EOF at a frame boundary.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_parse()? {
                return Ok(Some(frame));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed mid-frame ({} bytes buffered)", self.buf.len()),
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reassembles lines split across frame boundaries for one stream.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        for &b in bytes {
            if b == b'\n' {
                out.push(self.take_line());
            } else {
                self.partial.push(b);
                if self.partial.len() >= MAX_LINE_BYTES {
                    out.push(self.take_line());
                }
            }
        }
    }

    /// Emit whatever is left once the stream has ended.
    pub fn finish(&mut self, out: &mut Vec<String>) {
        if !self.partial.is_empty() {
            out.push(self.take_line());
        }
    }

    fn take_line(&mut self) -> String {
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        line
    }
}
