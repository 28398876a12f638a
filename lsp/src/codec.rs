//! JSON-RPC framing codec for the analysis server's stdio.
//!
//! Every message in both directions is `Content-Length: N\r\n\r\n` followed
//! by exactly N bytes of UTF-8 JSON. The child may deliver those bytes in
//! arbitrary chunks, so [`FrameDecoder`] accumulates input and only yields a
//! frame once the whole body is buffered. [`FrameReader`] drives a decoder
//! from an async reader; [`FrameWriter`] writes frames.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A header block this long without a terminator is garbage.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A malformed segment of the input stream. The decoder has already moved
/// past it when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("header block is not valid UTF-8")]
    InvalidHeaderEncoding,
    #[error("header block exceeds {MAX_HEADER_BYTES} bytes without terminator")]
    HeaderTooLarge,
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Incremental decoder over an accumulating byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Body bytes of a rejected oversized frame still to be dropped.
    discard: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn extend(&mut self, mut chunk: &[u8]) {
        if self.discard > 0 {
            let skipped = self.discard.min(chunk.len());
            self.discard -= skipped;
            chunk = &chunk[skipped..];
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to take the next complete frame from the buffer.
    ///
    /// Returns `None` when more input is needed. Leftover bytes after a
    /// frame stay buffered for the next call.
    pub fn decode(&mut self) -> Option<Result<serde_json::Value, FrameError>> {
        let Some(header_end) = find_subslice(&self.buf, HEADER_TERMINATOR) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                self.buf.clear();
                return Some(Err(FrameError::HeaderTooLarge));
            }
            return None;
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let content_length = match parse_content_length(&self.buf[..header_end]) {
            Ok(len) => len,
            Err(e) => {
                self.buf.drain(..body_start);
                return Some(Err(e));
            }
        };

        if content_length > MAX_FRAME_BYTES {
            self.buf.drain(..body_start);
            let available = self.buf.len().min(content_length);
            self.buf.drain(..available);
            self.discard = content_length - available;
            return Some(Err(FrameError::Oversized(content_length)));
        }

        let frame_end = body_start + content_length;
        if self.buf.len() < frame_end {
            return None;
        }

        let rest = self.buf.split_off(frame_end);
        let frame = std::mem::replace(&mut self.buf, rest);
        Some(
            serde_json::from_slice(&frame[body_start..])
                .map_err(|e| FrameError::InvalidJson(e.to_string())),
        )
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(header: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(header).map_err(|_| FrameError::InvalidHeaderEncoding)?;
    for line in text.split("\r\n") {
        // Header names are case-insensitive; other headers (e.g. Content-Type) are ignored.
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case("Content-Length")
        {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FrameError::MissingContentLength)
}

/// Serialize a message into its framed wire form.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads JSON-RPC frames from an async reader.
///
/// Malformed segments are logged and skipped; the stream keeps going.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
        }
    }

    /// Read the next well-formed frame.
    ///
    /// Returns `Ok(None)` on EOF. Only I/O failures are errors.
    pub async fn read_frame(&mut self) -> io::Result<Option<serde_json::Value>> {
        loop {
            match self.decoder.decode() {
                Some(Ok(frame)) => return Ok(Some(frame)),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "skipping malformed frame");
                    continue;
                }
                None => {}
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    tracing::debug!(
                        bytes = self.decoder.buffered(),
                        "stream closed with a partial frame buffered"
                    );
                }
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write header and body with a single `write_all`, then flush.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> io::Result<()> {
        let frame = encode_frame(msg)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }
}
