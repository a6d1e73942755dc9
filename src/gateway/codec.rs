//! Client frame codec.
//!
//! A frame is a payload followed by the `\r\n\r\n` terminator. The payload's first byte is its
//! kind, and the records of a batch are newline delimited:
//!
//! ```text
//! 0 | dataset kind      the client's dataset of the given kind has ended
//! 0                     every result has been sent to the client
//! 1 | records           a batch of airport records
//! 2 | records           a batch of flight records
//! 3 | records           a batch of result records
//! ```

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::AppError;

/// The terminator of every frame.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n\r\n";
/// The kind byte of EOF frames.
pub const KIND_EOF: u8 = 0;
/// The kind byte of result frames.
pub const KIND_RESULTS: u8 = 3;
/// The largest frame accepted from a client.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A frame exchanged with a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// The client's dataset of the given kind has ended.
    Eof { kind: u8 },
    /// Every result has been sent to the client.
    Done,
    /// A batch of dataset records sent by the client.
    Batch { kind: u8, records: Vec<String> },
    /// A batch of result records sent to the client.
    Results { records: Vec<String> },
}

impl Frame {
    /// Encode this frame, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        match self {
            Self::Eof { kind } => buf.extend_from_slice(&[KIND_EOF, *kind]),
            Self::Done => buf.push(KIND_EOF),
            Self::Batch { kind, records } => {
                buf.push(*kind);
                buf.extend_from_slice(records.join("\n").as_bytes());
            }
            Self::Results { records } => {
                buf.push(KIND_RESULTS);
                buf.extend_from_slice(records.join("\n").as_bytes());
            }
        }
        buf.extend_from_slice(FRAME_TERMINATOR);
        buf
    }

    /// Decode a frame payload, without its terminator.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (kind, body) = match payload.split_first() {
            Some((kind, body)) => (*kind, body),
            None => bail!(AppError::InvalidInput("empty frame".into())),
        };
        match (kind, body) {
            (KIND_EOF, []) => Ok(Self::Done),
            (KIND_EOF, [kind]) => Ok(Self::Eof { kind: *kind }),
            (KIND_EOF, _) => bail!(AppError::InvalidInput(format!("EOF frame has {} trailing bytes, expected 1", body.len()))),
            (kind, body) => {
                let body = match std::str::from_utf8(body) {
                    Ok(body) => body,
                    Err(err) => bail!(AppError::InvalidInput(format!("frame body is not valid utf-8: {}", err))),
                };
                let records = body.lines().filter(|line| !line.is_empty()).map(String::from).collect();
                if kind == KIND_RESULTS {
                    Ok(Self::Results { records })
                } else {
                    Ok(Self::Batch { kind, records })
                }
            }
        }
    }
}

/// Reads terminated frames off of a stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new instance.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next frame, `None` once the peer has closed the stream between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find_terminator(&self.buf[searched..]) {
                let end = searched + pos;
                let frame = Frame::decode(&self.buf[..end]);
                self.buf.advance(end + FRAME_TERMINATOR.len());
                return frame.map(Some);
            }
            // The terminator may straddle the next read.
            searched = self.buf.len().saturating_sub(FRAME_TERMINATOR.len() - 1);
            if self.buf.len() > MAX_FRAME_LEN {
                bail!(AppError::InvalidInput(format!("frame exceeds max length of {} bytes", MAX_FRAME_LEN)));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!(AppError::InvalidInput(format!("stream closed within a frame, {} bytes pending", self.buf.len())));
            }
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len()).position(|window| window == FRAME_TERMINATOR)
}
