//! The envelope wire format.
//!
//! Every broker message exchanged between stages is exactly one `Envelope`. All integer fields
//! are fixed-width big-endian. The leading byte selects the variant, with one exception: the
//! callback notice is an 8 byte frame recognised by its magic prefix.
//!
//! ```text
//! Protocol            0x01 | client u32 | message u64 | count u32 | records joined by '\n'
//! EofFirst            0x02 | client u32 | sent u64
//! EofRequeue          0x03 | client u32 | ttl u8 | remaining u64 | sent u64 | original u64
//! EofFinish           0x04 | client u32 | ttl u8 | sent u64
//! EofCallbackSpecial  0xFF 'C' 'B' 0xFF | client u32
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EnvelopeError;

const TAG_PROTOCOL: u8 = 0x01;
const TAG_EOF_FIRST: u8 = 0x02;
const TAG_EOF_REQUEUE: u8 = 0x03;
const TAG_EOF_FINISH: u8 = 0x04;

/// The magic prefix of a callback notice frame.
pub const CALLBACK_MAGIC: [u8; 4] = [0xFF, b'C', b'B', 0xFF];
/// The fixed length of a callback notice frame.
pub const CALLBACK_FRAME_LEN: usize = 8;

const LEN_PROTOCOL_HEADER: usize = 1 + 4 + 8 + 4;
const LEN_EOF_FIRST: usize = 1 + 4 + 8;
const LEN_EOF_REQUEUE: usize = 1 + 4 + 1 + 8 + 8 + 8;
const LEN_EOF_FINISH: usize = 1 + 4 + 1 + 8;

/// The record separator used inside of a protocol payload.
pub const RECORD_SEPARATOR: char = '\n';

/// A message exchanged between pipeline stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// A batch of application records.
    Protocol { client_id: u32, message_id: u64, payload: Vec<String> },
    /// The first EOF notice for a client, carrying the sender's count of messages sent.
    EofFirst { client_id: u32, messages_sent: u64 },
    /// An EOF drain token circulating among the replicas of a stage.
    EofRequeue {
        client_id: u32,
        ttl: u32,
        remaining: u64,
        messages_sent: u64,
        original_sender_sent: u64,
    },
    /// The terminal EOF token, visiting each replica once to flush its processor.
    EofFinish { client_id: u32, ttl: u32, messages_sent: u64 },
    /// Completion notice broadcast to every replica of a stage.
    EofCallbackSpecial { client_id: u32 },
}

impl Envelope {
    /// The ID of the client this envelope belongs to.
    pub fn client_id(&self) -> u32 {
        match self {
            Self::Protocol { client_id, .. }
            | Self::EofFirst { client_id, .. }
            | Self::EofRequeue { client_id, .. }
            | Self::EofFinish { client_id, .. }
            | Self::EofCallbackSpecial { client_id } => *client_id,
        }
    }

    /// Check if this envelope is one of the EOF variants.
    pub fn is_eof(&self) -> bool {
        !matches!(self, Self::Protocol { .. })
    }

    /// Encode this envelope for the wire.
    ///
    /// Record payloads must not contain the record separator. A `ttl` above 255 is truncated to
    /// its low byte, as the wire field is a single byte.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Protocol { client_id, message_id, payload } => {
                let body_len = payload.iter().map(|rec| rec.len() + 1).sum::<usize>();
                let mut buf = BytesMut::with_capacity(LEN_PROTOCOL_HEADER + body_len);
                buf.put_u8(TAG_PROTOCOL);
                buf.put_u32(*client_id);
                buf.put_u64(*message_id);
                buf.put_u32(payload.len() as u32);
                for (idx, record) in payload.iter().enumerate() {
                    if idx > 0 {
                        buf.put_u8(RECORD_SEPARATOR as u8);
                    }
                    buf.put_slice(record.as_bytes());
                }
                buf.freeze()
            }
            Self::EofFirst { client_id, messages_sent } => {
                let mut buf = BytesMut::with_capacity(LEN_EOF_FIRST);
                buf.put_u8(TAG_EOF_FIRST);
                buf.put_u32(*client_id);
                buf.put_u64(*messages_sent);
                buf.freeze()
            }
            Self::EofRequeue {
                client_id,
                ttl,
                remaining,
                messages_sent,
                original_sender_sent,
            } => {
                let mut buf = BytesMut::with_capacity(LEN_EOF_REQUEUE);
                buf.put_u8(TAG_EOF_REQUEUE);
                buf.put_u32(*client_id);
                buf.put_u8(wire_ttl(*ttl));
                buf.put_u64(*remaining);
                buf.put_u64(*messages_sent);
                buf.put_u64(*original_sender_sent);
                buf.freeze()
            }
            Self::EofFinish { client_id, ttl, messages_sent } => {
                let mut buf = BytesMut::with_capacity(LEN_EOF_FINISH);
                buf.put_u8(TAG_EOF_FINISH);
                buf.put_u32(*client_id);
                buf.put_u8(wire_ttl(*ttl));
                buf.put_u64(*messages_sent);
                buf.freeze()
            }
            Self::EofCallbackSpecial { client_id } => {
                let mut buf = BytesMut::with_capacity(CALLBACK_FRAME_LEN);
                buf.put_slice(&CALLBACK_MAGIC);
                buf.put_u32(*client_id);
                buf.freeze()
            }
        }
    }

    /// Decode an envelope from the given frame.
    pub fn decode(frame: &[u8]) -> Result<Self, EnvelopeError> {
        if frame.len() == CALLBACK_FRAME_LEN && frame[..4] == CALLBACK_MAGIC {
            return Ok(Self::EofCallbackSpecial { client_id: read_u32(frame, 4) });
        }
        let tag = *frame.first().ok_or(EnvelopeError::Empty)?;
        match tag {
            TAG_PROTOCOL => {
                expect_min_len(frame, LEN_PROTOCOL_HEADER)?;
                let count = read_u32(frame, 13) as usize;
                let payload = decode_records(&frame[LEN_PROTOCOL_HEADER..], count)?;
                Ok(Self::Protocol {
                    client_id: read_u32(frame, 1),
                    message_id: read_u64(frame, 5),
                    payload,
                })
            }
            TAG_EOF_FIRST => {
                expect_len(frame, LEN_EOF_FIRST)?;
                Ok(Self::EofFirst {
                    client_id: read_u32(frame, 1),
                    messages_sent: read_u64(frame, 5),
                })
            }
            TAG_EOF_REQUEUE => {
                expect_len(frame, LEN_EOF_REQUEUE)?;
                Ok(Self::EofRequeue {
                    client_id: read_u32(frame, 1),
                    ttl: u32::from(frame[5]),
                    remaining: read_u64(frame, 6),
                    messages_sent: read_u64(frame, 14),
                    original_sender_sent: read_u64(frame, 22),
                })
            }
            TAG_EOF_FINISH => {
                expect_len(frame, LEN_EOF_FINISH)?;
                Ok(Self::EofFinish {
                    client_id: read_u32(frame, 1),
                    ttl: u32::from(frame[5]),
                    messages_sent: read_u64(frame, 6),
                })
            }
            other => Err(EnvelopeError::UnknownTag(other)),
        }
    }
}

/// Truncate the given ttl to its single byte wire representation.
fn wire_ttl(ttl: u32) -> u8 {
    if ttl > u32::from(u8::MAX) {
        tracing::warn!(ttl, "EOF ttl exceeds the single byte wire field and will be truncated");
    }
    (ttl % 256) as u8
}

fn decode_records(body: &[u8], count: usize) -> Result<Vec<String>, EnvelopeError> {
    let body = std::str::from_utf8(body).map_err(|err| EnvelopeError::InvalidPayload(err.to_string()))?;
    if count == 0 {
        if !body.is_empty() {
            return Err(EnvelopeError::InvalidPayload("record count is 0 but payload is not empty".into()));
        }
        return Ok(vec![]);
    }
    let records: Vec<String> = body.split(RECORD_SEPARATOR).map(String::from).collect();
    if records.len() != count {
        return Err(EnvelopeError::InvalidPayload(format!("expected {} records, found {}", count, records.len())));
    }
    Ok(records)
}

fn expect_len(frame: &[u8], needed: usize) -> Result<(), EnvelopeError> {
    expect_min_len(frame, needed)?;
    if frame.len() > needed {
        return Err(EnvelopeError::InvalidPayload(format!("{} trailing bytes after fixed layout", frame.len() - needed)));
    }
    Ok(())
}

fn expect_min_len(frame: &[u8], needed: usize) -> Result<(), EnvelopeError> {
    if frame.len() < needed {
        return Err(EnvelopeError::Truncated { needed, got: frame.len() });
    }
    Ok(())
}

/// Read a big-endian u32 at the given offset; callers validate the frame length first.
fn read_u32(frame: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&frame[at..at + 4]);
    u32::from_be_bytes(buf)
}

/// Read a big-endian u64 at the given offset; callers validate the frame length first.
fn read_u64(frame: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&frame[at..at + 8]);
    u64::from_be_bytes(buf)
}
