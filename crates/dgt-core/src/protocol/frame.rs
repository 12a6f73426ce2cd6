//! Frame codec for DGT board-to-host messages.
//!
//! Wire format:
//! ```text
//! [0x80 | id:1][length bits 13..7:1][length bits 6..0:1][payload:length-3]
//! ```
//! The length counts every byte of the frame, header included. Only the id
//! byte has its high bit set; every other byte is 7-bit clean.
//!
//! # Why 7-bit clean? (for beginners)
//!
//! The board talks over a plain serial line with no framing of its own.  If
//! the host starts listening halfway through a message, or a byte is lost,
//! it needs a way to find the start of the next message.  Reserving bit 7
//! for the id byte gives exactly that: skip forward until a byte with bit 7
//! set shows up, and parsing can resume from there.  The price is that the
//! 14-bit length has to be split into two 7-bit halves (see [`llh_seven`] and
//! [`lll_seven`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Bit that marks the first byte of every message.
pub const MESSAGE_BIT: u8 = 0x80;

/// Size of the id + two length bytes.
pub const HEADER_SIZE: usize = 3;

/// Largest total frame length expressible in 14 bits.
pub const MAX_FRAME_LENGTH: usize = 0x3FFF;

/// Largest payload that fits in a frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_LENGTH - HEADER_SIZE;

/// Default cap on bytes held by a [`FrameDecoder`] while waiting for a frame.
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The first buffered byte does not have the message bit set.
    #[error("expected a message id byte with the high bit set, found 0x{0:02X}")]
    MissingStartByte(u8),

    /// A message id passed to the encoder does not fit in 7 bits.
    #[error("message id 0x{0:02X} does not fit in 7 bits")]
    IdOutOfRange(u8),

    /// One of the two length bytes has its high bit set.
    #[error("length byte 0x{0:02X} has its high bit set")]
    LengthNotSevenBit(u8),

    /// The declared length is shorter than the header itself.
    #[error("declared frame length {0} is outside 3..=16383")]
    LengthOutOfRange(usize),

    /// A payload byte has its high bit set.
    #[error("payload byte 0x{byte:02X} at offset {offset} has its high bit set")]
    PayloadNotSevenBit { offset: usize, byte: u8 },

    /// The payload is too large for a 14-bit length.
    #[error("payload of {0} bytes exceeds the 16380-byte limit")]
    PayloadTooLarge(usize),

    /// The decoder buffered more than its limit without completing a frame.
    #[error("receive buffer exceeded {0} bytes without a complete frame")]
    BufferOverflow(usize),
}

// ── Length and checksum arithmetic ───────────────────────────────────────────

/// Low 7 bits of a 14-bit length (`LLL_SEVEN`).
pub fn lll_seven(length: u16) -> u8 {
    (length & 0x7f) as u8
}

/// High 7 bits of a 14-bit length (`LLH_SEVEN`).
pub fn llh_seven(length: u16) -> u8 {
    ((length & 0x3f80) >> 7) as u8
}

/// Rebuilds a 14-bit value from its two 7-bit halves.
pub fn join_seven(high: u8, low: u8) -> u16 {
    (u16::from(high & 0x7f) << 7) | u16::from(low & 0x7f)
}

/// Sum of all bytes modulo 128; the high bit of the result is always clear.
pub fn checksum(bytes: &[u8]) -> u8 {
    (bytes.iter().fold(0u32, |acc, &b| acc + u32::from(b)) % 128) as u8
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One complete message: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Wire id byte, message bit included (e.g. `0x8e` for a field update).
    pub id: u8,
    /// Total frame length including the three header bytes.
    pub length: u16,
    /// Header-stripped payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame for the 7-bit message code `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if `id` exceeds 7 bits, the payload is too
    /// large, or any payload byte has its high bit set.
    pub fn new(id: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if id & MESSAGE_BIT != 0 {
            return Err(FrameError::IdOutOfRange(id));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        if let Some(offset) = payload.iter().position(|b| b & MESSAGE_BIT != 0) {
            return Err(FrameError::PayloadNotSevenBit {
                offset,
                byte: payload[offset],
            });
        }
        Ok(Self {
            id: MESSAGE_BIT | id,
            length: (HEADER_SIZE + payload.len()) as u16,
            payload,
        })
    }

    /// The 7-bit message code, without the message bit.
    pub fn message_id(&self) -> u8 {
        self.id & !MESSAGE_BIT
    }

    /// Serialises the frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.id);
        buf.push(llh_seven(self.length));
        buf.push(lll_seven(self.length));
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Encodes `payload` as a frame with the 7-bit message code `id`.
///
/// # Errors
///
/// See [`Frame::new`].
///
/// # Examples
///
/// ```rust
/// use dgt_core::protocol::frame::{encode_frame, try_decode_frame, FrameStatus};
///
/// let bytes = encode_frame(0x0e, &[0x04, 0x01]).unwrap();
/// assert_eq!(bytes, vec![0x8e, 0x00, 0x05, 0x04, 0x01]);
/// match try_decode_frame(&bytes) {
///     FrameStatus::Complete(frame, consumed) => {
///         assert_eq!(frame.payload, vec![0x04, 0x01]);
///         assert_eq!(consumed, 5);
///     }
///     other => panic!("unexpected status: {other:?}"),
/// }
/// ```
pub fn encode_frame(id: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(Frame::new(id, payload.to_vec())?.encode())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Outcome of trying to parse a frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// A full frame and the number of bytes it occupied.
    Complete(Frame, usize),
    /// The buffer holds the beginning of a frame; wait for more bytes.
    Incomplete,
    /// The front of the buffer is not a valid frame. Drop `skip` bytes to
    /// reach the next candidate start byte.
    Invalid { skip: usize, error: FrameError },
}

/// Parses one frame from the start of `buf` without consuming anything.
pub fn try_decode_frame(buf: &[u8]) -> FrameStatus {
    let Some(&first) = buf.first() else {
        return FrameStatus::Incomplete;
    };
    if first & MESSAGE_BIT == 0 {
        return invalid_from_start(buf, FrameError::MissingStartByte(first));
    }

    for (i, &b) in buf.iter().enumerate().take(HEADER_SIZE).skip(1) {
        if b & MESSAGE_BIT != 0 {
            // A new message started inside this header.
            return FrameStatus::Invalid {
                skip: i,
                error: FrameError::LengthNotSevenBit(b),
            };
        }
    }
    if buf.len() < HEADER_SIZE {
        return FrameStatus::Incomplete;
    }

    let length = usize::from(join_seven(buf[1], buf[2]));
    if length < HEADER_SIZE {
        return invalid_from_start(buf, FrameError::LengthOutOfRange(length));
    }

    let available = buf.len().min(length);
    if let Some(offset) = buf[HEADER_SIZE..available]
        .iter()
        .position(|b| b & MESSAGE_BIT != 0)
    {
        let at = HEADER_SIZE + offset;
        return FrameStatus::Invalid {
            skip: at,
            error: FrameError::PayloadNotSevenBit {
                offset,
                byte: buf[at],
            },
        };
    }
    if buf.len() < length {
        return FrameStatus::Incomplete;
    }

    let frame = Frame {
        id: first,
        length: length as u16,
        payload: buf[HEADER_SIZE..length].to_vec(),
    };
    FrameStatus::Complete(frame, length)
}

fn invalid_from_start(buf: &[u8], error: FrameError) -> FrameStatus {
    FrameStatus::Invalid {
        skip: next_start(buf),
        error,
    }
}

/// Index of the next byte after position 0 with the message bit set, or the
/// buffer length when there is none.
fn next_start(buf: &[u8]) -> usize {
    buf.iter()
        .skip(1)
        .position(|b| b & MESSAGE_BIT != 0)
        .map_or(buf.len(), |p| p + 1)
}

// ── Incremental decoder ───────────────────────────────────────────────────────

/// Accumulates transport bytes and yields frames in wire order.
///
/// Bytes are appended with [`push`](Self::push) as they arrive; each call to
/// [`next_frame`](Self::next_frame) returns at most one frame or one error.
/// Errors never leave the decoder stuck: the offending bytes have already been
/// dropped when the error is returned.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl FrameDecoder {
    /// Creates a decoder with the [`DEFAULT_MAX_BUFFERED`] limit.
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Creates a decoder that gives up on a partial frame after `max_buffered`
    /// bytes.
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffered,
        }
    }

    /// Appends bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        trace!(len = bytes.len(), "frame decoder received bytes");
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be parsed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Returns the next complete frame, the next resynchronisation error, or
    /// `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        match try_decode_frame(&self.buffer) {
            FrameStatus::Complete(frame, consumed) => {
                self.buffer.drain(..consumed);
                debug!(id = frame.id, length = frame.length, "frame complete");
                Some(Ok(frame))
            }
            FrameStatus::Incomplete => {
                if self.buffer.len() > self.max_buffered {
                    let held = self.buffer.len();
                    self.buffer.clear();
                    warn!(held, "frame decoder buffer overflow, discarding");
                    Some(Err(FrameError::BufferOverflow(held)))
                } else {
                    None
                }
            }
            FrameStatus::Invalid { skip, error } => {
                warn!(skip, %error, "discarding bytes to resynchronise");
                self.buffer.drain(..skip);
                Some(Err(error))
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
