//! Decoder for the board's internal event log (EE_MOVES and bus change data).
//!
//! The log has no length prefixes: the kind of each record is read off its
//! first byte.
//!
//! ```text
//! 0x40..=0x5f          field change   [0t0r nnnn][00ii iiii]   t=1, r=fast, n=piece, i=field
//! 0x60..=0x69, 0x70..=0x79
//!                      time tag       [0uuf hhhh][0MMM mmmm][0SSS ssss]   f=left clock
//! 0x6a..=0x6f, 0x7a..=0x7f, 0x00
//!                      one-byte tag
//! ```
//!
//! Events come out oldest first. A full EEPROM download always ends with
//! `EE_EOF`; the change batches returned in bus mode do not.

use crate::protocol::clock::ClockSide;
use crate::protocol::messages::Piece;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

// ── One-byte tag codes ────────────────────────────────────────────────────────

pub const EE_POWERUP: u8 = 0x6a;
pub const EE_EOF: u8 = 0x6b;
pub const EE_FOURROWS: u8 = 0x6c;
pub const EE_EMPTYBOARD: u8 = 0x6d;
pub const EE_DOWNLOADED: u8 = 0x6e;
pub const EE_BEGINPOS: u8 = 0x6f;
pub const EE_BEGINPOS_ROT: u8 = 0x7a;
pub const EE_START_TAG: u8 = 0x7b;
pub const EE_WATCHDOG_ACTION: u8 = 0x7c;
pub const EE_FUTURE_1: u8 = 0x7d;
pub const EE_FUTURE_2: u8 = 0x7e;
pub const EE_NOP: u8 = 0x7f;
pub const EE_NOP2: u8 = 0x00;

const FIELD_CHANGE_FAST: u8 = 0x10;
const TIME_TAG_LEFT: u8 = 0x10;

/// One record of the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EepromEvent {
    /// A field changed; `piece` is `Empty` when a piece was lifted.
    FieldChange { field: u8, piece: Piece, fast: bool },
    /// Time on the clock side that was just halted.
    TimeTag {
        side: ClockSide,
        hours: u8,
        minutes: u8,
        seconds: u8,
    },
    PowerUp,
    Eof,
    FourRows,
    EmptyBoard,
    Downloaded,
    BeginPosition,
    BeginPositionRotated,
    StartTag,
    WatchdogAction,
    /// 0x7d or 0x7e.
    Reserved(u8),
    /// 0x7f or 0x00.
    Nop,
}

impl EepromEvent {
    /// Maps a one-byte tag code; `None` for any other byte.
    pub fn from_tag(code: u8) -> Option<Self> {
        Some(match code {
            EE_POWERUP => EepromEvent::PowerUp,
            EE_EOF => EepromEvent::Eof,
            EE_FOURROWS => EepromEvent::FourRows,
            EE_EMPTYBOARD => EepromEvent::EmptyBoard,
            EE_DOWNLOADED => EepromEvent::Downloaded,
            EE_BEGINPOS => EepromEvent::BeginPosition,
            EE_BEGINPOS_ROT => EepromEvent::BeginPositionRotated,
            EE_START_TAG => EepromEvent::StartTag,
            EE_WATCHDOG_ACTION => EepromEvent::WatchdogAction,
            EE_FUTURE_1 | EE_FUTURE_2 => EepromEvent::Reserved(code),
            EE_NOP | EE_NOP2 => EepromEvent::Nop,
            _ => return None,
        })
    }
}

/// How the first byte of a record classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    FieldChange,
    TimeTag,
    Tag,
}

impl RecordKind {
    /// Classifies a leading byte; `None` if no record starts with it.
    pub fn of(lead: u8) -> Option<Self> {
        match lead {
            0x40..=0x5f => Some(RecordKind::FieldChange),
            0x60..=0x69 | 0x70..=0x79 => Some(RecordKind::TimeTag),
            0x6a..=0x6f | 0x7a..=0x7f | EE_NOP2 => Some(RecordKind::Tag),
            _ => None,
        }
    }

    /// Record size in bytes, leading byte included.
    pub fn size(self) -> usize {
        match self {
            RecordKind::FieldChange => 2,
            RecordKind::TimeTag => 3,
            RecordKind::Tag => 1,
        }
    }
}

/// Reasons the event log could not be decoded to its end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EepromError {
    /// A byte that cannot appear at this point of a record.
    #[error("unexpected byte 0x{byte:02X} at offset {offset}")]
    Corrupt { offset: usize, byte: u8 },

    /// The buffer ends inside a record.
    #[error("record starting at offset {offset} is cut short")]
    Truncated { offset: usize },

    /// The buffer ends without an EE_EOF tag.
    #[error("log of {0} bytes ends without EE_EOF")]
    MissingEof(usize),
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// Lazy iterator over the records of a captured log.
///
/// Yields each event in log order. Decoding stops after `Eof` or after the
/// first error; the iterator is fused from then on.
#[derive(Debug, Clone)]
pub struct EventStream<'a> {
    bytes: &'a [u8],
    pos: usize,
    require_eof: bool,
    done: bool,
}

impl<'a> EventStream<'a> {
    /// Byte offset of the next record.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn fail(&mut self, error: EepromError) -> Option<Result<EepromEvent, EepromError>> {
        self.done = true;
        Some(Err(error))
    }
}

impl Iterator for EventStream<'_> {
    type Item = Result<EepromEvent, EepromError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let start = self.pos;
        let Some(&lead) = self.bytes.get(start) else {
            self.done = true;
            return if self.require_eof {
                Some(Err(EepromError::MissingEof(self.bytes.len())))
            } else {
                None
            };
        };

        let Some(kind) = RecordKind::of(lead) else {
            return self.fail(EepromError::Corrupt {
                offset: start,
                byte: lead,
            });
        };
        let Some(record) = self.bytes.get(start..start + kind.size()) else {
            return self.fail(EepromError::Truncated { offset: start });
        };

        let event = match kind {
            RecordKind::FieldChange => {
                let field = record[1];
                if field > 0x3f {
                    return self.fail(EepromError::Corrupt {
                        offset: start + 1,
                        byte: field,
                    });
                }
                EepromEvent::FieldChange {
                    field,
                    piece: Piece::from_nibble(lead),
                    fast: lead & FIELD_CHANGE_FAST != 0,
                }
            }
            RecordKind::TimeTag => {
                let decoded = (bcd(record[1]), bcd(record[2]));
                let (Some(minutes), Some(seconds)) = decoded else {
                    let bad = if decoded.0.is_none() { 1 } else { 2 };
                    return self.fail(EepromError::Corrupt {
                        offset: start + bad,
                        byte: record[bad],
                    });
                };
                EepromEvent::TimeTag {
                    side: if lead & TIME_TAG_LEFT != 0 {
                        ClockSide::Left
                    } else {
                        ClockSide::Right
                    },
                    hours: lead & 0x0f,
                    minutes,
                    seconds,
                }
            }
            RecordKind::Tag => match EepromEvent::from_tag(lead) {
                Some(event) => event,
                None => {
                    return self.fail(EepromError::Corrupt {
                        offset: start,
                        byte: lead,
                    })
                }
            },
        };

        self.pos = start + kind.size();
        if event == EepromEvent::Eof {
            self.done = true;
        }
        trace!(offset = start, ?event, "eeprom record");
        Some(Ok(event))
    }
}

impl std::iter::FusedIterator for EventStream<'_> {}

/// Decodes a full EEPROM download, which must end with `EE_EOF`.
///
/// Bytes after the EOF tag are never read.
///
/// # Examples
///
/// ```rust
/// use dgt_core::protocol::eeprom::{decode_stream, EepromEvent};
///
/// let events: Vec<_> = decode_stream(&[0x6a, 0x41, 0x34, 0x6b])
///     .collect::<Result<_, _>>()
///     .unwrap();
/// assert_eq!(events.len(), 3);
/// assert_eq!(events[2], EepromEvent::Eof);
/// ```
pub fn decode_stream(bytes: &[u8]) -> EventStream<'_> {
    EventStream {
        bytes,
        pos: 0,
        require_eof: true,
        done: false,
    }
}

/// Decodes a bus-mode change batch, which ends with the buffer rather than
/// with `EE_EOF`.
pub fn decode_changes(bytes: &[u8]) -> EventStream<'_> {
    EventStream {
        bytes,
        pos: 0,
        require_eof: false,
        done: false,
    }
}

/// Collects a full download, returning every event decoded before the first
/// error together with that error.
pub fn decode_all(bytes: &[u8]) -> (Vec<EepromEvent>, Option<EepromError>) {
    let mut events = Vec::new();
    for item in decode_stream(bytes) {
        match item {
            Ok(event) => events.push(event),
            Err(e) => return (events, Some(e)),
        }
    }
    (events, None)
}

fn bcd(b: u8) -> Option<u8> {
    let (tens, units) = (b >> 4, b & 0x0f);
    (tens <= 5 && units <= 9).then_some(tens * 10 + units)
}
