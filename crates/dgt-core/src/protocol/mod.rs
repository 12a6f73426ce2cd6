//! Wire-level codecs for the DGT board and clock protocol.
//!
//! Bytes flow through these layers from the bottom up:
//!
//! - [`frame`] splits the raw byte stream into frames and resynchronises
//!   after garbage.
//! - [`codec`] turns a frame into a typed [`Message`].
//! - [`clock`] and [`eeprom`] decode the two payloads with an inner format of
//!   their own (BWTIME readings/acks and the logged event stream).
//! - [`commands`] and [`segments`] encode the host-to-device direction.
//! - [`bus`] adds the addressed, checksummed envelope used when several
//!   boards share one line.

pub mod bus;
pub mod clock;
pub mod codec;
pub mod commands;
pub mod eeprom;
pub mod frame;
pub mod messages;
pub mod segments;

pub use clock::{AckKind, ClockAck, ClockReading, ClockTime};
pub use codec::{decode, ProtocolError};
pub use commands::{ClockCommand, Command, CommandError};
pub use eeprom::{EepromError, EepromEvent};
pub use frame::{encode_frame, Frame, FrameDecoder, FrameError};
pub use messages::{Message, MessageId, Piece};
