//! # dgt-core
//!
//! Protocol library for DGT electronic chess and draughts boards and the DGT
//! clocks attached to them. It turns the byte stream a board sends into typed
//! messages, keeps the reconstructed position and clock state, and encodes the
//! commands the host sends back.
//!
//! The crate does no I/O. Callers own the serial port, USB or Bluetooth link
//! and move bytes in and out of a [`Session`] (one board) or a
//! [`protocol::bus::BusMaster`] (several boards on one line).
//!
//! # Architecture overview (for beginners)
//!
//! A board answers the host with *messages*: a 3-byte header (id with the top
//! bit set, then a 14-bit total length split over two 7-bit bytes) followed by
//! a payload whose bytes all have the top bit clear. Because only a header
//! byte can have the top bit set, a reader that lost its place can always find
//! the next message.
//!
//! - **`protocol`**: bytes to frames to messages, plus the inner formats (clock
//!   readings and acks, the logged event stream), command encoding and the
//!   addressed bus variant.
//!
//! - **`domain`**: the state built from messages. The board reconstructor
//!   applies piece changes and recognises special positions; the clock state
//!   and gate track readings and the one outstanding clock command.
//!
//! - **`session`**: glues the two together for one board connection.
//!
//! - **`config`**: the timing and limit settings, loadable from TOML.
//!
//! # Example
//!
//! ```rust
//! use dgt_core::{Message, Piece, Session, SessionEvent};
//!
//! let mut session = Session::default();
//! session.feed(&[0x8e, 0x00, 0x05, 0x04, 0x01]);
//!
//! let event = session.poll().unwrap().unwrap();
//! assert_eq!(
//!     event,
//!     SessionEvent::Message(Message::FieldUpdate { field: 4, piece: Piece::WhitePawn })
//! );
//! ```

pub mod config;
pub mod domain;
pub mod protocol;
pub mod session;

pub use config::{ConfigError, ProtocolConfig};
pub use domain::board::{BoardError, BoardState, PositionTag, Reconstructor};
pub use domain::clock::{ClockGate, ClockState};
pub use protocol::codec::{decode, ProtocolError};
pub use protocol::frame::{encode_frame, Frame, FrameDecoder, FrameError};
pub use protocol::messages::{Message, MessageId, Piece};
pub use session::{Session, SessionEvent};
