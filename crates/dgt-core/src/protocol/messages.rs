//! DGT message ids, piece codes and decoded message types.
//!
//! Field numbering follows the board, not the game: field 0 is A8 and field
//! 63 is H1 with the connector on white's left, and the board never renumbers
//! when it is turned around.

use crate::protocol::clock::{ClockAck, ClockTime};
use serde::{Deserialize, Serialize};

// ── Message ids (device → host) ───────────────────────────────────────────────

/// 7-bit message codes; on the wire each is OR'd with the message bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageId {
    BoardDump = 0x06,
    BwTime = 0x0d,
    FieldUpdate = 0x0e,
    EeMoves = 0x0f,
    BusAddress = 0x10,
    SerialNumber = 0x11,
    Trademark = 0x12,
    Version = 0x13,
    BoardDump50Black = 0x14,
    BoardDump50White = 0x15,
    BatteryStatus = 0x20,
    LongSerialNumber = 0x22,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    /// Accepts the code with or without the message bit.
    fn try_from(value: u8) -> Result<Self, ()> {
        match value & 0x7f {
            0x06 => Ok(MessageId::BoardDump),
            0x0d => Ok(MessageId::BwTime),
            0x0e => Ok(MessageId::FieldUpdate),
            0x0f => Ok(MessageId::EeMoves),
            0x10 => Ok(MessageId::BusAddress),
            0x11 => Ok(MessageId::SerialNumber),
            0x12 => Ok(MessageId::Trademark),
            0x13 => Ok(MessageId::Version),
            0x14 => Ok(MessageId::BoardDump50Black),
            0x15 => Ok(MessageId::BoardDump50White),
            0x20 => Ok(MessageId::BatteryStatus),
            0x22 => Ok(MessageId::LongSerialNumber),
            _ => Err(()),
        }
    }
}

// ── Frame sizes (header included) ─────────────────────────────────────────────

pub const SIZE_BOARD_DUMP: usize = 67;
pub const SIZE_BOARD_DUMP_DRAUGHTS: usize = 103;
pub const SIZE_BOARD_DUMP_50: usize = 53;
pub const SIZE_BWTIME: usize = 10;
pub const SIZE_FIELD_UPDATE: usize = 5;
pub const SIZE_BUS_ADDRESS: usize = 5;
pub const SIZE_VERSION: usize = 5;
pub const SIZE_LONG_SERIAL_NUMBER: usize = 13;
pub const SIZE_BATTERY_STATUS_MIN: usize = 7;
pub const SIZE_BATTERY_STATUS_MAX: usize = 12;

/// Number of fields on a chess board.
pub const FIELD_COUNT: usize = 64;

// ── Pieces ────────────────────────────────────────────────────────────────────

/// Piece code reported for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Piece {
    #[default]
    Empty = 0x00,
    WhitePawn = 0x01,
    WhiteRook = 0x02,
    WhiteKnight = 0x03,
    WhiteBishop = 0x04,
    WhiteKing = 0x05,
    WhiteQueen = 0x06,
    BlackPawn = 0x07,
    BlackRook = 0x08,
    BlackKnight = 0x09,
    BlackBishop = 0x0a,
    BlackKing = 0x0b,
    BlackQueen = 0x0c,
    /// Magic piece: draw.
    MagicDraw = 0x0d,
    /// Magic piece: white wins.
    MagicWhiteWin = 0x0e,
    /// Magic piece: black wins.
    MagicBlackWin = 0x0f,
}

impl Piece {
    // Draughts boards reuse the chess codes.
    pub const WHITE_DISK: Piece = Piece::WhitePawn;
    pub const BLACK_DISK: Piece = Piece::WhiteBishop;
    pub const WHITE_CROWN: Piece = Piece::BlackPawn;
    pub const BLACK_CROWN: Piece = Piece::BlackBishop;

    /// Maps the low nibble of a piece byte; the upper bits are ignored.
    pub fn from_nibble(code: u8) -> Piece {
        match code & 0x0f {
            0x00 => Piece::Empty,
            0x01 => Piece::WhitePawn,
            0x02 => Piece::WhiteRook,
            0x03 => Piece::WhiteKnight,
            0x04 => Piece::WhiteBishop,
            0x05 => Piece::WhiteKing,
            0x06 => Piece::WhiteQueen,
            0x07 => Piece::BlackPawn,
            0x08 => Piece::BlackRook,
            0x09 => Piece::BlackKnight,
            0x0a => Piece::BlackBishop,
            0x0b => Piece::BlackKing,
            0x0c => Piece::BlackQueen,
            0x0d => Piece::MagicDraw,
            0x0e => Piece::MagicWhiteWin,
            _ => Piece::MagicBlackWin,
        }
    }

    /// Raw piece code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// `true` for the three result markers.
    pub fn is_magic(self) -> bool {
        matches!(
            self,
            Piece::MagicDraw | Piece::MagicWhiteWin | Piece::MagicBlackWin
        )
    }

    /// FEN letter for chess pieces; `None` for empty fields and magic pieces.
    pub fn fen_char(self) -> Option<char> {
        match self {
            Piece::WhitePawn => Some('P'),
            Piece::WhiteRook => Some('R'),
            Piece::WhiteKnight => Some('N'),
            Piece::WhiteBishop => Some('B'),
            Piece::WhiteKing => Some('K'),
            Piece::WhiteQueen => Some('Q'),
            Piece::BlackPawn => Some('p'),
            Piece::BlackRook => Some('r'),
            Piece::BlackKnight => Some('n'),
            Piece::BlackBishop => Some('b'),
            Piece::BlackKing => Some('k'),
            Piece::BlackQueen => Some('q'),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Piece {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value > 0x0f {
            Err(())
        } else {
            Ok(Piece::from_nibble(value))
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// Which colour of squares a 50-square draughts dump covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquareColor {
    Black,
    White,
}

/// BATTERY_STATUS (0x20): Bluetooth board battery report.
///
/// Fields after the capacity are only present when the declared length
/// covers them. Times the board cannot estimate are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Remaining capacity in percent.
    pub capacity_percent: u8,
    /// Running or charging time left as (hours, minutes).
    pub time_left: Option<(u8, u8)>,
    /// Time switched on as (hours, minutes).
    pub on_time: Option<(u8, u8)>,
    /// Standby time as (days, hours, minutes).
    pub standby_time: Option<(u8, u8, u8)>,
    pub charging: bool,
    pub discharging: bool,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// A decoded device-to-host message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// BOARD_DUMP: all 64 fields in device numbering.
    BoardDump(Vec<Piece>),
    /// BOARD_DUMP of a 10x10 draughts board: 100 raw field codes.
    DraughtsBoardDump(Vec<u8>),
    /// BOARD_DUMP_50B / BOARD_DUMP_50W: 50 raw field codes.
    HalfBoardDump { squares: SquareColor, fields: Vec<u8> },
    /// BWTIME carrying clock times.
    ClockTime(ClockTime),
    /// BWTIME carrying a clock command acknowledgement.
    ClockAck(ClockAck),
    /// BWTIME with an all-zero payload; carries no reading.
    EmptyClockTime,
    /// FIELD_UPDATE: one field changed.
    FieldUpdate { field: u8, piece: Piece },
    /// EE_MOVES: the raw EEPROM log, decode with [`crate::protocol::eeprom::decode_stream`].
    EeMoves(Vec<u8>),
    /// BUSADRES: the 14-bit bus address.
    BusAddress(u16),
    /// SERIALNR: decimal serial number.
    SerialNumber(String),
    /// LONG_SERIALNR: ten-character serial number.
    LongSerialNumber(String),
    /// TRADEMARK: identification text.
    Trademark(String),
    /// VERSION: firmware version.
    Version { major: u8, minor: u8 },
    /// BATTERY_STATUS.
    BatteryStatus(BatteryStatus),
    /// A message id this decoder does not know.
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// The 7-bit message code this message was decoded from.
    pub fn id(&self) -> u8 {
        match self {
            Message::BoardDump(_) | Message::DraughtsBoardDump(_) => MessageId::BoardDump as u8,
            Message::HalfBoardDump {
                squares: SquareColor::Black,
                ..
            } => MessageId::BoardDump50Black as u8,
            Message::HalfBoardDump {
                squares: SquareColor::White,
                ..
            } => MessageId::BoardDump50White as u8,
            Message::ClockTime(_) | Message::ClockAck(_) | Message::EmptyClockTime => {
                MessageId::BwTime as u8
            }
            Message::FieldUpdate { .. } => MessageId::FieldUpdate as u8,
            Message::EeMoves(_) => MessageId::EeMoves as u8,
            Message::BusAddress(_) => MessageId::BusAddress as u8,
            Message::SerialNumber(_) => MessageId::SerialNumber as u8,
            Message::LongSerialNumber(_) => MessageId::LongSerialNumber as u8,
            Message::Trademark(_) => MessageId::Trademark as u8,
            Message::Version { .. } => MessageId::Version as u8,
            Message::BatteryStatus(_) => MessageId::BatteryStatus as u8,
            Message::Unknown { id, .. } => *id & 0x7f,
        }
    }
}
