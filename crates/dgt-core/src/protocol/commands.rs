//! Host-to-board commands.
//!
//! Most commands are a single byte. Two carry data:
//!
//! ```text
//! SET_LEDS       [0x60][0x04][pattern][start][end][0x00]
//! CLOCK_MESSAGE  [0x2b][size][0x03][sub-command][content…][0x00]   size = content + 3
//! ```
//!
//! Encoding is pure. Waiting for a clock ack before the next clock command is
//! the job of [`crate::domain::clock::ClockGate`].

use crate::protocol::segments::{self, RenderError, DISPLAY_WIDTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Command codes ─────────────────────────────────────────────────────────────

pub const DGT_SEND_RESET: u8 = 0x40;
pub const DGT_SEND_CLK: u8 = 0x41;
pub const DGT_SEND_BRD: u8 = 0x42;
pub const DGT_SEND_UPDATE: u8 = 0x43;
pub const DGT_SEND_UPDATE_BRD: u8 = 0x44;
pub const DGT_RETURN_SERIALNR: u8 = 0x45;
pub const DGT_RETURN_BUSADRES: u8 = 0x46;
pub const DGT_SEND_TRADEMARK: u8 = 0x47;
pub const DGT_SEND_EE_MOVES: u8 = 0x49;
pub const DGT_TO_BUSMODE: u8 = 0x4a;
pub const DGT_SEND_UPDATE_NICE: u8 = 0x4b;
pub const DGT_SEND_BATTERY_STATUS: u8 = 0x4c;
pub const DGT_SEND_VERSION: u8 = 0x4d;
pub const DGT_STARTBOOTLOADER: u8 = 0x4e;
pub const DGT_SEND_BRD_50B: u8 = 0x50;
pub const DGT_SCAN_50B: u8 = 0x51;
pub const DGT_SEND_BRD_50W: u8 = 0x52;
pub const DGT_SCAN_50W: u8 = 0x53;
pub const DGT_SCAN_100: u8 = 0x54;
pub const DGT_RETURN_LONG_SERIALNR: u8 = 0x55;
pub const DGT_SET_LEDS: u8 = 0x60;
pub const DGT_CLOCK_MESSAGE: u8 = 0x2b;

const CLOCK_START_MESSAGE: u8 = 0x03;
const CLOCK_END_MESSAGE: u8 = 0x00;

/// Errors raised while building a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("field {0} is outside 0..=63")]
    FieldOutOfRange(u8),

    #[error("text of {len} characters does not fit in {max}")]
    TextTooLong { len: usize, max: usize },

    #[error("character {0:?} cannot be shown on the clock")]
    UnsupportedCharacter(char),

    #[error("clock time {hours}:{minutes:02}:{seconds:02} is out of range")]
    TimeOutOfRange { hours: u8, minutes: u8, seconds: u8 },

    #[error("beep value {0} is outside 0..=15")]
    BeepOutOfRange(u8),
}

impl From<RenderError> for CommandError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::TooLong(len) => CommandError::TextTooLong {
                len,
                max: DISPLAY_WIDTH,
            },
            RenderError::Unsupported(c) => CommandError::UnsupportedCharacter(c),
        }
    }
}

// ── Flag newtypes ─────────────────────────────────────────────────────────────

/// Dots, colons and '1' segments of the DGT XL display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplayIcons(pub u8);

impl DisplayIcons {
    pub const NONE: Self = Self(0x00);
    pub const RIGHT_DOT: Self = Self(0x01);
    pub const RIGHT_COLON: Self = Self(0x02);
    pub const RIGHT_ONE: Self = Self(0x04);
    pub const LEFT_DOT: Self = Self(0x08);
    pub const LEFT_COLON: Self = Self(0x10);
    pub const LEFT_ONE: Self = Self(0x20);

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Run-mode bits of a set-and-run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunMode(pub u8);

impl RunMode {
    pub const LEFT_DOWN: Self = Self(0x01);
    pub const RIGHT_DOWN: Self = Self(0x02);
    pub const PAUSE: Self = Self(0x04);
    pub const TOGGLE_ON_LEVER: Self = Self(0x08);

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Hours, minutes and seconds for one side of a set-and-run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClockSetting {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl ClockSetting {
    pub fn new(hours: u8, minutes: u8, seconds: u8) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    fn validate(&self) -> Result<(), CommandError> {
        if self.hours > 9 || self.minutes > 59 || self.seconds > 59 {
            return Err(CommandError::TimeOutOfRange {
                hours: self.hours,
                minutes: self.minutes,
                seconds: self.seconds,
            });
        }
        Ok(())
    }
}

// ── Clock sub-commands ────────────────────────────────────────────────────────

/// A command forwarded by the board to the attached clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockCommand {
    /// Raw segments for positions A..F, left to right.
    Display {
        segments: [u8; DISPLAY_WIDTH],
        icons: DisplayIcons,
        beep: bool,
    },
    /// Icon data bytes 0..=4 (time-control symbols, periods, flags, specials).
    Icons([u8; 5]),
    /// Return to the normal time display.
    End,
    /// Ask for the button currently pressed.
    Button,
    /// Ask for the clock firmware version.
    Version,
    /// Set both times and start counting (clock must be in mode 23).
    SetAndRun {
        left: ClockSetting,
        right: ClockSetting,
        mode: RunMode,
    },
    /// Beep for `units` × 64 ms.
    Beep(u8),
    /// Eight characters of text for the DGT3000, and a beep value 0..=15.
    Ascii { text: [u8; 8], beep: u8 },
}

impl ClockCommand {
    /// Renders `text` on the DGT XL 7-segment display.
    ///
    /// # Errors
    ///
    /// [`CommandError::TextTooLong`] beyond six characters and
    /// [`CommandError::UnsupportedCharacter`] for characters without a glyph.
    pub fn display_text(text: &str, icons: DisplayIcons, beep: bool) -> Result<Self, CommandError> {
        Ok(ClockCommand::Display {
            segments: segments::render(text)?,
            icons,
            beep,
        })
    }

    /// Builds a DGT3000 text command, padding with blanks.
    ///
    /// # Errors
    ///
    /// [`CommandError::TextTooLong`] beyond eight characters and
    /// [`CommandError::UnsupportedCharacter`] for non-ASCII or control characters.
    pub fn ascii_text(text: &str, beep: u8) -> Result<Self, CommandError> {
        let len = text.chars().count();
        if len > 8 {
            return Err(CommandError::TextTooLong { len, max: 8 });
        }
        let mut buf = [b' '; 8];
        for (slot, c) in buf.iter_mut().zip(text.chars()) {
            if !(c.is_ascii_graphic() || c == ' ') {
                return Err(CommandError::UnsupportedCharacter(c));
            }
            *slot = c as u8;
        }
        Ok(ClockCommand::Ascii { text: buf, beep })
    }

    /// Sub-command id; the clock echoes it in `ack1` of its answer.
    pub fn sub_code(&self) -> u8 {
        match self {
            ClockCommand::Display { .. } => 0x01,
            ClockCommand::Icons(_) => 0x02,
            ClockCommand::End => 0x03,
            ClockCommand::Button => 0x08,
            ClockCommand::Version => 0x09,
            ClockCommand::SetAndRun { .. } => 0x0a,
            ClockCommand::Beep(_) => 0x0b,
            ClockCommand::Ascii { .. } => 0x0c,
        }
    }

    fn content(&self) -> Result<Vec<u8>, CommandError> {
        Ok(match self {
            ClockCommand::Display {
                segments: s,
                icons,
                beep,
            } => vec![
                s[2],
                s[1],
                s[0],
                s[5],
                s[4],
                s[3],
                icons.0,
                if *beep { 0x03 } else { 0x01 },
            ],
            ClockCommand::Icons(data) => {
                let mut v = data.to_vec();
                v.extend_from_slice(&[0, 0, 0]);
                v
            }
            ClockCommand::End | ClockCommand::Button | ClockCommand::Version => Vec::new(),
            ClockCommand::SetAndRun { left, right, mode } => {
                left.validate()?;
                right.validate()?;
                vec![
                    left.hours,
                    left.minutes,
                    left.seconds,
                    right.hours,
                    right.minutes,
                    right.seconds,
                    mode.0,
                ]
            }
            ClockCommand::Beep(units) => vec![*units],
            ClockCommand::Ascii { text, beep } => {
                if *beep > 15 {
                    return Err(CommandError::BeepOutOfRange(*beep));
                }
                let mut v = text.to_vec();
                v.push(*beep);
                v
            }
        })
    }

    /// Wire bytes of the wrapped clock message.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        let content = self.content()?;
        let mut buf = Vec::with_capacity(content.len() + 5);
        buf.push(DGT_CLOCK_MESSAGE);
        buf.push((content.len() + 3) as u8);
        buf.push(CLOCK_START_MESSAGE);
        buf.push(self.sub_code());
        buf.extend_from_slice(&content);
        buf.push(CLOCK_END_MESSAGE);
        Ok(buf)
    }
}

// ── Board commands ────────────────────────────────────────────────────────────

/// A command sent to a board in single-board mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Reset,
    SendClock,
    SendBoard,
    SendUpdate,
    SendUpdateBoard,
    SendSerialNumber,
    SendBusAddress,
    SendTrademark,
    SendEeMoves,
    SendUpdateNice,
    SendBatteryStatus,
    SendVersion,
    SendBoard50Black,
    Scan50Black,
    SendBoard50White,
    Scan50White,
    Scan100,
    SendLongSerialNumber,
    ToBusMode,
    StartBootloader,
    /// Revelation II LED pattern over fields `start..=end`.
    SetLeds { pattern: u8, start: u8, end: u8 },
    Clock(ClockCommand),
}

impl Command {
    /// Looks up a parameterless command by its code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            DGT_SEND_RESET => Command::Reset,
            DGT_SEND_CLK => Command::SendClock,
            DGT_SEND_BRD => Command::SendBoard,
            DGT_SEND_UPDATE => Command::SendUpdate,
            DGT_SEND_UPDATE_BRD => Command::SendUpdateBoard,
            DGT_RETURN_SERIALNR => Command::SendSerialNumber,
            DGT_RETURN_BUSADRES => Command::SendBusAddress,
            DGT_SEND_TRADEMARK => Command::SendTrademark,
            DGT_SEND_EE_MOVES => Command::SendEeMoves,
            DGT_TO_BUSMODE => Command::ToBusMode,
            DGT_SEND_UPDATE_NICE => Command::SendUpdateNice,
            DGT_SEND_BATTERY_STATUS => Command::SendBatteryStatus,
            DGT_SEND_VERSION => Command::SendVersion,
            DGT_STARTBOOTLOADER => Command::StartBootloader,
            DGT_SEND_BRD_50B => Command::SendBoard50Black,
            DGT_SCAN_50B => Command::Scan50Black,
            DGT_SEND_BRD_50W => Command::SendBoard50White,
            DGT_SCAN_50W => Command::Scan50White,
            DGT_SCAN_100 => Command::Scan100,
            DGT_RETURN_LONG_SERIALNR => Command::SendLongSerialNumber,
            _ => return None,
        })
    }

    /// First byte on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Command::Reset => DGT_SEND_RESET,
            Command::SendClock => DGT_SEND_CLK,
            Command::SendBoard => DGT_SEND_BRD,
            Command::SendUpdate => DGT_SEND_UPDATE,
            Command::SendUpdateBoard => DGT_SEND_UPDATE_BRD,
            Command::SendSerialNumber => DGT_RETURN_SERIALNR,
            Command::SendBusAddress => DGT_RETURN_BUSADRES,
            Command::SendTrademark => DGT_SEND_TRADEMARK,
            Command::SendEeMoves => DGT_SEND_EE_MOVES,
            Command::SendUpdateNice => DGT_SEND_UPDATE_NICE,
            Command::SendBatteryStatus => DGT_SEND_BATTERY_STATUS,
            Command::SendVersion => DGT_SEND_VERSION,
            Command::SendBoard50Black => DGT_SEND_BRD_50B,
            Command::Scan50Black => DGT_SCAN_50B,
            Command::SendBoard50White => DGT_SEND_BRD_50W,
            Command::Scan50White => DGT_SCAN_50W,
            Command::Scan100 => DGT_SCAN_100,
            Command::SendLongSerialNumber => DGT_RETURN_LONG_SERIALNR,
            Command::ToBusMode => DGT_TO_BUSMODE,
            Command::StartBootloader => DGT_STARTBOOTLOADER,
            Command::SetLeds { .. } => DGT_SET_LEDS,
            Command::Clock(_) => DGT_CLOCK_MESSAGE,
        }
    }

    pub fn is_clock(&self) -> bool {
        matches!(self, Command::Clock(_))
    }

    /// Serialises the command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when a parameter is out of range.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dgt_core::protocol::commands::{ClockCommand, Command};
    ///
    /// assert_eq!(Command::SendBoard.encode().unwrap(), vec![0x42]);
    /// assert_eq!(
    ///     Command::Clock(ClockCommand::Beep(16)).encode().unwrap(),
    ///     vec![0x2b, 0x04, 0x03, 0x0b, 0x10, 0x00]
    /// );
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        match self {
            Command::SetLeds { pattern, start, end } => {
                for &field in [start, end] {
                    if field > 63 {
                        return Err(CommandError::FieldOutOfRange(field));
                    }
                }
                Ok(vec![DGT_SET_LEDS, 0x04, *pattern, *start, *end, 0x00])
            }
            Command::Clock(clock) => clock.encode(),
            other => Ok(vec![other.code()]),
        }
    }
}
