//! BWTIME sub-decoder: clock times versus clock command acknowledgements.
//!
//! Every BWTIME frame carries a 7-byte payload. When the low nibble of byte 0
//! or byte 3 is `0x0a` (an impossible hours value) the payload is a clock ack
//! whose four bytes are spread over the seven payload bytes; otherwise it is a
//! clock times report.
//!
//! # Ack layout (for beginners)
//!
//! The ack bytes need all eight bits, but the frame is 7-bit clean. The clock
//! therefore ships the low seven bits of each ack byte in its own payload byte
//! and tucks the four missing top bits into bytes 0 and 3:
//!
//! ```text
//! ack0 = b1 | bit 4 of b3      ack2 = b4 | bit 4 of b0
//! ack1 = b2 | bit 5 of b3      ack3 = b5 | bit 5 of b0
//! ```

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{MessageId, SIZE_BWTIME};
use serde::{Deserialize, Serialize};

/// Payload size of a BWTIME frame.
pub const BWTIME_PAYLOAD_SIZE: usize = SIZE_BWTIME - 3;

/// Low nibble that marks a payload as an acknowledgement.
const ACK_NIBBLE: u8 = 0x0a;

/// `ack0` of a normal acknowledgement.
pub const ACK0_OK: u8 = 0x10;
/// `ack0` of a rejected command.
pub const ACK0_ERROR: u8 = 0x40;

// ── Sides and clock times ─────────────────────────────────────────────────────

/// Player side as seen from the front of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockSide {
    Left,
    Right,
}

/// Time and flags for one player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerClock {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    /// Flag fallen and clock blocked at zero.
    pub flag_fallen: bool,
    /// Bronstein/Fischer time-per-move indicator shown.
    pub per_move_indicator: bool,
    /// Flag fallen and shown on the display; the clock may still run.
    pub flag_displayed: bool,
}

impl PlayerClock {
    /// Remaining time in seconds.
    pub fn total_seconds(&self) -> u32 {
        u32::from(self.hours) * 3600 + u32::from(self.minutes) * 60 + u32::from(self.seconds)
    }

    fn is_valid(&self) -> bool {
        self.hours <= 9 && self.minutes <= 59 && self.seconds <= 59
    }

    fn decode(bytes: &[u8], strict: bool) -> Result<Self, ProtocolError> {
        let flags = bytes[0];
        let bcd = |b: u8, what: &str| match bcd_to_binary(b) {
            Some(v) => Ok(v),
            None if !strict => Ok(0),
            None => Err(ProtocolError::MalformedPayload(format!(
                "clock {what} byte 0x{b:02X} is not BCD"
            ))),
        };
        Ok(Self {
            hours: flags & 0x0f,
            minutes: bcd(bytes[1], "minutes")?,
            seconds: bcd(bytes[2], "seconds")?,
            flag_fallen: flags & 0x10 != 0,
            per_move_indicator: flags & 0x20 != 0,
            flag_displayed: flags & 0x40 != 0,
        })
    }
}

/// Whose clock is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Turn {
    Idle,
    Left,
    Right,
}

/// Shared status byte of a clock times report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockStatus {
    /// Clock running (not stopped by start/stop).
    pub running: bool,
    /// Tumbler high on the right player's side.
    pub tumbler_right_high: bool,
    pub battery_low: bool,
    pub right_to_move: bool,
    pub left_to_move: bool,
    /// No clock connected; the times are meaningless.
    pub invalid_reading: bool,
}

impl ClockStatus {
    fn from_byte(b: u8) -> Self {
        Self {
            running: b & 0x01 != 0,
            tumbler_right_high: b & 0x02 != 0,
            battery_low: b & 0x04 != 0,
            right_to_move: b & 0x08 != 0,
            left_to_move: b & 0x10 != 0,
            invalid_reading: b & 0x20 != 0,
        }
    }

    /// Side to move, or `Idle` when neither turn bit is set.
    pub fn turn(&self) -> Turn {
        match (self.left_to_move, self.right_to_move) {
            (true, false) => Turn::Left,
            (false, true) => Turn::Right,
            _ => Turn::Idle,
        }
    }

    /// The side whose tumbler is up.
    pub fn tumbler_high(&self) -> ClockSide {
        if self.tumbler_right_high {
            ClockSide::Right
        } else {
            ClockSide::Left
        }
    }
}

/// A clock times report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockTime {
    pub left: PlayerClock,
    pub right: PlayerClock,
    pub status: ClockStatus,
}

impl ClockTime {
    /// `true` when a clock is connected and every time field is in range.
    pub fn is_valid(&self) -> bool {
        !self.status.invalid_reading && self.left.is_valid() && self.right.is_valid()
    }

    pub fn player(&self, side: ClockSide) -> &PlayerClock {
        match side {
            ClockSide::Left => &self.left,
            ClockSide::Right => &self.right,
        }
    }
}

// ── Acknowledgements ──────────────────────────────────────────────────────────

/// Clock button reported by an auto-generated button ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockButton {
    Back,
    Plus,
    Run,
    Minus,
    Ok,
    /// Back and OK held together.
    BackAndOk,
    Other(u8),
}

/// Meaning of a clock ack, selected by `ack1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    // Auto-generated
    Ready,
    ButtonPressed(ClockButton),
    Mode(u8),
    NotInMode,
    // Responses to commands
    Display,
    Icons,
    End,
    Button,
    Version { major: u8, minor: u8 },
    SetAndRun,
    Beep,
    Ascii,
    Unrecognised(u8),
}

/// Four reconstructed acknowledgement bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockAck {
    pub ack0: u8,
    pub ack1: u8,
    pub ack2: u8,
    pub ack3: u8,
}

impl ClockAck {
    /// Reassembles the ack from a 7-byte BWTIME payload.
    pub fn from_payload(b: &[u8; BWTIME_PAYLOAD_SIZE]) -> Self {
        Self {
            ack0: (b[1] & 0x7f) | ((b[3] << 3) & 0x80),
            ack1: (b[2] & 0x7f) | ((b[3] << 2) & 0x80),
            ack2: (b[4] & 0x7f) | ((b[0] << 3) & 0x80),
            ack3: (b[5] & 0x7f) | ((b[0] << 2) & 0x80),
        }
    }

    /// Any `ack0` other than the normal `0x10`.
    pub fn is_error(&self) -> bool {
        self.ack0 != ACK0_OK
    }

    /// The clock refused the command (e.g. set-and-run outside mode 23).
    pub fn is_rejected(&self) -> bool {
        self.ack0 == ACK0_ERROR
    }

    /// Generated by the clock itself rather than answering a command.
    pub fn is_unsolicited(&self) -> bool {
        self.ack1 & 0x80 != 0
    }

    /// The clock sub-command this ack answers, if it is a response.
    pub fn answered_command(&self) -> Option<u8> {
        (!self.is_unsolicited()).then_some(self.ack1)
    }

    pub fn kind(&self) -> AckKind {
        match self.ack1 {
            0x81 => AckKind::Ready,
            0x88 => AckKind::ButtonPressed(self.button()),
            0x8a => AckKind::Mode(self.ack3),
            0x90 => AckKind::NotInMode,
            0x01 => AckKind::Display,
            0x02 => AckKind::Icons,
            0x03 => AckKind::End,
            0x08 => AckKind::Button,
            0x09 => AckKind::Version {
                major: self.ack2 >> 4,
                minor: self.ack2 & 0x0f,
            },
            0x0a => AckKind::SetAndRun,
            0x0b => AckKind::Beep,
            0x0c => AckKind::Ascii,
            other => AckKind::Unrecognised(other),
        }
    }

    fn button(&self) -> ClockButton {
        match self.ack3 {
            0x31 => ClockButton::Back,
            0x32 => ClockButton::Plus,
            0x33 => ClockButton::Run,
            0x34 => ClockButton::Minus,
            0x35 if self.ack2 == 69 => ClockButton::BackAndOk,
            0x35 => ClockButton::Ok,
            other => ClockButton::Other(other),
        }
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// The three things a BWTIME payload can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockReading {
    Time(ClockTime),
    Ack(ClockAck),
    /// All-zero payload sent by some firmware after a clock command.
    Empty,
}

/// `true` when the payload holds an ack rather than clock times.
pub fn is_ack_payload(payload: &[u8]) -> bool {
    payload.first().is_some_and(|b| b & 0x0f == ACK_NIBBLE)
        || payload.get(3).is_some_and(|b| b & 0x0f == ACK_NIBBLE)
}

/// Decodes a BWTIME payload (header stripped).
///
/// # Errors
///
/// [`ProtocolError::LengthMismatch`] if the payload is not 7 bytes, and
/// [`ProtocolError::MalformedPayload`] for a valid-flagged reading with non-BCD
/// times or both turn bits set.
pub fn decode_bwtime(payload: &[u8]) -> Result<ClockReading, ProtocolError> {
    let bytes: &[u8; BWTIME_PAYLOAD_SIZE] =
        payload
            .try_into()
            .map_err(|_| ProtocolError::LengthMismatch {
                id: MessageId::BwTime as u8,
                expected_min: SIZE_BWTIME,
                expected_max: SIZE_BWTIME,
                actual: payload.len() + 3,
            })?;

    if bytes.iter().all(|&b| b == 0) {
        return Ok(ClockReading::Empty);
    }
    if is_ack_payload(bytes) {
        return Ok(ClockReading::Ack(ClockAck::from_payload(bytes)));
    }

    let status = ClockStatus::from_byte(bytes[6]);
    let strict = !status.invalid_reading;
    if strict && status.left_to_move && status.right_to_move {
        return Err(ProtocolError::MalformedPayload(
            "clock reports both players to move".into(),
        ));
    }
    Ok(ClockReading::Time(ClockTime {
        right: PlayerClock::decode(&bytes[0..3], strict)?,
        left: PlayerClock::decode(&bytes[3..6], strict)?,
        status,
    }))
}

fn bcd_to_binary(b: u8) -> Option<u8> {
    let (tens, units) = (b >> 4, b & 0x0f);
    (tens <= 9 && units <= 9).then_some(tens * 10 + units)
}
