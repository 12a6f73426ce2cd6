//! Message decoder: maps a complete [`Frame`] to a typed [`Message`].
//!
//! Fixed-size messages are checked against the frame's declared length before
//! any payload byte is read; a mismatch is reported, never truncated or padded.
//! Text and EEPROM payloads accept any length. Ids this decoder does not know
//! come back as [`Message::Unknown`] so newer firmware degrades gracefully.

use std::time::Duration;

use crate::protocol::clock::{decode_bwtime, ClockReading};
use crate::protocol::commands::CommandError;
use crate::protocol::eeprom::EepromError;
use crate::protocol::frame::{join_seven, Frame, FrameError, HEADER_SIZE};
use crate::protocol::messages::{
    BatteryStatus, Message, MessageId, Piece, SquareColor, FIELD_COUNT, SIZE_BATTERY_STATUS_MAX,
    SIZE_BATTERY_STATUS_MIN, SIZE_BOARD_DUMP, SIZE_BOARD_DUMP_50, SIZE_BOARD_DUMP_DRAUGHTS,
    SIZE_BUS_ADDRESS, SIZE_BWTIME, SIZE_FIELD_UPDATE, SIZE_LONG_SERIAL_NUMBER, SIZE_VERSION,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Marker byte for "not available" in battery time fields.
const BATTERY_NOT_AVAILABLE: u8 = 0x7f;

/// Errors surfaced by the protocol engine.
///
/// None of these leave the decoder in an unrecoverable state; only
/// [`ProtocolError::TransportClosed`] ends a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed header or length; the decoder has already resynchronised.
    #[error("invalid frame: {0}")]
    FrameInvalid(#[from] FrameError),

    /// Frame length disagrees with the fixed size for its id.
    #[error(
        "message 0x{id:02X}: expected a total length of {expected_min}..={expected_max} bytes, got {actual}"
    )]
    LengthMismatch {
        id: u8,
        expected_min: usize,
        expected_max: usize,
        actual: usize,
    },

    /// A field value is out of range.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The EEPROM event stream could not be decoded to its end.
    #[error("EEPROM stream corrupt: {0}")]
    EepromStreamCorrupt(#[from] EepromError),

    /// A bus frame's checksum byte does not match its contents.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// No answer arrived within the allowed time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A clock command is still waiting for its acknowledgement.
    #[error("clock command 0x{0:02X} is still awaiting its acknowledgement")]
    ClockBusy(u8),

    /// A command could not be encoded.
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    /// The transport has gone away; the session is over.
    #[error("transport closed")]
    TransportClosed,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one frame into a [`Message`].
///
/// # Errors
///
/// Returns [`ProtocolError::LengthMismatch`] when a fixed-size message has the
/// wrong length and [`ProtocolError::MalformedPayload`] when a field is out of
/// range (a piece code above 0x0f, a field above 63, a bad clock reading).
///
/// # Examples
///
/// ```rust
/// use dgt_core::protocol::codec::decode;
/// use dgt_core::protocol::frame::Frame;
/// use dgt_core::protocol::messages::{Message, Piece};
///
/// let frame = Frame::new(0x0e, vec![0x04, 0x01]).unwrap();
/// assert_eq!(
///     decode(&frame).unwrap(),
///     Message::FieldUpdate { field: 4, piece: Piece::WhitePawn }
/// );
/// ```
pub fn decode(frame: &Frame) -> Result<Message, ProtocolError> {
    let code = frame.message_id();
    let payload = frame.payload.as_slice();
    let total = usize::from(frame.length);
    if total != payload.len() + HEADER_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "frame declares {total} bytes but carries a {}-byte payload",
            payload.len()
        )));
    }

    let Ok(id) = MessageId::try_from(code) else {
        debug!(id = code, len = total, "unknown message id");
        return Ok(Message::Unknown {
            id: code,
            payload: payload.to_vec(),
        });
    };

    let result = decode_known(id, payload, total);
    if let Err(ref e) = result {
        warn!(id = code, error = %e, "message rejected");
    }
    result
}

fn decode_known(id: MessageId, payload: &[u8], total: usize) -> Result<Message, ProtocolError> {
    match id {
        MessageId::BoardDump => {
            if total == SIZE_BOARD_DUMP_DRAUGHTS {
                Ok(Message::DraughtsBoardDump(payload.to_vec()))
            } else {
                require_total(id, total, SIZE_BOARD_DUMP, SIZE_BOARD_DUMP)?;
                decode_pieces(payload).map(Message::BoardDump)
            }
        }
        MessageId::BoardDump50Black | MessageId::BoardDump50White => {
            require_total(id, total, SIZE_BOARD_DUMP_50, SIZE_BOARD_DUMP_50)?;
            let squares = if id == MessageId::BoardDump50Black {
                SquareColor::Black
            } else {
                SquareColor::White
            };
            Ok(Message::HalfBoardDump {
                squares,
                fields: payload.to_vec(),
            })
        }
        MessageId::BwTime => {
            require_total(id, total, SIZE_BWTIME, SIZE_BWTIME)?;
            Ok(match decode_bwtime(payload)? {
                ClockReading::Time(t) => Message::ClockTime(t),
                ClockReading::Ack(a) => Message::ClockAck(a),
                ClockReading::Empty => Message::EmptyClockTime,
            })
        }
        MessageId::FieldUpdate => {
            require_total(id, total, SIZE_FIELD_UPDATE, SIZE_FIELD_UPDATE)?;
            let field = payload[0];
            if usize::from(field) >= FIELD_COUNT {
                return Err(ProtocolError::MalformedPayload(format!(
                    "field update for field {field}, expected 0..=63"
                )));
            }
            Ok(Message::FieldUpdate {
                field,
                piece: piece_from_byte(payload[1])?,
            })
        }
        MessageId::EeMoves => Ok(Message::EeMoves(payload.to_vec())),
        MessageId::BusAddress => {
            require_total(id, total, SIZE_BUS_ADDRESS, SIZE_BUS_ADDRESS)?;
            Ok(Message::BusAddress(join_seven(payload[0], payload[1])))
        }
        MessageId::SerialNumber => Ok(Message::SerialNumber(ascii_text(payload))),
        MessageId::Trademark => Ok(Message::Trademark(ascii_text(payload))),
        MessageId::LongSerialNumber => {
            require_total(id, total, SIZE_LONG_SERIAL_NUMBER, SIZE_LONG_SERIAL_NUMBER)?;
            Ok(Message::LongSerialNumber(ascii_text(payload)))
        }
        MessageId::Version => {
            require_total(id, total, SIZE_VERSION, SIZE_VERSION)?;
            Ok(Message::Version {
                major: payload[0],
                minor: payload[1],
            })
        }
        MessageId::BatteryStatus => {
            require_total(id, total, SIZE_BATTERY_STATUS_MIN, SIZE_BATTERY_STATUS_MAX)?;
            Ok(Message::BatteryStatus(decode_battery(payload)))
        }
    }
}

/// Decodes 64 piece bytes in device field order.
///
/// # Errors
///
/// [`ProtocolError::MalformedPayload`] for a byte that is not a piece code.
pub fn decode_pieces(bytes: &[u8]) -> Result<Vec<Piece>, ProtocolError> {
    if bytes.len() != FIELD_COUNT {
        return Err(ProtocolError::MalformedPayload(format!(
            "board dump: need {FIELD_COUNT} fields, got {}",
            bytes.len()
        )));
    }
    bytes.iter().map(|&b| piece_from_byte(b)).collect()
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_total(
    id: MessageId,
    total: usize,
    expected_min: usize,
    expected_max: usize,
) -> Result<(), ProtocolError> {
    if (expected_min..=expected_max).contains(&total) {
        Ok(())
    } else {
        Err(ProtocolError::LengthMismatch {
            id: id as u8,
            expected_min,
            expected_max,
            actual: total,
        })
    }
}

fn piece_from_byte(b: u8) -> Result<Piece, ProtocolError> {
    Piece::try_from(b)
        .map_err(|_| ProtocolError::MalformedPayload(format!("unknown piece code 0x{b:02X}")))
}

/// Payload bytes are 7-bit, so every byte is already an ASCII char.
fn ascii_text(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string()
}

fn decode_battery(p: &[u8]) -> BatteryStatus {
    let byte = |i: usize| p.get(i).copied();
    let available = |v: u8| v != BATTERY_NOT_AVAILABLE;
    let status = byte(8).unwrap_or(0);
    BatteryStatus {
        capacity_percent: p[0],
        time_left: match (byte(1), byte(2)) {
            (Some(h), Some(m)) if available(h) && available(m) => Some((h, m)),
            _ => None,
        },
        on_time: byte(3).zip(byte(4)),
        standby_time: match (byte(5), byte(6), byte(7)) {
            (Some(d), Some(h), Some(m)) => Some((d, h, m)),
            _ => None,
        },
        charging: status & 0x01 != 0,
        discharging: status & 0x02 != 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::clock::AckKind;

    fn frame(id: u8, payload: &[u8]) -> Frame {
        Frame::new(id, payload.to_vec()).expect("valid frame")
    }

    #[test]
    fn test_field_update_decodes_field_and_piece() {
        let msg = decode(&frame(0x0e, &[0x04, 0x01])).unwrap();
        assert_eq!(
            msg,
            Message::FieldUpdate {
                field: 4,
                piece: Piece::WhitePawn
            }
        );
    }

    #[test]
    fn test_field_update_with_field_out_of_range_is_malformed() {
        let result = decode(&frame(0x0e, &[0x40, 0x01]));
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_board_dump_with_field_update_length_is_mismatch() {
        // Board dump id with a 5-byte frame
        let result = decode(&frame(0x06, &[0x04, 0x01]));
        assert_eq!(
            result,
            Err(ProtocolError::LengthMismatch {
                id: 0x06,
                expected_min: 67,
                expected_max: 67,
                actual: 5
            })
        );
    }

    #[test]
    fn test_board_dump_decodes_all_fields() {
        let mut payload = [0u8; 64];
        payload[0] = 0x08; // black rook on A8
        payload[63] = 0x02; // white rook on H1
        let Message::BoardDump(pieces) = decode(&frame(0x06, &payload)).unwrap() else {
            panic!("expected a board dump");
        };
        assert_eq!(pieces.len(), 64);
        assert_eq!(pieces[0], Piece::BlackRook);
        assert_eq!(pieces[63], Piece::WhiteRook);
        assert_eq!(pieces[10], Piece::Empty);
    }

    #[test]
    fn test_board_dump_rejects_bad_piece_code() {
        let mut payload = [0u8; 64];
        payload[5] = 0x10;
        assert!(matches!(
            decode(&frame(0x06, &payload)),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_draughts_board_dump_keeps_raw_codes() {
        let payload = [0x01u8; 100];
        let msg = decode(&frame(0x06, &payload)).unwrap();
        assert_eq!(msg, Message::DraughtsBoardDump(vec![0x01; 100]));
    }

    #[test]
    fn test_half_board_dumps_report_square_colour() {
        let payload = [0u8; 50];
        let black = decode(&frame(0x14, &payload)).unwrap();
        let white = decode(&frame(0x15, &payload)).unwrap();
        assert!(matches!(
            black,
            Message::HalfBoardDump {
                squares: SquareColor::Black,
                ..
            }
        ));
        assert!(matches!(
            white,
            Message::HalfBoardDump {
                squares: SquareColor::White,
                ..
            }
        ));
    }

    #[test]
    fn test_bwtime_ack_is_classified_as_ack() {
        let msg = decode(&frame(0x0d, &[0x0a, 0x10, 0x01, 0x2a, 0x00, 0x00, 0x00])).unwrap();
        let Message::ClockAck(ack) = msg else {
            panic!("expected a clock ack, got {msg:?}");
        };
        assert_eq!(ack.kind(), AckKind::Ready);
    }

    #[test]
    fn test_bwtime_all_zero_is_empty() {
        let msg = decode(&frame(0x0d, &[0; 7])).unwrap();
        assert_eq!(msg, Message::EmptyClockTime);
    }

    #[test]
    fn test_bwtime_wrong_length_is_mismatch() {
        assert!(matches!(
            decode(&frame(0x0d, &[0; 6])),
            Err(ProtocolError::LengthMismatch { id: 0x0d, .. })
        ));
    }

    #[test]
    fn test_bus_address_joins_seven_bit_halves() {
        // Serial "01025" gives bus address 0x0401
        let msg = decode(&frame(0x10, &[0x08, 0x01])).unwrap();
        assert_eq!(msg, Message::BusAddress(0x0401));
    }

    #[test]
    fn test_version_decodes_major_minor() {
        let msg = decode(&frame(0x13, &[0x01, 0x02])).unwrap();
        assert_eq!(msg, Message::Version { major: 1, minor: 2 });
    }

    #[test]
    fn test_serial_and_trademark_are_text() {
        assert_eq!(
            decode(&frame(0x11, b"01025")).unwrap(),
            Message::SerialNumber("01025".into())
        );
        assert_eq!(
            decode(&frame(0x12, b"Digital Game Technology\0")).unwrap(),
            Message::Trademark("Digital Game Technology".into())
        );
    }

    #[test]
    fn test_long_serial_requires_ten_characters() {
        assert_eq!(
            decode(&frame(0x22, b"0000012345")).unwrap(),
            Message::LongSerialNumber("0000012345".into())
        );
        assert!(matches!(
            decode(&frame(0x22, b"12345")),
            Err(ProtocolError::LengthMismatch { id: 0x22, .. })
        ));
    }

    #[test]
    fn test_short_battery_status_leaves_optional_fields_empty() {
        let msg = decode(&frame(0x20, &[80, 0x7f, 0x7f, 5])).unwrap();
        let Message::BatteryStatus(status) = msg else {
            panic!("expected battery status");
        };
        assert_eq!(status.capacity_percent, 80);
        assert_eq!(status.time_left, None);
        assert_eq!(status.on_time, None);
        assert!(!status.charging);
    }

    #[test]
    fn test_full_battery_status() {
        let msg = decode(&frame(0x20, &[95, 3, 20, 1, 5, 2, 4, 30, 0x01])).unwrap();
        let Message::BatteryStatus(status) = msg else {
            panic!("expected battery status");
        };
        assert_eq!(status.time_left, Some((3, 20)));
        assert_eq!(status.on_time, Some((1, 5)));
        assert_eq!(status.standby_time, Some((2, 4, 30)));
        assert!(status.charging);
        assert!(!status.discharging);
    }

    #[test]
    fn test_battery_status_too_long_is_mismatch() {
        assert!(matches!(
            decode(&frame(0x20, &[0; 10])),
            Err(ProtocolError::LengthMismatch { id: 0x20, .. })
        ));
    }

    #[test]
    fn test_ee_moves_accepts_any_length() {
        assert_eq!(
            decode(&frame(0x0f, &[0x6a, 0x6b])).unwrap(),
            Message::EeMoves(vec![0x6a, 0x6b])
        );
        assert_eq!(decode(&frame(0x0f, &[])).unwrap(), Message::EeMoves(vec![]));
    }

    #[test]
    fn test_inconsistent_frame_length_is_malformed() {
        let mut f = frame(0x0e, &[0x04, 0x01]);
        f.length = 10;
        assert!(matches!(decode(&f), Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_unknown_id_is_data_not_error() {
        let msg = decode(&frame(0x30, &[0x01, 0x02])).unwrap();
        assert_eq!(
            msg,
            Message::Unknown {
                id: 0x30,
                payload: vec![0x01, 0x02]
            }
        );
    }
}
