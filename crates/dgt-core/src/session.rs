//! One connection to one board, from raw bytes to typed events.
//!
//! A [`Session`] is fed bytes as the transport delivers them and polled for
//! events. It owns all the state that belongs to one board (frame buffer,
//! board position, clock state, outstanding clock command), so any number of
//! sessions can run side by side.
//!
//! # Event order
//!
//! Events come out in the order their frames completed on the wire. A message
//! is followed directly by whatever it caused: position tags after a field
//! update, a resend or rejection notice after a clock ack.
//!
//! # Errors
//!
//! Decode errors are returned from [`Session::poll`] in place of the event
//! the broken frame would have produced; the session carries on with the next
//! frame. Closing the transport is reported once with
//! [`ProtocolError::TransportClosed`].

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::{ConfigError, ProtocolConfig};
use crate::domain::board::{BoardState, PositionTag, Reconstructor};
use crate::domain::clock::{AckOutcome, ClockGate, ClockState};
use crate::protocol::codec::{decode, ProtocolError};
use crate::protocol::commands::{ClockCommand, Command};
use crate::protocol::frame::FrameDecoder;
use crate::protocol::messages::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Something the session observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Message(Message),
    /// The board reached a recognised position.
    PositionTag(PositionTag),
    /// The clock refused a command. `resend` holds the bytes to send again, or
    /// is `None` once the resend was used up.
    ClockRejected { command: u8, resend: Option<Vec<u8>> },
}

type Polled = Result<SessionEvent, ProtocolError>;

/// Decoding state for one board connection.
#[derive(Debug)]
pub struct Session {
    config: ProtocolConfig,
    decoder: FrameDecoder,
    board: Reconstructor,
    clock: ClockState,
    gate: ClockGate,
    queued: VecDeque<Polled>,
    closed: bool,
    close_reported: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::from_valid(ProtocolConfig::default())
    }
}

impl Session {
    /// Opens a session with `config`, checked the same way a loaded TOML
    /// document is.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for settings [`ProtocolConfig::validate`]
    /// refuses.
    pub fn new(config: ProtocolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    fn from_valid(config: ProtocolConfig) -> Self {
        Self {
            decoder: FrameDecoder::with_max_buffered(config.frame.max_buffered_bytes),
            board: Reconstructor::with_limits(
                config.board.hysteresis_cells,
                config.board.change_log_capacity,
            ),
            clock: ClockState::default(),
            gate: ClockGate::new(config.clock.ack_timeout(), config.clock.resend_on_error),
            queued: VecDeque::new(),
            closed: false,
            close_reported: false,
            config,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn board(&self) -> &BoardState {
        self.board.board()
    }

    pub fn reconstructor(&self) -> &Reconstructor {
        &self.board
    }

    /// Mutable access, e.g. to replay a downloaded event log.
    pub fn reconstructor_mut(&mut self) -> &mut Reconstructor {
        &mut self.board
    }

    pub fn clock(&self) -> &ClockState {
        &self.clock
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffers bytes from the transport. Ignored after [`close`](Self::close).
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.closed {
            warn!(len = bytes.len(), "bytes fed to a closed session are dropped");
            return;
        }
        self.decoder.push(bytes);
    }

    /// Marks the transport as gone; buffered partial frames are dropped.
    pub fn close(&mut self) {
        if !self.closed {
            debug!(dropped = self.decoder.buffered(), "session closed");
            self.decoder.clear();
            self.queued.clear();
            self.closed = true;
        }
    }

    /// Next event, or `None` when more bytes are needed.
    pub fn poll(&mut self) -> Option<Polled> {
        self.poll_at(Instant::now())
    }

    /// [`poll`](Self::poll) with an explicit current time.
    pub fn poll_at(&mut self, now: Instant) -> Option<Polled> {
        if self.closed {
            if self.close_reported {
                return None;
            }
            self.close_reported = true;
            return Some(Err(ProtocolError::TransportClosed));
        }
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        if let Some(err) = self.gate.check_timeout(now) {
            return Some(Err(err));
        }

        let frame = match self.decoder.next_frame()? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e.into())),
        };
        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };
        self.apply(&message, now);
        Some(Ok(SessionEvent::Message(message)))
    }

    /// Encodes a command; clock commands go through the ack gate.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ClockBusy`] while a clock command is outstanding,
    /// [`ProtocolError::Command`] for parameters that cannot be encoded and
    /// [`ProtocolError::TransportClosed`] after [`close`](Self::close).
    pub fn send_command(&mut self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        self.send_command_at(command, Instant::now())
    }

    pub fn send_command_at(
        &mut self,
        command: &Command,
        now: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        match command {
            Command::Clock(clock) => self.send_clock_command_at(clock, now),
            other => {
                if self.closed {
                    return Err(ProtocolError::TransportClosed);
                }
                Ok(other.encode()?)
            }
        }
    }

    pub fn send_clock_command(&mut self, command: &ClockCommand) -> Result<Vec<u8>, ProtocolError> {
        self.send_clock_command_at(command, Instant::now())
    }

    pub fn send_clock_command_at(
        &mut self,
        command: &ClockCommand,
        now: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::TransportClosed);
        }
        self.gate.try_send(command, now)
    }

    /// Fresh state with the same configuration; the transport counts as open.
    pub fn reset(&mut self) {
        *self = Self::from_valid(self.config.clone());
    }

    fn apply(&mut self, message: &Message, now: Instant) {
        match self.board.apply_message(message) {
            Ok(tags) => self
                .queued
                .extend(tags.into_iter().map(|t| Ok(SessionEvent::PositionTag(t)))),
            Err(e) => self
                .queued
                .push_back(Err(ProtocolError::MalformedPayload(e.to_string()))),
        }

        self.clock.apply_message(message);
        if let Message::ClockAck(ack) = message {
            let rejected = match self.gate.on_ack(ack, now) {
                AckOutcome::Resend { command, bytes } => Some(SessionEvent::ClockRejected {
                    command,
                    resend: Some(bytes),
                }),
                AckOutcome::Rejected(command) => Some(SessionEvent::ClockRejected {
                    command,
                    resend: None,
                }),
                _ => None,
            };
            self.queued.extend(rejected.map(Ok));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::encode_frame;
    use crate::protocol::messages::Piece;
    use std::time::Duration;

    fn field_update(field: u8, piece: Piece) -> Vec<u8> {
        encode_frame(0x0e, &[field, piece.code()]).unwrap()
    }

    /// BWTIME payload carrying the given ack bytes (all below 0x80).
    fn ack_frame(ack0: u8, ack1: u8) -> Vec<u8> {
        encode_frame(0x0d, &[0x0a, ack0, ack1, 0x0a, 0, 0, 0]).unwrap()
    }

    fn drain(session: &mut Session) -> Vec<Polled> {
        std::iter::from_fn(|| session.poll()).collect()
    }

    #[test]
    fn test_field_update_reaches_board() {
        let mut session = Session::default();
        session.feed(&field_update(12, Piece::BlackPawn));
        let events = drain(&mut session);
        assert_eq!(
            events,
            vec![Ok(SessionEvent::Message(Message::FieldUpdate {
                field: 12,
                piece: Piece::BlackPawn
            }))]
        );
        assert_eq!(session.board().get(12), Ok(Piece::BlackPawn));
    }

    #[test]
    fn test_position_tag_follows_its_message() {
        let mut session = Session::default();
        session.feed(&field_update(3, Piece::WhiteQueen));
        session.feed(&field_update(3, Piece::Empty));
        let events = drain(&mut session);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            Ok(SessionEvent::PositionTag(PositionTag::EmptyBoard))
        );
    }

    #[test]
    fn test_bytes_split_across_feeds() {
        let mut session = Session::default();
        let bytes = field_update(5, Piece::WhiteKing);
        session.feed(&bytes[..2]);
        assert!(session.poll().is_none());
        session.feed(&bytes[2..]);
        assert!(matches!(session.poll(), Some(Ok(SessionEvent::Message(_)))));
    }

    #[test]
    fn test_close_reports_transport_closed_once() {
        let mut session = Session::default();
        session.feed(&[0x8e, 0x00]);
        session.close();
        assert_eq!(session.poll(), Some(Err(ProtocolError::TransportClosed)));
        assert_eq!(session.poll(), None);
        session.feed(&field_update(1, Piece::WhitePawn));
        assert_eq!(session.poll(), None);
        assert_eq!(
            session.send_command(&Command::SendBoard),
            Err(ProtocolError::TransportClosed)
        );
    }

    #[test]
    fn test_reset_reopens_with_empty_board() {
        let mut session = Session::default();
        session.feed(&field_update(1, Piece::WhitePawn));
        drain(&mut session);
        session.close();
        session.reset();
        assert!(!session.is_closed());
        assert_eq!(session.board(), &BoardState::empty());
    }

    #[test]
    fn test_clock_busy_until_ack_arrives() {
        // Arrange
        let t0 = Instant::now();
        let mut session = Session::default();
        session
            .send_clock_command_at(&ClockCommand::End, t0)
            .unwrap();

        // Act
        let busy = session.send_clock_command_at(&ClockCommand::Version, t0);
        session.feed(&ack_frame(0x10, 0x03));
        let events: Vec<_> = std::iter::from_fn(|| session.poll_at(t0)).collect();

        // Assert
        assert_eq!(busy, Err(ProtocolError::ClockBusy(0x03)));
        assert_eq!(events.len(), 1);
        assert!(session
            .send_clock_command_at(&ClockCommand::Version, t0)
            .is_ok());
    }

    #[test]
    fn test_rejected_clock_command_asks_for_resend() {
        let t0 = Instant::now();
        let mut session = Session::default();
        let sent = session
            .send_clock_command_at(&ClockCommand::End, t0)
            .unwrap();

        session.feed(&ack_frame(0x40, 0x03));
        let events: Vec<_> = std::iter::from_fn(|| session.poll_at(t0)).collect();

        assert_eq!(
            events[1],
            Ok(SessionEvent::ClockRejected {
                command: 0x03,
                resend: Some(sent)
            })
        );
    }

    #[test]
    fn test_rejection_names_the_pending_sub_code_on_both_paths() {
        // Arrange
        let t0 = Instant::now();
        let mut session = Session::default();
        session
            .send_clock_command_at(&ClockCommand::End, t0)
            .unwrap();

        // Act
        session.feed(&ack_frame(0x40, 0x03));
        session.feed(&ack_frame(0x40, 0x03));
        let rejections: Vec<_> = std::iter::from_fn(|| session.poll_at(t0))
            .filter_map(|e| match e {
                Ok(SessionEvent::ClockRejected { command, resend }) => {
                    Some((command, resend.is_some()))
                }
                _ => None,
            })
            .collect();

        // Assert
        assert_eq!(rejections, vec![(0x03, true), (0x03, false)]);
    }

    #[test]
    fn test_new_validates_config() {
        let mut config = ProtocolConfig::default();
        config.bus.command_timeout_ms = 0;
        assert!(matches!(
            Session::new(config),
            Err(ConfigError::Invalid {
                field: "bus.command_timeout_ms",
                ..
            })
        ));
        assert!(Session::new(ProtocolConfig::default()).is_ok());
    }

    #[test]
    fn test_clock_timeout_surfaces_once() {
        let t0 = Instant::now();
        let mut session = Session::default();
        session
            .send_clock_command_at(&ClockCommand::Beep(1), t0)
            .unwrap();
        let later = t0 + Duration::from_secs(3);
        assert_eq!(
            session.poll_at(later),
            Some(Err(ProtocolError::Timeout(Duration::from_millis(2000))))
        );
        assert_eq!(session.poll_at(later), None);
    }

    #[test]
    fn test_decode_error_does_not_stop_session() {
        let mut session = Session::default();
        session.feed(&encode_frame(0x0e, &[70, 1]).unwrap());
        session.feed(&field_update(2, Piece::WhiteRook));
        let events = drain(&mut session);
        assert!(events[0].is_err());
        assert!(matches!(events[1], Ok(SessionEvent::Message(_))));
    }

    #[test]
    fn test_non_clock_command_is_not_gated() {
        let t0 = Instant::now();
        let mut session = Session::default();
        session
            .send_clock_command_at(&ClockCommand::End, t0)
            .unwrap();
        assert_eq!(
            session.send_command_at(&Command::SendBoard, t0),
            Ok(vec![0x42])
        );
    }
}
