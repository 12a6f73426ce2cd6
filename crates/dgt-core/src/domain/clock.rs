//! Clock state and clock command gating.
//!
//! The clock hangs off the board and answers every command with an ack that
//! comes back inside a BWTIME message. It handles one command at a time, so a
//! new command waits for the previous ack or for the ack timeout.

use std::time::{Duration, Instant};

use crate::protocol::clock::{AckKind, ClockAck, ClockReading, ClockTime};
use crate::protocol::codec::ProtocolError;
use crate::protocol::commands::ClockCommand;
use crate::protocol::messages::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default wait for a clock ack.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2000);

// ── State ─────────────────────────────────────────────────────────────────────

/// What the host knows about the clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockState {
    /// Last reading that the clock marked as valid.
    pub time: Option<ClockTime>,
    /// `(major, minor)` from the last version ack.
    pub version: Option<(u8, u8)>,
    pub last_ack: Option<ClockAck>,
}

impl ClockState {
    /// Applies a BWTIME reading; returns `true` if the state changed.
    ///
    /// Readings flagged invalid (no clock connected) and empty readings are
    /// dropped.
    pub fn apply(&mut self, reading: &ClockReading) -> bool {
        match reading {
            ClockReading::Time(time) if time.is_valid() => {
                let changed = self.time != Some(*time);
                self.time = Some(*time);
                changed
            }
            ClockReading::Time(_) | ClockReading::Empty => false,
            ClockReading::Ack(ack) => {
                if let AckKind::Version { major, minor } = ack.kind() {
                    self.version = Some((major, minor));
                }
                self.last_ack = Some(*ack);
                true
            }
        }
    }

    pub fn apply_message(&mut self, message: &Message) -> bool {
        match message {
            Message::ClockTime(time) => self.apply(&ClockReading::Time(*time)),
            Message::ClockAck(ack) => self.apply(&ClockReading::Ack(*ack)),
            _ => false,
        }
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingCommand {
    sub_code: u8,
    bytes: Vec<u8>,
    sent_at: Instant,
    resent: bool,
}

/// What an incoming ack meant for the pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The pending command finished.
    Completed(u8),
    /// The clock refused `command` (its sub-code); send `bytes` again.
    Resend { command: u8, bytes: Vec<u8> },
    /// The clock refused the command and no resend is left.
    Rejected(u8),
    /// Generated by the clock on its own; the pending command still waits.
    Unsolicited(AckKind),
    /// No pending command, or it answers a different one.
    Unmatched,
}

/// Enforces one outstanding clock command at a time.
#[derive(Debug, Clone)]
pub struct ClockGate {
    ack_timeout: Duration,
    resend_on_error: bool,
    pending: Option<PendingCommand>,
}

impl Default for ClockGate {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT, true)
    }
}

impl ClockGate {
    pub fn new(ack_timeout: Duration, resend_on_error: bool) -> Self {
        Self {
            ack_timeout,
            resend_on_error,
            pending: None,
        }
    }

    /// Sub-code of the command waiting for its ack, if any.
    pub fn pending(&self) -> Option<u8> {
        self.pending.as_ref().map(|p| p.sub_code)
    }

    pub fn is_busy(&self, now: Instant) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.sent_at) < self.ack_timeout)
    }

    /// Encodes `command` and marks it outstanding.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ClockBusy`] while an earlier command waits for its ack,
    /// [`ProtocolError::Command`] if the command cannot be encoded.
    pub fn try_send(
        &mut self,
        command: &ClockCommand,
        now: Instant,
    ) -> Result<Vec<u8>, ProtocolError> {
        if let Some(p) = &self.pending {
            if self.is_busy(now) {
                return Err(ProtocolError::ClockBusy(p.sub_code));
            }
            warn!(sub_code = p.sub_code, "clock command expired without ack");
        }
        let bytes = command.encode()?;
        debug!(sub_code = command.sub_code(), "clock command sent");
        self.pending = Some(PendingCommand {
            sub_code: command.sub_code(),
            bytes: bytes.clone(),
            sent_at: now,
            resent: false,
        });
        Ok(bytes)
    }

    /// Matches an incoming ack against the pending command.
    pub fn on_ack(&mut self, ack: &ClockAck, now: Instant) -> AckOutcome {
        if ack.is_unsolicited() {
            return AckOutcome::Unsolicited(ack.kind());
        }
        let Some(pending) = self.pending.as_mut() else {
            return AckOutcome::Unmatched;
        };
        if ack.answered_command() != Some(pending.sub_code) {
            warn!(
                pending = pending.sub_code,
                ack1 = ack.ack1,
                "clock ack does not answer the pending command"
            );
            return AckOutcome::Unmatched;
        }
        if !ack.is_error() {
            self.pending = None;
            return AckOutcome::Completed(ack.ack1);
        }

        warn!(sub_code = pending.sub_code, ack0 = ack.ack0, "clock rejected command");
        if self.resend_on_error && !pending.resent {
            pending.resent = true;
            pending.sent_at = now;
            return AckOutcome::Resend {
                command: pending.sub_code,
                bytes: pending.bytes.clone(),
            };
        }
        let sub_code = pending.sub_code;
        self.pending = None;
        AckOutcome::Rejected(sub_code)
    }

    /// Reports an expired command once and forgets it.
    pub fn check_timeout(&mut self, now: Instant) -> Option<ProtocolError> {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.sent_at) >= self.ack_timeout);
        if !expired {
            return None;
        }
        let pending = self.pending.take()?;
        warn!(sub_code = pending.sub_code, "clock ack timed out");
        Some(ProtocolError::Timeout(self.ack_timeout))
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::clock::{ClockStatus, PlayerClock};

    fn ack(ack0: u8, ack1: u8, ack2: u8) -> ClockAck {
        ClockAck {
            ack0,
            ack1,
            ack2,
            ack3: 0,
        }
    }

    fn time(seconds: u8, invalid: bool) -> ClockTime {
        ClockTime {
            left: PlayerClock {
                minutes: 5,
                seconds,
                ..PlayerClock::default()
            },
            right: PlayerClock::default(),
            status: ClockStatus {
                invalid_reading: invalid,
                ..ClockStatus::default()
            },
        }
    }

    #[test]
    fn test_state_keeps_last_valid_time() {
        let mut state = ClockState::default();
        assert!(state.apply(&ClockReading::Time(time(10, false))));
        assert!(!state.apply(&ClockReading::Time(time(9, true))));
        assert_eq!(state.time, Some(time(10, false)));
    }

    #[test]
    fn test_state_ignores_empty_reading() {
        let mut state = ClockState::default();
        assert!(!state.apply(&ClockReading::Empty));
        assert_eq!(state, ClockState::default());
    }

    #[test]
    fn test_state_records_version_ack() {
        let mut state = ClockState::default();
        state.apply_message(&Message::ClockAck(ack(0x10, 0x09, 0x21)));
        assert_eq!(state.version, Some((2, 1)));
    }

    #[test]
    fn test_gate_refuses_second_command_until_ack() {
        // Arrange
        let t0 = Instant::now();
        let mut gate = ClockGate::default();
        gate.try_send(&ClockCommand::Beep(4), t0).unwrap();

        // Act
        let second = gate.try_send(&ClockCommand::Version, t0 + Duration::from_millis(10));

        // Assert
        assert_eq!(second, Err(ProtocolError::ClockBusy(0x0b)));
        assert_eq!(
            gate.on_ack(&ack(0x10, 0x0b, 0), t0),
            AckOutcome::Completed(0x0b)
        );
        assert!(gate.try_send(&ClockCommand::Version, t0).is_ok());
    }

    #[test]
    fn test_gate_allows_new_command_after_timeout() {
        let t0 = Instant::now();
        let mut gate = ClockGate::new(Duration::from_millis(100), true);
        gate.try_send(&ClockCommand::End, t0).unwrap();
        assert!(gate
            .try_send(&ClockCommand::Version, t0 + Duration::from_millis(100))
            .is_ok());
        assert_eq!(gate.pending(), Some(0x09));
    }

    #[test]
    fn test_timeout_is_reported_once() {
        let t0 = Instant::now();
        let mut gate = ClockGate::new(Duration::from_millis(100), true);
        gate.try_send(&ClockCommand::End, t0).unwrap();

        assert_eq!(gate.check_timeout(t0 + Duration::from_millis(50)), None);
        let later = t0 + Duration::from_millis(150);
        assert_eq!(
            gate.check_timeout(later),
            Some(ProtocolError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(gate.check_timeout(later), None);
    }

    #[test]
    fn test_error_ack_resends_once_then_rejects() {
        let t0 = Instant::now();
        let mut gate = ClockGate::default();
        let bytes = gate.try_send(&ClockCommand::End, t0).unwrap();

        assert_eq!(
            gate.on_ack(&ack(0x40, 0x03, 0), t0),
            AckOutcome::Resend {
                command: 0x03,
                bytes
            }
        );
        assert_eq!(gate.on_ack(&ack(0x40, 0x03, 0), t0), AckOutcome::Rejected(0x03));
        assert_eq!(gate.pending(), None);
    }

    #[test]
    fn test_error_ack_without_resend_is_rejected() {
        let t0 = Instant::now();
        let mut gate = ClockGate::new(DEFAULT_ACK_TIMEOUT, false);
        gate.try_send(&ClockCommand::End, t0).unwrap();
        assert_eq!(gate.on_ack(&ack(0x40, 0x03, 0), t0), AckOutcome::Rejected(0x03));
    }

    #[test]
    fn test_unsolicited_ack_keeps_command_pending() {
        let t0 = Instant::now();
        let mut gate = ClockGate::default();
        gate.try_send(&ClockCommand::End, t0).unwrap();
        assert_eq!(
            gate.on_ack(&ack(0x10, 0x81, 0), t0),
            AckOutcome::Unsolicited(AckKind::Ready)
        );
        assert_eq!(gate.pending(), Some(0x03));
    }

    #[test]
    fn test_ack_for_other_command_is_unmatched() {
        let t0 = Instant::now();
        let mut gate = ClockGate::default();
        gate.try_send(&ClockCommand::End, t0).unwrap();
        assert_eq!(gate.on_ack(&ack(0x10, 0x0b, 0), t0), AckOutcome::Unmatched);
        assert_eq!(gate.pending(), Some(0x03));
    }
}
