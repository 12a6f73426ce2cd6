//! Integration tests driving the public API with wire bytes.
//!
//! Each test feeds what a board would send and checks what comes out of the
//! session or bus master, exercising framing, decoding, the board and clock
//! state, and the bus layer together.

use std::collections::VecDeque;
use std::time::Duration;

use dgt_core::protocol::bus::{
    decode_bus_command, encode_bus_reply, BusAddress, BusCommand, BusDevice, BusError, BusLink,
    BusMaster, BusReply, BusReplyKind, DeviceAction, RetryPolicy,
};
use dgt_core::protocol::clock::{AckKind, ClockSide, Turn};
use dgt_core::protocol::eeprom::{decode_stream, EepromEvent};
use dgt_core::{
    encode_frame, BoardState, FrameError, Message, Piece, PositionTag, ProtocolConfig,
    ProtocolError, Session, SessionEvent,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn drain(session: &mut Session) -> Vec<Result<SessionEvent, ProtocolError>> {
    std::iter::from_fn(|| session.poll()).collect()
}

fn messages(events: &[Result<SessionEvent, ProtocolError>]) -> Vec<Message> {
    events
        .iter()
        .filter_map(|e| match e {
            Ok(SessionEvent::Message(m)) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

// ── Single-board sessions ─────────────────────────────────────────────────────

#[test]
fn test_field_update_frame_decodes() {
    let mut session = Session::default();

    session.feed(&[0x8e, 0x00, 0x05, 0x04, 0x01]);

    assert_eq!(
        drain(&mut session),
        vec![Ok(SessionEvent::Message(Message::FieldUpdate {
            field: 4,
            piece: Piece::WhitePawn
        }))]
    );
}

#[test]
fn test_board_dump_id_with_field_update_length_is_rejected() {
    let mut session = Session::default();

    session.feed(&[0x86, 0x00, 0x05, 0x04, 0x01]);
    session.feed(&[0x8e, 0x00, 0x05, 0x04, 0x01]);
    let events = drain(&mut session);

    assert_eq!(
        events[0],
        Err(ProtocolError::LengthMismatch {
            id: 0x06,
            expected_min: 67,
            expected_max: 67,
            actual: 5
        })
    );
    assert_eq!(messages(&events).len(), 1);
}

#[test]
fn test_bwtime_with_ack_nibble_is_an_ack() {
    let mut session = Session::default();

    session.feed(&[0x8d, 0x00, 0x0a, 0x0a, 0x10, 0x01, 0x2a, 0x00, 0x00, 0x00]);
    let events = drain(&mut session);

    let [Ok(SessionEvent::Message(Message::ClockAck(ack)))] = events.as_slice() else {
        panic!("expected a single clock ack, got {events:?}");
    };
    assert!(!ack.is_error());
    assert!(ack.is_unsolicited());
    assert_eq!(ack.kind(), AckKind::Ready);
    assert_eq!(session.clock().last_ack, Some(*ack));
    assert_eq!(session.clock().time, None);
}

#[test]
fn test_bwtime_times_update_clock_state() {
    let mut session = Session::default();

    // Right 1:05:30, left 0:59:59, running, left to move.
    session.feed(&[0x8d, 0x00, 0x0a, 0x01, 0x05, 0x30, 0x00, 0x59, 0x59, 0x11]);
    drain(&mut session);

    let time = session.clock().time.expect("valid reading is kept");
    assert_eq!(time.player(ClockSide::Right).total_seconds(), 3930);
    assert_eq!(time.player(ClockSide::Left).total_seconds(), 3599);
    assert_eq!(time.status.turn(), Turn::Left);
}

#[test]
fn test_invalid_clock_reading_is_not_applied() {
    let mut session = Session::default();

    session.feed(&[0x8d, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20]);
    let events = drain(&mut session);

    assert!(matches!(
        events[0],
        Ok(SessionEvent::Message(Message::ClockTime(_)))
    ));
    assert_eq!(session.clock().time, None);
}

#[test]
fn test_garbage_before_frame_is_skipped() {
    let mut session = Session::default();

    session.feed(&[0x01, 0x02, 0x03]);
    session.feed(&[0x8e, 0x00, 0x05, 0x10, 0x07]);
    let events = drain(&mut session);

    assert_eq!(
        events[0],
        Err(ProtocolError::FrameInvalid(FrameError::MissingStartByte(0x01)))
    );
    assert_eq!(
        messages(&events),
        vec![Message::FieldUpdate {
            field: 0x10,
            piece: Piece::BlackPawn
        }]
    );
}

#[test]
fn test_frame_cut_short_by_next_message() {
    let mut session = Session::default();

    // A board dump header whose payload is interrupted by a field update.
    session.feed(&[0x86, 0x00, 0x43, 0x00, 0x00]);
    session.feed(&[0x8e, 0x00, 0x05, 0x3f, 0x05]);
    let events = drain(&mut session);

    assert!(matches!(events[0], Err(ProtocolError::FrameInvalid(_))));
    assert_eq!(
        messages(&events),
        vec![Message::FieldUpdate {
            field: 63,
            piece: Piece::WhiteKing
        }]
    );
}

#[test]
fn test_board_dump_of_start_position_tags_it() {
    let mut session = Session::default();
    let codes: Vec<u8> = BoardState::begin_position()
        .cells()
        .iter()
        .map(|p| p.code())
        .collect();

    session.feed(&encode_frame(0x06, &codes).unwrap());
    let events = drain(&mut session);

    assert_eq!(
        events.last(),
        Some(&Ok(SessionEvent::PositionTag(PositionTag::BeginPosition)))
    );
    assert_eq!(
        session.board().to_fen_placement(),
        "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR"
    );
}

#[test]
fn test_wobbling_piece_does_not_repeat_begin_position_tag() {
    let mut session = Session::default();
    let codes: Vec<u8> = BoardState::begin_position()
        .cells()
        .iter()
        .map(|p| p.code())
        .collect();
    session.feed(&encode_frame(0x06, &codes).unwrap());
    drain(&mut session);

    for _ in 0..3 {
        session.feed(&[0x8e, 0x00, 0x05, 52, 0x00]);
        session.feed(&[0x8e, 0x00, 0x05, 52, 0x01]);
    }
    let events = drain(&mut session);

    assert!(events
        .iter()
        .all(|e| !matches!(e, Ok(SessionEvent::PositionTag(_)))));
}

#[test]
fn test_downloaded_event_log_replays_onto_board() {
    let mut session = Session::default();
    // power-up, begin position, e2 lifted, e4 placed, EOF
    let log = [0x6a, 0x6f, 0x40, 52, 0x41, 36, 0x6b];

    session.feed(&encode_frame(0x0f, &log).unwrap());
    let events = drain(&mut session);
    let [Ok(SessionEvent::Message(Message::EeMoves(bytes)))] = events.as_slice() else {
        panic!("expected the raw event log, got {events:?}");
    };
    let decoded: Vec<EepromEvent> = decode_stream(bytes).collect::<Result<_, _>>().unwrap();
    session.reconstructor_mut().replay(&decoded).unwrap();

    assert_eq!(
        session.board().to_fen_placement(),
        "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR"
    );
    assert_eq!(session.reconstructor().changes().len(), 2);
}

#[test]
fn test_session_uses_configured_hysteresis() {
    let config = ProtocolConfig::from_toml_str("[board]\nhysteresis_cells = 0\n").unwrap();
    let mut session = Session::new(config).unwrap();
    session.feed(&[0x8e, 0x00, 0x05, 0x00, 0x02]);
    session.feed(&[0x8e, 0x00, 0x05, 0x00, 0x00]);
    session.feed(&[0x8e, 0x00, 0x05, 0x00, 0x02]);
    session.feed(&[0x8e, 0x00, 0x05, 0x00, 0x00]);

    let tags = drain(&mut session)
        .into_iter()
        .filter(|e| matches!(e, Ok(SessionEvent::PositionTag(PositionTag::EmptyBoard))))
        .count();

    assert_eq!(tags, 2);
}

#[test]
fn test_long_session_keeps_change_log_bounded() {
    // Arrange
    let config =
        ProtocolConfig::from_toml_str("[board]\nchange_log_capacity = 64\n").unwrap();
    let mut session = Session::new(config).unwrap();

    // Act
    for i in 0..10_000u32 {
        let piece = if i % 2 == 0 { 0x01 } else { 0x00 };
        session.feed(&[0x8e, 0x00, 0x05, (i % 64) as u8, piece]);
        drain(&mut session);
    }

    // Assert
    let changes = session.reconstructor().changes();
    assert_eq!(changes.len(), 64);
    assert_eq!(changes.back().map(|c| c.field), Some((9_999 % 64) as u8));
}

#[test]
fn test_default_session_change_log_is_capped() {
    let mut session = Session::default();
    for i in 0..5_000u32 {
        session.feed(&[0x8e, 0x00, 0x05, (i % 64) as u8, 0x01]);
        drain(&mut session);
    }
    assert_eq!(session.reconstructor().changes().len(), 1024);
}

#[test]
fn test_session_refuses_invalid_config_built_in_code() {
    let mut config = ProtocolConfig::default();
    config.bus.max_attempts = 0;
    assert!(Session::new(config).is_err());

    let mut config = ProtocolConfig::default();
    config.frame.max_buffered_bytes = 0;
    assert!(Session::new(config).is_err());
}

// ── Bus ───────────────────────────────────────────────────────────────────────

/// Several simulated boards on one line.
struct SimulatedBus {
    boards: Vec<BusDevice>,
    inbox: VecDeque<Vec<u8>>,
    corrupt_next: bool,
}

impl SimulatedBus {
    fn new(addresses: &[u16]) -> Self {
        let boards = addresses
            .iter()
            .enumerate()
            .map(|(i, &a)| {
                BusDevice::with_rng(
                    BusAddress::new(a).unwrap(),
                    Duration::from_millis(1100),
                    StdRng::seed_from_u64(i as u64),
                )
            })
            .collect();
        Self {
            boards,
            inbox: VecDeque::new(),
            corrupt_next: false,
        }
    }

    fn reply_for(command: BusCommand, address: BusAddress) -> Vec<u8> {
        let kind = match command {
            BusCommand::Ping | BusCommand::IgnoreNextPing => BusReplyKind::Ping,
            BusCommand::SendVersion => BusReplyKind::Version,
            BusCommand::SendChanges | BusCommand::RepeatChanges => BusReplyKind::Update,
            other => panic!("simulated board cannot answer {other:?}"),
        };
        let data: &[u8] = match kind {
            BusReplyKind::Version => &[1, 3],
            BusReplyKind::Update => &[0x41, 0x34],
            _ => &[],
        };
        encode_bus_reply(kind, address, data).unwrap()
    }
}

impl BusLink for SimulatedBus {
    fn send(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        decode_bus_command(bytes)?;
        let mut delayed = Vec::new();
        for board in &mut self.boards {
            match board.on_frame(bytes) {
                DeviceAction::Process(command) if !command.expected_replies().is_empty() => {
                    let mut reply = Self::reply_for(command, board.address());
                    if self.corrupt_next {
                        self.corrupt_next = false;
                        let last = reply.len() - 1;
                        reply[last] ^= 0x01;
                    }
                    self.inbox.push_back(reply);
                }
                DeviceAction::ReplyAfter { command, delay } => {
                    delayed.push((delay, Self::reply_for(command, board.address())));
                }
                _ => {}
            }
        }
        // Broadcast replies arrive in the order their delays expire.
        delayed.sort_by_key(|(delay, _)| *delay);
        let burst: Vec<u8> = delayed.into_iter().flat_map(|(_, r)| r).collect();
        if !burst.is_empty() {
            self.inbox.push_back(burst);
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Vec<u8>, BusError> {
        Ok(self.inbox.pop_front().unwrap_or_default())
    }
}

#[test]
fn test_discovery_finds_every_board() {
    let bus = SimulatedBus::new(&[0x0401, 0x0402, 0x1234]);
    let mut master = BusMaster::new(bus, RetryPolicy::default());

    let mut found = master.discover().unwrap();
    found.sort();

    let expected: Vec<BusAddress> = [0x0401, 0x0402, 0x1234]
        .iter()
        .map(|&a| BusAddress::new(a).unwrap())
        .collect();
    assert_eq!(found, expected);
}

#[test]
fn test_master_built_from_config_uses_its_attempts() {
    let config = ProtocolConfig::from_toml_str("[bus]\nmax_attempts = 1\n").unwrap();
    let mut bus = SimulatedBus::new(&[0x0401]);
    bus.corrupt_next = true;
    let mut master = BusMaster::from_config(bus, &config.bus);

    let result = master.request(BusCommand::SendChanges, BusAddress::new(0x0401).unwrap());

    assert_eq!(master.policy().max_attempts, 1);
    assert!(matches!(result, Err(BusError::ChecksumMismatch { .. })));
}

#[test]
fn test_bus_version_query() {
    let bus = SimulatedBus::new(&[0x0401, 0x0402]);
    let mut master = BusMaster::new(bus, RetryPolicy::default());

    let replies = master
        .query(BusCommand::SendVersion, BusAddress::new(0x0402).unwrap())
        .unwrap();

    assert_eq!(replies, vec![BusReply::Version { major: 1, minor: 3 }]);
}

#[test]
fn test_corrupted_change_batch_is_fetched_again() {
    let mut bus = SimulatedBus::new(&[0x0401]);
    bus.corrupt_next = true;
    let mut master = BusMaster::new(bus, RetryPolicy::default());

    let replies = master
        .query(BusCommand::SendChanges, BusAddress::new(0x0401).unwrap())
        .unwrap();

    assert_eq!(
        replies,
        vec![BusReply::Update(vec![EepromEvent::FieldChange {
            field: 0x34,
            piece: Piece::WhitePawn,
            fast: false
        }])]
    );
}

#[test]
fn test_board_switched_to_single_mode_ignores_first_bus_command() {
    let mut bus = SimulatedBus::new(&[0x0401]);
    bus.boards[0].on_single_board_command(0x42);
    let mut master = BusMaster::new(bus, RetryPolicy::default());

    // The first Ping only switches the board back; the retry is answered.
    let replies = master
        .request(BusCommand::Ping, BusAddress::new(0x0401).unwrap())
        .unwrap();

    assert_eq!(replies.len(), 1);
}
