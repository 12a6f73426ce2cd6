//! Bus mode: several boards on one serial line, each with a 14-bit address.
//!
//! Commands from the host are four bytes:
//! ```text
//! [0x80 | cmd][addr bits 13..7][addr bits 6..0][checksum]
//! ```
//! Replies carry their own header, the address, the data and a checksum:
//! ```text
//! [0x80 | id][len hi][len lo][addr hi][addr lo][data…][checksum]
//! ```
//! The reply length counts every byte, checksum included. The checksum is the
//! sum of all preceding bytes modulo 128.
//!
//! # Collisions (for beginners)
//!
//! All boards share one return line. A ping sent to address 0 would make every
//! board answer at the same instant, so each board waits a random time within
//! a ~1100 ms window instead. Discovery repeats the broadcast, first telling
//! every board already found to sit the next one out
//! ([`BusCommand::IgnoreNextPing`]), until a round turns up nobody new.

use std::time::Duration;

use crate::config::BusConfig;
use crate::protocol::clock::{decode_bwtime, ClockReading};
use crate::protocol::codec::{decode_pieces, ProtocolError};
use crate::protocol::commands::DGT_TO_BUSMODE;
use crate::protocol::eeprom::{decode_changes, EepromEvent};
use crate::protocol::frame::{
    checksum, join_seven, llh_seven, lll_seven, FrameError, MAX_FRAME_LENGTH, MESSAGE_BIT,
};
use crate::protocol::messages::Piece;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of a bus command frame.
pub const BUS_COMMAND_SIZE: usize = 4;
/// Header + address bytes in front of a reply's data.
pub const BUS_REPLY_HEADER_SIZE: usize = 5;
/// Smallest reply: header, address and checksum with no data.
pub const BUS_REPLY_MIN_SIZE: usize = BUS_REPLY_HEADER_SIZE + 1;
/// Size of a bus version reply (6 on firmware up to 1.2).
pub const BUS_VERSION_SIZE: usize = 8;

const MAX_ADDRESS: u16 = 0x3fff;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised by the bus layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus address {0} does not fit in 14 bits")]
    AddressOutOfRange(u16),

    #[error("bus command frame must be {BUS_COMMAND_SIZE} bytes, got {0}")]
    CommandLength(usize),

    #[error("0x{0:02X} is not a bus command")]
    NotACommand(u8),

    #[error("byte 0x{0:02X} inside a bus frame has its high bit set")]
    NotSevenBit(u8),

    #[error("bus reply length {0} is below the 6-byte minimum")]
    ReplyLength(usize),

    #[error("bus checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("expected bus reply 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedReply { expected: u8, actual: u8 },

    #[error("bus command 0x{0:02X} expects a reply and cannot be broadcast")]
    BroadcastRequest(u8),

    #[error("no bus reply within {0:?}")]
    Timeout(Duration),

    #[error("bus frame: {0}")]
    Frame(#[from] FrameError),

    #[error("bus reply body: {0}")]
    Body(#[from] ProtocolError),

    #[error("bus link failed: {0}")]
    Link(String),
}

impl BusError {
    /// Errors after which the command is sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Timeout(_) | BusError::ChecksumMismatch { .. } | BusError::UnexpectedReply { .. }
        )
    }
}

impl From<BusError> for ProtocolError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::ChecksumMismatch { expected, actual } => {
                ProtocolError::ChecksumMismatch { expected, actual }
            }
            BusError::Timeout(after) => ProtocolError::Timeout(after),
            BusError::Body(inner) => inner,
            BusError::Frame(inner) => ProtocolError::FrameInvalid(inner),
            BusError::Link(_) => ProtocolError::TransportClosed,
            other => ProtocolError::MalformedPayload(other.to_string()),
        }
    }
}

// ── Addresses and ids ─────────────────────────────────────────────────────────

/// A board's 14-bit bus address; 0 addresses every board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusAddress(u16);

impl BusAddress {
    pub const BROADCAST: Self = Self(0);

    pub fn new(value: u16) -> Result<Self, BusError> {
        if value > MAX_ADDRESS {
            Err(BusError::AddressOutOfRange(value))
        } else {
            Ok(Self(value))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

/// Host-to-board bus commands (wire values include the message bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BusCommand {
    SendClock = 0x81,
    SendBoard = 0x82,
    SendChanges = 0x83,
    RepeatChanges = 0x84,
    SetStartGame = 0x85,
    SendFromStart = 0x86,
    Ping = 0x87,
    EndBusMode = 0x88,
    Reset = 0x89,
    IgnoreNextPing = 0x8a,
    SendVersion = 0x8b,
    SendBoard50Black = 0x8c,
    /// Changes, clock and board in one go.
    SendAll = 0x8d,
}

impl TryFrom<u8> for BusCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x81 => Ok(BusCommand::SendClock),
            0x82 => Ok(BusCommand::SendBoard),
            0x83 => Ok(BusCommand::SendChanges),
            0x84 => Ok(BusCommand::RepeatChanges),
            0x85 => Ok(BusCommand::SetStartGame),
            0x86 => Ok(BusCommand::SendFromStart),
            0x87 => Ok(BusCommand::Ping),
            0x88 => Ok(BusCommand::EndBusMode),
            0x89 => Ok(BusCommand::Reset),
            0x8a => Ok(BusCommand::IgnoreNextPing),
            0x8b => Ok(BusCommand::SendVersion),
            0x8c => Ok(BusCommand::SendBoard50Black),
            0x8d => Ok(BusCommand::SendAll),
            _ => Err(()),
        }
    }
}

impl BusCommand {
    /// Replies the board sends back, in order.
    pub fn expected_replies(self) -> &'static [BusReplyKind] {
        match self {
            BusCommand::SendClock => &[BusReplyKind::BwTime],
            BusCommand::SendBoard => &[BusReplyKind::BoardDump],
            BusCommand::SendChanges | BusCommand::RepeatChanges => &[BusReplyKind::Update],
            BusCommand::SetStartGame => &[BusReplyKind::StartGameWritten],
            BusCommand::SendFromStart => &[BusReplyKind::FromStart],
            BusCommand::Ping | BusCommand::IgnoreNextPing => &[BusReplyKind::Ping],
            BusCommand::SendVersion => &[BusReplyKind::Version],
            BusCommand::SendBoard50Black => &[BusReplyKind::BoardDump50Black],
            BusCommand::SendAll => &[
                BusReplyKind::Update,
                BusReplyKind::BwTime,
                BusReplyKind::BoardDump,
            ],
            BusCommand::EndBusMode | BusCommand::Reset => &[],
        }
    }
}

/// The command to send when an attempt failed.
///
/// A lost change batch must be fetched with `RepeatChanges`: sending
/// `SendChanges` again would move on to the next batch and drop this one.
/// `SendAll` has no repeat form; [`BusMaster::request`] recovers it as
/// `RepeatChanges`, `SendClock` and `SendBoard`.
pub fn resend_command_for(command: BusCommand) -> BusCommand {
    match command {
        BusCommand::SendChanges => BusCommand::RepeatChanges,
        other => other,
    }
}

/// Board-to-host bus reply ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BusReplyKind {
    BoardDump = 0x83,
    BwTime = 0x84,
    Update = 0x85,
    FromStart = 0x86,
    Ping = 0x87,
    StartGameWritten = 0x88,
    Version = 0x89,
    BoardDump50Black = 0x8a,
}

impl TryFrom<u8> for BusReplyKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x83 => Ok(BusReplyKind::BoardDump),
            0x84 => Ok(BusReplyKind::BwTime),
            0x85 => Ok(BusReplyKind::Update),
            0x86 => Ok(BusReplyKind::FromStart),
            0x87 => Ok(BusReplyKind::Ping),
            0x88 => Ok(BusReplyKind::StartGameWritten),
            0x89 => Ok(BusReplyKind::Version),
            0x8a => Ok(BusReplyKind::BoardDump50Black),
            _ => Err(()),
        }
    }
}

// ── Command frames ────────────────────────────────────────────────────────────

/// Encodes a bus command for `address`.
///
/// # Examples
///
/// ```rust
/// use dgt_core::protocol::bus::{encode_bus_command, BusAddress, BusCommand};
///
/// let addr = BusAddress::new(0x0806).unwrap();
/// assert_eq!(
///     encode_bus_command(BusCommand::SendClock, addr),
///     [0x81, 0x10, 0x06, 0x17]
/// );
/// ```
pub fn encode_bus_command(command: BusCommand, address: BusAddress) -> [u8; BUS_COMMAND_SIZE] {
    let head = [command as u8, llh_seven(address.0), lll_seven(address.0)];
    [head[0], head[1], head[2], checksum(&head)]
}

/// Parses and verifies a four-byte bus command.
///
/// # Errors
///
/// [`BusError`] for a wrong size, an unknown command byte, a high bit in the
/// address, or a checksum mismatch.
pub fn decode_bus_command(bytes: &[u8]) -> Result<(BusCommand, BusAddress), BusError> {
    let &[cmd, hi, lo, sum] = bytes else {
        return Err(BusError::CommandLength(bytes.len()));
    };
    let command = BusCommand::try_from(cmd).map_err(|_| BusError::NotACommand(cmd))?;
    if let Some(&b) = [hi, lo].iter().find(|b| *b & MESSAGE_BIT != 0) {
        return Err(BusError::NotSevenBit(b));
    }
    let expected = checksum(&bytes[..3]);
    if expected != sum {
        return Err(BusError::ChecksumMismatch {
            expected,
            actual: sum,
        });
    }
    Ok((command, BusAddress(join_seven(hi, lo))))
}

// ── Reply frames ──────────────────────────────────────────────────────────────

/// A checked bus reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Wire reply id, message bit included.
    pub id: u8,
    pub address: BusAddress,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl BusEnvelope {
    pub fn kind(&self) -> Option<BusReplyKind> {
        BusReplyKind::try_from(self.id).ok()
    }
}

/// Encodes a reply as a board would send it.
///
/// # Errors
///
/// [`BusError::Frame`] when `data` is not 7-bit clean or too long.
pub fn encode_bus_reply(
    kind: BusReplyKind,
    address: BusAddress,
    data: &[u8],
) -> Result<Vec<u8>, BusError> {
    let length = BUS_REPLY_MIN_SIZE + data.len();
    if length > MAX_FRAME_LENGTH {
        return Err(FrameError::PayloadTooLarge(data.len()).into());
    }
    if let Some(offset) = data.iter().position(|b| b & MESSAGE_BIT != 0) {
        return Err(FrameError::PayloadNotSevenBit {
            offset,
            byte: data[offset],
        }
        .into());
    }
    let mut buf = Vec::with_capacity(length);
    buf.push(kind as u8);
    buf.push(llh_seven(length as u16));
    buf.push(lll_seven(length as u16));
    buf.push(llh_seven(address.0));
    buf.push(lll_seven(address.0));
    buf.extend_from_slice(data);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Outcome of parsing a reply from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusReplyStatus {
    Complete(BusEnvelope, usize),
    Incomplete,
    /// Drop `skip` bytes; for a checksum mismatch that is the whole reply.
    Invalid { skip: usize, error: BusError },
}

/// Parses one bus reply from the start of `buf`.
pub fn try_decode_bus_reply(buf: &[u8]) -> BusReplyStatus {
    let Some(&id) = buf.first() else {
        return BusReplyStatus::Incomplete;
    };
    let resync = |error| BusReplyStatus::Invalid {
        skip: buf
            .iter()
            .skip(1)
            .position(|b| b & MESSAGE_BIT != 0)
            .map_or(buf.len(), |p| p + 1),
        error,
    };
    if id & MESSAGE_BIT == 0 {
        return resync(BusError::NotSevenBit(id));
    }

    // Every byte after the id is 7-bit; a high bit means a new reply started.
    let header_end = buf.len().min(BUS_REPLY_HEADER_SIZE);
    if let Some(i) = buf[1..header_end].iter().position(|b| b & MESSAGE_BIT != 0) {
        return BusReplyStatus::Invalid {
            skip: i + 1,
            error: BusError::NotSevenBit(buf[i + 1]),
        };
    }
    if buf.len() < BUS_REPLY_HEADER_SIZE {
        return BusReplyStatus::Incomplete;
    }

    let length = usize::from(join_seven(buf[1], buf[2]));
    if length < BUS_REPLY_MIN_SIZE {
        return resync(BusError::ReplyLength(length));
    }
    let available = buf.len().min(length);
    if let Some(i) = buf[BUS_REPLY_HEADER_SIZE..available]
        .iter()
        .position(|b| b & MESSAGE_BIT != 0)
    {
        let at = BUS_REPLY_HEADER_SIZE + i;
        return BusReplyStatus::Invalid {
            skip: at,
            error: BusError::NotSevenBit(buf[at]),
        };
    }
    if buf.len() < length {
        return BusReplyStatus::Incomplete;
    }

    let actual = buf[length - 1];
    let expected = checksum(&buf[..length - 1]);
    if actual != expected {
        return BusReplyStatus::Invalid {
            skip: length,
            error: BusError::ChecksumMismatch { expected, actual },
        };
    }
    BusReplyStatus::Complete(
        BusEnvelope {
            id,
            address: BusAddress(join_seven(buf[3], buf[4])),
            data: buf[BUS_REPLY_HEADER_SIZE..length - 1].to_vec(),
            checksum: actual,
        },
        length,
    )
}

/// Typed body of a bus reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusReply {
    BoardDump(Vec<Piece>),
    Clock(ClockReading),
    /// Changes since the previous SendChanges.
    Update(Vec<EepromEvent>),
    /// Everything logged since the start-game tag.
    FromStart(Vec<EepromEvent>),
    Ping,
    StartGameWritten,
    Version { major: u8, minor: u8 },
    /// 50 raw square codes.
    BoardDump50Black(Vec<u8>),
}

impl BusReply {
    /// Decodes the data area of a checked envelope.
    ///
    /// # Errors
    ///
    /// [`ProtocolError`] for an unknown reply id, a body of the wrong size or
    /// a corrupt change log.
    pub fn decode(envelope: &BusEnvelope) -> Result<Self, ProtocolError> {
        let data = envelope.data.as_slice();
        let kind = envelope.kind().ok_or_else(|| {
            ProtocolError::MalformedPayload(format!("unknown bus reply id 0x{:02X}", envelope.id))
        })?;
        let require = |expected: usize| {
            let actual = data.len() + BUS_REPLY_MIN_SIZE;
            if actual == expected {
                Ok(())
            } else {
                Err(ProtocolError::LengthMismatch {
                    id: envelope.id & !MESSAGE_BIT,
                    expected_min: expected,
                    expected_max: expected,
                    actual,
                })
            }
        };
        Ok(match kind {
            BusReplyKind::BoardDump => BusReply::BoardDump(decode_pieces(data)?),
            BusReplyKind::BwTime => BusReply::Clock(decode_bwtime(data)?),
            BusReplyKind::Update => BusReply::Update(collect_events(data)?),
            BusReplyKind::FromStart => BusReply::FromStart(collect_events(data)?),
            BusReplyKind::Ping => {
                require(BUS_REPLY_MIN_SIZE)?;
                BusReply::Ping
            }
            BusReplyKind::StartGameWritten => {
                require(BUS_REPLY_MIN_SIZE)?;
                BusReply::StartGameWritten
            }
            BusReplyKind::Version => {
                require(BUS_VERSION_SIZE)?;
                BusReply::Version {
                    major: data[0],
                    minor: data[1],
                }
            }
            BusReplyKind::BoardDump50Black => BusReply::BoardDump50Black(data.to_vec()),
        })
    }
}

fn collect_events(data: &[u8]) -> Result<Vec<EepromEvent>, ProtocolError> {
    decode_changes(data)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ProtocolError::from)
}

// ── Device-side mode machine ──────────────────────────────────────────────────

/// Which command set a board currently listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardMode {
    Bus,
    SingleBoard,
}

/// What a board does with an incoming command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// Not for this board, or suppressed.
    Ignore,
    /// The command only switched the mode and is not processed further.
    ModeSwitched(BoardMode),
    /// Process the bus command and answer immediately.
    Process(BusCommand),
    /// Answer a broadcast ping after `delay`.
    ReplyAfter { command: BusCommand, delay: Duration },
    /// Process a single-board command.
    ProcessSingle(u8),
}

/// Model of one board's bus behaviour, for emulators and tests.
#[derive(Debug)]
pub struct BusDevice {
    address: BusAddress,
    mode: BoardMode,
    ignore_next_ping: bool,
    ping_window: Duration,
    rng: StdRng,
}

impl BusDevice {
    /// A board at power-up: bus mode.
    pub fn new(address: BusAddress, ping_window: Duration) -> Self {
        Self::with_rng(address, ping_window, StdRng::from_entropy())
    }

    /// Same as [`new`](Self::new) with a caller-supplied RNG.
    pub fn with_rng(address: BusAddress, ping_window: Duration, rng: StdRng) -> Self {
        Self {
            address,
            mode: BoardMode::Bus,
            ignore_next_ping: false,
            ping_window,
            rng,
        }
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    pub fn mode(&self) -> BoardMode {
        self.mode
    }

    /// Handles a raw bus command frame; frames that fail to parse are ignored.
    pub fn on_frame(&mut self, bytes: &[u8]) -> DeviceAction {
        match decode_bus_command(bytes) {
            Ok((command, address)) => self.on_bus_command(command, address),
            Err(e) => {
                debug!(error = %e, "board ignores bad bus frame");
                DeviceAction::Ignore
            }
        }
    }

    /// Handles a single-board command byte.
    pub fn on_single_board_command(&mut self, code: u8) -> DeviceAction {
        if code == DGT_TO_BUSMODE {
            self.mode = BoardMode::Bus;
            return DeviceAction::ModeSwitched(BoardMode::Bus);
        }
        if self.mode == BoardMode::Bus {
            info!(address = self.address.0, "board leaves bus mode");
            self.mode = BoardMode::SingleBoard;
        }
        DeviceAction::ProcessSingle(code)
    }

    /// Handles a parsed bus command.
    pub fn on_bus_command(&mut self, command: BusCommand, address: BusAddress) -> DeviceAction {
        if self.mode == BoardMode::SingleBoard {
            info!(address = self.address.0, "board returns to bus mode");
            self.mode = BoardMode::Bus;
            return DeviceAction::ModeSwitched(BoardMode::Bus);
        }

        if address.is_broadcast() {
            return match command {
                BusCommand::Ping if self.ignore_next_ping => {
                    self.ignore_next_ping = false;
                    DeviceAction::Ignore
                }
                BusCommand::Ping => DeviceAction::ReplyAfter {
                    command,
                    delay: self.ping_delay(),
                },
                BusCommand::EndBusMode => {
                    self.mode = BoardMode::SingleBoard;
                    DeviceAction::Process(command)
                }
                BusCommand::Reset => DeviceAction::Process(command),
                _ => DeviceAction::Ignore,
            };
        }
        if address != self.address {
            return DeviceAction::Ignore;
        }

        match command {
            BusCommand::IgnoreNextPing => self.ignore_next_ping = true,
            BusCommand::EndBusMode => self.mode = BoardMode::SingleBoard,
            _ => {}
        }
        DeviceAction::Process(command)
    }

    fn ping_delay(&mut self) -> Duration {
        let window = self.ping_window.as_millis() as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..window))
    }
}

// ── Host side ─────────────────────────────────────────────────────────────────

/// Byte transport to the bus.
#[cfg_attr(test, mockall::automock)]
pub trait BusLink {
    /// Writes a whole command frame.
    fn send(&mut self, bytes: &[u8]) -> Result<(), BusError>;

    /// Returns whatever arrives within `timeout`; empty means nothing did.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, BusError>;
}

/// Timing and retry limits for a [`BusMaster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait per attempt before treating a command as lost.
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Window over which boards spread their broadcast ping replies.
    pub ping_window: Duration,
    /// Upper bound on broadcast rounds during discovery.
    pub discovery_rounds: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(80),
            max_attempts: 3,
            ping_window: Duration::from_millis(1100),
            discovery_rounds: 4,
        }
    }
}

/// Host side of the bus: addressed requests with retry, and discovery.
#[derive(Debug)]
pub struct BusMaster<L: BusLink> {
    link: L,
    policy: RetryPolicy,
}

impl<L: BusLink> BusMaster<L> {
    pub fn new(link: L, policy: RetryPolicy) -> Self {
        Self { link, policy }
    }

    /// A master using the timing from the `[bus]` config section.
    pub fn from_config(link: L, config: &BusConfig) -> Self {
        Self::new(link, config.retry_policy())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Gives the link back.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Sends `command` to one board and collects its checked replies.
    ///
    /// Timeouts, checksum failures and unexpected replies are retried up to
    /// `max_attempts` times, using [`resend_command_for`]. A failed `SendAll`
    /// is recovered as `RepeatChanges`, `SendClock` and `SendBoard`, each with
    /// its own retries, so the replies keep the same order. Commands without
    /// a reply (Reset, EndBusMode) return an empty list once sent.
    ///
    /// # Errors
    ///
    /// The last retryable error once attempts run out, or the first
    /// non-retryable one.
    pub fn request(
        &mut self,
        command: BusCommand,
        address: BusAddress,
    ) -> Result<Vec<BusEnvelope>, BusError> {
        let expected = command.expected_replies();
        if expected.is_empty() {
            self.link.send(&encode_bus_command(command, address))?;
            return Ok(Vec::new());
        }
        if address.is_broadcast() {
            return Err(BusError::BroadcastRequest(command as u8));
        }

        let mut attempt_command = command;
        let mut last_error = BusError::Timeout(self.policy.timeout);
        for attempt in 1..=self.policy.max_attempts.max(1) {
            debug!(command = attempt_command as u8, address = address.0, attempt, "bus request");
            self.link.send(&encode_bus_command(attempt_command, address))?;
            match self.collect(address, expected) {
                Ok(replies) => return Ok(replies),
                Err(e) if e.is_retryable() && command == BusCommand::SendAll => {
                    warn!(address = address.0, error = %e, "send-all failed, fetching changes, clock and board separately");
                    return self.recover_send_all(address);
                }
                Err(e) if e.is_retryable() => {
                    warn!(command = command as u8, address = address.0, attempt, error = %e, "bus request failed, retrying");
                    last_error = e;
                    attempt_command = resend_command_for(command);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// [`request`](Self::request) followed by decoding each reply body.
    pub fn query(
        &mut self,
        command: BusCommand,
        address: BusAddress,
    ) -> Result<Vec<BusReply>, BusError> {
        self.request(command, address)?
            .iter()
            .map(|env| BusReply::decode(env).map_err(BusError::from))
            .collect()
    }

    /// Finds every board on the bus.
    ///
    /// Each round tells the boards found so far to ignore the next broadcast,
    /// then broadcasts a ping and listens for the whole reply window. Stops
    /// when a round finds nobody new or after `discovery_rounds` rounds.
    pub fn discover(&mut self) -> Result<Vec<BusAddress>, BusError> {
        let mut found: Vec<BusAddress> = Vec::new();
        for round in 0..self.policy.discovery_rounds {
            for &address in &found {
                if let Err(e) = self.request(BusCommand::IgnoreNextPing, address) {
                    warn!(address = address.0, error = %e, "board did not confirm ignore-next-ping");
                }
            }
            self.link
                .send(&encode_bus_command(BusCommand::Ping, BusAddress::BROADCAST))?;
            let bytes = self
                .link
                .receive(self.policy.ping_window + self.policy.timeout)?;

            let mut fresh = Vec::new();
            for address in ping_addresses(&bytes) {
                if !found.contains(&address) && !fresh.contains(&address) {
                    fresh.push(address);
                }
            }
            debug!(round, new = fresh.len(), "bus discovery round");
            if fresh.is_empty() {
                break;
            }
            found.extend(fresh);
        }
        info!(boards = found.len(), "bus discovery finished");
        Ok(found)
    }

    fn recover_send_all(&mut self, address: BusAddress) -> Result<Vec<BusEnvelope>, BusError> {
        let mut replies = Vec::with_capacity(3);
        for command in [
            BusCommand::RepeatChanges,
            BusCommand::SendClock,
            BusCommand::SendBoard,
        ] {
            replies.extend(self.request(command, address)?);
        }
        Ok(replies)
    }

    fn collect(
        &mut self,
        address: BusAddress,
        expected: &[BusReplyKind],
    ) -> Result<Vec<BusEnvelope>, BusError> {
        let mut buf = Vec::new();
        let mut replies = Vec::with_capacity(expected.len());
        while replies.len() < expected.len() {
            match try_decode_bus_reply(&buf) {
                BusReplyStatus::Complete(envelope, used) => {
                    buf.drain(..used);
                    if envelope.address != address {
                        warn!(expected = address.0, got = envelope.address.0, "reply from another board");
                        continue;
                    }
                    let want = expected[replies.len()];
                    if envelope.kind() != Some(want) {
                        return Err(BusError::UnexpectedReply {
                            expected: want as u8,
                            actual: envelope.id,
                        });
                    }
                    replies.push(envelope);
                }
                BusReplyStatus::Invalid { skip, error } => {
                    buf.drain(..skip);
                    if let BusError::ChecksumMismatch { .. } = error {
                        return Err(error);
                    }
                    warn!(%error, skip, "discarding bus bytes");
                }
                BusReplyStatus::Incomplete => {
                    let bytes = self.link.receive(self.policy.timeout)?;
                    if bytes.is_empty() {
                        return Err(BusError::Timeout(self.policy.timeout));
                    }
                    buf.extend_from_slice(&bytes);
                }
            }
        }
        Ok(replies)
    }
}

/// Addresses of every intact ping reply in `bytes`.
fn ping_addresses(mut bytes: &[u8]) -> Vec<BusAddress> {
    let mut out = Vec::new();
    loop {
        match try_decode_bus_reply(bytes) {
            BusReplyStatus::Complete(env, used) => {
                if env.kind() == Some(BusReplyKind::Ping) {
                    out.push(env.address);
                }
                bytes = &bytes[used..];
            }
            BusReplyStatus::Invalid { skip, error } => {
                debug!(%error, "skipping damaged ping reply");
                bytes = &bytes[skip..];
            }
            BusReplyStatus::Incomplete => return out,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
