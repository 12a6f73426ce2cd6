//! Board model and the reconstructor that keeps it in step with the device.
//!
//! Fields are numbered the way the board reports them: field 0 is the top-left
//! square seen from White's side (a8), field 63 the bottom-right (h1). In the
//! standard orientation White's pieces stand on rows 6 and 7.
//!
//! # Position tags (for beginners)
//!
//! The board firmware writes a tag into its event log whenever it recognises a
//! special position: the start position, the start position turned 180°,
//! "four rows" (all 32 pieces on their home rows, in any arrangement) or an
//! empty board. A single piece that wobbles on its square would make the board
//! leave and re-enter such a position many times, so the firmware only writes
//! the tag again after the board has moved more than two cells away from the
//! pattern. [`Reconstructor`] applies the same rule to the positions it builds
//! from live updates.

use std::collections::VecDeque;

use crate::protocol::eeprom::EepromEvent;
use crate::protocol::messages::{Message, Piece, FIELD_COUNT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Cells that may differ from a pattern without re-arming its detector.
pub const DEFAULT_HYSTERESIS_CELLS: usize = 2;

/// Field changes kept before the oldest are dropped.
pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 1024;

const BACK_RANK: [Piece; 8] = [
    Piece::WhiteRook,
    Piece::WhiteKnight,
    Piece::WhiteBishop,
    Piece::WhiteQueen,
    Piece::WhiteKing,
    Piece::WhiteBishop,
    Piece::WhiteKnight,
    Piece::WhiteRook,
];

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised by the board model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoardError {
    /// A field index outside 0..=63.
    #[error("field {0} is outside the board")]
    FieldOutOfRange(u8),

    /// A board must have exactly 64 cells.
    #[error("a board has {FIELD_COUNT} cells, got {0}")]
    WrongSize(usize),
}

// ── Board ─────────────────────────────────────────────────────────────────────

/// The 64 cells of a board in device numbering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Piece>", into = "Vec<Piece>")]
pub struct BoardState {
    cells: Vec<Piece>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<Vec<Piece>> for BoardState {
    type Error = BoardError;

    fn try_from(cells: Vec<Piece>) -> Result<Self, BoardError> {
        if cells.len() != FIELD_COUNT {
            return Err(BoardError::WrongSize(cells.len()));
        }
        Ok(Self { cells })
    }
}

impl From<BoardState> for Vec<Piece> {
    fn from(board: BoardState) -> Self {
        board.cells
    }
}

impl BoardState {
    pub fn empty() -> Self {
        Self {
            cells: vec![Piece::Empty; FIELD_COUNT],
        }
    }

    /// The standard start position, White on rows 6 and 7.
    pub fn begin_position() -> Self {
        let mut cells = vec![Piece::Empty; FIELD_COUNT];
        for (col, &white) in BACK_RANK.iter().enumerate() {
            cells[col] = black_counterpart(white);
            cells[8 + col] = Piece::BlackPawn;
            cells[48 + col] = Piece::WhitePawn;
            cells[56 + col] = white;
        }
        Self { cells }
    }

    /// The start position turned 180°, White on rows 0 and 1.
    pub fn begin_position_rotated() -> Self {
        let mut cells = Self::begin_position().cells;
        cells.reverse();
        Self { cells }
    }

    /// Builds a board from 64 pieces, e.g. the body of a board dump.
    pub fn from_pieces(pieces: &[Piece]) -> Result<Self, BoardError> {
        Self::try_from(pieces.to_vec())
    }

    pub fn cells(&self) -> &[Piece] {
        &self.cells
    }

    pub fn get(&self, field: u8) -> Result<Piece, BoardError> {
        self.cells
            .get(usize::from(field))
            .copied()
            .ok_or(BoardError::FieldOutOfRange(field))
    }

    /// Puts `piece` on `field` and returns what was there before.
    pub fn set(&mut self, field: u8, piece: Piece) -> Result<Piece, BoardError> {
        let cell = self
            .cells
            .get_mut(usize::from(field))
            .ok_or(BoardError::FieldOutOfRange(field))?;
        Ok(std::mem::replace(cell, piece))
    }

    pub fn clear(&mut self) {
        self.cells.fill(Piece::Empty);
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|p| **p != Piece::Empty).count()
    }

    /// Number of cells whose contents differ from `other`.
    pub fn diff_count(&self, other: &BoardState) -> usize {
        self.cells
            .iter()
            .zip(&other.cells)
            .filter(|(a, b)| a != b)
            .count()
    }

    /// Piece-placement field of a FEN string, rows in device order.
    ///
    /// Magic pieces have no FEN letter and render as empty squares.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dgt_core::domain::board::BoardState;
    ///
    /// assert_eq!(
    ///     BoardState::begin_position().to_fen_placement(),
    ///     "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR"
    /// );
    /// ```
    pub fn to_fen_placement(&self) -> String {
        let mut out = String::with_capacity(71);
        for (row, cells) in self.cells.chunks(8).enumerate() {
            if row > 0 {
                out.push('/');
            }
            let mut gap = 0u8;
            for piece in cells {
                match piece.fen_char() {
                    Some(c) => {
                        if gap > 0 {
                            out.push(char::from(b'0' + gap));
                            gap = 0;
                        }
                        out.push(c);
                    }
                    None => gap += 1,
                }
            }
            if gap > 0 {
                out.push(char::from(b'0' + gap));
            }
        }
        out
    }
}

fn black_counterpart(white: Piece) -> Piece {
    Piece::from_nibble(white.code() + 6)
}

// ── Position tags ─────────────────────────────────────────────────────────────

/// A recognised special position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionTag {
    BeginPosition,
    BeginPositionRotated,
    FourRows,
    EmptyBoard,
}

impl PositionTag {
    pub const ALL: [PositionTag; 4] = [
        PositionTag::BeginPosition,
        PositionTag::BeginPositionRotated,
        PositionTag::FourRows,
        PositionTag::EmptyBoard,
    ];

    /// How many cells of `board` keep it from matching this tag's pattern.
    pub fn distance(self, board: &BoardState) -> usize {
        match self {
            PositionTag::BeginPosition => board.diff_count(&BoardState::begin_position()),
            PositionTag::BeginPositionRotated => {
                board.diff_count(&BoardState::begin_position_rotated())
            }
            PositionTag::EmptyBoard => board.occupied_count(),
            PositionTag::FourRows => board
                .cells()
                .iter()
                .enumerate()
                .filter(|(i, p)| {
                    let home_row = matches!(i / 8, 0 | 1 | 6 | 7);
                    home_row == (**p == Piece::Empty)
                })
                .count(),
        }
    }

    pub fn matches(self, board: &BoardState) -> bool {
        if self.distance(board) != 0 {
            return false;
        }
        // Both start positions also fill the home rows; they win.
        self != PositionTag::FourRows
            || (!PositionTag::BeginPosition.matches(board)
                && !PositionTag::BeginPositionRotated.matches(board))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Detector {
    tag: PositionTag,
    armed: bool,
}

// ── Reconstructor ─────────────────────────────────────────────────────────────

/// One applied field change, as kept in the raw change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub field: u8,
    pub piece: Piece,
    pub previous: Piece,
}

/// Rebuilds the board from dumps, live updates and logged events.
///
/// Live updates may arrive in any order: a capture can report the new piece
/// before the lifted one, and squares a piece merely passed over may never be
/// reported. Every update just overwrites its cell.
///
/// Applied field changes are also kept in a bounded log: once it holds
/// `change_log_capacity` records, each new one evicts the oldest.
#[derive(Debug, Clone)]
pub struct Reconstructor {
    board: BoardState,
    detectors: [Detector; 4],
    hysteresis_cells: usize,
    change_log_capacity: usize,
    changes: VecDeque<ChangeRecord>,
}

impl Default for Reconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconstructor {
    pub fn new() -> Self {
        Self::with_hysteresis(DEFAULT_HYSTERESIS_CELLS)
    }

    pub fn with_hysteresis(hysteresis_cells: usize) -> Self {
        Self::with_limits(hysteresis_cells, DEFAULT_CHANGE_LOG_CAPACITY)
    }

    /// A capacity of zero keeps no change log at all.
    pub fn with_limits(hysteresis_cells: usize, change_log_capacity: usize) -> Self {
        Self {
            board: BoardState::empty(),
            detectors: PositionTag::ALL.map(|tag| Detector { tag, armed: true }),
            hysteresis_cells,
            change_log_capacity,
            changes: VecDeque::new(),
        }
    }

    pub fn board(&self) -> &BoardState {
        &self.board
    }

    pub fn hysteresis_cells(&self) -> usize {
        self.hysteresis_cells
    }

    pub fn change_log_capacity(&self) -> usize {
        self.change_log_capacity
    }

    /// Whether `tag` would fire the next time the board matches it.
    pub fn is_armed(&self, tag: PositionTag) -> bool {
        self.detectors
            .iter()
            .any(|d| d.tag == tag && d.armed)
    }

    /// Applies one live field update; returns the tags it triggered.
    pub fn apply_field_update(
        &mut self,
        field: u8,
        piece: Piece,
    ) -> Result<Vec<PositionTag>, BoardError> {
        let previous = self.board.set(field, piece)?;
        trace!(field, ?piece, ?previous, "field update");
        self.record_change(ChangeRecord {
            field,
            piece,
            previous,
        });
        Ok(self.run_detectors())
    }

    /// Replaces the whole board with a dump.
    pub fn apply_dump(&mut self, pieces: &[Piece]) -> Result<Vec<PositionTag>, BoardError> {
        self.board = BoardState::from_pieces(pieces)?;
        Ok(self.run_detectors())
    }

    /// Applies the board-changing messages; everything else is a no-op.
    pub fn apply_message(&mut self, message: &Message) -> Result<Vec<PositionTag>, BoardError> {
        match message {
            Message::FieldUpdate { field, piece } => self.apply_field_update(*field, *piece),
            Message::BoardDump(pieces) => self.apply_dump(pieces),
            _ => Ok(Vec::new()),
        }
    }

    /// Applies one logged event.
    ///
    /// Tags the device wrote itself set the board to their pattern (where it
    /// has one) and disarm the matching detector without reporting a tag.
    pub fn apply_eeprom_event(
        &mut self,
        event: &EepromEvent,
    ) -> Result<Vec<PositionTag>, BoardError> {
        match *event {
            EepromEvent::FieldChange { field, piece, .. } => {
                return self.apply_field_update(field, piece)
            }
            EepromEvent::PowerUp => {
                self.board.clear();
                for d in &mut self.detectors {
                    d.armed = true;
                }
            }
            EepromEvent::BeginPosition => {
                self.board = BoardState::begin_position();
                self.acknowledge(PositionTag::BeginPosition);
            }
            EepromEvent::BeginPositionRotated => {
                self.board = BoardState::begin_position_rotated();
                self.acknowledge(PositionTag::BeginPositionRotated);
            }
            EepromEvent::EmptyBoard => {
                self.board.clear();
                self.acknowledge(PositionTag::EmptyBoard);
            }
            // The arrangement on the home rows is unknown.
            EepromEvent::FourRows => self.acknowledge(PositionTag::FourRows),
            _ => {}
        }
        Ok(Vec::new())
    }

    /// Applies a sequence of logged events in log order.
    pub fn replay<'a, I>(&mut self, events: I) -> Result<Vec<PositionTag>, BoardError>
    where
        I: IntoIterator<Item = &'a EepromEvent>,
    {
        let mut tags = Vec::new();
        for event in events {
            tags.extend(self.apply_eeprom_event(event)?);
        }
        Ok(tags)
    }

    /// The most recent field changes since the log was last drained, oldest
    /// first.
    pub fn changes(&self) -> &VecDeque<ChangeRecord> {
        &self.changes
    }

    pub fn take_changes(&mut self) -> Vec<ChangeRecord> {
        self.changes.drain(..).collect()
    }

    /// Back to an empty board with every detector armed.
    pub fn reset(&mut self) {
        *self = Self::with_limits(self.hysteresis_cells, self.change_log_capacity);
    }

    fn record_change(&mut self, record: ChangeRecord) {
        if self.change_log_capacity == 0 {
            return;
        }
        if self.changes.len() == self.change_log_capacity {
            self.changes.pop_front();
        }
        self.changes.push_back(record);
    }

    fn run_detectors(&mut self) -> Vec<PositionTag> {
        let mut fired = Vec::new();
        for d in &mut self.detectors {
            if d.armed {
                if d.tag.matches(&self.board) {
                    d.armed = false;
                    debug!(tag = ?d.tag, "position tag");
                    fired.push(d.tag);
                }
            } else if d.tag.distance(&self.board) > self.hysteresis_cells {
                d.armed = true;
            }
        }
        fired
    }

    fn acknowledge(&mut self, tag: PositionTag) {
        for d in &mut self.detectors {
            if d.tag == tag {
                d.armed = false;
            } else if d.tag.distance(&self.board) > self.hysteresis_cells {
                d.armed = true;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
