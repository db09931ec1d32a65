//! The `Position` type wraps a `shakmaty` board and keeps track of the game
//! data the backend itself has no knowledge of: the stack of moves that were
//! played to reach the current board, and the hashes we need for claiming
//! draws by repetition.
//!
//! The search pushes and pops moves on clones of a single root position, so
//! the stack stores a snapshot of the board before every move. That makes
//! `pop` trivial and keeps repetition counting exact, at the cost of a couple
//! hundred bytes per ply.

use anyhow::{anyhow, Result};
use shakmaty::fen::{Epd, Fen};
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position as _};

/// A board position along with the moves that were played to reach it.
#[derive(Debug, Clone)]
pub struct Position {
    /// EPD of the position the move stack starts from, as it was handed to
    /// us. Used for building chessdb.cn links.
    initial_epd: String,

    /// The current board.
    board: Chess,

    /// Snapshots of the board before each pushed move, most recent last.
    stack: Vec<Ply>,
}

#[derive(Debug, Clone)]
struct Ply {
    uci: String,
    before: Chess,
}

impl Position {
    /// Parse a FEN or EPD string (with or without move counters) into a
    /// position with an empty move stack.
    pub fn from_fen(fen: &str) -> Result<Self> {
        let fen = fen.trim();
        let setup: Fen = fen
            .parse()
            .map_err(|err| anyhow!("cannot parse FEN {fen:?}: {err}"))?;
        let board: Chess = setup
            .into_position(CastlingMode::Standard)
            .map_err(|err| anyhow!("illegal position {fen:?}: {err}"))?;

        let initial_epd = Epd::from_position(board.clone(), EnPassantMode::Legal).to_string();

        Ok(Self { initial_epd, board, stack: Vec::new() })
    }

    /// Parse the extended `<FEN> moves <m1> <m2> ...` root syntax.
    ///
    /// The FEN part must be valid; the move list is played out until the
    /// first move that fails to parse or is illegal, at which point the list
    /// is silently truncated.
    pub fn setup(spec: &str) -> Result<Self> {
        let (fen, moves) = match spec.split_once("moves") {
            Some((fen, moves)) => (fen, moves),
            None => (spec, ""),
        };

        let mut position = Self::from_fen(fen)?;

        for uci in moves.split_whitespace() {
            if position.push_uci(uci).is_err() {
                break;
            }
        }

        Ok(position)
    }

    /// Play a move given in UCI notation.
    pub fn push_uci(&mut self, uci: &str) -> Result<()> {
        let parsed: UciMove = uci
            .parse()
            .map_err(|err| anyhow!("cannot parse UCI move {uci:?}: {err}"))?;

        let mv = parsed
            .to_move(&self.board)
            .map_err(|err| anyhow!("illegal move {uci:?}: {err}"))?;

        self.stack.push(Ply { uci: uci.to_string(), before: self.board.clone() });
        self.board.play_unchecked(&mv);

        Ok(())
    }

    /// Undo the most recent move, returning it, or `None` at the bottom of
    /// the stack.
    pub fn pop(&mut self) -> Option<String> {
        let ply = self.stack.pop()?;
        self.board = ply.before;
        Some(ply.uci)
    }

    /// The EPD identifying the current board.
    pub fn epd(&self) -> String {
        Epd::from_position(self.board.clone(), EnPassantMode::Legal).to_string()
    }

    /// The EPD of the position the move stack started from.
    pub fn initial_epd(&self) -> &str {
        &self.initial_epd
    }

    /// The moves played so far, in UCI notation.
    pub fn played(&self) -> Vec<String> {
        self.stack.iter().map(|ply| ply.uci.clone()).collect()
    }

    /// The number of moves on the stack.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// All legal moves of the current board, in UCI notation. The backend's
    /// generation order is stable, so two calls on equal positions agree.
    pub fn legal_moves(&self) -> Vec<String> {
        self.board
            .legal_moves()
            .iter()
            .map(|mv| mv.to_uci(CastlingMode::Standard).to_string())
            .collect()
    }

    pub fn is_checkmate(&self) -> bool {
        self.board.is_checkmate()
    }

    pub fn is_stalemate(&self) -> bool {
        self.board.is_stalemate()
    }

    pub fn is_insufficient_material(&self) -> bool {
        self.board.is_insufficient_material()
    }

    /// Whether the side to move can claim a draw, either through the 50 move
    /// rule or because the current board occurred three times on the stack.
    pub fn can_claim_draw(&self) -> bool {
        if self.board.halfmoves() >= 100 {
            return true;
        }

        let current = self.hash(&self.board);
        let repetitions = 1 + self
            .stack
            .iter()
            .filter(|ply| self.hash(&ply.before) == current)
            .count();

        repetitions >= 3
    }

    /// The total number of pieces on the board, kings and pawns included.
    pub fn piece_count(&self) -> usize {
        self.board.board().occupied().count()
    }

    fn hash(&self, board: &Chess) -> Zobrist64 {
        board.zobrist_hash(EnPassantMode::Legal)
    }
}

////////////////////////////////////////////////////////////////////////////////
//
// Tests
//
////////////////////////////////////////////////////////////////////////////////
