//! Score conventions of the Chess Cloud Database.
//!
//! Scores are centipawns from the point of view of the side to move, except
//! for a band of special values: anything at or above `CDB_SPECIAL` in
//! magnitude encodes a decided game. Within that band, cursed tablebase wins
//! sit between `CDB_SPECIAL` and `CDB_CURSED`, proven tablebase wins at
//! `CDB_TBWIN`, and checkmate at `CDB_MATE`. The remote convention is that a
//! winning score shrinks by one for every ply the win is delayed, so mate
//! scores read as "distance to mate".
//!
//! The search negates scores across plies, which would drift the special
//! band by one per ply in the wrong direction. To keep the local values on
//! the remote convention, the adapter stretches every special score one away
//! from zero on ingress, and the search shrinks its best score one toward
//! zero before returning. The two adjustments cancel at every node while
//! letting negation do the right thing in between.

/// Score type used throughout the engine.
pub type Score = i32;

/// Lower bound of the special band: scores at or above this magnitude encode
/// decided games rather than evaluations.
pub const CDB_SPECIAL: Score = 10_000;

/// Upper bound of the cursed band: wins in here are broken by the 50 move
/// rule and count as draws unless the search is told otherwise.
pub const CDB_CURSED: Score = 20_000;

/// A proven tablebase win.
pub const CDB_TBWIN: Score = 25_000;

/// Checkmate.
pub const CDB_MATE: Score = 30_000;

pub trait ScoreExt {
    /// Whether the score encodes a decided game.
    fn is_special(self) -> bool;

    /// Grow the magnitude by one, ingress half of the distance-to-mate
    /// compensation.
    fn away_from_zero(self) -> Self;

    /// Shrink the magnitude by one, egress half of the distance-to-mate
    /// compensation.
    fn toward_zero(self) -> Self;
}

impl ScoreExt for Score {
    fn is_special(self) -> bool {
        self.abs() >= CDB_SPECIAL
    }

    fn away_from_zero(self) -> Self {
        self + self.signum()
    }

    fn toward_zero(self) -> Self {
        self - self.signum()
    }
}
