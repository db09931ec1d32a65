//! The transposition table maps positions, keyed by their EPD, to the scored
//! move lists the search has computed for them.
//!
//! Unlike an engine hash table there is no fixed size and no eviction: every
//! entry is a position the remote database was asked about, and the whole
//! point of the exercise is to not ask twice. Memory grows with the search.
//!
//! Replacement is monotonic in the search depth an entry was written at.
//! Concurrent branches regularly finish out of order, so `set` keeps
//! whichever of the old and new entry was searched deeper and hands the
//! winner back to the caller.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::score::Score;

/// The scored moves of a single position, together with the search depth the
/// entry was computed at.
///
/// The remote wire format mixes the `depth` bookkeeping field into the move
/// map; here they are separate so the move keys stay homogeneous. The moves
/// live in an ordered map: bestmove selection breaks ties by iteration
/// order, which therefore has to be deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMoves {
    /// Depth the entry was written at. `None` is the sentinel for a position
    /// the remote rejected as an invalid board.
    depth: Option<i64>,

    moves: BTreeMap<String, Score>,
}

impl ScoredMoves {
    pub fn new(depth: i64) -> Self {
        Self { depth: Some(depth), moves: BTreeMap::new() }
    }

    /// The sentinel returned for an invalid board.
    pub fn invalid() -> Self {
        Self { depth: None, moves: BTreeMap::new() }
    }

    pub fn is_invalid(&self) -> bool {
        self.depth.is_none()
    }

    pub fn depth(&self) -> Option<i64> {
        self.depth
    }

    pub fn insert(&mut self, uci: &str, score: Score) {
        self.moves.insert(uci.to_string(), score);
    }

    pub fn get(&self, uci: &str) -> Option<Score> {
        self.moves.get(uci).copied()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Score)> {
        self.moves.iter().map(|(uci, score)| (uci.as_str(), *score))
    }

    /// The highest scored move. Ties go to the first move in map order.
    pub fn best(&self) -> Option<(&str, Score)> {
        self.iter().reduce(|best, entry| if entry.1 > best.1 { entry } else { best })
    }

    /// The `(best, worst)` score bounds, or `None` for an empty entry.
    pub fn bounds(&self) -> Option<(Score, Score)> {
        let mut scores = self.moves.values().copied();
        let first = scores.next()?;

        Some(scores.fold((first, first), |(best, worst), score| {
            (best.max(score), worst.min(score))
        }))
    }
}

/// A concurrent map from EPD to the deepest known `ScoredMoves` entry.
#[derive(Debug, Default)]
pub struct TTable {
    table: Mutex<HashMap<String, ScoredMoves>>,
}

impl TTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a position, returning a copy of its entry.
    pub fn get(&self, epd: &str) -> Option<ScoredMoves> {
        self.table.lock().unwrap().get(epd).cloned()
    }

    /// Store an entry unless the existing one was searched deeper, and
    /// return a copy of whichever entry ends up stored.
    pub fn set(&self, epd: &str, entry: ScoredMoves) -> ScoredMoves {
        let mut table = self.table.lock().unwrap();

        match table.get_mut(epd) {
            Some(existing) if rank(existing) > rank(&entry) => existing.clone(),
            Some(existing) => {
                *existing = entry.clone();
                entry
            }
            None => {
                table.insert(epd.to_string(), entry.clone());
                entry
            }
        }
    }

    pub fn contains(&self, epd: &str) -> bool {
        self.table.lock().unwrap().contains_key(epd)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Replacement rank of an entry. The invalid sentinel orders below any real
/// depth, so a real result always displaces it.
fn rank(entry: &ScoredMoves) -> i64 {
    entry.depth().unwrap_or(-1)
}

////////////////////////////////////////////////////////////////////////////////
//
// Tests
//
////////////////////////////////////////////////////////////////////////////////
