// Search policy parameters

/// Positions with at most this many pieces are fully covered by tablebases.
pub const CDB_EGTB: usize = 7;

/// The remote keeps at least this many moves of a position scored; fewer
/// than that means the position deserves a requeue.
pub const CDB_SIEVED: i64 = 5;

/// Above this depth, a node with unscored moves gets a second, table
/// bypassing query so freshly scored moves are picked up.
pub const DEPTH_FORCE_QUERY: i64 = 10;

/// Minimum depth for the single-reply extension.
pub const DEPTH_ALLOW_EXTS: i64 = 4;

/// How far past the nominal depth extensions may push a branch before only
/// the PV move is allowed to continue.
pub const DEPTH_MAX_EXTENSION: i64 = 10;

/// When the depth outgrows the number of scored moves by this much, one
/// unscored move is searched no matter how bad it looks.
pub const DEPTH_UNSCORED: i64 = 25;

/// Minimum depth for scheduling a PV reprobe.
pub const DEPTH_REPROBE_PV: i64 = 16;

/// Fraction of the uncached queries we are willing to spend on reprobing,
/// in percent.
pub const PERCENT_REPROBE_PV: u64 = 1;
