//! The search logic of the explorer.
//!
//! This is the meat and bones of the crate. The search walks a best-first
//! tree rooted at the user's position: every node asks the remote database
//! for its scored moves, recurses concurrently into the continuations that
//! look good enough for the remaining depth, and combines the children with
//! a fail-soft negamax. There is no local evaluation anywhere; all knowledge
//! comes from the remote scores, which is also why the tree is shaped by an
//! eval-decay rule rather than alpha-beta bounds: a move's deficit against
//! the best move buys it a proportionally shallower subtree.
//!
//! The driver runs iterative deepening on top, which serves the same purpose
//! it serves in a classical engine: every iteration leaves the relevant
//! subtree behind in the transposition table (local and remote), making the
//! next, deeper iteration far cheaper than a cold start.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chess::Position;
use log::info;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use url::Url;

use crate::cdb::CdbClient;
use crate::counters::Counters;
use crate::score::{Score, ScoreExt, CDB_MATE, CDB_SPECIAL};
use crate::transpositions::{ScoredMoves, TTable};
use crate::SearchOptions;

pub(crate) mod params;
mod prover;

use params::*;

/// What a node hands back to its parent: the score of its best move, the
/// principal variation starting with that move, and the deepest level (plies
/// from the search root) reached anywhere in its subtree.
pub type SearchResult = (Score, Vec<String>, usize);

/// PV entries that mark a terminal leaf rather than a move.
pub(crate) fn is_marker(mv: &str) -> bool {
    matches!(mv, "checkmate" | "draw" | "invalid" | "EGTB")
}

/// All the shared state of one exploration: the remote client, the
/// transposition table, the concurrency governors and the counters. One of
/// these is created per root position and shared by every task the search
/// spawns.
pub struct ChessDB {
    options: SearchOptions,
    client: CdbClient,
    counters: Arc<Counters>,
    tt: TTable,

    /// Distance to the leaf of the remote's own PV, per EPD on that PV.
    /// Rewritten at the start of every iteration, read by the search to
    /// extend along the remote's line.
    cdb_pv_to_leaf: Mutex<HashMap<String, i64>>,

    /// One semaphore per tree level, bounding how many nodes of that level
    /// may have child searches in flight at once. The list only ever grows.
    tree_sems: Mutex<Vec<Arc<Semaphore>>>,

    /// Fire-and-forget work (requeues, PV priming, reprobes, prover
    /// probes). Tracked so shutdown can wait for it instead of tearing the
    /// http session down mid-request.
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Nominal depth of the current iteration.
    root_depth: AtomicI64,

    /// Stack length of the search root, for turning stack lengths into
    /// levels.
    root_ply: AtomicUsize,

    started: Instant,
}

impl ChessDB {
    pub fn new(options: SearchOptions) -> anyhow::Result<Arc<Self>> {
        let counters = Arc::new(Counters::default());
        let client = CdbClient::new(&options, Arc::clone(&counters))?;

        Ok(Arc::new(Self {
            options,
            client,
            counters,
            tt: TTable::new(),
            cdb_pv_to_leaf: Mutex::new(HashMap::new()),
            tree_sems: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            root_depth: AtomicI64::new(0),
            root_ply: AtomicUsize::new(0),
            started: Instant::now(),
        }))
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // Queries
    //
    ////////////////////////////////////////////////////////////////////////////

    /// The scored moves of a position, from the transposition table when
    /// possible, from the remote otherwise. A `skip_tt` query bypasses the
    /// table on the way in, to pick up moves the remote scored since we last
    /// asked, but still lands in the table on the way out.
    pub async fn queryall(&self, epd: &str, skip_tt: bool) -> ScoredMoves {
        Counters::inc(&self.counters.queryall);
        self.counters.sample_inflight(&self.counters.sum_inflight_requests);

        if !skip_tt {
            if let Some(entry) = self.tt.get(epd) {
                return entry;
            }
        }

        Counters::inc(&self.counters.uncached);
        self.counters.sample_inflight(&self.counters.sum_inflight_uncached);

        let result = self.client.queryall(epd).await;

        // Another branch may have stored a deeper entry in the meantime;
        // whatever wins the depth contest is what we use.
        self.tt.set(epd, result)
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // Governors
    //
    ////////////////////////////////////////////////////////////////////////////

    /// The fan-out semaphore for a tree level, growing the list on first
    /// use. A slot, once created, is never replaced.
    fn tree_sem(&self, level: usize) -> Arc<Semaphore> {
        let mut sems = self.tree_sems.lock().unwrap();

        while sems.len() <= level {
            sems.push(Arc::new(Semaphore::new(4 * self.options.concurrency.max(1))));
        }

        Arc::clone(&sems[level])
    }

    /// Spawn background work that must be finished (or at least awaited)
    /// before the engine goes away.
    pub(crate) fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
    }

    /// Wait for all tracked background work, including whatever that work
    /// spawns in turn.
    async fn drain_tasks(&self) {
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock().unwrap());
            if batch.is_empty() {
                return;
            }

            for task in batch {
                let _ = task.await;
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // Depth policy
    //
    ////////////////////////////////////////////////////////////////////////////

    /// The depth at which a move is to be searched, given the node's score
    /// bounds and the remaining depth.
    ///
    /// A move's deficit against the best move is converted into a depth
    /// reduction at `eval_decay` centipawns per ply, so the best move always
    /// gets the full `depth - 1` and everything else fades out the further
    /// it trails. An unscored move is treated as if it scored below the
    /// worst scored move and is capped at depth 0, so it gets at most a
    /// lookup, never a subtree. With `eval_decay` 0 any deficit at all is
    /// enough to prune the move.
    pub fn move_depth(&self, best: Score, worst: Score, score: Option<Score>, depth: i64) -> i64 {
        let delta = i64::from(score.unwrap_or(worst) - best);

        let decay = if self.options.eval_decay > 0 {
            // Floor division: a deficit of 1cp already costs a ply.
            delta.div_euclid(self.options.eval_decay)
        } else {
            delta * 1_000_000
        };

        match score {
            Some(_) => depth + decay - 1,
            None => (depth + decay - 2).min(0),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // The selective search
    //
    ////////////////////////////////////////////////////////////////////////////

    /// Search a position to the given depth, returning the best score, the
    /// PV and the deepest level reached in the subtree.
    pub fn search(
        self: Arc<Self>,
        pos: Position,
        depth: i64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = SearchResult> + Send>> {
        Box::pin(self.search_inner(pos, depth))
    }

    async fn search_inner(self: Arc<Self>, pos: Position, depth: i64) -> SearchResult {
        let level = pos.stack_len().saturating_sub(self.root_ply.load(Ordering::Relaxed));

        ////////////////////////////////////////////////////////////////////////
        //
        // Terminal nodes don't need the remote at all
        //
        ////////////////////////////////////////////////////////////////////////

        if pos.is_checkmate() {
            return (-CDB_MATE, vec!["checkmate".to_string()], level);
        }

        if pos.is_stalemate() || pos.is_insufficient_material() || pos.can_claim_draw() {
            return (0, vec!["draw".to_string()], level);
        }

        ////////////////////////////////////////////////////////////////////////
        //
        // Ask the database for the current ranking of the moves
        //
        ////////////////////////////////////////////////////////////////////////

        let epd = pos.epd();
        let scored = self.queryall(&epd, false).await;

        if scored.is_invalid() {
            return (0, vec!["invalid".to_string()], level);
        }

        let legal = pos.legal_moves();

        ////////////////////////////////////////////////////////////////////////
        //
        // Tablebase positions are already solved: take the remote's word for
        // it rather than searching, unless configured to keep going. A best
        // score of magnitude 1 is the manufactured result for a position the
        // remote cannot hold (tablebase with castling rights), which the
        // search does have to figure out on its own.
        //
        ////////////////////////////////////////////////////////////////////////

        if !self.options.tb_search && pos.piece_count() <= CDB_EGTB {
            if let Some((bestmove, bestscore)) = scored.best() {
                if bestscore.abs() != 1 {
                    let bestscore = if bestscore.abs() > CDB_SPECIAL {
                        bestscore.toward_zero()
                    } else {
                        bestscore
                    };
                    return (bestscore, vec![bestmove.to_string(), "EGTB".to_string()], level);
                }
            }
        }

        ////////////////////////////////////////////////////////////////////////
        //
        // Completeness probes
        //
        // If the remote has fewer moves scored than it keeps for known
        // positions, nudge it to evaluate more. Deep nodes with unscored
        // moves additionally get a table-bypassing query, raced against the
        // child searches, to pick up scores that arrived in the meantime.
        //
        ////////////////////////////////////////////////////////////////////////

        let scored_count = scored.len() as i64;
        let legal_count = legal.len() as i64;
        let undersampled = scored_count < CDB_SIEVED.min(legal_count);

        if undersampled {
            Counters::inc(&self.counters.requeued);
            let db = Arc::clone(&self);
            let requeue_epd = epd.clone();
            self.spawn_tracked(async move { db.client.queue(&requeue_epd).await });
        }

        let skip_tt_probe = if (depth > DEPTH_FORCE_QUERY && scored_count < legal_count)
            || undersampled
        {
            let db = Arc::clone(&self);
            let probe_epd = epd.clone();
            Some(tokio::spawn(async move { db.queryall(&probe_epd, true).await }))
        } else {
            None
        };

        ////////////////////////////////////////////////////////////////////////
        //
        // Decide which moves to search, and spawn them
        //
        ////////////////////////////////////////////////////////////////////////

        let (best, worst) = scored.bounds().unwrap_or((-(CDB_MATE + 1), CDB_MATE + 1));

        let moves_to_search = legal
            .iter()
            .filter(|uci| self.move_depth(best, worst, scored.get(uci), depth) >= 0)
            .count();

        let root_depth = self.root_depth.load(Ordering::Relaxed);
        let mut allow_max_extension = true;
        let mut allow_unscored = true;

        let mut result = ScoredMoves::new(depth);
        let mut minicache: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut children: Vec<(String, JoinHandle<SearchResult>)> = Vec::new();
        let mut max_level = level;

        // Hold the level's fan-out slot while children are in flight.
        let slot = self.tree_sem(level);
        let slot = slot.acquire_owned().await.expect("tree semaphore is never closed");

        for uci in &legal {
            let score = scored.get(uci);
            let mut newdepth = self.move_depth(best, worst, score, depth);

            ////////////////////////////////////////////////////////////////////
            //
            // Extensions
            //
            // The best move gets one extra ply when it is the only move left
            // to search, or when this node sits on the remote's PV with more
            // of that line below us than we were going to look at.
            //
            ////////////////////////////////////////////////////////////////////

            if score == Some(best) {
                let only_reply = moves_to_search == 1 && depth > DEPTH_ALLOW_EXTS;
                let on_cdb_pv = self
                    .cdb_pv_to_leaf
                    .lock()
                    .unwrap()
                    .get(&epd)
                    .is_some_and(|to_leaf| *to_leaf > newdepth);

                if only_reply || on_cdb_pv {
                    newdepth += 1;
                }
            }

            // Once extensions have pushed this branch far past the nominal
            // depth, a single PV move per node may keep going; everything
            // else is cut.
            if level as i64 >= root_depth + DEPTH_MAX_EXTENSION {
                if score == Some(best) && allow_max_extension {
                    allow_max_extension = false;
                } else {
                    newdepth = -1;
                }
            }

            ////////////////////////////////////////////////////////////////////
            //
            // Unscored moves
            //
            // At most one per node, and only in positions the remote already
            // covers reasonably. When the depth has outgrown the number of
            // scored moves badly, one unscored move is searched no matter
            // what, so stale rankings cannot starve a node forever.
            //
            ////////////////////////////////////////////////////////////////////

            match score {
                None => {
                    if scored_count < CDB_SIEVED || !allow_unscored {
                        continue;
                    }

                    if depth - scored_count > DEPTH_UNSCORED {
                        newdepth = newdepth.max(0);
                    }

                    if newdepth < 0 {
                        continue;
                    }

                    allow_unscored = false;
                    Counters::inc(&self.counters.unscored);
                }

                Some(score) if newdepth < 0 => {
                    // Not worth a subtree: carry the remote score over as-is.
                    result.insert(uci, score);
                    minicache.insert(uci.clone(), vec![uci.clone()]);
                    continue;
                }

                Some(_) => {}
            }

            let mut child = pos.clone();
            child.push_uci(uci).expect("legal moves always apply");

            let db = Arc::clone(&self);
            children.push((uci.clone(), tokio::spawn(db.search(child, newdepth))));
        }

        ////////////////////////////////////////////////////////////////////////
        //
        // Combine the children, fail-soft negamax style
        //
        ////////////////////////////////////////////////////////////////////////

        for (uci, child) in children {
            let (score, pv, child_level) = child.await.expect("child search never panics");

            max_level = max_level.max(child_level);
            result.insert(&uci, -score);

            let mut line = vec![uci.clone()];
            line.extend(pv);
            minicache.insert(uci, line);
        }

        drop(slot);

        ////////////////////////////////////////////////////////////////////////
        //
        // Fold in the table-bypassing probe
        //
        // Import moves we didn't cover ourselves. Where the probe disagrees
        // with a move we did cover, the remote only wins if we don't hold
        // any entry of our own for the position behind the move.
        //
        ////////////////////////////////////////////////////////////////////////

        if let Some(probe) = skip_tt_probe {
            let fresh = probe.await.expect("probe query never panics");

            if !fresh.is_invalid() {
                for uci in &legal {
                    let Some(score) = fresh.get(uci) else { continue };

                    match result.get(uci) {
                        None => {
                            result.insert(uci, score);
                            minicache.insert(uci.clone(), vec![uci.clone()]);
                        }
                        Some(known) if known != score => {
                            let mut child = pos.clone();
                            child.push_uci(uci).expect("legal moves always apply");

                            if self.tt.get(&child.epd()).is_none() {
                                result.insert(uci, score);
                                minicache.insert(uci.clone(), vec![uci.clone()]);
                            }
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        ////////////////////////////////////////////////////////////////////////
        //
        // Store, pick the best move, and maybe reprobe the PV
        //
        ////////////////////////////////////////////////////////////////////////

        self.tt.set(&epd, result.clone());

        let mut bestmove: Option<(&str, Score)> = None;

        for (uci, score) in result.iter() {
            let better = match bestmove {
                None => true,
                Some((current, bestscore)) => {
                    score > bestscore
                        || (score == bestscore
                            && minicache[uci].len() > minicache[current].len())
                }
            };

            if better {
                bestmove = Some((uci, score));
            }
        }

        // Every move was pruned and nothing was scored: nothing sensible to
        // report for this node.
        let Some((bestmove, mut bestscore)) = bestmove else {
            return (0, vec!["invalid".to_string()], level);
        };

        let pv = minicache[bestmove].clone();

        if depth >= DEPTH_REPROBE_PV {
            let spent = Counters::get(&self.counters.reprobe_queryall)
                + (pos.stack_len() + pv.len()) as u64;
            let budget = Counters::get(&self.counters.uncached) * PERCENT_REPROBE_PV / 100;

            if spent < budget {
                let db = Arc::clone(&self);
                let pos = pos.clone();
                let line = pv.clone();
                self.spawn_tracked(async move { db.reprobe_pv(pos, line).await });
            }
        }

        // Egress half of the distance-to-mate compensation.
        if bestscore.abs() > CDB_SPECIAL {
            bestscore = bestscore.toward_zero();
        }

        (bestscore, pv, max_level)
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // PV reprobing
    //
    ////////////////////////////////////////////////////////////////////////////

    /// Walk a PV to its leaf, then query every position on the way back
    /// down to the bottom of the move stack, bypassing the local table. This
    /// pushes our deeper knowledge of the line into the remote's cache.
    async fn reprobe_pv(&self, mut pos: Position, pv: Vec<String>) {
        for uci in &pv {
            if is_marker(uci) {
                continue;
            }
            if pos.push_uci(uci).is_err() {
                break;
            }
        }

        loop {
            Counters::inc(&self.counters.reprobe_queryall);
            self.queryall(&pos.epd(), true).await;

            if pos.pop().is_none() {
                return;
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // Seeding from the remote's PV
    //
    ////////////////////////////////////////////////////////////////////////////

    /// Fetch the remote's PV for the root and record, for every position on
    /// it, how far that line still goes. The search uses this to extend its
    /// own best line along the remote's. The positions involved also get a
    /// background query each, so their table entries are primed before the
    /// search reaches them.
    async fn seed_cdb_pv(self: Arc<Self>, root: &Position) {
        let root_epd = root.epd();

        let Some(pv) = self.client.querypv(&root_epd).await else {
            return;
        };

        let length = pv.len() as i64;
        let mut to_leaf = HashMap::from([(root_epd.clone(), length)]);
        let mut epds = vec![root_epd];

        let mut pos = root.clone();
        for (ply, uci) in pv.iter().enumerate() {
            if pos.push_uci(uci).is_err() {
                break;
            }

            let epd = pos.epd();
            to_leaf.insert(epd.clone(), length - 1 - ply as i64);
            epds.push(epd);
        }

        *self.cdb_pv_to_leaf.lock().unwrap() = to_leaf;

        for epd in epds {
            let db = Arc::clone(&self);
            self.spawn_tracked(async move {
                db.queryall(&epd, false).await;
            });
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    //
    // The iterative deepening driver
    //
    ////////////////////////////////////////////////////////////////////////////

    /// Explore the root at increasing depths, sending one report per
    /// completed iteration, until the depth limit is reached or the PV
    /// leaves nothing further to explore. Waits for all stray background
    /// work before returning.
    pub async fn explore(self: Arc<Self>, root: Position, reports: UnboundedSender<SearchReport>) {
        self.root_ply.store(root.stack_len(), Ordering::Relaxed);

        let mut depth = 1;

        loop {
            if self.options.depth_limit.is_some_and(|limit| depth > limit) {
                break;
            }

            Arc::clone(&self).seed_cdb_pv(&root).await;
            self.root_depth.store(depth, Ordering::Relaxed);

            let (score, pv, max_level) =
                Arc::clone(&self).search(root.clone(), depth).await;

            info!("depth {depth}: score {score}, pv {}", pv.join(" "));

            // Push the line we just found back into the remote's cache.
            {
                let db = Arc::clone(&self);
                let pos = root.clone();
                let line = pv.clone();
                self.spawn_tracked(async move { db.reprobe_pv(pos, line).await });
            }

            let mut report = self.report(depth, score, &pv, max_level, &root);

            if self.options.prove_mates && pv.last().map(String::as_str) == Some("checkmate") {
                let proven = Arc::clone(&self)
                    .pv_has_proven_mate(root.clone(), pv.clone())
                    .await;

                report.mate = Some(if proven { "CHECKMATE" } else { "checkmate" }.to_string());
            }

            // A PV without a real move, or a root already settled by the
            // tablebases, leaves nothing to deepen.
            let done = report.pvlen == 0
                || (pv.len() <= 2 && pv.last().map(String::as_str) == Some("EGTB"));

            if reports.send(report).is_err() {
                break;
            }

            if done {
                break;
            }

            depth += 1;
        }

        self.drain_tasks().await;
    }

    fn report(
        &self,
        depth: i64,
        score: Score,
        pv: &[String],
        max_level: usize,
        root: &Position,
    ) -> SearchReport {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let queryall = Counters::get(&self.counters.queryall);
        let uncached = Counters::get(&self.counters.uncached);
        let pvlen = pv.iter().filter(|mv| !is_marker(mv)).count();

        SearchReport {
            depth,
            score,
            pv: pv.to_vec(),
            pvlen,
            level: pvlen,
            max_level,
            queryall,
            bf: (queryall as f64).powf(1.0 / depth as f64),
            chessdbq: uncached,
            enqueued: Counters::get(&self.counters.enqueued),
            requeued: Counters::get(&self.counters.requeued),
            unscored: Counters::get(&self.counters.unscored),
            reprobed: Counters::get(&self.counters.reprobe_queryall),
            inflight_q: ratio(Counters::get(&self.counters.sum_inflight_uncached), uncached),
            inflight_r: ratio(Counters::get(&self.counters.sum_inflight_requests), queryall),
            cdb_time_ms: if uncached > 0 { elapsed / uncached } else { 0 },
            total_time: elapsed,
            url: explore_url(root, pv),
            mate: None,
        }
    }
}

fn ratio(sum: u64, count: u64) -> f64 {
    if count > 0 {
        sum as f64 / count as f64
    } else {
        0.0
    }
}

/// The chessdb.cn link showing the root with the played moves and the PV.
fn explore_url(root: &Position, pv: &[String]) -> String {
    let mut line = root.played();
    line.extend(pv.iter().filter(|mv| !is_marker(mv)).cloned());

    let query = if line.is_empty() {
        root.initial_epd().to_string()
    } else {
        format!("{} moves {}", root.initial_epd(), line.join(" "))
    };

    let mut url = Url::parse("https://chessdb.cn/queryc_en/").expect("static base url");
    url.set_query(Some(&query));
    url.to_string()
}

////////////////////////////////////////////////////////////////////////////////
//
// Search Reports
//
////////////////////////////////////////////////////////////////////////////////

/// Everything we know after one iteration, ready to be serialized as one
/// record of the output stream.
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    /// Nominal depth of the iteration.
    pub depth: i64,

    /// Score of the best root move.
    pub score: Score,

    /// The principal variation, possibly ending in a terminal marker.
    pub pv: Vec<String>,

    /// Number of real moves in the PV.
    pub pvlen: usize,

    /// Level of the PV leaf, in plies from the root.
    pub level: usize,

    /// Deepest level reached anywhere in the tree.
    #[serde(rename = "maxLevel")]
    pub max_level: usize,

    /// Total `queryall` calls so far.
    pub queryall: u64,

    /// Effective branching factor: `queryall^(1/depth)`.
    pub bf: f64,

    /// Queries that actually went out to the remote.
    pub chessdbq: u64,

    pub enqueued: u64,
    pub requeued: u64,
    pub unscored: u64,
    pub reprobed: u64,

    /// Average requests in flight per remote fetch.
    #[serde(rename = "inflightQ")]
    pub inflight_q: f64,

    /// Average requests in flight per `queryall`.
    #[serde(rename = "inflightR")]
    pub inflight_r: f64,

    /// Milliseconds spent per remote fetch.
    pub cdb_time_ms: u64,

    /// Milliseconds since the exploration started.
    pub total_time: u64,

    /// Link to the position with the PV on chessdb.cn.
    pub url: String,

    /// `CHECKMATE` when a mate PV was proven, `checkmate` when the proof
    /// didn't go through (yet). Only set with mate proving enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate: Option<String>,
}

////////////////////////////////////////////////////////////////////////////////
//
// Tests
//
////////////////////////////////////////////////////////////////////////////////
