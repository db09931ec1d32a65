//! The client for the Chess Cloud Database API.
//!
//! The API is a single http endpoint taking an `action` and a `board`
//! parameter. Four actions matter to us: `queryall` returns every scored
//! move of a position, `queue` asks the remote to have a position evaluated,
//! `querypv` returns the remote's principal variation, and `clearlimit`
//! resets the per-client rate limit.
//!
//! `queryall` is the workhorse and the only call with delivery guarantees:
//! it keeps retrying with growing backoff until the remote produces a usable
//! answer. Transient network errors, malformed replies, rate limiting and
//! unknown positions are all absorbed here; the caller either gets scored
//! moves or an explicit invalid-board sentinel, never an error. The engine
//! shuts the whole task down if it wants to give up.
//!
//! Every request holds a permit of the work semaphore, which is what bounds
//! the number of concurrent connections to the remote, no matter how wide
//! the search tree fans out.

use std::sync::Arc;
use std::time::Duration;

use chess::Position;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::counters::Counters;
use crate::score::{Score, ScoreExt, CDB_CURSED};
use crate::transpositions::ScoredMoves;
use crate::SearchOptions;

/// Ceiling for the retry backoff.
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Growth factor of the retry backoff.
const BACKOFF: f64 = 1.5;

pub struct CdbClient {
    http: reqwest::Client,
    base: String,
    cursed_wins: bool,
    retry_timeout: Duration,

    /// Bounds the total number of in-flight requests.
    work: Semaphore,

    counters: Arc<Counters>,
}

/// A single scored move in a `queryall` reply.
#[derive(Debug, Deserialize)]
struct WireMove {
    uci: String,
    score: Score,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    status: Option<String>,
    moves: Option<Vec<WireMove>>,
    pv: Option<Vec<String>>,
}

impl CdbClient {
    pub fn new(options: &SearchOptions, counters: Arc<Counters>) -> anyhow::Result<Self> {
        let user_agent = match &options.user {
            Some(user) => format!("cdbsearch/{user}"),
            None => "cdbsearch".to_string(),
        };

        let http = reqwest::Client::builder().user_agent(user_agent).build()?;

        Ok(Self {
            http,
            base: options.api_base.clone(),
            cursed_wins: options.cursed_wins,
            retry_timeout: options.retry_timeout,
            work: Semaphore::new(options.concurrency.max(1)),
            counters,
        })
    }

    /// One GET against the endpoint, parsed as json. Any failure along the
    /// way (connect, timeout, http status, body) comes back as `None` and is
    /// the caller's retry problem.
    async fn apicall(&self, query: &[(&str, &str)], timeout: Duration) -> Option<Value> {
        let _permit = self.work.acquire().await.expect("work semaphore is never closed");

        self.counters.inflight_requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let reply = self
            .http
            .get(&self.base)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        let content = match reply {
            Ok(response) => response.json().await.ok(),
            Err(_) => None,
        };

        self.counters.inflight_requests.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);

        content
    }

    /// Query the remote for the scored moves of a position, retrying until
    /// an answer comes back.
    pub async fn queryall(&self, epd: &str) -> ScoredMoves {
        let mut timeout = self.retry_timeout;
        let mut first = true;
        let mut enqueued = false;
        let mut lasterror = "";

        loop {
            // Back off a bit more before every further attempt, up to a cap.
            if !first {
                if timeout < MAX_TIMEOUT {
                    timeout = timeout.mul_f64(BACKOFF).min(MAX_TIMEOUT);
                } else {
                    warn!("still no reply for {epd}, last error: {lasterror}");
                }
                debug!("retrying queryall for {epd} after {timeout:?}: {lasterror}");
                tokio::time::sleep(timeout).await;
            }
            first = false;

            let content = self
                .apicall(&[("action", "queryall"), ("board", epd), ("json", "1")], timeout)
                .await;

            let Some(content) = content else {
                lasterror = "queryall request failed";
                continue;
            };

            let Ok(reply) = serde_json::from_value::<WireReply>(content) else {
                lasterror = "unparsable queryall reply";
                continue;
            };

            let Some(status) = reply.status.as_deref() else {
                lasterror = "reply without status";
                continue;
            };

            match status {
                "ok" => {
                    let Some(moves) = reply.moves else {
                        lasterror = "ok reply without moves";
                        continue;
                    };

                    let mut result = ScoredMoves::new(0);
                    for mv in moves {
                        result.insert(&mv.uci, ingest(mv.score, self.cursed_wins));
                    }
                    return result;
                }

                // The remote agrees the game is over: no moves to report.
                "checkmate" | "stalemate" => return ScoredMoves::new(0),

                "invalid board" => return ScoredMoves::invalid(),

                "unknown" => {
                    // Ask the remote to evaluate the position, then try again.
                    if !enqueued {
                        enqueued = true;
                        Counters::inc(&self.counters.enqueued);
                    }

                    let Some(queued) = self
                        .apicall(&[("action", "queue"), ("board", epd), ("json", "1")], timeout)
                        .await
                    else {
                        lasterror = "queue request failed";
                        continue;
                    };

                    // An empty reply means the position cannot be queued at
                    // all, e.g. a tablebase position with castling rights.
                    // Score every legal move near-draw (0 stays reserved for
                    // true tablebase draws) and let the search figure it out.
                    if queued.as_object().is_some_and(|object| object.is_empty()) {
                        let mut result = ScoredMoves::new(0);
                        if let Ok(position) = Position::from_fen(epd) {
                            for uci in position.legal_moves() {
                                result.insert(&uci, 1);
                            }
                        }
                        return result;
                    }

                    lasterror = "position enqueued";
                    continue;
                }

                "rate limit exceeded" => {
                    self.apicall(&[("action", "clearlimit")], timeout).await;
                    lasterror = "asked to clear the rate limit";
                    continue;
                }

                _ => {
                    lasterror = "surprise status";
                    continue;
                }
            }
        }
    }

    /// Ask the remote to (re)evaluate a position. Single shot, best effort.
    pub async fn queue(&self, epd: &str) {
        self.apicall(&[("action", "queue"), ("board", epd), ("json", "1")], self.retry_timeout)
            .await;
    }

    /// The remote's own principal variation for a position. Single shot,
    /// `None` when the remote has nothing useful.
    pub async fn querypv(&self, epd: &str) -> Option<Vec<String>> {
        let content = self
            .apicall(&[("action", "querypv"), ("board", epd), ("json", "1")], self.retry_timeout)
            .await?;

        let reply = serde_json::from_value::<WireReply>(content).ok()?;

        match reply.status.as_deref() {
            Some("ok") => reply.pv.filter(|pv| !pv.is_empty()),
            _ => None,
        }
    }
}

/// Rewrite a score from the wire into the engine's convention.
///
/// Cursed wins collapse to draws unless they are to be treated as real wins,
/// and every other decided score grows one away from zero so that the
/// egress shrink in the search restores the remote's distance-to-mate
/// convention at each ply.
fn ingest(score: Score, cursed_wins: bool) -> Score {
    if !score.is_special() {
        score
    } else if !cursed_wins && score.abs() <= CDB_CURSED {
        0
    } else {
        score.away_from_zero()
    }
}

////////////////////////////////////////////////////////////////////////////////
//
// Tests
//
////////////////////////////////////////////////////////////////////////////////
