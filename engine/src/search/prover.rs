//! Proving that a mate PV is a forced mate.
//!
//! A search PV that ends in mate only shows one line; the defender might
//! still have an unexplored alternative that escapes. The prover walks the
//! claimed line, and at every defender choice checks that every legal
//! alternative also runs into a mate of its own, using the remote scores to
//! follow each alternative's best line. Attacker moves are taken as given:
//! the claim is "this line mates", not "this is the fastest mate".
//!
//! The proof is conservative: any defender move the remote has not scored
//! yet makes the position unprovable for now. Those moves are queried in the
//! background so a later iteration can finish the job.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chess::Position;

use crate::counters::Counters;
use crate::search::ChessDB;

impl ChessDB {
    /// Check whether a PV ending in `checkmate` is a proven forced mate.
    ///
    /// Defender alternatives are checked concurrently; all of them have to
    /// be proven mates for the claim to hold.
    pub fn pv_has_proven_mate(
        self: Arc<Self>,
        pos: Position,
        pv: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move {
            // Only a line that actually claims mate can prove one.
            if pv.last().map(String::as_str) != Some("checkmate") {
                return false;
            }

            if pv.len() == 1 {
                return pos.is_checkmate();
            }

            // Even remaining length: the attacker is to move, and the
            // claimed move is taken as forced.
            if pv.len() % 2 == 0 {
                let mut pos = pos;
                if pos.push_uci(&pv[0]).is_err() {
                    return false;
                }
                return self.pv_has_proven_mate(pos, pv[1..].to_vec()).await;
            }

            ////////////////////////////////////////////////////////////////////
            //
            // The defender is to move: every legal reply has to lose
            //
            ////////////////////////////////////////////////////////////////////

            let scored = self.queryall(&pos.epd(), false).await;
            if scored.is_invalid() {
                return false;
            }

            let legal = pos.legal_moves();

            // Unscored defender moves make the position unprovable for now.
            // Get them scored in the background and report failure.
            let unscored: Vec<&String> =
                legal.iter().filter(|uci| scored.get(uci).is_none()).collect();

            if !unscored.is_empty() {
                for uci in unscored {
                    Counters::inc(&self.counters.unscored);

                    let mut child = pos.clone();
                    if child.push_uci(uci).is_err() {
                        continue;
                    }

                    let db = Arc::clone(&self);
                    self.spawn_tracked(async move {
                        db.queryall(&child.epd(), false).await;
                    });
                }
                return false;
            }

            // First make sure the claimed line itself mates.
            {
                let mut line = pos.clone();
                if line.push_uci(&pv[0]).is_err() || line.push_uci(&pv[1]).is_err() {
                    return false;
                }

                if !Arc::clone(&self).pv_has_proven_mate(line, pv[2..].to_vec()).await {
                    return false;
                }
            }

            // Then every other defender move, each along its own best line
            // of the same remaining length.
            let mut alternatives = Vec::new();

            for uci in legal.iter().filter(|uci| **uci != pv[0]) {
                let mut child = pos.clone();
                if child.push_uci(uci).is_err() {
                    return false;
                }

                let db = Arc::clone(&self);
                let remaining = (pv.len() - 2) as i64;

                alternatives.push(tokio::spawn(async move {
                    let line = db.obtain_pv(child.clone(), remaining).await;
                    db.pv_has_proven_mate(child, line).await
                }));
            }

            for alternative in alternatives {
                if !alternative.await.expect("prover task never panics") {
                    return false;
                }
            }

            true
        })
    }

    /// Follow the locally best known move chain for up to `plies` plies,
    /// producing a PV in the same shape the search emits.
    async fn obtain_pv(&self, mut pos: Position, plies: i64) -> Vec<String> {
        let mut pv = Vec::new();
        let mut remaining = plies;

        loop {
            if pos.is_checkmate() {
                pv.push("checkmate".to_string());
                return pv;
            }

            if pos.is_stalemate() || pos.is_insufficient_material() || pos.can_claim_draw() {
                pv.push("draw".to_string());
                return pv;
            }

            if remaining <= 0 {
                return pv;
            }

            let scored = self.queryall(&pos.epd(), false).await;

            if scored.is_invalid() {
                pv.push("invalid".to_string());
                return pv;
            }

            let Some((best, _)) = scored.best() else {
                return pv;
            };

            let best = best.to_string();
            if pos.push_uci(&best).is_err() {
                return pv;
            }

            pv.push(best);
            remaining -= 1;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
//
// Tests
//
////////////////////////////////////////////////////////////////////////////////
