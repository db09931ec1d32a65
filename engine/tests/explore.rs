//! End-to-end tests of the engine against a scripted stand-in for the
//! remote database: a minimal http responder on a local socket that answers
//! each (action, board) pair from a per-test script.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chess::Position;
use engine::counters::Counters;
use engine::score::CDB_MATE;
use engine::{ChessDB, SearchOptions};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

////////////////////////////////////////////////////////////////////////////////
//
// The scripted responder
//
////////////////////////////////////////////////////////////////////////////////

/// Maps `(action, board, nth-call-for-that-pair)` to a response body.
type Script = Arc<dyn Fn(&str, &str, u32) -> String + Send + Sync>;

struct MockCdb {
    base: String,
    hits: Arc<Mutex<HashMap<(String, String), u32>>>,
    max_inflight: Arc<AtomicI64>,
}

impl MockCdb {
    /// Total calls seen for an action, over all boards.
    fn calls(&self, action: &str) -> u32 {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|((seen, _), _)| seen == action)
            .map(|(_, count)| count)
            .sum()
    }

    fn calls_for(&self, action: &str, board: &str) -> u32 {
        *self
            .hits
            .lock()
            .unwrap()
            .get(&(action.to_string(), board.to_string()))
            .unwrap_or(&0)
    }
}

async fn serve(delay: Duration, script: Script) -> MockCdb {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/cdb.php", listener.local_addr().unwrap());

    let hits: Arc<Mutex<HashMap<(String, String), u32>>> = Arc::default();
    let inflight = Arc::new(AtomicI64::new(0));
    let max_inflight = Arc::new(AtomicI64::new(0));

    let mock = MockCdb {
        base,
        hits: Arc::clone(&hits),
        max_inflight: Arc::clone(&max_inflight),
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };

            let script = Arc::clone(&script);
            let hits = Arc::clone(&hits);
            let inflight = Arc::clone(&inflight);
            let max_inflight = Arc::clone(&max_inflight);

            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];

                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }

                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let url = url::Url::parse(&format!("http://mock{path}")).unwrap();

                let mut action = String::new();
                let mut board = String::new();
                for (key, value) in url.query_pairs() {
                    match key.as_ref() {
                        "action" => action = value.into_owned(),
                        "board" => board = value.into_owned(),
                        _ => {}
                    }
                }

                let nth = {
                    let mut hits = hits.lock().unwrap();
                    let count = hits.entry((action.clone(), board.clone())).or_insert(0);
                    let nth = *count;
                    *count += 1;
                    nth
                };

                let current = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                max_inflight.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                inflight.fetch_sub(1, Ordering::SeqCst);

                let body = script(&action, &board, nth);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );

                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    mock
}

fn options(mock: &MockCdb) -> SearchOptions {
    SearchOptions {
        api_base: mock.base.clone(),
        retry_timeout: Duration::from_millis(25),
        ..SearchOptions::default()
    }
}

const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// White is in check and has exactly one legal move, Bxe2, which mates.
const FORCED_MATE: &str = "8/1R6/k1P5/8/1P4n1/8/4nP1r/5BK1 w - - 0 1";

////////////////////////////////////////////////////////////////////////////////
//
// Scenarios
//
////////////////////////////////////////////////////////////////////////////////

#[tokio::test(flavor = "multi_thread")]
async fn a_forced_mate_line_scores_one_below_mate() {
    let root = Position::from_fen(FORCED_MATE).unwrap();
    assert_eq!(root.legal_moves(), vec!["f1e2"]);

    let root_epd = root.epd();
    let mut child = root.clone();
    child.push_uci("f1e2").unwrap();
    assert!(child.is_checkmate());
    let child_epd = child.epd();

    let script: Script = {
        let (root_epd, child_epd) = (root_epd.clone(), child_epd.clone());
        Arc::new(move |action, board, _| match action {
            "queryall" if board == root_epd => {
                json!({"status": "ok", "moves": [{"uci": "f1e2", "score": CDB_MATE}]}).to_string()
            }
            "queryall" if board == child_epd => json!({"status": "checkmate"}).to_string(),
            "querypv" => json!({"status": "unknown"}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let (score, pv, _) = Arc::clone(&db).search(root.clone(), 1).await;

    // The remote's mate score is stretched on ingress and shrunk on egress,
    // landing one below mate after the ply to the mating position.
    assert_eq!(score, CDB_MATE - 1);
    assert_eq!(pv, vec!["f1e2", "checkmate"]);

    // Idempotence: a second identical search runs entirely from the
    // transposition table and changes nothing.
    let uncached = Counters::get(&db.counters().uncached);
    let (again_score, again_pv, _) = Arc::clone(&db).search(root, 1).await;

    assert_eq!((again_score, again_pv), (score, pv));
    assert_eq!(Counters::get(&db.counters().uncached), uncached);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_stalemate_root_needs_no_remote() {
    let root = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - -").unwrap();

    // Default options point at the real endpoint; the search must never get
    // that far on a terminal root.
    let db = ChessDB::new(SearchOptions::default()).unwrap();

    let (score, pv, _) = Arc::clone(&db).search(root, 5).await;

    assert_eq!(score, 0);
    assert_eq!(pv, vec!["draw"]);
    assert_eq!(Counters::get(&db.counters().queryall), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn an_unknown_position_is_queued_and_retried() {
    let root = Position::from_fen(STARTPOS).unwrap();
    let root_epd = root.epd();
    let mut child = root.clone();
    child.push_uci("e2e4").unwrap();
    let child_epd = child.epd();

    let script: Script = {
        let (root_epd, child_epd) = (root_epd.clone(), child_epd.clone());
        Arc::new(move |action, board, nth| match action {
            "queryall" if board == root_epd && nth == 0 => {
                json!({"status": "unknown"}).to_string()
            }
            "queryall" if board == root_epd => json!({
                "status": "ok",
                "moves": [{"uci": "e2e4", "score": 30}, {"uci": "d2d4", "score": 28}],
            })
            .to_string(),
            "queryall" if board == child_epd => {
                json!({"status": "ok", "moves": [{"uci": "e7e5", "score": -30}]}).to_string()
            }
            "queryall" => json!({"status": "ok", "moves": []}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let (score, pv, _) = Arc::clone(&db).search(root, 1).await;

    assert_eq!(pv, vec!["e2e4", "e7e5"]);
    assert_eq!(score, 30);
    assert_eq!(Counters::get(&db.counters().enqueued), 1);
    assert!(Counters::get(&db.counters().uncached) >= 2);
    assert!(mock.calls_for("queue", &root_epd) >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_rate_limit_is_cleared_and_retried() {
    let root = Position::from_fen(STARTPOS).unwrap();
    let root_epd = root.epd();
    let mut child = root.clone();
    child.push_uci("e2e4").unwrap();
    let child_epd = child.epd();

    let script: Script = {
        let (root_epd, child_epd) = (root_epd.clone(), child_epd.clone());
        Arc::new(move |action, board, nth| match action {
            "queryall" if board == root_epd && nth == 0 => {
                json!({"status": "rate limit exceeded"}).to_string()
            }
            "queryall" if board == root_epd => json!({
                "status": "ok",
                "moves": [{"uci": "e2e4", "score": 30}, {"uci": "d2d4", "score": 28}],
            })
            .to_string(),
            "queryall" if board == child_epd => {
                json!({"status": "ok", "moves": [{"uci": "e7e5", "score": -30}]}).to_string()
            }
            "queryall" => json!({"status": "ok", "moves": []}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let (score, pv, _) = Arc::clone(&db).search(root, 1).await;

    assert_eq!(pv, vec!["e2e4", "e7e5"]);
    assert_eq!(score, 30);
    assert!(mock.calls("clearlimit") >= 1);
    assert_eq!(Counters::get(&db.counters().enqueued), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn mate_proof_fails_on_unscored_defences() {
    // Black to move with three legal moves; the remote only scored one.
    let pos = Position::from_fen("k7/7R/8/2K3p1/7p/8/8/8 b - - 0 1").unwrap();
    let mut moves = pos.legal_moves();
    moves.sort();
    assert_eq!(moves, vec!["a8b8", "g5g4", "h4h3"]);

    let epd = pos.epd();

    let script: Script = {
        let epd = epd.clone();
        Arc::new(move |action, board, _| match action {
            "queryall" if board == epd => {
                json!({"status": "ok", "moves": [{"uci": "a8b8", "score": -29000}]}).to_string()
            }
            "queryall" => json!({"status": "ok", "moves": []}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let claim = vec!["a8b8".to_string(), "h7h8".to_string(), "checkmate".to_string()];
    let proven = Arc::clone(&db).pv_has_proven_mate(pos.clone(), claim).await;

    assert!(!proven);
    assert_eq!(Counters::get(&db.counters().unscored), 2);

    // The two unscored defences got fire-and-forget queries.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for uci in ["g5g4", "h4h3"] {
        let mut child = pos.clone();
        child.push_uci(uci).unwrap();
        assert_eq!(mock.calls_for("queryall", &child.epd()), 1);
    }
}

/// Responder for the extension-cap tests: one position with a best move and
/// a close runner-up, everything else claimed finished so no subtree grows
/// past the first reply.
fn ranking_script(epd: String) -> Script {
    Arc::new(move |action, board, _| match action {
        "queryall" if board == epd => json!({
            "status": "ok",
            "moves": [{"uci": "a2a3", "score": 30}, {"uci": "h2h3", "score": 29}],
        })
        .to_string(),
        "queryall" => json!({"status": "checkmate"}).to_string(),
        _ => json!({"status": "ok"}).to_string(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn extensions_stop_once_a_line_runs_far_past_the_root_depth() {
    // Ten plies of pre-played moves put this node right at the extension
    // cap relative to a fresh search. With a generous decay both scored
    // moves would normally deserve a subtree; past the cap only the best
    // move may keep going and the runner-up is carried over unsearched.
    let line = "e2e4 e7e5 g1f3 b8c6 f1c4 g8f6 b1c3 f8c5 d2d3 d7d6";
    let deep = Position::setup(&format!("{STARTPOS} moves {line}")).unwrap();

    let mock = serve(Duration::ZERO, ranking_script(deep.epd())).await;
    let db = ChessDB::new(SearchOptions { eval_decay: 100, ..options(&mock) }).unwrap();

    Arc::clone(&db).search(deep.clone(), 3).await;

    let mut best_child = deep.clone();
    best_child.push_uci("a2a3").unwrap();
    let mut runner_up = deep.clone();
    runner_up.push_uci("h2h3").unwrap();

    assert!(mock.calls_for("queryall", &best_child.epd()) >= 1);
    assert_eq!(mock.calls_for("queryall", &runner_up.epd()), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn both_contenders_are_searched_below_the_extension_cap() {
    // The same ranking two plies in: nowhere near the cap, so the
    // runner-up gets its (reduced) subtree as well.
    let shallow = Position::setup(&format!("{STARTPOS} moves e2e4 e7e5")).unwrap();

    let mock = serve(Duration::ZERO, ranking_script(shallow.epd())).await;
    let db = ChessDB::new(SearchOptions { eval_decay: 100, ..options(&mock) }).unwrap();

    Arc::clone(&db).search(shallow.clone(), 3).await;

    for uci in ["a2a3", "h2h3"] {
        let mut child = shallow.clone();
        child.push_uci(uci).unwrap();
        assert!(mock.calls_for("queryall", &child.epd()) >= 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reprobes_are_skipped_while_the_budget_is_empty() {
    // A deep search over a single forced line costs one remote fetch, so
    // one percent of the uncached count buys no reprobe at all, even well
    // past the reprobe depth.
    let root = Position::from_fen(FORCED_MATE).unwrap();
    let root_epd = root.epd();
    let mut child = root.clone();
    child.push_uci("f1e2").unwrap();
    let child_epd = child.epd();

    let script: Script = {
        let (root_epd, child_epd) = (root_epd.clone(), child_epd.clone());
        Arc::new(move |action, board, _| match action {
            "queryall" if board == root_epd => {
                json!({"status": "ok", "moves": [{"uci": "f1e2", "score": CDB_MATE}]}).to_string()
            }
            "queryall" if board == child_epd => json!({"status": "checkmate"}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let (score, pv, _) = Arc::clone(&db).search(root, 16).await;

    assert_eq!(score, CDB_MATE - 1);
    assert_eq!(pv, vec!["f1e2", "checkmate"]);

    // Give any stray background reprobe a chance to show itself.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(Counters::get(&db.counters().reprobe_queryall), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unqueueable_position_scores_all_moves_near_draw() {
    // Two bare kings; what matters is that queue comes back empty.
    let epd = "k7/8/8/8/8/8/8/7K w - -";

    let script: Script = Arc::new(move |action, _, _| match action {
        "queryall" => json!({"status": "unknown"}).to_string(),
        "queue" => json!({}).to_string(),
        _ => json!({"status": "ok"}).to_string(),
    });

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let result = db.queryall(epd, true).await;

    assert_eq!(result.len(), 3);
    for uci in ["h1g1", "h1g2", "h1h2"] {
        assert_eq!(result.get(uci), Some(1));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_replies_are_retried() {
    let script: Script = Arc::new(move |action, _, nth| match (action, nth) {
        ("queryall", 0) => "this is not json".to_string(),
        ("queryall", 1) => json!({"surprise": true}).to_string(),
        ("queryall", _) => {
            json!({"status": "ok", "moves": [{"uci": "e2e4", "score": 44}]}).to_string()
        }
        _ => json!({"status": "ok"}).to_string(),
    });

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(options(&mock)).unwrap();

    let result = db.queryall("some board", true).await;

    assert_eq!(result.get("e2e4"), Some(44));
    assert_eq!(mock.calls("queryall"), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn http_fan_out_is_bounded_by_the_work_semaphore() {
    let script: Script = Arc::new(move |_, _, _| {
        json!({"status": "ok", "moves": [{"uci": "e2e4", "score": 1}]}).to_string()
    });

    let mock = serve(Duration::from_millis(25), script).await;
    let db = ChessDB::new(SearchOptions { concurrency: 2, ..options(&mock) }).unwrap();

    let mut queries = Vec::new();
    for i in 0..12 {
        let db = Arc::clone(&db);
        queries.push(tokio::spawn(async move {
            db.queryall(&format!("board {i}"), true).await;
        }));
    }

    for query in queries {
        query.await.unwrap();
    }

    assert_eq!(mock.calls("queryall"), 12);
    assert!(mock.max_inflight.load(Ordering::SeqCst) <= 2);
}

////////////////////////////////////////////////////////////////////////////////
//
// The driver
//
////////////////////////////////////////////////////////////////////////////////

#[tokio::test(flavor = "multi_thread")]
async fn the_driver_reports_and_stops_at_the_depth_limit() {
    let root = Position::from_fen(FORCED_MATE).unwrap();
    let root_epd = root.epd();
    let mut child = root.clone();
    child.push_uci("f1e2").unwrap();
    let child_epd = child.epd();

    let script: Script = {
        let (root_epd, child_epd) = (root_epd.clone(), child_epd.clone());
        Arc::new(move |action, board, _| match action {
            "queryall" if board == root_epd => {
                json!({"status": "ok", "moves": [{"uci": "f1e2", "score": CDB_MATE}]}).to_string()
            }
            "queryall" if board == child_epd => json!({"status": "checkmate"}).to_string(),
            "querypv" => json!({"status": "unknown"}).to_string(),
            _ => json!({"status": "ok"}).to_string(),
        })
    };

    let mock = serve(Duration::ZERO, script).await;
    let db = ChessDB::new(SearchOptions {
        depth_limit: Some(1),
        prove_mates: true,
        ..options(&mock)
    })
    .unwrap();

    let (sender, mut reports) = mpsc::unbounded_channel();
    Arc::clone(&db).explore(root, sender).await;

    let report = reports.recv().await.unwrap();
    assert_eq!(report.depth, 1);
    assert_eq!(report.score, CDB_MATE - 1);
    assert_eq!(report.pv, vec!["f1e2", "checkmate"]);
    assert_eq!(report.pvlen, 1);
    assert!(report.queryall >= 1);
    assert!(report.url.contains("chessdb.cn"));
    assert!(report.url.contains("moves%20f1e2"));

    // The proof of the mate: the single reply mates on the board.
    assert_eq!(report.mate.as_deref(), Some("CHECKMATE"));

    // One iteration only: the depth limit kicked in.
    assert!(reports.recv().await.is_none());

    // The driver's reprobe of the PV finished before explore returned: one
    // skip-TT query at the mating position, one back at the root.
    assert_eq!(Counters::get(&db.counters().reprobe_queryall), 2);
}
