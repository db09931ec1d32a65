//! Command line front-end for the exploration engine.
//!
//! Parses the root position and the options, kicks off the iterative
//! deepening driver, and prints one JSON record per completed iteration to
//! stdout. Logging goes to stderr and is controlled through `RUST_LOG`.

use anyhow::Context;
use chess::Position;
use clap::Parser;
use engine::{ChessDB, SearchOptions};
use log::info;
use tokio::sync::mpsc;

const STARTPOS: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

#[derive(Debug, Parser)]
#[command(
    about = "Explore and extend the Chess Cloud Database (https://chessdb.cn/queryc_en/). \
             Builds a search tree for a given position."
)]
struct Cli {
    /// FEN or EPD to explore. Accepts FENs with and without move counters,
    /// as well as the extended "<FEN> moves m1 m2 m3" syntax of the cdb API.
    #[arg(long, default_value = STARTPOS)]
    epd: String,

    /// Finish the exploration at the specified depth.
    #[arg(long)]
    depth_limit: Option<i64>,

    /// Maximum number of requests made to chessdb at the same time.
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Depth decrease per cp eval-to-best. A small number searches narrowly,
    /// 0 essentially just follows PV lines. A wide search will likely
    /// enqueue many positions.
    #[arg(long, default_value_t = 2)]
    eval_decay: i64,

    /// Treat cursed wins as wins.
    #[arg(long)]
    cursed_wins: bool,

    /// Keep searching in positions that are fully covered by tablebases.
    #[arg(long)]
    tb_search: bool,

    /// Attempt to prove mate PVs before reporting them.
    #[arg(long)]
    prove_mates: bool,

    /// Appended to the user agent of the requests.
    #[arg(long)]
    user: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let root = Position::setup(&cli.epd)
        .with_context(|| format!("cannot set up root position from {:?}", cli.epd))?;

    info!("exploring {} (moves: {})", root.initial_epd(), root.played().join(" "));

    let options = SearchOptions {
        depth_limit: cli.depth_limit,
        concurrency: cli.concurrency,
        eval_decay: cli.eval_decay,
        cursed_wins: cli.cursed_wins,
        tb_search: cli.tb_search,
        prove_mates: cli.prove_mates,
        user: cli.user,
        ..SearchOptions::default()
    };

    let db = ChessDB::new(options)?;

    let (reports, mut stream) = mpsc::unbounded_channel();
    let driver = tokio::spawn(db.explore(root, reports));

    while let Some(report) = stream.recv().await {
        println!("{}", serde_json::to_string(&report)?);
    }

    driver.await.context("driver task failed")?;

    Ok(())
}
