use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel as chan;

use rchess_bot::book::PolyglotBook;
use rchess_bot::decision::TablebasePolicy;
use rchess_bot::engine::uci_factory;
use rchess_bot::platform::{LichessClient, Platform};
use rchess_bot::tablebase::HttpTablebase;
use rchess_bot::{
    BotConfig, Dispatcher, EnginePool, ExitReason, GameRegistry, Lifecycle, MatchmakingScheduler,
    MoveDecisionPipeline, SessionContext, SessionSettings, TimeBudget,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML). A missing default file means built-in defaults.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Engine binary, overriding `engine.path`
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Parallel game limit, overriding `limits.max_parallel_games`
    #[arg(long)]
    max_games: Option<usize>,

    /// Only answer incoming challenges
    #[arg(long)]
    no_matchmaking: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    )
    .format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()))
    .write_style(env_logger::WriteStyle::Never)
    .target(env_logger::Target::Stderr)
    .init();

    match run(args) {
        Ok(reason) => {
            log::info!("shutting down: {reason}");
            std::process::exit(0);
        }
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn load_config(args: &Args) -> Result<BotConfig> {
    let mut cfg = if args.config.exists() {
        BotConfig::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?
    } else {
        log::warn!("{} not found, using defaults", args.config.display());
        BotConfig::default()
    };
    if let Some(path) = &args.engine {
        cfg.engine.path = path.clone();
    }
    if let Some(n) = args.max_games {
        cfg.limits.max_parallel_games = n;
    }
    if args.no_matchmaking {
        cfg.matchmaking.enabled = false;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn build_pipeline(cfg: &BotConfig, engines: Arc<EnginePool>) -> MoveDecisionPipeline {
    let mut pipeline = MoveDecisionPipeline::new(
        engines,
        TimeBudget::from(&cfg.time),
        TablebasePolicy::from(&cfg.tablebase),
    );
    if let Some(path) = cfg.book.path.as_deref() {
        pipeline = with_book(pipeline, path);
    }
    if cfg.tablebase.enabled {
        match HttpTablebase::new(&cfg.tablebase.url) {
            Ok(tb) => pipeline = pipeline.with_tablebase(Box::new(tb)),
            Err(e) => log::warn!("tablebase disabled: {e}"),
        }
    }
    pipeline
}

fn with_book(pipeline: MoveDecisionPipeline, path: &Path) -> MoveDecisionPipeline {
    match PolyglotBook::open(path) {
        Ok(book) => pipeline.with_book(Box::new(book)),
        Err(e) => {
            log::warn!("opening book {} unavailable: {e}", path.display());
            pipeline
        }
    }
}

/// The first Ctrl-C drains, the second aborts running games.
fn install_interrupt_handler(lifecycle: Arc<Lifecycle>) -> Result<()> {
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupted: finishing running games (press Ctrl-C again to abort)");
            lifecycle.request_stop();
        } else {
            eprintln!("\nAborting");
            lifecycle.request_abort();
        }
    })
    .context("Failed to set Ctrl-C handler")
}

fn run(args: Args) -> Result<ExitReason> {
    let cfg = load_config(&args)?;
    let token = std::env::var(&cfg.token_env)
        .with_context(|| format!("API token variable {} is not set", cfg.token_env))?;

    let client = LichessClient::new(&cfg.base_url, &token).context("building HTTP client")?;
    let account_id = client.account_id().context("account lookup failed")?;
    let platform: Arc<dyn Platform> = Arc::new(client);

    let pool_size = cfg.engine_pool_size();
    let engines = Arc::new(
        EnginePool::spawn(pool_size, uci_factory(cfg.engine.clone()))
            .with_context(|| format!("starting {pool_size} engines"))?,
    );

    let lifecycle = Arc::new(Lifecycle::from_config(&cfg));
    install_interrupt_handler(Arc::clone(&lifecycle))?;
    let registry = Arc::new(GameRegistry::new());
    let ctx = Arc::new(SessionContext {
        platform: Arc::clone(&platform),
        decider: Arc::new(build_pipeline(&cfg, Arc::clone(&engines))),
        registry: Arc::clone(&registry),
        lifecycle: Arc::clone(&lifecycle),
        settings: SessionSettings::from_config(&cfg, &account_id),
    });
    log::info!(
        "ready as {account_id}: {} parallel games, {pool_size} engines",
        cfg.limits.max_parallel_games
    );

    let (exit_tx, exit_rx) = chan::unbounded::<(&'static str, ExitReason)>();

    let dispatcher_tx = exit_tx.clone();
    let dispatcher_ctx = Arc::clone(&ctx);
    thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || {
            let mut dispatcher = Dispatcher::new(dispatcher_ctx);
            let reason = dispatcher.run();
            if reason != ExitReason::Aborted {
                dispatcher.join_sessions();
            }
            let _ = dispatcher_tx.send(("dispatcher", reason));
        })
        .context("spawning dispatcher thread")?;

    if cfg.matchmaking.enabled {
        let mut matchmaker = MatchmakingScheduler::new(
            Arc::clone(&platform),
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            cfg.matchmaking.clone(),
            cfg.limits.max_parallel_games,
            &account_id,
        );
        let matchmaker_tx = exit_tx.clone();
        thread::Builder::new()
            .name("matchmaking".to_string())
            .spawn(move || {
                let reason = matchmaker.run();
                let _ = matchmaker_tx.send(("matchmaking", reason));
            })
            .context("spawning matchmaking thread")?;
    }
    drop(exit_tx);

    let (who, reason) = exit_rx.recv().context("all worker threads vanished")?;
    log::info!("{who} requested exit: {reason}");
    let closed = engines.drain();
    log::info!("closed {closed} idle engine(s)");
    Ok(reason)
}
