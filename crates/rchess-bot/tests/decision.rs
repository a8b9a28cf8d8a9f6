mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::FixedEngine;
use rchess_bot::board::BoardState;
use rchess_bot::book::{BookEntry, OpeningBook};
use rchess_bot::config::TablebaseConfig;
use rchess_bot::decision::{MoveDecider, MoveDecisionPipeline, MoveSource, TablebasePolicy};
use rchess_bot::engine::SearchEngine;
use rchess_bot::error::{BookError, TablebaseError};
use rchess_bot::tablebase::Tablebase;
use rchess_bot::{ClockState, EnginePool, TimeBudget};

const KRK: &str = "8/8/8/4k3/8/8/8/R3K3 w - - 0 1";

/// Waits out the request timeout, then reports a gateway timeout.
struct SlowTablebase {
    probes: AtomicUsize,
}

impl Tablebase for SlowTablebase {
    fn probe(&self, _board: &BoardState, timeout: Duration) -> Result<Option<String>, TablebaseError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        thread::sleep(timeout);
        Err(TablebaseError::Status(504))
    }
}

struct WeightedBook;

impl OpeningBook for WeightedBook {
    fn lookup(&self, board: &BoardState) -> Result<Vec<BookEntry>, BookError> {
        if board.move_count() > 0 {
            return Ok(Vec::new());
        }
        Ok(vec![
            BookEntry { uci: "e2e4".to_string(), weight: 5 },
            BookEntry { uci: "d2d4".to_string(), weight: 9 },
            BookEntry { uci: "c2c4".to_string(), weight: 9 },
        ])
    }
}

fn clock(secs: f64) -> ClockState {
    ClockState {
        white_time: secs,
        black_time: secs,
        white_inc: 0.0,
        black_inc: 0.0,
    }
}

fn pool_of(reply: &str, size: usize) -> (Arc<EnginePool>, Arc<AtomicUsize>) {
    let searches = Arc::new(AtomicUsize::new(0));
    let engines = (0..size)
        .map(|_| {
            Box::new(FixedEngine {
                reply: reply.to_string(),
                searches: Arc::clone(&searches),
            }) as Box<dyn SearchEngine>
        })
        .collect();
    (Arc::new(EnginePool::with_engines(engines, None)), searches)
}

fn pipeline(pool: Arc<EnginePool>) -> MoveDecisionPipeline {
    MoveDecisionPipeline::new(
        pool,
        TimeBudget::default(),
        TablebasePolicy::from(&TablebaseConfig::default()),
    )
}

#[test]
fn tablebase_timeout_falls_through_to_engine() {
    let (pool, searches) = pool_of("a1a7", 1);
    let tb = Arc::new(SlowTablebase {
        probes: AtomicUsize::new(0),
    });
    struct Shared(Arc<SlowTablebase>);
    impl Tablebase for Shared {
        fn probe(&self, board: &BoardState, timeout: Duration) -> Result<Option<String>, TablebaseError> {
            self.0.probe(board, timeout)
        }
    }
    let p = pipeline(Arc::clone(&pool)).with_tablebase(Box::new(Shared(Arc::clone(&tb))));
    let board = BoardState::from_initial(Some(KRK)).unwrap();

    let started = Instant::now();
    let decision = p.decide("tb", &board, &clock(5.0)).unwrap();

    assert_eq!(decision.source, MoveSource::Engine);
    assert_eq!(decision.uci, "a1a7");
    assert_eq!(tb.probes.load(Ordering::SeqCst), 1);
    assert_eq!(searches.load(Ordering::SeqCst), 1);
    // Low clock: the short tablebase timeout applies.
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(pool.idle(), 1);
}

#[test]
fn book_choice_is_deterministic_among_top_weights() {
    let (pool, searches) = pool_of("a2a3", 1);
    let p = pipeline(pool).with_book(Box::new(WeightedBook));
    let board = BoardState::new();
    let picks: Vec<String> = (0..10)
        .map(|_| p.decide("book", &board, &clock(60.0)).unwrap().uci)
        .collect();
    assert!(picks.iter().all(|m| m == "d2d4"));
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_games_share_a_bounded_pool() {
    let (pool, searches) = pool_of("e2e4", 2);
    let p = Arc::new(pipeline(Arc::clone(&pool)));
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let p = Arc::clone(&p);
            thread::spawn(move || {
                let d = p.decide(&format!("g{i}"), &BoardState::new(), &clock(60.0)).unwrap();
                assert_eq!(d.source, MoveSource::Engine);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(searches.load(Ordering::SeqCst), 6);
    assert_eq!(pool.idle(), 2);
    assert_eq!(pool.outstanding(), 0);
}
