//! Move selection: opening book, then tablebase, then engine search, with a
//! legal-move fallback when the engine stage fails.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::board::BoardState;
use crate::book::{BookEntry, OpeningBook};
use crate::config::TablebaseConfig;
use crate::engine_pool::EnginePool;
use crate::error::DecisionError;
use crate::tablebase::Tablebase;
use crate::time_budget::{ClockState, TimeBudget};

/// Above this much remaining time the tablebase gets the longer timeout.
const TABLEBASE_AMPLE_TIMEOUT_SECS: f64 = 10.0;
/// Above this much remaining time the looser piece ceiling applies.
const TABLEBASE_AMPLE_PIECES_SECS: f64 = 30.0;
const TABLEBASE_TIMEOUT: Duration = Duration::from_millis(500);
const TABLEBASE_TIMEOUT_LOW: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSource {
    Book,
    Tablebase,
    Engine,
    Fallback,
}

impl fmt::Display for MoveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MoveSource::Book => "book",
            MoveSource::Tablebase => "tablebase",
            MoveSource::Engine => "engine",
            MoveSource::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub uci: String,
    pub source: MoveSource,
}

/// Anything that can pick a move for a game. Sessions depend on this rather
/// than on the concrete pipeline.
pub trait MoveDecider: Send + Sync {
    fn decide(&self, game_id: &str, board: &BoardState, clock: &ClockState) -> Result<Decision, DecisionError>;
}

/// Piece ceilings and timeouts for the tablebase stage.
#[derive(Debug, Clone, Copy)]
pub struct TablebasePolicy {
    pub piece_limit: usize,
    pub piece_limit_ample: usize,
}

impl From<&TablebaseConfig> for TablebasePolicy {
    fn from(cfg: &TablebaseConfig) -> Self {
        Self {
            piece_limit: cfg.piece_limit,
            piece_limit_ample: cfg.piece_limit_ample.max(cfg.piece_limit),
        }
    }
}

impl TablebasePolicy {
    pub fn piece_ceiling(&self, remaining_secs: f64) -> usize {
        if remaining_secs > TABLEBASE_AMPLE_PIECES_SECS {
            self.piece_limit_ample
        } else {
            self.piece_limit
        }
    }

    pub fn timeout(&self, remaining_secs: f64) -> Duration {
        if remaining_secs > TABLEBASE_AMPLE_TIMEOUT_SECS {
            TABLEBASE_TIMEOUT
        } else {
            TABLEBASE_TIMEOUT_LOW
        }
    }
}

pub struct MoveDecisionPipeline {
    book: Option<Box<dyn OpeningBook>>,
    tablebase: Option<Box<dyn Tablebase>>,
    engines: Arc<EnginePool>,
    budget: TimeBudget,
    tablebase_policy: TablebasePolicy,
    book_error_logged: AtomicBool,
}

impl MoveDecisionPipeline {
    pub fn new(engines: Arc<EnginePool>, budget: TimeBudget, tablebase_policy: TablebasePolicy) -> Self {
        Self {
            book: None,
            tablebase: None,
            engines,
            budget,
            tablebase_policy,
            book_error_logged: AtomicBool::new(false),
        }
    }

    pub fn with_book(mut self, book: Box<dyn OpeningBook>) -> Self {
        self.book = Some(book);
        self
    }

    pub fn with_tablebase(mut self, tablebase: Box<dyn Tablebase>) -> Self {
        self.tablebase = Some(tablebase);
        self
    }

    fn book_move(&self, game_id: &str, board: &BoardState) -> Option<String> {
        let book = self.book.as_ref()?;
        match book.lookup(board) {
            Ok(entries) => select_book_move(board, &entries),
            Err(e) => {
                // One warning per process; a missing book stays missing.
                if !self.book_error_logged.swap(true, Ordering::Relaxed) {
                    log::warn!("[{game_id}] opening book unavailable: {e}");
                }
                None
            }
        }
    }

    fn tablebase_move(&self, game_id: &str, board: &BoardState, remaining: f64) -> Option<String> {
        let tablebase = self.tablebase.as_ref()?;
        let pieces = board.piece_count();
        let ceiling = self.tablebase_policy.piece_ceiling(remaining);
        if pieces > ceiling {
            return None;
        }
        let timeout = self.tablebase_policy.timeout(remaining);
        match tablebase.probe(board, timeout) {
            Ok(found) => found,
            Err(e) => {
                log::info!("[{game_id}] tablebase skipped ({pieces} pieces, {timeout:?}): {e}");
                None
            }
        }
    }

    fn engine_move(&self, game_id: &str, board: &BoardState, clock: &ClockState) -> Option<String> {
        let think = self.budget.allocate_duration(
            clock,
            board.turn(),
            board.fullmove_number(),
            board.legal_move_count(),
        );
        let mut engine = self.engines.acquire();
        match engine.search(board, think) {
            Ok(outcome) => match board.parse_uci(&outcome.bestmove) {
                Some(m) => {
                    log::info!(
                        "[{game_id}] engine move {} ({}, think {:?}, took {}ms, {})",
                        outcome.bestmove,
                        engine.label(),
                        think,
                        outcome.elapsed_ms,
                        outcome.info.describe()
                    );
                    Some(board.move_to_uci(&m))
                }
                None => {
                    log::warn!(
                        "[{game_id}] {} returned illegal move {}",
                        engine.label(),
                        outcome.bestmove
                    );
                    None
                }
            },
            Err(e) => {
                log::warn!("[{game_id}] engine search failed: {e}");
                None
            }
        }
    }
}

impl MoveDecider for MoveDecisionPipeline {
    fn decide(&self, game_id: &str, board: &BoardState, clock: &ClockState) -> Result<Decision, DecisionError> {
        let legal = board.legal_moves();
        let Some(first_legal) = legal.first() else {
            return Err(DecisionError::NoLegalMoves(board.fen()));
        };

        if let Some(uci) = self.book_move(game_id, board) {
            log::info!("[{game_id}] book move {uci}");
            return Ok(Decision {
                uci,
                source: MoveSource::Book,
            });
        }

        let remaining = clock.remaining(board.turn());
        if let Some(uci) = self.tablebase_move(game_id, board, remaining) {
            log::info!("[{game_id}] tablebase move {uci}");
            return Ok(Decision {
                uci,
                source: MoveSource::Tablebase,
            });
        }

        if let Some(uci) = self.engine_move(game_id, board, clock) {
            return Ok(Decision {
                uci,
                source: MoveSource::Engine,
            });
        }

        let uci = board.move_to_uci(first_legal);
        log::warn!("[{game_id}] FALLBACK: engine gave no usable move, playing first legal move {uci}");
        Ok(Decision {
            uci,
            source: MoveSource::Fallback,
        })
    }
}

/// Highest-weight legal entry. Among equal weights the first in book order
/// wins, so the choice is the same on every run.
pub fn select_book_move(board: &BoardState, entries: &[BookEntry]) -> Option<String> {
    let mut best: Option<(u16, String)> = None;
    for entry in entries {
        let Some(m) = board.parse_uci(&entry.uci) else {
            log::debug!("book entry {} is not legal here, skipping", entry.uci);
            continue;
        };
        if best.as_ref().is_none_or(|(w, _)| entry.weight > *w) {
            best = Some((entry.weight, board.move_to_uci(&m)));
        }
    }
    best.map(|(_, uci)| uci)
}
