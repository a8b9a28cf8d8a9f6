//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use rchess_bot::board::BoardState;
use rchess_bot::decision::{Decision, MoveDecider, MoveSource};
use rchess_bot::engine::{InfoSnapshot, SearchEngine, SearchOutcome};
use rchess_bot::error::{DecisionError, EngineError, PlatformError};
use rchess_bot::platform::{
    ChallengeRequest, DeclineReason, EventStream, GameEvent, IncomingEvent, Platform, UserProfile,
    parse_stream_line,
};
use rchess_bot::time_budget::ClockState;
use rchess_bot::{GameRegistry, Lifecycle, SessionContext, SessionSettings};

pub const ME: &str = "rchessbot";

/// Scripted platform. Unscripted calls succeed.
#[derive(Default)]
pub struct FakePlatform {
    pub game_streams: Mutex<HashMap<String, Vec<GameEvent>>>,
    /// One entry per connection of the account event stream.
    pub incoming: Mutex<VecDeque<Result<Vec<IncomingEvent>, PlatformError>>>,
    pub move_results: Mutex<VecDeque<Result<(), PlatformError>>>,
    pub move_attempts: Mutex<Vec<(String, String)>>,
    pub accepted_moves: Mutex<Vec<(String, String)>>,
    pub messages: Mutex<Vec<(String, String)>>,
    pub accepted: Mutex<Vec<String>>,
    pub accept_error: Mutex<Option<PlatformError>>,
    pub declined: Mutex<Vec<(String, DeclineReason)>>,
    pub challenges: Mutex<Vec<(String, ChallengeRequest)>>,
    pub bots: Mutex<Vec<String>>,
    pub ratings: Mutex<HashMap<String, u32>>,
    pub bot_list_errors: Mutex<VecDeque<PlatformError>>,
    pub rating_queries: Mutex<Vec<String>>,
    pub challenge_errors: Mutex<VecDeque<PlatformError>>,
}

impl FakePlatform {
    pub fn with_game(self, game_id: &str, lines: &[String]) -> Self {
        let events = lines.iter().map(|l| parse_stream_line(l).unwrap()).collect();
        self.game_streams.lock().insert(game_id.to_string(), events);
        self
    }

    pub fn with_move_results(self, results: Vec<Result<(), PlatformError>>) -> Self {
        *self.move_results.lock() = results.into();
        self
    }

    pub fn with_bots(self, bots: &[(&str, u32)]) -> Self {
        *self.bots.lock() = bots.iter().map(|(id, _)| id.to_string()).collect();
        *self.ratings.lock() = bots.iter().map(|(id, r)| (id.to_string(), *r)).collect();
        self
    }

    pub fn moves_for(&self, game_id: &str) -> Vec<String> {
        self.accepted_moves
            .lock()
            .iter()
            .filter(|(g, _)| g == game_id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Platform for FakePlatform {
    fn account_id(&self) -> Result<String, PlatformError> {
        Ok(ME.to_string())
    }

    fn stream_incoming_events(&self) -> Result<EventStream<IncomingEvent>, PlatformError> {
        match self.incoming.lock().pop_front() {
            Some(Ok(events)) => Ok(Box::new(events.into_iter().map(Ok))),
            Some(Err(e)) => Err(e),
            None => Ok(Box::new(std::iter::empty())),
        }
    }

    fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, PlatformError> {
        let events = self.game_streams.lock().remove(game_id).unwrap_or_default();
        Ok(Box::new(events.into_iter().map(Ok)))
    }

    fn post_message(&self, game_id: &str, text: &str) -> Result<(), PlatformError> {
        self.messages.lock().push((game_id.to_string(), text.to_string()));
        Err(PlatformError::Rejected {
            status: 403,
            body: "chat disabled".to_string(),
        })
    }

    fn make_move(&self, game_id: &str, uci: &str) -> Result<(), PlatformError> {
        self.move_attempts.lock().push((game_id.to_string(), uci.to_string()));
        let result = self.move_results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.accepted_moves.lock().push((game_id.to_string(), uci.to_string()));
        }
        result
    }

    fn accept_challenge(&self, challenge_id: &str) -> Result<(), PlatformError> {
        if let Some(e) = self.accept_error.lock().take() {
            return Err(e);
        }
        self.accepted.lock().push(challenge_id.to_string());
        Ok(())
    }

    fn decline_challenge(&self, challenge_id: &str, reason: DeclineReason) -> Result<(), PlatformError> {
        self.declined.lock().push((challenge_id.to_string(), reason));
        Ok(())
    }

    fn create_challenge(&self, target: &str, request: &ChallengeRequest) -> Result<(), PlatformError> {
        if let Some(e) = self.challenge_errors.lock().pop_front() {
            return Err(e);
        }
        self.challenges.lock().push((target.to_string(), request.clone()));
        Ok(())
    }

    fn online_bots(&self, limit: usize) -> Result<Vec<String>, PlatformError> {
        if let Some(e) = self.bot_list_errors.lock().pop_front() {
            return Err(e);
        }
        Ok(self.bots.lock().iter().take(limit).cloned().collect())
    }

    fn public_data(&self, user_id: &str) -> Result<UserProfile, PlatformError> {
        self.rating_queries.lock().push(user_id.to_string());
        let rating = self.ratings.lock().get(user_id).copied().unwrap_or(0);
        let json = format!(r#"{{"id":"{user_id}","perfs":{{"blitz":{{"rating":{rating}}}}}}}"#);
        Ok(serde_json::from_str(&json)?)
    }
}

/// Plays the first legal move and counts calls.
#[derive(Default)]
pub struct FirstLegalDecider {
    pub calls: AtomicUsize,
}

impl MoveDecider for FirstLegalDecider {
    fn decide(&self, _game_id: &str, board: &BoardState, _clock: &ClockState) -> Result<Decision, DecisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let m = board
            .legal_moves()
            .into_iter()
            .next()
            .ok_or_else(|| DecisionError::NoLegalMoves(board.fen()))?;
        Ok(Decision {
            uci: board.move_to_uci(&m),
            source: MoveSource::Engine,
        })
    }
}

/// Engine that always answers the same move.
pub struct FixedEngine {
    pub reply: String,
    pub searches: Arc<AtomicUsize>,
}

impl SearchEngine for FixedEngine {
    fn label(&self) -> &str {
        "fixed"
    }

    fn search(&mut self, _board: &BoardState, _think: Duration) -> Result<SearchOutcome, EngineError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(SearchOutcome {
            bestmove: self.reply.clone(),
            elapsed_ms: 0,
            info: InfoSnapshot::default(),
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub platform: Arc<FakePlatform>,
    pub decider: Arc<FirstLegalDecider>,
    pub ctx: Arc<SessionContext>,
    pub sentinel: PathBuf,
    _dir: tempfile::TempDir,
}

pub fn settings(max_parallel_games: usize) -> SessionSettings {
    SessionSettings {
        account_id: ME.to_string(),
        greeting: "hello".to_string(),
        submit_attempts: 3,
        not_your_turn_delay: Duration::from_millis(1),
        max_parallel_games,
    }
}

pub fn harness(platform: FakePlatform, max_parallel_games: usize, max_runtime: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sentinel = dir.path().join("STOP.txt");
    let platform = Arc::new(platform);
    let decider = Arc::new(FirstLegalDecider::default());
    let ctx = Arc::new(SessionContext {
        platform: platform.clone(),
        decider: decider.clone(),
        registry: Arc::new(GameRegistry::new()),
        lifecycle: Arc::new(Lifecycle::new(max_runtime, Duration::ZERO, &sentinel)),
        settings: settings(max_parallel_games),
    });
    Harness {
        platform,
        decider,
        ctx,
        sentinel,
        _dir: dir,
    }
}

pub fn game_full(game_id: &str, white: &str, black: &str, moves: &str, status: &str) -> String {
    format!(
        r#"{{"type":"gameFull","id":"{game_id}","white":{{"id":"{white}"}},"black":{{"id":"{black}"}},"initialFen":"startpos","state":{{"type":"gameState","moves":"{moves}","wtime":60000,"btime":60000,"winc":1000,"binc":1000,"status":"{status}"}}}}"#
    )
}

pub fn game_state(moves: &str, status: &str) -> String {
    format!(
        r#"{{"type":"gameState","moves":"{moves}","wtime":59000,"btime":59000,"winc":1000,"binc":1000,"status":"{status}"}}"#
    )
}

pub fn challenge(id: &str, from: &str, variant: &str) -> IncomingEvent {
    parse_stream_line(&format!(
        r#"{{"type":"challenge","challenge":{{"id":"{id}","challenger":{{"id":"{from}"}},"variant":{{"key":"{variant}"}}}}}}"#
    ))
    .unwrap()
}

pub fn challenge_canceled(id: &str) -> IncomingEvent {
    parse_stream_line(&format!(r#"{{"type":"challengeCanceled","challenge":{{"id":"{id}"}}}}"#)).unwrap()
}

pub fn game_start(id: &str) -> IncomingEvent {
    parse_stream_line(&format!(r#"{{"type":"gameStart","game":{{"id":"{id}"}}}}"#)).unwrap()
}
