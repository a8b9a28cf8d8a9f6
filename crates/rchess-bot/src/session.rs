//! One game from start to finish: consumes the game's event stream, keeps the
//! board in sync, and submits exactly one move per own turn.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shakmaty::Color;

use crate::board::{BoardState, SyncOutcome};
use crate::config::BotConfig;
use crate::decision::MoveDecider;
use crate::error::PlatformError;
use crate::lifecycle::Lifecycle;
use crate::platform::{GameEvent, GameFull, GameStateData, GameStatus, Platform};
use crate::registry::GameRegistry;

/// Knobs shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub account_id: String,
    /// Empty disables the greeting.
    pub greeting: String,
    pub submit_attempts: u32,
    pub not_your_turn_delay: Duration,
    pub max_parallel_games: usize,
}

impl SessionSettings {
    pub fn from_config(cfg: &BotConfig, account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            greeting: cfg.greeting.clone(),
            submit_attempts: cfg.session.submit_attempts.max(1),
            not_your_turn_delay: cfg.session.not_your_turn_delay(),
            max_parallel_games: cfg.limits.max_parallel_games,
        }
    }
}

/// Collaborators a session needs; one instance is shared by all sessions.
pub struct SessionContext {
    pub platform: Arc<dyn Platform>,
    pub decider: Arc<dyn MoveDecider>,
    pub registry: Arc<GameRegistry>,
    pub lifecycle: Arc<Lifecycle>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFull,
    Active,
    Terminal,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Finished(GameStatus),
    StreamEnded,
    StreamError(String),
    /// The platform reported a move list that does not replay on our board.
    Desync(String),
    Aborted,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Finished(status) => write!(f, "finished ({status:?})"),
            SessionEnd::StreamEnded => f.write_str("stream ended"),
            SessionEnd::StreamError(e) => write!(f, "stream error: {e}"),
            SessionEnd::Desync(e) => write!(f, "board desync: {e}"),
            SessionEnd::Aborted => f.write_str("aborted"),
        }
    }
}

pub struct GameSession {
    game_id: String,
    ctx: Arc<SessionContext>,
    state: SessionState,
    color: Option<Color>,
    board: BoardState,
    /// Ply (move count) of the last successful submission.
    submitted_ply: Option<usize>,
    /// Ply whose submission was rejected; nothing more is tried for it.
    abandoned_ply: Option<usize>,
    moves_submitted: usize,
}

/// Removes the game from the registry when dropped, on every exit path.
struct RegistrySlot {
    registry: Arc<GameRegistry>,
    game_id: String,
    cap: usize,
}

impl Drop for RegistrySlot {
    fn drop(&mut self) {
        self.registry.remove(&self.game_id);
        log::info!(
            "[{}] session closed, {}/{} slots in use",
            self.game_id,
            self.registry.len(),
            self.cap
        );
    }
}

impl GameSession {
    pub fn new(game_id: &str, ctx: Arc<SessionContext>) -> Self {
        Self {
            game_id: game_id.to_string(),
            ctx,
            state: SessionState::AwaitingFull,
            color: None,
            board: BoardState::new(),
            submitted_ply: None,
            abandoned_ply: None,
            moves_submitted: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn board(&self) -> &BoardState {
        &self.board
    }

    pub fn moves_submitted(&self) -> usize {
        self.moves_submitted
    }

    /// Plays the game to its end. The game is removed from the registry when
    /// this returns or unwinds.
    pub fn run(mut self) -> SessionEnd {
        let _slot = RegistrySlot {
            registry: Arc::clone(&self.ctx.registry),
            game_id: self.game_id.clone(),
            cap: self.ctx.settings.max_parallel_games,
        };
        log::info!("[{}] session started", self.game_id);
        let end = self.play();
        log::info!(
            "[{}] {end} after {} own moves",
            self.game_id,
            self.moves_submitted
        );
        end
    }

    fn play(&mut self) -> SessionEnd {
        self.greet();
        let stream = match self.ctx.platform.stream_game_state(&self.game_id) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("[{}] could not open game stream: {e}", self.game_id);
                return SessionEnd::StreamError(e.to_string());
            }
        };
        for event in stream {
            if self.ctx.lifecycle.is_aborted() {
                return SessionEnd::Aborted;
            }
            match event {
                Ok(event) => {
                    if let Some(end) = self.handle_event(event) {
                        return end;
                    }
                }
                Err(PlatformError::Decode(e)) => {
                    log::warn!("[{}] skipping undecodable game event: {e}", self.game_id);
                }
                Err(e) => {
                    log::warn!("[{}] game stream failed: {e}", self.game_id);
                    return SessionEnd::StreamError(e.to_string());
                }
            }
        }
        SessionEnd::StreamEnded
    }

    fn greet(&self) {
        let text = &self.ctx.settings.greeting;
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.platform.post_message(&self.game_id, text) {
            log::debug!("[{}] greeting not posted: {e}", self.game_id);
        }
    }

    /// Applies one event. Returns `Some` once the session is over.
    pub fn handle_event(&mut self, event: GameEvent) -> Option<SessionEnd> {
        match event {
            GameEvent::GameFull(full) => self.on_full(full),
            GameEvent::GameState(state) => {
                if self.state == SessionState::AwaitingFull {
                    log::debug!("[{}] state update before full snapshot, ignored", self.game_id);
                    return None;
                }
                self.on_state(&state)
            }
            GameEvent::Ping | GameEvent::Other => None,
        }
    }

    fn on_full(&mut self, full: GameFull) -> Option<SessionEnd> {
        if self.state == SessionState::AwaitingFull {
            let me = self.ctx.settings.account_id.as_str();
            let is_me = |id: Option<&str>| id.is_some_and(|id| id.eq_ignore_ascii_case(me));
            let color = if is_me(full.white.id.as_deref()) {
                Color::White
            } else {
                Color::Black
            };
            self.board = match BoardState::from_initial(full.initial_fen.as_deref()) {
                Ok(board) => board,
                Err(e) => {
                    log::error!("[{}] cannot set up initial position: {e}", self.game_id);
                    return Some(SessionEnd::Desync(e.to_string()));
                }
            };
            self.color = Some(color);
            self.state = SessionState::Active;
            log::info!(
                "[{}] playing {} ({})",
                self.game_id,
                if color == Color::White { "white" } else { "black" },
                full.variant.key
            );
        }
        self.on_state(&full.state)
    }

    fn on_state(&mut self, data: &GameStateData) -> Option<SessionEnd> {
        let synced = match self.board.sync(&data.moves) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("[{}] {e}", self.game_id);
                self.state = SessionState::Terminal;
                return Some(SessionEnd::Desync(e.to_string()));
            }
        };
        if data.status.is_terminal() {
            self.state = SessionState::Terminal;
            return Some(SessionEnd::Finished(data.status));
        }
        if synced == SyncOutcome::Stale {
            log::debug!(
                "[{}] stale update with fewer moves than applied ({}), ignored",
                self.game_id,
                self.board.move_count()
            );
            return None;
        }
        if self.is_my_turn() {
            self.play_move(data);
        }
        None
    }

    fn is_my_turn(&self) -> bool {
        self.state == SessionState::Active
            && self.color == Some(self.board.turn())
            && !self.board.is_game_over()
            && self.submitted_ply != Some(self.board.move_count())
            && self.abandoned_ply != Some(self.board.move_count())
    }

    fn play_move(&mut self, data: &GameStateData) {
        let clock = data.clock();
        let decision = match self.ctx.decider.decide(&self.game_id, &self.board, &clock) {
            Ok(decision) => decision,
            Err(e) => {
                log::error!("[{}] no move to play: {e}", self.game_id);
                self.abandoned_ply = Some(self.board.move_count());
                return;
            }
        };
        if !self.submit(&decision.uci) {
            self.abandoned_ply = Some(self.board.move_count());
        }
    }

    /// Submits `uci` for the current ply with bounded retry on turn races.
    fn submit(&mut self, uci: &str) -> bool {
        let ply = self.board.move_count();
        let attempts = self.ctx.settings.submit_attempts.max(1);
        for attempt in 1..=attempts {
            match self.ctx.platform.make_move(&self.game_id, uci) {
                Ok(()) => {
                    self.submitted_ply = Some(ply);
                    self.moves_submitted += 1;
                    return true;
                }
                Err(PlatformError::NotYourTurn) if attempt < attempts => {
                    log::info!(
                        "[{}] {uci} rejected as not our turn (attempt {attempt}/{attempts}), retrying",
                        self.game_id
                    );
                    thread::sleep(self.ctx.settings.not_your_turn_delay);
                }
                Err(e) => {
                    log::warn!(
                        "[{}] submission of {uci} abandoned at ply {ply} (attempt {attempt}/{attempts}): {e}",
                        self.game_id
                    );
                    return false;
                }
            }
        }
        false
    }
}
