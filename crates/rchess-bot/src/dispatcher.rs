//! Account event loop: challenge admission, session spawning, reconnects and
//! the process-level stop conditions.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::PlatformError;
use crate::lifecycle::{ExitReason, Lifecycle};
use crate::platform::{ChallengeInfo, DeclineReason, IncomingEvent, Platform};
use crate::registry::GameRegistry;
use crate::session::{GameSession, SessionContext, SessionEnd};

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);
/// How long an accepted challenge holds its slot without a `gameStart`.
const RESERVATION_TTL: Duration = Duration::from_secs(60);

/// Decision for an incoming challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Decline(DeclineReason),
    /// Our own outgoing challenge echoed back on the stream.
    Ignore,
}

pub struct Dispatcher {
    ctx: Arc<SessionContext>,
    sessions: Vec<(String, JoinHandle<SessionEnd>)>,
    reconnect_pause: Duration,
    rate_limit_pause: Duration,
}

impl Dispatcher {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            sessions: Vec::new(),
            reconnect_pause: RECONNECT_PAUSE,
            rate_limit_pause: RATE_LIMIT_PAUSE,
        }
    }

    pub fn with_pauses(mut self, reconnect: Duration, rate_limit: Duration) -> Self {
        self.reconnect_pause = reconnect;
        self.rate_limit_pause = rate_limit;
        self
    }

    fn platform(&self) -> &dyn Platform {
        self.ctx.platform.as_ref()
    }

    fn registry(&self) -> &GameRegistry {
        &self.ctx.registry
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.ctx.lifecycle
    }

    fn cap(&self) -> usize {
        self.ctx.settings.max_parallel_games
    }

    /// Serves the event stream, reconnecting as needed, until an exit condition
    /// holds.
    pub fn run(&mut self) -> ExitReason {
        log::info!(
            "dispatcher: serving events for {} (max {} games)",
            self.ctx.settings.account_id,
            self.cap()
        );
        loop {
            if let Some(reason) = self.check_exit() {
                return reason;
            }
            let pause = match self.serve_stream() {
                Ok(Some(reason)) => return reason,
                Ok(None) => {
                    log::info!("dispatcher: event stream closed, reconnecting");
                    self.reconnect_pause
                }
                Err(e) if e.is_rate_limit() => {
                    log::warn!("dispatcher: rate limited, pausing {:?}", self.rate_limit_pause);
                    self.rate_limit_pause
                }
                Err(e) => {
                    log::warn!("dispatcher: event stream failed: {e}");
                    self.reconnect_pause
                }
            };
            if !self.lifecycle().pause(pause) {
                return ExitReason::Aborted;
            }
        }
    }

    /// Reads one connection's worth of events. `Ok(None)` means the stream ended.
    fn serve_stream(&mut self) -> Result<Option<ExitReason>, PlatformError> {
        let stream = self.platform().stream_incoming_events()?;
        for event in stream {
            let event = match event {
                Ok(event) => event,
                Err(PlatformError::Decode(e)) => {
                    log::warn!("dispatcher: skipping undecodable event: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.handle_event(event)?;
            if let Some(reason) = self.check_exit() {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Applies one account event. Only rate-limit errors are returned; other
    /// request failures are logged.
    pub fn handle_event(&mut self, event: IncomingEvent) -> Result<(), PlatformError> {
        self.reap_finished();
        match event {
            IncomingEvent::Challenge { challenge } => self.on_challenge(&challenge),
            IncomingEvent::GameStart { game } => {
                self.start_game(&game.id);
                Ok(())
            }
            IncomingEvent::ChallengeCanceled { challenge } | IncomingEvent::ChallengeDeclined { challenge } => {
                if self.registry().release_reservation(&challenge.id) {
                    log::info!("dispatcher: challenge {} withdrawn, slot released", challenge.id);
                }
                Ok(())
            }
            IncomingEvent::Ping | IncomingEvent::Other => Ok(()),
        }
    }

    pub fn admission(&self, challenge: &ChallengeInfo) -> Admission {
        let me = self.ctx.settings.account_id.as_str();
        if challenge.challenger_id().is_some_and(|id| id.eq_ignore_ascii_case(me)) {
            return Admission::Ignore;
        }
        if !challenge.variant.is_supported() {
            return Admission::Decline(DeclineReason::Variant);
        }
        if !self.lifecycle().accepting() || self.registry().len() >= self.cap() {
            return Admission::Decline(DeclineReason::Later);
        }
        Admission::Accept
    }

    fn on_challenge(&self, challenge: &ChallengeInfo) -> Result<(), PlatformError> {
        let from = challenge.challenger_id().unwrap_or("?");
        let result = match self.admission(challenge) {
            Admission::Ignore => return Ok(()),
            Admission::Accept => {
                log::info!("dispatcher: accepting challenge {} from {from}", challenge.id);
                // The game id equals the challenge id; the slot is held until it starts.
                self.registry().try_reserve(&challenge.id, self.cap());
                let accepted = self.platform().accept_challenge(&challenge.id);
                if accepted.is_err() {
                    self.registry().release_reservation(&challenge.id);
                }
                accepted
            }
            Admission::Decline(reason) => {
                log::info!(
                    "dispatcher: declining challenge {} from {from} ({reason}, {}/{} games)",
                    challenge.id,
                    self.registry().len(),
                    self.cap()
                );
                self.platform().decline_challenge(&challenge.id, reason)
            }
        };
        match result {
            Err(e) if e.is_rate_limit() => Err(e),
            Err(e) => {
                log::warn!("dispatcher: challenge {} response failed: {e}", challenge.id);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn start_game(&mut self, game_id: &str) {
        if self.registry().contains(game_id) {
            log::debug!("[{game_id}] already running");
            return;
        }
        if !self.registry().try_admit(game_id, self.cap()) {
            log::warn!(
                "[{game_id}] game started with all {} slots busy, not playing it",
                self.cap()
            );
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let id = game_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("game-{game_id}"))
            .spawn(move || GameSession::new(&id, ctx).run());
        match spawned {
            Ok(handle) => {
                log::info!(
                    "[{game_id}] admitted, {}/{} slots in use",
                    self.registry().len(),
                    self.cap()
                );
                self.sessions.push((game_id.to_string(), handle));
            }
            Err(e) => {
                log::error!("[{game_id}] failed to start session thread: {e}");
                self.registry().remove(game_id);
            }
        }
    }

    fn reap_finished(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|(_, handle)| handle.is_finished());
        self.sessions = running;
        for (game_id, handle) in done {
            if handle.join().is_err() {
                log::error!("[{game_id}] session thread panicked");
            }
        }
    }

    /// Exit conditions, checked between events.
    pub fn check_exit(&self) -> Option<ExitReason> {
        for id in self.registry().expire_reservations(RESERVATION_TTL) {
            log::warn!("dispatcher: no game started for accepted challenge {id}, slot released");
        }
        let lifecycle = self.lifecycle();
        if lifecycle.is_aborted() {
            return Some(ExitReason::Aborted);
        }
        if lifecycle.deadline_passed() {
            if self.registry().is_empty() {
                log::info!("dispatcher: runtime ceiling reached and no games left");
                return Some(ExitReason::Deadline);
            }
            if !lifecycle.should_stop() {
                log::warn!(
                    "dispatcher: runtime ceiling reached, waiting for {} game(s) to finish",
                    self.registry().len()
                );
                lifecycle.request_stop();
            }
            return None;
        }
        if lifecycle.should_stop() && self.registry().is_empty() {
            log::info!("dispatcher: stop requested and no games left");
            return Some(ExitReason::Drained);
        }
        None
    }

    /// Waits for running sessions. Used by the binary on an orderly exit.
    pub fn join_sessions(&mut self) -> Vec<(String, SessionEnd)> {
        let mut ended = Vec::new();
        for (game_id, handle) in std::mem::take(&mut self.sessions) {
            match handle.join() {
                Ok(end) => ended.push((game_id, end)),
                Err(_) => log::error!("[{game_id}] session thread panicked"),
            }
        }
        ended
    }

    pub fn running_sessions(&self) -> usize {
        self.sessions.len()
    }
}
