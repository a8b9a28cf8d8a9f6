//! Outbound challenges against online bots: candidate pool, rating filter,
//! cool-down blacklist and rate-limit backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand::rngs::StdRng;

use crate::config::{MatchmakingConfig, TimeControlSpec};
use crate::error::PlatformError;
use crate::lifecycle::{ExitReason, Lifecycle};
use crate::platform::{ChallengeRequest, Platform};
use crate::registry::GameRegistry;

const DRAIN_PAUSE: Duration = Duration::from_secs(30);
const AT_CAPACITY_PAUSE: Duration = Duration::from_secs(15);
const NO_TARGET_PAUSE: Duration = Duration::from_secs(20);
const ERROR_PAUSE: Duration = Duration::from_secs(30);

/// Candidate → cool-down expiry. In memory only.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashMap<String, Instant>,
}

impl Blacklist {
    pub fn block(&mut self, id: &str, cool_down: Duration) {
        let until = Instant::now() + cool_down;
        let entry = self.entries.entry(id.to_string()).or_insert(until);
        // Never shorten an existing, longer cool-down.
        if *entry < until {
            *entry = until;
        }
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|until| *until > Instant::now())
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, until| *until > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wait applied after a rate-limit signal: doubles per signal up to a ceiling,
/// back to the base after a clean cycle.
#[derive(Debug, Clone)]
pub struct BackoffState {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffState {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the wait to apply now and doubles the next one.
    pub fn on_rate_limit(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub rating: u32,
}

/// What one scheduler cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Exit(ExitReason),
    /// Stop requested or quiet window; games still running.
    Draining { active: usize },
    AtCapacity,
    NoTarget,
    Challenged {
        target: String,
        time_control: TimeControlSpec,
        rated: bool,
    },
    RateLimited { wait: Duration },
    Failed(String),
}

pub struct MatchmakingScheduler {
    platform: Arc<dyn Platform>,
    registry: Arc<GameRegistry>,
    lifecycle: Arc<Lifecycle>,
    cfg: MatchmakingConfig,
    max_parallel_games: usize,
    account_id: String,
    pool: Vec<String>,
    pool_refreshed: Option<Instant>,
    blacklist: Blacklist,
    backoff: BackoffState,
    rng: StdRng,
}

impl MatchmakingScheduler {
    pub fn new(
        platform: Arc<dyn Platform>,
        registry: Arc<GameRegistry>,
        lifecycle: Arc<Lifecycle>,
        cfg: MatchmakingConfig,
        max_parallel_games: usize,
        account_id: &str,
    ) -> Self {
        let backoff = BackoffState::new(
            Duration::from_secs(cfg.backoff_base_secs),
            Duration::from_secs(cfg.backoff_max_secs),
        );
        Self {
            platform,
            registry,
            lifecycle,
            cfg,
            max_parallel_games,
            account_id: account_id.to_string(),
            pool: Vec::new(),
            pool_refreshed: None,
            blacklist: Blacklist::default(),
            backoff,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Fixes the random source, for reproducible time-control picks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Runs cycles until the process should exit.
    pub fn run(&mut self) -> ExitReason {
        log::info!(
            "[matchmaking] started (rating {}..={}, rated {})",
            self.cfg.min_rating,
            self.cfg.max_rating,
            self.cfg.rated
        );
        loop {
            let outcome = self.run_cycle();
            let pause = match &outcome {
                CycleOutcome::Exit(reason) => {
                    log::info!("[matchmaking] exiting: {reason}");
                    return *reason;
                }
                CycleOutcome::Draining { active } => {
                    log::info!("[matchmaking] draining, waiting for {active} game(s) to finish");
                    DRAIN_PAUSE
                }
                CycleOutcome::AtCapacity => AT_CAPACITY_PAUSE,
                CycleOutcome::NoTarget => NO_TARGET_PAUSE,
                CycleOutcome::Challenged { .. } => Duration::from_secs(self.cfg.safety_lock_secs),
                CycleOutcome::RateLimited { wait } => *wait,
                CycleOutcome::Failed(_) => ERROR_PAUSE,
            };
            if !self.lifecycle.pause(pause) {
                return ExitReason::Aborted;
            }
        }
    }

    /// One pass of the selection loop. Sleeps only between rating queries.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        if self.lifecycle.is_aborted() {
            return CycleOutcome::Exit(ExitReason::Aborted);
        }
        if self.lifecycle.should_stop() || self.lifecycle.in_quiet_window() {
            let active = self.registry.len();
            if active == 0 && self.lifecycle.should_stop() {
                return CycleOutcome::Exit(ExitReason::Drained);
            }
            return CycleOutcome::Draining { active };
        }
        if self.registry.len() >= self.max_parallel_games {
            return CycleOutcome::AtCapacity;
        }

        match self.try_challenge() {
            // Any cycle without an error resets the backoff, including one that
            // found no target.
            Ok(outcome) => {
                if self.backoff.current() != self.backoff.base {
                    log::info!("[matchmaking] clean cycle, backoff reset to {:?}", self.backoff.base);
                }
                self.backoff.reset();
                outcome
            }
            Err(e) if e.is_rate_limit() => {
                let wait = self.backoff.on_rate_limit();
                log::warn!(
                    "[matchmaking] rate limited, pausing {wait:?} (next backoff {:?})",
                    self.backoff.current()
                );
                CycleOutcome::RateLimited { wait }
            }
            Err(e) => {
                log::warn!("[matchmaking] cycle failed: {e}");
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    fn try_challenge(&mut self) -> Result<CycleOutcome, PlatformError> {
        self.refresh_pool()?;
        let Some(target) = self.find_target()? else {
            log::debug!("[matchmaking] no suitable opponent in this scan");
            return Ok(CycleOutcome::NoTarget);
        };

        let (time_control, rated) = self.pick_terms(&target);
        let request = ChallengeRequest {
            rated,
            clock_limit_secs: time_control.clock_limit_secs(),
            increment_secs: time_control.increment_secs,
        };
        log::info!(
            "[matchmaking] challenging {} ({}) at {time_control}, rated {rated}",
            target.id,
            target.rating
        );
        // Blocked before the request so a pending invite is never repeated.
        self.blacklist
            .block(&target.id, Duration::from_secs(self.cfg.blacklist_mins * 60));
        self.platform.create_challenge(&target.id, &request)?;
        Ok(CycleOutcome::Challenged {
            target: target.id,
            time_control,
            rated,
        })
    }

    fn refresh_pool(&mut self) -> Result<(), PlatformError> {
        let fresh = self
            .pool_refreshed
            .is_some_and(|at| at.elapsed() < Duration::from_secs(self.cfg.pool_refresh_secs));
        if fresh && !self.pool.is_empty() {
            return Ok(());
        }
        let me = self.account_id.to_ascii_lowercase();
        let mut pool: Vec<String> = self
            .platform
            .online_bots(self.cfg.pool_size)?
            .into_iter()
            .filter(|id| id.to_ascii_lowercase() != me)
            .collect();
        pool.shuffle(&mut self.rng);
        self.blacklist.purge_expired();
        log::info!("[matchmaking] candidate pool refreshed: {} bots", pool.len());
        self.pool = pool;
        self.pool_refreshed = Some(Instant::now());
        Ok(())
    }

    /// First non-blacklisted candidate of the scanned prefix whose rating is
    /// in the band. Candidates outside the band are blacklisted for longer.
    fn find_target(&mut self) -> Result<Option<Candidate>, PlatformError> {
        let scan: Vec<String> = self.pool.iter().take(self.cfg.scan_limit).cloned().collect();
        let interval = Duration::from_millis(self.cfg.query_interval_ms);
        for id in scan {
            if self.blacklist.is_blocked(&id) {
                continue;
            }
            if !interval.is_zero() {
                thread::sleep(interval);
            }
            let rating = match self.platform.public_data(&id) {
                Ok(profile) => profile.best_rating(),
                Err(e) if e.is_rate_limit() => return Err(e),
                Err(e) => {
                    log::debug!("[matchmaking] rating lookup for {id} failed: {e}");
                    continue;
                }
            };
            if (self.cfg.min_rating..=self.cfg.max_rating).contains(&rating) {
                return Ok(Some(Candidate { id, rating }));
            }
            log::debug!("[matchmaking] {id} rated {rating} is outside the band");
            self.blacklist.block(
                &id,
                Duration::from_secs(self.cfg.out_of_band_blacklist_hours * 3600),
            );
        }
        Ok(None)
    }

    /// Weak opponents always get an unrated, fast game.
    fn pick_terms(&mut self, target: &Candidate) -> (TimeControlSpec, bool) {
        let (list, rated) = if target.rating < self.cfg.low_elo_threshold {
            (&self.cfg.low_elo_time_controls, false)
        } else {
            (&self.cfg.time_controls, self.cfg.rated)
        };
        let fallback = TimeControlSpec {
            minutes: 3,
            increment_secs: 0,
        };
        let time_control = list.choose(&mut self.rng).copied().unwrap_or(fallback);
        (time_control, rated)
    }
}
