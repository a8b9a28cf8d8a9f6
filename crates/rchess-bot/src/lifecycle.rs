//! Process lifetime: stop sentinel, runtime ceiling, pre-shutdown quiet
//! window, and the abort flag sessions poll.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::BotConfig;

const PAUSE_SLICE: Duration = Duration::from_millis(250);

/// Why a long-running loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Sentinel present (or Ctrl-C) and no games left.
    Drained,
    /// Runtime ceiling reached and no games left.
    Deadline,
    Aborted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Drained => "drained",
            ExitReason::Deadline => "deadline reached",
            ExitReason::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

pub struct Lifecycle {
    started: Instant,
    max_runtime: Duration,
    quiet_window: Duration,
    sentinel: PathBuf,
    stop_requested: AtomicBool,
    abort: AtomicBool,
}

impl Lifecycle {
    pub fn new(max_runtime: Duration, quiet_window: Duration, sentinel: &Path) -> Self {
        Self {
            started: Instant::now(),
            max_runtime,
            quiet_window,
            sentinel: sentinel.to_path_buf(),
            stop_requested: AtomicBool::new(false),
            abort: AtomicBool::new(false),
        }
    }

    pub fn from_config(cfg: &BotConfig) -> Self {
        Self::new(
            cfg.limits.max_total_runtime(),
            cfg.limits.quiet_window(),
            &cfg.stop_file,
        )
    }

    pub fn sentinel_present(&self) -> bool {
        self.sentinel.exists()
    }

    /// Stop accepting new work: sentinel file or an explicit request.
    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst) || self.sentinel_present()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Within `quiet_window` of the runtime ceiling (or past it).
    pub fn in_quiet_window(&self) -> bool {
        self.elapsed() + self.quiet_window >= self.max_runtime
    }

    pub fn deadline_passed(&self) -> bool {
        self.elapsed() >= self.max_runtime
    }

    /// No new games: stop requested, sentinel present, or quiet window reached.
    pub fn accepting(&self) -> bool {
        !self.should_stop() && !self.in_quiet_window() && !self.is_aborted()
    }

    /// Sessions leave their event loop at the next event once this is set.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early on abort. Returns false if aborted.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_aborted() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(left.min(PAUSE_SLICE));
        }
    }
}
