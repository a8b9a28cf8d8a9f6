//! Bot configuration loaded from a TOML file.
//!
//! Every field has a default so an empty file is a valid configuration; the
//! CLI may override a handful of fields after loading.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Environment variable holding the API token.
    pub token_env: String,
    pub base_url: String,
    /// Posted into each game's player chat on start. Empty disables it.
    pub greeting: String,
    /// Presence of this file means "stop accepting new work".
    pub stop_file: PathBuf,
    pub limits: LimitsConfig,
    pub engine: EngineConfig,
    pub time: TimeConfig,
    pub book: BookConfig,
    pub tablebase: TablebaseConfig,
    pub session: SessionConfig,
    pub matchmaking: MatchmakingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token_env: "LICHESS_TOKEN".to_string(),
            base_url: "https://lichess.org".to_string(),
            greeting: "rchess-bot online. Good luck!".to_string(),
            stop_file: PathBuf::from("STOP.txt"),
            limits: LimitsConfig::default(),
            engine: EngineConfig::default(),
            time: TimeConfig::default(),
            book: BookConfig::default(),
            tablebase: TablebaseConfig::default(),
            session: SessionConfig::default(),
            matchmaking: MatchmakingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_parallel_games: usize,
    /// Total runtime ceiling of the process.
    pub max_total_runtime_secs: u64,
    /// No new games are accepted this many minutes before the ceiling.
    pub stop_accepting_mins: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_parallel_games: 2,
            max_total_runtime_secs: 21_300,
            stop_accepting_mins: 15,
        }
    }
}

impl LimitsConfig {
    pub fn max_total_runtime(&self) -> Duration {
        Duration::from_secs(self.max_total_runtime_secs)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_secs(self.stop_accepting_mins * 60)
    }
}

/// 起動する UCI エンジンの設定。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// `setoption` values, sent only for options the engine advertises.
    pub uci_options: BTreeMap<String, toml::Value>,
    pub ready_timeout_secs: u64,
    /// Grace period after the think time before `stop` is sent.
    pub search_margin_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./engine"),
            args: Vec::new(),
            uci_options: BTreeMap::new(),
            ready_timeout_secs: 30,
            search_margin_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn search_margin(&self) -> Duration {
        Duration::from_millis(self.search_margin_ms)
    }

    /// Options rendered as `(name, value)` strings in a stable order.
    pub fn option_pairs(&self) -> Vec<(String, String)> {
        self.uci_options
            .iter()
            .map(|(name, value)| {
                let rendered = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), rendered)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// Seconds reserved for network / move transmission delay.
    pub latency_buffer: f64,
    pub min_think_time: f64,
    /// Share of the increment spent on top of the per-move slice.
    pub increment_weight: f64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            latency_buffer: 0.2,
            min_think_time: 0.05,
            increment_weight: 0.85,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TablebaseConfig {
    pub enabled: bool,
    pub url: String,
    /// Piece ceiling used when time is short.
    pub piece_limit: usize,
    /// Piece ceiling used when more than 30s remain.
    pub piece_limit_ample: usize,
}

impl Default for TablebaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://tablebase.lichess.ovh/standard".to_string(),
            piece_limit: 6,
            piece_limit_ample: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub submit_attempts: u32,
    pub not_your_turn_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            submit_attempts: 3,
            not_your_turn_delay_ms: 50,
        }
    }
}

impl SessionConfig {
    pub fn not_your_turn_delay(&self) -> Duration {
        Duration::from_millis(self.not_your_turn_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    pub enabled: bool,
    pub rated: bool,
    pub min_rating: u32,
    pub max_rating: u32,
    /// Candidates below this rating are always challenged unrated and fast.
    pub low_elo_threshold: u32,
    pub time_controls: Vec<TimeControlSpec>,
    pub low_elo_time_controls: Vec<TimeControlSpec>,
    pub safety_lock_secs: u64,
    pub pool_refresh_secs: u64,
    pub pool_size: usize,
    pub scan_limit: usize,
    pub query_interval_ms: u64,
    pub blacklist_mins: u64,
    pub out_of_band_blacklist_hours: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        let parse = |list: &[&str]| -> Vec<TimeControlSpec> {
            list.iter().filter_map(|s| s.parse().ok()).collect()
        };
        Self {
            enabled: true,
            rated: false,
            min_rating: 2250,
            max_rating: 4000,
            low_elo_threshold: 2250,
            time_controls: parse(&[
                "1+0", "1+1", "2+1", "3+0", "3+2", "5+0", "5+3", "10+0", "10+5", "15+10", "30+0",
            ]),
            low_elo_time_controls: parse(&["1+0", "1+1", "2+1", "3+0", "5+0"]),
            safety_lock_secs: 60,
            pool_refresh_secs: 1_800,
            pool_size: 50,
            scan_limit: 20,
            query_interval_ms: 2_000,
            blacklist_mins: 30,
            out_of_band_blacklist_hours: 12,
            backoff_base_secs: 120,
            backoff_max_secs: 3_600,
        }
    }
}

/// A time control written as `"minutes+increment"`, e.g. `"3+2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeControlSpec {
    pub minutes: u32,
    pub increment_secs: u32,
}

impl TimeControlSpec {
    pub fn clock_limit_secs(&self) -> u32 {
        self.minutes * 60
    }
}

impl FromStr for TimeControlSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("time control {s:?} is not \"M+S\""));
        let (minutes, inc) = s.trim().split_once('+').ok_or_else(invalid)?;
        Ok(Self {
            minutes: minutes.trim().parse().map_err(|_| invalid())?,
            increment_secs: inc.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for TimeControlSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.minutes, self.increment_secs)
    }
}

impl<'de> Deserialize<'de> for TimeControlSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_parallel_games == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_parallel_games must be at least 1".to_string(),
            ));
        }
        let mm = &self.matchmaking;
        if mm.min_rating > mm.max_rating {
            return Err(ConfigError::Invalid(format!(
                "matchmaking rating band is inverted ({} > {})",
                mm.min_rating, mm.max_rating
            )));
        }
        if mm.enabled && (mm.time_controls.is_empty() || mm.low_elo_time_controls.is_empty()) {
            return Err(ConfigError::Invalid(
                "matchmaking time control lists must not be empty".to_string(),
            ));
        }
        if self.session.submit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "session.submit_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine pool size: one engine per parallel game plus a spare.
    pub fn engine_pool_size(&self) -> usize {
        self.limits.max_parallel_games + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = BotConfig::from_toml("").unwrap();
        assert_eq!(config.limits.max_parallel_games, 2);
        assert_eq!(config.engine_pool_size(), 3);
        assert_eq!(config.matchmaking.backoff_base_secs, 120);
        assert_eq!(config.matchmaking.time_controls.len(), 11);
        assert_eq!(config.tablebase.piece_limit, 6);
    }

    #[test]
    fn parses_sections_and_options() {
        let text = r#"
            greeting = ""
            [limits]
            max_parallel_games = 4
            [engine]
            path = "/opt/engine"
            uci_options = { Hash = 256, Threads = 2, SyzygyPath = "/tb" }
            [matchmaking]
            rated = true
            time_controls = ["3+2", "5+0"]
        "#;
        let config = BotConfig::from_toml(text).unwrap();
        assert_eq!(config.limits.max_parallel_games, 4);
        assert!(config.greeting.is_empty());
        assert!(config.matchmaking.rated);
        assert_eq!(
            config.matchmaking.time_controls,
            vec![
                TimeControlSpec { minutes: 3, increment_secs: 2 },
                TimeControlSpec { minutes: 5, increment_secs: 0 },
            ]
        );
        let pairs = config.engine.option_pairs();
        assert!(pairs.contains(&("Hash".to_string(), "256".to_string())));
        assert!(pairs.contains(&("SyzygyPath".to_string(), "/tb".to_string())));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(BotConfig::from_toml("[limits]\nmax_parallel_games = 0").is_err());
        assert!(BotConfig::from_toml("[matchmaking]\nmin_rating = 3000\nmax_rating = 2000").is_err());
        assert!(BotConfig::from_toml("[matchmaking]\ntime_controls = [\"3-2\"]").is_err());
        assert!(BotConfig::from_toml("[matchmaking]\ntime_controls = []").is_err());
    }

    #[test]
    fn time_control_spec_round_trips_display() {
        let tc: TimeControlSpec = " 15 + 10 ".parse().unwrap();
        assert_eq!(tc.clock_limit_secs(), 900);
        assert_eq!(tc.to_string(), "15+10");
    }
}
