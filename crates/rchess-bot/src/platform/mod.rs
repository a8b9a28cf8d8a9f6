//! Remote platform boundary: the [`Platform`] trait, the events it streams,
//! and the Lichess implementation.

mod lichess;

pub use lichess::LichessClient;

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::PlatformError;
use crate::time_budget::{ClockState, ClockValue};

/// A blocking stream of decoded events. Ends when the server closes it.
pub type EventStream<T> = Box<dyn Iterator<Item = Result<T, PlatformError>> + Send>;

pub trait Platform: Send + Sync {
    /// Id of the authenticated account.
    fn account_id(&self) -> Result<String, PlatformError>;

    fn stream_incoming_events(&self) -> Result<EventStream<IncomingEvent>, PlatformError>;

    fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, PlatformError>;

    fn post_message(&self, game_id: &str, text: &str) -> Result<(), PlatformError>;

    fn make_move(&self, game_id: &str, uci: &str) -> Result<(), PlatformError>;

    fn accept_challenge(&self, challenge_id: &str) -> Result<(), PlatformError>;

    fn decline_challenge(&self, challenge_id: &str, reason: DeclineReason) -> Result<(), PlatformError>;

    fn create_challenge(&self, target: &str, request: &ChallengeRequest) -> Result<(), PlatformError>;

    /// Ids of up to `limit` bots currently online.
    fn online_bots(&self, limit: usize) -> Result<Vec<String>, PlatformError>;

    fn public_data(&self, user_id: &str) -> Result<UserProfile, PlatformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    Later,
    Variant,
}

impl DeclineReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclineReason::Later => "later",
            DeclineReason::Variant => "variant",
        }
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub rated: bool,
    pub clock_limit_secs: u32,
    pub increment_secs: u32,
}

/// Event kinds that can carry a blank keep-alive line.
pub trait StreamEvent: DeserializeOwned {
    fn keep_alive() -> Self;
}

/// Decodes one NDJSON line. Blank lines are keep-alives.
pub fn parse_stream_line<T: StreamEvent>(line: &str) -> Result<T, PlatformError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(T::keep_alive());
    }
    Ok(serde_json::from_str(line)?)
}

/// Account-level event stream entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingEvent {
    Challenge {
        challenge: ChallengeInfo,
    },
    GameStart {
        game: GameRef,
    },
    ChallengeCanceled {
        challenge: ChallengeInfo,
    },
    ChallengeDeclined {
        challenge: ChallengeInfo,
    },
    /// Keep-alive; never sent as JSON.
    #[serde(skip)]
    Ping,
    #[serde(other)]
    Other,
}

impl StreamEvent for IncomingEvent {
    fn keep_alive() -> Self {
        IncomingEvent::Ping
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeInfo {
    pub id: String,
    #[serde(default)]
    pub challenger: Option<UserRef>,
    #[serde(default)]
    pub variant: Variant,
    #[serde(default)]
    pub rated: bool,
}

impl ChallengeInfo {
    pub fn challenger_id(&self) -> Option<&str> {
        self.challenger.as_ref().and_then(|u| u.id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub key: String,
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            key: "standard".to_string(),
        }
    }
}

impl Variant {
    /// Variants this bot plays: standard chess, possibly from a custom position.
    pub fn is_supported(&self) -> bool {
        matches!(self.key.as_str(), "standard" | "fromPosition")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameRef {
    pub id: String,
}

/// Per-game stream entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(GameFull),
    GameState(GameStateData),
    #[serde(skip)]
    Ping,
    #[serde(other)]
    Other,
}

impl StreamEvent for GameEvent {
    fn keep_alive() -> Self {
        GameEvent::Ping
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameFull {
    pub id: String,
    pub white: UserRef,
    pub black: UserRef,
    #[serde(rename = "initialFen", default)]
    pub initial_fen: Option<String>,
    #[serde(default)]
    pub variant: Variant,
    pub state: GameStateData,
}

/// Moves and clocks after the latest ply. Clock values are milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct GameStateData {
    #[serde(default)]
    pub moves: String,
    #[serde(default)]
    pub wtime: u64,
    #[serde(default)]
    pub btime: u64,
    #[serde(default)]
    pub winc: u64,
    #[serde(default)]
    pub binc: u64,
    #[serde(default)]
    pub status: GameStatus,
}

impl GameStateData {
    pub fn clock(&self) -> ClockState {
        ClockState::new(
            ClockValue::Millis(self.wtime),
            ClockValue::Millis(self.btime),
            ClockValue::Millis(self.winc),
            ClockValue::Millis(self.binc),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GameStatus {
    Created,
    #[default]
    Started,
    Aborted,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    Outoftime,
    Cheat,
    NoStart,
    UnknownFinish,
    VariantEnd,
    #[serde(other)]
    Unknown,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GameStatus::Created | GameStatus::Started | GameStatus::Unknown)
    }
}

/// Public profile subset used for opponent selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub perfs: HashMap<String, Perf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Perf {
    #[serde(default)]
    pub rating: u32,
}

impl UserProfile {
    /// Highest of the bullet, blitz and rapid ratings; 0 when none is known.
    pub fn best_rating(&self) -> u32 {
        ["bullet", "blitz", "rapid"]
            .iter()
            .filter_map(|key| self.perfs.get(*key))
            .map(|p| p.rating)
            .max()
            .unwrap_or(0)
    }
}
