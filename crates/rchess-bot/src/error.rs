//! Error types, one enum per decision / transport stage.
//!
//! A rate limit triggers backoff, a turn race a short retry, and an engine
//! failure the legal-move fallback.

use thiserror::Error;

/// Errors from the remote platform (HTTP API and NDJSON streams).
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,

    /// The move endpoint rejected a move because the server still thinks it
    /// is the opponent's turn.
    #[error("not your turn")]
    NotYourTurn,

    #[error("request rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl PlatformError {
    /// True when the error carries a rate-limit signal.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            PlatformError::RateLimited => true,
            PlatformError::Rejected { status, .. } => *status == 429,
            PlatformError::Http(e) => e.status().is_some_and(|s| s.as_u16() == 429),
            other => other.to_string().contains("429"),
        }
    }
}

/// Errors from a UCI engine subprocess. Any of these marks the handle unhealthy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn engine at {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label}: engine i/o failed: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label}: engine did not answer within {waited_ms}ms")]
    Timeout { label: String, waited_ms: u64 },

    #[error("{label}: engine exited unexpectedly")]
    Exited { label: String },

    #[error("{label}: search ended without a bestmove")]
    NoBestMove { label: String },

    #[error("{label}: engine returned illegal move {uci}")]
    IllegalMove { label: String, uci: String },
}

/// Errors from the opening book.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("book read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("book file is corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the tablebase service. All of them mean "no result".
#[derive(Debug, Error)]
pub enum TablebaseError {
    #[error("tablebase request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tablebase answered HTTP {0}")]
    Status(u16),

    #[error("malformed tablebase response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("tablebase move {0} is not legal here")]
    IllegalMove(String),
}

/// Errors while building or advancing a board from platform move lists.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("invalid FEN {fen}: {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("move #{index} ({uci}) is not legal")]
    IllegalMove { index: usize, uci: String },
}

/// The only failure the decision pipeline surfaces: there is nothing to play.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("no legal moves in position {0}")]
    NoLegalMoves(String),
}

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
