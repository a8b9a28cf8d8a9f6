//! Endgame tablebase lookups over HTTP.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::board::BoardState;
use crate::error::TablebaseError;

pub trait Tablebase: Send + Sync {
    /// Best move for the position, or `None` when the service has no answer.
    /// The returned move is legal in `board`.
    fn probe(&self, board: &BoardState, timeout: Duration) -> Result<Option<String>, TablebaseError>;
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    moves: Vec<RankedMove>,
}

#[derive(Debug, Deserialize)]
struct RankedMove {
    uci: String,
}

/// Client for a Lichess-style tablebase endpoint (`GET {url}?fen=...`).
pub struct HttpTablebase {
    client: Client,
    url: String,
}

impl HttpTablebase {
    pub fn new(url: &str) -> Result<Self, TablebaseError> {
        let client = Client::builder()
            .user_agent(concat!("rchess-bot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

impl Tablebase for HttpTablebase {
    fn probe(&self, board: &BoardState, timeout: Duration) -> Result<Option<String>, TablebaseError> {
        let fen = board.fen().replace(' ', "_");
        let res = self
            .client
            .get(&self.url)
            .query(&[("fen", fen.as_str())])
            .timeout(timeout)
            .send()?;
        let status = res.status();
        if !status.is_success() {
            return Err(TablebaseError::Status(status.as_u16()));
        }
        let body = res.text()?;
        first_legal_move(board, &body)
    }
}

/// Picks the first ranked move of a probe response, checked against the board.
pub fn first_legal_move(board: &BoardState, body: &str) -> Result<Option<String>, TablebaseError> {
    let response: ProbeResponse = serde_json::from_str(body)?;
    let Some(first) = response.moves.into_iter().next() else {
        return Ok(None);
    };
    match board.parse_uci(&first.uci) {
        Some(m) => Ok(Some(board.move_to_uci(&m))),
        None => Err(TablebaseError::IllegalMove(first.uci)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KQK: &str = "8/8/8/4k3/8/8/8/3QK3 w - - 0 1";

    #[test]
    fn takes_the_first_ranked_move() {
        let board = BoardState::from_initial(Some(KQK)).unwrap();
        let body = r#"{"category":"win","moves":[{"uci":"d1d4","category":"loss"},{"uci":"d1d2","category":"loss"}]}"#;
        assert_eq!(first_legal_move(&board, body).unwrap().as_deref(), Some("d1d4"));
    }

    #[test]
    fn empty_or_missing_moves_mean_no_answer() {
        let board = BoardState::from_initial(Some(KQK)).unwrap();
        assert_eq!(first_legal_move(&board, r#"{"moves":[]}"#).unwrap(), None);
        assert_eq!(first_legal_move(&board, r#"{"category":"unknown"}"#).unwrap(), None);
    }

    #[test]
    fn illegal_or_malformed_answers_are_errors() {
        let board = BoardState::from_initial(Some(KQK)).unwrap();
        assert!(matches!(
            first_legal_move(&board, r#"{"moves":[{"uci":"a1a8"}]}"#),
            Err(TablebaseError::IllegalMove(_))
        ));
        assert!(matches!(
            first_legal_move(&board, "<html>"),
            Err(TablebaseError::Decode(_))
        ));
    }
}
