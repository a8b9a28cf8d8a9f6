//! Board state of one game, advanced incrementally from platform move lists.

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position};

use crate::error::BoardError;

/// Applied moves plus the derived position.
///
/// Owned by exactly one game session. The move list only ever grows: each
/// platform update replays just the moves beyond what was already applied.
#[derive(Debug, Clone)]
pub struct BoardState {
    /// `None` for the standard start position.
    initial_fen: Option<String>,
    position: Chess,
    moves: Vec<String>,
}

/// What [`BoardState::sync`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This many new moves were applied.
    Advanced(usize),
    Unchanged,
    /// The update carried fewer moves than already applied and was ignored.
    Stale,
}

impl Default for BoardState {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardState {
    pub fn new() -> Self {
        Self {
            initial_fen: None,
            position: Chess::default(),
            moves: Vec::new(),
        }
    }

    /// Builds a board from the platform's initial position (`"startpos"` or a FEN).
    pub fn from_initial(initial: Option<&str>) -> Result<Self, BoardError> {
        match initial.map(str::trim) {
            None | Some("") | Some("startpos") => Ok(Self::new()),
            Some(fen_str) => {
                let invalid = |reason: String| BoardError::InvalidFen {
                    fen: fen_str.to_string(),
                    reason,
                };
                let fen: Fen = fen_str.parse().map_err(|e| invalid(format!("{e}")))?;
                let position: Chess = fen
                    .into_position(CastlingMode::Standard)
                    .map_err(|e| invalid(format!("{e}")))?;
                Ok(Self {
                    initial_fen: Some(fen_str.to_string()),
                    position,
                    moves: Vec::new(),
                })
            }
        }
    }

    /// Applies the moves of a space separated UCI list beyond those already applied.
    pub fn sync(&mut self, move_list: &str) -> Result<SyncOutcome, BoardError> {
        let incoming: Vec<&str> = move_list.split_whitespace().collect();
        if incoming.len() < self.moves.len() {
            return Ok(SyncOutcome::Stale);
        }
        let fresh = &incoming[self.moves.len()..];
        for uci in fresh {
            self.push_uci(uci)?;
        }
        Ok(if fresh.is_empty() {
            SyncOutcome::Unchanged
        } else {
            SyncOutcome::Advanced(fresh.len())
        })
    }

    pub fn push_uci(&mut self, uci: &str) -> Result<(), BoardError> {
        let illegal = || BoardError::IllegalMove {
            index: self.moves.len(),
            uci: uci.to_string(),
        };
        let m = self.parse_uci(uci).ok_or_else(illegal)?;
        let normalized = self.move_to_uci(&m);
        self.position.play_unchecked(&m);
        self.moves.push(normalized);
        Ok(())
    }

    /// Resolves a UCI string to a legal move in the current position.
    ///
    /// Accepts both the standard king-two-squares and the king-takes-rook
    /// castling notation.
    pub fn parse_uci(&self, uci: &str) -> Option<Move> {
        let parsed: UciMove = uci.parse().ok()?;
        if let Ok(m) = parsed.to_move(&self.position) {
            return Some(m);
        }
        self.position.legal_moves().into_iter().find(|m| {
            UciMove::from_move(m, CastlingMode::Standard).to_string() == uci
                || UciMove::from_move(m, CastlingMode::Chess960).to_string() == uci
        })
    }

    pub fn move_to_uci(&self, m: &Move) -> String {
        UciMove::from_move(m, CastlingMode::Standard).to_string()
    }

    pub fn position(&self) -> &Chess {
        &self.position
    }

    pub fn moves(&self) -> &[String] {
        &self.moves
    }

    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    pub fn turn(&self) -> Color {
        self.position.turn()
    }

    pub fn fullmove_number(&self) -> u32 {
        self.position.fullmoves().get()
    }

    pub fn legal_moves(&self) -> Vec<Move> {
        self.position.legal_moves().into_iter().collect()
    }

    pub fn legal_move_count(&self) -> usize {
        self.position.legal_moves().len()
    }

    pub fn piece_count(&self) -> usize {
        self.position.board().occupied().count()
    }

    pub fn is_game_over(&self) -> bool {
        self.position.is_game_over()
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string()
    }

    /// The `position` command for a UCI engine.
    pub fn uci_position_command(&self) -> String {
        let mut cmd = match &self.initial_fen {
            None => "position startpos".to_string(),
            Some(fen) => format!("position fen {fen}"),
        };
        if !self.moves.is_empty() {
            cmd.push_str(" moves ");
            cmd.push_str(&self.moves.join(" "));
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_applies_only_new_moves() {
        let mut board = BoardState::new();
        assert_eq!(board.sync("e2e4 e7e5").unwrap(), SyncOutcome::Advanced(2));
        assert_eq!(board.sync("e2e4 e7e5").unwrap(), SyncOutcome::Unchanged);
        assert_eq!(board.sync("e2e4 e7e5 g1f3").unwrap(), SyncOutcome::Advanced(1));
        assert_eq!(board.move_count(), 3);
        assert_eq!(board.turn(), Color::Black);
        assert_eq!(board.fullmove_number(), 2);
    }

    #[test]
    fn shorter_update_is_stale_and_ignored() {
        let mut board = BoardState::new();
        board.sync("d2d4 d7d5 c2c4").unwrap();
        assert_eq!(board.sync("d2d4").unwrap(), SyncOutcome::Stale);
        assert_eq!(board.move_count(), 3);
    }

    #[test]
    fn illegal_move_is_reported_with_index() {
        let mut board = BoardState::new();
        let err = board.sync("e2e4 e2e4").unwrap_err();
        assert!(matches!(err, BoardError::IllegalMove { index: 1, .. }));
        assert_eq!(board.move_count(), 1);
    }

    #[test]
    fn accepts_both_castling_notations() {
        let fen = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1";
        let board = BoardState::from_initial(Some(fen)).unwrap();
        let short = board.parse_uci("e1g1").unwrap();
        let rook = board.parse_uci("e1h1").unwrap();
        assert_eq!(short, rook);
        assert_eq!(board.move_to_uci(&rook), "e1g1");
    }

    #[test]
    fn position_command_includes_initial_fen_and_moves() {
        let mut board = BoardState::new();
        assert_eq!(board.uci_position_command(), "position startpos");
        board.sync("e2e4").unwrap();
        assert_eq!(board.uci_position_command(), "position startpos moves e2e4");

        let fen = "8/8/8/4k3/8/8/4P3/4K3 w - - 0 1";
        let mut endgame = BoardState::from_initial(Some(fen)).unwrap();
        endgame.sync("e2e4").unwrap();
        assert_eq!(
            endgame.uci_position_command(),
            format!("position fen {fen} moves e2e4")
        );
        assert_eq!(endgame.piece_count(), 3);
    }

    #[test]
    fn startpos_aliases_build_standard_board() {
        for initial in [None, Some("startpos"), Some("")] {
            let board = BoardState::from_initial(initial).unwrap();
            assert_eq!(board.legal_move_count(), 20);
            assert_eq!(board.uci_position_command(), "position startpos");
        }
        assert!(BoardState::from_initial(Some("not a fen")).is_err());
    }
}
