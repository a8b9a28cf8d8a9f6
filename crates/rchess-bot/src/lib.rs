//! Lichess bot client.
//!
//! Plays several games at once against a shared pool of UCI engines. Each move
//! comes from the opening book, the endgame tablebase, or an engine search, in
//! that order. A separate matchmaking loop challenges other bots.

pub mod board;
pub mod book;
pub mod config;
pub mod decision;
pub mod dispatcher;
pub mod engine;
pub mod engine_pool;
pub mod error;
pub mod lifecycle;
pub mod matchmaking;
pub mod platform;
pub mod registry;
pub mod session;
pub mod tablebase;
pub mod time_budget;

pub use board::BoardState;
pub use config::BotConfig;
pub use decision::{Decision, MoveDecider, MoveDecisionPipeline, MoveSource};
pub use dispatcher::Dispatcher;
pub use engine_pool::EnginePool;
pub use lifecycle::{ExitReason, Lifecycle};
pub use matchmaking::MatchmakingScheduler;
pub use registry::GameRegistry;
pub use session::{GameSession, SessionContext, SessionSettings};
pub use time_budget::{ClockState, TimeBudget};
