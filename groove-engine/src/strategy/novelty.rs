//! Novelty detection extension point for adaptive strategies
//!
//! The strategy consumer calls [`NoveltyHook::on_strategy_outcome`] after an
//! outcome has been persisted. Hooks observe; they cannot veto or delay the
//! distribution update. A slow hook is cut off by the consumer's hook
//! timeout and a failing one is only logged.
//!
//! Candidate implementations: change-point detection over outcome streams
//! (CUSUM, ADWIN), or clustering of sessions whose outcomes disagree with the
//! category's current weights.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Learning, SessionId};

use super::learner::SessionContext;
use super::types::{InjectionStrategy, StrategyOutcome};

/// Extension point for future novelty detection
#[async_trait]
pub trait NoveltyHook: Send + Sync {
    /// Called after each strategy outcome is persisted
    async fn on_strategy_outcome(
        &self,
        learning: &Learning,
        context: &SessionContext,
        strategy: &InjectionStrategy,
        outcome: &StrategyOutcome,
    ) -> Result<()>;

    /// Called when a session ends
    async fn on_session_end(&self, session_id: &SessionId) -> Result<()>;
}

/// Default hook: does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNoveltyHook;

#[async_trait]
impl NoveltyHook for NoOpNoveltyHook {
    async fn on_strategy_outcome(
        &self,
        _learning: &Learning,
        _context: &SessionContext,
        _strategy: &InjectionStrategy,
        _outcome: &StrategyOutcome,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_session_end(&self, _session_id: &SessionId) -> Result<()> {
        Ok(())
    }
}
