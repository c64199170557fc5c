//! Policy injection points selected at engine construction.

use crate::{
    chain::{ChainReader, StateDb},
    errors::XDPoSResult,
    reward::{RewardEngine, RewardResult},
    v2::Round,
};
use alloy_primitives::Address;
use xdc_primitives::XdcHeader;

/// Computes the penalty list applied when electing an epoch's masternodes.
pub trait PenaltyHook: Send + Sync {
    /// Candidates to exclude from the epoch starting at block `number` /
    /// round `round`.
    fn penalties(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        round: Round,
        candidates: &[Address],
    ) -> XDPoSResult<Vec<Address>>;
}

/// Computes and credits the epoch reward during `Finalize`.
pub trait RewardHook: Send + Sync {
    /// Apply rewards for `header`, crediting `state` and reading owner
    /// registrations from `parent_state`.
    fn apply(
        &self,
        chain: &dyn ChainReader,
        state: &mut dyn StateDb,
        parent_state: &dyn StateDb,
        header: &XdcHeader,
    ) -> XDPoSResult<RewardResult>;
}

/// The production reward hook: signing-transaction counting with the 90/10
/// owner/foundation split.
#[derive(Debug, Clone)]
pub struct SigningRewardHook {
    engine: RewardEngine,
}

impl SigningRewardHook {
    /// Build the hook around a reward engine.
    pub fn new(engine: RewardEngine) -> Self {
        Self { engine }
    }
}

impl RewardHook for SigningRewardHook {
    fn apply(
        &self,
        chain: &dyn ChainReader,
        state: &mut dyn StateDb,
        parent_state: &dyn StateDb,
        header: &XdcHeader,
    ) -> XDPoSResult<RewardResult> {
        self.engine.apply_rewards(chain, state, parent_state, header)
    }
}
