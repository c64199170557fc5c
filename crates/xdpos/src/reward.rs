//! Checkpoint reward distribution for the V1 signing subsystem.
//!
//! At every checkpoint block `N` (N % epoch == 0, N >= 2*epoch) the engine
//! scans the signing transactions of the previous window, counts how often
//! each masternode signed, and splits the epoch reward 90/10 between
//! masternode owners and the foundation wallet. Integer arithmetic order
//! (divide, then multiply) is load-bearing: it must reproduce the network's
//! historical balances wei for wei.

use crate::{
    chain::{ChainReader, StateDb},
    config::XDPoSConfig,
    contracts::{self, get_candidate_owner},
    errors::{XDPoSError, XDPoSResult},
    extra_data::{EXTRA_SEAL, EXTRA_VANITY},
};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use xdc_primitives::XdcHeader;

/// Share of each signer's reward paid to the masternode owner.
pub const REWARD_MASTER_PERCENT: u64 = 90;

/// Share of each signer's reward paid to delegated voters. Zero on the
/// current network; the code path is kept live.
pub const REWARD_VOTER_PERCENT: u64 = 0;

/// Share of each signer's reward accumulated for the foundation wallet.
pub const REWARD_FOUNDATION_PERCENT: u64 = 10;

/// One native unit in wei.
fn wei_per_unit() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

/// Per-signer outcome of a checkpoint distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerReward {
    /// Blocks this signer signed within the reward window.
    pub sign_count: u64,
    /// The signer's gross share of the epoch reward.
    pub reward: U256,
    /// The owner account the 90% share was credited to.
    pub owner: Address,
}

/// The full outcome of one checkpoint distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardResult {
    /// Per-signer breakdown.
    pub signers: HashMap<Address, SignerReward>,
    /// Unique sign events across the epoch.
    pub total_sign_count: u64,
    /// Wei credited across owners and foundation.
    pub total_distributed: U256,
    /// Wei credited to the foundation wallet.
    pub foundation_reward: U256,
}

/// Computes and applies checkpoint rewards.
#[derive(Debug, Clone)]
pub struct RewardEngine {
    config: XDPoSConfig,
}

impl RewardEngine {
    /// Create a reward engine for `config`.
    pub fn new(config: XDPoSConfig) -> Self {
        Self { config }
    }

    /// The configuration this engine distributes under.
    pub fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    /// Apply checkpoint rewards for `header`.
    ///
    /// A no-op returning an empty result unless `header.number` is a
    /// checkpoint at least two epochs in. Errors never invalidate the block;
    /// callers log and continue.
    pub fn apply_rewards(
        &self,
        chain: &dyn ChainReader,
        state: &mut dyn StateDb,
        parent_state: &dyn StateDb,
        header: &XdcHeader,
    ) -> XDPoSResult<RewardResult> {
        let number = header.number;
        let epoch = self.config.epoch;

        if number % epoch != 0 || number < 2 * epoch {
            return Ok(RewardResult::default());
        }

        let (sign_counts, total_sign_count) = self.scan_sign_counts(chain, number)?;
        if total_sign_count == 0 {
            debug!(target: "xdpos::reward", block = number, "no signing transactions in epoch");
            return Ok(RewardResult::default());
        }

        Ok(self.allocate(state, parent_state, &sign_counts, total_sign_count))
    }

    /// Count unique signatures per masternode over the reward window.
    ///
    /// For checkpoint `N`, signing transactions in blocks
    /// `(N - 2*epoch + 1)..=(N - 1)` reference the reward-epoch blocks
    /// `(N - 2*epoch + 1)..=(N - epoch)` via the block hash in their
    /// payload.
    pub fn scan_sign_counts(
        &self,
        chain: &dyn ChainReader,
        checkpoint: u64,
    ) -> XDPoSResult<(HashMap<Address, u64>, u64)> {
        let epoch = self.config.epoch;
        let prev_checkpoint = checkpoint - 2 * epoch;
        let start = prev_checkpoint + 1;
        let end = start + epoch - 1;
        let scan_end = checkpoint - 1;

        let masternodes: HashSet<Address> =
            self.masternodes_at_checkpoint(chain, prev_checkpoint)?.into_iter().collect();

        // Pass 1: who signed which block hash.
        let mut signers_by_hash: HashMap<B256, Vec<Address>> = HashMap::new();
        for block_number in start..=scan_end {
            let block_header =
                chain.get_header_by_number(block_number).ok_or(XDPoSError::UnknownBlock)?;
            let block = chain
                .get_block(block_header.hash_slow(), block_number)
                .ok_or(XDPoSError::UnknownBlock)?;

            for tx in &block.transactions {
                if !contracts::is_signing_tx(tx.to, &tx.input) {
                    continue;
                }
                if let Some(signed_hash) = contracts::signed_block_hash(&tx.input) {
                    signers_by_hash.entry(signed_hash).or_default().push(tx.from);
                }
            }
        }

        // Pass 2: unique masternode signers per reward-epoch block.
        let mut sign_counts: HashMap<Address, u64> = HashMap::new();
        let mut total_sign_count = 0u64;
        for block_number in start..=end {
            let block_header =
                chain.get_header_by_number(block_number).ok_or(XDPoSError::UnknownBlock)?;
            let hash = block_header.hash_slow();

            let Some(signers) = signers_by_hash.get(&hash) else { continue };
            let unique: HashSet<Address> =
                signers.iter().copied().filter(|s| masternodes.contains(s)).collect();

            for signer in unique {
                *sign_counts.entry(signer).or_insert(0) += 1;
                total_sign_count += 1;
            }
        }

        Ok((sign_counts, total_sign_count))
    }

    /// Split the epoch reward across signers and credit balances.
    ///
    /// `reward / total * count` with integer division first; the remainder
    /// wei stay undistributed, matching the network's historical rounding.
    pub fn allocate(
        &self,
        state: &mut dyn StateDb,
        parent_state: &dyn StateDb,
        sign_counts: &HashMap<Address, u64>,
        total_sign_count: u64,
    ) -> RewardResult {
        let chain_reward = U256::from(self.config.reward) * wei_per_unit();
        let reward_per_sign = chain_reward / U256::from(total_sign_count);

        let mut result = RewardResult::default();

        for (&signer, &sign_count) in sign_counts {
            let calc_reward = reward_per_sign * U256::from(sign_count);

            let mut owner = get_candidate_owner(parent_state, signer);
            if owner == Address::ZERO {
                owner = signer;
            }

            let owner_reward = calc_reward * U256::from(REWARD_MASTER_PERCENT) / U256::from(100);
            let voter_reward = calc_reward * U256::from(REWARD_VOTER_PERCENT) / U256::from(100);
            // The foundation share accumulates per signer; summing first and
            // taking 10% of the total rounds differently.
            let foundation_cut =
                calc_reward * U256::from(REWARD_FOUNDATION_PERCENT) / U256::from(100);

            state.add_balance(owner, owner_reward);
            self.distribute_voter_rewards(state, parent_state, signer, voter_reward);

            result.foundation_reward += foundation_cut;
            result.total_distributed += owner_reward + voter_reward;
            result
                .signers
                .insert(signer, SignerReward { sign_count, reward: calc_reward, owner });
        }

        if result.foundation_reward > U256::ZERO {
            state.add_balance(self.config.foundation_wallet, result.foundation_reward);
            result.total_distributed += result.foundation_reward;
        }
        result.total_sign_count = total_sign_count;

        debug!(
            target: "xdpos::reward",
            signers = result.signers.len(),
            total = %result.total_distributed,
            foundation = %result.foundation_reward,
            "checkpoint rewards distributed"
        );
        result
    }

    /// Split a candidate's voter share pro rata by delegated stake. The
    /// voter percentage is zero on the current network, so this usually
    /// credits nothing.
    fn distribute_voter_rewards(
        &self,
        state: &mut dyn StateDb,
        parent_state: &dyn StateDb,
        candidate: Address,
        voter_reward: U256,
    ) {
        if voter_reward.is_zero() {
            return;
        }

        let voters = contracts::get_voters(parent_state, candidate);
        let total_cap: U256 = voters
            .iter()
            .map(|&v| contracts::get_voter_cap(parent_state, candidate, v))
            .sum();
        if total_cap.is_zero() {
            warn!(target: "xdpos::reward", %candidate, "voter reward with no delegated stake");
            return;
        }

        for voter in voters {
            let cap = contracts::get_voter_cap(parent_state, candidate, voter);
            state.add_balance(voter, voter_reward * cap / total_cap);
        }
    }

    /// The masternode set that governed the reward epoch, decoded from the
    /// checkpoint header's legacy extra framing (genesis included).
    fn masternodes_at_checkpoint(
        &self,
        chain: &dyn ChainReader,
        checkpoint: u64,
    ) -> XDPoSResult<Vec<Address>> {
        let header = chain.get_header_by_number(checkpoint).ok_or(XDPoSError::UnknownBlock)?;
        let extra = &header.extra_data;
        if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(XDPoSError::MissingVanity);
        }

        let middle = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
        if middle.len() % Address::len_bytes() != 0 {
            return Err(XDPoSError::InvalidCheckpointSigners);
        }
        Ok(middle.chunks_exact(Address::len_bytes()).map(Address::from_slice).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    /// State stub tracking balances and candidate owners.
    #[derive(Default)]
    pub(crate) struct StubState {
        pub balances: HashMap<Address, U256>,
        pub slots: RwLock<HashMap<(Address, B256), B256>>,
    }

    impl StateDb for StubState {
        fn get_state(&self, addr: Address, key: B256) -> B256 {
            self.slots.read().get(&(addr, key)).copied().unwrap_or_default()
        }

        fn add_balance(&mut self, addr: Address, amount: U256) {
            *self.balances.entry(addr).or_default() += amount;
        }

        fn intermediate_root(&mut self, _delete_empty_objects: bool) -> B256 {
            B256::ZERO
        }
    }

    fn engine(reward: u64) -> RewardEngine {
        RewardEngine::new(XDPoSConfig {
            reward,
            foundation_wallet: Address::with_last_byte(0xFF),
            ..Default::default()
        })
    }

    #[test]
    fn golden_vector_reward_5000_four_signers() {
        // Reward 5000 units, epoch 900, sign counts {300, 300, 150, 150}.
        let engine = engine(5000);
        let mut state = StubState::default();
        let parent_state = StubState::default();

        let signers: Vec<Address> = (1..=4).map(Address::with_last_byte).collect();
        let mut counts = HashMap::new();
        counts.insert(signers[0], 300);
        counts.insert(signers[1], 300);
        counts.insert(signers[2], 150);
        counts.insert(signers[3], 150);

        let result = engine.allocate(&mut state, &parent_state, &counts, 900);

        // chain_reward / 900 truncates: 5000e18 / 900 = 5555555555555555555.
        let per_sign = U256::from(5_555_555_555_555_555_555u64);
        let calc_300 = per_sign * U256::from(300u64);
        let calc_150 = per_sign * U256::from(150u64);

        assert_eq!(result.signers[&signers[0]].reward, calc_300);
        assert_eq!(result.signers[&signers[2]].reward, calc_150);

        // Per-signer 90/10 split, wei exact.
        let owner_300 = calc_300 * U256::from(90u64) / U256::from(100u64);
        let owner_150 = calc_150 * U256::from(90u64) / U256::from(100u64);
        let foundation_300 = calc_300 * U256::from(10u64) / U256::from(100u64);
        let foundation_150 = calc_150 * U256::from(10u64) / U256::from(100u64);

        assert_eq!(state.balances[&signers[0]], owner_300);
        assert_eq!(state.balances[&signers[1]], owner_300);
        assert_eq!(state.balances[&signers[2]], owner_150);
        assert_eq!(state.balances[&signers[3]], owner_150);

        let foundation_total = (foundation_300 + foundation_150) * U256::from(2u64);
        assert_eq!(result.foundation_reward, foundation_total);
        assert_eq!(state.balances[&Address::with_last_byte(0xFF)], foundation_total);

        // Every distributed wei is accounted for.
        let expected_total =
            (owner_300 + owner_150) * U256::from(2u64) + foundation_total;
        assert_eq!(result.total_distributed, expected_total);
        assert_eq!(result.total_sign_count, 900);

        // The split never exceeds the configured epoch reward.
        let chain_reward = U256::from(5000u64) * wei_per_unit();
        assert!(result.total_distributed <= chain_reward);
    }

    #[test]
    fn owner_fallback_when_unregistered() {
        let engine = engine(900);
        let mut state = StubState::default();
        let parent_state = StubState::default();

        let signer = Address::with_last_byte(1);
        let mut counts = HashMap::new();
        counts.insert(signer, 9);

        let result = engine.allocate(&mut state, &parent_state, &counts, 9);

        // Owner slot is zero, so the signer itself is credited.
        assert_eq!(result.signers[&signer].owner, signer);
        assert!(state.balances.contains_key(&signer));
    }

    #[test]
    fn division_order_is_divide_then_multiply() {
        // 100e18 / 3 * 3 != 100e18; the truncated remainder stays put.
        let engine = engine(100);
        let mut state = StubState::default();
        let parent_state = StubState::default();

        let signer = Address::with_last_byte(1);
        let mut counts = HashMap::new();
        counts.insert(signer, 3);

        let result = engine.allocate(&mut state, &parent_state, &counts, 3);
        let per_sign = U256::from(100u64) * wei_per_unit() / U256::from(3u64);
        assert_eq!(result.signers[&signer].reward, per_sign * U256::from(3u64));
        assert!(result.signers[&signer].reward < U256::from(100u64) * wei_per_unit());
    }
}
