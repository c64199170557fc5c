//! XDPoS configuration types.

use crate::errors::{XDPoSError, XDPoSResult};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// XDPoS consensus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XDPoSConfig {
    /// Epoch length in blocks (default: 900).
    pub epoch: u64,

    /// Block period in seconds (default: 2).
    pub period: u64,

    /// Gap before epoch switch in blocks (default: 450).
    pub gap: u64,

    /// Epoch reward in native units; multiplied by 10^18 at distribution.
    pub reward: u64,

    /// Reward checkpoint frequency (defaults to `epoch`).
    pub reward_checkpoint: u64,

    /// Foundation wallet address receiving the 10% reward split.
    pub foundation_wallet: Address,

    /// V2 consensus configuration; `None` keeps the chain on V1 forever.
    pub v2: Option<V2Config>,
}

impl Default for XDPoSConfig {
    fn default() -> Self {
        Self {
            epoch: 900,
            period: 2,
            gap: 450,
            reward: 250,
            reward_checkpoint: 900,
            foundation_wallet: Address::ZERO,
            v2: None,
        }
    }
}

impl XDPoSConfig {
    /// Create a new XDPoS config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set epoch length.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self.reward_checkpoint = epoch;
        self
    }

    /// Set block period.
    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    /// Set gap.
    pub fn with_gap(mut self, gap: u64) -> Self {
        self.gap = gap;
        self
    }

    /// Set the per-epoch reward in native units.
    pub fn with_reward(mut self, reward: u64) -> Self {
        self.reward = reward;
        self
    }

    /// Set foundation wallet.
    pub fn with_foundation_wallet(mut self, wallet: Address) -> Self {
        self.foundation_wallet = wallet;
        self
    }

    /// Set V2 config.
    pub fn with_v2(mut self, v2: V2Config) -> Self {
        self.v2 = Some(v2);
        self
    }

    /// Check if V2 is enabled for a given block number.
    pub fn is_v2(&self, block_number: u64) -> bool {
        match &self.v2 {
            Some(v2) => block_number > v2.switch_block,
            None => false,
        }
    }

    /// The V2 switch block (the last V1 block), if configured.
    pub fn v2_switch_block(&self) -> Option<u64> {
        self.v2.as_ref().map(|v2| v2.switch_block)
    }

    /// The gap number for a block at `epoch_switch_number`:
    /// `n - (n mod epoch) - gap`, clamped at zero.
    pub fn gap_number(&self, epoch_switch_number: u64) -> u64 {
        (epoch_switch_number - epoch_switch_number % self.epoch).saturating_sub(self.gap)
    }

    /// Validate the configuration, normalizing the certificate threshold.
    pub fn validate(mut self) -> XDPoSResult<Self> {
        if self.epoch == 0 {
            return Err(XDPoSError::InvalidConfig("epoch must be non-zero".into()));
        }
        if self.gap >= self.epoch {
            return Err(XDPoSError::InvalidConfig("gap must be smaller than epoch".into()));
        }
        if let Some(v2) = self.v2.take() {
            self.v2 = Some(v2.normalize()?);
        }
        Ok(self)
    }
}

/// XDPoS V2 consensus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2Config {
    /// The last V1 block; blocks above it run V2 consensus.
    pub switch_block: u64,

    /// Mining period in seconds (default: 2).
    pub mine_period: u64,

    /// Base timeout period in seconds (default: 10).
    pub timeout_period: u64,

    /// Every this many consecutive timeouts, a `SyncInfo` is broadcast in
    /// addition to the timeout message (default: 3).
    pub timeout_sync_threshold: u64,

    /// Certificate threshold. Accepted either as a fraction in `(0, 1]` or a
    /// percentage in `(1, 100]`; [`V2Config::normalize`] canonicalizes to a
    /// fraction and rejects anything else.
    pub cert_threshold: f64,

    /// Maximum masternodes per epoch (default: 108).
    pub max_masternodes: u64,

    /// Exponential backoff base for the round countdown (default: 1.5).
    pub timeout_exp_base: f64,

    /// Maximum exponent for the round countdown backoff (default: 5).
    pub timeout_max_exponent: u32,
}

impl Default for V2Config {
    fn default() -> Self {
        Self {
            switch_block: 0,
            mine_period: 2,
            timeout_period: 10,
            timeout_sync_threshold: 3,
            cert_threshold: 2.0 / 3.0,
            max_masternodes: 108,
            timeout_exp_base: 1.5,
            timeout_max_exponent: 5,
        }
    }
}

impl V2Config {
    /// Create a new V2 config switching at `switch_block`.
    pub fn new(switch_block: u64) -> Self {
        Self { switch_block, ..Default::default() }
    }

    /// Set mine period.
    pub fn with_mine_period(mut self, period: u64) -> Self {
        self.mine_period = period;
        self
    }

    /// Set timeout period.
    pub fn with_timeout_period(mut self, period: u64) -> Self {
        self.timeout_period = period;
        self
    }

    /// Set the sync-info broadcast threshold.
    pub fn with_timeout_sync_threshold(mut self, threshold: u64) -> Self {
        self.timeout_sync_threshold = threshold;
        self
    }

    /// Set certificate threshold (fraction or percentage, normalized later).
    pub fn with_cert_threshold(mut self, threshold: f64) -> Self {
        self.cert_threshold = threshold;
        self
    }

    /// Set the masternode cap.
    pub fn with_max_masternodes(mut self, max: u64) -> Self {
        self.max_masternodes = max;
        self
    }

    /// Canonicalize `cert_threshold` to a fraction, rejecting ambiguous or
    /// out-of-range values.
    pub fn normalize(mut self) -> XDPoSResult<Self> {
        let t = self.cert_threshold;
        self.cert_threshold = if t > 0.0 && t <= 1.0 {
            t
        } else if t > 1.0 && t <= 100.0 {
            t / 100.0
        } else {
            return Err(XDPoSError::InvalidConfig(format!(
                "cert threshold {t} is neither a fraction in (0, 1] nor a percentage in (1, 100]"
            )));
        };
        if self.timeout_exp_base < 1.0 {
            return Err(XDPoSError::InvalidConfig(format!(
                "timeout backoff base {} must be >= 1.0",
                self.timeout_exp_base
            )));
        }
        Ok(self)
    }

    /// The number of unique masternode signatures required to certify, for a
    /// masternode set of `masternodes_len`.
    pub fn cert_threshold_count(&self, masternodes_len: usize) -> usize {
        (masternodes_len as f64 * self.cert_threshold).ceil() as usize
    }
}
