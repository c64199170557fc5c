//! XDPoS consensus engine for the XDC Network.
//!
//! Two consensus versions share one engine:
//! - **V1** (below the configured switch block): epoch-based PoA where
//!   signers rotate by block number and checkpoint blocks distribute the
//!   epoch reward from counted signing transactions.
//! - **V2** (above the switch block): a HotStuff-style pipelined BFT state
//!   machine with rounds, quorum/timeout certificates, a 3-chain commit
//!   rule and exponential-backoff round timeouts.
//!
//! ## Architecture
//!
//! - [`XDPoSConsensus`] — the facade routing every operation by version
//! - [`XDPoSV2Engine`] — the BFT state machine (votes, timeouts, QC/TC,
//!   round progression)
//! - [`SnapshotStore`] — masternode candidate sets frozen at gap blocks
//! - [`RewardEngine`] — wei-exact checkpoint reward distribution
//! - [`chain`] — the boundary traits the node embeds the engine through

mod config;
mod errors;
mod extra_data;
mod reward;
mod snapshot;
mod xdpos;

pub mod chain;
pub mod contracts;
pub mod hooks;
pub mod v1;
pub mod v2;

#[cfg(test)]
pub(crate) mod tests;

pub use chain::{ChainReader, MemoryDb, SignFn, SnapshotDb, StateDb};
pub use config::{V2Config, XDPoSConfig};
pub use errors::{XDPoSError, XDPoSResult};
pub use extra_data::{
    address_of_secret, ecrecover, hash_without_seal, recover_v1_signer, recover_v2_signer,
    sign_hash, signing_hash, unique_signatures, V1ExtraData,
};
pub use reward::{RewardEngine, RewardResult, SignerReward};
pub use snapshot::{Snapshot, SnapshotStore};
pub use xdpos::{SharedChain, XDPoSConsensus};

pub use v2::{
    BlockInfo, BroadcastMessage, EpochSwitchInfo, QuorumCert, Round, Signature, SyncInfo,
    Timeout, TimeoutCert, Vote, XDPoSV2Engine,
};

/// Tuning constants shared across the engine.
pub mod constants {
    /// Default epoch length (900 blocks).
    pub const DEFAULT_EPOCH: u64 = 900;

    /// Default block period in seconds.
    pub const DEFAULT_PERIOD: u64 = 2;

    /// Default gap before the epoch boundary (450 blocks).
    pub const DEFAULT_GAP: u64 = 450;

    /// Maximum tolerated clock skew for incoming headers.
    pub const ALLOWED_FUTURE_BLOCK_TIME_SECS: u64 = 15;

    /// Gap-block snapshots kept in memory.
    pub const INMEMORY_SNAPSHOTS: usize = 128;

    /// Recovered signatures kept in memory.
    pub const INMEMORY_SIGNATURES: usize = 4096;

    /// Epoch switch infos kept in memory.
    pub const INMEMORY_EPOCHS: usize = 10;

    /// Round-to-epoch mappings kept in memory.
    pub const INMEMORY_ROUND_TO_EPOCH: usize = 900;

    /// Fully verified headers kept in memory.
    pub const INMEMORY_VERIFIED_HEADERS: usize = 128;

    /// Pool groups older than this many rounds behind the current round are
    /// reaped.
    pub const POOL_HYGIENE_ROUND: u64 = 10;

    /// XDC mainnet chain id.
    pub const XDC_MAINNET_CHAIN_ID: u64 = 50;

    /// XDC Apothem testnet chain id.
    pub const XDC_APOTHEM_CHAIN_ID: u64 = 51;
}
