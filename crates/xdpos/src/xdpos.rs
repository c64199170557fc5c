//! The XDPoS consensus facade.
//!
//! Thin integration layer over the two consensus versions: V1 (epoch PoA
//! with checkpoint rewards) below the switch block, V2 (HotStuff-style BFT)
//! above it. Holds the caches and stores shared by both, and routes every
//! operation to the right version by block number.

use crate::{
    chain::{ChainReader, SignFn, SnapshotDb},
    config::XDPoSConfig,
    constants::{ALLOWED_FUTURE_BLOCK_TIME_SECS, INMEMORY_SIGNATURES},
    errors::{XDPoSError, XDPoSResult},
    extra_data::{recover_v1_signer, recover_v2_signer},
    hooks::{PenaltyHook, RewardHook, SigningRewardHook},
    reward::{RewardEngine, RewardResult},
    snapshot::{Snapshot, SnapshotStore},
    v1,
    v2::{
        BlockInfo, BroadcastMessage, QuorumCert, Round, SyncInfo, Timeout, TimeoutCert, Vote,
        XDPoSV2Engine,
    },
};
use alloy_primitives::{Address, B256};
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xdc_primitives::{Transaction, XdcBlock, XdcHeader, EMPTY_OMMER_ROOT_HASH};

/// The chain handle shared with the V2 engine's countdown timer.
pub type SharedChain = Arc<dyn ChainReader>;

/// XDPoS consensus engine.
pub struct XDPoSConsensus {
    config: XDPoSConfig,
    snapshots: Arc<SnapshotStore>,
    /// Header hash -> recovered block producer.
    header_signers: Mutex<LruCache<B256, Address>>,
    v2_engine: Option<Arc<XDPoSV2Engine>>,
    reward_hook: Arc<dyn RewardHook>,
}

impl std::fmt::Debug for XDPoSConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XDPoSConsensus")
            .field("config", &self.config)
            .field("has_v2", &self.v2_engine.is_some())
            .finish()
    }
}

impl XDPoSConsensus {
    /// Create the engine with the default signing-reward hook and no
    /// penalty hook.
    pub fn new(config: XDPoSConfig, db: Arc<dyn SnapshotDb>) -> XDPoSResult<Arc<Self>> {
        Self::with_hooks(config, db, None, None)
    }

    /// Create the engine with explicit policy hooks.
    pub fn with_hooks(
        config: XDPoSConfig,
        db: Arc<dyn SnapshotDb>,
        reward_hook: Option<Arc<dyn RewardHook>>,
        penalty_hook: Option<Arc<dyn PenaltyHook>>,
    ) -> XDPoSResult<Arc<Self>> {
        let config = config.validate()?;
        let snapshots = Arc::new(SnapshotStore::new(config.epoch, config.gap, db));

        let v2_engine = match config.v2.as_ref() {
            Some(_) => Some(XDPoSV2Engine::new(
                config.clone(),
                Arc::clone(&snapshots),
                penalty_hook,
            )?),
            None => None,
        };

        let reward_hook = reward_hook.unwrap_or_else(|| {
            Arc::new(SigningRewardHook::new(RewardEngine::new(config.clone())))
        });

        info!(
            target: "xdpos",
            epoch = config.epoch,
            gap = config.gap,
            v2 = v2_engine.is_some(),
            "initialized XDPoS consensus engine"
        );

        Ok(Arc::new(Self {
            config,
            snapshots,
            header_signers: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SIGNATURES).expect("cache size is non-zero"),
            )),
            v2_engine,
            reward_hook,
        }))
    }

    /// The consensus configuration.
    pub fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    /// Whether `block_number` runs V2 consensus.
    pub fn is_v2_block(&self, block_number: u64) -> bool {
        self.config.is_v2(block_number)
    }

    /// The V2 engine, when configured.
    pub fn v2_engine(&self) -> Option<&Arc<XDPoSV2Engine>> {
        self.v2_engine.as_ref()
    }

    fn require_v2(&self) -> XDPoSResult<&Arc<XDPoSV2Engine>> {
        self.v2_engine
            .as_ref()
            .ok_or_else(|| XDPoSError::InvalidConfig("V2 consensus is not configured".into()))
    }

    /// Initialize BFT state from the chain head. A no-op on chains that
    /// have not reached the switch block.
    pub fn initial(&self, chain: &SharedChain, head: &XdcHeader) -> XDPoSResult<()> {
        let Some(engine) = self.v2_engine.as_ref() else { return Ok(()) };
        let switch_block = self.config.v2_switch_block().unwrap_or(u64::MAX);
        if head.number < switch_block {
            debug!(target: "xdpos", head = head.number, "head below switch block; V2 stays idle");
            return Ok(());
        }
        engine.initial(chain, head)
    }

    /// Install the signing account for proposing, voting and timeouts.
    pub fn authorize(&self, address: Address, sign_fn: SignFn) -> XDPoSResult<()> {
        self.require_v2()?.authorize(address, sign_fn);
        Ok(())
    }

    /// Whether `signer` may propose on top of `parent` right now.
    pub fn your_turn(
        &self,
        chain: &SharedChain,
        parent: &XdcHeader,
        signer: Address,
    ) -> XDPoSResult<bool> {
        if !self.is_v2_block(parent.number + 1) {
            // V1 mining is history; this node only produces V2 blocks.
            return Ok(false);
        }
        self.require_v2()?.your_turn(chain, parent, signer)
    }

    /// Fill the consensus fields of a header under construction.
    pub fn prepare(&self, chain: &SharedChain, header: &mut XdcHeader) -> XDPoSResult<()> {
        self.require_v2()?.prepare(chain, header)
    }

    /// Finalize the block: run the reward hook at checkpoints, settle the
    /// state root and assemble the block.
    pub fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut XdcHeader,
        state: &mut dyn crate::chain::StateDb,
        parent_state: &dyn crate::chain::StateDb,
        transactions: Vec<Transaction>,
    ) -> XDPoSResult<XdcBlock> {
        if header.number % self.config.reward_checkpoint == 0 && header.number > 0 {
            match self.reward_hook.apply(chain, state, parent_state, header) {
                Ok(result) => self.log_reward_result(header.number, &result),
                // Reward failures never invalidate the block.
                Err(err) => {
                    warn!(target: "xdpos", block = header.number, %err, "reward hook failed")
                }
            }
        }

        header.state_root = state.intermediate_root(true);
        header.ommers_hash = EMPTY_OMMER_ROOT_HASH;
        Ok(XdcBlock::new(header.clone(), transactions))
    }

    fn log_reward_result(&self, number: u64, result: &RewardResult) {
        if result.signers.is_empty() {
            return;
        }
        // Human-inspectable record of what the checkpoint paid out.
        match serde_json::to_string(result) {
            Ok(json) => debug!(target: "xdpos", block = number, rewards = %json, "epoch rewards"),
            Err(err) => warn!(target: "xdpos", block = number, %err, "reward result not serializable"),
        }
    }

    /// Sign the header seal.
    pub fn seal(&self, header: &mut XdcHeader) -> XDPoSResult<()> {
        self.require_v2()?.seal(header)
    }

    /// The account that produced `header`.
    pub fn author(&self, header: &XdcHeader) -> XDPoSResult<Address> {
        let hash = header.hash_slow();
        if let Some(signer) = self.header_signers.lock().get(&hash) {
            return Ok(*signer);
        }

        let signer = if self.is_v2_block(header.number) {
            recover_v2_signer(header)?
        } else {
            recover_v1_signer(header)?
        };
        self.header_signers.lock().put(hash, signer);
        Ok(signer)
    }

    /// Verify a single header. `full_verify` includes certificate signature
    /// checks on V2 headers.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        if self.is_v2_block(header.number) {
            return self.require_v2()?.verify_header(chain, header, full_verify);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if header.timestamp > now + ALLOWED_FUTURE_BLOCK_TIME_SECS {
            return Err(XDPoSError::FutureBlock);
        }
        let parent = chain.get_header_by_hash(header.parent_hash);
        v1::validate_v1_header(header, &self.config, parent.as_ref())
    }

    /// Verify a batch of headers in parallel, one result per header in
    /// order.
    pub fn verify_headers(
        &self,
        chain: &dyn ChainReader,
        headers: &[XdcHeader],
        full_verify: bool,
    ) -> Vec<XDPoSResult<()>> {
        headers
            .par_iter()
            .map(|header| self.verify_header(chain, header, full_verify))
            .collect()
    }

    /// XDPoS forbids ommers outright.
    pub fn verify_uncles(&self, block: &XdcBlock) -> XDPoSResult<()> {
        if block.header.ommers_hash != EMPTY_OMMER_ROOT_HASH {
            return Err(XDPoSError::InvalidUncleHash);
        }
        Ok(())
    }

    /// Wire-level vote verification (pre-lock).
    pub fn verify_vote_message(
        &self,
        chain: &dyn ChainReader,
        vote: &mut Vote,
    ) -> XDPoSResult<bool> {
        self.require_v2()?.verify_vote_message(chain, vote)
    }

    /// Pool a verified vote; may mint a QC.
    pub fn vote_handler(&self, chain: &SharedChain, vote: Vote) -> XDPoSResult<()> {
        self.require_v2()?.vote_handler(chain, vote)
    }

    /// Wire-level timeout verification (pre-lock).
    pub fn verify_timeout_message(
        &self,
        chain: &dyn ChainReader,
        timeout: &mut Timeout,
    ) -> XDPoSResult<bool> {
        self.require_v2()?.verify_timeout_message(chain, timeout)
    }

    /// Pool a verified timeout; may mint a TC.
    pub fn timeout_handler(&self, chain: &SharedChain, timeout: Timeout) -> XDPoSResult<()> {
        self.require_v2()?.timeout_handler(chain, timeout)
    }

    /// Verify an incoming sync-info message.
    pub fn verify_sync_info_message(
        &self,
        chain: &dyn ChainReader,
        sync_info: &SyncInfo,
    ) -> XDPoSResult<bool> {
        self.require_v2()?.verify_sync_info_message(chain, sync_info)
    }

    /// Absorb a verified sync-info message.
    pub fn sync_info_handler(&self, chain: &SharedChain, sync_info: &SyncInfo) -> XDPoSResult<()> {
        self.require_v2()?.sync_info_handler(chain, sync_info)
    }

    /// Handle a freshly proposed block: absorb its QC and vote when safe.
    pub fn proposed_block_handler(
        &self,
        chain: &SharedChain,
        header: &XdcHeader,
    ) -> XDPoSResult<()> {
        self.require_v2()?.proposed_block_handler(chain, header)
    }

    /// The snapshot governing block `number`.
    pub fn get_snapshot(
        &self,
        chain: &dyn ChainReader,
        number: u64,
    ) -> XDPoSResult<Arc<Snapshot>> {
        self.snapshots.snapshot_for_number(chain, number)
    }

    /// The masternode set governing `header`.
    pub fn get_masternodes(
        &self,
        chain: &dyn ChainReader,
        header: &XdcHeader,
    ) -> XDPoSResult<Vec<Address>> {
        if self.is_v2_block(header.number) {
            let engine = self.require_v2()?;
            let info = engine.epochs.get_epoch_switch_info(chain, Some(header), header.hash_slow())?;
            return Ok(info.masternodes.clone());
        }

        // V1: signers listed at the governing checkpoint.
        let checkpoint = header.number - header.number % self.config.epoch;
        let checkpoint_header =
            chain.get_header_by_number(checkpoint).ok_or(XDPoSError::UnknownBlock)?;
        v1::extract_checkpoint_signers(&checkpoint_header.extra_data)
    }

    /// The masternode set governing the block at `hash`.
    pub fn get_masternodes_by_hash(
        &self,
        chain: &dyn ChainReader,
        hash: B256,
    ) -> XDPoSResult<Vec<Address>> {
        let header = chain.get_header_by_hash(hash).ok_or(XDPoSError::UnknownBlock)?;
        self.get_masternodes(chain, &header)
    }

    /// The epoch-switch block of epoch `epoch_number`, located by binary
    /// search over the chain.
    pub fn get_block_by_epoch_number(
        &self,
        chain: &dyn ChainReader,
        epoch_number: u64,
    ) -> XDPoSResult<BlockInfo> {
        self.require_v2()?.epochs.get_block_by_epoch_number(chain, epoch_number)
    }

    /// The round the node currently participates in.
    pub fn get_current_round(&self) -> XDPoSResult<Round> {
        Ok(self.require_v2()?.current_round())
    }

    /// The highest QC seen.
    pub fn get_highest_quorum_cert(&self) -> XDPoSResult<QuorumCert> {
        Ok(self.require_v2()?.highest_quorum_cert())
    }

    /// The highest TC seen.
    pub fn get_highest_timeout_cert(&self) -> XDPoSResult<TimeoutCert> {
        Ok(self.require_v2()?.highest_timeout_cert())
    }

    /// The deepest block known to be finalized.
    pub fn get_latest_committed_block_info(&self) -> XDPoSResult<Option<BlockInfo>> {
        Ok(self.require_v2()?.highest_commit_block())
    }

    /// Freeze the next epoch's candidate set at a gap block.
    pub fn update_masternodes(
        &self,
        header: &XdcHeader,
        candidates: Vec<Address>,
    ) -> XDPoSResult<()> {
        let epoch = self.config.epoch;
        let gap = self.config.gap;
        if header.number != 0 && header.number % epoch != epoch - gap {
            return Err(XDPoSError::Custom(format!(
                "block {} is not a gap block (epoch {epoch}, gap {gap})",
                header.number
            )));
        }

        info!(
            target: "xdpos",
            number = header.number,
            candidates = candidates.len(),
            "updating masternode snapshot at gap block"
        );
        self.snapshots.store(Snapshot::new(header.number, header.hash_slow(), candidates))
    }

    /// Take the outbound message receiver (single consumer).
    pub fn broadcast_receiver(&self) -> Option<mpsc::UnboundedReceiver<BroadcastMessage>> {
        self.v2_engine.as_ref().and_then(|engine| engine.broadcast_receiver())
    }

    /// Take the best-effort new-round notification receiver.
    pub fn new_round_receiver(&self) -> Option<mpsc::Receiver<Round>> {
        self.v2_engine.as_ref().and_then(|engine| engine.new_round_receiver())
    }

    /// Stop background machinery (the countdown timer).
    pub fn shutdown(&self) {
        if let Some(engine) = self.v2_engine.as_ref() {
            engine.shutdown();
        }
    }
}
