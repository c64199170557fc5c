//! The V2 BFT engine: round state, QC/TC processing and the 3-chain commit
//! rule.
//!
//! All mutable BFT state lives in [`V2State`] behind a single `RwLock`;
//! handler entry points take it exclusively, verification before the lock is
//! lock-free. The engine never stores a chain reference: every call receives
//! one, and the countdown timer carries the one handed to its most recent
//! reset.

use crate::{
    chain::{ChainReader, SignFn},
    config::{V2Config, XDPoSConfig},
    constants::{INMEMORY_SIGNATURES, INMEMORY_VERIFIED_HEADERS, POOL_HYGIENE_ROUND},
    errors::{XDPoSError, XDPoSResult},
    hooks::PenaltyHook,
    snapshot::SnapshotStore,
    v2::{
        epoch::EpochSwitchEngine,
        pool::MessagePool,
        timer::ExpCountdown,
        types::decode_extra_fields_v2,
        BlockInfo, BroadcastMessage, QuorumCert, Round, SyncInfo, Timeout, TimeoutCert, Vote,
    },
};
use alloy_primitives::{Address, B256};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{
    num::NonZeroUsize,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use xdc_primitives::XdcHeader;

/// Capacity of the best-effort new-round notification channel.
const NEW_ROUND_CHANNEL_CAPACITY: usize = 256;

/// The chain handle delivered to the countdown timer's callback.
pub type TimerChain = Arc<dyn ChainReader>;

/// The signer installed via `Authorize`.
pub(crate) struct AuthorizedSigner {
    pub(crate) address: Address,
    pub(crate) sign_fn: SignFn,
}

/// Mutable BFT state, guarded by the engine-wide lock.
#[derive(Debug, Clone)]
pub(crate) struct V2State {
    pub(crate) is_initialized: bool,
    /// Round the node currently participates in. Never decreases outside a
    /// full re-initialization.
    pub(crate) current_round: Round,
    /// Highest round this node sealed a block for; equivocation guard.
    pub(crate) highest_self_mined_round: Round,
    /// Highest round this node voted in; double-vote guard.
    pub(crate) highest_voted_round: Round,
    /// Highest QC seen, by proposed round.
    pub(crate) highest_quorum_cert: QuorumCert,
    /// Second-chain QC anchoring the voting safety rule.
    pub(crate) lock_quorum_cert: Option<QuorumCert>,
    /// Highest TC seen, by round.
    pub(crate) highest_timeout_cert: TimeoutCert,
    /// Deepest block known to be finalized.
    pub(crate) highest_commit_block: Option<BlockInfo>,
    /// Consecutive timer fires without progress; drives sync-info cadence.
    pub(crate) timeout_count: u64,
}

impl Default for V2State {
    fn default() -> Self {
        Self {
            is_initialized: false,
            current_round: 0,
            highest_self_mined_round: 0,
            highest_voted_round: 0,
            highest_quorum_cert: QuorumCert::new(BlockInfo::new(B256::ZERO, 0, 0), 0),
            lock_quorum_cert: None,
            highest_timeout_cert: TimeoutCert::new(0, 0),
            highest_commit_block: None,
            timeout_count: 0,
        }
    }
}

/// The XDPoS V2 BFT consensus engine.
pub struct XDPoSV2Engine {
    pub(crate) config: XDPoSConfig,
    pub(crate) v2_config: V2Config,
    pub(crate) state: RwLock<V2State>,
    pub(crate) vote_pool: MessagePool<Vote>,
    pub(crate) timeout_pool: MessagePool<Timeout>,
    pub(crate) timer: ExpCountdown<TimerChain>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) epochs: EpochSwitchEngine,
    /// `(message hash, signature)` digest -> recovered signer.
    pub(crate) signatures: Mutex<LruCache<B256, Address>>,
    /// Header hashes that already passed full verification.
    pub(crate) verified_headers: Mutex<LruCache<B256, ()>>,
    pub(crate) signer: RwLock<Option<AuthorizedSigner>>,
    pub(crate) penalty_hook: Option<Arc<dyn PenaltyHook>>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastMessage>,
    broadcast_rx: Mutex<Option<mpsc::UnboundedReceiver<BroadcastMessage>>>,
    new_round_tx: mpsc::Sender<Round>,
    new_round_rx: Mutex<Option<mpsc::Receiver<Round>>>,
}

impl std::fmt::Debug for XDPoSV2Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("XDPoSV2Engine")
            .field("current_round", &state.current_round)
            .field("highest_qc_round", &state.highest_quorum_cert.round())
            .field("initialized", &state.is_initialized)
            .finish()
    }
}

impl XDPoSV2Engine {
    /// Create the engine. `config.v2` must be present and validated.
    pub fn new(
        config: XDPoSConfig,
        snapshots: Arc<SnapshotStore>,
        penalty_hook: Option<Arc<dyn PenaltyHook>>,
    ) -> XDPoSResult<Arc<Self>> {
        let v2_config = config
            .v2
            .clone()
            .ok_or_else(|| XDPoSError::InvalidConfig("v2 section missing".into()))?;

        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let (new_round_tx, new_round_rx) = mpsc::channel(NEW_ROUND_CHANNEL_CAPACITY);

        let epochs = EpochSwitchEngine::new(
            config.clone(),
            v2_config.clone(),
            Arc::clone(&snapshots),
        );

        let timer = ExpCountdown::new_exp_countdown(
            Duration::from_secs(v2_config.timeout_period),
            v2_config.timeout_exp_base,
            v2_config.timeout_max_exponent,
        )?;

        let engine = Arc::new(Self {
            config,
            v2_config,
            state: RwLock::new(V2State::default()),
            vote_pool: MessagePool::new(),
            timeout_pool: MessagePool::new(),
            timer,
            snapshots,
            epochs,
            signatures: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SIGNATURES).expect("cache size is non-zero"),
            )),
            verified_headers: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_VERIFIED_HEADERS).expect("cache size is non-zero"),
            )),
            signer: RwLock::new(None),
            penalty_hook,
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            new_round_tx,
            new_round_rx: Mutex::new(Some(new_round_rx)),
        });

        // Wire the countdown back into the engine. The weak reference keeps
        // drop order sane: a dead engine silences the timer.
        let weak: Weak<Self> = Arc::downgrade(&engine);
        engine.timer.set_on_timeout(Arc::new(move |now, chain: &TimerChain| {
            if let Some(engine) = weak.upgrade() {
                if let Err(err) = engine.on_countdown_timeout(now, chain) {
                    error!(target: "xdpos::v2", %err, "countdown handler failed");
                }
            }
        }));

        Ok(engine)
    }

    /// Initialize BFT state from the chain head. Fatal when the gap header
    /// backing the head's epoch is missing: the engine refuses to enter the
    /// active state.
    pub fn initial(&self, chain: &Arc<dyn ChainReader>, head: &XdcHeader) -> XDPoSResult<()> {
        let switch_block = self.v2_config.switch_block;
        if head.number < switch_block {
            return Err(XDPoSError::Custom(format!(
                "cannot initialize V2 below the switch block ({} < {switch_block})",
                head.number
            )));
        }

        let (current_round, highest_quorum_cert) = if head.number == switch_block {
            let block_info = BlockInfo::new(head.hash_slow(), 0, head.number);
            let gap_number = self.config.gap_number(head.number);
            (1, QuorumCert { proposed_block_info: block_info, signatures: Vec::new(), gap_number })
        } else {
            let fields = decode_extra_fields_v2(&head.extra_data)?;
            (fields.round + 1, fields.quorum_cert)
        };

        // The gap snapshot backing the head's epoch must be reachable.
        self.snapshots
            .snapshot_for_number(chain.as_ref(), highest_quorum_cert.proposed_block_info.number)?;

        let mut state = self.state.write();
        if state.is_initialized {
            debug!(target: "xdpos::v2", "engine already initialized");
            return Ok(());
        }

        state.current_round = current_round;
        state.highest_commit_block = Some(highest_quorum_cert.proposed_block_info.clone());
        state.highest_quorum_cert = highest_quorum_cert;
        state.highest_timeout_cert =
            TimeoutCert::new(0, state.highest_quorum_cert.gap_number);
        state.is_initialized = true;

        let highest_round = state.highest_quorum_cert.round();
        self.timer.reset(Arc::clone(chain), state.current_round, highest_round);

        info!(
            target: "xdpos::v2",
            head = head.number,
            round = state.current_round,
            "initialized V2 BFT state"
        );
        Ok(())
    }

    /// Whether `initial` has completed.
    pub fn is_initialized(&self) -> bool {
        self.state.read().is_initialized
    }

    /// Install the signing account used for votes, timeouts and seals.
    pub fn authorize(&self, address: Address, sign_fn: SignFn) {
        *self.signer.write() = Some(AuthorizedSigner { address, sign_fn });
        info!(target: "xdpos::v2", signer = %address, "authorized signing account");
    }

    /// The currently authorized signer address, if any.
    pub fn authorized_address(&self) -> Option<Address> {
        self.signer.read().as_ref().map(|s| s.address)
    }

    /// The round the node currently participates in.
    pub fn current_round(&self) -> Round {
        self.state.read().current_round
    }

    /// The highest QC seen.
    pub fn highest_quorum_cert(&self) -> QuorumCert {
        self.state.read().highest_quorum_cert.clone()
    }

    /// The highest TC seen.
    pub fn highest_timeout_cert(&self) -> TimeoutCert {
        self.state.read().highest_timeout_cert.clone()
    }

    /// The deepest block known to be finalized.
    pub fn highest_commit_block(&self) -> Option<BlockInfo> {
        self.state.read().highest_commit_block.clone()
    }

    /// Take the outbound message receiver. Yields `None` after the first
    /// call; there is exactly one consumer.
    pub fn broadcast_receiver(&self) -> Option<mpsc::UnboundedReceiver<BroadcastMessage>> {
        self.broadcast_rx.lock().take()
    }

    /// Take the best-effort new-round notification receiver.
    pub fn new_round_receiver(&self) -> Option<mpsc::Receiver<Round>> {
        self.new_round_rx.lock().take()
    }

    /// Stop the countdown timer. Callers must not hold the engine lock.
    pub fn shutdown(&self) {
        self.timer.stop_timer();
    }

    pub(crate) fn broadcast(&self, message: BroadcastMessage) {
        // Unbounded send: the engine lock is never held hostage by a slow
        // outbound queue.
        if self.broadcast_tx.send(message).is_err() {
            warn!(target: "xdpos::v2", "broadcast receiver dropped; outbound message discarded");
        }
    }

    /// Handle an incoming `SyncInfo` under the engine lock.
    pub fn sync_info_handler(
        &self,
        chain: &Arc<dyn ChainReader>,
        sync_info: &SyncInfo,
    ) -> XDPoSResult<()> {
        let mut state = self.state.write();
        self.process_qc_locked(&mut state, chain, sync_info.highest_quorum_cert.clone())?;
        if let Some(timeout_cert) = &sync_info.highest_timeout_cert {
            self.process_tc_locked(&mut state, chain, timeout_cert.clone());
        }
        Ok(())
    }

    /// Process a freshly minted or received QC: lift the high QC and lock
    /// QC, run the 3-chain commit rule, and advance the round.
    pub fn process_qc(
        &self,
        chain: &Arc<dyn ChainReader>,
        quorum_cert: QuorumCert,
    ) -> XDPoSResult<()> {
        let mut state = self.state.write();
        self.process_qc_locked(&mut state, chain, quorum_cert)
    }

    pub(crate) fn process_qc_locked(
        &self,
        state: &mut V2State,
        chain: &Arc<dyn ChainReader>,
        quorum_cert: QuorumCert,
    ) -> XDPoSResult<()> {
        let switch_block = self.v2_config.switch_block;
        let proposed = quorum_cert.proposed_block_info.clone();

        // Resolve everything fallible before mutating any cursor, so a
        // missing header leaves the state untouched.
        let mut new_lock_qc = None;
        let mut commit_candidate = None;

        if proposed.number > switch_block {
            let header = chain
                .get_header_by_hash(proposed.hash)
                .ok_or(XDPoSError::IncomingMessageBlockNotFound { hash: proposed.hash })?;
            let parent_qc = decode_extra_fields_v2(&header.extra_data)?.quorum_cert;

            if state
                .lock_quorum_cert
                .as_ref()
                .is_none_or(|lock| parent_qc.round() > lock.round())
            {
                new_lock_qc = Some(parent_qc);
            }

            commit_candidate = self.three_chain_commit(chain, &header, proposed.round)?;
        }

        if quorum_cert.round() > state.highest_quorum_cert.round() {
            debug!(
                target: "xdpos::v2",
                round = quorum_cert.round(),
                number = proposed.number,
                "new highest QC"
            );
            state.highest_quorum_cert = quorum_cert.clone();
        }
        if let Some(lock_qc) = new_lock_qc {
            trace!(target: "xdpos::v2", round = lock_qc.round(), "lock QC advanced");
            state.lock_quorum_cert = Some(lock_qc);
        }
        if let Some(commit) = commit_candidate {
            let advances = state.highest_commit_block.as_ref().is_none_or(|current| {
                commit.round > current.round || commit.number > current.number
            });
            if advances {
                info!(
                    target: "xdpos::v2",
                    number = commit.number,
                    round = commit.round,
                    hash = %commit.hash,
                    "block committed by 3-chain rule"
                );
                state.highest_commit_block = Some(commit);
            }
        }

        if quorum_cert.round() >= state.current_round {
            self.set_new_round_locked(state, chain, quorum_cert.round() + 1);
        }
        Ok(())
    }

    /// The 3-chain commit rule: given block `B` at `round_b` with parent `P`
    /// and grandparent `GP`, `GP` commits iff `round(P) == round_b - 1` and
    /// `round(GP) == round_b - 2`. The switch-block region is exempt.
    fn three_chain_commit(
        &self,
        chain: &Arc<dyn ChainReader>,
        header: &XdcHeader,
        round_b: Round,
    ) -> XDPoSResult<Option<BlockInfo>> {
        if header.number <= self.v2_config.switch_block + 2 {
            return Ok(None);
        }

        let parent = chain
            .get_header_by_hash(header.parent_hash)
            .ok_or(XDPoSError::UnknownAncestor)?;
        let parent_round = self.epochs.round_of(&parent)?;
        if parent_round != round_b - 1 {
            return Ok(None);
        }

        let grandparent = chain
            .get_header_by_hash(parent.parent_hash)
            .ok_or(XDPoSError::UnknownAncestor)?;
        let grandparent_round = self.epochs.round_of(&grandparent)?;
        if grandparent_round != round_b - 2 {
            return Ok(None);
        }

        Ok(Some(BlockInfo::new(
            grandparent.hash_slow(),
            grandparent_round,
            grandparent.number,
        )))
    }

    /// Process a TC: lift the high TC and advance past the timed-out round.
    pub fn process_tc(&self, chain: &Arc<dyn ChainReader>, timeout_cert: TimeoutCert) {
        let mut state = self.state.write();
        self.process_tc_locked(&mut state, chain, timeout_cert);
    }

    pub(crate) fn process_tc_locked(
        &self,
        state: &mut V2State,
        chain: &Arc<dyn ChainReader>,
        timeout_cert: TimeoutCert,
    ) {
        if timeout_cert.round > state.highest_timeout_cert.round {
            debug!(target: "xdpos::v2", round = timeout_cert.round, "new highest TC");
            state.highest_timeout_cert = timeout_cert.clone();
        }
        if timeout_cert.round >= state.current_round {
            self.set_new_round_locked(state, chain, timeout_cert.round + 1);
        }
    }

    /// Enter `round`: reset the timeout counter and timer, clear the timeout
    /// pool, reap stale vote groups, and notify listeners best-effort.
    pub(crate) fn set_new_round_locked(
        &self,
        state: &mut V2State,
        chain: &Arc<dyn ChainReader>,
        round: Round,
    ) {
        debug!(target: "xdpos::v2", from = state.current_round, to = round, "entering new round");
        state.current_round = round;
        state.timeout_count = 0;

        self.timer.reset(Arc::clone(chain), round, state.highest_quorum_cert.round());

        // Timeouts are per-round; votes are keyed by round/hash and only
        // reaped once they fall behind the hygiene window.
        self.timeout_pool.clear();
        self.vote_pool.hygiene(round, POOL_HYGIENE_ROUND);

        if let Err(mpsc::error::TrySendError::Closed(_)) = self.new_round_tx.try_send(round) {
            trace!(target: "xdpos::v2", "new round listener gone");
        }
    }
}
