//! Epoch switch detection and materialization.
//!
//! A header starts a new epoch when it is the switch block itself, the first
//! V2 block after it, or when its parent's round sits before the epoch start
//! round `round - (round % epoch)`. For epoch-switch headers the module
//! materializes an [`EpochSwitchInfo`] (masternodes, penalties, standbys);
//! for everything else it resolves to the governing epoch-switch block by
//! walking parents, memoized per block hash.

use crate::{
    chain::ChainReader,
    config::{V2Config, XDPoSConfig},
    constants::{INMEMORY_EPOCHS, INMEMORY_ROUND_TO_EPOCH},
    errors::{XDPoSError, XDPoSResult},
    extra_data::{EXTRA_SEAL, EXTRA_VANITY},
    snapshot::SnapshotStore,
    v2::{types::decode_extra_fields_v2, BlockInfo, EpochSwitchInfo, Round},
};
use alloy_primitives::{Address, B256};
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, sync::Arc};
use tracing::{debug, trace};
use xdc_primitives::XdcHeader;

/// Epoch switch machinery shared by the verification and proposer pipelines.
pub struct EpochSwitchEngine {
    config: XDPoSConfig,
    v2: V2Config,
    snapshots: Arc<SnapshotStore>,
    /// Epoch info per epoch-switch block hash, plus memoized resolutions for
    /// non-switch descendants.
    cache: Mutex<LruCache<B256, Arc<EpochSwitchInfo>>>,
    /// Epoch-switch block info keyed by epoch start round.
    round2epoch: Mutex<LruCache<Round, BlockInfo>>,
}

impl std::fmt::Debug for EpochSwitchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochSwitchEngine")
            .field("switch_block", &self.v2.switch_block)
            .field("epoch", &self.config.epoch)
            .finish()
    }
}

impl EpochSwitchEngine {
    /// Create the engine. `v2` must be the validated V2 section of `config`.
    pub fn new(config: XDPoSConfig, v2: V2Config, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            config,
            v2,
            snapshots,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_EPOCHS).expect("cache size is non-zero"),
            )),
            round2epoch: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_ROUND_TO_EPOCH).expect("cache size is non-zero"),
            )),
        }
    }

    /// The round a V2 header was proposed in, from its extra fields.
    pub fn round_of(&self, header: &XdcHeader) -> XDPoSResult<Round> {
        if header.number <= self.v2.switch_block {
            return Ok(0);
        }
        Ok(decode_extra_fields_v2(&header.extra_data)?.round)
    }

    /// The epoch start round for `round`: `round - (round % epoch)`.
    pub fn epoch_start_round(&self, round: Round) -> Round {
        round - round % self.config.epoch
    }

    /// Whether `header` is an epoch switch block.
    pub fn is_epoch_switch(&self, header: &XdcHeader) -> XDPoSResult<bool> {
        let switch_block = self.v2.switch_block;

        // The switch block is the last V1 block and always starts an epoch
        // (round 0); below it V1 rules apply.
        if header.number == switch_block {
            return Ok(true);
        }
        if header.number < switch_block {
            return Ok(header.number % self.config.epoch == 0);
        }

        let fields = decode_extra_fields_v2(&header.extra_data)?;
        if fields.quorum_cert.proposed_block_info.number == switch_block {
            // First V2 block, irrespective of round arithmetic.
            return Ok(true);
        }

        let parent_round = fields.quorum_cert.proposed_block_info.round;
        Ok(parent_round < self.epoch_start_round(fields.round))
    }

    /// Whether a block proposed at `round` on top of `parent` would be an
    /// epoch switch, without that block existing yet.
    pub fn is_epoch_switch_at_round(
        &self,
        round: Round,
        parent: &XdcHeader,
    ) -> XDPoSResult<bool> {
        let switch_block = self.v2.switch_block;
        let prospective_number = parent.number + 1;

        if prospective_number <= switch_block {
            return Ok(prospective_number % self.config.epoch == 0);
        }
        if parent.number == switch_block {
            return Ok(true);
        }

        let parent_round = self.round_of(parent)?;
        Ok(parent_round < self.epoch_start_round(round))
    }

    /// Resolve the [`EpochSwitchInfo`] governing the block at `hash`.
    ///
    /// `header` may be passed as a lookup hint when the caller already holds
    /// the header for `hash` (e.g. a parent header during verification).
    pub fn get_epoch_switch_info(
        &self,
        chain: &dyn ChainReader,
        header: Option<&XdcHeader>,
        hash: B256,
    ) -> XDPoSResult<Arc<EpochSwitchInfo>> {
        if let Some(info) = self.cache.lock().get(&hash) {
            return Ok(Arc::clone(info));
        }

        // Walk parents until an epoch switch (or a cached resolution), then
        // memoize the result for every hash on the path.
        let mut walked = Vec::new();
        let mut current_hash = hash;
        let mut current_header = match header {
            Some(h) if h.hash_slow() == hash => h.clone(),
            _ => chain.get_header_by_hash(hash).ok_or(XDPoSError::UnknownBlock)?,
        };

        let info = loop {
            if let Some(info) = self.cache.lock().get(&current_hash) {
                break Arc::clone(info);
            }
            if self.is_epoch_switch(&current_header)? {
                let info = Arc::new(self.materialize(chain, &current_header)?);
                self.cache.lock().put(current_hash, Arc::clone(&info));
                self.round2epoch
                    .lock()
                    .put(
                        self.epoch_start_round(info.epoch_switch_block_info.round),
                        info.epoch_switch_block_info.clone(),
                    );
                break info;
            }

            walked.push(current_hash);
            current_hash = current_header.parent_hash;
            current_header =
                chain.get_header_by_hash(current_hash).ok_or(XDPoSError::UnknownBlock)?;
        };

        let mut cache = self.cache.lock();
        for walked_hash in walked {
            cache.put(walked_hash, Arc::clone(&info));
        }
        Ok(info)
    }

    /// Resolve the epoch info governing `round`, walking epoch switches back
    /// from `head` until one with `round <= round` is found.
    pub fn epoch_switch_info_by_round(
        &self,
        chain: &dyn ChainReader,
        head: &XdcHeader,
        round: Round,
    ) -> XDPoSResult<Arc<EpochSwitchInfo>> {
        let cached_hash =
            self.round2epoch.lock().get(&self.epoch_start_round(round)).map(|info| info.hash);
        if let Some(hash) = cached_hash {
            return self.get_epoch_switch_info(chain, None, hash);
        }

        let mut info = self.get_epoch_switch_info(chain, Some(head), head.hash_slow())?;
        while info.epoch_switch_block_info.round > round {
            let parent_hash = info.epoch_switch_parent_block_info.hash;
            info = self.get_epoch_switch_info(chain, None, parent_hash)?;
        }
        Ok(info)
    }

    /// The epoch number of `header`. V1 epochs count checkpoints; V2 epochs
    /// continue from the switch block by round.
    pub fn epoch_number_of(&self, header: &XdcHeader) -> XDPoSResult<u64> {
        let epoch = self.config.epoch;
        if header.number <= self.v2.switch_block {
            return Ok(header.number / epoch);
        }
        let round = self.round_of(header)?;
        Ok(self.v2.switch_block / epoch + round / epoch)
    }

    /// Locate the epoch-switch block of epoch `epoch_number` by binary
    /// search over `[switch_block, head]`.
    pub fn get_block_by_epoch_number(
        &self,
        chain: &dyn ChainReader,
        epoch_number: u64,
    ) -> XDPoSResult<BlockInfo> {
        let head = chain.current_header();
        let switch_block = self.v2.switch_block;

        if epoch_number <= switch_block / self.config.epoch {
            // V1 epochs are plain checkpoints.
            let number = epoch_number * self.config.epoch;
            let header = chain.get_header_by_number(number).ok_or(XDPoSError::UnknownBlock)?;
            return Ok(BlockInfo::new(header.hash_slow(), 0, number));
        }

        // Leftmost block whose epoch number reaches the target.
        let mut lo = switch_block;
        let mut hi = head.number;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let header = chain.get_header_by_number(mid).ok_or(XDPoSError::UnknownBlock)?;
            if self.epoch_number_of(&header)? < epoch_number {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let header = chain.get_header_by_number(lo).ok_or(XDPoSError::UnknownBlock)?;
        if self.epoch_number_of(&header)? != epoch_number {
            return Err(XDPoSError::Custom(format!("epoch {epoch_number} has no block yet")));
        }

        let info = self.get_epoch_switch_info(chain, Some(&header), header.hash_slow())?;
        Ok(info.epoch_switch_block_info.clone())
    }

    /// Build the [`EpochSwitchInfo`] for a header already known to be an
    /// epoch switch.
    fn materialize(
        &self,
        chain: &dyn ChainReader,
        header: &XdcHeader,
    ) -> XDPoSResult<EpochSwitchInfo> {
        let (round, parent_round) = if header.number <= self.v2.switch_block {
            (0, 0)
        } else {
            let fields = decode_extra_fields_v2(&header.extra_data)?;
            (fields.round, fields.quorum_cert.proposed_block_info.round)
        };

        let masternodes = self.masternodes_from_header(header)?;
        let penalties = header.penalty_addresses().ok_or_else(|| {
            XDPoSError::ExtraDecodeError("epoch switch penalties malformed".into())
        })?;

        // Standbys are the frozen candidates that were neither elected nor
        // penalized. A missing gap snapshot (deep V1 history) leaves them
        // empty rather than failing epoch resolution.
        let standbynodes = match self.snapshots.snapshot_for_number(chain, header.number) {
            Ok(snapshot) => snapshot
                .next_epoch_candidates
                .iter()
                .filter(|c| !masternodes.contains(c) && !penalties.contains(c))
                .copied()
                .collect(),
            Err(err) => {
                debug!(
                    target: "xdpos::epoch",
                    number = header.number,
                    %err,
                    "no gap snapshot for epoch switch; standbys unavailable"
                );
                Vec::new()
            }
        };

        trace!(
            target: "xdpos::epoch",
            number = header.number,
            round,
            masternodes = masternodes.len(),
            penalties = penalties.len(),
            "materialized epoch switch info"
        );

        Ok(EpochSwitchInfo {
            masternodes_len: masternodes.len(),
            masternodes,
            penalties,
            standbynodes,
            epoch_switch_block_info: BlockInfo::new(header.hash_slow(), round, header.number),
            epoch_switch_parent_block_info: BlockInfo::new(
                header.parent_hash,
                parent_round,
                header.number.saturating_sub(1),
            ),
        })
    }

    /// Masternodes of an epoch-switch header. The genesis block keeps them
    /// in the legacy extra framing, everything else in the `validators`
    /// field.
    fn masternodes_from_header(&self, header: &XdcHeader) -> XDPoSResult<Vec<Address>> {
        if header.number == 0 {
            let extra = &header.extra_data;
            if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
                return Err(XDPoSError::MissingVanity);
            }
            let middle = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
            if middle.len() % Address::len_bytes() != 0 {
                return Err(XDPoSError::InvalidCheckpointSigners);
            }
            return Ok(
                middle.chunks_exact(Address::len_bytes()).map(Address::from_slice).collect()
            );
        }

        header
            .validator_addresses()
            .ok_or_else(|| XDPoSError::ExtraDecodeError("epoch switch validators malformed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::MemoryDb,
        tests::helpers::{v2_chain_with_epoch, MockChain, TestChainBuilder},
        v2::types::encode_extra_fields_v2,
        v2::QuorumCert,
    };
    use alloy_primitives::Bytes;

    fn engine_for(chain: &MockChain) -> EpochSwitchEngine {
        let config = chain.config().clone();
        let v2 = config.v2.clone().expect("v2 configured");
        let snapshots =
            Arc::new(SnapshotStore::new(config.epoch, config.gap, Arc::new(MemoryDb::new())));
        EpochSwitchEngine::new(config, v2, snapshots)
    }

    #[test]
    fn switch_block_is_epoch_switch() {
        let chain = v2_chain_with_epoch(10, 5, 900);
        let engine = engine_for(&chain);

        let switch_header = chain.get_header_by_number(900).unwrap();
        assert!(engine.is_epoch_switch(&switch_header).unwrap());
    }

    #[test]
    fn first_v2_block_is_epoch_switch() {
        let chain = v2_chain_with_epoch(10, 5, 900);
        let engine = engine_for(&chain);

        let first_v2 = chain.get_header_by_number(901).unwrap();
        assert!(engine.is_epoch_switch(&first_v2).unwrap());

        let second_v2 = chain.get_header_by_number(902).unwrap();
        assert!(!engine.is_epoch_switch(&second_v2).unwrap());
    }

    #[test]
    fn round_rollover_is_epoch_switch() {
        // Epoch 10: a header at round 10 whose parent sits at round 9
        // crosses the epoch start round.
        let chain = v2_chain_with_epoch(10, 15, 900);
        let engine = engine_for(&chain);

        // Block 900 + k is at round k; the epoch rolls at round 10.
        let rollover = chain.get_header_by_number(910).unwrap();
        assert_eq!(engine.round_of(&rollover).unwrap(), 10);
        assert!(engine.is_epoch_switch(&rollover).unwrap());

        let inside = chain.get_header_by_number(909).unwrap();
        assert!(!engine.is_epoch_switch(&inside).unwrap());
    }

    #[test]
    fn foresees_epoch_switch_at_round() {
        let chain = v2_chain_with_epoch(10, 15, 900);
        let engine = engine_for(&chain);

        let parent = chain.get_header_by_number(909).unwrap(); // round 9
        assert!(engine.is_epoch_switch_at_round(10, &parent).unwrap());
        assert!(!engine.is_epoch_switch_at_round(9, &parent).unwrap());

        let switch_parent = chain.get_header_by_number(900).unwrap();
        assert!(engine.is_epoch_switch_at_round(1, &switch_parent).unwrap());
    }

    #[test]
    fn non_switch_header_resolves_to_parent_epoch() {
        let chain = v2_chain_with_epoch(10, 8, 900);
        let engine = engine_for(&chain);

        let child = chain.get_header_by_number(905).unwrap();
        let info = engine.get_epoch_switch_info(&chain, None, child.hash_slow()).unwrap();
        assert_eq!(info.epoch_switch_block_info.number, 901);

        // Memoized: a second lookup for the same hash hits the cache even if
        // the chain would no longer serve the intermediate headers.
        let again = engine.get_epoch_switch_info(&chain, None, child.hash_slow()).unwrap();
        assert_eq!(again.epoch_switch_block_info, info.epoch_switch_block_info);
    }

    #[test]
    fn epoch_info_carries_masternodes_and_penalties() {
        let masternodes: Vec<Address> = (1..=4).map(Address::with_last_byte).collect();
        let penalized = Address::with_last_byte(9);

        let chain = TestChainBuilder::new(10, 5, 900)
            .masternodes(masternodes.clone())
            .penalties(vec![penalized])
            .build();
        let engine = engine_for(&chain);

        let first_v2 = chain.get_header_by_number(901).unwrap();
        let info = engine.get_epoch_switch_info(&chain, None, first_v2.hash_slow()).unwrap();

        assert_eq!(info.masternodes, masternodes);
        assert_eq!(info.masternodes_len, 4);
        assert_eq!(info.penalties, vec![penalized]);
        assert_eq!(info.epoch_switch_parent_block_info.number, 900);
    }

    #[test]
    fn rejects_unknown_block() {
        let chain = v2_chain_with_epoch(10, 5, 900);
        let engine = engine_for(&chain);
        assert!(matches!(
            engine.get_epoch_switch_info(&chain, None, B256::with_last_byte(0xEE)),
            Err(XDPoSError::UnknownBlock)
        ));
    }

    #[test]
    fn malformed_extra_is_decode_error() {
        let chain = v2_chain_with_epoch(10, 5, 900);
        let engine = engine_for(&chain);

        let bad = XdcHeader {
            number: 950,
            extra_data: Bytes::from(vec![2, 0xde, 0xad]),
            ..Default::default()
        };
        assert!(matches!(engine.is_epoch_switch(&bad), Err(XDPoSError::ExtraDecodeError(_))));
    }

    #[test]
    fn by_round_walks_back_epochs() {
        let chain = v2_chain_with_epoch(10, 25, 900);
        let engine = engine_for(&chain);
        let head = chain.current_header();

        // Head is deep in the third epoch; round 3 belongs to the first.
        let info = engine.epoch_switch_info_by_round(&chain, &head, 3).unwrap();
        assert_eq!(info.epoch_switch_block_info.number, 901);

        let info = engine.epoch_switch_info_by_round(&chain, &head, 14).unwrap();
        assert_eq!(info.epoch_switch_block_info.round, 10);
    }

    #[test]
    fn block_by_epoch_number_binary_search() {
        let chain = v2_chain_with_epoch(10, 25, 900);
        let engine = engine_for(&chain);

        // V1 epoch: checkpoint 90 * 10 == block 900 is epoch 90.
        let v1 = engine.get_block_by_epoch_number(&chain, 90).unwrap();
        assert_eq!(v1.number, 900);

        // The next epoch starts where rounds roll to 10: block 910.
        let e91 = engine.get_block_by_epoch_number(&chain, 91).unwrap();
        assert_eq!(e91.number, 910);

        // An epoch the chain has not reached yet is an error.
        assert!(engine.get_block_by_epoch_number(&chain, 99).is_err());
    }

    #[test]
    fn extra_decode_guard() {
        let qc = QuorumCert::new(BlockInfo::new(B256::ZERO, 0, 0), 0);
        let encoded = encode_extra_fields_v2(4, &qc);
        let decoded = decode_extra_fields_v2(&encoded).unwrap();
        assert_eq!(decoded.round, 4);
    }
}
