//! Gap-block snapshots of the next epoch's candidate masternodes.
//!
//! A snapshot is taken at each gap block (`number % epoch == epoch - gap`)
//! and keyed by that block's hash. It freezes the candidate set that votes
//! and certificates of the following epoch are checked against. Lookups go
//! LRU → persistent store → synthesis from the gap header itself.

use crate::{
    chain::{ChainReader, SnapshotDb},
    constants::INMEMORY_SNAPSHOTS,
    errors::{XDPoSError, XDPoSResult},
    extra_data::{EXTRA_SEAL, EXTRA_VANITY},
};
use alloy_primitives::{Address, B256};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{num::NonZeroUsize, sync::Arc};
use tracing::{debug, trace};
use xdc_primitives::XdcHeader;

/// Key prefix for persisted snapshots. The value is the JSON-serialized
/// [`Snapshot`] record.
pub const SNAPSHOT_KEY_PREFIX: &[u8] = b"xdpos-v2-";

/// The masternode candidate set frozen at a gap block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Gap block number the snapshot was taken at.
    pub number: u64,
    /// Gap block hash; the snapshot's storage key.
    pub hash: B256,
    /// Candidates eligible for the next epoch, in election order.
    pub next_epoch_candidates: Vec<Address>,
}

impl Snapshot {
    /// Create a snapshot at a gap block.
    pub fn new(number: u64, hash: B256, next_epoch_candidates: Vec<Address>) -> Self {
        Self { number, hash, next_epoch_candidates }
    }

    /// Whether `address` is among the frozen candidates.
    pub fn is_candidate(&self, address: &Address) -> bool {
        self.next_epoch_candidates.contains(address)
    }
}

/// In-memory LRU over a persistent key/value store of gap-block snapshots.
pub struct SnapshotStore {
    epoch: u64,
    gap: u64,
    cache: Mutex<LruCache<B256, Arc<Snapshot>>>,
    db: Arc<dyn SnapshotDb>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("epoch", &self.epoch)
            .field("gap", &self.gap)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl SnapshotStore {
    /// Create a store over `db` for a chain with the given epoch geometry.
    pub fn new(epoch: u64, gap: u64, db: Arc<dyn SnapshotDb>) -> Self {
        Self {
            epoch,
            gap,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SNAPSHOTS).expect("cache size is non-zero"),
            )),
            db,
        }
    }

    /// The gap block governing block `number`:
    /// `number - (number % epoch) - gap`, clamped at zero.
    pub fn gap_number_for(&self, number: u64) -> u64 {
        (number - number % self.epoch).saturating_sub(self.gap)
    }

    /// Persist a freshly taken snapshot and prime the cache.
    pub fn store(&self, snapshot: Snapshot) -> XDPoSResult<()> {
        let value = serde_json::to_vec(&snapshot)
            .map_err(|e| XDPoSError::Custom(format!("snapshot encode failed: {e}")))?;
        self.db.put(&storage_key(snapshot.hash), &value)?;

        debug!(
            target: "xdpos::snapshot",
            number = snapshot.number,
            hash = %snapshot.hash,
            candidates = snapshot.next_epoch_candidates.len(),
            "stored gap snapshot"
        );
        self.cache.lock().put(snapshot.hash, Arc::new(snapshot));
        Ok(())
    }

    /// Fetch the snapshot governing block `number`. The gap header must be
    /// present on the chain; a missing persisted entry is recomputed from
    /// the header, a missing header is a hard error.
    pub fn snapshot_for_number(
        &self,
        chain: &dyn ChainReader,
        number: u64,
    ) -> XDPoSResult<Arc<Snapshot>> {
        self.snapshot_at_gap_number(chain, self.gap_number_for(number))
    }

    /// Fetch the snapshot taken at `gap_number` (already a gap number).
    pub fn snapshot_at_gap_number(
        &self,
        chain: &dyn ChainReader,
        gap_number: u64,
    ) -> XDPoSResult<Arc<Snapshot>> {
        let gap_header =
            chain.get_header_by_number(gap_number).ok_or(XDPoSError::UnknownBlock)?;
        let hash = gap_header.hash_slow();

        if let Some(snapshot) = self.snapshot_by_hash(hash) {
            trace!(target: "xdpos::snapshot", gap_number, "snapshot hit");
            return Ok(snapshot);
        }

        // Not persisted (fresh launch or pruned db): rebuild from the gap
        // header and persist the result.
        let candidates = candidates_from_gap_header(&gap_header)?;
        let snapshot = Snapshot::new(gap_number, hash, candidates);
        self.store(snapshot.clone())?;
        Ok(Arc::new(snapshot))
    }

    /// Fetch a stored snapshot by its gap-block hash, LRU first, then the
    /// persistent store. `None` means it was never taken (or pruned).
    pub fn snapshot_by_hash(&self, hash: B256) -> Option<Arc<Snapshot>> {
        if let Some(snapshot) = self.cache.lock().get(&hash) {
            return Some(Arc::clone(snapshot));
        }

        let raw = self.db.get(&storage_key(hash))?;
        match serde_json::from_slice::<Snapshot>(&raw) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.cache.lock().put(hash, Arc::clone(&snapshot));
                Some(snapshot)
            }
            Err(_) => {
                debug!(target: "xdpos::snapshot", %hash, "discarding undecodable persisted snapshot");
                None
            }
        }
    }
}

fn storage_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_KEY_PREFIX.len() + 32);
    key.extend_from_slice(SNAPSHOT_KEY_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Read the candidate set out of a gap (or genesis) header.
fn candidates_from_gap_header(header: &XdcHeader) -> XDPoSResult<Vec<Address>> {
    if header.number == 0 {
        // Genesis keeps its signers in the legacy extra framing.
        let extra = &header.extra_data;
        if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(XDPoSError::MissingVanity);
        }
        let middle = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
        if middle.len() % Address::len_bytes() != 0 {
            return Err(XDPoSError::InvalidCheckpointSigners);
        }
        return Ok(middle.chunks_exact(Address::len_bytes()).map(Address::from_slice).collect());
    }

    header
        .validator_addresses()
        .ok_or_else(|| XDPoSError::ExtraDecodeError("gap header validators malformed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::MemoryDb, config::XDPoSConfig, tests::helpers::MockChain};
    use alloy_primitives::Bytes;

    fn store() -> SnapshotStore {
        SnapshotStore::new(900, 450, Arc::new(MemoryDb::new()))
    }

    #[test]
    fn gap_number_formula() {
        let store = store();
        assert_eq!(store.gap_number_for(0), 0);
        assert_eq!(store.gap_number_for(451), 0);
        assert_eq!(store.gap_number_for(900), 450);
        assert_eq!(store.gap_number_for(1799), 450);
        assert_eq!(store.gap_number_for(1800), 1350);
    }

    #[test]
    fn missing_gap_header_is_fatal() {
        let chain = MockChain::new(XDPoSConfig::default());
        let store = store();
        assert!(matches!(
            store.snapshot_at_gap_number(&chain, 450),
            Err(XDPoSError::UnknownBlock)
        ));
    }

    #[test]
    fn synthesizes_and_persists_from_gap_header() {
        let chain = MockChain::new(XDPoSConfig::default());
        let candidates = vec![Address::with_last_byte(1), Address::with_last_byte(2)];

        let mut raw = Vec::new();
        for c in &candidates {
            raw.extend_from_slice(c.as_slice());
        }
        let header = XdcHeader {
            number: 450,
            validators: Bytes::from(raw),
            ..Default::default()
        };
        chain.insert_header(header);

        let store = store();
        let snap = store.snapshot_at_gap_number(&chain, 450).unwrap();
        assert_eq!(snap.number, 450);
        assert_eq!(snap.next_epoch_candidates, candidates);

        // Second lookup is served from memory even if the chain forgot the
        // header's body; the db also holds it now.
        let again = store.snapshot_for_number(&chain, 900).unwrap();
        assert_eq!(again, snap);
    }

    #[test]
    fn genesis_candidates_come_from_extra_framing() {
        let chain = MockChain::new(XDPoSConfig::default());
        let signer = Address::with_last_byte(5);

        let mut extra = vec![0u8; EXTRA_VANITY];
        extra.extend_from_slice(signer.as_slice());
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        chain.insert_header(XdcHeader { number: 0, extra_data: extra.into(), ..Default::default() });

        let store = store();
        let snap = store.snapshot_at_gap_number(&chain, 0).unwrap();
        assert_eq!(snap.next_epoch_candidates, vec![signer]);
    }
}
