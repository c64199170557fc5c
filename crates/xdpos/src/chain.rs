//! Boundary traits for the collaborators the consensus core consumes.
//!
//! The engine holds no reference to the chain; a [`ChainReader`] is passed
//! into every call that needs one, which keeps the dependency edge one-way.

use crate::{config::XDPoSConfig, errors::XDPoSResult};
use alloy_primitives::{Address, B256, U256};
use parking_lot::RwLock;
use std::collections::HashMap;
use xdc_primitives::{XdcBlock, XdcHeader};

/// Read-only access to headers and blocks.
pub trait ChainReader: Send + Sync {
    /// The consensus configuration of this chain.
    fn config(&self) -> &XDPoSConfig;

    /// The current head header.
    fn current_header(&self) -> XdcHeader;

    /// Header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<XdcHeader>;

    /// Header by hash alone.
    fn get_header_by_hash(&self, hash: B256) -> Option<XdcHeader>;

    /// Header by number on the canonical chain.
    fn get_header_by_number(&self, number: u64) -> Option<XdcHeader>;

    /// Full block by hash and number. Needed by the reward scan.
    fn get_block(&self, hash: B256, number: u64) -> Option<XdcBlock>;
}

/// Mutable account state for the block being finalized.
///
/// Candidate/owner/voter readers are layered on [`StateDb::get_state`] in
/// [`crate::contracts`] from the fixed system-contract storage layout.
pub trait StateDb {
    /// Raw storage read: `addr`'s slot `key`.
    fn get_state(&self, addr: Address, key: B256) -> B256;

    /// Credit `amount` wei to `addr`.
    fn add_balance(&mut self, addr: Address, amount: U256);

    /// The state root after applying pending changes.
    fn intermediate_root(&mut self, delete_empty_objects: bool) -> B256;
}

/// Persistent key/value store for gap-block snapshots.
pub trait SnapshotDb: Send + Sync {
    /// Fetch the value stored under `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> XDPoSResult<()>;
}

/// Account signing function installed via `Authorize`.
pub type SignFn = Box<dyn Fn(Address, B256) -> XDPoSResult<[u8; 65]> + Send + Sync>;

/// In-memory [`SnapshotDb`], used in tests and light embeddings.
#[derive(Debug, Default)]
pub struct MemoryDb {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotDb for MemoryDb {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> XDPoSResult<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_db_roundtrip() {
        let db = MemoryDb::new();
        assert!(db.get(b"missing").is_none());

        db.put(b"k", b"v1").unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v1");

        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v2");
    }
}
