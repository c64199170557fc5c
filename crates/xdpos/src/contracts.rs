//! Storage readers for the two fixed system contracts.
//!
//! The consensus core never executes contract code; it reads raw storage
//! slots of the Validator contract (candidate registry) and recognizes
//! signing transactions sent to the BlockSigner contract.
//!
//! Validator contract layout:
//! - `candidates` dynamic array at slot 8
//! - `validatorsState[candidate]` struct at `keccak256(candidate || 1)`:
//!   offset 0 = owner, offset 1 = cap, offset 2 = voter-cap mapping base
//! - `voters[candidate]` dynamic array at slot 2

use crate::chain::StateDb;
use alloy_primitives::{address, keccak256, Address, B256, U256};

/// Validator contract address (candidate registry).
pub const VALIDATOR_CONTRACT: Address = address!("0000000000000000000000000000000000000088");

/// BlockSigner contract address (receives signing transactions).
pub const BLOCK_SIGNERS_CONTRACT: Address = address!("0000000000000000000000000000000000000089");

/// 4-byte selector of `sign(uint256,bytes32)`.
pub const SIGN_METHOD_SELECTOR: [u8; 4] = [0xe3, 0x41, 0xea, 0xa4];

/// Storage slot of the `candidates` array.
const CANDIDATES_SLOT: u64 = 8;

/// Storage slot of the `validatorsState` mapping.
const VALIDATORS_STATE_SLOT: u64 = 1;

/// Storage slot of the `voters` mapping.
const VOTERS_SLOT: u64 = 2;

fn slot_b256(slot: u64) -> B256 {
    B256::from(U256::from(slot))
}

/// Element `index` of a dynamic array whose length lives at `slot`.
fn array_element_loc(slot: B256, index: u64) -> B256 {
    let base = U256::from_be_bytes(keccak256(slot.as_slice()).0);
    B256::from(base.wrapping_add(U256::from(index)))
}

/// Base slot of `mapping[key]` for an address-keyed mapping at `slot`.
fn mapping_loc(key: Address, slot: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[12..32].copy_from_slice(key.as_slice());
    buf[32..].copy_from_slice(slot.as_slice());
    keccak256(buf)
}

/// Slot `base + offset` for struct members.
fn offset_loc(base: B256, offset: u64) -> B256 {
    B256::from(U256::from_be_bytes(base.0).wrapping_add(U256::from(offset)))
}

fn word_as_u64(word: B256) -> u64 {
    U256::from_be_bytes(word.0).saturating_to::<u64>()
}

fn word_as_address(word: B256) -> Address {
    Address::from_slice(&word.as_slice()[12..])
}

/// Read the full candidate list from the Validator contract.
pub fn get_candidates(state: &dyn StateDb) -> Vec<Address> {
    let length_slot = slot_b256(CANDIDATES_SLOT);
    let length = word_as_u64(state.get_state(VALIDATOR_CONTRACT, length_slot));

    (0..length)
        .map(|i| {
            word_as_address(state.get_state(VALIDATOR_CONTRACT, array_element_loc(length_slot, i)))
        })
        .collect()
}

/// Read a candidate's stake cap.
pub fn get_candidate_cap(state: &dyn StateDb, candidate: Address) -> U256 {
    let state_loc = mapping_loc(candidate, slot_b256(VALIDATORS_STATE_SLOT));
    U256::from_be_bytes(state.get_state(VALIDATOR_CONTRACT, offset_loc(state_loc, 1)).0)
}

/// Read a candidate's owner. Zero means "never registered".
pub fn get_candidate_owner(state: &dyn StateDb, candidate: Address) -> Address {
    let state_loc = mapping_loc(candidate, slot_b256(VALIDATORS_STATE_SLOT));
    word_as_address(state.get_state(VALIDATOR_CONTRACT, state_loc))
}

/// Read the voters backing a candidate.
pub fn get_voters(state: &dyn StateDb, candidate: Address) -> Vec<Address> {
    let length_slot = mapping_loc(candidate, slot_b256(VOTERS_SLOT));
    let length = word_as_u64(state.get_state(VALIDATOR_CONTRACT, length_slot));

    (0..length)
        .map(|i| {
            word_as_address(state.get_state(VALIDATOR_CONTRACT, array_element_loc(length_slot, i)))
        })
        .collect()
}

/// Read the stake a voter has delegated to a candidate.
pub fn get_voter_cap(state: &dyn StateDb, candidate: Address, voter: Address) -> U256 {
    let state_loc = mapping_loc(candidate, slot_b256(VALIDATORS_STATE_SLOT));
    let voter_cap_loc = mapping_loc(voter, offset_loc(state_loc, 2));
    U256::from_be_bytes(state.get_state(VALIDATOR_CONTRACT, voter_cap_loc).0)
}

/// Whether a transaction is a signing transaction: sent to the BlockSigner
/// contract with `4-byte selector || 32-byte number || 32-byte hash` data.
pub fn is_signing_tx(to: Option<Address>, data: &[u8]) -> bool {
    to == Some(BLOCK_SIGNERS_CONTRACT) && data.len() >= 68
}

/// The block hash referenced by a signing transaction: the last 32 bytes of
/// its call data.
pub fn signed_block_hash(data: &[u8]) -> Option<B256> {
    if data.len() < 68 {
        return None;
    }
    Some(B256::from_slice(&data[data.len() - 32..]))
}

/// Build the call data of a signing transaction for `number`/`hash`.
pub fn encode_sign_tx_data(number: u64, hash: B256) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&SIGN_METHOD_SELECTOR);
    data.extend_from_slice(B256::from(U256::from(number)).as_slice());
    data.extend_from_slice(hash.as_slice());
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Default)]
    struct StubState {
        slots: RwLock<HashMap<(Address, B256), B256>>,
    }

    impl StubState {
        fn set(&self, addr: Address, key: B256, value: B256) {
            self.slots.write().insert((addr, key), value);
        }
    }

    impl StateDb for StubState {
        fn get_state(&self, addr: Address, key: B256) -> B256 {
            self.slots.read().get(&(addr, key)).copied().unwrap_or_default()
        }

        fn add_balance(&mut self, _addr: Address, _amount: U256) {}

        fn intermediate_root(&mut self, _delete_empty_objects: bool) -> B256 {
            B256::ZERO
        }
    }

    fn addr_word(addr: Address) -> B256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(addr.as_slice());
        B256::from(word)
    }

    #[test]
    fn candidates_array_read() {
        let state = StubState::default();
        let a = Address::with_last_byte(1);
        let b = Address::with_last_byte(2);

        let length_slot = slot_b256(CANDIDATES_SLOT);
        state.set(VALIDATOR_CONTRACT, length_slot, B256::from(U256::from(2)));
        state.set(VALIDATOR_CONTRACT, array_element_loc(length_slot, 0), addr_word(a));
        state.set(VALIDATOR_CONTRACT, array_element_loc(length_slot, 1), addr_word(b));

        assert_eq!(get_candidates(&state), vec![a, b]);
    }

    #[test]
    fn candidate_owner_and_cap() {
        let state = StubState::default();
        let candidate = Address::with_last_byte(7);
        let owner = Address::with_last_byte(8);

        let state_loc = mapping_loc(candidate, slot_b256(VALIDATORS_STATE_SLOT));
        state.set(VALIDATOR_CONTRACT, state_loc, addr_word(owner));
        state.set(
            VALIDATOR_CONTRACT,
            offset_loc(state_loc, 1),
            B256::from(U256::from(5_000_000u64)),
        );

        assert_eq!(get_candidate_owner(&state, candidate), owner);
        assert_eq!(get_candidate_cap(&state, candidate), U256::from(5_000_000u64));

        // An unregistered candidate has a zero owner.
        assert_eq!(get_candidate_owner(&state, Address::with_last_byte(9)), Address::ZERO);
    }

    #[test]
    fn voter_cap_read() {
        let state = StubState::default();
        let candidate = Address::with_last_byte(7);
        let voter = Address::with_last_byte(3);

        let state_loc = mapping_loc(candidate, slot_b256(VALIDATORS_STATE_SLOT));
        let cap_loc = mapping_loc(voter, offset_loc(state_loc, 2));
        state.set(VALIDATOR_CONTRACT, cap_loc, B256::from(U256::from(77u64)));

        assert_eq!(get_voter_cap(&state, candidate, voter), U256::from(77u64));
    }

    #[test]
    fn signing_tx_recognition() {
        let hash = B256::with_last_byte(0xab);
        let data = encode_sign_tx_data(15, hash);

        assert_eq!(data.len(), 68);
        assert!(is_signing_tx(Some(BLOCK_SIGNERS_CONTRACT), &data));
        assert_eq!(signed_block_hash(&data), Some(hash));

        // Wrong recipient or truncated data is not a signing tx.
        assert!(!is_signing_tx(Some(VALIDATOR_CONTRACT), &data));
        assert!(!is_signing_tx(None, &data));
        assert!(!is_signing_tx(Some(BLOCK_SIGNERS_CONTRACT), &data[..67]));
        assert_eq!(signed_block_hash(&data[..40]), None);
    }
}
