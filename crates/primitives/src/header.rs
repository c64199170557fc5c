//! XDC block header with XDPoS validator fields.

use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::{Decodable, Encodable, Header as RlpHeader};
use serde::{Deserialize, Serialize};

/// XDC block header.
///
/// This extends the standard Ethereum header with three additional fields
/// required by XDPoS consensus:
/// - `validators`: concatenated 20-byte masternode addresses, present only on
///   epoch-switch (V2) or checkpoint (V1) blocks
/// - `validator`: the 65-byte seal of the block producer (V2 blocks)
/// - `penalties`: concatenated 20-byte penalized addresses
///
/// RLP encoding order: the 15 standard Ethereum fields, then the three XDC
/// fields, then the optional `base_fee_per_gas`. The block hash covers all
/// fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XdcHeader {
    /// The Keccak 256-bit hash of the parent block's header, in its entirety.
    pub parent_hash: B256,
    /// The Keccak 256-bit hash of the ommers list portion of this block.
    pub ommers_hash: B256,
    /// The 160-bit address to which all fees collected from the successful
    /// mining of this block are transferred.
    pub beneficiary: Address,
    /// The Keccak 256-bit hash of the root node of the state trie, after all
    /// transactions are executed and finalisations applied.
    pub state_root: B256,
    /// The Keccak 256-bit hash of the root node of the transactions trie.
    pub transactions_root: B256,
    /// The Keccak 256-bit hash of the root node of the receipts trie.
    pub receipts_root: B256,
    /// The Bloom filter composed from indexable information in each log entry.
    pub logs_bloom: Bloom,
    /// A scalar value corresponding to the difficulty level of this block.
    /// Fixed at 1 for V2 blocks.
    pub difficulty: U256,
    /// A scalar value equal to the number of ancestor blocks.
    pub number: u64,
    /// A scalar value equal to the current limit of gas expenditure per block.
    pub gas_limit: u64,
    /// A scalar value equal to the total gas used in transactions in this block.
    pub gas_used: u64,
    /// A scalar value equal to the output of Unix time() at this block's inception.
    pub timestamp: u64,
    /// An arbitrary byte array containing data relevant to this block.
    /// V1: `vanity || addresses || seal`. V2: `0x02 || rlp(round, qc)`.
    pub extra_data: Bytes,
    /// Legacy proof-of-work mix digest, zero under XDPoS.
    pub mix_hash: B256,
    /// Legacy proof-of-work nonce, zero under XDPoS.
    pub nonce: B64,
    /// Concatenated 20-byte masternode addresses. Empty off epoch boundaries.
    pub validators: Bytes,
    /// The 65-byte seal of the block producer (V2 blocks).
    pub validator: Bytes,
    /// Concatenated 20-byte penalized addresses.
    pub penalties: Bytes,
    /// Base fee per gas for EIP-1559 transactions, if the fork is active.
    pub base_fee_per_gas: Option<u64>,
}

impl Default for XdcHeader {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            ommers_hash: crate::EMPTY_OMMER_ROOT_HASH,
            beneficiary: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Bloom::ZERO,
            difficulty: U256::ZERO,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
            mix_hash: B256::ZERO,
            nonce: B64::ZERO,
            validators: Bytes::new(),
            validator: Bytes::new(),
            penalties: Bytes::new(),
            base_fee_per_gas: None,
        }
    }
}

impl XdcHeader {
    /// Compute the block hash: keccak256 of the full RLP encoding, XDC fields
    /// included.
    pub fn hash_slow(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(&buf)
    }

    /// Parse the `validators` field as a list of addresses.
    ///
    /// Returns `None` when the field length is not a multiple of 20.
    pub fn validator_addresses(&self) -> Option<Vec<Address>> {
        addresses_from_bytes(&self.validators)
    }

    /// Parse the `penalties` field as a list of addresses.
    pub fn penalty_addresses(&self) -> Option<Vec<Address>> {
        addresses_from_bytes(&self.penalties)
    }
}

fn addresses_from_bytes(raw: &[u8]) -> Option<Vec<Address>> {
    if raw.len() % Address::len_bytes() != 0 {
        return None;
    }
    Some(
        raw.chunks_exact(Address::len_bytes())
            .map(Address::from_slice)
            .collect(),
    )
}

impl Encodable for XdcHeader {
    fn encode(&self, out: &mut dyn alloy_primitives::bytes::BufMut) {
        let list_header = RlpHeader { list: true, payload_length: self.payload_length() };
        list_header.encode(out);

        self.parent_hash.encode(out);
        self.ommers_hash.encode(out);
        self.beneficiary.encode(out);
        self.state_root.encode(out);
        self.transactions_root.encode(out);
        self.receipts_root.encode(out);
        self.logs_bloom.encode(out);
        self.difficulty.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.timestamp.encode(out);
        self.extra_data.encode(out);
        self.mix_hash.encode(out);
        self.nonce.encode(out);
        self.validators.encode(out);
        self.validator.encode(out);
        self.penalties.encode(out);
        if let Some(base_fee) = self.base_fee_per_gas {
            base_fee.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl XdcHeader {
    fn payload_length(&self) -> usize {
        let mut length = 0;
        length += self.parent_hash.length();
        length += self.ommers_hash.length();
        length += self.beneficiary.length();
        length += self.state_root.length();
        length += self.transactions_root.length();
        length += self.receipts_root.length();
        length += self.logs_bloom.length();
        length += self.difficulty.length();
        length += self.number.length();
        length += self.gas_limit.length();
        length += self.gas_used.length();
        length += self.timestamp.length();
        length += self.extra_data.length();
        length += self.mix_hash.length();
        length += self.nonce.length();
        length += self.validators.length();
        length += self.validator.length();
        length += self.penalties.length();
        if let Some(base_fee) = self.base_fee_per_gas {
            length += base_fee.length();
        }
        length
    }
}

impl Decodable for XdcHeader {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = RlpHeader::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();

        let mut this = Self {
            parent_hash: Decodable::decode(buf)?,
            ommers_hash: Decodable::decode(buf)?,
            beneficiary: Decodable::decode(buf)?,
            state_root: Decodable::decode(buf)?,
            transactions_root: Decodable::decode(buf)?,
            receipts_root: Decodable::decode(buf)?,
            logs_bloom: Decodable::decode(buf)?,
            difficulty: Decodable::decode(buf)?,
            number: Decodable::decode(buf)?,
            gas_limit: Decodable::decode(buf)?,
            gas_used: Decodable::decode(buf)?,
            timestamp: Decodable::decode(buf)?,
            extra_data: Decodable::decode(buf)?,
            mix_hash: Decodable::decode(buf)?,
            nonce: Decodable::decode(buf)?,
            validators: Decodable::decode(buf)?,
            validator: Decodable::decode(buf)?,
            penalties: Decodable::decode(buf)?,
            base_fee_per_gas: None,
        };

        if started_len - buf.len() < rlp_head.payload_length {
            this.base_fee_per_gas = Some(Decodable::decode(buf)?);
        }

        let consumed = started_len - buf.len();
        if consumed != rlp_head.payload_length {
            return Err(alloy_rlp::Error::UnexpectedLength);
        }
        Ok(this)
    }
}
