//! Block and transaction types consumed by the consensus core.

use crate::XdcHeader;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// A transaction as seen by the consensus layer.
///
/// Pool admission, RLP framing and sender recovery all happen upstream; by
/// the time a transaction reaches the consensus core its sender is already
/// resolved. The reward engine only inspects `from`, `to` and `input`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Recovered sender address.
    pub from: Address,
    /// Recipient, `None` for contract creation.
    pub to: Option<Address>,
    /// Transferred value in wei.
    pub value: U256,
    /// Gas limit.
    pub gas: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    /// Call data.
    pub input: Bytes,
}

impl Transaction {
    /// Build a plain value transfer.
    pub fn transfer(from: Address, to: Address, value: U256) -> Self {
        Self { from, to: Some(to), value, gas: 21_000, gas_price: 1_000_000_000, input: Bytes::new() }
    }

    /// Build a contract call carrying `input`.
    pub fn call(from: Address, to: Address, input: Bytes) -> Self {
        Self { from, to: Some(to), value: U256::ZERO, gas: 100_000, gas_price: 1_000_000_000, input }
    }
}

/// A block: header plus transaction list. XDPoS forbids ommers, so none are
/// carried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XdcBlock {
    /// The block header.
    pub header: XdcHeader,
    /// Transactions in execution order.
    pub transactions: Vec<Transaction>,
}

impl XdcBlock {
    /// Assemble a block from a header and body.
    pub fn new(header: XdcHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    /// The block hash (the header hash).
    pub fn hash_slow(&self) -> B256 {
        self.header.hash_slow()
    }

    /// The block number.
    pub fn number(&self) -> u64 {
        self.header.number
    }
}
