//! XDC Network block primitives.
//!
//! XDC headers extend the standard Ethereum header with three XDPoS fields
//! (`validators`, `validator`, `penalties`). This crate provides the header,
//! block and transaction types the consensus core operates on.

mod block;
mod header;

pub use block::{Transaction, XdcBlock};
pub use header::XdcHeader;

/// Keccak-256 hash of an empty RLP list — the ommers hash of every XDC block.
pub const EMPTY_OMMER_ROOT_HASH: alloy_primitives::B256 = alloy_primitives::b256!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
);
