//! XDPoS V2 BFT consensus.
//!
//! Round-based HotStuff-style consensus:
//! - [`BlockInfo`] identifies a proposed block inside BFT messages
//! - [`QuorumCert`] proves a 2/3 masternode majority voted for a block
//! - [`TimeoutCert`] proves a 2/3 masternode majority timed out a round
//! - [`SyncInfo`] carries the highest certificates to lagging peers
//! - the engine in [`engine`] drives rounds, the 3-chain commit rule, and
//!   the countdown timer

pub mod engine;
pub mod epoch;
pub mod pool;
pub mod proposer;
pub mod timeout;
pub mod timer;
pub mod types;
pub mod verification;
pub mod vote;

pub use engine::XDPoSV2Engine;

use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// Round number type for V2 consensus. Distinct from the block number; the
/// two diverge across timeouts and forks.
pub type Round = u64;

/// A 65-byte recoverable signature over a BFT message.
pub type Signature = Vec<u8>;

/// Metadata identifying a proposed block inside BFT messages, without
/// embedding the header.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
pub struct BlockInfo {
    /// Block hash.
    pub hash: B256,
    /// Consensus round the block was proposed in.
    pub round: Round,
    /// Block number.
    pub number: u64,
}

impl BlockInfo {
    /// Create a new `BlockInfo`.
    pub fn new(hash: B256, round: Round, number: u64) -> Self {
        Self { hash, round, number }
    }
}

/// Quorum Certificate: proof that at least the certificate threshold of the
/// masternode set at `gap_number` voted for `proposed_block_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
pub struct QuorumCert {
    /// The block this certificate certifies.
    pub proposed_block_info: BlockInfo,
    /// Masternode signatures over the vote signing hash.
    pub signatures: Vec<Signature>,
    /// Gap block number of the epoch the signing masternode set was fixed at.
    pub gap_number: u64,
}

impl QuorumCert {
    /// Create a certificate with no signatures yet.
    pub fn new(proposed_block_info: BlockInfo, gap_number: u64) -> Self {
        Self { proposed_block_info, signatures: Vec::new(), gap_number }
    }

    /// The round this certificate certifies.
    pub fn round(&self) -> Round {
        self.proposed_block_info.round
    }
}

/// Timeout Certificate: proof that at least the certificate threshold of the
/// masternode set at `gap_number` timed out `round`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable)]
pub struct TimeoutCert {
    /// The round that timed out.
    pub round: Round,
    /// Masternode signatures over the timeout signing hash.
    pub signatures: Vec<Signature>,
    /// Gap block number of the epoch the signing masternode set was fixed at.
    pub gap_number: u64,
}

impl TimeoutCert {
    /// Create a certificate with no signatures yet.
    pub fn new(round: Round, gap_number: u64) -> Self {
        Self { round, signatures: Vec::new(), gap_number }
    }
}

/// Highest known certificates, piggybacked to help lagging peers catch up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Highest known quorum certificate.
    pub highest_quorum_cert: QuorumCert,
    /// Highest known timeout certificate, absent when the sender has never
    /// assembled one.
    pub highest_timeout_cert: Option<TimeoutCert>,
}

/// Parsed V2 extra data: version byte 2 followed by `rlp(round, qc)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFieldsV2 {
    /// The round the block was proposed in.
    pub round: Round,
    /// The certificate for the block's parent. Carries no signatures only
    /// for the QC synthesized over the switch block.
    pub quorum_cert: QuorumCert,
}

impl ExtraFieldsV2 {
    /// Create new extra fields.
    pub fn new(round: Round, quorum_cert: QuorumCert) -> Self {
        Self { round, quorum_cert }
    }
}

/// A vote for a proposed block.
///
/// `signer` is a cache stamped during verification; [`Address::ZERO`] means
/// "signature not yet verified".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// The block being voted for.
    pub proposed_block_info: BlockInfo,
    /// Signature over [`types::vote_sig_hash`].
    pub signature: Signature,
    /// Gap number the voter believes governs this block's epoch.
    pub gap_number: u64,
    /// Recovered signer, [`Address::ZERO`] until verified.
    #[serde(skip)]
    pub signer: Address,
}

impl Vote {
    /// Create an unverified vote.
    pub fn new(proposed_block_info: BlockInfo, signature: Signature, gap_number: u64) -> Self {
        Self { proposed_block_info, signature, gap_number, signer: Address::ZERO }
    }

    /// Grouping key: `round:gap:number:hash`.
    pub fn pool_key(&self) -> String {
        format!(
            "{}:{}:{}:{:?}",
            self.proposed_block_info.round,
            self.gap_number,
            self.proposed_block_info.number,
            self.proposed_block_info.hash,
        )
    }

    /// Deduplication digest over the vote's contents.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::new();
        self.proposed_block_info.encode(&mut buf);
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.gap_number.to_be_bytes());
        keccak256(&buf)
    }
}

/// A timeout for a round.
///
/// `signer` follows the same zero-sentinel convention as [`Vote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    /// The round that timed out for the sender.
    pub round: Round,
    /// Signature over [`types::timeout_sig_hash`].
    pub signature: Signature,
    /// Gap number the sender believes governs the current epoch.
    pub gap_number: u64,
    /// Recovered signer, [`Address::ZERO`] until verified.
    #[serde(skip)]
    pub signer: Address,
}

impl Timeout {
    /// Create an unverified timeout.
    pub fn new(round: Round, signature: Signature, gap_number: u64) -> Self {
        Self { round, signature, gap_number, signer: Address::ZERO }
    }

    /// Grouping key: `round:gap`.
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.round, self.gap_number)
    }

    /// Deduplication digest over the timeout's contents.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.round.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.gap_number.to_be_bytes());
        keccak256(&buf)
    }
}

/// The payload a vote signature commits to.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct VoteForSign {
    /// The block being voted for.
    pub proposed_block_info: BlockInfo,
    /// Gap number of the governing epoch.
    pub gap_number: u64,
}

/// The payload a timeout signature commits to.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TimeoutForSign {
    /// The round being timed out.
    pub round: Round,
    /// Gap number of the governing epoch.
    pub gap_number: u64,
}

/// The materialized view of an epoch, cached per epoch-switch block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSwitchInfo {
    /// Masternodes elected for this epoch.
    pub masternodes: Vec<Address>,
    /// Number of masternodes; the base of certificate thresholds.
    pub masternodes_len: usize,
    /// Candidates penalized out of this epoch.
    pub penalties: Vec<Address>,
    /// Candidates neither elected nor penalized.
    pub standbynodes: Vec<Address>,
    /// The epoch-switch block.
    pub epoch_switch_block_info: BlockInfo,
    /// The parent of the epoch-switch block.
    pub epoch_switch_parent_block_info: BlockInfo,
}

/// Outbound message pushed to the broadcast sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    /// A vote produced by this node.
    Vote(Vote),
    /// A timeout produced by this node.
    Timeout(Timeout),
    /// A sync-info snapshot of the highest certificates.
    SyncInfo(SyncInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_pool_key_layout() {
        let info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        let vote = Vote::new(info, vec![1, 2, 3], 500);

        let key = vote.pool_key();
        assert!(key.starts_with("100:500:1000:"));
    }

    #[test]
    fn timeout_pool_key_layout() {
        let timeout = Timeout::new(7, vec![1], 450);
        assert_eq!(timeout.pool_key(), "7:450");
    }

    #[test]
    fn vote_hash_distinguishes_signatures() {
        let info = BlockInfo::new(B256::with_last_byte(1), 100, 1000);
        let a = Vote::new(info.clone(), vec![1; 65], 450);
        let b = Vote::new(info, vec![2; 65], 450);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn quorum_cert_round() {
        let qc = QuorumCert::new(BlockInfo::new(B256::ZERO, 9, 90), 0);
        assert_eq!(qc.round(), 9);
    }
}
