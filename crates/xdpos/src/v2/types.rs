//! RLP codecs and signing hashes for V2 BFT messages.

use super::{ExtraFieldsV2, QuorumCert, Round, TimeoutForSign, VoteForSign};
use crate::errors::{XDPoSError, XDPoSResult};
use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

/// Version byte prefixed to V2 extra data.
pub const EXTRA_FIELDS_V2_VERSION: u8 = 2;

/// The RLP body of a V2 header's extra field: `(round, quorum_cert)`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct ExtraFieldsV2Rlp {
    round: Round,
    quorum_cert: QuorumCert,
}

/// Compute the signature hash for a vote: `keccak256(rlp(block_info, gap))`.
pub fn vote_sig_hash(vote: &VoteForSign) -> B256 {
    keccak256(alloy_rlp::encode(vote))
}

/// Compute the signature hash for a timeout: `keccak256(rlp(round, gap))`.
pub fn timeout_sig_hash(timeout: &TimeoutForSign) -> B256 {
    keccak256(alloy_rlp::encode(timeout))
}

/// Encode V2 extra fields with the leading version byte.
pub fn encode_extra_fields_v2(round: Round, quorum_cert: &QuorumCert) -> Vec<u8> {
    let fields = ExtraFieldsV2Rlp { round, quorum_cert: quorum_cert.clone() };
    let encoded = alloy_rlp::encode(&fields);

    let mut result = Vec::with_capacity(1 + encoded.len());
    result.push(EXTRA_FIELDS_V2_VERSION);
    result.extend_from_slice(&encoded);
    result
}

/// Decode V2 extra fields, rejecting anything below version 2.
pub fn decode_extra_fields_v2(bytes: &[u8]) -> XDPoSResult<ExtraFieldsV2> {
    let (&version, rest) = bytes
        .split_first()
        .ok_or_else(|| XDPoSError::ExtraDecodeError("extra field is empty".into()))?;
    if version < EXTRA_FIELDS_V2_VERSION {
        return Err(XDPoSError::ExtraDecodeError(format!("not a V2 block, version: {version}")));
    }

    let fields = ExtraFieldsV2Rlp::decode(&mut &rest[..])
        .map_err(|e| XDPoSError::ExtraDecodeError(e.to_string()))?;

    Ok(ExtraFieldsV2::new(fields.round, fields.quorum_cert))
}
