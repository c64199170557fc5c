//! XDPoS consensus errors.

use alloy_primitives::B256;

/// XDPoS-specific error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XDPoSError {
    /// The referenced block is not known to the chain.
    #[error("unknown block")]
    UnknownBlock,

    /// The parent of the block being verified is not known.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The block's timestamp is too far in the future.
    #[error("block in the future")]
    FutureBlock,

    /// The header's parent does not match the highest known QC.
    #[error("not ready to propose: parent does not extend the highest QC")]
    NotReadyToPropose,

    /// Mine period has not elapsed or this signer is not the round leader.
    #[error("not ready to mine")]
    NotReadyToMine,

    /// The coinbase does not match the authorized signer.
    #[error("coinbase mismatch")]
    CoinbaseMismatch,

    /// Structurally invalid quorum certificate.
    #[error("invalid quorum certificate")]
    InvalidQC,

    /// Quorum certificate signatures failed verification.
    #[error("invalid QC signatures: {0}")]
    InvalidQCSignatures(String),

    /// Structurally invalid timeout certificate.
    #[error("invalid timeout certificate")]
    InvalidTC,

    /// Timeout certificate signatures failed verification.
    #[error("invalid TC signatures")]
    InvalidTCSignatures,

    /// Not enough unique signatures to reach the certificate threshold.
    #[error("insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures {
        /// Unique signatures present.
        have: usize,
        /// Threshold required.
        need: usize,
    },

    /// An incoming vote or timeout was not for the current round.
    #[error("{kind} round {got} does not equal current round {current}")]
    IncomingMessageRoundNotEqualCurrent {
        /// Message kind ("vote" or "timeout").
        kind: &'static str,
        /// Round carried by the message.
        got: u64,
        /// The engine's current round.
        current: u64,
    },

    /// An incoming message is too many rounds ahead to be useful.
    #[error("{kind} round {got} is too far from current round {current}")]
    IncomingMessageRoundTooFar {
        /// Message kind ("vote" or "timeout").
        kind: &'static str,
        /// Round carried by the message.
        got: u64,
        /// The engine's current round.
        current: u64,
    },

    /// The block referenced by an incoming message is not present locally.
    #[error("block {hash} referenced by incoming message not found")]
    IncomingMessageBlockNotFound {
        /// Hash of the missing block.
        hash: B256,
    },

    /// The masternode list resolved for a certificate or epoch is empty.
    #[error("empty masternode list")]
    EmptyMasternodeList,

    /// A certificate's gap number does not match the epoch it claims.
    #[error("gap number mismatch: expected {expected}, got {got}")]
    GapNumberMismatch {
        /// Gap number recomputed from the epoch-switch block.
        expected: u64,
        /// Gap number carried by the certificate.
        got: u64,
    },

    /// A block info does not match the locally known header.
    #[error("block info mismatch: {0}")]
    BlockInfoMismatch(String),

    /// Header extra data could not be decoded.
    #[error("extra data decode error: {0}")]
    ExtraDecodeError(String),

    /// Missing 32-byte vanity prefix in V1 extra data.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Missing 65-byte seal signature.
    #[error("extra-data 65 byte suffix signature missing")]
    MissingSignature,

    /// Checkpoint validator list is malformed.
    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    /// Checkpoint beneficiary must be zero.
    #[error("beneficiary in checkpoint block must be zero")]
    InvalidCheckpointBeneficiary,

    /// Mix digest must be zero under XDPoS.
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Ommers are forbidden under XDPoS.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// V2 block difficulty must be 1.
    #[error("invalid difficulty")]
    InvalidDifficulty,

    /// Timestamp violates the block period.
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// Signature bytes are not a 65-byte recoverable signature.
    #[error("invalid signature format")]
    InvalidSignatureFormat,

    /// ECDSA recovery failed.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// The signer performing an operation is not authorized on this engine.
    #[error("signer not authorized")]
    NotAuthorized,

    /// The engine has not been initialized against a chain head yet.
    #[error("engine not initialized")]
    NotInitialized,

    /// Configuration rejected at load time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Catch-all with context.
    #[error("{0}")]
    Custom(String),
}

/// Result type for XDPoS operations.
pub type XDPoSResult<T> = Result<T, XDPoSError>;
