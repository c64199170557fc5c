//! XDPoS V1 header validation.
//!
//! Pre-switch blocks run the epoch-based PoA scheme: signers rotate by block
//! number, checkpoint headers carry the signer list in their extra data, and
//! the seal is the trailing 65 bytes of that extra data.

use crate::{
    config::XDPoSConfig,
    errors::{XDPoSError, XDPoSResult},
    extra_data::{EXTRA_SEAL, EXTRA_VANITY},
};
use alloy_primitives::{Address, B256};
use xdc_primitives::XdcHeader;

/// Validate the structure of a V1 header against its parent.
pub fn validate_v1_header(
    header: &XdcHeader,
    config: &XDPoSConfig,
    parent: Option<&XdcHeader>,
) -> XDPoSResult<()> {
    let extra = &header.extra_data;
    if extra.len() < EXTRA_VANITY {
        return Err(XDPoSError::MissingVanity);
    }
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(XDPoSError::MissingSignature);
    }

    let number = header.number;
    let checkpoint = number % config.epoch == 0;

    // Checkpoint blocks must not carry a beneficiary.
    if checkpoint && header.beneficiary != Address::ZERO {
        return Err(XDPoSError::InvalidCheckpointBeneficiary);
    }

    // The signer section must be address-aligned, and empty off checkpoints.
    let signers_len = extra.len() - EXTRA_VANITY - EXTRA_SEAL;
    if checkpoint && signers_len % Address::len_bytes() != 0 {
        return Err(XDPoSError::InvalidCheckpointSigners);
    }
    if !checkpoint && signers_len != 0 {
        return Err(XDPoSError::InvalidCheckpointSigners);
    }

    if header.mix_hash != B256::ZERO {
        return Err(XDPoSError::InvalidMixDigest);
    }
    if header.ommers_hash != xdc_primitives::EMPTY_OMMER_ROOT_HASH {
        return Err(XDPoSError::InvalidUncleHash);
    }

    if let Some(parent) = parent {
        if header.timestamp < parent.timestamp + config.period {
            return Err(XDPoSError::InvalidTimestamp);
        }
    }

    Ok(())
}

/// Extract the signer list from a checkpoint header's extra data.
pub fn extract_checkpoint_signers(extra: &[u8]) -> XDPoSResult<Vec<Address>> {
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        return Err(XDPoSError::MissingVanity);
    }

    let signers_data = &extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL];
    if signers_data.len() % Address::len_bytes() != 0 {
        return Err(XDPoSError::InvalidCheckpointSigners);
    }

    Ok(signers_data.chunks_exact(Address::len_bytes()).map(Address::from_slice).collect())
}
