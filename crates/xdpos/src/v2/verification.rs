//! Header, QC, TC and sync-info verification.

use crate::{
    chain::ChainReader,
    constants::ALLOWED_FUTURE_BLOCK_TIME_SECS,
    errors::{XDPoSError, XDPoSResult},
    extra_data::{unique_signatures, EXTRA_SEAL},
    v2::{
        engine::XDPoSV2Engine,
        types::{decode_extra_fields_v2, timeout_sig_hash, vote_sig_hash},
        BlockInfo, QuorumCert, SyncInfo, TimeoutCert, TimeoutForSign, VoteForSign,
    },
};
use alloy_primitives::U256;
use rayon::prelude::*;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};
use xdc_primitives::XdcHeader;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

impl XDPoSV2Engine {
    /// Verify a V2 header. With `full_verify` the embedded QC is checked
    /// signature by signature; without, only the structure is.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &XdcHeader,
        full_verify: bool,
    ) -> XDPoSResult<()> {
        if header.timestamp > unix_now() + ALLOWED_FUTURE_BLOCK_TIME_SECS {
            return Err(XDPoSError::FutureBlock);
        }

        // Blocks at or below the switch block are V1; their rules live in
        // the V1 validator.
        if header.number <= self.v2_config.switch_block {
            return Ok(());
        }

        let hash = header.hash_slow();
        if self.verified_headers.lock().contains(&hash) {
            trace!(target: "xdpos::v2", number = header.number, "header already verified");
            return Ok(());
        }

        let fields = decode_extra_fields_v2(&header.extra_data)?;

        if header.difficulty != U256::from(1u64) {
            return Err(XDPoSError::InvalidDifficulty);
        }
        if header.ommers_hash != xdc_primitives::EMPTY_OMMER_ROOT_HASH {
            return Err(XDPoSError::InvalidUncleHash);
        }
        if header.validator.len() != EXTRA_SEAL {
            return Err(XDPoSError::MissingSignature);
        }

        // The embedded certificate must certify this block's parent, and
        // rounds must move forward.
        if fields.quorum_cert.proposed_block_info.hash != header.parent_hash {
            return Err(XDPoSError::InvalidQC);
        }
        if fields.round <= fields.quorum_cert.round()
            && fields.quorum_cert.proposed_block_info.number != self.v2_config.switch_block
        {
            return Err(XDPoSError::InvalidQC);
        }

        if full_verify {
            let parent = chain.get_header(header.parent_hash, header.number - 1);
            self.verify_qc(chain, &fields.quorum_cert, parent.as_ref())?;
            self.verified_headers.lock().put(hash, ());
        }

        Ok(())
    }

    /// Verify a quorum certificate: threshold of unique signatures, every
    /// signer a masternode of the certificate's epoch, consistent gap
    /// number, and a matching local block.
    pub fn verify_qc(
        &self,
        chain: &dyn ChainReader,
        quorum_cert: &QuorumCert,
        parent_header: Option<&XdcHeader>,
    ) -> XDPoSResult<()> {
        let epoch_info = self.epochs.get_epoch_switch_info(
            chain,
            parent_header,
            quorum_cert.proposed_block_info.hash,
        )?;
        if epoch_info.masternodes.is_empty() {
            return Err(XDPoSError::EmptyMasternodeList);
        }

        let (unique, duplicates) = unique_signatures(&quorum_cert.signatures);
        if !duplicates.is_empty() {
            warn!(
                target: "xdpos::v2",
                duplicates = duplicates.len(),
                number = quorum_cert.proposed_block_info.number,
                "duplicate signatures in QC"
            );
        }

        // The QC synthesized over the switch block (round 0) carries no
        // signatures; everything later must meet the threshold.
        if quorum_cert.round() > 0 {
            let threshold = self.v2_config.cert_threshold_count(epoch_info.masternodes_len);
            if unique.len() < threshold {
                return Err(XDPoSError::InvalidQCSignatures(format!(
                    "{} unique signatures, need {threshold}",
                    unique.len()
                )));
            }

            let sig_hash = vote_sig_hash(&VoteForSign {
                proposed_block_info: quorum_cert.proposed_block_info.clone(),
                gap_number: quorum_cert.gap_number,
            });
            let masternodes = &epoch_info.masternodes;

            unique
                .par_iter()
                .map(|signature| {
                    let signer = self.recover_message_signer(sig_hash, signature)?;
                    if masternodes.contains(&signer) {
                        Ok(())
                    } else {
                        Err(XDPoSError::InvalidQCSignatures(format!(
                            "signer {signer} is not a masternode"
                        )))
                    }
                })
                .collect::<XDPoSResult<Vec<()>>>()?;
        }

        let expected_gap =
            self.config.gap_number(epoch_info.epoch_switch_block_info.number);
        if quorum_cert.gap_number != expected_gap {
            return Err(XDPoSError::GapNumberMismatch {
                expected: expected_gap,
                got: quorum_cert.gap_number,
            });
        }

        self.verify_block_info(chain, &quorum_cert.proposed_block_info, parent_header)
    }

    /// Confirm a `BlockInfo` against the locally known header: the header
    /// exists, numbers match, and (off the switch block) rounds match.
    pub fn verify_block_info(
        &self,
        chain: &dyn ChainReader,
        block_info: &BlockInfo,
        hint: Option<&XdcHeader>,
    ) -> XDPoSResult<()> {
        let header = match hint {
            Some(h) if h.hash_slow() == block_info.hash => h.clone(),
            _ => chain
                .get_header_by_hash(block_info.hash)
                .ok_or(XDPoSError::UnknownBlock)?,
        };

        if header.number != block_info.number {
            return Err(XDPoSError::BlockInfoMismatch(format!(
                "header number {} != block info number {}",
                header.number, block_info.number
            )));
        }

        if block_info.number == self.v2_config.switch_block {
            if block_info.round != 0 {
                return Err(XDPoSError::BlockInfoMismatch(
                    "switch block must carry round 0".into(),
                ));
            }
        } else if block_info.number > self.v2_config.switch_block {
            let header_round = self.epochs.round_of(&header)?;
            if header_round != block_info.round {
                return Err(XDPoSError::BlockInfoMismatch(format!(
                    "header round {header_round} != block info round {}",
                    block_info.round
                )));
            }
        }

        Ok(())
    }

    /// Verify a timeout certificate against the masternode set of the epoch
    /// governing its round.
    pub fn verify_tc(&self, chain: &dyn ChainReader, timeout_cert: &TimeoutCert) -> XDPoSResult<()> {
        // The engine-default certificate (round 0) carries no signatures and
        // certifies nothing; it gets the same exemption as the round-0 QC.
        if timeout_cert.round == 0 {
            return Ok(());
        }

        let head = chain.current_header();
        let epoch_info =
            self.epochs.epoch_switch_info_by_round(chain, &head, timeout_cert.round)?;
        if epoch_info.masternodes.is_empty() {
            return Err(XDPoSError::EmptyMasternodeList);
        }

        let (unique, duplicates) = unique_signatures(&timeout_cert.signatures);
        if !duplicates.is_empty() {
            warn!(
                target: "xdpos::v2",
                duplicates = duplicates.len(),
                round = timeout_cert.round,
                "duplicate signatures in TC"
            );
        }

        let threshold = self.v2_config.cert_threshold_count(epoch_info.masternodes_len);
        if unique.len() < threshold {
            return Err(XDPoSError::InsufficientSignatures {
                have: unique.len(),
                need: threshold,
            });
        }

        let sig_hash = timeout_sig_hash(&TimeoutForSign {
            round: timeout_cert.round,
            gap_number: timeout_cert.gap_number,
        });
        let masternodes = &epoch_info.masternodes;

        unique
            .par_iter()
            .map(|signature| {
                let signer = self.recover_message_signer(sig_hash, signature)?;
                if masternodes.contains(&signer) {
                    Ok(())
                } else {
                    Err(XDPoSError::InvalidTCSignatures)
                }
            })
            .collect::<XDPoSResult<Vec<()>>>()?;

        Ok(())
    }

    /// Verify an incoming `SyncInfo`. `Ok(false)` means both certificates
    /// are already dominated by local state and nothing needs processing.
    pub fn verify_sync_info_message(
        &self,
        chain: &dyn ChainReader,
        sync_info: &SyncInfo,
    ) -> XDPoSResult<bool> {
        let sync_tc_round =
            sync_info.highest_timeout_cert.as_ref().map_or(0, |tc| tc.round);
        {
            let state = self.state.read();
            if state.highest_quorum_cert.round() >= sync_info.highest_quorum_cert.round()
                && state.highest_timeout_cert.round >= sync_tc_round
            {
                trace!(target: "xdpos::v2", "sync info already dominated by local certificates");
                return Ok(false);
            }
        }

        self.verify_qc(chain, &sync_info.highest_quorum_cert, None)?;
        if let Some(timeout_cert) = &sync_info.highest_timeout_cert {
            self.verify_tc(chain, timeout_cert)?;
        }
        Ok(true)
    }
}
