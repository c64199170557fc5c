//! Vote verification, pooling, QC assembly and self-voting.

use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    extra_data::ecrecover,
    v2::{
        engine::{TimerChain, V2State, XDPoSV2Engine},
        types::{decode_extra_fields_v2, vote_sig_hash},
        BlockInfo, BroadcastMessage, QuorumCert, Vote, VoteForSign,
    },
};
use alloy_primitives::{keccak256, Address, B256};
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::{debug, trace, warn};
use xdc_primitives::XdcHeader;

impl XDPoSV2Engine {
    /// Recover the signer of a BFT message signature, memoized on
    /// `(message hash, signature)`.
    pub(crate) fn recover_message_signer(
        &self,
        sig_hash: B256,
        signature: &[u8],
    ) -> XDPoSResult<Address> {
        let mut key_material = Vec::with_capacity(32 + signature.len());
        key_material.extend_from_slice(sig_hash.as_slice());
        key_material.extend_from_slice(signature);
        let cache_key = keccak256(&key_material);

        if let Some(signer) = self.signatures.lock().get(&cache_key) {
            return Ok(*signer);
        }

        let signer = ecrecover(&sig_hash, signature)?;
        self.signatures.lock().put(cache_key, signer);
        Ok(signer)
    }

    /// Wire-level vote verification, run before the engine lock.
    ///
    /// Returns `Ok(false)` without error for votes that are merely
    /// uninteresting: stale rounds, unknown referenced blocks (they usually
    /// arrive moments later), or signers outside the masternode set. Only
    /// infrastructure failures (snapshot store) surface as errors.
    pub fn verify_vote_message(
        &self,
        chain: &dyn ChainReader,
        vote: &mut Vote,
    ) -> XDPoSResult<bool> {
        let current_round = self.state.read().current_round;
        if vote.proposed_block_info.round < current_round {
            trace!(
                target: "xdpos::v2",
                vote_round = vote.proposed_block_info.round,
                current_round,
                "dropping stale vote"
            );
            return Ok(false);
        }

        if chain.get_header_by_hash(vote.proposed_block_info.hash).is_none() {
            // The proposed block has not arrived yet; the vote is kept out
            // of the handler and a later copy will be processed. Not an
            // error, and deliberately not Error-logged.
            debug!(
                target: "xdpos::v2",
                hash = %vote.proposed_block_info.hash,
                round = vote.proposed_block_info.round,
                "vote references a block not yet known"
            );
            return Ok(false);
        }

        // The vote's gap number is taken at face value; the snapshot there
        // fixes the masternode set the signature is checked against.
        let snapshot = self.snapshots.snapshot_at_gap_number(chain, vote.gap_number)?;

        let sig_hash = vote_sig_hash(&VoteForSign {
            proposed_block_info: vote.proposed_block_info.clone(),
            gap_number: vote.gap_number,
        });
        let signer = self.recover_message_signer(sig_hash, &vote.signature)?;
        vote.signer = signer;

        Ok(snapshot.next_epoch_candidates.contains(&signer))
    }

    /// Pool a verified vote and mint a QC when the threshold is reached.
    pub fn vote_handler(&self, chain: &TimerChain, vote: Vote) -> XDPoSResult<()> {
        let mut state = self.state.write();
        self.vote_handler_locked(&mut state, chain, vote)
    }

    pub(crate) fn vote_handler_locked(
        &self,
        state: &mut V2State,
        chain: &TimerChain,
        vote: Vote,
    ) -> XDPoSResult<()> {
        let round = vote.proposed_block_info.round;
        if round < state.current_round {
            return Err(XDPoSError::IncomingMessageRoundNotEqualCurrent {
                kind: "vote",
                got: round,
                current: state.current_round,
            });
        }
        // One round ahead is accepted so nodes that ticked early still
        // aggregate; anything further is noise.
        if round > state.current_round + 1 {
            return Err(XDPoSError::IncomingMessageRoundTooFar {
                kind: "vote",
                got: round,
                current: state.current_round,
            });
        }

        let (count, pooled) = self.vote_pool.add(vote.clone());

        let epoch_info = match self.epochs.get_epoch_switch_info(
            chain.as_ref(),
            None,
            vote.proposed_block_info.hash,
        ) {
            Ok(info) => info,
            Err(XDPoSError::UnknownBlock) => {
                // The proposed block is still in flight; the pooled votes
                // will be re-examined when the next one arrives.
                debug!(
                    target: "xdpos::v2",
                    hash = %vote.proposed_block_info.hash,
                    pooled = count,
                    "deferring vote threshold check until block arrives"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let threshold = self.v2_config.cert_threshold_count(epoch_info.masternodes_len);
        if count < threshold {
            trace!(target: "xdpos::v2", count, threshold, round, "vote pooled");
            return Ok(());
        }

        self.verify_block_info(chain.as_ref(), &vote.proposed_block_info, None)?;

        // Threshold-triggered re-verification: stamp recovered signers on
        // the pooled snapshot, invalidating votes from outside the current
        // masternode set. Bounded fan-out, joined before the lock releases.
        let sig_hash = vote_sig_hash(&VoteForSign {
            proposed_block_info: vote.proposed_block_info.clone(),
            gap_number: vote.gap_number,
        });
        let masternodes = &epoch_info.masternodes;

        let recovered: Vec<(Address, Vec<u8>)> = pooled
            .values()
            .collect::<Vec<_>>()
            .par_iter()
            .filter_map(|pooled_vote| {
                let signer = if pooled_vote.signer != Address::ZERO {
                    pooled_vote.signer
                } else {
                    match self.recover_message_signer(sig_hash, &pooled_vote.signature) {
                        Ok(signer) => signer,
                        Err(err) => {
                            warn!(target: "xdpos::v2", %err, "dropping unrecoverable pooled vote");
                            return None;
                        }
                    }
                };
                if masternodes.contains(&signer) {
                    Some((signer, pooled_vote.signature.clone()))
                } else {
                    // Signer not in the masternode set: invalidated.
                    None
                }
            })
            .collect();

        let mut seen_signers = HashSet::new();
        let valid_signatures: Vec<Vec<u8>> = recovered
            .into_iter()
            .filter(|(signer, _)| seen_signers.insert(*signer))
            .map(|(_, signature)| signature)
            .collect();

        if valid_signatures.len() < threshold {
            debug!(
                target: "xdpos::v2",
                valid = valid_signatures.len(),
                threshold,
                "pooled votes below threshold after re-verification"
            );
            return Ok(());
        }

        let quorum_cert = QuorumCert {
            proposed_block_info: vote.proposed_block_info.clone(),
            signatures: valid_signatures,
            gap_number: vote.gap_number,
        };
        debug!(
            target: "xdpos::v2",
            round,
            number = quorum_cert.proposed_block_info.number,
            signatures = quorum_cert.signatures.len(),
            "QC minted from vote pool"
        );
        self.process_qc_locked(state, chain, quorum_cert)
    }

    /// Handle a freshly proposed block: absorb its QC, then vote for it if
    /// the HotStuff safety rule allows.
    pub fn proposed_block_handler(
        &self,
        chain: &TimerChain,
        header: &XdcHeader,
    ) -> XDPoSResult<()> {
        let mut state = self.state.write();
        if !state.is_initialized {
            return Err(XDPoSError::NotInitialized);
        }

        let fields = decode_extra_fields_v2(&header.extra_data)?;
        self.process_qc_locked(&mut state, chain, fields.quorum_cert.clone())?;

        let block_info = BlockInfo::new(header.hash_slow(), fields.round, header.number);
        if self.vote_rule_allows(&state, chain.as_ref(), header, &block_info, &fields.quorum_cert)? {
            self.send_vote_locked(&mut state, chain, header, block_info)?;
        } else {
            trace!(
                target: "xdpos::v2",
                round = fields.round,
                number = header.number,
                "voting rule rejected proposed block"
            );
        }
        Ok(())
    }

    /// The HotStuff voting safety rule.
    ///
    /// A node votes for `block_info` carrying parent certificate `qc` iff it
    /// has not voted this round, the block is for the current round, and the
    /// block either supersedes the lock QC by round or extends it by parent
    /// chain.
    pub(crate) fn vote_rule_allows(
        &self,
        state: &V2State,
        chain: &dyn ChainReader,
        header: &XdcHeader,
        block_info: &BlockInfo,
        qc: &QuorumCert,
    ) -> XDPoSResult<bool> {
        if state.current_round <= state.highest_voted_round {
            return Ok(false);
        }
        if block_info.round != state.current_round {
            return Ok(false);
        }

        let Some(lock_qc) = &state.lock_quorum_cert else {
            return Ok(true);
        };
        if qc.round() > lock_qc.round() {
            return Ok(true);
        }
        self.extends_from(chain, header, &lock_qc.proposed_block_info)
    }

    /// Whether `header` descends from `ancestor` along the parent-hash
    /// chain.
    fn extends_from(
        &self,
        chain: &dyn ChainReader,
        header: &XdcHeader,
        ancestor: &BlockInfo,
    ) -> XDPoSResult<bool> {
        if header.number < ancestor.number {
            return Ok(false);
        }

        let mut current = header.clone();
        while current.number > ancestor.number {
            current = chain
                .get_header_by_hash(current.parent_hash)
                .ok_or(XDPoSError::UnknownAncestor)?;
        }
        Ok(current.hash_slow() == ancestor.hash)
    }

    /// Sign and emit this node's vote for `block_info`.
    pub(crate) fn send_vote_locked(
        &self,
        state: &mut V2State,
        chain: &TimerChain,
        header: &XdcHeader,
        block_info: BlockInfo,
    ) -> XDPoSResult<()> {
        let epoch_info =
            self.epochs.get_epoch_switch_info(chain.as_ref(), Some(header), block_info.hash)?;
        let gap_number = self.config.gap_number(epoch_info.epoch_switch_block_info.number);

        let sig_hash = vote_sig_hash(&VoteForSign {
            proposed_block_info: block_info.clone(),
            gap_number,
        });

        let (address, signature) = {
            let signer = self.signer.read();
            let signer = signer.as_ref().ok_or(XDPoSError::NotAuthorized)?;
            (signer.address, (signer.sign_fn)(signer.address, sig_hash)?)
        };

        state.highest_voted_round = state.current_round;

        let mut vote = Vote::new(block_info, signature.to_vec(), gap_number);
        vote.signer = address;

        debug!(
            target: "xdpos::v2",
            round = vote.proposed_block_info.round,
            number = vote.proposed_block_info.number,
            gap_number,
            "sending vote"
        );

        self.vote_handler_locked(state, chain, vote.clone())?;
        self.broadcast(BroadcastMessage::Vote(vote));
        Ok(())
    }
}
