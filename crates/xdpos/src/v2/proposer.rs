//! Proposer selection and the block production pipeline.

use crate::{
    chain::ChainReader,
    errors::{XDPoSError, XDPoSResult},
    extra_data::signing_hash,
    v2::{
        engine::{TimerChain, XDPoSV2Engine},
        types::{decode_extra_fields_v2, encode_extra_fields_v2},
        Round,
    },
};
use alloy_primitives::{Address, Bytes, U256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};
use xdc_primitives::XdcHeader;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// Round-robin leader for `round`: `masternodes[round % len]`.
pub fn select_proposer(round: Round, masternodes: &[Address]) -> XDPoSResult<Address> {
    if masternodes.is_empty() {
        return Err(XDPoSError::EmptyMasternodeList);
    }
    Ok(masternodes[(round % masternodes.len() as u64) as usize])
}

/// Position of `address` in the masternode set, if elected.
pub fn masternode_index(address: &Address, masternodes: &[Address]) -> Option<usize> {
    masternodes.iter().position(|m| m == address)
}

impl XDPoSV2Engine {
    /// Whether `signer` is the leader allowed to propose on top of `parent`
    /// right now. Initializes the engine from `parent` on first use.
    pub fn your_turn(
        &self,
        chain: &TimerChain,
        parent: &XdcHeader,
        signer: Address,
    ) -> XDPoSResult<bool> {
        if !self.is_initialized() {
            self.initial(chain, parent)?;
        }

        // Mine period gate: never produce faster than the configured cadence.
        if unix_now() < parent.timestamp + self.v2_config.mine_period {
            return Ok(false);
        }

        let epoch_info =
            self.epochs.get_epoch_switch_info(chain.as_ref(), Some(parent), parent.hash_slow())?;
        let leader = select_proposer(self.current_round(), &epoch_info.masternodes)?;
        Ok(leader == signer)
    }

    /// Fill in the consensus fields of a header under construction.
    ///
    /// The candidate's parent must extend the highest QC, the authorized
    /// signer must be the round leader, and epoch-switch headers get their
    /// masternode and penalty lists computed here.
    pub fn prepare(&self, chain: &TimerChain, header: &mut XdcHeader) -> XDPoSResult<()> {
        let (current_round, highest_quorum_cert) = {
            let state = self.state.read();
            (state.current_round, state.highest_quorum_cert.clone())
        };

        if header.parent_hash != highest_quorum_cert.proposed_block_info.hash {
            return Err(XDPoSError::NotReadyToPropose);
        }

        let parent =
            chain.get_header_by_hash(header.parent_hash).ok_or(XDPoSError::UnknownAncestor)?;
        let signer = self.authorized_address().ok_or(XDPoSError::NotAuthorized)?;

        if !self.your_turn(chain, &parent, signer)? {
            return Err(XDPoSError::NotReadyToMine);
        }

        header.extra_data =
            Bytes::from(encode_extra_fields_v2(current_round, &highest_quorum_cert));
        header.difficulty = U256::from(1u64);
        header.beneficiary = signer;
        header.number = parent.number + 1;
        header.timestamp = unix_now().max(parent.timestamp + self.v2_config.mine_period);

        if self.epochs.is_epoch_switch_at_round(current_round, &parent)? {
            let (masternodes, penalties) =
                self.calc_masternodes(chain.as_ref(), parent.number + 1, current_round)?;

            let mut validators_bytes = Vec::with_capacity(masternodes.len() * 20);
            for masternode in &masternodes {
                validators_bytes.extend_from_slice(masternode.as_slice());
            }
            let mut penalties_bytes = Vec::with_capacity(penalties.len() * 20);
            for penalty in &penalties {
                penalties_bytes.extend_from_slice(penalty.as_slice());
            }

            debug!(
                target: "xdpos::v2",
                number = header.number,
                round = current_round,
                masternodes = masternodes.len(),
                penalties = penalties.len(),
                "preparing epoch switch block"
            );
            header.validators = validators_bytes.into();
            header.penalties = penalties_bytes.into();
        }

        Ok(())
    }

    /// Elect the next epoch's masternodes: frozen gap-block candidates minus
    /// penalties, capped at the configured maximum.
    pub fn calc_masternodes(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        round: Round,
    ) -> XDPoSResult<(Vec<Address>, Vec<Address>)> {
        let snapshot = self.snapshots.snapshot_for_number(chain, number)?;
        let candidates = snapshot.next_epoch_candidates.clone();

        let penalties = match &self.penalty_hook {
            Some(hook) => hook.penalties(chain, number, round, &candidates)?,
            None => Vec::new(),
        };

        let masternodes: Vec<Address> = candidates
            .into_iter()
            .filter(|c| !penalties.contains(c))
            .take(self.v2_config.max_masternodes as usize)
            .collect();

        trace!(
            target: "xdpos::v2",
            number,
            masternodes = masternodes.len(),
            penalties = penalties.len(),
            "masternodes elected"
        );
        Ok((masternodes, penalties))
    }

    /// Sign the header and write the seal into its `validator` field. A
    /// round this node already sealed is refused: one block per round per
    /// proposer.
    pub fn seal(&self, header: &mut XdcHeader) -> XDPoSResult<()> {
        let fields = decode_extra_fields_v2(&header.extra_data)?;

        let mut state = self.state.write();
        if fields.round <= state.highest_self_mined_round && state.highest_self_mined_round > 0 {
            debug!(
                target: "xdpos::v2",
                round = fields.round,
                highest_self_mined = state.highest_self_mined_round,
                "refusing to seal an already-mined round"
            );
            return Err(XDPoSError::NotReadyToMine);
        }

        let signature = {
            let signer = self.signer.read();
            let signer = signer.as_ref().ok_or(XDPoSError::NotAuthorized)?;
            if header.beneficiary != signer.address {
                return Err(XDPoSError::CoinbaseMismatch);
            }
            (signer.sign_fn)(signer.address, signing_hash(header))?
        };

        header.validator = Bytes::from(signature.to_vec());
        state.highest_self_mined_round = fields.round;

        debug!(target: "xdpos::v2", round = fields.round, number = header.number, "sealed block");
        Ok(())
    }
}
