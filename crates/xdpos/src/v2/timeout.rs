//! Timeout verification, pooling, TC assembly and the countdown callback.

use crate::{
    errors::{XDPoSError, XDPoSResult},
    extra_data::unique_signatures,
    v2::{
        engine::{TimerChain, V2State, XDPoSV2Engine},
        types::timeout_sig_hash,
        BroadcastMessage, SyncInfo, Timeout, TimeoutCert, TimeoutForSign,
    },
};
use std::time::Instant;
use tracing::{debug, trace, warn};

impl XDPoSV2Engine {
    /// Wire-level timeout verification, run before the engine lock.
    ///
    /// Stale rounds and non-masternode signers yield `Ok(false)` without
    /// error; only snapshot-store failures surface.
    pub fn verify_timeout_message(
        &self,
        chain: &dyn crate::chain::ChainReader,
        timeout: &mut Timeout,
    ) -> XDPoSResult<bool> {
        let current_round = self.state.read().current_round;
        if timeout.round < current_round {
            trace!(
                target: "xdpos::v2",
                timeout_round = timeout.round,
                current_round,
                "dropping stale timeout"
            );
            return Ok(false);
        }

        let snapshot = self.snapshots.snapshot_at_gap_number(chain, timeout.gap_number)?;

        let sig_hash =
            timeout_sig_hash(&TimeoutForSign { round: timeout.round, gap_number: timeout.gap_number });
        let signer = self.recover_message_signer(sig_hash, &timeout.signature)?;
        timeout.signer = signer;

        Ok(snapshot.next_epoch_candidates.contains(&signer))
    }

    /// Pool a verified timeout and mint a TC when the threshold is reached.
    pub fn timeout_handler(&self, chain: &TimerChain, timeout: Timeout) -> XDPoSResult<()> {
        let mut state = self.state.write();
        self.timeout_handler_locked(&mut state, chain, timeout)
    }

    pub(crate) fn timeout_handler_locked(
        &self,
        state: &mut V2State,
        chain: &TimerChain,
        timeout: Timeout,
    ) -> XDPoSResult<()> {
        if timeout.round < state.current_round {
            return Err(XDPoSError::IncomingMessageRoundNotEqualCurrent {
                kind: "timeout",
                got: timeout.round,
                current: state.current_round,
            });
        }
        if timeout.round > state.current_round + 1 {
            return Err(XDPoSError::IncomingMessageRoundTooFar {
                kind: "timeout",
                got: timeout.round,
                current: state.current_round,
            });
        }

        let (count, pooled) = self.timeout_pool.add(timeout.clone());

        let head = chain.current_header();
        let epoch_info =
            self.epochs.epoch_switch_info_by_round(chain.as_ref(), &head, timeout.round)?;
        let threshold = self.v2_config.cert_threshold_count(epoch_info.masternodes_len);

        if count < threshold {
            trace!(target: "xdpos::v2", count, threshold, round = timeout.round, "timeout pooled");
            return Ok(());
        }

        let signatures: Vec<Vec<u8>> =
            pooled.values().map(|pooled_timeout| pooled_timeout.signature.clone()).collect();
        let (unique, duplicates) = unique_signatures(&signatures);
        if !duplicates.is_empty() {
            warn!(
                target: "xdpos::v2",
                duplicates = duplicates.len(),
                round = timeout.round,
                "duplicate signatures in timeout pool"
            );
        }

        let timeout_cert = TimeoutCert {
            round: timeout.round,
            signatures: unique,
            gap_number: timeout.gap_number,
        };
        debug!(
            target: "xdpos::v2",
            round = timeout_cert.round,
            signatures = timeout_cert.signatures.len(),
            "TC minted from timeout pool"
        );
        self.process_tc_locked(state, chain, timeout_cert);
        Ok(())
    }

    /// Countdown fire handler: masternodes emit a timeout for the current
    /// round, and every `timeout_sync_threshold` consecutive fires a
    /// `SyncInfo` goes out as well.
    pub fn on_countdown_timeout(&self, _now: Instant, chain: &TimerChain) -> XDPoSResult<()> {
        let mut state = self.state.write();
        if !state.is_initialized {
            return Ok(());
        }

        let Some(address) = self.signer.read().as_ref().map(|s| s.address) else {
            // Observer node: nothing to sign with.
            return Ok(());
        };

        let head = chain.current_header();
        let epoch_info =
            self.epochs.get_epoch_switch_info(chain.as_ref(), Some(&head), head.hash_slow())?;
        if !epoch_info.masternodes.contains(&address) {
            trace!(target: "xdpos::v2", signer = %address, "not a masternode this epoch; staying quiet");
            return Ok(());
        }

        state.timeout_count += 1;
        if state.timeout_count % self.v2_config.timeout_sync_threshold == 0 {
            debug!(
                target: "xdpos::v2",
                timeout_count = state.timeout_count,
                "broadcasting sync info after repeated timeouts"
            );
            // A round-0 TC is the engine default, not a certificate this
            // node ever assembled; peers get "no TC" instead.
            let highest_timeout_cert = (state.highest_timeout_cert.round > 0)
                .then(|| state.highest_timeout_cert.clone());
            self.broadcast(BroadcastMessage::SyncInfo(SyncInfo {
                highest_quorum_cert: state.highest_quorum_cert.clone(),
                highest_timeout_cert,
            }));
        }

        self.send_timeout_locked(&mut state, chain, &head)
    }

    /// Sign and emit this node's timeout for the current round.
    pub(crate) fn send_timeout_locked(
        &self,
        state: &mut V2State,
        chain: &TimerChain,
        head: &xdc_primitives::XdcHeader,
    ) -> XDPoSResult<()> {
        let epoch_info =
            self.epochs.get_epoch_switch_info(chain.as_ref(), Some(head), head.hash_slow())?;

        // When the pending round opens a new epoch, the gap is anchored at
        // the prospective block instead of the current epoch-switch block.
        let base = if self.epochs.is_epoch_switch_at_round(state.current_round, head)? {
            head.number + 1
        } else {
            epoch_info.epoch_switch_block_info.number
        };
        let gap_number = self.config.gap_number(base);

        let sig_hash =
            timeout_sig_hash(&TimeoutForSign { round: state.current_round, gap_number });

        let (address, signature) = {
            let signer = self.signer.read();
            let signer = signer.as_ref().ok_or(XDPoSError::NotAuthorized)?;
            (signer.address, (signer.sign_fn)(signer.address, sig_hash)?)
        };

        let mut timeout = Timeout::new(state.current_round, signature.to_vec(), gap_number);
        timeout.signer = address;

        debug!(
            target: "xdpos::v2",
            round = timeout.round,
            gap_number,
            timeout_count = state.timeout_count,
            "sending timeout"
        );

        self.timeout_handler_locked(state, chain, timeout.clone())?;
        self.broadcast(BroadcastMessage::Timeout(timeout));
        Ok(())
    }
}
