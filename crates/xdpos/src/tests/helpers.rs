//! Mock chain, keyed signers and chain builders for consensus tests.

use crate::{
    chain::ChainReader,
    config::{V2Config, XDPoSConfig},
    extra_data::{address_of_secret, sign_hash, EXTRA_SEAL, EXTRA_VANITY},
    v2::{
        types::{encode_extra_fields_v2, timeout_sig_hash, vote_sig_hash},
        BlockInfo, QuorumCert, Round, Timeout, TimeoutForSign, Vote, VoteForSign,
    },
};
use alloy_primitives::{Address, Bytes, B256};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use xdc_primitives::{XdcBlock, XdcHeader};

/// A test account with a known secret key.
#[derive(Debug, Clone)]
pub(crate) struct TestSigner {
    pub secret: [u8; 32],
    pub address: Address,
}

impl TestSigner {
    pub fn new(seed: u8) -> Self {
        let secret = [seed; 32];
        let address = address_of_secret(&secret).expect("non-zero seed is a valid secret");
        Self { secret, address }
    }

    /// Sign a vote for `block_info` at `gap_number`.
    pub fn vote(&self, block_info: BlockInfo, gap_number: u64) -> Vote {
        let sig_hash = vote_sig_hash(&VoteForSign {
            proposed_block_info: block_info.clone(),
            gap_number,
        });
        let signature = sign_hash(&self.secret, &sig_hash).expect("signing succeeds");
        Vote::new(block_info, signature.to_vec(), gap_number)
    }

    /// Sign a timeout for `round` at `gap_number`.
    pub fn timeout(&self, round: Round, gap_number: u64) -> Timeout {
        let sig_hash = timeout_sig_hash(&TimeoutForSign { round, gap_number });
        let signature = sign_hash(&self.secret, &sig_hash).expect("signing succeeds");
        Timeout::new(round, signature.to_vec(), gap_number)
    }

    /// An engine-compatible signing function for this account.
    pub fn sign_fn(&self) -> crate::chain::SignFn {
        let secret = self.secret;
        Box::new(move |_, hash| sign_hash(&secret, &hash))
    }
}

/// Deterministic test accounts with distinct addresses.
pub(crate) fn test_signers(count: usize) -> Vec<TestSigner> {
    (0..count).map(|i| TestSigner::new(i as u8 + 1)).collect()
}

/// In-memory [`ChainReader`].
#[derive(Debug)]
pub(crate) struct MockChain {
    config: XDPoSConfig,
    headers: RwLock<HashMap<B256, XdcHeader>>,
    by_number: RwLock<BTreeMap<u64, B256>>,
    blocks: RwLock<HashMap<B256, XdcBlock>>,
}

impl MockChain {
    pub fn new(config: XDPoSConfig) -> Self {
        Self {
            config,
            headers: RwLock::new(HashMap::new()),
            by_number: RwLock::new(BTreeMap::new()),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a header, indexing it canonically by number.
    pub fn insert_header(&self, header: XdcHeader) -> B256 {
        let hash = header.hash_slow();
        self.by_number.write().insert(header.number, hash);
        self.headers.write().insert(hash, header);
        hash
    }

    /// Insert a full block (and its header).
    pub fn insert_block(&self, block: XdcBlock) -> B256 {
        let hash = self.insert_header(block.header.clone());
        self.blocks.write().insert(hash, block);
        hash
    }

}

impl ChainReader for MockChain {
    fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    fn current_header(&self) -> XdcHeader {
        let by_number = self.by_number.read();
        let (_, hash) = by_number.iter().next_back().expect("mock chain is never empty");
        self.headers.read().get(hash).expect("indexed header exists").clone()
    }

    fn get_header(&self, hash: B256, _number: u64) -> Option<XdcHeader> {
        self.headers.read().get(&hash).cloned()
    }

    fn get_header_by_hash(&self, hash: B256) -> Option<XdcHeader> {
        self.headers.read().get(&hash).cloned()
    }

    fn get_header_by_number(&self, number: u64) -> Option<XdcHeader> {
        let hash = *self.by_number.read().get(&number)?;
        self.headers.read().get(&hash).cloned()
    }

    fn get_block(&self, hash: B256, _number: u64) -> Option<XdcBlock> {
        if let Some(block) = self.blocks.read().get(&hash) {
            return Some(block.clone());
        }
        // Headers without an explicit body behave as empty blocks.
        self.headers.read().get(&hash).map(|h| XdcBlock::new(h.clone(), Vec::new()))
    }
}

/// V1 extra data: `vanity || signers || seal`.
pub(crate) fn v1_extra(signers: &[Address]) -> Bytes {
    let mut extra = vec![0u8; EXTRA_VANITY];
    for signer in signers {
        extra.extend_from_slice(signer.as_slice());
    }
    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
    extra.into()
}

fn addresses_bytes(addresses: &[Address]) -> Bytes {
    let mut raw = Vec::with_capacity(addresses.len() * 20);
    for address in addresses {
        raw.extend_from_slice(address.as_slice());
    }
    raw.into()
}

/// Builds a coherent V1 + V2 chain inside a [`MockChain`].
///
/// V2 block `switch_block + k` carries round `k`; certificate signatures are
/// produced with the builder's signers so full verification passes.
pub(crate) struct TestChainBuilder {
    epoch: u64,
    gap: u64,
    switch_block: u64,
    v2_len: u64,
    signers: Vec<TestSigner>,
    masternodes: Option<Vec<Address>>,
    penalties: Vec<Address>,
}

impl TestChainBuilder {
    pub fn new(epoch: u64, v2_len: u64, switch_block: u64) -> Self {
        Self {
            epoch,
            gap: epoch / 2,
            switch_block,
            v2_len,
            signers: test_signers(3),
            masternodes: None,
            penalties: Vec::new(),
        }
    }

    pub fn signers(mut self, signers: Vec<TestSigner>) -> Self {
        self.signers = signers;
        self
    }

    pub fn masternodes(mut self, masternodes: Vec<Address>) -> Self {
        self.masternodes = Some(masternodes);
        self
    }

    pub fn penalties(mut self, penalties: Vec<Address>) -> Self {
        self.penalties = penalties;
        self
    }

    pub fn config(&self) -> XDPoSConfig {
        XDPoSConfig {
            epoch: self.epoch,
            gap: self.gap,
            period: 2,
            reward: 250,
            reward_checkpoint: self.epoch,
            foundation_wallet: Address::with_last_byte(0xFF),
            v2: Some(V2Config {
                switch_block: self.switch_block,
                mine_period: 2,
                timeout_period: 10,
                ..V2Config::default()
            }),
        }
    }

    fn masternode_addresses(&self) -> Vec<Address> {
        self.masternodes
            .clone()
            .unwrap_or_else(|| self.signers.iter().map(|s| s.address).collect())
    }

    /// Epoch-switch block number governing a V2 block at `round`.
    fn epoch_switch_number(&self, round: Round) -> u64 {
        if round < self.epoch {
            self.switch_block + 1
        } else {
            self.switch_block + (round - round % self.epoch)
        }
    }

    pub fn build(self) -> MockChain {
        let config = self.config().validate().expect("test config is valid");
        let chain = MockChain::new(config.clone());
        let masternodes = self.masternode_addresses();
        let masternode_bytes = addresses_bytes(&masternodes);
        let threshold =
            config.v2.as_ref().expect("v2 configured").cert_threshold_count(masternodes.len());

        let is_gap_block = |number: u64| number % self.epoch == self.epoch - self.gap;

        // V1 segment: genesis through the switch block.
        let mut parent_hash = B256::ZERO;
        for number in 0..=self.switch_block {
            let checkpoint = number % self.epoch == 0;
            let mut header = XdcHeader {
                number,
                parent_hash,
                timestamp: 1000 + number * 2,
                gas_limit: 8_000_000,
                extra_data: if checkpoint {
                    v1_extra(&masternodes)
                } else {
                    v1_extra(&[])
                },
                ..Default::default()
            };
            if checkpoint || is_gap_block(number) {
                header.validators = masternode_bytes.clone();
            }
            parent_hash = chain.insert_header(header);
        }

        // V2 segment: block switch + k carries round k.
        let mut parent_info = BlockInfo::new(parent_hash, 0, self.switch_block);
        for round in 1..=self.v2_len {
            let number = self.switch_block + round;
            let gap_number = if parent_info.number == self.switch_block {
                config.gap_number(self.switch_block)
            } else {
                config.gap_number(self.epoch_switch_number(parent_info.round))
            };

            let mut quorum_cert = QuorumCert::new(parent_info.clone(), gap_number);
            if parent_info.round > 0 {
                let sig_hash = vote_sig_hash(&VoteForSign {
                    proposed_block_info: parent_info.clone(),
                    gap_number,
                });
                for signer in self.signers.iter().take(threshold) {
                    let signature =
                        sign_hash(&signer.secret, &sig_hash).expect("signing succeeds");
                    quorum_cert.signatures.push(signature.to_vec());
                }
            }

            let epoch_switch =
                parent_info.number == self.switch_block || round % self.epoch == 0;
            let mut header = XdcHeader {
                number,
                parent_hash: parent_info.hash,
                timestamp: 1000 + number * 2,
                gas_limit: 8_000_000,
                difficulty: alloy_primitives::U256::from(1u64),
                extra_data: encode_extra_fields_v2(round, &quorum_cert).into(),
                validator: Bytes::from(vec![0u8; EXTRA_SEAL]),
                ..Default::default()
            };
            if epoch_switch {
                header.validators = masternode_bytes.clone();
                header.penalties = addresses_bytes(&self.penalties);
            } else if is_gap_block(number) {
                header.validators = masternode_bytes.clone();
            }

            let hash = chain.insert_header(header);
            parent_info = BlockInfo::new(hash, round, number);
        }

        chain
    }
}

/// A V1+V2 chain with default signers: epoch `epoch`, switch at
/// `switch_block`, `v2_len` V2 blocks on top.
pub(crate) fn v2_chain_with_epoch(epoch: u64, v2_len: u64, switch_block: u64) -> MockChain {
    TestChainBuilder::new(epoch, v2_len, switch_block).build()
}
