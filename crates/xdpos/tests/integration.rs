//! End-to-end consensus flow over the public API: a four-masternode network
//! simulated through one engine, producing blocks round by round, verifying
//! them, aggregating votes into QCs and committing via the 3-chain rule.

use alloy_primitives::{Address, B256, U256};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use xdpos::{
    address_of_secret, sign_hash,
    chain::{ChainReader, MemoryDb, SignFn, StateDb},
    v2::types::vote_sig_hash,
    BlockInfo, SharedChain, V2Config, Vote, XDPoSConfig, XDPoSConsensus,
};
use xdc_primitives::{XdcBlock, XdcHeader};

const EPOCH: u64 = 10;
const GAP: u64 = 5;
const SWITCH: u64 = 900;

struct Account {
    secret: [u8; 32],
    address: Address,
}

impl Account {
    fn new(seed: u8) -> Self {
        let secret = [seed; 32];
        let address = address_of_secret(&secret).expect("valid secret");
        Self { secret, address }
    }

    fn sign_fn(&self) -> SignFn {
        let secret = self.secret;
        Box::new(move |_, hash| sign_hash(&secret, &hash))
    }

    fn vote(&self, block_info: BlockInfo, gap_number: u64) -> Vote {
        let sig_hash = vote_sig_hash(&xdpos::v2::VoteForSign {
            proposed_block_info: block_info.clone(),
            gap_number,
        });
        let signature = sign_hash(&self.secret, &sig_hash).expect("signing succeeds");
        Vote::new(block_info, signature.to_vec(), gap_number)
    }
}

struct TestChain {
    config: XDPoSConfig,
    headers: RwLock<HashMap<B256, XdcHeader>>,
    by_number: RwLock<BTreeMap<u64, B256>>,
}

impl TestChain {
    fn insert(&self, header: XdcHeader) -> B256 {
        let hash = header.hash_slow();
        self.by_number.write().insert(header.number, hash);
        self.headers.write().insert(hash, header);
        hash
    }
}

impl ChainReader for TestChain {
    fn config(&self) -> &XDPoSConfig {
        &self.config
    }

    fn current_header(&self) -> XdcHeader {
        let by_number = self.by_number.read();
        let (_, hash) = by_number.iter().next_back().expect("chain is never empty");
        self.headers.read()[hash].clone()
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
        self.headers.read().get(&hash).map(|h| XdcBlock::new(h.clone(), Vec::new()))
    }
}

struct NullState;

impl StateDb for NullState {
    fn get_state(&self, _addr: Address, _key: B256) -> B256 {
        B256::ZERO
    }

    fn add_balance(&mut self, _addr: Address, _amount: U256) {}

    fn intermediate_root(&mut self, _delete_empty_objects: bool) -> B256 {
        B256::with_last_byte(0x42)
    }
}

fn network_config() -> XDPoSConfig {
    XDPoSConfig {
        epoch: EPOCH,
        gap: GAP,
        reward_checkpoint: EPOCH,
        v2: Some(V2Config {
            switch_block: SWITCH,
            // No artificial wait between blocks in tests, and a countdown
            // long enough to never fire mid-test.
            mine_period: 0,
            timeout_period: 600,
            ..V2Config::default()
        }),
        ..Default::default()
    }
}

/// Build the V1 segment `0..=SWITCH` with the masternode set planted at
/// genesis, checkpoints and gap blocks.
fn v1_segment(config: XDPoSConfig, masternodes: &[Address]) -> TestChain {
    let chain = TestChain {
        config,
        headers: RwLock::new(HashMap::new()),
        by_number: RwLock::new(BTreeMap::new()),
    };

    let mut masternode_bytes = Vec::new();
    for masternode in masternodes {
        masternode_bytes.extend_from_slice(masternode.as_slice());
    }

    let mut parent_hash = B256::ZERO;
    for number in 0..=SWITCH {
        let checkpoint = number % EPOCH == 0;

        let mut extra = vec![0u8; 32];
        if checkpoint {
            extra.extend_from_slice(&masternode_bytes);
        }
        extra.extend_from_slice(&[0u8; 65]);

        let mut header = XdcHeader {
            number,
            parent_hash,
            timestamp: 1000 + number * 2,
            gas_limit: 8_000_000,
            extra_data: extra.into(),
            ..Default::default()
        };
        if checkpoint || number % EPOCH == EPOCH - GAP {
            header.validators = masternode_bytes.clone().into();
        }
        parent_hash = chain.insert(header);
    }

    chain
}

#[test]
fn four_masternodes_produce_verify_vote_and_commit() {
    let accounts: Vec<Account> = (1..=4).map(Account::new).collect();
    let masternodes: Vec<Address> = accounts.iter().map(|a| a.address).collect();

    let chain = Arc::new(v1_segment(network_config(), &masternodes));
    let shared: SharedChain = Arc::clone(&chain) as SharedChain;

    let consensus = XDPoSConsensus::new(network_config(), Arc::new(MemoryDb::new()))
        .expect("engine builds");

    let head = chain.get_header_by_number(SWITCH).unwrap();
    consensus.initial(&shared, &head).unwrap();
    assert_eq!(consensus.get_current_round().unwrap(), 1);

    // Drive five rounds of block production.
    for round in 1..=5u64 {
        let leader = &accounts[(round % 4) as usize];
        consensus.authorize(leader.address, leader.sign_fn()).unwrap();

        let highest_qc = consensus.get_highest_quorum_cert().unwrap();
        assert!(
            consensus
                .your_turn(&shared, &chain.get_header_by_hash(highest_qc.proposed_block_info.hash).unwrap(), leader.address)
                .unwrap(),
            "round {round} leader is deterministic"
        );

        let mut header = XdcHeader {
            parent_hash: highest_qc.proposed_block_info.hash,
            ..Default::default()
        };
        consensus.prepare(&shared, &mut header).unwrap();

        let mut state = NullState;
        let parent_state = NullState;
        let block = consensus
            .finalize(chain.as_ref(), &mut header, &mut state, &parent_state, Vec::new())
            .unwrap();
        assert_eq!(block.header.state_root, B256::with_last_byte(0x42));

        let mut sealed = block.header.clone();
        consensus.seal(&mut sealed).unwrap();

        // The sealed block verifies in full and lands on every node's chain.
        consensus.verify_header(chain.as_ref(), &sealed, true).unwrap();
        let hash = chain.insert(sealed.clone());
        assert_eq!(consensus.author(&sealed).unwrap(), leader.address);

        // The leader votes through the proposed-block path, two peers by
        // wire votes; the third distinct vote mints the QC and advances the
        // round.
        consensus.proposed_block_handler(&shared, &sealed).unwrap();

        let block_info = BlockInfo::new(hash, round, SWITCH + round);
        let gap_number = 895;
        for peer in accounts.iter().filter(|a| a.address != leader.address).take(2) {
            let mut vote = peer.vote(block_info.clone(), gap_number);
            assert!(consensus.verify_vote_message(chain.as_ref(), &mut vote).unwrap());
            consensus.vote_handler(&shared, vote).unwrap();
        }

        assert_eq!(
            consensus.get_current_round().unwrap(),
            round + 1,
            "QC for round {round} advances the engine"
        );
        assert_eq!(consensus.get_highest_quorum_cert().unwrap().round(), round);
    }

    // 3-chain rule: the QC for round 5 commits the block of round 3.
    let committed = consensus.get_latest_committed_block_info().unwrap().unwrap();
    assert_eq!(committed.number, SWITCH + 3);
    assert_eq!(committed.round, 3);

    consensus.shutdown();
}

#[test]
fn verify_headers_batch_matches_individual_results() {
    let accounts: Vec<Account> = (1..=4).map(Account::new).collect();
    let masternodes: Vec<Address> = accounts.iter().map(|a| a.address).collect();
    let chain = Arc::new(v1_segment(network_config(), &masternodes));

    let consensus = XDPoSConsensus::new(network_config(), Arc::new(MemoryDb::new()))
        .expect("engine builds");

    let headers: Vec<XdcHeader> =
        (890..=900).map(|n| chain.get_header_by_number(n).unwrap()).collect();

    let batch = consensus.verify_headers(chain.as_ref(), &headers, false);
    assert_eq!(batch.len(), headers.len());
    for (header, result) in headers.iter().zip(batch) {
        assert_eq!(
            result.is_ok(),
            consensus.verify_header(chain.as_ref(), header, false).is_ok(),
            "batch result diverges for block {}",
            header.number
        );
    }

    consensus.shutdown();
}
