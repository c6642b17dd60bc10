//! Shared fixtures for the crate's tests: a bootstrapped processor
//! with a funded treasury account, helpers for forging valid blocks,
//! and peer doubles for the download and fork paths.

use std::sync::Arc;

use ember_config::Config;
use ember_crypto::{Hash, KeyPair, PublicKey, Sha256Builder, Signature};
use ember_data_model::{
    block::{Block, ChainedBlock},
    constants::{genesis, ChainParams, Network, MAX_BALANCE_UNITS, ONE_EMBER},
    transaction::{Attachment, Transaction, TransactionBuilder},
    AccountId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::{
    peers::{Peer, PeerRequest},
    processor::BlockchainProcessor,
};

/// A bootstrapped testnet node whose genesis allocates the entire
/// supply to `treasury`, with `forger` on the fake-forging allowlist
/// so tests need not win the stake lottery.
pub(crate) struct TestBench {
    pub processor: Arc<BlockchainProcessor>,
    pub forger: KeyPair,
    pub treasury: KeyPair,
}

/// Every bench shares the same genesis and forger identity, so blocks
/// forged on one bench push cleanly on another; tests simulating
/// independent nodes just build two benches.
pub(crate) fn bench() -> TestBench {
    let forger = KeyPair::from_secret_phrase("test forger");
    let treasury = KeyPair::from_secret_phrase("test treasury");

    let config = Config {
        network: Network::Testnet,
        fake_forging_keys: vec![forger.public_key().to_string()],
        ..Config::default()
    };
    let processor = BlockchainProcessor::with_genesis(&config, test_genesis());
    processor.init(false).expect("test genesis bootstraps");

    TestBench {
        processor,
        forger,
        treasury,
    }
}

/// A single-payment genesis: the whole supply to the treasury account.
pub(crate) fn test_genesis() -> Arc<Block> {
    let creator = PublicKey::from_bytes(genesis::CREATOR_PUBLIC_KEY);
    let treasury = KeyPair::from_secret_phrase("test treasury");
    let allocation = TransactionBuilder::new(0, Attachment::Payment, creator, 0, 0)
        .recipient(AccountId::from_public_key(&treasury.public_key()))
        .amount(MAX_BALANCE_UNITS)
        .fee(0)
        .presigned(Signature::zeroed());

    let bytes = allocation.bytes();
    let block = Block::presigned(
        1,
        0,
        None,
        None,
        MAX_BALANCE_UNITS,
        0,
        bytes.len() as u32,
        Hash::new(&bytes),
        creator,
        vec![0; 64],
        Signature::zeroed(),
        vec![Arc::new(allocation)],
        Some(ChainParams::for_network(Network::Testnet).genesis_block_id),
    )
    .expect("test genesis is well formed");
    Arc::new(block)
}

/// A version-0 payment, timestamped for inclusion in a block forged at
/// `timestamp`.
pub(crate) fn payment(
    sender: &KeyPair,
    recipient: AccountId,
    amount: i64,
    timestamp: u32,
) -> Arc<Transaction> {
    Arc::new(
        TransactionBuilder::new(0, Attachment::Payment, sender.public_key(), timestamp, 1440)
            .recipient(recipient)
            .amount(amount)
            .fee(ONE_EMBER)
            .sign(sender),
    )
}

/// Assemble a valid block on top of `previous`, with a proper
/// version-1 generation signature chain.
pub(crate) fn forge_on(
    previous: &ChainedBlock,
    forger: &KeyPair,
    timestamp: u32,
    transactions: Vec<Arc<Transaction>>,
) -> Arc<Block> {
    let mut digest = Sha256Builder::new();
    let mut payload_length = 0;
    let mut total_amount = 0;
    let mut total_fee = 0;
    for tx in &transactions {
        let bytes = tx.bytes();
        payload_length += bytes.len() as u32;
        total_amount += tx.amount();
        total_fee += tx.fee();
        digest.update(bytes);
    }

    let generation_signature = forger
        .sign(previous.block().generation_signature())
        .as_ref()
        .to_vec();

    Arc::new(
        Block::forge(
            1,
            timestamp,
            previous.id(),
            None,
            total_amount,
            total_fee,
            payload_length,
            digest.finalize(),
            generation_signature,
            transactions,
            forger,
        )
        .expect("forged test block is well formed"),
    )
}

/// Forge and push one block on the bench's head.
pub(crate) fn push_next(
    bench: &TestBench,
    timestamp: u32,
    transactions: Vec<Arc<Transaction>>,
) -> Arc<Block> {
    let previous = bench.processor.db().last_block().expect("bootstrapped");
    let block = forge_on(&previous, &bench.forger, timestamp, transactions);
    bench
        .processor
        .push_block(Arc::clone(&block))
        .expect("forged test block pushes");
    block
}

/// A peer double that records blacklisting and answers nothing.
#[derive(Debug, Default)]
pub(crate) struct RecordingPeer {
    pub blacklisted: Mutex<Option<String>>,
}

impl Peer for RecordingPeer {
    fn announced_address(&self) -> Option<String> {
        Some("peer.test:7874".into())
    }

    fn send(&self, _request: &PeerRequest) -> Option<Value> {
        None
    }

    fn blacklist(&self, cause: &str) {
        *self.blacklisted.lock() = Some(cause.to_owned());
    }
}

impl RecordingPeer {
    pub fn was_blacklisted(&self) -> bool {
        self.blacklisted.lock().is_some()
    }
}

/// A peer backed by another processor's store: answers the download
/// protocol the way a remote node would.
#[derive(Debug)]
pub(crate) struct ProcessorPeer {
    pub remote: Arc<BlockchainProcessor>,
    pub blacklisted: Mutex<Option<String>>,
}

impl ProcessorPeer {
    pub fn new(remote: Arc<BlockchainProcessor>) -> Self {
        Self {
            remote,
            blacklisted: Mutex::new(None),
        }
    }

    pub fn was_blacklisted(&self) -> bool {
        self.blacklisted.lock().is_some()
    }
}

impl Peer for ProcessorPeer {
    fn announced_address(&self) -> Option<String> {
        Some("remote.test:7874".into())
    }

    fn send(&self, request: &PeerRequest) -> Option<Value> {
        let db = self.remote.db();
        match request {
            PeerRequest::GetCumulativeDifficulty => {
                let head = db.last_block()?;
                Some(json!({
                    "cumulativeDifficulty": head.cumulative_difficulty().to_string(),
                    "blockchainHeight": head.height(),
                }))
            }
            PeerRequest::GetMilestoneBlockIds { .. } => {
                // Small test chains fit in one milestone response.
                let ids: Vec<String> = (0..)
                    .map_while(|height| db.block_at(height))
                    .map(|block| block.id().to_string())
                    .collect();
                Some(json!({ "milestoneBlockIds": ids, "last": true }))
            }
            PeerRequest::GetNextBlockIds { block_id } => {
                let ids: Vec<String> = db
                    .block_ids_after(*block_id, 1440)
                    .into_iter()
                    .map(|id| id.to_string())
                    .collect();
                Some(json!({ "nextBlockIds": ids }))
            }
            PeerRequest::GetNextBlocks { block_id } => {
                let blocks: Vec<Value> = db
                    .block_ids_after(*block_id, 1440)
                    .into_iter()
                    .filter_map(|id| db.wire_block(id))
                    .map(|block| serde_json::to_value(Block::clone(&block)).expect("serializes"))
                    .collect();
                Some(json!({ "nextBlocks": blocks }))
            }
        }
    }

    fn blacklist(&self, cause: &str) {
        *self.blacklisted.lock() = Some(cause.to_owned());
    }
}
