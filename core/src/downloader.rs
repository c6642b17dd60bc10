//! The block download loop.
//!
//! A dedicated thread ticks once a second. Each tick picks one random
//! announced peer, compares cumulative difficulty, bisects toward a
//! common ancestor with milestone ids, refines it by walking forward
//! ids, then fetches blocks in bounded rounds: contiguous blocks are
//! pushed directly, everything else accumulates as a fork candidate
//! list handed to the fork reconciler.
//!
//! The loop never holds the blockchain lock across peer I/O. Peer
//! faults are answered locally (skip or blacklist); only store
//! inconsistency is fatal, and then the process is taken down — chain
//! state is not recoverable past a failed commit.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use ember_data_model::{
    block::{parse_block, Block},
    BlockId, ValidationError,
};
use ember_logger::prelude::*;
use num_bigint::BigUint;
use rand::seq::IteratorRandom;
use serde_json::Value;

use crate::{
    peers::{
        CumulativeDifficultyResponse, MilestoneBlockIdsResponse, NextBlockIdsResponse,
        NextBlocksResponse, Peer, PeerNetwork, PeerRequest,
    },
    processor::{BlockchainProcessor, Fatal, PushError},
};

/// Forks whose common ancestor is deeper than this are ignored.
const MAX_FORK_DEPTH: u32 = 720;
/// Fetch rounds per tick.
const MAX_FETCH_ROUNDS: usize = 10;
/// Blocks collected per tick across all rounds.
const MAX_BLOCKS_PER_TICK: usize = 1440;
/// Cap a single response may carry; more is a protocol violation.
const MAX_BLOCKS_PER_RESPONSE: usize = 1440;
const MAX_NEXT_BLOCK_IDS: usize = 1440;
const MAX_MILESTONE_IDS: usize = 20;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the download thread.
pub struct Downloader {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Downloader {
    /// Spawn the loop.
    pub fn start(processor: Arc<BlockchainProcessor>, network: Arc<dyn PeerNetwork>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("blocks-downloader".to_owned())
            .spawn(move || Self::run(&processor, network.as_ref(), &thread_stop))
            .expect("OS refused to spawn the downloader thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn run(processor: &BlockchainProcessor, network: &dyn PeerNetwork, stop: &AtomicBool) {
        info!("block download loop running");
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(TICK_INTERVAL);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if !processor.get_more_blocks() {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| tick(processor, network))) {
                Ok(Ok(())) => {}
                Ok(Err(fatal)) => {
                    error!(%fatal, "fatal error in block download, shutting the node down");
                    std::process::exit(1);
                }
                Err(_) => {
                    error!("block download tick panicked, shutting the node down");
                    std::process::exit(1);
                }
            }
        }
        info!("block download loop stopped");
    }

    /// Signal the loop to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// One synchronization attempt against one peer.
fn tick(processor: &BlockchainProcessor, network: &dyn PeerNetwork) -> Result<(), Fatal> {
    let Some(peer) = network
        .connected_peers()
        .into_iter()
        .filter(|peer| peer.announced_address().is_some())
        .choose(&mut rand::thread_rng())
    else {
        return Ok(());
    };
    let Some(address) = peer.announced_address() else {
        return Ok(());
    };

    let Some(response) = peer.send(&PeerRequest::GetCumulativeDifficulty) else {
        return Ok(());
    };
    let probe: CumulativeDifficultyResponse = match serde_json::from_value(response) {
        Ok(probe) => probe,
        Err(_) => {
            peer.blacklist("malformed cumulative difficulty response");
            return Ok(());
        }
    };
    let Ok(peer_difficulty) = BigUint::from_str(&probe.cumulative_difficulty) else {
        peer.blacklist("cumulative difficulty is not a decimal number");
        return Ok(());
    };

    let our_difficulty = processor
        .db()
        .last_block()
        .map(|head| head.cumulative_difficulty().clone())
        .unwrap_or_default();
    if peer_difficulty <= our_difficulty {
        return Ok(());
    }
    processor.set_last_blockchain_feeder(address, probe.blockchain_height.unwrap_or_default());

    let Some(milestone_id) = common_milestone_id(processor, peer.as_ref()) else {
        return Ok(());
    };
    let Some(common_id) = common_block_id(processor, peer.as_ref(), milestone_id) else {
        return Ok(());
    };
    let (Some(common), Some(head)) = (processor.db().block(common_id), processor.db().last_block())
    else {
        return Ok(());
    };
    if head.height().saturating_sub(common.height()) >= MAX_FORK_DEPTH {
        warn!(
            common_height = common.height(),
            head_height = head.height(),
            "peer fork is deeper than the rollback horizon, ignoring",
        );
        return Ok(());
    }

    let mut cursor = common_id;
    let mut fork_blocks: Vec<Arc<Block>> = Vec::new();
    let mut collected = 0_usize;

    'rounds: for _ in 0..MAX_FETCH_ROUNDS {
        if collected >= MAX_BLOCKS_PER_TICK {
            break;
        }
        let Some(response) = peer.send(&PeerRequest::GetNextBlocks { block_id: cursor }) else {
            break;
        };
        let batch: NextBlocksResponse = match serde_json::from_value(response) {
            Ok(batch) => batch,
            Err(_) => {
                peer.blacklist("malformed next blocks response");
                return Ok(());
            }
        };
        if batch.next_blocks.is_empty() {
            break;
        }
        if batch.next_blocks.len() > MAX_BLOCKS_PER_RESPONSE {
            peer.blacklist("obsolete or rogue peer sends too many next blocks");
            return Ok(());
        }

        for value in &batch.next_blocks {
            let candidate = match parse_candidate(value) {
                Ok(candidate) => candidate,
                Err(error) if error.is_retriable() => {
                    // Missing context on our side; retry this peer on a
                    // later tick without penalty.
                    debug!(%error, "peer block is not currently valid, stopping this round");
                    break 'rounds;
                }
                Err(error) => {
                    peer.blacklist(&format!("sent an invalid block: {error}"));
                    return Ok(());
                }
            };

            collected += 1;
            cursor = candidate.id();
            let head_id = processor.db().last_block().map(|head| head.id());

            if candidate.previous_block_id() == head_id {
                match processor.push_block(Arc::clone(&candidate)) {
                    Ok(()) => {}
                    Err(PushError::OutOfOrder(reason)) => {
                        debug!(reason, "block fell out of order, ending tick");
                        break 'rounds;
                    }
                    Err(PushError::Store(error)) => {
                        return Err(Fatal(format!("store failure during download: {error}")));
                    }
                    Err(error) => {
                        peer.blacklist(&format!("sent an unacceptable block: {error}"));
                        return Ok(());
                    }
                }
            } else if !processor.db().has_block(candidate.id()) {
                fork_blocks.push(candidate);
            }

            if collected >= MAX_BLOCKS_PER_TICK {
                break 'rounds;
            }
        }
    }

    if !fork_blocks.is_empty() {
        debug!(count = fork_blocks.len(), "processing fork candidates");
        processor.process_fork(peer.as_ref(), &fork_blocks, common_id)?;
    }
    Ok(())
}

/// Bisection phase: ask for milestone ids until one is known locally.
/// Falls back to genesis when the peer's milestones are all foreign.
fn common_milestone_id(processor: &BlockchainProcessor, peer: &dyn Peer) -> Option<BlockId> {
    let genesis_id = processor.db().block_at(0).map(|genesis| genesis.id())?;
    let mut last_milestone: Option<BlockId> = None;

    loop {
        let request = match last_milestone {
            None => PeerRequest::GetMilestoneBlockIds {
                last_block_id: processor.db().last_block().map(|head| head.id()),
                last_milestone_block_id: None,
            },
            Some(id) => PeerRequest::GetMilestoneBlockIds {
                last_block_id: None,
                last_milestone_block_id: Some(id),
            },
        };
        let response = peer.send(&request)?;
        let milestones: MilestoneBlockIdsResponse = match serde_json::from_value(response) {
            Ok(milestones) => milestones,
            Err(_) => {
                peer.blacklist("malformed milestone ids response");
                return None;
            }
        };

        if milestones.milestone_block_ids.is_empty() {
            return Some(genesis_id);
        }
        if milestones.milestone_block_ids.len() > MAX_MILESTONE_IDS {
            peer.blacklist("obsolete or rogue peer sends too many milestone ids");
            return None;
        }

        // Oldest first: the first id we know is the common candidate.
        for id in &milestones.milestone_block_ids {
            if processor.db().has_block(*id) {
                return Some(*id);
            }
        }
        if milestones.last {
            return Some(genesis_id);
        }
        last_milestone = milestones.milestone_block_ids.last().copied();
    }
}

/// Refinement phase: walk forward ids from the milestone candidate;
/// the last id we share is the true common ancestor.
fn common_block_id(
    processor: &BlockchainProcessor,
    peer: &dyn Peer,
    mut common: BlockId,
) -> Option<BlockId> {
    loop {
        let Some(response) = peer.send(&PeerRequest::GetNextBlockIds { block_id: common }) else {
            return Some(common);
        };
        let ids: NextBlockIdsResponse = match serde_json::from_value(response) {
            Ok(ids) => ids,
            Err(_) => {
                peer.blacklist("malformed next block ids response");
                return None;
            }
        };

        if ids.next_block_ids.is_empty() {
            return Some(common);
        }
        if ids.next_block_ids.len() > MAX_NEXT_BLOCK_IDS {
            peer.blacklist("obsolete or rogue peer sends too many next block ids");
            return None;
        }

        for id in ids.next_block_ids {
            if !processor.db().has_block(id) {
                return Some(common);
            }
            common = id;
        }
    }
}

/// Parse a peer-supplied block and run the stateless checks on its
/// transactions, so retriable misses are told apart from garbage.
fn parse_candidate(value: &Value) -> Result<Arc<Block>, ValidationError> {
    let block = parse_block(value)?;
    for tx in block.transactions() {
        tx.validate()?;
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_data_model::{
        constants::{epoch_time, ONE_EMBER},
        AccountId,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        peers::PeerNetwork,
        testing::{bench, payment, push_next, ProcessorPeer},
    };

    /// A network with exactly one peer.
    struct OnePeer(Arc<ProcessorPeer>);

    impl PeerNetwork for OnePeer {
        fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
            {
            let peer = Arc::clone(&self.0);
            let peer: Arc<dyn Peer> = peer;
            vec![peer]
        }
        }

        fn broadcast_block(&self, _block: &Block) {}
    }

    #[test]
    fn tick_downloads_a_longer_chain() {
        let local = bench();
        let remote = bench();
        let now = epoch_time();

        // Shared block 1, then the remote runs ahead.
        let shared = push_next(&local, now - 10, vec![]);
        remote.processor.push_block(shared).unwrap();
        for n in 0..3 {
            push_next(&remote, now - 9 + n, vec![]);
        }

        let peer = Arc::new(ProcessorPeer::new(Arc::clone(&remote.processor)));
        tick(&local.processor, &OnePeer(Arc::clone(&peer))).unwrap();

        assert!(!peer.was_blacklisted());
        assert_eq!(
            local.processor.db().last_block().unwrap().id(),
            remote.processor.db().last_block().unwrap().id(),
        );
        assert_eq!(local.processor.db().height(), Some(4));
        assert_eq!(
            local.processor.last_blockchain_feeder().unwrap().1,
            4,
        );
    }

    #[test]
    fn tick_switches_to_a_heavier_fork() {
        let local = bench();
        let remote = bench();
        let now = epoch_time();

        // Divergence right after genesis; the remote branch is longer
        // and carries no local transactions.
        let treasury_payment = payment(&local.treasury, AccountId(42), 5 * ONE_EMBER, now - 5);
        push_next(&local, now - 5, vec![treasury_payment]);
        for n in 0..3 {
            push_next(&remote, now - 9 + n, vec![]);
        }

        let peer = Arc::new(ProcessorPeer::new(Arc::clone(&remote.processor)));
        tick(&local.processor, &OnePeer(Arc::clone(&peer))).unwrap();

        assert!(!peer.was_blacklisted());
        assert_eq!(
            local.processor.db().last_block().unwrap().id(),
            remote.processor.db().last_block().unwrap().id(),
        );
        // The abandoned branch's transaction is queued for another try.
        local
            .processor
            .pool()
            .process_waiting(local.processor.db());
        assert_eq!(local.processor.pool().len(), 1);
    }

    #[test]
    fn tick_ignores_peers_with_less_difficulty() {
        let local = bench();
        let remote = bench();
        let now = epoch_time();
        push_next(&local, now - 10, vec![]);
        push_next(&local, now - 5, vec![]);

        let peer = Arc::new(ProcessorPeer::new(Arc::clone(&remote.processor)));
        let head_before = local.processor.db().last_block().unwrap().id();
        tick(&local.processor, &OnePeer(Arc::clone(&peer))).unwrap();

        assert_eq!(local.processor.db().last_block().unwrap().id(), head_before);
        assert!(!peer.was_blacklisted());
    }

    /// A peer that claims infinite difficulty and then feeds garbage.
    #[derive(Debug, Default)]
    struct GarbagePeer {
        blacklisted: Mutex<Option<String>>,
    }

    impl Peer for GarbagePeer {
        fn announced_address(&self) -> Option<String> {
            Some("garbage.test:7874".into())
        }

        fn send(&self, request: &PeerRequest) -> Option<serde_json::Value> {
            match request {
                PeerRequest::GetCumulativeDifficulty => Some(json!({
                    "cumulativeDifficulty": "999999999999999999999999",
                    "blockchainHeight": 9000,
                })),
                _ => Some(json!({ "error": "no such table" })),
            }
        }

        fn blacklist(&self, cause: &str) {
            *self.blacklisted.lock() = Some(cause.to_owned());
        }
    }

    struct OneGarbagePeer(Arc<GarbagePeer>);

    impl PeerNetwork for OneGarbagePeer {
        fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
            {
            let peer = Arc::clone(&self.0);
            let peer: Arc<dyn Peer> = peer;
            vec![peer]
        }
        }

        fn broadcast_block(&self, _block: &Block) {}
    }

    #[test]
    fn unparsable_milestone_walk_survives_without_sync() {
        let local = bench();
        let peer = Arc::new(GarbagePeer::default());

        tick(&local.processor, &OneGarbagePeer(Arc::clone(&peer))).unwrap();

        // Empty milestone list is a valid "nothing in common" answer,
        // so the peer is not blacklisted; the head must be untouched.
        assert_eq!(local.processor.db().height(), Some(0));
    }

    #[test]
    fn oversized_milestone_response_blacklists() {
        let local = bench();
        let ids: Vec<String> = (0..25_u64).map(|n| n.to_string()).collect();
        let peer = Arc::new(ScriptedMilestonePeer {
            ids,
            blacklisted: Mutex::new(None),
        });

        tick(&local.processor, &OneScriptedPeer(Arc::clone(&peer))).unwrap();
        assert!(peer.blacklisted.lock().is_some());
    }

    #[derive(Debug)]
    struct ScriptedMilestonePeer {
        ids: Vec<String>,
        blacklisted: Mutex<Option<String>>,
    }

    impl Peer for ScriptedMilestonePeer {
        fn announced_address(&self) -> Option<String> {
            Some("scripted.test:7874".into())
        }

        fn send(&self, request: &PeerRequest) -> Option<serde_json::Value> {
            match request {
                PeerRequest::GetCumulativeDifficulty => Some(json!({
                    "cumulativeDifficulty": "999999999999999999999999",
                })),
                PeerRequest::GetMilestoneBlockIds { .. } => {
                    Some(json!({ "milestoneBlockIds": self.ids }))
                }
                _ => None,
            }
        }

        fn blacklist(&self, cause: &str) {
            *self.blacklisted.lock() = Some(cause.to_owned());
        }
    }

    struct OneScriptedPeer(Arc<ScriptedMilestonePeer>);

    impl PeerNetwork for OneScriptedPeer {
        fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
            {
            let peer = Arc::clone(&self.0);
            let peer: Arc<dyn Peer> = peer;
            vec![peer]
        }
        }

        fn broadcast_block(&self, _block: &Block) {}
    }
}
