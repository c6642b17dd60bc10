//! The blockchain processor: every way the chain head can move goes
//! through here, serialized by one process-wide lock.
//!
//! Candidate blocks arrive from the forger ([`BlockchainProcessor::
//! generate_block`]) and from peers (directly via [`BlockchainProcessor::
//! process_peer_block`], or through the download loop, which hands
//! non-contiguous batches to [`BlockchainProcessor::process_fork`]).
//! Acceptance happens inside a store transaction; any failure rolls the
//! store and every derived table back and leaves the head untouched.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use ember_config::Config;
use ember_crypto::{Hash, KeyPair, PublicKey, Sha256Builder};
use ember_data_model::{
    block::{self, parse_block, Block, ChainedBlock},
    constants::{
        epoch_time, ChainParams, MAX_PAYLOAD_LENGTH, MAX_REFERENCED_CHAIN_DEPTH,
        MAX_REFERENCED_CHAIN_TIMESPAN, MAX_ROLLBACK, MAX_TIMEDRIFT, MAX_TRANSACTIONS_PER_BLOCK,
    },
    transaction::{Transaction, TransactionType},
    BlockId, TransactionId, ValidationError,
};
use ember_logger::prelude::*;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;

use crate::{
    db::{self, Db},
    events::{BlockEvent, BlockListeners, Listener, ListenerId},
    genesis,
    peers::{Peer, PeerNetwork},
    pool::UnconfirmedPool,
    state::{ChainState, DerivedTable},
};

/// Why a candidate block was not pushed.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The block does not continue the current head (wrong previous id
    /// or a timestamp outside the window). The block itself may be
    /// fine; try another peer or retry later.
    #[error("block out of order: {0}")]
    OutOfOrder(String),
    /// The block is invalid: version, signature, identity, checksum or
    /// aggregate failure. Whoever supplied it is at fault.
    #[error("block not accepted: {0}")]
    NotAccepted(String),
    /// A specific transaction inside the block failed.
    #[error("transaction {id} not accepted: {reason}")]
    TransactionNotAccepted { id: TransactionId, reason: String },
    /// Store misuse; not attributable to the block.
    #[error(transparent)]
    Store(#[from] db::Error),
}

/// Why a rollback request was refused.
#[derive(Debug, thiserror::Error)]
pub enum PopError {
    /// cannot roll back to height {requested}: minimum rollback height is {minimum}
    #[error("cannot roll back to height {requested}: minimum rollback height is {minimum}")]
    BelowMinRollback { requested: u32, minimum: u32 },
    #[error(transparent)]
    Store(#[from] db::Error),
}

/// Why a rescan was refused. Failures on individual blocks do not fail
/// the scan; the offending tail is deleted and requeued.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan height {requested} is beyond the chain head {head}")]
    HeightBeyondHead { requested: u32, head: u32 },
    #[error(transparent)]
    Store(#[from] db::Error),
}

/// Why block generation failed.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("chain is not bootstrapped")]
    NotBootstrapped,
    #[error("could not assemble block: {0}")]
    Assembly(ValidationError),
    #[error(transparent)]
    Push(#[from] PushError),
}

/// Chain-state inconsistency that cannot be recovered locally. After a
/// failure to restore the original branch the store no longer matches
/// any coherent chain; the operator must intervene.
#[derive(Debug, thiserror::Error)]
#[error("fatal chain inconsistency: {0}")]
pub struct Fatal(pub String);

/// The processor. One per node; shared behind an [`Arc`].
pub struct BlockchainProcessor {
    // Note: `Debug` is implemented manually below because `network`
    // holds a `dyn PeerNetwork`, which doesn't require `Debug`.
    params: &'static ChainParams,
    db: Arc<Db>,
    state: Arc<ChainState>,
    pool: Arc<UnconfirmedPool>,
    listeners: Arc<BlockListeners>,
    genesis_block: Arc<Block>,
    network: Mutex<Option<Arc<dyn PeerNetwork>>>,
    /// The blockchain lock. Reentrant: fork processing and generation
    /// re-enter `push_block` while holding it.
    chain_lock: ReentrantMutex<()>,
    get_more_blocks: AtomicBool,
    scanning: AtomicBool,
    validate_at_scan: AtomicBool,
    trim_derived_tables: bool,
    last_trim_height: Arc<AtomicU32>,
    fake_forging_keys: Vec<PublicKey>,
    last_feeder: Mutex<Option<(String, u32)>>,
}

impl std::fmt::Debug for BlockchainProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainProcessor")
            .field("genesis_block", &self.genesis_block)
            .finish_non_exhaustive()
    }
}

impl BlockchainProcessor {
    /// Build a processor for the configured network, with the embedded
    /// genesis.
    pub fn new(config: &Config) -> Result<Arc<Self>, ValidationError> {
        let params = ChainParams::for_network(config.network);
        Ok(Self::with_genesis(config, genesis::genesis_block(params)?))
    }

    /// Build a processor around a custom genesis block. This is how
    /// private chains (and test fixtures) bootstrap without the
    /// embedded allocation.
    pub fn with_genesis(config: &Config, genesis_block: Arc<Block>) -> Arc<Self> {
        let params = ChainParams::for_network(config.network);
        let db = Arc::new(Db::new());
        let state = Arc::new(ChainState::new());
        let listeners = Arc::new(BlockListeners::new());
        let last_trim_height = Arc::new(AtomicU32::new(0));

        let accounts_table = Arc::clone(&state.accounts);
        let aliases_table = Arc::clone(&state.aliases);
        db.register_table(accounts_table);
        db.register_table(aliases_table);

        Self::register_builtin_listeners(
            &listeners,
            &db,
            &last_trim_height,
            config.trim_derived_tables,
        );

        Arc::new(Self {
            params,
            db,
            state,
            pool: Arc::new(UnconfirmedPool::new()),
            listeners,
            genesis_block,
            network: Mutex::new(None),
            chain_lock: ReentrantMutex::new(()),
            get_more_blocks: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            validate_at_scan: AtomicBool::new(config.force_validate),
            trim_derived_tables: config.trim_derived_tables,
            last_trim_height,
            fake_forging_keys: config.fake_forging_allowlist(),
            last_feeder: Mutex::new(None),
        })
    }

    fn register_builtin_listeners(
        listeners: &BlockListeners,
        db: &Arc<Db>,
        last_trim_height: &Arc<AtomicU32>,
        trim_derived_tables: bool,
    ) {
        let height_counter: Listener = Arc::new(|block| {
            let height = block.height();
            if height > 0 && height % 5000 == 0 {
                info!(height, "processed block");
            }
        });
        listeners.add_listener(BlockEvent::BlockPushed, Arc::clone(&height_counter));
        listeners.add_listener(BlockEvent::BlockScanned, height_counter);

        let analyze = {
            let db = Arc::clone(db);
            move || {
                let (blocks, transactions) = db.counts();
                info!(blocks, transactions, "store analysis");
            }
        };
        let on_push = {
            let analyze = analyze.clone();
            Arc::new(move |block: &ChainedBlock| {
                if block.height() > 0 && block.height() % 5000 == 0 {
                    analyze();
                }
            })
        };
        listeners.add_listener(BlockEvent::BlockPushed, on_push);
        listeners.add_listener(BlockEvent::RescanEnd, Arc::new(move |_| analyze()));

        if trim_derived_tables {
            let db = Arc::clone(db);
            let last_trim_height = Arc::clone(last_trim_height);
            listeners.add_listener(
                BlockEvent::BlockPushed,
                Arc::new(move |block| {
                    let height = block.height();
                    if height > 0 && height % MAX_ROLLBACK == 0 {
                        let trim_to = height.saturating_sub(MAX_ROLLBACK);
                        last_trim_height.store(trim_to, Ordering::SeqCst);
                        for table in db.tables() {
                            table.trim(trim_to);
                        }
                        debug!(trim_to, "trimmed derived tables");
                    }
                }),
            );
        }
    }

    /// Commit the genesis block if the store is empty, then honor the
    /// startup scan flags.
    pub fn init(&self, force_scan: bool) -> Result<(), Fatal> {
        self.ensure_genesis()
            .map_err(|error| Fatal(format!("could not bootstrap genesis: {error}")))?;
        if force_scan {
            self.scan(0)
                .map_err(|error| Fatal(format!("startup scan failed: {error}")))?;
        }
        Ok(())
    }

    fn ensure_genesis(&self) -> Result<(), PushError> {
        let _lock = self.chain_lock.lock();
        if !self.db.is_empty() {
            return Ok(());
        }
        info!(id = %self.genesis_block.id(), "genesis block not in store, initializing");

        let chained = ChainedBlock::genesis(Arc::clone(&self.genesis_block));
        self.db.begin()?;
        self.db.push_block(chained.clone());
        self.state.accounts.bootstrap_creator();
        match self.accept(&chained) {
            Ok(()) => {
                self.db.commit()?;
                self.db.end();
                Ok(())
            }
            Err(error) => {
                self.db.rollback();
                self.db.end();
                Err(error)
            }
        }
    }

    /// Validate `block` against the current head and commit it.
    pub fn push_block(&self, candidate: Arc<Block>) -> Result<(), PushError> {
        let _lock = self.chain_lock.lock();
        let previous = self
            .db
            .last_block()
            .ok_or_else(|| PushError::NotAccepted("chain is not bootstrapped".into()))?;

        if candidate.previous_block_id() != Some(previous.id()) {
            return Err(PushError::OutOfOrder(format!(
                "previous block id {:?} does not match head {}",
                candidate.previous_block_id(),
                previous.id(),
            )));
        }

        self.db.begin()?;
        let chained = match self.apply_candidate(&previous, &candidate) {
            Ok(chained) => {
                self.db.commit()?;
                self.db.end();
                chained
            }
            Err(error) => {
                // Head and derived state revert to the pre-push
                // snapshot.
                self.db.rollback();
                self.db.end();
                return Err(error);
            }
        };

        self.listeners.notify(BlockEvent::BlockPushed, &chained);
        self.pool.process_waiting(&self.db);

        if candidate.timestamp() + MAX_TIMEDRIFT >= epoch_time() {
            if let Some(network) = self.network.lock().clone() {
                network.broadcast_block(&candidate);
            }
        }
        Ok(())
    }

    /// The validation pipeline proper. Runs inside an open store
    /// transaction; returns the block in chain position on success.
    fn apply_candidate(
        &self,
        previous: &ChainedBlock,
        candidate: &Arc<Block>,
    ) -> Result<ChainedBlock, PushError> {
        let now = epoch_time();
        let previous_height = previous.height();

        let expected_version = self.params.block_version(previous_height);
        if candidate.version() != expected_version {
            return Err(PushError::NotAccepted(format!(
                "block version {} where {expected_version} is expected",
                candidate.version(),
            )));
        }

        if previous_height == self.params.transparent_forging_height
            && !self.verify_checksum(
                self.params.transparent_forging_checksum,
                "transparent-forging",
            )
        {
            return Err(PushError::NotAccepted(
                "transparent-forging checksum failed".into(),
            ));
        }
        if previous_height == self.params.nqt_height
            && !self.verify_checksum(self.params.nqt_checksum, "nqt")
        {
            return Err(PushError::NotAccepted("nqt checksum failed".into()));
        }

        if candidate.version() >= 2 {
            let expected = Hash::new(previous.block().bytes());
            if candidate.previous_block_hash() != Some(expected) {
                return Err(PushError::NotAccepted(
                    "previous block hash mismatch".into(),
                ));
            }
        }

        if candidate.timestamp() > now + MAX_TIMEDRIFT
            || candidate.timestamp() <= previous.timestamp()
        {
            return Err(PushError::OutOfOrder(format!(
                "block timestamp {} outside ({}, {}]",
                candidate.timestamp(),
                previous.timestamp(),
                now + MAX_TIMEDRIFT,
            )));
        }

        if candidate.id().0 == 0 || self.db.has_block(candidate.id()) {
            return Err(PushError::NotAccepted("duplicate block id".into()));
        }

        if !self.verify_generation(previous, candidate) {
            return Err(PushError::NotAccepted(
                "generation signature verification failed".into(),
            ));
        }
        if !candidate.verify_block_signature() {
            return Err(PushError::NotAccepted(
                "block signature verification failed".into(),
            ));
        }

        if candidate.transactions().len() > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(PushError::NotAccepted("too many transactions".into()));
        }

        let mut duplicates: HashMap<TransactionType, HashSet<String>> = HashMap::new();
        let mut digest = Sha256Builder::new();
        let mut total_amount: i64 = 0;
        let mut total_fee: i64 = 0;
        let mut payload_length: u32 = 0;

        for tx in candidate.transactions() {
            let rejected = |reason: String| PushError::TransactionNotAccepted {
                id: tx.id(),
                reason,
            };

            if tx.timestamp() > now + MAX_TIMEDRIFT {
                return Err(rejected(format!(
                    "timestamp {} is in the future",
                    tx.timestamp()
                )));
            }
            if tx.timestamp() > candidate.timestamp() + MAX_TIMEDRIFT {
                return Err(rejected("timestamp is ahead of the block".into()));
            }
            // The expiration check was skipped for the block at height
            // 304; accepted chain history depends on it staying that
            // way.
            if tx.expiration() < candidate.timestamp() && previous_height != 303 {
                return Err(rejected("expired".into()));
            }
            if self.db.has_transaction(tx.id()) {
                return Err(rejected("already in the chain".into()));
            }
            if !self.referenced_chain_ok(tx, previous_height) {
                return Err(rejected("missing or invalid referenced transaction".into()));
            }
            let expected_tx_version = self.params.transaction_version(previous_height);
            if tx.version() != expected_tx_version {
                return Err(rejected(format!(
                    "version {} where {expected_tx_version} is expected",
                    tx.version(),
                )));
            }
            if !tx.verify_signature() {
                return Err(rejected("signature verification failed".into()));
            }
            if tx.id().0 == 0 {
                return Err(rejected("invalid transaction id".into()));
            }
            if let Some((bucket, key)) = tx.duplicate_key() {
                if !duplicates.entry(bucket).or_default().insert(key) {
                    return Err(rejected("duplicate in this block".into()));
                }
            }
            self.state
                .validate(tx)
                .map_err(|error| rejected(error.to_string()))?;

            total_amount = total_amount.saturating_add(tx.amount());
            total_fee = total_fee.saturating_add(tx.fee());
            let bytes = tx.bytes();
            payload_length += bytes.len() as u32;
            digest.update(bytes);
        }

        if total_amount != candidate.total_amount() || total_fee != candidate.total_fee() {
            return Err(PushError::NotAccepted(
                "total amount or total fee mismatch".into(),
            ));
        }
        if digest.finalize() != candidate.payload_hash() {
            return Err(PushError::NotAccepted("payload hash mismatch".into()));
        }
        if payload_length != candidate.payload_length() || payload_length > MAX_PAYLOAD_LENGTH {
            return Err(PushError::NotAccepted("payload length mismatch".into()));
        }

        let chained = previous.chain(Arc::clone(candidate));
        self.listeners.notify(BlockEvent::BeforeBlockAccept, &chained);
        self.pool.requeue_all();
        self.db.push_block(chained.clone());
        self.accept(&chained)?;
        Ok(chained)
    }

    /// Apply an already-stored block: unconfirmed effects first (the
    /// double-spend gate), then the confirmed effects with fees to the
    /// generator.
    fn accept(&self, chained: &ChainedBlock) -> Result<(), PushError> {
        let height = chained.height();
        let block = chained.block();

        for tx in block.transactions() {
            if !self.state.accounts.apply_unconfirmed(tx, height) {
                return Err(PushError::TransactionNotAccepted {
                    id: tx.id(),
                    reason: "double spending".into(),
                });
            }
        }
        self.listeners.notify(BlockEvent::BeforeBlockApply, chained);

        self.state
            .accounts
            .apply_forged_fees(block.generator_id(), block.total_fee(), height);
        for tx in block.transactions() {
            self.state.apply_transaction(tx, height);
        }

        self.listeners.notify(BlockEvent::AfterBlockApply, chained);
        self.pool.notify_confirmed(block.transactions());
        Ok(())
    }

    fn verify_generation(&self, previous: &ChainedBlock, candidate: &Block) -> bool {
        if self
            .fake_forging_keys
            .contains(&candidate.generator_public_key())
        {
            return true;
        }
        if !candidate.verify_generation_signature(previous.block()) {
            return false;
        }
        let effective = self
            .state
            .accounts
            .effective_balance(candidate.generator_id());
        if effective <= 0 {
            return false;
        }
        let elapsed = candidate.timestamp().saturating_sub(previous.timestamp());
        block::hit(candidate.generation_signature())
            < block::hit_target(previous.base_target(), effective, elapsed)
    }

    /// Whether `tx`'s referenced-transaction chain is satisfied at the
    /// given height context. Before the full-hash milestone only the
    /// directly referenced id must exist; afterwards the whole chain is
    /// walked.
    fn referenced_chain_ok(&self, tx: &Transaction, height_context: u32) -> bool {
        let Some(full_hash) = tx.referenced_transaction_full_hash() else {
            return true;
        };
        if height_context < self.params.referenced_full_hash_height {
            return self.db.has_transaction(TransactionId(full_hash.to_id()));
        }

        let mut current = match self.db.transaction_by_full_hash(full_hash) {
            Some(referenced) => referenced,
            None => return false,
        };
        for _ in 0..MAX_REFERENCED_CHAIN_DEPTH {
            if tx.timestamp().saturating_sub(current.timestamp()) > MAX_REFERENCED_CHAIN_TIMESPAN {
                return false;
            }
            match current.referenced_transaction_full_hash() {
                None => return true,
                Some(next) => match self.db.transaction_by_full_hash(next) {
                    Some(referenced) => current = referenced,
                    None => return false,
                },
            }
        }
        false
    }

    fn verify_checksum(&self, expected: Option<[u8; 32]>, label: &str) -> bool {
        let mut digest = Sha256Builder::new();
        for tx in self.db.transactions_for_checksum() {
            digest.update(tx.bytes());
        }
        let computed = digest.finalize();

        match expected {
            None => {
                info!(label, checksum = %computed, "checksum not pinned, passing");
                true
            }
            Some(expected) => {
                if computed.as_ref() == expected {
                    info!(label, "checksum passed");
                    true
                } else {
                    error!(label, computed = %computed, "checksum failed");
                    false
                }
            }
        }
    }

    /// Roll the chain back so `height` is the new head, returning the
    /// popped wire blocks in ascending height order. Genesis is never
    /// popped. The popped transactions are not requeued here; callers
    /// decide (fork processing pushes the blocks right back).
    pub fn pop_off_to(&self, height: u32) -> Result<Vec<Arc<Block>>, PopError> {
        let _lock = self.chain_lock.lock();
        let Some(head) = self.db.last_block() else {
            return Ok(Vec::new());
        };
        if height >= head.height() {
            return Ok(Vec::new());
        }
        let minimum = self.min_rollback_height();
        if height < minimum {
            return Err(PopError::BelowMinRollback {
                requested: height,
                minimum,
            });
        }

        self.db.begin()?;
        let mut popped = Vec::new();
        while let Some(current) = self.db.last_block() {
            if current.height() <= height {
                break;
            }
            let Some(removed) = self.db.pop_block() else {
                break;
            };
            self.listeners.notify(BlockEvent::BlockPopped, &removed);
            popped.push(Arc::clone(removed.block()));
        }
        for table in self.db.tables() {
            table.rollback(height);
        }
        self.db.commit()?;
        self.db.end();

        popped.reverse();
        Ok(popped)
    }

    /// Attempt to switch to a peer-provided branch rooted at
    /// `common_block_id`. The head only ever ends up at the same or
    /// higher cumulative difficulty; a peer whose branch loses is
    /// blacklisted and the original branch restored.
    pub fn process_fork(
        &self,
        peer: &dyn Peer,
        fork_blocks: &[Arc<Block>],
        common_block_id: BlockId,
    ) -> Result<(), Fatal> {
        let _lock = self.chain_lock.lock();
        let Some(common_height) = self.db.block_height(common_block_id) else {
            warn!(%common_block_id, "fork common ancestor vanished, ignoring fork");
            return Ok(());
        };
        let Some(head) = self.db.last_block() else {
            return Ok(());
        };
        let snapshot_difficulty = head.cumulative_difficulty().clone();

        let my_popped_blocks = self
            .pop_off_to(common_height)
            .map_err(|error| Fatal(format!("could not pop to fork ancestor: {error}")))?;

        let mut pushed_fork_blocks = 0_usize;
        for candidate in fork_blocks {
            let head_id = self.db.last_block().map(|head| head.id());
            if candidate.previous_block_id() != head_id {
                continue;
            }
            match self.push_block(Arc::clone(candidate)) {
                Ok(()) => pushed_fork_blocks += 1,
                Err(error) => {
                    peer.blacklist(&format!("invalid fork block: {error}"));
                    break;
                }
            }
        }

        let new_difficulty = self
            .db
            .last_block()
            .map(|head| head.cumulative_difficulty().clone())
            .unwrap_or_default();

        if pushed_fork_blocks > 0 && new_difficulty < snapshot_difficulty {
            warn!("peer fed us a lower-difficulty chain, rolling its blocks back");
            peer.blacklist("provided a lower-difficulty fork");
            let peer_popped_blocks = self
                .pop_off_to(common_height)
                .map_err(|error| Fatal(format!("could not undo losing fork: {error}")))?;
            pushed_fork_blocks = 0;
            for b in peer_popped_blocks {
                self.pool.process_later(b.transactions().iter().cloned());
            }
        }

        if pushed_fork_blocks == 0 {
            debug!(count = my_popped_blocks.len(), "restoring popped blocks");
            for b in my_popped_blocks {
                let id = b.id();
                self.push_block(b).map_err(|error| {
                    Fatal(format!("could not restore popped block {id}: {error}"))
                })?;
            }
        } else {
            for b in my_popped_blocks {
                self.pool.process_later(b.transactions().iter().cloned());
            }
        }
        Ok(())
    }

    /// Check a peer-submitted candidate's advertised previous block
    /// against the head before doing any work, then parse and push.
    pub fn process_peer_block(&self, request: &Value) -> Result<(), PushError> {
        let _lock = self.chain_lock.lock();
        let head = self
            .db
            .last_block()
            .ok_or_else(|| PushError::NotAccepted("chain is not bootstrapped".into()))?;
        let head_id = head.id().to_string();
        if request.get("previousBlock").and_then(Value::as_str) != Some(head_id.as_str()) {
            return Err(PushError::OutOfOrder(
                "advertised previous block is not our head".into(),
            ));
        }
        let candidate =
            parse_block(request).map_err(|error| PushError::NotAccepted(error.to_string()))?;
        self.push_block(candidate)
    }

    /// Replay stored blocks from `height`, rebuilding derived state.
    /// A requested height below the rollback horizon downgrades to a
    /// full scan. Blocks that fail replay are deleted from the store
    /// and their transactions requeued.
    pub fn scan(&self, height: u32) -> Result<(), ScanError> {
        let _download_pause = self.pause_downloads();
        let _lock = self.chain_lock.lock();

        let head_height = self.db.height().unwrap_or(0);
        if height > head_height + 1 {
            return Err(ScanError::HeightBeyondHead {
                requested: height,
                head: head_height,
            });
        }
        let mut height = height;
        let minimum = self.min_rollback_height();
        if height > 0 && height < minimum {
            warn!(height, minimum, "scan below the rollback horizon, doing a full scan");
            height = 0;
        }

        self.scanning.store(true, Ordering::SeqCst);
        let validate = self.validate_at_scan.load(Ordering::SeqCst);
        info!(height, validate, "scanning blockchain");

        self.db.begin()?;
        let result = self.scan_in_transaction(height, validate);
        match result {
            Ok(()) => {
                self.db.commit()?;
            }
            Err(error) => {
                self.db.rollback();
                self.db.end();
                self.scanning.store(false, Ordering::SeqCst);
                return Err(error);
            }
        }
        self.db.end();

        self.validate_at_scan.store(false, Ordering::SeqCst);
        self.scanning.store(false, Ordering::SeqCst);
        info!(height = self.db.height().unwrap_or(0), "scan done");
        Ok(())
    }

    /// Rescan the most recent `num_blocks` blocks.
    pub fn scan_back(&self, num_blocks: u32) -> Result<(), ScanError> {
        let head_height = self.db.height().unwrap_or(0);
        self.scan((head_height + 1).saturating_sub(num_blocks))
    }

    fn scan_in_transaction(&self, height: u32, validate: bool) -> Result<(), ScanError> {
        self.pool.requeue_all();
        for table in self.db.tables() {
            if height == 0 {
                table.truncate();
            } else {
                table.rollback(height - 1);
            }
        }
        if height == 0 {
            self.state.accounts.bootstrap_creator();
        }

        let initial = if height == 0 {
            self.db.block_at(0)
        } else {
            self.db.block_at(height - 1)
        };
        let Some(initial) = initial else {
            return Ok(()); // empty store, nothing to replay
        };
        self.listeners.notify(BlockEvent::RescanBegin, &initial);

        let mut previous = (height > 0).then(|| initial.clone());
        for stored in self.db.blocks_from(height) {
            if let Err(reason) = self.replay_block(&stored, previous.as_ref(), validate) {
                self.db.rollback();
                let deleted = self.db.delete_from(stored.height());
                error!(
                    height = stored.height(),
                    id = %stored.id(),
                    reason,
                    deleted = deleted.len(),
                    "block failed rescan, deleting it and everything above",
                );
                for block in &deleted {
                    self.pool
                        .process_later(block.block().transactions().iter().cloned());
                }
                self.db.commit()?;
                break;
            }
            self.db.commit()?;
            self.listeners.notify(BlockEvent::BlockScanned, &stored);
            previous = Some(stored);
        }

        if let Some(head) = self.db.last_block() {
            self.listeners.notify(BlockEvent::RescanEnd, &head);
        }
        Ok(())
    }

    /// Re-validate and re-apply one stored block. The error is a human
    /// reason; the caller deletes the block.
    fn replay_block(
        &self,
        stored: &ChainedBlock,
        previous: Option<&ChainedBlock>,
        validate: bool,
    ) -> Result<(), String> {
        let block = stored.block();

        if let Some(previous) = previous {
            if block.previous_block_id() != Some(previous.id()) {
                return Err(format!(
                    "database blocks in the wrong order: expected previous {}",
                    previous.id()
                ));
            }

            if validate {
                let expected_version = self.params.block_version(previous.height());
                if block.version() != expected_version {
                    return Err(format!("wrong block version {}", block.version()));
                }
                if !block.verify_block_signature() {
                    return Err("bad block signature".into());
                }
                if !self.verify_generation(previous, block) {
                    return Err("bad generation signature".into());
                }

                let json = serde_json::to_value(Block::clone(block))
                    .map_err(|error| format!("block does not serialize: {error}"))?;
                let reparsed = parse_block(&json)
                    .map_err(|error| format!("block JSON does not round-trip: {error}"))?;
                if reparsed.bytes() != block.bytes() {
                    return Err("block bytes do not round-trip through JSON".into());
                }
                for tx in block.transactions() {
                    if !tx.verify_signature() {
                        return Err(format!("bad signature on transaction {}", tx.id()));
                    }
                    let from_bytes = Transaction::from_bytes(&tx.bytes())
                        .map_err(|error| format!("transaction bytes do not parse: {error}"))?;
                    if from_bytes.bytes() != tx.bytes() {
                        return Err(format!("transaction {} bytes do not round-trip", tx.id()));
                    }
                    let tx_json = serde_json::to_value(Transaction::clone(tx))
                        .map_err(|error| format!("transaction does not serialize: {error}"))?;
                    let from_json: Transaction = serde_json::from_value(tx_json)
                        .map_err(|error| format!("transaction JSON does not round-trip: {error}"))?;
                    if from_json.bytes() != tx.bytes() {
                        return Err(format!(
                            "transaction {} bytes do not round-trip through JSON",
                            tx.id()
                        ));
                    }
                }
            }
        }

        self.listeners.notify(BlockEvent::BeforeBlockAccept, stored);
        self.accept(stored).map_err(|error| error.to_string())
    }

    /// Wipe the chain and re-commit genesis.
    pub fn full_reset(&self) -> Result<(), Fatal> {
        let _download_pause = self.pause_downloads();
        let _lock = self.chain_lock.lock();
        info!("deleting blockchain");

        self.db.truncate();
        for table in self.db.tables() {
            table.truncate();
        }
        self.last_trim_height.store(0, Ordering::SeqCst);
        self.ensure_genesis()
            .map_err(|error| Fatal(format!("could not restore genesis: {error}")))
    }

    /// Forge a block on top of the current head from the unconfirmed
    /// pool and push it.
    pub fn generate_block(
        &self,
        secret_phrase: &str,
        block_timestamp: u32,
    ) -> Result<(), GenerationError> {
        let keys = KeyPair::from_secret_phrase(secret_phrase);
        let _lock = self.chain_lock.lock();
        let previous = self
            .db
            .last_block()
            .ok_or(GenerationError::NotBootstrapped)?;
        let previous_height = previous.height();
        let expected_tx_version = self.params.transaction_version(previous_height);

        let candidates: Vec<Arc<Transaction>> = self
            .pool
            .all()
            .into_iter()
            .filter(|tx| self.referenced_chain_ok(tx, previous_height))
            .collect();

        let mut selected: BTreeMap<(u64, u32), Arc<Transaction>> = BTreeMap::new();
        let mut duplicates: HashMap<TransactionType, HashSet<String>> = HashMap::new();
        let mut payload_length: u32 = 0;
        let mut total_amount: i64 = 0;
        let mut total_fee: i64 = 0;

        // Selection runs to a fixed point: a transaction skipped in one
        // sweep may fit after others brought its alias owner or
        // referenced chain into the block.
        loop {
            let selected_before = selected.len();
            for tx in &candidates {
                if selected.contains_key(&tx.sort_key()) {
                    continue;
                }
                if selected.len() == MAX_TRANSACTIONS_PER_BLOCK
                    || payload_length + tx.size() > MAX_PAYLOAD_LENGTH
                {
                    continue;
                }
                if tx.version() != expected_tx_version {
                    continue;
                }
                if tx.timestamp() > block_timestamp + MAX_TIMEDRIFT
                    || tx.expiration() < block_timestamp
                {
                    continue;
                }
                if let Some((bucket, key)) = tx.duplicate_key() {
                    if duplicates
                        .get(&bucket)
                        .is_some_and(|keys| keys.contains(&key))
                    {
                        continue;
                    }
                }
                match self.state.validate(tx) {
                    Ok(()) => {}
                    Err(error) if error.is_retriable() => continue,
                    Err(error) => {
                        debug!(id = %tx.id(), %error, "dropping invalid transaction from pool");
                        self.pool.remove(tx.id());
                        continue;
                    }
                }

                if let Some((bucket, key)) = tx.duplicate_key() {
                    duplicates.entry(bucket).or_default().insert(key);
                }
                payload_length += tx.size();
                total_amount = total_amount.saturating_add(tx.amount());
                total_fee = total_fee.saturating_add(tx.fee());
                selected.insert(tx.sort_key(), Arc::clone(tx));
            }
            if selected.len() == selected_before {
                break;
            }
        }

        let ordered: Vec<Arc<Transaction>> = selected.into_values().collect();
        let mut digest = Sha256Builder::new();
        for tx in &ordered {
            digest.update(tx.bytes());
        }
        let payload_hash = digest.finalize();

        let version = self.params.block_version(previous_height);
        let generation_signature = if version < 2 {
            keys.sign(previous.block().generation_signature())
                .as_ref()
                .to_vec()
        } else {
            let mut chained_digest = Sha256Builder::new();
            chained_digest.update(previous.block().generation_signature());
            chained_digest.update(keys.public_key().as_ref());
            <[u8; 32]>::from(chained_digest.finalize()).to_vec()
        };
        let previous_block_hash = (version >= 2).then(|| Hash::new(previous.block().bytes()));

        let candidate = Arc::new(
            Block::forge(
                version,
                block_timestamp,
                previous.id(),
                previous_block_hash,
                total_amount,
                total_fee,
                payload_length,
                payload_hash,
                generation_signature,
                ordered,
                &keys,
            )
            .map_err(GenerationError::Assembly)?,
        );

        match self.push_block(Arc::clone(&candidate)) {
            Ok(()) => {
                let chained = self
                    .db
                    .last_block()
                    .expect("head exists right after a successful push");
                info!(id = %candidate.id(), height = chained.height(), "block generated");
                self.listeners.notify(BlockEvent::BlockGenerated, &chained);
                Ok(())
            }
            Err(PushError::TransactionNotAccepted { id, reason }) => {
                warn!(%id, reason, "removing rejected transaction from the pool");
                self.pool.remove(id);
                // The rest of the candidates were requeued by the
                // failed push; make them selectable again.
                self.pool.process_waiting(&self.db);
                Err(GenerationError::Push(PushError::TransactionNotAccepted {
                    id,
                    reason,
                }))
            }
            Err(error) => Err(error.into()),
        }
    }

    // --- control surface -------------------------------------------------

    /// The store. Read paths that need a consistent head should hold
    /// [`Self::lock`] while reading.
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// The chain state ledgers.
    pub fn state(&self) -> &Arc<ChainState> {
        &self.state
    }

    /// The unconfirmed pool.
    pub fn pool(&self) -> &Arc<UnconfirmedPool> {
        &self.pool
    }

    /// Acquire the blockchain lock for a consistent multi-read.
    pub fn lock(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.chain_lock.lock()
    }

    /// Attach the peer network used for gossip.
    pub fn set_peer_network(&self, network: Arc<dyn PeerNetwork>) {
        *self.network.lock() = Some(network);
    }

    /// Let the download loop run (or pause it).
    pub fn set_get_more_blocks(&self, value: bool) {
        self.get_more_blocks.store(value, Ordering::SeqCst);
    }

    pub fn get_more_blocks(&self) -> bool {
        self.get_more_blocks.load(Ordering::SeqCst)
    }

    /// Pause downloads, restoring the previous setting on drop. Used
    /// around scans and resets so every exit path restores it.
    fn pause_downloads(&self) -> DownloadPause<'_> {
        let restore = self.get_more_blocks.swap(false, Ordering::SeqCst);
        DownloadPause {
            processor: self,
            restore,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Request full re-validation during the next scan.
    pub fn validate_at_next_scan(&self) {
        self.validate_at_scan.store(true, Ordering::SeqCst);
    }

    /// The lowest height [`Self::pop_off_to`] accepts.
    pub fn min_rollback_height(&self) -> u32 {
        if !self.trim_derived_tables {
            return 0;
        }
        let head = self.db.height().unwrap_or(0);
        self.last_trim_height
            .load(Ordering::SeqCst)
            .max(head.saturating_sub(MAX_ROLLBACK))
    }

    /// The peer the download loop last pulled from, and the height it
    /// advertised.
    pub fn last_blockchain_feeder(&self) -> Option<(String, u32)> {
        self.last_feeder.lock().clone()
    }

    pub(crate) fn set_last_blockchain_feeder(&self, address: String, height: u32) {
        *self.last_feeder.lock() = Some((address, height));
    }

    /// Register a derived table; registration order is rollback and
    /// trim order.
    pub fn register_derived_table(&self, table: Arc<dyn DerivedTable>) {
        self.db.register_table(table);
    }

    /// Subscribe to a block lifecycle event.
    pub fn add_listener(&self, event: BlockEvent, listener: Listener) -> ListenerId {
        self.listeners.add_listener(event, listener)
    }

    /// Unsubscribe.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }
}

struct DownloadPause<'p> {
    processor: &'p BlockchainProcessor,
    restore: bool,
}

impl Drop for DownloadPause<'_> {
    fn drop(&mut self) {
        self.processor
            .get_more_blocks
            .store(self.restore, Ordering::SeqCst);
    }
}
