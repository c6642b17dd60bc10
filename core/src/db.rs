//! The transactional chain store.
//!
//! [`Db`] owns the accepted blocks in height order plus the id and
//! full-hash indexes over their transactions, and exposes
//! connection-style transaction control: `begin`, `commit`, `rollback`,
//! `end`. Every derived table registered with the store joins its
//! transactions, so a rolled-back block push leaves no trace in any
//! projection.
//!
//! This is the in-memory reference engine for the store contract the
//! processor consumes; it favors obvious correctness over scale, and a
//! relational or file-backed engine can replace it behind the same
//! surface.

use std::{collections::HashMap, sync::Arc};

use ember_crypto::Hash;
use ember_data_model::{
    block::{Block, ChainedBlock},
    transaction::Transaction,
    BlockId, TransactionId,
};
use parking_lot::Mutex;

use crate::state::DerivedTable;

/// Store misuse and consistency failures. These are programming or
/// corruption faults, not peer faults.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// transaction already in progress
    AlreadyInTransaction,
    /// not in a transaction
    NotInTransaction,
}

#[derive(Clone, Default)]
struct ChainData {
    /// Blocks in height order; the vector index is the height.
    blocks: Vec<ChainedBlock>,
    block_index: HashMap<BlockId, u32>,
    transaction_index: HashMap<TransactionId, (u32, u32)>,
    full_hash_index: HashMap<Hash, TransactionId>,
}

impl ChainData {
    fn push(&mut self, block: ChainedBlock) {
        let height = block.height();
        debug_assert_eq!(height as usize, self.blocks.len(), "height gap in store");

        self.block_index.insert(block.id(), height);
        for (index, tx) in block.block().transactions().iter().enumerate() {
            self.transaction_index
                .insert(tx.id(), (height, index as u32));
            self.full_hash_index.insert(tx.full_hash(), tx.id());
        }
        self.blocks.push(block);
    }

    fn pop(&mut self) -> Option<ChainedBlock> {
        let block = self.blocks.pop()?;
        self.block_index.remove(&block.id());
        for tx in block.block().transactions() {
            self.transaction_index.remove(&tx.id());
            self.full_hash_index.remove(&tx.full_hash());
        }
        Some(block)
    }
}

struct DbInner {
    chain: ChainData,
    backup: Option<ChainData>,
}

/// The chain store.
pub struct Db {
    inner: Mutex<DbInner>,
    tables: Mutex<Vec<Arc<dyn DerivedTable>>>,
}

impl Db {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DbInner {
                chain: ChainData::default(),
                backup: None,
            }),
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Register a derived table. Registration order is the order the
    /// processor rolls back and trims.
    pub fn register_table(&self, table: Arc<dyn DerivedTable>) {
        self.tables.lock().push(table);
    }

    /// Snapshot of the registered tables, in registration order.
    pub fn tables(&self) -> Vec<Arc<dyn DerivedTable>> {
        self.tables.lock().clone()
    }

    /// Open a transaction covering the chain data and every registered
    /// table.
    pub fn begin(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.backup.is_some() {
            return Err(Error::AlreadyInTransaction);
        }
        inner.backup = Some(inner.chain.clone());
        drop(inner);

        for table in self.tables() {
            table.begin();
        }
        Ok(())
    }

    /// Make everything since `begin` (or the previous `commit`)
    /// permanent. The transaction stays open.
    pub fn commit(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.backup.is_none() {
            return Err(Error::NotInTransaction);
        }
        inner.backup = Some(inner.chain.clone());
        drop(inner);

        for table in self.tables() {
            table.commit();
        }
        Ok(())
    }

    /// Discard everything since `begin` (or the previous `commit`).
    /// The transaction stays open.
    pub fn rollback(&self) {
        let mut inner = self.inner.lock();
        if let Some(backup) = inner.backup.take() {
            inner.chain = backup;
            inner.backup = Some(inner.chain.clone());
        }
        drop(inner);

        for table in self.tables() {
            table.abort();
        }
    }

    /// Close the transaction. Safe to call whether or not one is open;
    /// every transactional path calls this unconditionally on exit.
    pub fn end(&self) {
        self.inner.lock().backup = None;
        for table in self.tables() {
            table.release();
        }
    }

    /// Whether a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        self.inner.lock().backup.is_some()
    }

    /// The current head, if the chain is bootstrapped.
    pub fn last_block(&self) -> Option<ChainedBlock> {
        self.inner.lock().chain.blocks.last().cloned()
    }

    /// Current chain height.
    pub fn height(&self) -> Option<u32> {
        let inner = self.inner.lock();
        (inner.chain.blocks.len() as u32).checked_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chain.blocks.is_empty()
    }

    /// Append `block` as the new head.
    pub fn push_block(&self, block: ChainedBlock) {
        self.inner.lock().chain.push(block);
    }

    /// Remove and return the head. Refuses to remove genesis.
    pub fn pop_block(&self) -> Option<ChainedBlock> {
        let mut inner = self.inner.lock();
        if inner.chain.blocks.len() <= 1 {
            return None;
        }
        inner.chain.pop()
    }

    /// Delete every block at `height` and above, returning them in
    /// ascending height order.
    pub fn delete_from(&self, height: u32) -> Vec<ChainedBlock> {
        let mut inner = self.inner.lock();
        let mut deleted = Vec::new();
        while inner.chain.blocks.len() as u32 > height {
            if let Some(block) = inner.chain.pop() {
                deleted.push(block);
            }
        }
        deleted.reverse();
        deleted
    }

    /// Drop all blocks, genesis included.
    pub fn truncate(&self) {
        let mut inner = self.inner.lock();
        inner.chain = ChainData::default();
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.inner.lock().chain.block_index.contains_key(&id)
    }

    pub fn block_height(&self, id: BlockId) -> Option<u32> {
        self.inner.lock().chain.block_index.get(&id).copied()
    }

    pub fn block_at(&self, height: u32) -> Option<ChainedBlock> {
        self.inner.lock().chain.blocks.get(height as usize).cloned()
    }

    pub fn block(&self, id: BlockId) -> Option<ChainedBlock> {
        let inner = self.inner.lock();
        let height = *inner.chain.block_index.get(&id)?;
        inner.chain.blocks.get(height as usize).cloned()
    }

    /// Blocks at `height` and above, ascending. The rescan feed.
    pub fn blocks_from(&self, height: u32) -> Vec<ChainedBlock> {
        let inner = self.inner.lock();
        inner
            .chain
            .blocks
            .get(height as usize..)
            .map(<[ChainedBlock]>::to_vec)
            .unwrap_or_default()
    }

    pub fn has_transaction(&self, id: TransactionId) -> bool {
        self.inner.lock().chain.transaction_index.contains_key(&id)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        let inner = self.inner.lock();
        let &(height, index) = inner.chain.transaction_index.get(&id)?;
        inner
            .chain
            .blocks
            .get(height as usize)
            .and_then(|block| block.block().transactions().get(index as usize))
            .cloned()
    }

    pub fn transaction_by_full_hash(&self, full_hash: Hash) -> Option<Arc<Transaction>> {
        let id = {
            let inner = self.inner.lock();
            *inner.chain.full_hash_index.get(&full_hash)?
        };
        self.transaction(id)
    }

    /// Every stored transaction ordered by `(id, timestamp)`: the
    /// milestone checksum ordering.
    pub fn transactions_for_checksum(&self) -> Vec<Arc<Transaction>> {
        let inner = self.inner.lock();
        let mut transactions: Vec<Arc<Transaction>> = inner
            .chain
            .blocks
            .iter()
            .flat_map(|block| block.block().transactions().iter().cloned())
            .collect();
        transactions.sort_by_key(|tx| (tx.id().0, tx.timestamp()));
        transactions
    }

    /// Number of stored blocks and transactions, for diagnostics.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (
            inner.chain.blocks.len(),
            inner.chain.transaction_index.len(),
        )
    }

    /// The block a peer should be sent next ids from, capped.
    pub fn block_ids_after(&self, id: BlockId, limit: usize) -> Vec<BlockId> {
        let inner = self.inner.lock();
        let Some(&height) = inner.chain.block_index.get(&id) else {
            return Vec::new();
        };
        inner
            .chain
            .blocks
            .iter()
            .skip(height as usize + 1)
            .take(limit)
            .map(ChainedBlock::id)
            .collect()
    }

    /// The wire form of a stored block, for gossip and peer serving.
    pub fn wire_block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.block(id).map(|chained| Arc::clone(chained.block()))
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ember_crypto::KeyPair;
    use ember_data_model::{
        constants::ONE_EMBER,
        transaction::{Attachment, TransactionBuilder},
        AccountId,
    };

    use super::*;
    use crate::state::VersionedTable;

    fn chain_of(length: u32) -> (Db, Vec<ChainedBlock>) {
        let db = Db::new();
        let keys = KeyPair::from_secret_phrase("db tests");
        let mut chained = Vec::new();

        for n in 0..length {
            let tx = TransactionBuilder::new(
                1,
                Attachment::Payment,
                keys.public_key(),
                n * 60 + 1,
                60,
            )
            .recipient(AccountId(1))
            .amount(ONE_EMBER)
            .sign(&keys);
            let block = Arc::new(
                Block::forge(
                    1,
                    n * 60,
                    chained
                        .last()
                        .map_or(BlockId(7), |prev: &ChainedBlock| prev.id()),
                    None,
                    tx.amount(),
                    tx.fee(),
                    tx.size(),
                    Hash::new(tx.bytes()),
                    vec![n as u8; 64],
                    vec![Arc::new(tx)],
                    &keys,
                )
                .unwrap(),
            );
            let next = match chained.last() {
                None => ChainedBlock::genesis(block),
                Some(prev) => prev.chain(block),
            };
            db.push_block(next.clone());
            chained.push(next);
        }
        (db, chained)
    }

    #[test]
    fn push_pop_and_indexes_agree() {
        let (db, chained) = chain_of(3);

        assert_eq!(db.height(), Some(2));
        for block in &chained {
            assert!(db.has_block(block.id()));
            assert_eq!(db.block_height(block.id()), Some(block.height()));
            for tx in block.block().transactions() {
                assert!(db.has_transaction(tx.id()));
                assert_eq!(
                    db.transaction_by_full_hash(tx.full_hash()).unwrap().id(),
                    tx.id()
                );
            }
        }

        let popped = db.pop_block().unwrap();
        assert_eq!(popped.id(), chained[2].id());
        assert!(!db.has_block(popped.id()));
        for tx in popped.block().transactions() {
            assert!(!db.has_transaction(tx.id()));
        }
    }

    #[test]
    fn genesis_cannot_be_popped() {
        let (db, _) = chain_of(1);
        assert!(db.pop_block().is_none());
        assert_eq!(db.height(), Some(0));
    }

    #[test]
    fn rollback_restores_chain_and_tables() {
        let (db, chained) = chain_of(2);
        let table: Arc<VersionedTable<&str, i32>> = Arc::new(VersionedTable::new("test"));
        let table_handle = Arc::clone(&table);
        db.register_table(table_handle);

        db.begin().unwrap();
        table.insert("k", 2, 42);
        let extra = chained[1].chain(Arc::clone(chained[1].block()));
        db.push_block(extra);
        assert_eq!(db.height(), Some(2));

        db.rollback();
        db.end();

        assert_eq!(db.height(), Some(1));
        assert_eq!(db.last_block().unwrap().id(), chained[1].id());
        assert_eq!(table.get(&"k"), None);
    }

    #[test]
    fn commit_keeps_changes_within_open_transaction() {
        let (db, chained) = chain_of(2);

        db.begin().unwrap();
        let extra = chained[1].chain(Arc::clone(chained[1].block()));
        db.push_block(extra.clone());
        db.commit().unwrap();

        let one_more = extra.chain(Arc::clone(chained[0].block()));
        db.push_block(one_more);
        db.rollback();
        db.end();

        // The committed block survived the later rollback.
        assert_eq!(db.height(), Some(2));
        assert_eq!(db.last_block().unwrap().id(), extra.id());
    }

    #[test]
    fn nested_begin_is_refused() {
        let (db, _) = chain_of(1);
        db.begin().unwrap();
        assert!(matches!(db.begin(), Err(Error::AlreadyInTransaction)));
        db.end();
        assert!(db.begin().is_ok());
        db.end();
    }

    #[test]
    fn delete_from_returns_ascending_tail() {
        let (db, chained) = chain_of(4);
        let deleted = db.delete_from(2);

        assert_eq!(db.height(), Some(1));
        assert_eq!(
            deleted.iter().map(ChainedBlock::height).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(!db.has_block(chained[3].id()));
    }

    #[test]
    fn checksum_ordering_is_id_then_timestamp() {
        let (db, _) = chain_of(5);
        let transactions = db.transactions_for_checksum();
        let keys: Vec<_> = transactions
            .iter()
            .map(|tx| (tx.id().0, tx.timestamp()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn block_ids_after_walks_forward() {
        let (db, chained) = chain_of(4);
        let ids = db.block_ids_after(chained[0].id(), 2);
        assert_eq!(ids, vec![chained[1].id(), chained[2].id()]);
        assert!(db.block_ids_after(BlockId(999), 10).is_empty());
    }
}
