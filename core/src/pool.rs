//! The unconfirmed transaction pool.
//!
//! Holds transactions waiting for a block, hands ordered snapshots to
//! the generator, and keeps the *process later* queue: transactions
//! from popped or rejected blocks that should be reconsidered once the
//! chain settles.

use std::sync::Arc;

use dashmap::DashMap;
use ember_data_model::{
    constants::{epoch_time, MAX_TIMEDRIFT},
    transaction::Transaction,
    TransactionId, ValidationError,
};
use ember_logger::prelude::*;
use parking_lot::Mutex;

use crate::db::Db;

/// Why a transaction was refused at the door.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PoolError {
    /// already in the pool
    AlreadyKnown,
    /// already confirmed in the chain
    AlreadyConfirmed,
    /// expired
    Expired,
    /// timestamp too far in the future
    InFuture,
    /// {0}
    Invalid(#[from] ValidationError),
}

/// The pool proper. Concurrent submitters share the map; the ordered
/// views the generator needs are built on demand under the blockchain
/// lock.
#[derive(Default)]
pub struct UnconfirmedPool {
    transactions: DashMap<TransactionId, Arc<Transaction>>,
    /// Deferred re-ingestion queue. Processed after pushes settle.
    waiting: Mutex<Vec<Arc<Transaction>>>,
}

impl UnconfirmedPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a transaction to the pool.
    pub fn submit(&self, tx: Arc<Transaction>, db: &Db) -> Result<(), PoolError> {
        let now = epoch_time();
        if tx.timestamp() > now + MAX_TIMEDRIFT {
            return Err(PoolError::InFuture);
        }
        if tx.expiration() < now {
            return Err(PoolError::Expired);
        }
        if db.has_transaction(tx.id()) {
            return Err(PoolError::AlreadyConfirmed);
        }
        tx.validate()?;
        if !tx.verify_signature() {
            return Err(PoolError::Invalid(ValidationError::NotValid(
                "bad signature".into(),
            )));
        }
        if self.transactions.contains_key(&tx.id()) {
            return Err(PoolError::AlreadyKnown);
        }
        self.transactions.insert(tx.id(), tx);
        Ok(())
    }

    /// All pooled transactions, ordered by `(id, timestamp)`.
    pub fn all(&self) -> Vec<Arc<Transaction>> {
        let mut transactions: Vec<Arc<Transaction>> = self
            .transactions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        transactions.sort_by_key(|tx| tx.sort_key());
        transactions
    }

    /// Remove a transaction from the pool and the waiting queue.
    pub fn remove(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.waiting.lock().retain(|queued| queued.id() != id);
        self.transactions.remove(&id).map(|(_, tx)| tx)
    }

    /// Move every pooled transaction to the waiting queue. Called at
    /// the top of a block's application; survivors are re-selected once
    /// the block settles.
    pub fn requeue_all(&self) {
        let mut waiting = self.waiting.lock();
        let ids: Vec<TransactionId> = self.transactions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.transactions.remove(&id) {
                waiting.push(tx);
            }
        }
    }

    /// Defer transactions from popped or rejected blocks.
    pub fn process_later(&self, transactions: impl IntoIterator<Item = Arc<Transaction>>) {
        self.waiting.lock().extend(transactions);
    }

    /// Re-ingest the waiting queue: back into the pool unless
    /// meanwhile confirmed, expired or invalid.
    pub fn process_waiting(&self, db: &Db) {
        let waiting: Vec<Arc<Transaction>> = self.waiting.lock().drain(..).collect();
        let mut readmitted = 0_usize;
        for tx in waiting {
            match self.submit(tx, db) {
                Ok(()) => readmitted += 1,
                Err(PoolError::AlreadyKnown | PoolError::AlreadyConfirmed) => {}
                Err(error) => debug!(%error, "dropping waiting transaction"),
            }
        }
        if readmitted > 0 {
            debug!(readmitted, "requeued waiting transactions");
        }
    }

    /// Drop confirmed transactions from the pool and the waiting queue.
    pub fn notify_confirmed<'t>(&self, confirmed: impl IntoIterator<Item = &'t Arc<Transaction>>) {
        let mut waiting = self.waiting.lock();
        for tx in confirmed {
            self.transactions.remove(&tx.id());
            waiting.retain(|queued| queued.id() != tx.id());
        }
    }

    /// Drop everything past its deadline.
    pub fn sweep_expired(&self) {
        let now = epoch_time();
        self.transactions.retain(|_, tx| tx.expiration() >= now);
        self.waiting.lock().retain(|tx| tx.expiration() >= now);
    }

    /// Number of pooled transactions (waiting queue excluded).
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
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

    fn keys() -> KeyPair {
        KeyPair::from_secret_phrase("pool tests")
    }

    fn payment(timestamp: u32, amount: i64) -> Arc<Transaction> {
        Arc::new(
            TransactionBuilder::new(1, Attachment::Payment, keys().public_key(), timestamp, 1440)
                .recipient(AccountId(9))
                .amount(amount)
                .fee(ONE_EMBER)
                .sign(&keys()),
        )
    }

    #[test]
    fn submit_accepts_and_dedupes() {
        let pool = UnconfirmedPool::new();
        let db = Db::new();
        let tx = payment(epoch_time(), ONE_EMBER);

        pool.submit(Arc::clone(&tx), &db).unwrap();
        assert!(matches!(
            pool.submit(tx, &db),
            Err(PoolError::AlreadyKnown)
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn future_and_invalid_are_refused() {
        let pool = UnconfirmedPool::new();
        let db = Db::new();

        let future = payment(epoch_time() + MAX_TIMEDRIFT + 100, ONE_EMBER);
        assert!(matches!(pool.submit(future, &db), Err(PoolError::InFuture)));

        let worthless = payment(epoch_time(), 0);
        assert!(matches!(
            pool.submit(worthless, &db),
            Err(PoolError::Invalid(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_id_then_timestamp() {
        let pool = UnconfirmedPool::new();
        let db = Db::new();
        for n in 0..5 {
            pool.submit(payment(epoch_time(), (n + 1) * ONE_EMBER), &db)
                .unwrap();
        }

        let snapshot = pool.all();
        let keys: Vec<_> = snapshot.iter().map(|tx| tx.sort_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn requeue_then_process_waiting_round_trips() {
        let pool = UnconfirmedPool::new();
        let db = Db::new();
        let tx = payment(epoch_time(), ONE_EMBER);
        pool.submit(Arc::clone(&tx), &db).unwrap();

        pool.requeue_all();
        assert!(pool.is_empty());

        pool.process_waiting(&db);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.all()[0].id(), tx.id());
    }

    #[test]
    fn confirmed_transactions_leave_both_queues() {
        let pool = UnconfirmedPool::new();
        let db = Db::new();
        let pooled = payment(epoch_time(), ONE_EMBER);
        let waiting = payment(epoch_time() + 1, 2 * ONE_EMBER);

        pool.submit(Arc::clone(&pooled), &db).unwrap();
        pool.process_later([Arc::clone(&waiting)]);

        pool.notify_confirmed([&pooled, &waiting]);
        pool.process_waiting(&db);
        assert!(pool.is_empty());
    }
}
