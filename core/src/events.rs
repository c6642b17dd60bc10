//! The block lifecycle listener bus.
//!
//! Listeners are delivered synchronously, in registration order, on the
//! thread performing the chain transition. Subscriber lists are
//! copy-on-write so a listener may register or remove listeners while a
//! dispatch is in flight. A panicking listener is logged and skipped;
//! atomicity of the transition belongs to the store transaction, never
//! to observers.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ember_data_model::block::ChainedBlock;
use ember_logger::prelude::*;
use parking_lot::Mutex;

/// The moments in a block's life observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockEvent {
    /// A block passed validation and was committed.
    BlockPushed,
    /// A block was removed from the head during rollback.
    BlockPopped,
    /// This node forged a block and pushed it.
    BlockGenerated,
    /// A stored block was replayed during a rescan.
    BlockScanned,
    /// Fired inside the store transaction, before the block is written.
    BeforeBlockAccept,
    /// Fired after the unconfirmed effects applied, before the
    /// confirmed ones.
    BeforeBlockApply,
    /// Fired after the block's confirmed effects applied.
    AfterBlockApply,
    /// A rescan is starting; the payload is the replay starting head.
    RescanBegin,
    /// A rescan finished; the payload is the final head.
    RescanEnd,
}

/// A subscriber. Receives the block in chain position.
pub type Listener = Arc<dyn Fn(&ChainedBlock) + Send + Sync>;

/// Handle for removing a previously added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId {
    event: BlockEvent,
    token: u64,
}

/// Per-event ordered subscriber lists.
#[derive(Default)]
pub struct BlockListeners {
    slots: Mutex<HashMap<BlockEvent, Arc<Vec<(u64, Listener)>>>>,
    next_token: AtomicU64,
}

impl BlockListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `event`. Delivery order is registration
    /// order.
    pub fn add_listener(&self, event: BlockEvent, listener: Listener) -> ListenerId {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        let slot = slots.entry(event).or_default();
        let mut replacement = Vec::with_capacity(slot.len() + 1);
        replacement.extend(slot.iter().cloned());
        replacement.push((token, listener));
        *slot = Arc::new(replacement);
        ListenerId { event, token }
    }

    /// Unsubscribe. Returns whether the listener was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id.event) else {
            return false;
        };
        if !slot.iter().any(|(token, _)| *token == id.token) {
            return false;
        }
        let replacement = slot
            .iter()
            .filter(|(token, _)| *token != id.token)
            .cloned()
            .collect();
        *slot = Arc::new(replacement);
        true
    }

    /// Deliver `block` to every subscriber of `event`.
    pub fn notify(&self, event: BlockEvent, block: &ChainedBlock) {
        let slot = {
            let slots = self.slots.lock();
            slots.get(&event).cloned()
        };
        let Some(slot) = slot else { return };

        for (_, listener) in slot.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(block))).is_err() {
                error!(?event, height = block.height(), "listener panicked; continuing");
            }
        }
    }
}

impl core::fmt::Debug for BlockListeners {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let slots = self.slots.lock();
        let counts: HashMap<_, _> = slots.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("BlockListeners").field("slots", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use ember_crypto::KeyPair;
    use ember_data_model::{
        block::{Block, ChainedBlock},
        transaction::{Attachment, TransactionBuilder},
        AccountId, BlockId,
    };
    use parking_lot::Mutex;

    use super::*;

    fn some_block() -> ChainedBlock {
        let keys = KeyPair::from_secret_phrase("events");
        let tx = TransactionBuilder::new(1, Attachment::Payment, keys.public_key(), 10, 60)
            .recipient(AccountId(1))
            .amount(100_000_000)
            .sign(&keys);
        let block = Block::forge(
            1,
            60,
            BlockId(1),
            None,
            tx.amount(),
            tx.fee(),
            tx.size(),
            ember_crypto::Hash::new(tx.bytes()),
            vec![0; 64],
            vec![Arc::new(tx)],
            &keys,
        )
        .unwrap();
        ChainedBlock::genesis(Arc::new(block))
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let listeners = BlockListeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            listeners.add_listener(
                BlockEvent::BlockPushed,
                Arc::new(move |_| order.lock().push(tag)),
            );
        }

        listeners.notify(BlockEvent::BlockPushed, &some_block());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn removed_listener_stays_silent() {
        let listeners = BlockListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let id = {
            let calls = Arc::clone(&calls);
            listeners.add_listener(
                BlockEvent::BlockPopped,
                Arc::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        assert!(listeners.remove_listener(id));
        assert!(!listeners.remove_listener(id));
        listeners.notify(BlockEvent::BlockPopped, &some_block());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_do_not_leak_across_kinds() {
        let listeners = BlockListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        listeners.add_listener(
            BlockEvent::BlockScanned,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        listeners.notify(BlockEvent::BlockPushed, &some_block());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        listeners.notify(BlockEvent::BlockScanned, &some_block());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let listeners = BlockListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        listeners.add_listener(BlockEvent::BlockPushed, Arc::new(|_| panic!("bad observer")));
        let counter = Arc::clone(&calls);
        listeners.add_listener(
            BlockEvent::BlockPushed,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        listeners.notify(BlockEvent::BlockPushed, &some_block());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let listeners = Arc::new(BlockListeners::new());

        let inner = Arc::clone(&listeners);
        listeners.add_listener(
            BlockEvent::BlockPushed,
            Arc::new(move |_| {
                inner.add_listener(BlockEvent::BlockPushed, Arc::new(|_| {}));
            }),
        );

        // Must not deadlock or invalidate the in-flight snapshot.
        listeners.notify(BlockEvent::BlockPushed, &some_block());
    }
}
