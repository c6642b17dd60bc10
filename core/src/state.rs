//! Chain state: versioned derived tables and the ledgers built on
//! them.
//!
//! A derived table is a projection of chain state keyed by height.
//! Every write records a new version at the height that caused it, so
//! the table can be rewound (`rollback`), compacted (`trim`) or reset
//! (`truncate`) without consulting the blocks again. Tables also
//! participate in the store's connection-style transactions.

use std::{collections::HashMap, hash::Hash as StdHash, sync::Arc};

use ember_crypto::PublicKey;
use ember_data_model::{
    constants::{genesis, ONE_EMBER},
    transaction::{Attachment, Transaction},
    AccountId, ValidationError,
};
use parking_lot::Mutex;

/// The contract every chain-state projection fulfills. Registration
/// order with the processor is rollback and trim order.
pub trait DerivedTable: Send + Sync {
    /// Table name for logs.
    fn name(&self) -> &'static str;

    /// Undo everything above `height`.
    fn rollback(&self, height: u32);

    /// Compact history below `height`; versions that can no longer be
    /// rolled back to are dropped.
    fn trim(&self, height: u32);

    /// Forget everything.
    fn truncate(&self);

    /// Join an open store transaction.
    fn begin(&self);

    /// Keep changes made since `begin`/the previous `commit`.
    fn commit(&self);

    /// Drop changes made since `begin`/the previous `commit`.
    fn abort(&self);

    /// Leave the transaction, keeping current data.
    fn release(&self);
}

type Versions<V> = Vec<(u32, Option<V>)>;

struct TableInner<K, V> {
    rows: HashMap<K, Versions<V>>,
    backup: Option<HashMap<K, Versions<V>>>,
}

/// A height-versioned key/value table: the building block for derived
/// state. The latest version of a key wins; a `None` version is a
/// deletion marker.
pub struct VersionedTable<K, V> {
    name: &'static str,
    inner: Mutex<TableInner<K, V>>,
}

impl<K, V> VersionedTable<K, V>
where
    K: Clone + Eq + StdHash,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(TableInner {
                rows: HashMap::new(),
                backup: None,
            }),
        }
    }

    /// Current value of `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        inner
            .rows
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|(_, value)| value.clone())
    }

    /// Record `value` for `key` as of `height`. A second write at the
    /// same height replaces the version in place.
    pub fn insert(&self, key: K, height: u32, value: V) {
        self.put(key, height, Some(value));
    }

    /// Record deletion of `key` as of `height`.
    pub fn remove(&self, key: K, height: u32) {
        self.put(key, height, None);
    }

    fn put(&self, key: K, height: u32, value: Option<V>) {
        let mut inner = self.inner.lock();
        let versions = inner.rows.entry(key).or_default();
        match versions.last_mut() {
            Some((last_height, slot)) if *last_height == height => *slot = value,
            _ => versions.push((height, value)),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .rows
            .values()
            .filter(|versions| matches!(versions.last(), Some((_, Some(_)))))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> DerivedTable for VersionedTable<K, V>
where
    K: Clone + Eq + StdHash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn rollback(&self, height: u32) {
        let mut inner = self.inner.lock();
        inner.rows.retain(|_, versions| {
            versions.retain(|(version_height, _)| *version_height <= height);
            !versions.is_empty()
        });
    }

    fn trim(&self, height: u32) {
        let mut inner = self.inner.lock();
        inner.rows.retain(|_, versions| {
            // Keep every version at or above the horizon, plus the
            // newest one below it; older ones can never be rolled back
            // to again.
            let last_below = versions
                .iter()
                .rposition(|(version_height, _)| *version_height < height);
            if let Some(last_below) = last_below {
                versions.drain(..last_below);
            }
            // A key whose only remaining version is a pre-horizon
            // deletion marker is gone for good.
            !matches!(versions.as_slice(), [(version_height, None)] if *version_height < height)
        });
    }

    fn truncate(&self) {
        self.inner.lock().rows.clear();
    }

    fn begin(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.backup.is_none(), "nested table transaction");
        inner.backup = Some(inner.rows.clone());
    }

    fn commit(&self) {
        let mut inner = self.inner.lock();
        if inner.backup.is_some() {
            inner.backup = Some(inner.rows.clone());
        }
    }

    fn abort(&self) {
        let mut inner = self.inner.lock();
        if let Some(backup) = inner.backup.take() {
            inner.rows = backup;
            inner.backup = Some(inner.rows.clone());
        }
    }

    fn release(&self) {
        self.inner.lock().backup = None;
    }
}

/// Balances and key material of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    /// Published public key, once the account has sent or been
    /// announced.
    pub public_key: Option<PublicKey>,
    /// Confirmed balance in units.
    pub balance: i64,
    /// Balance minus the unconfirmed effects of the block being
    /// applied.
    pub unconfirmed_balance: i64,
    /// Lifetime fees earned by forging.
    pub forged_fees: i64,
}

/// The account balance table.
pub struct AccountLedger {
    table: VersionedTable<AccountId, AccountState>,
    creator_id: AccountId,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self {
            table: VersionedTable::new("account"),
            creator_id: AccountId::from_public_key(&PublicKey::from_bytes(
                genesis::CREATOR_PUBLIC_KEY,
            )),
        }
    }

    pub fn get(&self, id: AccountId) -> Option<AccountState> {
        self.table.get(&id)
    }

    /// Confirmed balance in units; zero for unknown accounts.
    pub fn balance(&self, id: AccountId) -> i64 {
        self.get(id).map_or(0, |account| account.balance)
    }

    /// The stake that counts toward forging, in whole coins.
    pub fn effective_balance(&self, id: AccountId) -> i64 {
        self.balance(id) / ONE_EMBER
    }

    /// Number of known accounts.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Create the genesis creator account at height 0, before the
    /// allocation payments drive its balance negative.
    pub fn bootstrap_creator(&self) {
        self.table.insert(
            self.creator_id,
            0,
            AccountState {
                public_key: Some(PublicKey::from_bytes(genesis::CREATOR_PUBLIC_KEY)),
                ..AccountState::default()
            },
        );
    }

    fn update(&self, id: AccountId, height: u32, mutate: impl FnOnce(&mut AccountState)) {
        let mut account = self.get(id).unwrap_or_default();
        mutate(&mut account);
        self.table.insert(id, height, account);
    }

    /// Reserve `tx`'s spend against the sender's unconfirmed balance.
    /// Fails on insufficient funds: the double-spend gate. The genesis
    /// creator is exempt; its balance is negative by the total supply.
    #[must_use]
    pub fn apply_unconfirmed(&self, tx: &Transaction, height: u32) -> bool {
        let sender = tx.sender_id();
        let total = tx.amount().saturating_add(tx.fee());
        let available = self
            .get(sender)
            .map_or(0, |account| account.unconfirmed_balance);

        if available < total && sender != self.creator_id {
            return false;
        }
        self.update(sender, height, |account| {
            account.unconfirmed_balance -= total;
        });
        true
    }

    /// Undo a reservation made by [`Self::apply_unconfirmed`].
    pub fn undo_unconfirmed(&self, tx: &Transaction, height: u32) {
        self.update(tx.sender_id(), height, |account| {
            account.unconfirmed_balance += tx.amount().saturating_add(tx.fee());
        });
    }

    /// Confirm `tx`: move the reserved spend out of the sender's
    /// balance, credit the recipient, and publish keys.
    pub fn apply(&self, tx: &Transaction, height: u32) {
        let total = tx.amount().saturating_add(tx.fee());
        self.update(tx.sender_id(), height, |account| {
            account.balance -= total;
            if account.public_key.is_none() {
                account.public_key = Some(tx.sender_public_key());
            }
        });

        if tx.amount() > 0 {
            self.update(tx.recipient_id(), height, |account| {
                account.balance += tx.amount();
                account.unconfirmed_balance += tx.amount();
            });
        }
        if let Some(key) = tx.appendices().announced_public_key {
            self.update(tx.recipient_id(), height, |account| {
                if account.public_key.is_none() {
                    account.public_key = Some(key);
                }
            });
        }
    }

    /// Credit a block's fees to its generator.
    pub fn apply_forged_fees(&self, generator: AccountId, fees: i64, height: u32) {
        if fees == 0 {
            return;
        }
        self.update(generator, height, |account| {
            account.balance += fees;
            account.unconfirmed_balance += fees;
            account.forged_fees += fees;
        });
    }

}

impl Default for AccountLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivedTable for AccountLedger {
    fn name(&self) -> &'static str {
        self.table.name()
    }

    fn rollback(&self, height: u32) {
        self.table.rollback(height);
    }

    fn trim(&self, height: u32) {
        self.table.trim(height);
    }

    fn truncate(&self) {
        self.table.truncate();
    }

    fn begin(&self) {
        self.table.begin();
    }

    fn commit(&self) {
        self.table.commit();
    }

    fn abort(&self) {
        self.table.abort();
    }

    fn release(&self) {
        self.table.release();
    }
}

/// One alias binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub account_id: AccountId,
    /// The alias as assigned, original casing preserved.
    pub alias: String,
    pub uri: String,
}

/// The alias name table, keyed by lower-cased name.
pub struct AliasRegistry {
    table: VersionedTable<String, Alias>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self {
            table: VersionedTable::new("alias"),
        }
    }

    /// Look up an alias, case-insensitively.
    pub fn get(&self, name: &str) -> Option<Alias> {
        self.table.get(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn assign(&self, account_id: AccountId, alias: &str, uri: &str, height: u32) {
        self.table.insert(
            alias.to_lowercase(),
            height,
            Alias {
                account_id,
                alias: alias.to_owned(),
                uri: uri.to_owned(),
            },
        );
    }
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivedTable for AliasRegistry {
    fn name(&self) -> &'static str {
        self.table.name()
    }

    fn rollback(&self, height: u32) {
        self.table.rollback(height);
    }

    fn trim(&self, height: u32) {
        self.table.trim(height);
    }

    fn truncate(&self) {
        self.table.truncate();
    }

    fn begin(&self) {
        self.table.begin();
    }

    fn commit(&self) {
        self.table.commit();
    }

    fn abort(&self) {
        self.table.abort();
    }

    fn release(&self) {
        self.table.release();
    }
}

/// The ledgers a transaction's application touches, grouped.
pub struct ChainState {
    pub accounts: Arc<AccountLedger>,
    pub aliases: Arc<AliasRegistry>,
}

impl ChainState {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(AccountLedger::new()),
            aliases: Arc::new(AliasRegistry::new()),
        }
    }

    /// Type-specific validation: the stateless rules plus whatever
    /// needs current chain state.
    pub fn validate(&self, tx: &Transaction) -> Result<(), ValidationError> {
        tx.validate()?;

        if let Attachment::AliasAssignment { alias, .. } = tx.attachment() {
            if let Some(existing) = self.aliases.get(alias) {
                if existing.account_id != tx.sender_id() {
                    // Ownership may lapse if the holding branch is
                    // rolled back, so this is not a permanent fault.
                    return Err(ValidationError::NotCurrentlyValid(format!(
                        "alias `{alias}` is owned by account {}",
                        existing.account_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply `tx`'s confirmed effects at `height`.
    pub fn apply_transaction(&self, tx: &Transaction, height: u32) {
        self.accounts.apply(tx, height);

        match tx.attachment() {
            Attachment::Payment | Attachment::ArbitraryMessage { .. } => {}
            Attachment::AliasAssignment { alias, uri } => {
                self.aliases.assign(tx.sender_id(), alias, uri, height);
            }
        }
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ember_crypto::KeyPair;
    use ember_data_model::transaction::TransactionBuilder;

    use super::*;

    #[test]
    fn latest_version_wins_and_rollback_rewinds() {
        let table: VersionedTable<&str, i32> = VersionedTable::new("test");
        table.insert("k", 1, 10);
        table.insert("k", 5, 50);
        table.insert("k", 9, 90);

        assert_eq!(table.get(&"k"), Some(90));

        table.rollback(5);
        assert_eq!(table.get(&"k"), Some(50));

        table.rollback(0);
        assert_eq!(table.get(&"k"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn deletion_markers_rollback_too() {
        let table: VersionedTable<&str, i32> = VersionedTable::new("test");
        table.insert("k", 1, 10);
        table.remove("k", 3);

        assert_eq!(table.get(&"k"), None);
        table.rollback(2);
        assert_eq!(table.get(&"k"), Some(10));
    }

    #[test]
    fn trim_drops_unreachable_versions() {
        let table: VersionedTable<&str, i32> = VersionedTable::new("test");
        table.insert("kept", 1, 10);
        table.insert("kept", 7, 70);
        table.insert("gone", 2, 20);
        table.remove("gone", 3);

        table.trim(5);

        // Values survive trimming...
        assert_eq!(table.get(&"kept"), Some(70));
        // ...rollback into the trimmed region keeps the newest
        // pre-horizon version...
        table.rollback(6);
        assert_eq!(table.get(&"kept"), Some(10));
        // ...and fully deleted keys disappear.
        assert_eq!(table.get(&"gone"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn abort_restores_the_transaction_snapshot() {
        let table: VersionedTable<&str, i32> = VersionedTable::new("test");
        table.insert("k", 1, 10);

        table.begin();
        table.insert("k", 2, 20);
        table.insert("fresh", 2, 1);
        table.abort();

        assert_eq!(table.get(&"k"), Some(10));
        assert_eq!(table.get(&"fresh"), None);

        // Commit then further changes, then abort: only the
        // post-commit changes are lost.
        table.insert("k", 3, 30);
        table.commit();
        table.insert("k", 4, 40);
        table.abort();
        assert_eq!(table.get(&"k"), Some(30));
        table.release();
    }

    fn funded_ledger(keys: &KeyPair) -> AccountLedger {
        let ledger = AccountLedger::new();
        let id = AccountId::from_public_key(&keys.public_key());
        ledger.update(id, 0, |account| {
            account.balance = 10 * ONE_EMBER;
            account.unconfirmed_balance = 10 * ONE_EMBER;
        });
        ledger
    }

    fn payment(keys: &KeyPair, amount: i64) -> Transaction {
        TransactionBuilder::new(1, Attachment::Payment, keys.public_key(), 100, 60)
            .recipient(AccountId(777))
            .amount(amount)
            .fee(ONE_EMBER)
            .sign(keys)
    }

    #[test]
    fn double_spend_is_refused() {
        let keys = KeyPair::from_secret_phrase("spender");
        let ledger = funded_ledger(&keys);
        let tx = payment(&keys, 6 * ONE_EMBER);

        assert!(ledger.apply_unconfirmed(&tx, 1));
        // 6 + 1 fee reserved; another 6 + 1 does not fit in 10.
        assert!(!ledger.apply_unconfirmed(&tx, 1));

        ledger.undo_unconfirmed(&tx, 1);
        assert!(ledger.apply_unconfirmed(&tx, 1));
    }

    #[test]
    fn apply_moves_value_and_publishes_keys() {
        let keys = KeyPair::from_secret_phrase("spender");
        let ledger = funded_ledger(&keys);
        let sender = AccountId::from_public_key(&keys.public_key());
        let tx = payment(&keys, 4 * ONE_EMBER);

        assert!(ledger.apply_unconfirmed(&tx, 1));
        ledger.apply(&tx, 1);

        let sender_state = ledger.get(sender).unwrap();
        assert_eq!(sender_state.balance, 5 * ONE_EMBER);
        assert_eq!(sender_state.unconfirmed_balance, 5 * ONE_EMBER);
        assert_eq!(sender_state.public_key, Some(keys.public_key()));

        let recipient_state = ledger.get(AccountId(777)).unwrap();
        assert_eq!(recipient_state.balance, 4 * ONE_EMBER);
        assert_eq!(recipient_state.unconfirmed_balance, 4 * ONE_EMBER);
    }

    #[test]
    fn creator_may_overdraw() {
        let ledger = AccountLedger::new();
        ledger.bootstrap_creator();
        let genesis_payment = TransactionBuilder::new(
            0,
            Attachment::Payment,
            PublicKey::from_bytes(genesis::CREATOR_PUBLIC_KEY),
            0,
            1,
        )
        .recipient(AccountId(genesis::RECIPIENTS[0]))
        .amount(genesis::AMOUNTS[0] * ONE_EMBER)
        .presigned(ember_crypto::Signature::from_bytes(genesis::SIGNATURES[0]));

        assert!(ledger.apply_unconfirmed(&genesis_payment, 0));
        ledger.apply(&genesis_payment, 0);
        assert!(ledger.balance(ledger.creator_id) < 0);
    }

    #[test]
    fn forged_fees_accrue_to_generator() {
        let ledger = AccountLedger::new();
        let generator = AccountId(5);
        ledger.apply_forged_fees(generator, 3 * ONE_EMBER, 8);

        let state = ledger.get(generator).unwrap();
        assert_eq!(state.balance, 3 * ONE_EMBER);
        assert_eq!(state.forged_fees, 3 * ONE_EMBER);
    }

    #[test]
    fn alias_ownership_gates_reassignment() {
        let state = ChainState::new();
        let owner = KeyPair::from_secret_phrase("owner");
        let thief = KeyPair::from_secret_phrase("thief");

        let claim = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "ember".into(),
                uri: "acct:owner".into(),
            },
            owner.public_key(),
            10,
            60,
        )
        .sign(&owner);
        state.apply_transaction(&claim, 1);
        assert_eq!(state.aliases.get("EMBER").unwrap().uri, "acct:owner");

        let steal = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "ember".into(),
                uri: "acct:thief".into(),
            },
            thief.public_key(),
            20,
            60,
        )
        .sign(&thief);
        let error = state.validate(&steal).unwrap_err();
        assert!(error.is_retriable());

        // The owner itself may reassign.
        let update = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "Ember".into(),
                uri: "acct:other".into(),
            },
            owner.public_key(),
            30,
            60,
        )
        .sign(&owner);
        assert!(state.validate(&update).is_ok());
    }
}
