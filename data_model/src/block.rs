//! Blocks: the wire-level block with its canonical byte layout and
//! JSON form, signature and generation-signature verification, and the
//! chain values (height, base target, cumulative difficulty) a block
//! acquires when it is attached to the chain.

use std::sync::Arc;

use ember_crypto::{Hash, KeyPair, PublicKey, Sha256Builder, Signature};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{INITIAL_BASE_TARGET, MAX_BASE_TARGET, MAX_TRANSACTIONS_PER_BLOCK},
    transaction::Transaction,
    AccountId, BlockId, ValidationError,
};

/// A signed block as produced by a generator or parsed off the wire.
///
/// Immutable. Chain placement (height, targets, difficulty) lives in
/// [`ChainedBlock`], which the processor assigns when the block is
/// attached on top of its predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "BlockRepr", into = "BlockRepr")]
pub struct Block {
    version: u8,
    timestamp: u32,
    previous_block_id: Option<BlockId>,
    /// SHA-256 of the previous block's bytes; carried from version 2 on.
    previous_block_hash: Option<Hash>,
    total_amount: i64,
    total_fee: i64,
    payload_length: u32,
    payload_hash: Hash,
    generator_public_key: PublicKey,
    /// 64 bytes at version 1, 32 bytes from version 2 on.
    generation_signature: Vec<u8>,
    block_signature: Signature,
    transactions: Vec<Arc<Transaction>>,
    id: BlockId,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        version: u8,
        timestamp: u32,
        previous_block_id: Option<BlockId>,
        previous_block_hash: Option<Hash>,
        total_amount: i64,
        total_fee: i64,
        payload_length: u32,
        payload_hash: Hash,
        generator_public_key: PublicKey,
        generation_signature: Vec<u8>,
        block_signature: Signature,
        transactions: Vec<Arc<Transaction>>,
        id_override: Option<BlockId>,
    ) -> Result<Self, ValidationError> {
        let expected_generation_signature_length = if version < 2 { 64 } else { 32 };
        if generation_signature.len() != expected_generation_signature_length {
            return Err(ValidationError::NotValid(format!(
                "generation signature is {} bytes, version {version} carries {}",
                generation_signature.len(),
                expected_generation_signature_length,
            )));
        }
        if (version >= 2) != previous_block_hash.is_some() {
            return Err(ValidationError::NotValid(
                "previous block hash presence does not match block version".into(),
            ));
        }
        if transactions.len() > MAX_TRANSACTIONS_PER_BLOCK {
            return Err(ValidationError::NotValid(format!(
                "{} transactions exceed the block limit",
                transactions.len()
            )));
        }

        let mut block = Self {
            version,
            timestamp,
            previous_block_id,
            previous_block_hash,
            total_amount,
            total_fee,
            payload_length,
            payload_hash,
            generator_public_key,
            generation_signature,
            block_signature,
            transactions,
            id: BlockId(0),
        };
        block.id = id_override.unwrap_or_else(|| BlockId(Hash::new(block.bytes()).to_id()));
        Ok(block)
    }

    /// Build a block around an externally produced signature. The
    /// genesis block is assembled this way from embedded constants,
    /// with its hard-coded id.
    #[allow(clippy::too_many_arguments)]
    pub fn presigned(
        version: u8,
        timestamp: u32,
        previous_block_id: Option<BlockId>,
        previous_block_hash: Option<Hash>,
        total_amount: i64,
        total_fee: i64,
        payload_length: u32,
        payload_hash: Hash,
        generator_public_key: PublicKey,
        generation_signature: Vec<u8>,
        block_signature: Signature,
        transactions: Vec<Arc<Transaction>>,
        id_override: Option<BlockId>,
    ) -> Result<Self, ValidationError> {
        Self::from_parts(
            version,
            timestamp,
            previous_block_id,
            previous_block_hash,
            total_amount,
            total_fee,
            payload_length,
            payload_hash,
            generator_public_key,
            generation_signature,
            block_signature,
            transactions,
            id_override,
        )
    }

    /// Assemble and sign a freshly generated block.
    #[allow(clippy::too_many_arguments)]
    pub fn forge(
        version: u8,
        timestamp: u32,
        previous_block_id: BlockId,
        previous_block_hash: Option<Hash>,
        total_amount: i64,
        total_fee: i64,
        payload_length: u32,
        payload_hash: Hash,
        generation_signature: Vec<u8>,
        transactions: Vec<Arc<Transaction>>,
        keys: &KeyPair,
    ) -> Result<Self, ValidationError> {
        let unsigned = Self::from_parts(
            version,
            timestamp,
            Some(previous_block_id),
            previous_block_hash,
            total_amount,
            total_fee,
            payload_length,
            payload_hash,
            keys.public_key(),
            generation_signature.clone(),
            Signature::zeroed(),
            transactions.clone(),
            None,
        )?;
        let block_signature = keys.sign(&unsigned.bytes());

        Self::from_parts(
            version,
            timestamp,
            Some(previous_block_id),
            previous_block_hash,
            total_amount,
            total_fee,
            payload_length,
            payload_hash,
            keys.public_key(),
            generation_signature,
            block_signature,
            transactions,
            None,
        )
    }

    /// Canonical bytes, block signature included. The block id is the
    /// first 8 bytes of the SHA-256 of this encoding.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes_with_signature(&self.block_signature)
    }

    /// Canonical bytes with the signature slot zeroed; the signed and
    /// verified form.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        self.bytes_with_signature(&Signature::zeroed())
    }

    fn bytes_with_signature(&self, signature: &Signature) -> Vec<u8> {
        let mut out = Vec::with_capacity(224);
        out.extend_from_slice(&u32::from(self.version).to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(
            &self
                .previous_block_id
                .map_or(0, |id| id.0)
                .to_le_bytes(),
        );
        out.extend_from_slice(&(self.transactions.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.total_amount.to_le_bytes());
        out.extend_from_slice(&self.total_fee.to_le_bytes());
        out.extend_from_slice(&self.payload_length.to_le_bytes());
        out.extend_from_slice(self.payload_hash.as_ref());
        out.extend_from_slice(self.generator_public_key.as_ref());
        out.extend_from_slice(&self.generation_signature);
        if let Some(previous_block_hash) = &self.previous_block_hash {
            out.extend_from_slice(previous_block_hash.as_ref());
        }
        out.extend_from_slice(signature.as_ref());
        out
    }

    /// Verify the block signature against the generator key.
    pub fn verify_block_signature(&self) -> bool {
        self.generator_public_key
            .verify(&self.unsigned_bytes(), &self.block_signature)
    }

    /// Verify that this block's generation signature is correctly
    /// derived from the previous block's. The stake-dependent hit check
    /// is separate; see [`hit`] and [`hit_target`].
    pub fn verify_generation_signature(&self, previous: &Block) -> bool {
        if self.version < 2 {
            // Version 1 generation signatures are real signatures over
            // the previous generation signature.
            let Ok(signature) = <[u8; 64]>::try_from(self.generation_signature.as_slice()) else {
                return false;
            };
            self.generator_public_key.verify(
                &previous.generation_signature,
                &Signature::from_bytes(signature),
            )
        } else {
            let mut digest = Sha256Builder::new();
            digest.update(&previous.generation_signature);
            digest.update(self.generator_public_key.as_ref());
            digest.finalize().as_ref() == self.generation_signature.as_slice()
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn previous_block_id(&self) -> Option<BlockId> {
        self.previous_block_id
    }

    pub fn previous_block_hash(&self) -> Option<Hash> {
        self.previous_block_hash
    }

    pub fn total_amount(&self) -> i64 {
        self.total_amount
    }

    pub fn total_fee(&self) -> i64 {
        self.total_fee
    }

    pub fn payload_length(&self) -> u32 {
        self.payload_length
    }

    pub fn payload_hash(&self) -> Hash {
        self.payload_hash
    }

    pub fn generator_public_key(&self) -> PublicKey {
        self.generator_public_key
    }

    pub fn generator_id(&self) -> AccountId {
        AccountId::from_public_key(&self.generator_public_key)
    }

    pub fn generation_signature(&self) -> &[u8] {
        &self.generation_signature
    }

    pub fn block_signature(&self) -> Signature {
        self.block_signature
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    /// True only for the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.previous_block_id.is_none()
    }
}

/// The proof-of-stake *hit* of a generation signature: the first
/// 8 bytes of its SHA-256, as an integer. A generator may forge when
/// its hit falls under [`hit_target`].
pub fn hit(generation_signature: &[u8]) -> BigUint {
    BigUint::from(Hash::new(generation_signature).to_id())
}

/// The hit ceiling for a generator with `effective_balance` whole
/// coins, `elapsed` seconds after the previous block, against
/// `base_target`.
pub fn hit_target(base_target: u64, effective_balance: i64, elapsed: u32) -> BigUint {
    BigUint::from(base_target)
        * BigUint::from(effective_balance.max(0) as u64)
        * BigUint::from(elapsed)
}

/// Retarget for the block after one that carried `previous_target`,
/// forged `elapsed` seconds later. The target tracks the one-minute
/// cadence, moving at most a factor of two per block and never past
/// the global bounds.
pub fn calculate_base_target(previous_target: u64, elapsed: u32) -> u64 {
    let scaled = previous_target.saturating_mul(u64::from(elapsed)) / 60;
    scaled
        .clamp(previous_target / 2, previous_target.saturating_mul(2))
        .clamp(1, MAX_BASE_TARGET)
}

/// A block in chain position: the wire block plus the values it only
/// has relative to its predecessor.
#[derive(Debug, Clone)]
pub struct ChainedBlock {
    block: Arc<Block>,
    height: u32,
    base_target: u64,
    cumulative_difficulty: BigUint,
}

impl ChainedBlock {
    /// The chain anchor: height 0, initial base target, no difficulty.
    pub fn genesis(block: Arc<Block>) -> Self {
        Self {
            block,
            height: 0,
            base_target: INITIAL_BASE_TARGET,
            cumulative_difficulty: BigUint::default(),
        }
    }

    /// Attach `block` on top of `self`, computing its height, base
    /// target and cumulative difficulty. The caller has already
    /// verified that `block.previous_block_id()` is `self`.
    pub fn chain(&self, block: Arc<Block>) -> Self {
        let base_target = calculate_base_target(
            self.base_target,
            block.timestamp().saturating_sub(self.block.timestamp()),
        );
        let cumulative_difficulty =
            &self.cumulative_difficulty + (BigUint::from(1_u8) << 64_u32) / base_target;

        Self {
            block,
            height: self.height + 1,
            base_target,
            cumulative_difficulty,
        }
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn timestamp(&self) -> u32 {
        self.block.timestamp()
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn base_target(&self) -> u64 {
        self.base_target
    }

    pub fn cumulative_difficulty(&self) -> &BigUint {
        &self.cumulative_difficulty
    }
}

/// JSON form of a block as exchanged with peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRepr {
    version: u8,
    timestamp: u32,
    #[serde(rename = "previousBlock", default, skip_serializing_if = "Option::is_none")]
    previous_block: Option<BlockId>,
    #[serde(
        rename = "previousBlockHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    previous_block_hash: Option<Hash>,
    #[serde(rename = "totalAmountNQT")]
    total_amount: i64,
    #[serde(rename = "totalFeeNQT")]
    total_fee: i64,
    #[serde(rename = "payloadLength")]
    payload_length: u32,
    #[serde(rename = "payloadHash")]
    payload_hash: Hash,
    #[serde(rename = "generatorPublicKey")]
    generator_public_key: PublicKey,
    #[serde(rename = "generationSignature")]
    generation_signature: String,
    #[serde(rename = "blockSignature")]
    block_signature: Signature,
    transactions: Vec<Transaction>,
}

impl TryFrom<BlockRepr> for Block {
    type Error = ValidationError;

    fn try_from(repr: BlockRepr) -> Result<Self, Self::Error> {
        let generation_signature = hex::decode(&repr.generation_signature)
            .map_err(|_| ValidationError::NotValid("generation signature is not hex".into()))?;

        Self::from_parts(
            repr.version,
            repr.timestamp,
            repr.previous_block,
            repr.previous_block_hash,
            repr.total_amount,
            repr.total_fee,
            repr.payload_length,
            repr.payload_hash,
            repr.generator_public_key,
            generation_signature,
            repr.block_signature,
            repr.transactions.into_iter().map(Arc::new).collect(),
            None,
        )
    }
}

impl From<Block> for BlockRepr {
    fn from(block: Block) -> Self {
        Self {
            version: block.version,
            timestamp: block.timestamp,
            previous_block: block.previous_block_id,
            previous_block_hash: block.previous_block_hash,
            total_amount: block.total_amount,
            total_fee: block.total_fee,
            payload_length: block.payload_length,
            payload_hash: block.payload_hash,
            generator_public_key: block.generator_public_key,
            generation_signature: hex::encode(&block.generation_signature),
            block_signature: block.block_signature,
            transactions: block
                .transactions
                .iter()
                .map(|tx| Transaction::clone(tx))
                .collect(),
        }
    }
}

/// Parse a block from its peer JSON value.
pub fn parse_block(value: &serde_json::Value) -> Result<Arc<Block>, ValidationError> {
    let block: Block = serde_json::from_value(value.clone())
        .map_err(|error| ValidationError::NotValid(format!("block JSON: {error}")))?;
    Ok(Arc::new(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constants::ONE_EMBER,
        transaction::{Attachment, TransactionBuilder},
    };

    fn keys() -> KeyPair {
        KeyPair::from_secret_phrase("block tests")
    }

    fn transactions() -> Vec<Arc<Transaction>> {
        let tx = TransactionBuilder::new(1, Attachment::Payment, keys().public_key(), 500, 60)
            .recipient(AccountId(42))
            .amount(3 * ONE_EMBER)
            .sign(&keys());
        vec![Arc::new(tx)]
    }

    fn payload_of(transactions: &[Arc<Transaction>]) -> (Hash, u32) {
        let mut digest = Sha256Builder::new();
        let mut length = 0;
        for tx in transactions {
            let bytes = tx.bytes();
            length += bytes.len() as u32;
            digest.update(bytes);
        }
        (digest.finalize(), length)
    }

    fn forged(version: u8) -> Block {
        let transactions = transactions();
        let (payload_hash, payload_length) = payload_of(&transactions);
        let generation_signature = if version < 2 { vec![5; 64] } else { vec![5; 32] };
        let previous_block_hash = (version >= 2).then(|| Hash::new(b"previous block bytes"));

        Block::forge(
            version,
            1000,
            BlockId(77),
            previous_block_hash,
            3 * ONE_EMBER,
            ONE_EMBER,
            payload_length,
            payload_hash,
            generation_signature,
            transactions,
            &keys(),
        )
        .unwrap()
    }

    #[test]
    fn byte_layout_length_tracks_version() {
        // Fixed header + generation signature variants.
        let v1 = forged(1);
        let v3 = forged(3);
        let v1_overhead = v1.bytes().len() - v1.payload_length() as usize;
        let v3_overhead = v3.bytes().len() - v3.payload_length() as usize;

        assert_eq!(v1_overhead, 4 + 4 + 8 + 4 + 8 + 8 + 4 + 32 + 32 + 64 + 64);
        assert_eq!(v3_overhead, 4 + 4 + 8 + 4 + 8 + 8 + 4 + 32 + 32 + 32 + 32 + 64);
    }

    #[test]
    fn block_signature_verifies() {
        let block = forged(3);
        assert!(block.verify_block_signature());
    }

    #[test]
    fn json_round_trip_preserves_bytes_and_id() {
        let block = forged(3);
        let value = serde_json::to_value(&block).unwrap();
        let parsed = parse_block(&value).unwrap();

        assert_eq!(parsed.bytes(), block.bytes());
        assert_eq!(parsed.id(), block.id());
    }

    #[test]
    fn generation_signature_chains_from_previous() {
        let previous = forged(3);
        let mut digest = Sha256Builder::new();
        digest.update(previous.generation_signature());
        digest.update(keys().public_key().as_ref());
        let generation_signature = <[u8; 32]>::from(digest.finalize()).to_vec();

        let transactions = transactions();
        let (payload_hash, payload_length) = payload_of(&transactions);
        let next = Block::forge(
            3,
            previous.timestamp() + 60,
            previous.id(),
            Some(Hash::new(previous.bytes())),
            3 * ONE_EMBER,
            ONE_EMBER,
            payload_length,
            payload_hash,
            generation_signature,
            transactions,
            &keys(),
        )
        .unwrap();

        assert!(next.verify_generation_signature(&previous));
        assert!(!forged(3).verify_generation_signature(&previous));
    }

    #[test]
    fn retarget_is_clamped() {
        // A fast block halves the target at most...
        assert_eq!(calculate_base_target(INITIAL_BASE_TARGET, 0), INITIAL_BASE_TARGET / 2);
        // ...a slow block doubles it at most...
        assert_eq!(
            calculate_base_target(INITIAL_BASE_TARGET, 100_000),
            INITIAL_BASE_TARGET * 2
        );
        // ...an on-time block leaves it alone...
        assert_eq!(calculate_base_target(INITIAL_BASE_TARGET, 60), INITIAL_BASE_TARGET);
        // ...and the global ceiling holds.
        assert_eq!(calculate_base_target(MAX_BASE_TARGET, 100_000), MAX_BASE_TARGET);
    }

    #[test]
    fn cumulative_difficulty_is_monotone() {
        let genesis = ChainedBlock::genesis(Arc::new(forged(1)));
        let next = genesis.chain(Arc::new(forged(1)));
        let after = next.chain(Arc::new(forged(1)));

        assert_eq!(next.height(), 1);
        assert!(next.cumulative_difficulty() > genesis.cumulative_difficulty());
        assert!(after.cumulative_difficulty() > next.cumulative_difficulty());
    }

    #[test]
    fn hit_target_scales_with_stake_and_time() {
        assert!(hit_target(1000, 200, 60) > hit_target(1000, 100, 60));
        assert!(hit_target(1000, 100, 120) > hit_target(1000, 100, 60));
        assert_eq!(hit_target(1000, 0, 60), BigUint::default());
    }

    #[test]
    fn mismatched_generation_signature_length_is_rejected() {
        let result = Block::forge(
            3,
            1000,
            BlockId(1),
            Some(Hash::default()),
            0,
            0,
            0,
            Hash::default(),
            vec![0; 64], // v3 carries 32 bytes
            Vec::new(),
            &keys(),
        );
        assert!(result.is_err());
    }
}
