//! Genesis bootstrap: assembling the height-0 block from the embedded
//! allocation table.
//!
//! The genesis block is special in exactly two ways: its id is the
//! hard-coded per-network constant rather than a digest of its bytes,
//! and its creator account is allowed to overdraw (the allocation
//! payments drive it negative by the total supply). Everything else
//! about it flows through the ordinary acceptance machinery.

use std::sync::Arc;

use ember_crypto::{PublicKey, Sha256Builder, Signature};
use ember_data_model::{
    block::Block,
    constants::{genesis, ChainParams, ONE_EMBER},
    transaction::{Attachment, Transaction, TransactionBuilder},
    AccountId, ValidationError,
};

/// The genesis allocation payments, in embedded order.
pub fn allocation_transactions() -> Vec<Arc<Transaction>> {
    let creator_key = PublicKey::from_bytes(genesis::CREATOR_PUBLIC_KEY);

    genesis::RECIPIENTS
        .iter()
        .zip(genesis::AMOUNTS)
        .zip(genesis::SIGNATURES)
        .map(|((&recipient, amount), signature)| {
            Arc::new(
                TransactionBuilder::new(0, Attachment::Payment, creator_key, 0, 0)
                    .recipient(AccountId(recipient))
                    .amount(amount * ONE_EMBER)
                    .fee(0)
                    .presigned(Signature::from_bytes(signature)),
            )
        })
        .collect()
}

/// Build the genesis block for `params`' network.
pub fn genesis_block(params: &ChainParams) -> Result<Arc<Block>, ValidationError> {
    let transactions = allocation_transactions();

    let mut digest = Sha256Builder::new();
    let mut payload_length = 0;
    let mut total_amount = 0;
    for tx in &transactions {
        let bytes = tx.bytes();
        payload_length += bytes.len() as u32;
        total_amount += tx.amount();
        digest.update(bytes);
    }

    let block = Block::presigned(
        1,
        0,
        None,
        None,
        total_amount,
        0,
        payload_length,
        digest.finalize(),
        PublicKey::from_bytes(genesis::CREATOR_PUBLIC_KEY),
        vec![0; 64],
        Signature::from_bytes(genesis::BLOCK_SIGNATURE),
        transactions,
        Some(params.genesis_block_id),
    )?;
    Ok(Arc::new(block))
}

#[cfg(test)]
mod tests {
    use ember_data_model::constants::{ChainParams, Network, MAX_BALANCE_UNITS};

    use super::*;

    #[test]
    fn genesis_block_is_deterministic_and_carries_its_constant_id() {
        let params = ChainParams::for_network(Network::Mainnet);
        let a = genesis_block(params).unwrap();
        let b = genesis_block(params).unwrap();

        assert_eq!(a.bytes(), b.bytes());
        assert_eq!(a.id(), params.genesis_block_id);
        assert!(a.is_genesis());
    }

    #[test]
    fn allocation_moves_the_entire_supply() {
        let params = ChainParams::for_network(Network::Testnet);
        let block = genesis_block(params).unwrap();

        assert_eq!(block.total_amount(), MAX_BALANCE_UNITS);
        assert_eq!(block.total_fee(), 0);
        assert_eq!(block.transactions().len(), genesis::RECIPIENTS.len());
    }

    #[test]
    fn payload_hash_covers_the_allocation() {
        let params = ChainParams::for_network(Network::Mainnet);
        let block = genesis_block(params).unwrap();

        let mut digest = Sha256Builder::new();
        for tx in block.transactions() {
            digest.update(tx.bytes());
        }
        assert_eq!(digest.finalize(), block.payload_hash());
    }
}
