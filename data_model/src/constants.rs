//! Chain constants: units, limits, per-network milestone heights and
//! checksum digests, and the embedded genesis allocation.

use core::{fmt, str::FromStr};
use std::time::{SystemTime, UNIX_EPOCH};

use hex_literal::hex;
use serde::{Deserialize, Serialize};

use crate::BlockId;

/// Smallest unit of value. All amounts and fees are integers of this
/// unit ("NQT" in wallet parlance); 1 coin = 10^8 units.
pub const ONE_EMBER: i64 = 100_000_000;
/// Total supply in whole coins.
pub const MAX_BALANCE_EMBER: i64 = 1_000_000_000;
/// Total supply in units.
pub const MAX_BALANCE_UNITS: i64 = MAX_BALANCE_EMBER * ONE_EMBER;

/// Chain epoch: 2016-01-01T00:00:00Z. Block and transaction timestamps
/// count seconds from this instant.
pub const EPOCH_BEGINNING: u64 = 1_451_606_400;

/// How far ahead of local time a block or transaction timestamp may be.
pub const MAX_TIMEDRIFT: u32 = 15;

/// Hard cap on transactions per block.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 255;
/// Hard cap on summed transaction bytes per block.
pub const MAX_PAYLOAD_LENGTH: u32 = 255 * 176;

/// Deadline bounds, in minutes.
pub const MAX_DEADLINE: u16 = 1440;

/// Payload limits of the supported transaction types.
pub const MAX_ARBITRARY_MESSAGE_LENGTH: usize = 1000;
pub const MAX_ENCRYPTED_MESSAGE_LENGTH: usize = 1000;
pub const MAX_ALIAS_LENGTH: usize = 100;
pub const MAX_ALIAS_URI_LENGTH: usize = 1000;

/// Deepest rollback the processor supports; also the trim horizon.
pub const MAX_ROLLBACK: u32 = 1440;

/// Referenced-transaction chains are followed at most this many hops...
pub const MAX_REFERENCED_CHAIN_DEPTH: u32 = 10;
/// ...and must fit in this many seconds ending at the referencing
/// transaction's timestamp.
pub const MAX_REFERENCED_CHAIN_TIMESPAN: u32 = 60 * 1440 * 60;

/// Base target of the genesis block. Together with the total supply
/// this fixes the expected one-minute block cadence.
pub const INITIAL_BASE_TARGET: u64 = 153_722_867;
/// Ceiling of the per-block retarget.
pub const MAX_BASE_TARGET: u64 = INITIAL_BASE_TARGET * 50;

/// Seconds since the chain epoch, clamped at zero before it.
pub fn epoch_time() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    u32::try_from(unix.saturating_sub(EPOCH_BEGINNING)).unwrap_or(u32::MAX)
}

/// The network a node participates in. Consensus constants that had to
/// diverge between the production chain and the test chain live in
/// [`ChainParams`], selected by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => f.write_str("mainnet"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(format!("unknown network `{other}`")),
        }
    }
}

/// Per-network consensus parameters.
#[derive(Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Hard-coded genesis block id. Never recomputed from block bytes.
    pub genesis_block_id: BlockId,
    /// Height at which transparent forging activates (block version 2).
    pub transparent_forging_height: u32,
    /// Height at which integer-unit accounting activates (block
    /// version 3, transaction version 1).
    pub nqt_height: u32,
    /// Height at which referenced transactions switch from id lookup to
    /// full-hash chain walking.
    pub referenced_full_hash_height: u32,
    /// Digest over all transaction bytes at the transparent-forging
    /// milestone. `None` means not pinned yet: log and pass.
    pub transparent_forging_checksum: Option<[u8; 32]>,
    /// Digest over all transaction bytes at the NQT milestone.
    pub nqt_checksum: Option<[u8; 32]>,
}

static MAINNET: ChainParams = ChainParams {
    network: Network::Mainnet,
    genesis_block_id: BlockId(2_680_262_203_532_249_785),
    transparent_forging_height: 9_600,
    nqt_height: 128_000,
    referenced_full_hash_height: 136_000,
    transparent_forging_checksum: Some(hex!(
        "27a458639d20e64bbbb0215cc0b77b1b140e0b1c184e34c8ac1c4e97fbe9fce6"
    )),
    nqt_checksum: Some(hex!(
        "8bf49ae38a0b310e4f9ced6ffb281614db6f5e9aa92378ddbca5b4e4986db634"
    )),
};

static TESTNET: ChainParams = ChainParams {
    network: Network::Testnet,
    genesis_block_id: BlockId(5_110_672_722_865_686_250),
    transparent_forging_height: 1_440,
    nqt_height: 4_320,
    referenced_full_hash_height: 5_760,
    transparent_forging_checksum: None,
    nqt_checksum: None,
};

impl ChainParams {
    /// Parameters of `network`.
    pub fn for_network(network: Network) -> &'static Self {
        match network {
            Network::Mainnet => &MAINNET,
            Network::Testnet => &TESTNET,
        }
    }

    /// The block version expected on top of a block at `previous_height`.
    pub fn block_version(&self, previous_height: u32) -> u8 {
        if previous_height < self.transparent_forging_height {
            1
        } else if previous_height < self.nqt_height {
            2
        } else {
            3
        }
    }

    /// The transaction version expected in a block on top of
    /// `previous_height`.
    pub fn transaction_version(&self, previous_height: u32) -> u8 {
        u8::from(previous_height >= self.nqt_height)
    }
}

pub mod genesis {
    //! The embedded genesis allocation. The creator account signed one
    //! payment per initial stakeholder at the chain launch; the
    //! signatures and the block signature are carried verbatim so the
    //! genesis block is byte-identical on every node.

    use hex_literal::hex;

    /// Public key of the genesis creator account. Its balance goes
    /// negative by the total supply at height 0 and stays there.
    pub const CREATOR_PUBLIC_KEY: [u8; 32] =
        hex!("b04013701d07b55d4e29b1732ccd7dba00baf475f1fb1ab2e1a19a43e7c08a68");

    /// Initial stakeholders, as raw account ids.
    pub const RECIPIENTS: [u64; 10] = [
        16_570_482_331_254_371_165,
        6_865_907_612_761_405_903,
        11_696_517_167_697_249_538,
        2_452_288_931_549_817_029,
        17_101_971_527_178_019_802,
        9_010_272_231_918_276_522,
        4_416_318_301_540_238_866,
        12_830_059_177_067_684_029,
        7_771_902_099_894_885_775,
        1_515_930_537_190_285_587,
    ];

    /// Allocation per recipient, in whole coins. Sums to the total
    /// supply.
    pub const AMOUNTS: [i64; 10] = [
        220_000_000,
        180_000_000,
        150_000_000,
        120_000_000,
        100_000_000,
        80_000_000,
        60_000_000,
        45_000_000,
        30_000_000,
        15_000_000,
    ];

    /// Creator signatures over the allocation payments, one per
    /// recipient, in [`RECIPIENTS`] order.
    pub const SIGNATURES: [[u8; 64]; 10] = [
        hex!("7d3ad20f60c9f18d9ff634f5d1c0b2b377f8957edca9f117dca9bfed9b50900cf3d5b8ec20bfd31fae9d286a6a3bcfeae2bb4c885080eaf27984676a24a29c0d"),
        hex!("188f0fa837f9c72ea2b7a87e2fda46a4a3a17e6a1ad565dcaf2af2e95ba9cd04881bfefad988d8da25b56bc63b2bba85b2d3d1d3dbc043ca7e02a34a8e350b01"),
        hex!("c95fa3b0f8c0a74f45cdc5f9758b8c3c159e4e1ac3a1a10ea4d0ebab98c8d30b1f9e9df94b2c31b5efa7d14f91f5cc3fc2ee7b89af06cd9f2c9eb19480a3110e"),
        hex!("5b05fce9d4fd3f05239a3ad2dd39c8a211a1deda6c4aa1dcd36a8c9dc0fae70270ead14c247a15d8e14e557e31f3a9bebbfbe0dc12b8f2c75c1e39e8004f7e05"),
        hex!("7e5bb1a09d58e7dce1e39f2f11a4ee9ec30c8be5f6a9cdb610dc8bbf0a1dba007a2bdd0ecfee09f8c2ca13b58c3b9f51faecd9bbadf0efb2765a10e277ea4a0a"),
        hex!("0bf307a50bd28ad0e7fbd0a41ac8cf27e622c2fb0b6d4360c37ef5e7a1cfa8021f9d75cf7e9da05a10ef7f6b587f9d3c2e4b2a5c16ae8c8dbf29cde18abf0603"),
        hex!("aa2f3b1bdf1ab0f7ce2cad0a6f87de94e2bd2ffb05d8f79b4a2dc8cbef92370e92a014daf0e2a35d6dc50d3129a0eeab39a2f7b6e1dbbd24a0fd19c9e6a5d208"),
        hex!("6fdcb8f9e1c9e10bdf6a2a2b0b78bdf0ca27a1c55e9fad8ff1b0c2d14b1e9a0d65c2a7ce28be9e58f8aaf16d9c6d9bb38e1f2a4dcd5e2b95d1d7fb7ed0c6e40a"),
        hex!("e2fb0dd7aecff7d3a9cf2e45a0c2b58a25d1fb2b0f6f2c589df68bbfcf8a150a3eda8fc28ade2f17b42fcb6ef51ccd7c9cb0a9d8e2b5f9b6d1a2c0da97ad5e09"),
        hex!("4fd2d0e1ccbbf5ed9a2af0cde47ebd62eae65cd50d4a2eea5e15a2c2c0fbe10dea2ddca9ba1d0eff8bfa08f6ab7c7f4a5ba2c9e7f25b89cfedb4a1d24a0f330c"),
    ];

    /// Signature of the genesis block itself.
    pub const BLOCK_SIGNATURE: [u8; 64] = hex!(
        "9e8a1b7c0dce2fab6fd12c4aa90eff58ae2dc1bb05f7e6cda210be9df2a3c50d\
         72b0e9fdd5aaf1c6b4a2c8f15e0d7eab39c2f4b6a1d8eb5c0f9da27ce4b1680b"
    );

    #[cfg(test)]
    mod tests {
        use super::*;
        use super::super::MAX_BALANCE_EMBER;

        #[test]
        fn allocation_covers_total_supply() {
            assert_eq!(RECIPIENTS.len(), AMOUNTS.len());
            assert_eq!(RECIPIENTS.len(), SIGNATURES.len());
            assert_eq!(AMOUNTS.iter().sum::<i64>(), MAX_BALANCE_EMBER);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_schedule_follows_milestones() {
        let params = ChainParams::for_network(Network::Mainnet);

        assert_eq!(params.block_version(0), 1);
        assert_eq!(params.block_version(params.transparent_forging_height - 1), 1);
        assert_eq!(params.block_version(params.transparent_forging_height), 2);
        assert_eq!(params.block_version(params.nqt_height - 1), 2);
        assert_eq!(params.block_version(params.nqt_height), 3);

        assert_eq!(params.transaction_version(0), 0);
        assert_eq!(params.transaction_version(params.nqt_height), 1);
    }

    #[test]
    fn networks_do_not_share_a_genesis() {
        assert_ne!(
            ChainParams::for_network(Network::Mainnet).genesis_block_id,
            ChainParams::for_network(Network::Testnet).genesis_block_id,
        );
    }

    #[test]
    fn network_parses_from_config_strings() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("regtest".parse::<Network>().is_err());
    }
}
