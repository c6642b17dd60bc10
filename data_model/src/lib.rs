//! Wire-level data model of the Ember blockchain: blocks, transactions,
//! their canonical byte and JSON encodings, and the chain constants that
//! fix consensus behavior per network.
//!
//! Everything here is pure data and math. Chain state, storage and the
//! processing pipeline live in `ember_core`.

pub mod block;
pub mod constants;
pub mod transaction;

use core::{fmt, num::ParseIntError, str::FromStr};

use ember_crypto::{Hash, PublicKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Implements the common surface of the `u64`-backed identifier
/// newtypes: decimal `Display`, `FromStr`, and string-form serde
/// (ids exceed the integer range JSON consumers handle reliably).
macro_rules! id_type {
    ($(#[doc = $doc:expr] $name:ident),+ $(,)?) => {$(
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    )+};
}

id_type! {
    #[doc = "Identifier of a block: the first 8 bytes of the SHA-256 of its signed bytes."]
    BlockId,
    #[doc = "Identifier of a transaction: the first 8 bytes of its full hash."]
    TransactionId,
    #[doc = "Identifier of an account: the first 8 bytes of the SHA-256 of its public key."]
    AccountId,
}

impl AccountId {
    /// Derive the account id that a public key controls.
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(Hash::new(key.as_ref()).to_id())
    }
}

/// Outcome kind of validating a block or transaction outside chain
/// context. The caller branches on exactly one question: is the object
/// permanently invalid, or might it become valid once missing context
/// (a referenced transaction, a future timestamp) arrives?
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Permanently invalid.
    #[error("invalid: {0}")]
    NotValid(String),
    /// May validate later; retry without penalizing the source.
    #[error("not currently valid: {0}")]
    NotCurrentlyValid(String),
}

impl ValidationError {
    /// True for failures that a retry may clear.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::NotCurrentlyValid(_))
    }
}

pub mod prelude {
    //! Re-exports for glob import by crates consuming the data model.

    #[doc(inline)]
    pub use crate::{
        block::{Block, ChainedBlock},
        constants::{ChainParams, Network},
        transaction::{Attachment, Transaction, TransactionType},
        AccountId, BlockId, TransactionId, ValidationError,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_as_unsigned_decimal_strings() {
        let id = BlockId(u64::MAX);
        assert_eq!(id.to_string(), "18446744073709551615");
        assert_eq!("18446744073709551615".parse::<BlockId>().unwrap(), id);

        let json = serde_json::to_string(&TransactionId(7)).unwrap();
        assert_eq!(json, "\"7\"");
    }

    #[test]
    fn account_id_tracks_public_key() {
        let key = ember_crypto::KeyPair::from_secret_phrase("alice").public_key();
        let id = AccountId::from_public_key(&key);
        assert_eq!(id, AccountId::from_public_key(&key));
        assert_ne!(id, AccountId::default());
    }
}
