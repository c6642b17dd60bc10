//! Cryptographic primitives for Ember: SHA-256 digests and Ed25519
//! signatures. Everything consensus-critical hashes or signs through
//! this crate so the rest of the workspace never touches raw digest
//! or curve types.

use core::{fmt, str::FromStr};

use ed25519_dalek as dalek;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// A SHA-256 digest. Rendered as lowercase hex everywhere it is
/// user- or wire-visible.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; Hash::LENGTH]);

impl Hash {
    /// Length of the digest in bytes.
    pub const LENGTH: usize = 32;

    /// Wrap prehashed bytes.
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Hash the given bytes.
    #[must_use]
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes.as_ref()).into())
    }

    /// The first 8 bytes of the digest as a little-endian integer.
    ///
    /// Block, transaction and account identifiers are all derived this
    /// way from the SHA-256 of their canonical bytes.
    pub fn to_id(&self) -> u64 {
        let mut longle = [0_u8; 8];
        longle.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(longle)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Hash> for [u8; Hash::LENGTH] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::Hex)?;
        let bytes: [u8; Self::LENGTH] = bytes.try_into().map_err(|_| Error::DigestLength)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Incremental SHA-256, used for payload hashes and the milestone
/// transaction checksums where the input arrives block by block.
#[derive(Clone, Default)]
pub struct Sha256Builder(Sha256);

impl Sha256Builder {
    /// Fresh digest state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(bytes.as_ref());
    }

    /// Finish and produce the digest.
    pub fn finalize(self) -> Hash {
        Hash(self.0.finalize().into())
    }
}

/// An Ed25519 public key, stored in its 32-byte wire form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey([u8; PublicKey::LENGTH]);

impl PublicKey {
    /// Length of the key in bytes.
    pub const LENGTH: usize = 32;

    /// Wrap raw key bytes. Point validity is checked at verification
    /// time, not here, so unknown generator keys can still be parsed
    /// off the wire.
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Verify `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = dalek::PublicKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = dalek::Signature::from_bytes(&signature.0) else {
            return false;
        };
        key.verify_strict(message, &signature).is_ok()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<PublicKey> for [u8; PublicKey::LENGTH] {
    fn from(key: PublicKey) -> Self {
        key.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::Hex)?;
        let bytes: [u8; Self::LENGTH] = bytes.try_into().map_err(|_| Error::KeyLength)?;
        Ok(Self(bytes))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy)]
pub struct Signature([u8; Signature::LENGTH]);

impl Signature {
    /// Length of the signature in bytes.
    pub const LENGTH: usize = 64;

    /// Wrap raw signature bytes.
    pub const fn from_bytes(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// The all-zero signature, used where canonical byte layouts
    /// reserve the signature slot before signing.
    pub const fn zeroed() -> Self {
        Self([0; Self::LENGTH])
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Signature> for [u8; Signature::LENGTH] {
    fn from(signature: Signature) -> Self {
        signature.0
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Signature {}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::Hex)?;
        let bytes: [u8; Self::LENGTH] = bytes.try_into().map_err(|_| Error::SignatureLength)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A signing key pair derived deterministically from a secret phrase.
///
/// The phrase is hashed with SHA-256 to obtain the Ed25519 seed, so
/// the same phrase always forges and spends for the same account.
pub struct KeyPair {
    secret: dalek::SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derive the key pair for a secret phrase.
    pub fn from_secret_phrase(secret_phrase: &str) -> Self {
        let seed: [u8; 32] = Sha256::digest(secret_phrase.as_bytes()).into();
        let secret = dalek::SecretKey::from_bytes(&seed)
            .expect("SHA-256 output is always a valid Ed25519 seed");
        let public = PublicKey(dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let expanded = dalek::ExpandedSecretKey::from(&self.secret);
        let public = dalek::PublicKey::from(&self.secret);
        Signature(expanded.sign(message, &public).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret half must never end up in logs.
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Errors from parsing wire-form key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// not a hex string
    Hex,
    /// digest must be exactly 32 bytes
    DigestLength,
    /// public key must be exactly 32 bytes
    KeyLength,
    /// signature must be exactly 64 bytes
    SignatureLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let pair = KeyPair::from_secret_phrase("it was a dark and stormy night");
        let signature = pair.sign(b"payload");

        assert!(pair.public_key().verify(b"payload", &signature));
        assert!(!pair.public_key().verify(b"tampered", &signature));
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let a = KeyPair::from_secret_phrase("phrase");
        let b = KeyPair::from_secret_phrase("phrase");
        let c = KeyPair::from_secret_phrase("other phrase");

        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn verify_rejects_foreign_key() {
        let signer = KeyPair::from_secret_phrase("signer");
        let other = KeyPair::from_secret_phrase("other");
        let signature = signer.sign(b"payload");

        assert!(!other.public_key().verify(b"payload", &signature));
    }

    #[test]
    fn hash_hex_round_trip() {
        let hash = Hash::new(b"ember");
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);

        let json = serde_json::to_string(&hash).unwrap();
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn id_is_first_eight_bytes_little_endian() {
        let hash = Hash::from_bytes([
            1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 9,
        ]);
        assert_eq!(hash.to_id(), 1);
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert_eq!("zz".parse::<Hash>(), Err(Error::Hex));
        assert_eq!("abcd".parse::<Hash>(), Err(Error::DigestLength));
    }
}
