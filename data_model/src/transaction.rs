//! Transactions: the supported types, their canonical little-endian
//! byte layout, the JSON form exchanged with peers, stateless
//! validation, and identity derivation.
//!
//! A transaction is immutable once built. Its *full hash* is
//! `SHA256(bytes-with-zeroed-signature || SHA256(signature))`; its id
//! is the first 8 bytes of the full hash.

use std::sync::Arc;

use ember_crypto::{Hash, KeyPair, PublicKey, Sha256Builder, Signature};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    constants::{
        MAX_ALIAS_LENGTH, MAX_ALIAS_URI_LENGTH, MAX_ARBITRARY_MESSAGE_LENGTH, MAX_BALANCE_UNITS,
        MAX_DEADLINE, MAX_ENCRYPTED_MESSAGE_LENGTH, ONE_EMBER,
    },
    AccountId, BlockId, TransactionId, ValidationError,
};

/// The transaction types the chain understands, as `(type, subtype)`
/// pairs on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionType {
    /// Transfer of value. `(0, 0)`.
    Payment,
    /// Carries an arbitrary message, no value moved. `(1, 0)`.
    ArbitraryMessage,
    /// Binds an alias name to a URI for the sender. `(1, 1)`.
    AliasAssignment,
}

impl TransactionType {
    /// Decode the wire pair.
    pub fn from_wire(type_byte: u8, subtype: u8) -> Result<Self, ValidationError> {
        match (type_byte, subtype) {
            (0, 0) => Ok(Self::Payment),
            (1, 0) => Ok(Self::ArbitraryMessage),
            (1, 1) => Ok(Self::AliasAssignment),
            (t, s) => Err(ValidationError::NotValid(format!(
                "unknown transaction type {t} subtype {s}"
            ))),
        }
    }

    /// Wire type byte.
    pub fn type_byte(self) -> u8 {
        match self {
            Self::Payment => 0,
            Self::ArbitraryMessage | Self::AliasAssignment => 1,
        }
    }

    /// Wire subtype byte.
    pub fn subtype_byte(self) -> u8 {
        match self {
            Self::Payment | Self::ArbitraryMessage => 0,
            Self::AliasAssignment => 1,
        }
    }
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Plain transfer; no payload beyond the common fields.
    Payment,
    /// The message bytes. Interpretation is up to the recipient.
    ArbitraryMessage { message: Vec<u8> },
    /// Alias name (case-insensitive, `[a-z0-9]`) and target URI.
    AliasAssignment { alias: String, uri: String },
}

impl Attachment {
    /// The type this payload belongs to.
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Self::Payment => TransactionType::Payment,
            Self::ArbitraryMessage { .. } => TransactionType::ArbitraryMessage,
            Self::AliasAssignment { .. } => TransactionType::AliasAssignment,
        }
    }

    fn put_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Self::Payment => {}
            Self::ArbitraryMessage { message } => {
                out.extend_from_slice(&(message.len() as u32).to_le_bytes());
                out.extend_from_slice(message);
            }
            Self::AliasAssignment { alias, uri } => {
                out.push(alias.len() as u8);
                out.extend_from_slice(alias.as_bytes());
                out.extend_from_slice(&(uri.len() as u16).to_le_bytes());
                out.extend_from_slice(uri.as_bytes());
            }
        }
    }

    fn read(tx_type: TransactionType, reader: &mut Reader<'_>) -> Result<Self, ValidationError> {
        match tx_type {
            TransactionType::Payment => Ok(Self::Payment),
            TransactionType::ArbitraryMessage => {
                let length = reader.u32()? as usize;
                if length > MAX_ARBITRARY_MESSAGE_LENGTH {
                    return Err(ValidationError::NotValid(format!(
                        "message length {length} exceeds limit"
                    )));
                }
                Ok(Self::ArbitraryMessage {
                    message: reader.take(length)?.to_vec(),
                })
            }
            TransactionType::AliasAssignment => {
                let alias_length = reader.u8()? as usize;
                let alias = string_from_utf8(reader.take(alias_length)?)?;
                let uri_length = reader.u16()? as usize;
                let uri = string_from_utf8(reader.take(uri_length)?)?;
                Ok(Self::AliasAssignment { alias, uri })
            }
        }
    }

    fn to_json(&self) -> Option<Value> {
        match self {
            Self::Payment => None,
            Self::ArbitraryMessage { message } => Some(json!({ "message": hex::encode(message) })),
            Self::AliasAssignment { alias, uri } => Some(json!({ "alias": alias, "uri": uri })),
        }
    }

    fn from_json(
        tx_type: TransactionType,
        attachment: Option<&Value>,
    ) -> Result<Self, ValidationError> {
        let field = |key: &str| -> Result<&Value, ValidationError> {
            attachment
                .and_then(|value| value.get(key))
                .ok_or_else(|| ValidationError::NotValid(format!("attachment missing `{key}`")))
        };
        let string_field = |key: &str| -> Result<String, ValidationError> {
            field(key)?
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| ValidationError::NotValid(format!("attachment `{key}` not a string")))
        };

        match tx_type {
            TransactionType::Payment => Ok(Self::Payment),
            TransactionType::ArbitraryMessage => {
                let message = hex::decode(string_field("message")?)
                    .map_err(|_| ValidationError::NotValid("message is not hex".into()))?;
                Ok(Self::ArbitraryMessage { message })
            }
            TransactionType::AliasAssignment => Ok(Self::AliasAssignment {
                alias: string_field("alias")?,
                uri: string_field("uri")?,
            }),
        }
    }
}

/// Ciphertext an outside party produced; the core never decrypts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub data: Vec<u8>,
    pub nonce: [u8; 32],
}

/// Optional appendices a version-1 transaction may carry alongside its
/// attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Appendices {
    /// Message encrypted to the recipient.
    pub encrypted_message: Option<EncryptedData>,
    /// Note the sender encrypted to itself.
    pub encrypt_to_self_message: Option<EncryptedData>,
    /// Publishes the recipient's public key so the account becomes
    /// spendable before its first outgoing transaction.
    pub announced_public_key: Option<PublicKey>,
}

impl Appendices {
    const FLAG_ENCRYPTED_MESSAGE: u32 = 1;
    const FLAG_PUBLIC_KEY_ANNOUNCEMENT: u32 = 2;
    const FLAG_ENCRYPT_TO_SELF: u32 = 4;

    fn is_empty(&self) -> bool {
        self.encrypted_message.is_none()
            && self.encrypt_to_self_message.is_none()
            && self.announced_public_key.is_none()
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.encrypted_message.is_some() {
            flags |= Self::FLAG_ENCRYPTED_MESSAGE;
        }
        if self.announced_public_key.is_some() {
            flags |= Self::FLAG_PUBLIC_KEY_ANNOUNCEMENT;
        }
        if self.encrypt_to_self_message.is_some() {
            flags |= Self::FLAG_ENCRYPT_TO_SELF;
        }
        flags
    }

    fn put_bytes(&self, out: &mut Vec<u8>) {
        for encrypted in [&self.encrypted_message, &self.encrypt_to_self_message]
            .into_iter()
            .flatten()
        {
            out.extend_from_slice(&(encrypted.data.len() as u16).to_le_bytes());
            out.extend_from_slice(&encrypted.data);
            out.extend_from_slice(&encrypted.nonce);
        }
        if let Some(key) = &self.announced_public_key {
            out.extend_from_slice(key.as_ref());
        }
    }

    fn read(flags: u32, reader: &mut Reader<'_>) -> Result<Self, ValidationError> {
        let mut read_encrypted = || -> Result<EncryptedData, ValidationError> {
            let length = reader.u16()? as usize;
            if length > MAX_ENCRYPTED_MESSAGE_LENGTH {
                return Err(ValidationError::NotValid(format!(
                    "encrypted payload length {length} exceeds limit"
                )));
            }
            let data = reader.take(length)?.to_vec();
            let nonce = reader.array::<32>()?;
            Ok(EncryptedData { data, nonce })
        };

        let encrypted_message = (flags & Self::FLAG_ENCRYPTED_MESSAGE != 0)
            .then(&mut read_encrypted)
            .transpose()?;
        let encrypt_to_self_message = (flags & Self::FLAG_ENCRYPT_TO_SELF != 0)
            .then(&mut read_encrypted)
            .transpose()?;
        let announced_public_key = (flags & Self::FLAG_PUBLIC_KEY_ANNOUNCEMENT != 0)
            .then(|| reader.array::<32>().map(PublicKey::from_bytes))
            .transpose()?;

        Ok(Self {
            encrypted_message,
            encrypt_to_self_message,
            announced_public_key,
        })
    }

    fn merge_into_json(&self, attachment: &mut Value) {
        let object = attachment
            .as_object_mut()
            .expect("attachment JSON is always an object");
        if let Some(encrypted) = &self.encrypted_message {
            object.insert(
                "encryptedMessage".into(),
                json!({ "data": hex::encode(&encrypted.data), "nonce": hex::encode(encrypted.nonce) }),
            );
        }
        if let Some(encrypted) = &self.encrypt_to_self_message {
            object.insert(
                "encryptToSelfMessage".into(),
                json!({ "data": hex::encode(&encrypted.data), "nonce": hex::encode(encrypted.nonce) }),
            );
        }
        if let Some(key) = &self.announced_public_key {
            object.insert("recipientPublicKey".into(), json!(key.to_string()));
        }
    }

    fn from_json(attachment: Option<&Value>) -> Result<Self, ValidationError> {
        let encrypted_at = |key: &str| -> Result<Option<EncryptedData>, ValidationError> {
            let Some(value) = attachment.and_then(|a| a.get(key)) else {
                return Ok(None);
            };
            let hex_field = |inner: &str| -> Result<Vec<u8>, ValidationError> {
                value
                    .get(inner)
                    .and_then(Value::as_str)
                    .and_then(|s| hex::decode(s).ok())
                    .ok_or_else(|| {
                        ValidationError::NotValid(format!("`{key}.{inner}` is not hex"))
                    })
            };
            let nonce: [u8; 32] = hex_field("nonce")?
                .try_into()
                .map_err(|_| ValidationError::NotValid(format!("`{key}.nonce` length")))?;
            Ok(Some(EncryptedData {
                data: hex_field("data")?,
                nonce,
            }))
        };

        let announced_public_key = attachment
            .and_then(|a| a.get("recipientPublicKey"))
            .and_then(Value::as_str)
            .map(|s| {
                s.parse::<PublicKey>().map_err(|_| {
                    ValidationError::NotValid("`recipientPublicKey` is not a key".into())
                })
            })
            .transpose()?;

        Ok(Self {
            encrypted_message: encrypted_at("encryptedMessage")?,
            encrypt_to_self_message: encrypted_at("encryptToSelfMessage")?,
            announced_public_key,
        })
    }
}

/// A signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransactionRepr", into = "TransactionRepr")]
pub struct Transaction {
    version: u8,
    timestamp: u32,
    deadline: u16,
    sender_public_key: PublicKey,
    recipient_id: AccountId,
    amount: i64,
    fee: i64,
    referenced_transaction_full_hash: Option<Hash>,
    attachment: Attachment,
    appendices: Appendices,
    ec_block_height: u32,
    ec_block_id: BlockId,
    signature: Signature,
    full_hash: Hash,
    id: TransactionId,
}

impl Transaction {
    /// Parse canonical bytes back into a transaction.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut reader = Reader::new(bytes);

        let type_byte = reader.u8()?;
        let version_and_subtype = reader.u8()?;
        let version = version_and_subtype >> 4;
        let tx_type = TransactionType::from_wire(type_byte, version_and_subtype & 0x0F)?;

        let timestamp = reader.u32()?;
        let deadline = reader.u16()?;
        let sender_public_key = PublicKey::from_bytes(reader.array::<32>()?);
        let recipient_id = AccountId(reader.u64()?);
        let amount = reader.i64()?;
        let fee = reader.i64()?;
        let referenced = reader.array::<32>()?;
        let referenced_transaction_full_hash =
            (referenced != [0; 32]).then(|| Hash::from_bytes(referenced));
        let signature = Signature::from_bytes(reader.array::<64>()?);

        let (flags, ec_block_height, ec_block_id) = if version > 0 {
            (reader.u32()?, reader.u32()?, BlockId(reader.u64()?))
        } else {
            (0, 0, BlockId(0))
        };

        let attachment = Attachment::read(tx_type, &mut reader)?;
        let appendices = if version > 0 {
            Appendices::read(flags, &mut reader)?
        } else {
            Appendices::default()
        };
        reader.expect_end()?;

        Ok(Self::assemble(
            version,
            timestamp,
            deadline,
            sender_public_key,
            recipient_id,
            amount,
            fee,
            referenced_transaction_full_hash,
            attachment,
            appendices,
            ec_block_height,
            ec_block_id,
            signature,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        version: u8,
        timestamp: u32,
        deadline: u16,
        sender_public_key: PublicKey,
        recipient_id: AccountId,
        amount: i64,
        fee: i64,
        referenced_transaction_full_hash: Option<Hash>,
        attachment: Attachment,
        appendices: Appendices,
        ec_block_height: u32,
        ec_block_id: BlockId,
        signature: Signature,
    ) -> Self {
        let mut tx = Self {
            version,
            timestamp,
            deadline,
            sender_public_key,
            recipient_id,
            amount,
            fee,
            referenced_transaction_full_hash,
            attachment,
            appendices,
            ec_block_height,
            ec_block_id,
            signature,
            full_hash: Hash::default(),
            id: TransactionId(0),
        };
        let mut digest = Sha256Builder::new();
        digest.update(tx.unsigned_bytes());
        digest.update(Hash::new(signature.as_ref()));
        tx.full_hash = digest.finalize();
        tx.id = TransactionId(tx.full_hash.to_id());
        tx
    }

    /// Canonical bytes, signature included.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes_with_signature(&self.signature)
    }

    /// Canonical bytes with the signature slot zeroed; this is what
    /// gets signed and verified.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        self.bytes_with_signature(&Signature::zeroed())
    }

    fn bytes_with_signature(&self, signature: &Signature) -> Vec<u8> {
        let tx_type = self.attachment.transaction_type();
        let mut out = Vec::with_capacity(176);
        out.push(tx_type.type_byte());
        out.push((self.version << 4) | tx_type.subtype_byte());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.deadline.to_le_bytes());
        out.extend_from_slice(self.sender_public_key.as_ref());
        out.extend_from_slice(&self.recipient_id.0.to_le_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&self.fee.to_le_bytes());
        match &self.referenced_transaction_full_hash {
            Some(hash) => out.extend_from_slice(hash.as_ref()),
            None => out.extend_from_slice(&[0; 32]),
        }
        out.extend_from_slice(signature.as_ref());
        if self.version > 0 {
            out.extend_from_slice(&self.appendices.flags().to_le_bytes());
            out.extend_from_slice(&self.ec_block_height.to_le_bytes());
            out.extend_from_slice(&self.ec_block_id.0.to_le_bytes());
        }
        self.attachment.put_bytes(&mut out);
        if self.version > 0 {
            self.appendices.put_bytes(&mut out);
        }
        out
    }

    /// Size of the canonical encoding; what counts against a block's
    /// payload budget.
    pub fn size(&self) -> u32 {
        self.bytes().len() as u32
    }

    /// Check the signature against the sender key.
    pub fn verify_signature(&self) -> bool {
        self.sender_public_key
            .verify(&self.unsigned_bytes(), &self.signature)
    }

    /// Stateless validity: structure, bounds and type rules. Anything
    /// that needs chain state (balances, alias ownership, duplicate
    /// ids) is checked by the processor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |what: String| Err(ValidationError::NotValid(what));

        if self.deadline < 1 || self.deadline > MAX_DEADLINE {
            return invalid(format!("deadline {} out of range", self.deadline));
        }
        if self.fee < ONE_EMBER || self.fee > MAX_BALANCE_UNITS {
            return invalid(format!("fee {} out of range", self.fee));
        }
        if self.amount < 0 || self.amount > MAX_BALANCE_UNITS {
            return invalid(format!("amount {} out of range", self.amount));
        }
        if self.version == 0 && !self.appendices.is_empty() {
            return invalid("version 0 transactions cannot carry appendices".into());
        }

        match &self.attachment {
            Attachment::Payment => {
                if self.amount <= 0 {
                    return invalid("payment of nothing".into());
                }
                if self.recipient_id.0 == 0 {
                    return invalid("payment without recipient".into());
                }
            }
            Attachment::ArbitraryMessage { message } => {
                if self.amount != 0 {
                    return invalid("message transaction cannot move value".into());
                }
                if message.len() > MAX_ARBITRARY_MESSAGE_LENGTH {
                    return invalid(format!("message length {} exceeds limit", message.len()));
                }
            }
            Attachment::AliasAssignment { alias, uri } => {
                if self.amount != 0 {
                    return invalid("alias assignment cannot move value".into());
                }
                if alias.is_empty() || alias.len() > MAX_ALIAS_LENGTH {
                    return invalid(format!("alias length {} out of range", alias.len()));
                }
                if !alias
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                {
                    return invalid(format!("alias `{alias}` has characters outside [a-z0-9]"));
                }
                if uri.len() > MAX_ALIAS_URI_LENGTH {
                    return invalid(format!("alias URI length {} exceeds limit", uri.len()));
                }
            }
        }

        for encrypted in [
            &self.appendices.encrypted_message,
            &self.appendices.encrypt_to_self_message,
        ]
        .into_iter()
        .flatten()
        {
            if encrypted.data.len() > MAX_ENCRYPTED_MESSAGE_LENGTH {
                return invalid(format!(
                    "encrypted payload length {} exceeds limit",
                    encrypted.data.len()
                ));
            }
        }

        Ok(())
    }

    /// The key under which this transaction collides with others of its
    /// type within one block, if its type is exclusive at all.
    pub fn duplicate_key(&self) -> Option<(TransactionType, String)> {
        match &self.attachment {
            Attachment::AliasAssignment { alias, .. } => {
                Some((TransactionType::AliasAssignment, alias.to_lowercase()))
            }
            Attachment::Payment | Attachment::ArbitraryMessage { .. } => None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn full_hash(&self) -> Hash {
        self.full_hash
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.attachment.transaction_type()
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn deadline(&self) -> u16 {
        self.deadline
    }

    /// First second at which the transaction is no longer includable.
    pub fn expiration(&self) -> u32 {
        self.timestamp + u32::from(self.deadline) * 60
    }

    pub fn sender_public_key(&self) -> PublicKey {
        self.sender_public_key
    }

    pub fn sender_id(&self) -> AccountId {
        AccountId::from_public_key(&self.sender_public_key)
    }

    pub fn recipient_id(&self) -> AccountId {
        self.recipient_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn fee(&self) -> i64 {
        self.fee
    }

    pub fn referenced_transaction_full_hash(&self) -> Option<Hash> {
        self.referenced_transaction_full_hash
    }

    pub fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    pub fn appendices(&self) -> &Appendices {
        &self.appendices
    }

    pub fn ec_block_height(&self) -> u32 {
        self.ec_block_height
    }

    pub fn ec_block_id(&self) -> BlockId {
        self.ec_block_id
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Ordering key for block assembly: id first, timestamp as the tie
    /// breaker.
    pub fn sort_key(&self) -> (u64, u32) {
        (self.id.0, self.timestamp)
    }
}

/// Assembles a [`Transaction`] field by field, then signs it.
#[derive(Debug)]
pub struct TransactionBuilder {
    version: u8,
    timestamp: u32,
    deadline: u16,
    sender_public_key: PublicKey,
    recipient_id: AccountId,
    amount: i64,
    fee: i64,
    referenced_transaction_full_hash: Option<Hash>,
    attachment: Attachment,
    appendices: Appendices,
    ec_block_height: u32,
    ec_block_id: BlockId,
}

impl TransactionBuilder {
    /// Start a transaction of the given shape.
    pub fn new(
        version: u8,
        attachment: Attachment,
        sender_public_key: PublicKey,
        timestamp: u32,
        deadline: u16,
    ) -> Self {
        Self {
            version,
            timestamp,
            deadline,
            sender_public_key,
            recipient_id: AccountId(0),
            amount: 0,
            fee: ONE_EMBER,
            referenced_transaction_full_hash: None,
            attachment,
            appendices: Appendices::default(),
            ec_block_height: 0,
            ec_block_id: BlockId(0),
        }
    }

    pub fn recipient(mut self, recipient_id: AccountId) -> Self {
        self.recipient_id = recipient_id;
        self
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    pub fn fee(mut self, fee: i64) -> Self {
        self.fee = fee;
        self
    }

    pub fn referenced_transaction(mut self, full_hash: Hash) -> Self {
        self.referenced_transaction_full_hash = Some(full_hash);
        self
    }

    pub fn appendices(mut self, appendices: Appendices) -> Self {
        self.appendices = appendices;
        self
    }

    pub fn ec_block(mut self, height: u32, id: BlockId) -> Self {
        self.ec_block_height = height;
        self.ec_block_id = id;
        self
    }

    /// Sign with `keys` and produce the final transaction.
    pub fn sign(self, keys: &KeyPair) -> Transaction {
        let unsigned = self.clone_as_transaction(Signature::zeroed());
        let signature = keys.sign(&unsigned.unsigned_bytes());
        self.clone_as_transaction(signature)
    }

    /// Attach an externally produced signature. Used for the embedded
    /// genesis payments, whose signatures are carried as constants.
    pub fn presigned(self, signature: Signature) -> Transaction {
        self.clone_as_transaction(signature)
    }

    fn clone_as_transaction(&self, signature: Signature) -> Transaction {
        Transaction::assemble(
            self.version,
            self.timestamp,
            self.deadline,
            self.sender_public_key,
            self.recipient_id,
            self.amount,
            self.fee,
            self.referenced_transaction_full_hash,
            self.attachment.clone(),
            self.appendices.clone(),
            self.ec_block_height,
            self.ec_block_id,
            signature,
        )
    }
}

/// JSON form of a transaction as exchanged with peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransactionRepr {
    #[serde(rename = "type")]
    type_byte: u8,
    subtype: u8,
    #[serde(default)]
    version: u8,
    timestamp: u32,
    deadline: u16,
    #[serde(rename = "senderPublicKey")]
    sender_public_key: PublicKey,
    recipient: AccountId,
    #[serde(rename = "amountNQT")]
    amount: i64,
    #[serde(rename = "feeNQT")]
    fee: i64,
    #[serde(
        rename = "referencedTransactionFullHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    referenced_transaction_full_hash: Option<Hash>,
    signature: Signature,
    #[serde(rename = "ecBlockHeight", default)]
    ec_block_height: u32,
    #[serde(rename = "ecBlockId", default)]
    ec_block_id: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attachment: Option<Value>,
}

impl TryFrom<TransactionRepr> for Transaction {
    type Error = ValidationError;

    fn try_from(repr: TransactionRepr) -> Result<Self, Self::Error> {
        let tx_type = TransactionType::from_wire(repr.type_byte, repr.subtype)?;
        let attachment = Attachment::from_json(tx_type, repr.attachment.as_ref())?;
        let appendices = if repr.version > 0 {
            Appendices::from_json(repr.attachment.as_ref())?
        } else {
            Appendices::default()
        };

        Ok(Self::assemble(
            repr.version,
            repr.timestamp,
            repr.deadline,
            repr.sender_public_key,
            repr.recipient,
            repr.amount,
            repr.fee,
            repr.referenced_transaction_full_hash,
            attachment,
            appendices,
            repr.ec_block_height,
            repr.ec_block_id,
            repr.signature,
        ))
    }
}

impl From<Transaction> for TransactionRepr {
    fn from(tx: Transaction) -> Self {
        let tx_type = tx.attachment.transaction_type();
        let mut attachment = tx.attachment.to_json();
        if !tx.appendices.is_empty() {
            let target = attachment.get_or_insert_with(|| json!({}));
            tx.appendices.merge_into_json(target);
        }

        Self {
            type_byte: tx_type.type_byte(),
            subtype: tx_type.subtype_byte(),
            version: tx.version,
            timestamp: tx.timestamp,
            deadline: tx.deadline,
            sender_public_key: tx.sender_public_key,
            recipient: tx.recipient_id,
            amount: tx.amount,
            fee: tx.fee,
            referenced_transaction_full_hash: tx.referenced_transaction_full_hash,
            signature: tx.signature,
            ec_block_height: tx.ec_block_height,
            ec_block_id: tx.ec_block_id,
            attachment,
        }
    }
}

/// Parse a transaction from its peer JSON value.
pub fn parse_transaction(value: &Value) -> Result<Arc<Transaction>, ValidationError> {
    let tx: Transaction = serde_json::from_value(value.clone())
        .map_err(|error| ValidationError::NotValid(format!("transaction JSON: {error}")))?;
    Ok(Arc::new(tx))
}

fn string_from_utf8(bytes: &[u8]) -> Result<String, ValidationError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ValidationError::NotValid("string field is not UTF-8".into()))
}

/// Sequential little-endian reader over canonical bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8], ValidationError> {
        let end = self
            .position
            .checked_add(length)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| ValidationError::NotValid("transaction bytes truncated".into()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ValidationError> {
        Ok(self
            .take(N)?
            .try_into()
            .expect("take returned exactly N bytes"))
    }

    fn u8(&mut self) -> Result<u8, ValidationError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ValidationError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ValidationError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ValidationError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, ValidationError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn expect_end(&self) -> Result<(), ValidationError> {
        if self.position == self.bytes.len() {
            Ok(())
        } else {
            Err(ValidationError::NotValid(
                "trailing bytes after transaction".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeyPair {
        KeyPair::from_secret_phrase("transaction tests")
    }

    fn payment(amount: i64) -> Transaction {
        TransactionBuilder::new(1, Attachment::Payment, keys().public_key(), 1000, 60)
            .recipient(AccountId(12345))
            .amount(amount)
            .fee(ONE_EMBER)
            .sign(&keys())
    }

    #[test]
    fn byte_round_trip_is_stable() {
        let tx = payment(17 * ONE_EMBER);
        let parsed = Transaction::from_bytes(&tx.bytes()).unwrap();

        assert_eq!(parsed.bytes(), tx.bytes());
        assert_eq!(parsed.id(), tx.id());
        assert_eq!(parsed.full_hash(), tx.full_hash());
    }

    #[test]
    fn json_round_trip_preserves_bytes() {
        let tx = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "treasury".into(),
                uri: "acct:1234".into(),
            },
            keys().public_key(),
            2000,
            1440,
        )
        .fee(2 * ONE_EMBER)
        .sign(&keys());

        let value = serde_json::to_value(&tx).unwrap();
        let parsed = parse_transaction(&value).unwrap();
        assert_eq!(parsed.bytes(), tx.bytes());
    }

    #[test]
    fn appendices_round_trip_through_bytes_and_json() {
        let appendices = Appendices {
            encrypted_message: Some(EncryptedData {
                data: vec![1, 2, 3, 4],
                nonce: [7; 32],
            }),
            encrypt_to_self_message: None,
            announced_public_key: Some(keys().public_key()),
        };
        let tx = TransactionBuilder::new(1, Attachment::Payment, keys().public_key(), 3000, 24)
            .recipient(AccountId(9))
            .amount(ONE_EMBER)
            .appendices(appendices.clone())
            .sign(&keys());

        let from_bytes = Transaction::from_bytes(&tx.bytes()).unwrap();
        assert_eq!(from_bytes.appendices(), &appendices);

        let value = serde_json::to_value(&tx).unwrap();
        let from_json = parse_transaction(&value).unwrap();
        assert_eq!(from_json.bytes(), tx.bytes());
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let tx = payment(ONE_EMBER);
        assert!(tx.verify_signature());

        let mut bytes = tx.bytes();
        // Flip a bit inside the amount field.
        bytes[50] ^= 1;
        let tampered = Transaction::from_bytes(&bytes).unwrap();
        assert!(!tampered.verify_signature());
        assert_ne!(tampered.id(), tx.id());
    }

    #[test]
    fn validate_enforces_type_rules() {
        assert!(payment(ONE_EMBER).validate().is_ok());
        assert!(payment(0).validate().is_err());

        let free = TransactionBuilder::new(1, Attachment::Payment, keys().public_key(), 0, 60)
            .recipient(AccountId(1))
            .amount(ONE_EMBER)
            .fee(0)
            .sign(&keys());
        assert!(free.validate().is_err());

        let shouting = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "NotLowercase".into(),
                uri: String::new(),
            },
            keys().public_key(),
            0,
            60,
        )
        .sign(&keys());
        assert!(shouting.validate().is_err());
    }

    #[test]
    fn duplicate_key_only_for_aliases() {
        let alias = TransactionBuilder::new(
            1,
            Attachment::AliasAssignment {
                alias: "mixedcase".into(),
                uri: String::new(),
            },
            keys().public_key(),
            0,
            60,
        )
        .sign(&keys());
        assert_eq!(
            alias.duplicate_key(),
            Some((TransactionType::AliasAssignment, "mixedcase".into()))
        );
        assert_eq!(payment(ONE_EMBER).duplicate_key(), None);
    }

    #[test]
    fn expiration_follows_deadline() {
        let tx = payment(ONE_EMBER);
        assert_eq!(tx.expiration(), tx.timestamp() + 60 * 60);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let bytes = payment(ONE_EMBER).bytes();
        assert!(Transaction::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Transaction::from_bytes(&[]).is_err());
    }
}
