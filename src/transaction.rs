//! Transactions and their canonical encoding.
//!
//! The canonical encoding is fixed by the protocol:
//!
//! ```text
//! id (32) | sender (32) | creator (32) | creator_sig (64) | tag (1) |
//! payload_len (varint) | payload | nonce (u64 LE) | view_id (u64 LE) |
//! parent_count (varint) | parent_ids... | depth (u64 LE) | sender_sig (64)
//! ```
//!
//! The *body* — everything between the id and the sender signature — is what
//! gets hashed into the id and what the sender signs. The creator signs
//! `tag || payload` before the transaction is attached to the graph, so a
//! wallet can hand a half-built transaction to a node it does not trust with
//! its graph position.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::codec::{
    expect_end, get_array, get_u64, get_u8, get_var_bytes, get_varint, put_bytes, put_u64,
    put_u8, put_var_bytes, put_varint,
};
use crate::constants::MAX_WIRE_MESSAGE_SIZE;
use crate::error::{CodecError, ValidationError};
use crate::hash::{blake2b256, leading_zero_bits};
use crate::types::{AccountId, SignatureBytes, Tag, TransactionId};

/// Upper bound on parents in one transaction.
pub const MAX_TRANSACTION_PARENTS: usize = 256;

/// A DAG transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub sender: AccountId,
    pub creator: AccountId,
    pub creator_signature: SignatureBytes,
    pub sender_signature: SignatureBytes,
    pub tag: Tag,
    pub payload: Vec<u8>,
    pub nonce: u64,
    pub view_id: u64,
    pub parents: Vec<TransactionId>,
    pub depth: u64,
}

impl Transaction {
    /// Build a creator-signed transaction that has not yet been attached to
    /// the graph. Sender fields are filled by [`Transaction::attach`].
    pub fn new(creator: &SigningKey, tag: Tag, payload: Vec<u8>) -> Self {
        let creator_id = AccountId(creator.verifying_key().to_bytes());
        let creator_signature =
            SignatureBytes(creator.sign(&creator_message(tag, &payload)).to_bytes());

        Transaction {
            id: TransactionId::ZERO,
            sender: AccountId::ZERO,
            creator: creator_id,
            creator_signature,
            sender_signature: SignatureBytes::ZERO,
            tag,
            payload,
            nonce: 0,
            view_id: 0,
            parents: Vec::new(),
            depth: 0,
        }
    }

    /// Fill the sender-owned fields, sign the body, and derive the id.
    pub fn attach(
        &mut self,
        sender: &SigningKey,
        nonce: u64,
        view_id: u64,
        parents: Vec<TransactionId>,
        depth: u64,
    ) {
        self.sender = AccountId(sender.verifying_key().to_bytes());
        self.nonce = nonce;
        self.view_id = view_id;
        self.parents = parents;
        self.depth = depth;

        let body = self.encode_body();
        self.sender_signature = SignatureBytes(sender.sign(&body).to_bytes());
        self.id = TransactionId(blake2b256(&body));
    }

    /// The signed/hashed portion of the canonical encoding.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 256);
        put_bytes(&mut out, self.sender.as_bytes());
        put_bytes(&mut out, self.creator.as_bytes());
        put_bytes(&mut out, self.creator_signature.as_bytes());
        put_u8(&mut out, self.tag.as_u8());
        put_var_bytes(&mut out, &self.payload);
        put_u64(&mut out, self.nonce);
        put_u64(&mut out, self.view_id);
        put_varint(&mut out, self.parents.len() as u64);
        for parent in &self.parents {
            put_bytes(&mut out, parent.as_bytes());
        }
        put_u64(&mut out, self.depth);
        out
    }

    /// Full canonical wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 352);
        put_bytes(&mut out, self.id.as_bytes());
        out.extend_from_slice(&self.encode_body());
        put_bytes(&mut out, self.sender_signature.as_bytes());
        out
    }

    /// Decode a canonical encoding, consuming the whole input.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut input = bytes;
        let tx = Self::decode_from(&mut input)?;
        expect_end(input)?;
        Ok(tx)
    }

    /// Decode a canonical encoding from the front of `input`.
    pub fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let id = TransactionId(get_array::<32>(input, "id")?);
        let sender = AccountId(get_array::<32>(input, "sender")?);
        let creator = AccountId(get_array::<32>(input, "creator")?);
        let creator_signature = SignatureBytes(get_array::<64>(input, "creator_signature")?);
        let tag = Tag::from_u8(get_u8(input, "tag")?)?;
        let payload = get_var_bytes(input, MAX_WIRE_MESSAGE_SIZE, "payload")?.to_vec();
        let nonce = get_u64(input, "nonce")?;
        let view_id = get_u64(input, "view_id")?;
        let parent_count = get_varint(input, "parent_count")? as usize;
        if parent_count > MAX_TRANSACTION_PARENTS {
            return Err(CodecError::LengthOutOfBounds {
                field: "parent_count",
                len: parent_count,
                limit: MAX_TRANSACTION_PARENTS,
            });
        }
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(TransactionId(get_array::<32>(input, "parent")?));
        }
        let depth = get_u64(input, "depth")?;
        let sender_signature = SignatureBytes(get_array::<64>(input, "sender_signature")?);

        Ok(Transaction {
            id,
            sender,
            creator,
            creator_signature,
            sender_signature,
            tag,
            payload,
            nonce,
            view_id,
            parents,
            depth,
        })
    }

    /// Stateless validity: id recomputation plus both signatures.
    pub fn assert_valid(&self) -> Result<(), ValidationError> {
        let body = self.encode_body();

        if TransactionId(blake2b256(&body)) != self.id {
            return Err(ValidationError::IdMismatch);
        }
        if !verify_signature(&self.sender, &body, &self.sender_signature) {
            return Err(ValidationError::InvalidSenderSignature);
        }
        if !verify_signature(
            &self.creator,
            &creator_message(self.tag, &self.payload),
            &self.creator_signature,
        ) {
            return Err(ValidationError::InvalidCreatorSignature);
        }
        Ok(())
    }

    /// Whether this transaction meets the critical-transaction difficulty.
    pub fn is_critical(&self, difficulty: u32) -> bool {
        leading_zero_bits(self.id.as_bytes()) >= difficulty
    }
}

fn creator_message(tag: Tag, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(1 + payload.len());
    message.push(tag.as_u8());
    message.extend_from_slice(payload);
    message
}

fn verify_signature(key: &AccountId, message: &[u8], signature: &SignatureBytes) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(key.as_bytes()) else {
        return false;
    };
    let signature = Signature::from_bytes(signature.as_bytes());
    verifying_key.verify(message, &signature).is_ok()
}
