//! Core identifier types.
//!
//! Fixed-width newtypes for the 32-byte ids that flow through the ledger and
//! the wire, plus the transaction tag enum. Hex renderings everywhere a
//! human might read one.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CodecError;

/// A transaction id: the blake2b-256 hash of the canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub [u8; 32]);

/// An account's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

/// A connected peer's identity key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

/// A blake2b-256 chunk content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; 32]);

macro_rules! impl_id_common {
    ($name:ident) => {
        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl FromStr for $name {
            type Err = CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = hex::decode(s).map_err(|_| CodecError::InvalidHex {
                    field: stringify!($name),
                })?;
                let bytes: [u8; 32] = raw.try_into().map_err(|_| CodecError::InvalidHex {
                    field: stringify!($name),
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

impl_id_common!(TransactionId);
impl_id_common!(AccountId);
impl_id_common!(PeerId);
impl_id_common!(ChunkHash);

/// Transaction tags, one per processor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    Nop = 0,
    Transfer = 1,
    CreateContract = 2,
    Stake = 3,
}

impl Tag {
    pub fn from_u8(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(Tag::Nop),
            1 => Ok(Tag::Transfer),
            2 => Ok(Tag::CreateContract),
            3 => Ok(Tag::Stake),
            other => Err(CodecError::UnknownTag { tag: other }),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A 64-byte Ed25519 signature.
///
/// Wrapped so serde can treat it as a byte string; plain `[u8; 64]` has no
/// derived serde support.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; 64]);

impl SignatureBytes {
    pub const ZERO: Self = Self([0u8; 64]);

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(self.0))
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct SignatureBytesVisitor;

impl<'de> Visitor<'de> for SignatureBytesVisitor {
    type Value = SignatureBytes;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 64-byte signature")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        let bytes: [u8; 64] = v
            .try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))?;
        Ok(SignatureBytes(bytes))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = [0u8; 64];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(SignatureBytes(bytes))
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(SignatureBytesVisitor)
    }
}
