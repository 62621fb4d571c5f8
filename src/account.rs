//! The account model.
//!
//! An account is a value type during execution: loaded from the store,
//! mutated in a working set, written back in one batch. Its state map is
//! versioned — `store` returns a new version and never touches the old one —
//! which is what lets the execution engine build a full proposed next state
//! and drop it on failure without the store ever seeing it.

use std::collections::BTreeMap;

use crate::codec::{expect_end, get_array, get_var_bytes, get_varint, put_bytes, put_var_bytes, put_varint};
use crate::constants::MAX_WIRE_MESSAGE_SIZE;
use crate::error::CodecError;
use crate::types::AccountId;

/// A versioned key→value state map.
///
/// `store` is pure: the receiver is left untouched and remains a valid
/// earlier version. Ordered keys keep the canonical encoding deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl AccountState {
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Produce the next version with `key` set to `value`.
    pub fn store(&self, key: &[u8], value: &[u8]) -> AccountState {
        let mut next = self.entries.clone();
        next.insert(key.to_vec(), value.to_vec());
        AccountState { entries: next }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

/// An account record: public key, nonce, and versioned state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub public_key: AccountId,
    pub nonce: u64,
    pub state: AccountState,
}

impl Account {
    pub fn new(public_key: AccountId) -> Self {
        Account {
            public_key,
            nonce: 0,
            state: AccountState::default(),
        }
    }

    /// Canonical encoding: pk (32) | varint nonce | varint pair-count |
    /// (varint klen | k | varint vlen | v)* sorted by key. Bit-stable.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        put_bytes(&mut out, self.public_key.as_bytes());
        put_varint(&mut out, self.nonce);
        put_varint(&mut out, self.state.len() as u64);
        for (key, value) in self.state.iter() {
            put_var_bytes(&mut out, key);
            put_var_bytes(&mut out, value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut input = bytes;
        let account = Self::decode_from(&mut input)?;
        expect_end(input)?;
        Ok(account)
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        let public_key = AccountId(get_array::<32>(input, "public_key")?);
        let nonce = get_varint(input, "nonce")?;
        let pair_count = get_varint(input, "state_len")? as usize;
        let mut entries = BTreeMap::new();
        for _ in 0..pair_count {
            let key = get_var_bytes(input, MAX_WIRE_MESSAGE_SIZE, "state_key")?.to_vec();
            let value = get_var_bytes(input, MAX_WIRE_MESSAGE_SIZE, "state_value")?.to_vec();
            entries.insert(key, value);
        }
        Ok(Account {
            public_key,
            nonce,
            state: AccountState { entries },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_leaves_the_old_version_untouched() {
        let v0 = AccountState::default();
        let v1 = v0.store(b"balance", b"10");
        let v2 = v1.store(b"balance", b"20");

        assert_eq!(v0.get(b"balance"), None);
        assert_eq!(v1.get(b"balance"), Some(b"10".as_slice()));
        assert_eq!(v2.get(b"balance"), Some(b"20".as_slice()));
    }

    #[test]
    fn encoding_round_trips() {
        let mut account = Account::new(AccountId([5u8; 32]));
        account.nonce = 42;
        account.state = account.state.store(b"b", b"two").store(b"a", b"one");

        let decoded = Account::decode(&account.encode()).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn encoding_is_sorted_by_key_and_bit_stable() {
        let mut a = Account::new(AccountId([1u8; 32]));
        a.state = a.state.store(b"z", b"1").store(b"a", b"2");

        let mut b = Account::new(AccountId([1u8; 32]));
        b.state = b.state.store(b"a", b"2").store(b"z", b"1");

        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = Account::new(AccountId([9u8; 32])).encode();
        bytes.push(0xee);
        assert!(Account::decode(&bytes).is_err());
    }
}
