//! The account store.
//!
//! Byte-keyed persistence of account records over redb, prefixed by the
//! `account_` bucket tag. Account saves go through a single write
//! transaction per apply, so a whole working set commits atomically or not
//! at all — a crash can lose whole applies but never split one.
//!
//! A second table tracks the view in which each account last changed; the
//! sync service derives its state diffs from it.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::account::Account;
use crate::codec::{get_var_bytes, get_varint, put_var_bytes, put_varint};
use crate::constants::{ACCOUNT_KEY_PREFIX, MAX_WIRE_MESSAGE_SIZE};
use crate::error::{CodecError, StoreError};
use crate::types::AccountId;

/// Raw ledger state: `account_<pk>` → canonical account encoding.
const STATE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ledger_state");

/// Last-modified view per account: pk → view id.
const ACCOUNT_VIEWS_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("account_views");

/// Store key for an account record: `account_` || public key.
pub fn account_key(public_key: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ACCOUNT_KEY_PREFIX.len() + 32);
    key.extend_from_slice(ACCOUNT_KEY_PREFIX);
    key.extend_from_slice(public_key.as_bytes());
    key
}

/// Persistent account state backed by redb.
pub struct AccountStore {
    db: Database,
}

impl AccountStore {
    /// Open (or create) the store at `path` and ensure its tables exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(STATE_TABLE)?;
            txn.open_table(ACCOUNT_VIEWS_TABLE)?;
        }
        txn.commit()?;
        Ok(AccountStore { db })
    }

    /// Raw read. `NotFound` is a distinct kind so callers can synthesize.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE_TABLE)?;
        let guard = table.get(key)?;
        guard
            .map(|value| value.value().to_vec())
            .ok_or(StoreError::NotFound)
    }

    /// Raw write, atomic at key granularity.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE_TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Raw delete. Deleting a missing key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STATE_TABLE)?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Load and decode an account record, returning an owned value.
    pub fn load_account(&self, public_key: &AccountId) -> Result<Account, StoreError> {
        let bytes = self.get(&account_key(public_key))?;
        Ok(Account::decode(&bytes)?)
    }

    /// Persist a single account under the current view.
    pub fn save_account(&self, view_id: u64, account: &Account) -> Result<(), StoreError> {
        self.save_accounts(view_id, std::iter::once(account))
    }

    /// Persist a whole working set in one write transaction.
    ///
    /// Either every account in the set lands (together with its
    /// last-modified-view entry) or none do.
    pub fn save_accounts<'a>(
        &self,
        view_id: u64,
        accounts: impl IntoIterator<Item = &'a Account>,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        let mut saved = 0usize;
        {
            let mut state = txn.open_table(STATE_TABLE)?;
            let mut views = txn.open_table(ACCOUNT_VIEWS_TABLE)?;
            for account in accounts {
                let key = account_key(&account.public_key);
                state.insert(key.as_slice(), account.encode().as_slice())?;
                views.insert(account.public_key.as_bytes().as_slice(), view_id)?;
                saved += 1;
            }
        }
        txn.commit()?;
        debug!(accounts = saved, view_id, "committed account batch");
        Ok(())
    }

    /// Deterministic encoding of every account changed in views after
    /// `since_view_id`, ordered by public key. Consumed only by sync.
    pub fn dump_diff(&self, since_view_id: u64) -> Result<Vec<u8>, StoreError> {
        let txn = self.db.begin_read()?;
        let views = txn.open_table(ACCOUNT_VIEWS_TABLE)?;
        let state = txn.open_table(STATE_TABLE)?;

        let mut records: Vec<Vec<u8>> = Vec::new();
        // redb iterates in key order, which keeps the diff deterministic.
        for entry in views.iter()? {
            let (key, view) = entry?;
            if view.value() <= since_view_id {
                continue;
            }
            let pk: [u8; 32] = key
                .value()
                .try_into()
                .map_err(|_| StoreError::Corrupt(CodecError::UnexpectedEof { field: "view_key" }))?;
            let account_bytes = state
                .get(account_key(&AccountId(pk)).as_slice())?
                .ok_or(StoreError::NotFound)?;
            records.push(account_bytes.value().to_vec());
        }

        let mut out = Vec::new();
        put_varint(&mut out, records.len() as u64);
        for record in &records {
            put_var_bytes(&mut out, record);
        }
        Ok(out)
    }

    /// Decode a state diff and install its accounts atomically under
    /// `view_id` (the latest view advertised with the diff).
    pub fn apply_diff(&self, view_id: u64, diff: &[u8]) -> Result<usize, StoreError> {
        let mut input = diff;
        let count = get_varint(&mut input, "diff_len")? as usize;
        let mut accounts = Vec::with_capacity(count);
        for _ in 0..count {
            let record = get_var_bytes(&mut input, MAX_WIRE_MESSAGE_SIZE, "diff_record")?;
            accounts.push(Account::decode(record)?);
        }
        crate::codec::expect_end(input)?;

        self.save_accounts(view_id, accounts.iter())?;
        Ok(accounts.len())
    }
}
