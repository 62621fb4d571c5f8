//! The execution engine.
//!
//! Applies one transaction — and, breadth-first, every pending transaction
//! its processors emit — against an in-memory working overlay. The overlay
//! commits to the account store in a single write batch once the whole tree
//! has succeeded, so a failure anywhere leaves the ledger unchanged.
//!
//! A single writer lock serializes applies with respect to each other. The
//! nonce *expectation* check lives in the ledger, which holds its receive
//! lock across validation and apply so check-then-increment is one atomic
//! unit; the engine alone only guarantees that applies do not interleave.
//! Finer-grained locking would be a valid optimization but must keep
//! per-account read-modify-write linearizable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::account::Account;
use crate::error::{ApplyError, StoreError};
use crate::processor::{ProcessorRegistry, StateRead};
use crate::store::AccountStore;
use crate::transaction::Transaction;
use crate::types::{AccountId, Tag};

/// A state change with its observed old value, applied to a working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub account: AccountId,
    pub key: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Vec<u8>,
}

/// What one `apply` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Transactions applied across the BFS tree (root plus pendings).
    pub transactions: usize,
    /// Distinct accounts written.
    pub accounts: usize,
}

/// Applies transactions through the registered processors.
pub struct ExecutionEngine {
    store: Arc<AccountStore>,
    registry: Arc<ProcessorRegistry>,
    apply_lock: Mutex<()>,
}

/// Guest-visible state: the current apply's overlay first, then the
/// committed store.
struct OverlayView {
    store: Arc<AccountStore>,
    overlay: HashMap<AccountId, Account>,
}

impl StateRead for OverlayView {
    fn load(&self, account: &AccountId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(acc) = self.overlay.get(account) {
            return Ok(acc.state.get(key).map(<[u8]>::to_vec));
        }
        match self.store.load_account(account) {
            Ok(acc) => Ok(acc.state.get(key).map(<[u8]>::to_vec)),
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl ExecutionEngine {
    pub fn new(store: Arc<AccountStore>, registry: Arc<ProcessorRegistry>) -> Self {
        ExecutionEngine {
            store,
            registry,
            apply_lock: Mutex::new(()),
        }
    }

    /// Apply `tx` and every transaction it recursively produces, in BFS
    /// order, committing the whole tree atomically under `view_id`.
    pub fn apply(&self, tx: &Transaction, view_id: u64) -> Result<ApplyOutcome, ApplyError> {
        let _guard = self.apply_lock.lock();

        let mut overlay: HashMap<AccountId, Account> = HashMap::new();
        let mut queue: VecDeque<Transaction> = VecDeque::new();
        queue.push_back(tx.clone());

        let mut transactions = 0usize;
        while let Some(current) = queue.pop_front() {
            let pending = self.do_apply(&mut overlay, &current)?;
            transactions += 1;
            queue.extend(pending);
        }

        self.store.save_accounts(view_id, overlay.values())?;
        let outcome = ApplyOutcome {
            transactions,
            accounts: overlay.len(),
        };
        debug!(
            tx = %tx.id,
            transactions = outcome.transactions,
            accounts = outcome.accounts,
            "applied transaction tree"
        );
        Ok(outcome)
    }

    /// Run one transaction against the overlay; returns its pendings.
    fn do_apply(
        &self,
        overlay: &mut HashMap<AccountId, Account>,
        tx: &Transaction,
    ) -> Result<Vec<Transaction>, ApplyError> {
        // Nop never reaches a processor: it only bumps the sender nonce and
        // requires the account to already exist.
        if tx.tag == Tag::Nop {
            let mut sender = self.load_working(overlay, &tx.sender).map_err(|err| match err {
                StoreError::NotFound => ApplyError::SenderUnknown {
                    sender: tx.sender.to_string(),
                },
                other => ApplyError::Store(other),
            })?;
            sender.nonce += 1;
            overlay.insert(tx.sender, sender);
            return Ok(Vec::new());
        }

        // Every processor runs, in registration order; deltas and pendings
        // accumulate across all of them. Guests see the pre-transaction
        // state (the overlay as of the previous BFS step).
        let view: Arc<dyn StateRead> = Arc::new(OverlayView {
            store: Arc::clone(&self.store),
            overlay: overlay.clone(),
        });
        let mut emitted = Vec::new();
        let mut pending = Vec::new();
        for processor in self.registry.processors() {
            let output = processor.run(tx, Arc::clone(&view))?;
            emitted.extend(output.deltas);
            pending.extend(output.pending);
        }

        // Working set for this transaction, sender first.
        let mut accounts: HashMap<AccountId, Account> = HashMap::new();
        let sender = match self.load_working(overlay, &tx.sender) {
            Ok(account) => account,
            Err(StoreError::NotFound) if tx.nonce == 0 => Account::new(tx.sender),
            Err(StoreError::NotFound) => {
                return Err(ApplyError::SenderUnknown {
                    sender: tx.sender.to_string(),
                })
            }
            Err(err) => return Err(ApplyError::Store(err)),
        };
        accounts.insert(tx.sender, sender);

        // Deltas apply in emission order; targets synthesize on first touch.
        let mut applied: Vec<Delta> = Vec::with_capacity(emitted.len());
        for delta in emitted {
            if !accounts.contains_key(&delta.account) {
                let loaded = match self.load_working(overlay, &delta.account) {
                    Ok(account) => account,
                    Err(StoreError::NotFound) => Account::new(delta.account),
                    Err(err) => return Err(ApplyError::Store(err)),
                };
                accounts.insert(delta.account, loaded);
            }
            let account = accounts.get_mut(&delta.account).expect("inserted above");
            let old_value = account.state.get(&delta.key).map(<[u8]>::to_vec);
            account.state = account.state.store(&delta.key, &delta.new_value);
            let record = Delta {
                account: delta.account,
                key: delta.key,
                old_value,
                new_value: delta.new_value,
            };
            trace!(
                tx = %tx.id,
                account = %record.account,
                key = %hex::encode(&record.key),
                old = ?record.old_value.as_deref().map(hex::encode),
                new = %hex::encode(&record.new_value),
                "applied delta"
            );
            applied.push(record);
        }
        if !applied.is_empty() {
            debug!(tx = %tx.id, deltas = applied.len(), "merged processor deltas");
        }

        accounts
            .get_mut(&tx.sender)
            .expect("sender inserted above")
            .nonce += 1;

        overlay.extend(accounts);
        Ok(pending)
    }

    fn load_working(
        &self,
        overlay: &HashMap<AccountId, Account>,
        public_key: &AccountId,
    ) -> Result<Account, StoreError> {
        if let Some(account) = overlay.get(public_key) {
            return Ok(account.clone());
        }
        self.store.load_account(public_key)
    }
}
