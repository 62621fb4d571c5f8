//! The ledger facade.
//!
//! Ties validation, the transaction graph, and the execution engine behind
//! the surface the peer protocol and the API consume: receive a transaction
//! and vote on it, attach our sender identity to an outgoing transaction,
//! look up transactions, and track the current view and root.
//!
//! Consensus itself is external: a [`Resolver`] yields the currently
//! preferred transaction, and the consensus layer advances views through
//! [`Ledger::advance_view`] when it finalizes one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::ExecutionEngine;
use crate::error::{ApplyError, LedgerError, StoreError, ValidationError};
use crate::graph::TransactionGraph;
use crate::hash::blake2b256;
use crate::processor::ProcessorRegistry;
use crate::store::AccountStore;
use crate::transaction::Transaction;
use crate::types::{AccountId, SignatureBytes, Tag, TransactionId};

/// The ledger's answer to a gossiped transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    Accepted,
    Rejected(RejectReason),
}

impl Vote {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Vote::Accepted)
    }
}

/// Why a transaction was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The execution engine failed the transaction (processor abort,
    /// exhaustion, unknown sender at apply time, ...).
    #[error("execution failed: {0}")]
    Execution(String),
}

/// The consensus layer's preferred-transaction seam.
///
/// How it converges is external to this core; the protocol handlers only
/// read and update the preference.
pub trait Resolver: Send + Sync {
    fn preferred(&self) -> Option<Transaction>;
    fn prefer(&self, tx: Transaction);
    fn clear_preferred(&self);
}

/// A plain store-the-latest resolver, the default until a consensus layer
/// installs its own.
#[derive(Default)]
pub struct SingleResolver {
    preferred: RwLock<Option<Transaction>>,
}

impl Resolver for SingleResolver {
    fn preferred(&self) -> Option<Transaction> {
        self.preferred.read().clone()
    }

    fn prefer(&self, tx: Transaction) {
        *self.preferred.write() = Some(tx);
    }

    fn clear_preferred(&self) {
        *self.preferred.write() = None;
    }
}

/// The ledger execution core.
pub struct Ledger {
    store: Arc<AccountStore>,
    registry: Arc<ProcessorRegistry>,
    engine: ExecutionEngine,
    graph: TransactionGraph,
    view_id: AtomicU64,
    root: RwLock<Transaction>,
    resolver: Arc<dyn Resolver>,
    /// Serializes the whole receive path. The replay and nonce checks must
    /// be atomic with the apply commit and the graph insert, or two
    /// concurrent deliveries could both pass validation and both commit.
    receive_lock: Mutex<()>,
}

impl Ledger {
    /// Build a ledger over `store` and `registry`, starting from the
    /// synthetic zero root (genesis bootstrap is an external concern).
    pub fn new(store: Arc<AccountStore>, registry: Arc<ProcessorRegistry>) -> Self {
        let root = bootstrap_root();
        Ledger {
            engine: ExecutionEngine::new(Arc::clone(&store), Arc::clone(&registry)),
            graph: TransactionGraph::new(root.clone()),
            view_id: AtomicU64::new(root.view_id + 1),
            root: RwLock::new(root),
            resolver: Arc::new(SingleResolver::default()),
            receive_lock: Mutex::new(()),
            store,
            registry,
        }
    }

    /// Install a consensus-provided resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Validate and apply a transaction, answering with a vote.
    ///
    /// Validation and execution failures reject the transaction; store
    /// failures propagate because the node cannot answer honestly without
    /// its state.
    ///
    /// Concurrent deliveries serialize on the receive lock, so the nonce
    /// expectation check, the replay check, the apply, and the graph insert
    /// are one atomic unit per transaction.
    pub fn receive_transaction(&self, tx: Transaction) -> Result<Vote, LedgerError> {
        let _guard = self.receive_lock.lock();

        if let Err(err) = self.validate(&tx) {
            return match err {
                LedgerError::Validation(reason) => {
                    debug!(tx = %tx.id, %reason, "rejected transaction");
                    Ok(Vote::Rejected(reason.into()))
                }
                other => Err(other),
            };
        }

        match self.engine.apply(&tx, self.view_id()) {
            Ok(outcome) => {
                self.graph.insert(tx.clone());
                debug!(
                    tx = %tx.id,
                    transactions = outcome.transactions,
                    accounts = outcome.accounts,
                    "accepted transaction"
                );
                Ok(Vote::Accepted)
            }
            Err(ApplyError::Store(err)) => Err(LedgerError::Store(err)),
            Err(err) => {
                warn!(tx = %tx.id, error = %err, "transaction failed to apply");
                Ok(Vote::Rejected(RejectReason::Execution(err.to_string())))
            }
        }
    }

    /// Attach our sender identity to a creator-signed transaction: next
    /// nonce, current view, eligible parents, depth, signature, and id.
    pub fn attach_sender(&self, keys: &SigningKey, tx: &mut Transaction) -> Result<(), LedgerError> {
        let public_key = AccountId(keys.verifying_key().to_bytes());
        let nonce = match self.store.load_account(&public_key) {
            Ok(account) => account.nonce,
            Err(StoreError::NotFound) => 0,
            Err(err) => return Err(LedgerError::Store(err)),
        };

        let parents = self.graph.eligible_parents();
        let depth = parents
            .iter()
            .filter_map(|parent| self.graph.depth_of(parent))
            .max()
            .unwrap_or(0)
            + 1;

        tx.attach(keys, nonce, self.view_id(), parents, depth);
        Ok(())
    }

    pub fn find_transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.graph.get(id)
    }

    pub fn view_id(&self) -> u64 {
        self.view_id.load(Ordering::SeqCst)
    }

    pub fn root(&self) -> Transaction {
        self.root.read().clone()
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Whether `tx` meets the critical-transaction difficulty.
    pub fn is_critical(&self, tx: &Transaction) -> bool {
        tx.is_critical(crate::constants::MINIMUM_DIFFICULTY)
    }

    /// Median arrival time of the most recent graph ancestors, for the
    /// consensus layer's view timing.
    pub fn median_timestamp(&self) -> u64 {
        self.graph
            .median_timestamp(crate::constants::MEDIAN_TIMESTAMP_NUM_ANCESTORS)
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    pub fn graph(&self) -> &TransactionGraph {
        &self.graph
    }

    /// Consensus finalized `root`: move to the view after it. Refuses to
    /// move backwards; views only decrease through explicit sync
    /// ([`Ledger::adopt_root`]).
    pub fn advance_view(&self, root: Transaction) -> bool {
        let next = root.view_id + 1;
        if next <= self.view_id() {
            return false;
        }
        self.install_root(root, next);
        true
    }

    /// Sync adopted a remote root; install it unconditionally.
    pub fn adopt_root(&self, root: Transaction) {
        let next = root.view_id + 1;
        self.install_root(root, next);
    }

    fn install_root(&self, root: Transaction, next_view: u64) {
        self.graph.insert(root.clone());
        self.view_id.store(next_view, Ordering::SeqCst);
        *self.root.write() = root;
        self.resolver.clear_preferred();
        debug!(view_id = next_view, "advanced view");
    }

    fn validate(&self, tx: &Transaction) -> Result<(), LedgerError> {
        if self.graph.contains(&tx.id) {
            return Err(ValidationError::AlreadyReceived.into());
        }

        tx.assert_valid()?;

        if !self.registry.supports_tag(tx.tag) {
            return Err(ValidationError::UnknownTag { tag: tx.tag.as_u8() }.into());
        }

        if tx.parents.is_empty() {
            // Only the first transactions off the bootstrap root may omit
            // parents.
            if self.graph.len() > 1 {
                return Err(ValidationError::NoParents.into());
            }
        } else {
            let graph_depth = self.graph.max_depth();
            for parent in &tx.parents {
                let Some(parent_depth) = self.graph.depth_of(parent) else {
                    return Err(ValidationError::MissingParent {
                        parent: parent.to_string(),
                    }
                    .into());
                };
                if parent_depth + crate::constants::MAX_ELIGIBLE_PARENTS_DEPTH_DIFF < graph_depth {
                    return Err(ValidationError::ParentTooDeep {
                        parent_depth,
                        graph_depth,
                    }
                    .into());
                }
            }
        }

        match self.store.load_account(&tx.sender) {
            Ok(account) => {
                if tx.nonce != account.nonce {
                    return Err(ValidationError::NonceMismatch {
                        sender: tx.sender.to_string(),
                        expected: account.nonce,
                        got: tx.nonce,
                    }
                    .into());
                }
            }
            Err(StoreError::NotFound) => {
                if tx.nonce != 0 {
                    return Err(ValidationError::UnknownSender {
                        sender: tx.sender.to_string(),
                        nonce: tx.nonce,
                    }
                    .into());
                }
            }
            Err(err) => return Err(LedgerError::Store(err)),
        }

        Ok(())
    }
}

/// The synthetic zero root every fresh ledger starts from.
fn bootstrap_root() -> Transaction {
    let mut root = Transaction {
        id: TransactionId::ZERO,
        sender: AccountId::ZERO,
        creator: AccountId::ZERO,
        creator_signature: SignatureBytes::ZERO,
        sender_signature: SignatureBytes::ZERO,
        tag: Tag::Nop,
        payload: Vec::new(),
        nonce: 0,
        view_id: 0,
        parents: Vec::new(),
        depth: 0,
    };
    root.id = TransactionId(blake2b256(&root.encode_body()));
    root
}
