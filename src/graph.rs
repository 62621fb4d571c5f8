//! The in-memory transaction DAG.
//!
//! Tracks every transaction the ledger has accepted, parent/child edges,
//! the tip set, and arrival times. Parent eligibility and the median
//! arrival timestamp feed the consensus layer's parent selection and view
//! timing; neither gates acceptance here.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::constants::MAX_ELIGIBLE_PARENTS_DEPTH_DIFF;
use crate::transaction::Transaction;
use crate::types::TransactionId;

struct GraphInner {
    transactions: HashMap<TransactionId, Transaction>,
    children: HashMap<TransactionId, Vec<TransactionId>>,
    tips: HashSet<TransactionId>,
    /// Arrival times (unix ms), in insertion order.
    arrivals: Vec<u64>,
    max_depth: u64,
}

/// Concurrency-safe DAG of received transactions.
pub struct TransactionGraph {
    inner: RwLock<GraphInner>,
}

impl TransactionGraph {
    /// Start a graph from its root transaction.
    pub fn new(root: Transaction) -> Self {
        let mut transactions = HashMap::new();
        let mut tips = HashSet::new();
        let max_depth = root.depth;
        tips.insert(root.id);
        transactions.insert(root.id, root);

        TransactionGraph {
            inner: RwLock::new(GraphInner {
                transactions,
                children: HashMap::new(),
                tips,
                arrivals: vec![now_ms()],
                max_depth,
            }),
        }
    }

    /// Insert a transaction. Returns `false` if it was already present.
    pub fn insert(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.write();
        if inner.transactions.contains_key(&tx.id) {
            return false;
        }

        for parent in &tx.parents {
            inner.children.entry(*parent).or_default().push(tx.id);
            inner.tips.remove(parent);
        }
        inner.tips.insert(tx.id);
        inner.max_depth = inner.max_depth.max(tx.depth);
        inner.arrivals.push(now_ms());
        inner.transactions.insert(tx.id, tx);
        true
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.inner.read().transactions.contains_key(id)
    }

    pub fn get(&self, id: &TransactionId) -> Option<Transaction> {
        self.inner.read().transactions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().transactions.is_empty()
    }

    pub fn max_depth(&self) -> u64 {
        self.inner.read().max_depth
    }

    /// Depth of a known transaction.
    pub fn depth_of(&self, id: &TransactionId) -> Option<u64> {
        self.inner.read().transactions.get(id).map(|tx| tx.depth)
    }

    /// Tips close enough to the top of the graph to parent a new
    /// transaction, sorted for a stable encoding.
    pub fn eligible_parents(&self) -> Vec<TransactionId> {
        let inner = self.inner.read();
        let floor = inner
            .max_depth
            .saturating_sub(MAX_ELIGIBLE_PARENTS_DEPTH_DIFF);
        let mut parents: Vec<TransactionId> = inner
            .tips
            .iter()
            .filter(|id| {
                inner
                    .transactions
                    .get(id)
                    .is_some_and(|tx| tx.depth >= floor)
            })
            .copied()
            .collect();
        parents.sort();
        parents
    }

    /// Median of the most recent `ancestors` arrival timestamps (unix ms).
    pub fn median_timestamp(&self, ancestors: usize) -> u64 {
        let inner = self.inner.read();
        let count = ancestors.max(1).min(inner.arrivals.len());
        let mut recent: Vec<u64> = inner.arrivals[inner.arrivals.len() - count..].to_vec();
        recent.sort_unstable();
        recent[recent.len() / 2]
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
