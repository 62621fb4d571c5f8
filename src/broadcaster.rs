//! Transaction broadcasting.
//!
//! Fans a gossiped transaction out to every connected peer, counting
//! positive votes under the consensus per-query timeout; an expired or
//! failed query is a non-vote. The paused flag silences the gossip and
//! query handlers while the node is resynchronizing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::constants::QUERY_TIMEOUT_MS;
use crate::protocol::{GossipRequest, PeerQuery, PeerRequest, PeerResponse};
use crate::transaction::Transaction;
use crate::types::PeerId;

/// Result of one broadcast round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Peers queried.
    pub peers: usize,
    /// Positive votes received before the timeout.
    pub votes: usize,
}

/// Gossip fan-out over the connected peer set.
pub struct Broadcaster {
    peers: RwLock<HashMap<PeerId, Arc<dyn PeerQuery>>>,
    paused: AtomicBool,
    query_timeout: Duration,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            peers: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            query_timeout: Duration::from_millis(QUERY_TIMEOUT_MS),
        }
    }

    /// Override the per-query timeout (tests use a short one).
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn register_peer(&self, peer: PeerId, client: Arc<dyn PeerQuery>) {
        self.peers.write().insert(peer, client);
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Gossip `tx` to every peer concurrently and count positive votes.
    pub async fn broadcast(&self, tx: &Transaction) -> BroadcastOutcome {
        let peers: Vec<(PeerId, Arc<dyn PeerQuery>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, client)| (*id, Arc::clone(client)))
            .collect();

        let mut tasks = Vec::with_capacity(peers.len());
        for (peer_id, client) in peers.iter().cloned() {
            let request = PeerRequest::Gossip(GossipRequest { tx: tx.clone() });
            let timeout = self.query_timeout;
            tasks.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, client.request(request)).await {
                    Ok(Ok(PeerResponse::Gossip(response))) => response.vote,
                    Ok(Ok(other)) => {
                        warn!(peer = %peer_id, opcode = ?other.opcode(), "unexpected gossip response");
                        false
                    }
                    Ok(Err(err)) => {
                        warn!(peer = %peer_id, error = %err, "gossip request failed");
                        false
                    }
                    // Expired queries count as non-votes.
                    Err(_) => {
                        debug!(peer = %peer_id, "gossip query timed out");
                        false
                    }
                }
            }));
        }

        let mut votes = 0usize;
        for task in tasks {
            if matches!(task.await, Ok(true)) {
                votes += 1;
            }
        }

        let outcome = BroadcastOutcome {
            peers: peers.len(),
            votes,
        };
        debug!(tx = %tx.id, peers = outcome.peers, votes = outcome.votes, "broadcast round complete");
        outcome
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Broadcaster::new()
    }
}
