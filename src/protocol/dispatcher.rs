//! The per-peer message dispatcher.
//!
//! Each connected peer runs one receive loop that selects across one typed
//! channel per request opcode and spawns an independent task per request.
//! The framing layer feeds the channels with decoded requests and drains
//! the outbound response channel; it is external to this core.
//!
//! Peer disconnect cancels every in-flight handler for that peer; cancelled
//! handlers release their locks and discard their responses silently. A
//! failed response send disconnects the peer asynchronously.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::MAX_INFLIGHT_REQUESTS_PER_PEER;
use crate::node::NodeContext;
use crate::protocol::handlers::{HandlerRegistry, PeerSession};
use crate::protocol::{
    GossipRequest, PeerRequest, PeerResponse, QueryRequest, SyncDiffChunkRequest,
    SyncDiffMetadataRequest, SyncTransactionRequest, SyncViewRequest,
};
use crate::types::PeerId;

/// Senders the framing layer uses to feed a peer's typed channels.
#[derive(Clone)]
pub struct PeerInboxSenders {
    gossip: mpsc::Sender<GossipRequest>,
    query: mpsc::Sender<QueryRequest>,
    sync_view: mpsc::Sender<SyncViewRequest>,
    sync_diff_metadata: mpsc::Sender<SyncDiffMetadataRequest>,
    sync_diff_chunk: mpsc::Sender<SyncDiffChunkRequest>,
    sync_transaction: mpsc::Sender<SyncTransactionRequest>,
}

impl PeerInboxSenders {
    /// Route a decoded request to its opcode channel. Returns `false` when
    /// the peer's receive loop is gone.
    pub async fn send(&self, request: PeerRequest) -> bool {
        match request {
            PeerRequest::Gossip(req) => self.gossip.send(req).await.is_ok(),
            PeerRequest::Query(req) => self.query.send(req).await.is_ok(),
            PeerRequest::SyncView(req) => self.sync_view.send(req).await.is_ok(),
            PeerRequest::SyncDiffMetadata(req) => {
                self.sync_diff_metadata.send(req).await.is_ok()
            }
            PeerRequest::SyncDiffChunk(req) => self.sync_diff_chunk.send(req).await.is_ok(),
            PeerRequest::SyncTransaction(req) => self.sync_transaction.send(req).await.is_ok(),
        }
    }
}

/// Receive side of a peer's typed channels.
pub struct PeerInbox {
    gossip: mpsc::Receiver<GossipRequest>,
    query: mpsc::Receiver<QueryRequest>,
    sync_view: mpsc::Receiver<SyncViewRequest>,
    sync_diff_metadata: mpsc::Receiver<SyncDiffMetadataRequest>,
    sync_diff_chunk: mpsc::Receiver<SyncDiffChunkRequest>,
    sync_transaction: mpsc::Receiver<SyncTransactionRequest>,
}

/// Build the typed channel pair for one peer connection.
pub fn peer_channels(capacity: usize) -> (PeerInboxSenders, PeerInbox) {
    let capacity = capacity.max(1);
    let (gossip_tx, gossip_rx) = mpsc::channel(capacity);
    let (query_tx, query_rx) = mpsc::channel(capacity);
    let (sync_view_tx, sync_view_rx) = mpsc::channel(capacity);
    let (metadata_tx, metadata_rx) = mpsc::channel(capacity);
    let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
    let (tx_tx, tx_rx) = mpsc::channel(capacity);

    (
        PeerInboxSenders {
            gossip: gossip_tx,
            query: query_tx,
            sync_view: sync_view_tx,
            sync_diff_metadata: metadata_tx,
            sync_diff_chunk: chunk_tx,
            sync_transaction: tx_tx,
        },
        PeerInbox {
            gossip: gossip_rx,
            query: query_rx,
            sync_view: sync_view_rx,
            sync_diff_metadata: metadata_rx,
            sync_diff_chunk: chunk_rx,
            sync_transaction: tx_rx,
        },
    )
}

/// One peer connection as the dispatcher sees it.
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub inbox: PeerInbox,
    /// Responses for the framing layer to put on the wire.
    pub outbound: mpsc::Sender<PeerResponse>,
    /// Cancelled on disconnect, by either side.
    pub cancel: CancellationToken,
}

/// Dispatches peer requests to their handlers.
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Dispatcher {
            ctx,
            registry: HandlerRegistry::new(),
        }
    }

    /// Run one peer's receive loop until disconnect or channel close.
    pub async fn run_peer(&self, connection: PeerConnection) {
        let PeerConnection {
            peer_id,
            mut inbox,
            outbound,
            cancel,
        } = connection;

        let session = Arc::new(PeerSession::new(
            peer_id,
            self.ctx.config.chunk_cache_size,
        ));
        let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_REQUESTS_PER_PEER));

        debug!(peer = %peer_id, "peer receive loop started");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(req) = inbox.gossip.recv() => PeerRequest::Gossip(req),
                Some(req) = inbox.query.recv() => PeerRequest::Query(req),
                Some(req) = inbox.sync_view.recv() => PeerRequest::SyncView(req),
                Some(req) = inbox.sync_diff_metadata.recv() => PeerRequest::SyncDiffMetadata(req),
                Some(req) = inbox.sync_diff_chunk.recv() => PeerRequest::SyncDiffChunk(req),
                Some(req) = inbox.sync_transaction.recv() => PeerRequest::SyncTransaction(req),
                else => break,
            };
            self.spawn_handler(request, &session, &outbound, &cancel, &inflight);
        }
        debug!(peer = %peer_id, "peer receive loop ended");
    }

    fn spawn_handler(
        &self,
        request: PeerRequest,
        session: &Arc<PeerSession>,
        outbound: &mpsc::Sender<PeerResponse>,
        cancel: &CancellationToken,
        inflight: &Arc<Semaphore>,
    ) {
        let Ok(permit) = Arc::clone(inflight).try_acquire_owned() else {
            warn!(
                peer = %session.peer_id,
                opcode = ?request.opcode(),
                "in-flight request limit reached, dropping request"
            );
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        let registry = self.registry.clone();
        let session = Arc::clone(session);
        let outbound = outbound.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;

            let response = tokio::select! {
                // Disconnected mid-handler: discard silently.
                _ = cancel.cancelled() => return,
                result = registry.dispatch(&ctx, &session, request) => match result {
                    Ok(response) => response,
                    Err(err) => {
                        // Handler failures never crash the dispatcher.
                        warn!(peer = %session.peer_id, error = %err, "request handler failed");
                        return;
                    }
                },
            };

            if cancel.is_cancelled() {
                return;
            }
            if outbound.send(response).await.is_err() {
                warn!(peer = %session.peer_id, "response send failed, disconnecting peer");
                cancel.cancel();
            }
        });
    }
}
