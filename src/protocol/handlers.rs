//! Peer request handlers.
//!
//! One handler per opcode, registered once at startup in a
//! [`HandlerRegistry`]. Handlers are short: they mutate through the
//! ledger's concurrency-safe API and return exactly one response. Errors
//! never crash the dispatcher — it logs them and drops the response.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::ledger::Vote;
use crate::node::NodeContext;
use crate::protocol::{
    GossipResponse, Opcode, PeerRequest, PeerResponse, QueryResponse, SyncViewResponse,
};
use crate::sync::ChunkCache;
use crate::types::PeerId;

/// Per-peer handler state: identity plus the peer's chunk cache.
pub struct PeerSession {
    pub peer_id: PeerId,
    pub chunk_cache: Arc<ChunkCache>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, chunk_cache_capacity: usize) -> Self {
        PeerSession {
            peer_id,
            chunk_cache: Arc::new(ChunkCache::new(chunk_cache_capacity)),
        }
    }
}

/// A handler for one request opcode.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn opcode(&self) -> Opcode;

    async fn handle(
        &self,
        ctx: &NodeContext,
        session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse>;

    fn name(&self) -> &'static str;
}

/// Opcode → handler table, built once at startup.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<Opcode, Arc<dyn RequestHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let all: Vec<Arc<dyn RequestHandler>> = vec![
            Arc::new(GossipHandler),
            Arc::new(QueryHandler),
            Arc::new(SyncViewHandler),
            Arc::new(SyncDiffMetadataHandler),
            Arc::new(SyncDiffChunkHandler),
            Arc::new(SyncTransactionHandler),
        ];
        let handlers = all
            .into_iter()
            .map(|handler| (handler.opcode(), handler))
            .collect();
        HandlerRegistry {
            handlers: Arc::new(handlers),
        }
    }

    /// Route a request to its handler.
    pub async fn dispatch(
        &self,
        ctx: &NodeContext,
        session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let opcode = request.opcode();
        let Some(handler) = self.handlers.get(&opcode) else {
            bail!("no handler registered for opcode {opcode:?}");
        };
        debug!(handler = handler.name(), ?opcode, peer = %session.peer_id, "dispatching request");
        handler.handle(ctx, session, request).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

struct GossipHandler;

#[async_trait]
impl RequestHandler for GossipHandler {
    fn opcode(&self) -> Opcode {
        Opcode::Gossip
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        _session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::Gossip(request) = request else {
            bail!("gossip handler received {:?}", request.opcode());
        };

        // While resynchronizing, answer with the zero response: no vote.
        if ctx.broadcaster.is_paused() {
            return Ok(PeerResponse::Gossip(GossipResponse::default()));
        }

        let ledger = Arc::clone(&ctx.ledger);
        let tx = request.tx;
        let tx_id = tx.id;
        let vote = tokio::task::spawn_blocking(move || ledger.receive_transaction(tx))
            .await
            .context("gossip apply task panicked")??;

        if let Vote::Rejected(reason) = &vote {
            warn!(tx = %tx_id, %reason, "gave a negative vote to a transaction");
        }
        Ok(PeerResponse::Gossip(GossipResponse {
            vote: vote.is_accepted(),
        }))
    }

    fn name(&self) -> &'static str {
        "GossipHandler"
    }
}

struct QueryHandler;

#[async_trait]
impl RequestHandler for QueryHandler {
    fn opcode(&self) -> Opcode {
        Opcode::Query
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        _session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::Query(request) = request else {
            bail!("query handler received {:?}", request.opcode());
        };

        if ctx.broadcaster.is_paused() {
            return Ok(PeerResponse::Query(QueryResponse::default()));
        }

        let mut preferred = None;
        if request.tx.view_id == ctx.ledger.view_id().saturating_sub(1) {
            preferred = Some(ctx.ledger.root());
        } else if let Some(tip) = ctx.ledger.resolver().preferred() {
            preferred = Some(tip);
        }

        let ledger = Arc::clone(&ctx.ledger);
        let tx = request.tx.clone();
        let vote = tokio::task::spawn_blocking(move || ledger.receive_transaction(tx))
            .await
            .context("query apply task panicked")??;
        if vote.is_accepted() {
            preferred = Some(request.tx);
        }

        Ok(PeerResponse::Query(QueryResponse { preferred }))
    }

    fn name(&self) -> &'static str {
        "QueryHandler"
    }
}

struct SyncViewHandler;

#[async_trait]
impl RequestHandler for SyncViewHandler {
    fn opcode(&self) -> Opcode {
        Opcode::SyncView
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::SyncView(request) = request else {
            bail!("sync-view handler received {:?}", request.opcode());
        };

        let resolver = ctx.syncer.resolver();
        let mut root = resolver.preferred().unwrap_or_else(|| ctx.ledger.root());

        // An invalid peer root still gets our answer, but is neither
        // adopted nor recorded.
        if request.root.assert_valid().is_ok() {
            if ctx.ledger.view_id() < request.root.view_id && resolver.preferred().is_none() {
                debug!(peer = %session.peer_id, peer_view = request.root.view_id, "preferring peer root");
                root = request.root.clone();
                resolver.prefer(request.root.clone());
            }
            ctx.syncer.record_root(session.peer_id, request.root.id);
        }

        Ok(PeerResponse::SyncView(SyncViewResponse { root }))
    }

    fn name(&self) -> &'static str {
        "SyncViewHandler"
    }
}

struct SyncDiffMetadataHandler;

#[async_trait]
impl RequestHandler for SyncDiffMetadataHandler {
    fn opcode(&self) -> Opcode {
        Opcode::SyncDiffMetadata
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::SyncDiffMetadata(request) = request else {
            bail!("sync-diff-metadata handler received {:?}", request.opcode());
        };

        let sync = Arc::clone(&ctx.sync);
        let cache = Arc::clone(&session.chunk_cache);
        let metadata =
            tokio::task::spawn_blocking(move || sync.diff_metadata(&cache, request.view_id))
                .await
                .context("diff metadata task panicked")??;

        Ok(PeerResponse::SyncDiffMetadata(metadata))
    }

    fn name(&self) -> &'static str {
        "SyncDiffMetadataHandler"
    }
}

struct SyncDiffChunkHandler;

#[async_trait]
impl RequestHandler for SyncDiffChunkHandler {
    fn opcode(&self) -> Opcode {
        Opcode::SyncDiffChunk
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::SyncDiffChunk(request) = request else {
            bail!("sync-diff-chunk handler received {:?}", request.opcode());
        };
        let response = ctx.sync.chunk(&session.chunk_cache, request.chunk_hash);
        Ok(PeerResponse::SyncDiffChunk(response))
    }

    fn name(&self) -> &'static str {
        "SyncDiffChunkHandler"
    }
}

struct SyncTransactionHandler;

#[async_trait]
impl RequestHandler for SyncTransactionHandler {
    fn opcode(&self) -> Opcode {
        Opcode::SyncTransaction
    }

    async fn handle(
        &self,
        ctx: &NodeContext,
        _session: &PeerSession,
        request: PeerRequest,
    ) -> anyhow::Result<PeerResponse> {
        let PeerRequest::SyncTransaction(request) = request else {
            bail!("sync-transaction handler received {:?}", request.opcode());
        };
        let response = ctx.sync.transactions(&request.ids);
        debug!(requested = request.ids.len(), found = response.transactions.len(), "answered transaction fetch");
        Ok(PeerResponse::SyncTransaction(response))
    }

    fn name(&self) -> &'static str {
        "SyncTransactionHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::config::NodeConfig;
    use crate::constants::CHUNK_CACHE_SIZE;
    use crate::ledger::Ledger;
    use crate::processor::ProcessorRegistry;
    use crate::protocol::{
        GossipRequest, QueryRequest, SyncTransactionRequest, SyncViewRequest,
    };
    use crate::store::AccountStore;
    use crate::transaction::Transaction;
    use crate::types::{AccountId, Tag};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    fn context() -> (TempDir, Arc<NodeContext>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AccountStore::open(&dir.path().join("ledger.redb")).unwrap());
        let registry = Arc::new(ProcessorRegistry::new().unwrap());
        let ledger = Arc::new(Ledger::new(store, registry));
        let ctx = NodeContext::from_parts(NodeConfig::default(), ledger);
        (dir, ctx)
    }

    fn session() -> PeerSession {
        PeerSession::new(PeerId([9u8; 32]), CHUNK_CACHE_SIZE)
    }

    fn signed_nop(ctx: &NodeContext, keys: &SigningKey) -> Transaction {
        let mut tx = Transaction::new(keys, Tag::Nop, Vec::new());
        ctx.ledger.attach_sender(keys, &mut tx).unwrap();
        tx
    }

    fn fund(ctx: &NodeContext, keys: &SigningKey) -> AccountId {
        let pk = AccountId(keys.verifying_key().to_bytes());
        ctx.ledger.store().save_account(0, &Account::new(pk)).unwrap();
        pk
    }

    #[tokio::test]
    async fn gossip_votes_yes_for_a_valid_transaction() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);
        fund(&ctx, &keys);

        let tx = signed_nop(&ctx, &keys);
        let response = registry
            .dispatch(&ctx, &session(), PeerRequest::Gossip(GossipRequest { tx }))
            .await
            .unwrap();
        assert_eq!(response, PeerResponse::Gossip(GossipResponse { vote: true }));
    }

    #[tokio::test]
    async fn paused_broadcaster_silences_gossip_and_query() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);
        fund(&ctx, &keys);
        ctx.broadcaster.pause();

        let tx = signed_nop(&ctx, &keys);
        let gossip = registry
            .dispatch(
                &ctx,
                &session(),
                PeerRequest::Gossip(GossipRequest { tx: tx.clone() }),
            )
            .await
            .unwrap();
        assert_eq!(gossip, PeerResponse::Gossip(GossipResponse::default()));

        let query = registry
            .dispatch(&ctx, &session(), PeerRequest::Query(QueryRequest { tx }))
            .await
            .unwrap();
        assert_eq!(query, PeerResponse::Query(QueryResponse::default()));
    }

    #[tokio::test]
    async fn query_prefers_an_accepted_transaction() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);
        fund(&ctx, &keys);

        let tx = signed_nop(&ctx, &keys);
        let response = registry
            .dispatch(&ctx, &session(), PeerRequest::Query(QueryRequest { tx: tx.clone() }))
            .await
            .unwrap();
        let PeerResponse::Query(query) = response else {
            panic!("wrong response variant");
        };
        assert_eq!(query.preferred, Some(tx));
    }

    #[tokio::test]
    async fn query_falls_back_to_the_root_for_previous_view_transactions() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);
        // Sender is never funded, so the Nop is rejected at apply time and
        // cannot become preferred itself.
        let mut tx = Transaction::new(&keys, Tag::Nop, Vec::new());
        tx.attach(
            &keys,
            0,
            ctx.ledger.view_id() - 1,
            vec![ctx.ledger.root().id],
            1,
        );

        let response = registry
            .dispatch(&ctx, &session(), PeerRequest::Query(QueryRequest { tx }))
            .await
            .unwrap();
        let PeerResponse::Query(query) = response else {
            panic!("wrong response variant");
        };
        assert_eq!(query.preferred, Some(ctx.ledger.root()));
    }

    #[tokio::test]
    async fn sync_view_adopts_a_newer_valid_root() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);

        let mut remote_root = Transaction::new(&keys, Tag::Nop, Vec::new());
        remote_root.attach(&keys, 0, ctx.ledger.view_id() + 5, Vec::new(), 1);

        let session = session();
        let response = registry
            .dispatch(
                &ctx,
                &session,
                PeerRequest::SyncView(SyncViewRequest {
                    root: remote_root.clone(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            response,
            PeerResponse::SyncView(SyncViewResponse {
                root: remote_root.clone()
            })
        );
        assert_eq!(
            ctx.syncer.resolver().preferred().map(|tx| tx.id),
            Some(remote_root.id)
        );
        assert_eq!(ctx.syncer.peer_root(&session.peer_id), Some(remote_root.id));
    }

    #[tokio::test]
    async fn sync_view_ignores_an_invalid_root_but_still_answers() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let keys = SigningKey::generate(&mut OsRng);

        let mut bogus = Transaction::new(&keys, Tag::Nop, Vec::new());
        bogus.attach(&keys, 0, ctx.ledger.view_id() + 5, Vec::new(), 1);
        bogus.nonce += 1; // break the id

        let session = session();
        let response = registry
            .dispatch(
                &ctx,
                &session,
                PeerRequest::SyncView(SyncViewRequest { root: bogus }),
            )
            .await
            .unwrap();

        assert_eq!(
            response,
            PeerResponse::SyncView(SyncViewResponse {
                root: ctx.ledger.root()
            })
        );
        assert!(ctx.syncer.resolver().preferred().is_none());
        assert_eq!(ctx.syncer.peer_root(&session.peer_id), None);
    }

    #[tokio::test]
    async fn sync_transaction_returns_known_bodies() {
        let (_dir, ctx) = context();
        let registry = HandlerRegistry::new();
        let root_id = ctx.ledger.root().id;

        let response = registry
            .dispatch(
                &ctx,
                &session(),
                PeerRequest::SyncTransaction(SyncTransactionRequest {
                    ids: vec![root_id, crate::types::TransactionId([3u8; 32])],
                }),
            )
            .await
            .unwrap();
        let PeerResponse::SyncTransaction(response) = response else {
            panic!("wrong response variant");
        };
        assert_eq!(response.transactions.len(), 1);
        assert_eq!(response.transactions[0].id, root_id);
    }
}
