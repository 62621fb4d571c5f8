//! State synchronization.
//!
//! The serving side splits `dump_diff` output into fixed-size chunks,
//! hashes each with blake2b-256, parks them in the requesting peer's chunk
//! cache, and answers chunk fetches from that cache. The cache exists only
//! to rate-limit repeat diff work; a miss answers `found = false` and the
//! requester restarts the exchange.
//!
//! The requesting side ([`Syncer::fetch_diff`]) drives the metadata/chunk
//! conversation, verifies every chunk hash, reassembles the diff, and
//! installs it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::constants::{CHUNK_CACHE_SIZE, CHUNK_SIZE};
use crate::error::StoreError;
use crate::hash::blake2b256;
use crate::ledger::{Ledger, Resolver, SingleResolver};
use crate::protocol::{
    PeerQuery, PeerRequest, PeerResponse, SyncDiffChunkRequest, SyncDiffChunkResponse,
    SyncDiffMetadataRequest, SyncDiffMetadataResponse, SyncTransactionResponse,
};
use crate::types::{ChunkHash, PeerId, TransactionId};

/// How many times the requester restarts a diff exchange on a chunk miss
/// or hash mismatch before giving up.
const MAX_SYNC_ATTEMPTS: usize = 3;

/// A bounded per-peer chunk cache.
pub struct ChunkCache {
    inner: Mutex<LruCache<ChunkHash, Vec<u8>>>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is nonzero");
        ChunkCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn put(&self, hash: ChunkHash, bytes: Vec<u8>) {
        self.inner.lock().put(hash, bytes);
    }

    pub fn get(&self, hash: &ChunkHash) -> Option<Vec<u8>> {
        self.inner.lock().get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        ChunkCache::new(CHUNK_CACHE_SIZE)
    }
}

/// Serves diff metadata, chunks, and transaction bodies.
pub struct SyncService {
    ledger: Arc<Ledger>,
    chunk_size: usize,
}

impl SyncService {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        SyncService {
            ledger,
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Override the chunk size (smaller values are useful for debugging).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Build the diff since `view_id`, chunk it into `peer_cache`, and
    /// describe it.
    pub fn diff_metadata(
        &self,
        peer_cache: &ChunkCache,
        view_id: u64,
    ) -> Result<SyncDiffMetadataResponse, StoreError> {
        let diff = self.ledger.store().dump_diff(view_id)?;

        let mut chunk_hashes = Vec::new();
        for chunk in diff.chunks(self.chunk_size) {
            let hash = ChunkHash(blake2b256(chunk));
            peer_cache.put(hash, chunk.to_vec());
            chunk_hashes.push(hash);
        }

        debug!(
            since_view = view_id,
            diff_bytes = diff.len(),
            chunks = chunk_hashes.len(),
            "prepared sync diff metadata"
        );
        Ok(SyncDiffMetadataResponse {
            latest_view_id: self.ledger.view_id(),
            chunk_hashes,
        })
    }

    /// Answer a chunk fetch from the peer's cache.
    pub fn chunk(&self, peer_cache: &ChunkCache, hash: ChunkHash) -> SyncDiffChunkResponse {
        match peer_cache.get(&hash) {
            Some(diff) => {
                debug!(chunk = %hash, bytes = diff.len(), "served sync chunk");
                SyncDiffChunkResponse { found: true, diff }
            }
            None => {
                debug!(chunk = %hash, "sync chunk not cached");
                SyncDiffChunkResponse::default()
            }
        }
    }

    /// Answer a transaction-by-id fetch; unknown ids are skipped.
    pub fn transactions(&self, ids: &[TransactionId]) -> SyncTransactionResponse {
        let transactions = ids
            .iter()
            .filter_map(|id| self.ledger.find_transaction(id))
            .collect();
        SyncTransactionResponse { transactions }
    }
}

/// Client-side sync state: the root resolver and what each peer last
/// reported as its root.
pub struct Syncer {
    resolver: Arc<dyn Resolver>,
    peer_roots: RwLock<HashMap<PeerId, TransactionId>>,
}

impl Syncer {
    pub fn new() -> Self {
        Syncer {
            resolver: Arc::new(SingleResolver::default()),
            peer_roots: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Remember the root a peer reported, for future quorum decisions.
    pub fn record_root(&self, peer: PeerId, root: TransactionId) {
        self.peer_roots.write().insert(peer, root);
    }

    pub fn peer_root(&self, peer: &PeerId) -> Option<TransactionId> {
        self.peer_roots.read().get(peer).copied()
    }

    pub fn recorded_roots(&self) -> usize {
        self.peer_roots.read().len()
    }

    /// Fetch and install the peer's state diff since `since_view`.
    ///
    /// Restarts the whole exchange on a chunk miss or hash mismatch, up to
    /// [`MAX_SYNC_ATTEMPTS`] times. Returns the peer's latest view id.
    pub async fn fetch_diff(
        &self,
        ledger: Arc<Ledger>,
        peer: &dyn PeerQuery,
        since_view: u64,
    ) -> anyhow::Result<u64> {
        for attempt in 1..=MAX_SYNC_ATTEMPTS {
            let metadata = request_metadata(peer, since_view).await?;

            match fetch_chunks(peer, &metadata).await? {
                Some(diff) => {
                    let latest = metadata.latest_view_id;
                    let installed = {
                        let ledger = Arc::clone(&ledger);
                        tokio::task::spawn_blocking(move || {
                            ledger.store().apply_diff(latest, &diff)
                        })
                        .await
                        .context("diff install task failed")??
                    };
                    info!(
                        accounts = installed,
                        latest_view = latest,
                        "installed sync diff"
                    );
                    return Ok(latest);
                }
                None => {
                    warn!(attempt, "sync diff exchange invalidated, restarting");
                }
            }
        }
        bail!("sync diff exchange failed after {MAX_SYNC_ATTEMPTS} attempts")
    }
}

impl Default for Syncer {
    fn default() -> Self {
        Syncer::new()
    }
}

async fn request_metadata(
    peer: &dyn PeerQuery,
    since_view: u64,
) -> anyhow::Result<SyncDiffMetadataResponse> {
    let response = peer
        .request(PeerRequest::SyncDiffMetadata(SyncDiffMetadataRequest {
            view_id: since_view,
        }))
        .await?;
    match response {
        PeerResponse::SyncDiffMetadata(metadata) => Ok(metadata),
        other => bail!("unexpected response {:?} to diff metadata request", other.opcode()),
    }
}

/// Fetch and verify every chunk; `None` means the exchange must restart.
async fn fetch_chunks(
    peer: &dyn PeerQuery,
    metadata: &SyncDiffMetadataResponse,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut diff = Vec::new();
    for hash in &metadata.chunk_hashes {
        let response = peer
            .request(PeerRequest::SyncDiffChunk(SyncDiffChunkRequest {
                chunk_hash: *hash,
            }))
            .await?;
        let chunk = match response {
            PeerResponse::SyncDiffChunk(chunk) => chunk,
            other => bail!("unexpected response {:?} to chunk request", other.opcode()),
        };
        if !chunk.found {
            return Ok(None);
        }
        if ChunkHash(blake2b256(&chunk.diff)) != *hash {
            warn!(chunk = %hash, "chunk bytes did not match their hash");
            return Ok(None);
        }
        diff.extend_from_slice(&chunk.diff);
    }
    Ok(Some(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::processor::ProcessorRegistry;
    use crate::store::AccountStore;
    use crate::types::AccountId;
    use tempfile::TempDir;

    fn ledger_with_accounts(count: u8, view: u64) -> (TempDir, Arc<Ledger>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AccountStore::open(&dir.path().join("ledger.redb")).unwrap());
        for byte in 1..=count {
            let mut account = Account::new(AccountId([byte; 32]));
            account.nonce = byte as u64;
            account.state = account.state.store(b"balance", &[byte; 64]);
            store.save_account(view, &account).unwrap();
        }
        let registry = Arc::new(ProcessorRegistry::new().unwrap());
        (dir, Arc::new(Ledger::new(store, registry)))
    }

    #[test]
    fn metadata_chunks_cover_the_whole_diff() {
        let (_dir, ledger) = ledger_with_accounts(3, 2);
        let service = SyncService::new(Arc::clone(&ledger)).with_chunk_size(64);
        let cache = ChunkCache::new(CHUNK_CACHE_SIZE);

        let metadata = service.diff_metadata(&cache, 0).unwrap();
        assert!(metadata.chunk_hashes.len() > 1);
        assert_eq!(metadata.latest_view_id, ledger.view_id());

        let mut reassembled = Vec::new();
        for hash in &metadata.chunk_hashes {
            let chunk = service.chunk(&cache, *hash);
            assert!(chunk.found);
            assert_eq!(ChunkHash(blake2b256(&chunk.diff)), *hash);
            reassembled.extend_from_slice(&chunk.diff);
        }
        assert_eq!(reassembled, ledger.store().dump_diff(0).unwrap());
    }

    #[test]
    fn chunk_miss_answers_not_found() {
        let (_dir, ledger) = ledger_with_accounts(1, 1);
        let service = SyncService::new(ledger);
        let cache = ChunkCache::new(2);

        let response = service.chunk(&cache, ChunkHash([7u8; 32]));
        assert!(!response.found);
        assert!(response.diff.is_empty());
    }

    #[test]
    fn small_cache_evicts_early_chunks() {
        let (_dir, ledger) = ledger_with_accounts(4, 1);
        let service = SyncService::new(Arc::clone(&ledger)).with_chunk_size(32);
        let cache = ChunkCache::new(2);

        let metadata = service.diff_metadata(&cache, 0).unwrap();
        assert!(metadata.chunk_hashes.len() > 2);

        // Only the two most recent chunks survive in the LRU.
        let first = service.chunk(&cache, metadata.chunk_hashes[0]);
        assert!(!first.found);
        let last = service.chunk(&cache, *metadata.chunk_hashes.last().unwrap());
        assert!(last.found);
    }

    #[test]
    fn syncer_records_peer_roots() {
        let syncer = Syncer::new();
        let peer = PeerId([1u8; 32]);
        assert_eq!(syncer.peer_root(&peer), None);

        syncer.record_root(peer, TransactionId([2u8; 32]));
        assert_eq!(syncer.peer_root(&peer), Some(TransactionId([2u8; 32])));
        assert_eq!(syncer.recorded_roots(), 1);
    }

    #[test]
    fn unknown_transaction_ids_are_skipped() {
        let (_dir, ledger) = ledger_with_accounts(1, 1);
        let service = SyncService::new(Arc::clone(&ledger));
        let root_id = ledger.root().id;

        let response = service.transactions(&[root_id, TransactionId([9u8; 32])]);
        assert_eq!(response.transactions.len(), 1);
        assert_eq!(response.transactions[0].id, root_id);
    }
}
