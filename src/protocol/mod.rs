//! The peer wire protocol.
//!
//! Six request/response conversations multiplex over one peer connection:
//! gossip, finality query, sync-view, sync-diff metadata, sync-diff chunks,
//! and sync-transaction. Each message is a tagged record with a stable
//! opcode; the underlying framing layer (QUIC, TCP, in-memory for tests) is
//! external and only needs to move encoded frames per peer.
//!
//! Frames are postcard-encoded and bounded by
//! [`MAX_WIRE_MESSAGE_SIZE`](crate::constants::MAX_WIRE_MESSAGE_SIZE).

pub mod dispatcher;
pub mod handlers;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_WIRE_MESSAGE_SIZE;
use crate::transaction::Transaction;
use crate::types::{ChunkHash, TransactionId};

/// Push a new transaction; receive a yes/no acceptance vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRequest {
    pub tx: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipResponse {
    pub vote: bool,
}

/// Ask the peer its preferred tip for a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub tx: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub preferred: Option<Transaction>,
}

/// Exchange current roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncViewRequest {
    pub root: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncViewResponse {
    pub root: Transaction,
}

/// Announce available diff chunks since a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDiffMetadataRequest {
    pub view_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDiffMetadataResponse {
    pub latest_view_id: u64,
    pub chunk_hashes: Vec<ChunkHash>,
}

/// Fetch one chunk by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDiffChunkRequest {
    pub chunk_hash: ChunkHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDiffChunkResponse {
    pub found: bool,
    pub diff: Vec<u8>,
}

/// Fetch missing transaction bodies by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTransactionRequest {
    pub ids: Vec<TransactionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTransactionResponse {
    pub transactions: Vec<Transaction>,
}

/// Stable request opcodes, one per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Gossip,
    Query,
    SyncView,
    SyncDiffMetadata,
    SyncDiffChunk,
    SyncTransaction,
}

/// Any request a peer can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Gossip(GossipRequest),
    Query(QueryRequest),
    SyncView(SyncViewRequest),
    SyncDiffMetadata(SyncDiffMetadataRequest),
    SyncDiffChunk(SyncDiffChunkRequest),
    SyncTransaction(SyncTransactionRequest),
}

/// Any response a peer can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Gossip(GossipResponse),
    Query(QueryResponse),
    SyncView(SyncViewResponse),
    SyncDiffMetadata(SyncDiffMetadataResponse),
    SyncDiffChunk(SyncDiffChunkResponse),
    SyncTransaction(SyncTransactionResponse),
}

impl PeerRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            PeerRequest::Gossip(_) => Opcode::Gossip,
            PeerRequest::Query(_) => Opcode::Query,
            PeerRequest::SyncView(_) => Opcode::SyncView,
            PeerRequest::SyncDiffMetadata(_) => Opcode::SyncDiffMetadata,
            PeerRequest::SyncDiffChunk(_) => Opcode::SyncDiffChunk,
            PeerRequest::SyncTransaction(_) => Opcode::SyncTransaction,
        }
    }
}

impl PeerResponse {
    pub fn opcode(&self) -> Opcode {
        match self {
            PeerResponse::Gossip(_) => Opcode::Gossip,
            PeerResponse::Query(_) => Opcode::Query,
            PeerResponse::SyncView(_) => Opcode::SyncView,
            PeerResponse::SyncDiffMetadata(_) => Opcode::SyncDiffMetadata,
            PeerResponse::SyncDiffChunk(_) => Opcode::SyncDiffChunk,
            PeerResponse::SyncTransaction(_) => Opcode::SyncTransaction,
        }
    }
}

/// Encode a wire frame, enforcing the message size bound.
pub fn encode_frame<T: Serialize>(message: &T) -> anyhow::Result<Vec<u8>> {
    let bytes = postcard::to_stdvec(message).context("failed to serialize wire frame")?;
    if bytes.len() > MAX_WIRE_MESSAGE_SIZE {
        anyhow::bail!(
            "wire frame of {} bytes exceeds limit {}",
            bytes.len(),
            MAX_WIRE_MESSAGE_SIZE
        );
    }
    Ok(bytes)
}

/// Decode a wire frame, enforcing the message size bound.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    if bytes.len() > MAX_WIRE_MESSAGE_SIZE {
        anyhow::bail!(
            "wire frame of {} bytes exceeds limit {}",
            bytes.len(),
            MAX_WIRE_MESSAGE_SIZE
        );
    }
    postcard::from_bytes(bytes).context("failed to deserialize wire frame")
}

/// Client seam for talking to one peer: send a request, await its response.
///
/// The consensus layer's per-query timeout wraps calls to this; an expired
/// query counts as a non-vote.
#[async_trait]
pub trait PeerQuery: Send + Sync {
    async fn request(&self, request: PeerRequest) -> anyhow::Result<PeerResponse>;
}
