//! Alder: the ledger execution core of a DAG-based distributed ledger.
//!
//! The crate covers two tightly-coupled concerns:
//!
//! - **Transactional state mutation** — a transaction is dispatched through
//!   a registry of sandboxed WebAssembly processors, may recursively
//!   produce further transactions, mutates many accounts atomically, and
//!   leaves the ledger unchanged on failure ([`engine`], [`processor`],
//!   [`store`]).
//! - **Peer protocol dispatch** — one peer connection multiplexes gossip,
//!   finality queries, and state synchronization, each conversation with
//!   its own concurrency discipline and caching ([`protocol`], [`sync`],
//!   [`broadcaster`]).
//!
//! External collaborators — the HTTP API, the network framing layer, and
//! the consensus vote aggregation — talk to the core through [`Ledger`],
//! the typed peer channels in [`protocol::dispatcher`], and the
//! [`ledger::Resolver`] seam.

pub mod account;
pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hash;
pub mod ledger;
pub mod node;
pub mod processor;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod types;

pub use account::{Account, AccountState};
pub use broadcaster::{BroadcastOutcome, Broadcaster};
pub use config::NodeConfig;
pub use engine::{ApplyOutcome, Delta, ExecutionEngine};
pub use error::{
    ApplyError, CodecError, LedgerError, ProcessorError, StoreError, ValidationError,
};
pub use graph::TransactionGraph;
pub use ledger::{Ledger, RejectReason, Resolver, SingleResolver, Vote};
pub use node::NodeContext;
pub use processor::{Processor, ProcessorRegistry, StateRead};
pub use store::AccountStore;
pub use sync::{ChunkCache, SyncService, Syncer};
pub use transaction::Transaction;
pub use types::{AccountId, ChunkHash, PeerId, SignatureBytes, Tag, TransactionId};
