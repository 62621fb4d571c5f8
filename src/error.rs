//! Error types for the ledger execution core.
//!
//! Each subsystem gets its own explicit error enum so callers can match on
//! the failure class: decoding errors are never retried, validation errors
//! are surfaced to the submitter, processor errors fail the transaction
//! without committing state, and store errors propagate up (node-fatal when
//! detected on write).

use thiserror::Error;

/// Errors from the canonical byte codecs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the field could be read.
    #[error("unexpected end of input reading {field}")]
    UnexpectedEof {
        /// Name of the field being decoded.
        field: &'static str,
    },

    /// A varint ran past its maximum width.
    #[error("varint overflow reading {field}")]
    VarintOverflow { field: &'static str },

    /// A length prefix exceeded the permitted bound.
    #[error("length {len} for {field} exceeds limit {limit}")]
    LengthOutOfBounds {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    /// Trailing bytes remained after a complete decode.
    #[error("{len} trailing bytes after decode")]
    TrailingBytes { len: usize },

    /// A tag byte did not name a known transaction tag.
    #[error("unknown transaction tag {tag}")]
    UnknownTag { tag: u8 },

    /// A hex string failed to parse into an id.
    #[error("invalid hex for {field}")]
    InvalidHex { field: &'static str },
}

/// Errors from the account store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist. Distinct so callers can synthesize accounts.
    #[error("key not found")]
    NotFound,

    /// A persisted record failed to decode.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] CodecError),

    #[error(transparent)]
    Database(#[from] redb::DatabaseError),

    #[error(transparent)]
    Transaction(#[from] redb::TransactionError),

    #[error(transparent)]
    Table(#[from] redb::TableError),

    #[error(transparent)]
    Storage(#[from] redb::StorageError),

    #[error(transparent)]
    Commit(#[from] redb::CommitError),
}

/// Errors from running a guest transaction processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The guest called `abort` to reject the transaction.
    #[error("processor '{name}' aborted: {reason}")]
    Aborted { name: String, reason: String },

    /// The guest exceeded its fuel budget.
    #[error("processor '{name}' exhausted its step budget")]
    Exhausted { name: String },

    /// The guest trapped (out-of-bounds access, unreachable, ...).
    #[error("processor '{name}' trapped: {reason}")]
    Trap { name: String, reason: String },

    /// The module does not export the required entrypoint.
    #[error("module '{name}' missing required export '{export}'")]
    MissingExport { name: String, export: &'static str },

    /// The module failed to compile or instantiate.
    #[error("failed to load module '{name}': {reason}")]
    InvalidModule { name: String, reason: String },

    /// A directory scan registered no modules at all.
    #[error("no guest modules were registered from {path}")]
    EmptyDirectory { path: String },

    /// A second processor claimed an already-registered tag.
    #[error("tag {tag} already registered by '{existing}'")]
    DuplicateTag { tag: u8, existing: String },

    /// A second processor claimed an already-registered name.
    #[error("processor '{name}' already registered")]
    DuplicateName { name: String },

    /// A pending transaction emitted by the guest failed to decode.
    #[error("processor '{name}' emitted an undecodable pending transaction: {source}")]
    InvalidPending {
        name: String,
        #[source]
        source: CodecError,
    },

    /// A host call failed against the backing store.
    #[error("host call failed in '{name}': {source}")]
    Host {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Errors from applying a transaction through the execution engine.
///
/// All variants are fatal to the current apply; nothing is committed.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The sender account does not exist and the transaction cannot create it.
    #[error("sender account {sender} does not exist")]
    SenderUnknown { sender: String },

    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reasons the ledger rejects a transaction before it reaches the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The id field does not match the hash of the canonical encoding.
    #[error("transaction id does not match its contents")]
    IdMismatch,

    /// The sender signature failed verification.
    #[error("invalid sender signature")]
    InvalidSenderSignature,

    /// The creator signature failed verification.
    #[error("invalid creator signature")]
    InvalidCreatorSignature,

    /// No registered processor serves this tag.
    #[error("no processor registered for tag {tag}")]
    UnknownTag { tag: u8 },

    /// The nonce is not the sender's expected next nonce.
    #[error("nonce mismatch for sender {sender}: expected {expected}, got {got}")]
    NonceMismatch {
        sender: String,
        expected: u64,
        got: u64,
    },

    /// The sender account does not exist and the nonce is not zero.
    #[error("unknown sender {sender} with nonzero nonce {nonce}")]
    UnknownSender { sender: String, nonce: u64 },

    /// A referenced parent is not in the graph.
    #[error("parent {parent} not found")]
    MissingParent { parent: String },

    /// A parent is too far below the graph tip to be eligible.
    #[error("parent depth {parent_depth} too far below graph depth {graph_depth}")]
    ParentTooDeep {
        parent_depth: u64,
        graph_depth: u64,
    },

    /// The transaction names no parents but the graph is past bootstrap.
    #[error("transaction has no parents")]
    NoParents,

    /// The transaction was already received.
    #[error("transaction already received")]
    AlreadyReceived,
}

/// Top-level ledger errors surfaced to external callers.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
