//! Protocol tuning constants.
//!
//! These are read-only process configuration. Several of them participate in
//! wire or storage encodings, so changing them is a protocol-breaking change.

/// Bucket prefix under which account records are persisted.
///
/// Store keys are `ACCOUNT_KEY_PREFIX || public_key` (8 + 32 bytes).
pub const ACCOUNT_KEY_PREFIX: &[u8] = b"account_";

/// Size of one state-diff chunk served during sync.
pub const CHUNK_SIZE: usize = 1_048_576;

/// Capacity of the per-peer chunk cache.
///
/// The cache only rate-limits repeat diff work; correctness never depends on
/// residency. A miss answers `found = false` and the requester restarts.
pub const CHUNK_CACHE_SIZE: usize = 1024;

/// Linear memory pages granted to a guest processor (64 KiB each).
pub const VM_PAGES: u64 = 128;

/// Bytes per WebAssembly linear memory page.
pub const VM_PAGE_SIZE: u64 = 65_536;

/// Maximum table elements granted to a guest processor.
pub const VM_TABLE_SIZE: u32 = 65_536;

/// Fuel budget for a single guest `process` invocation.
///
/// Exhaustion surfaces as `ProcessorError::Exhausted`; a guest can never
/// stall the execution engine.
pub const VM_FUEL_BUDGET: u64 = 10_000_000;

/// Timeout for querying a transaction to peers. Expiry counts as a non-vote.
pub const QUERY_TIMEOUT_MS: u64 = 10_000;

/// Max graph depth difference when searching for eligible transaction parents.
pub const MAX_ELIGIBLE_PARENTS_DEPTH_DIFF: u64 = 5;

/// Minimum difficulty (leading zero bits of the id) of a critical transaction.
pub const MINIMUM_DIFFICULTY: u32 = 7;

/// Number of ancestors a median timestamp is derived from.
pub const MEDIAN_TIMESTAMP_NUM_ANCESTORS: usize = 10;

/// Maximum size of a single peer wire message.
///
/// Bounded so a malicious peer cannot exhaust memory; one chunk plus
/// envelope headroom.
pub const MAX_WIRE_MESSAGE_SIZE: usize = CHUNK_SIZE + 4096;

/// Maximum requests in flight per peer connection before backpressure.
pub const MAX_INFLIGHT_REQUESTS_PER_PEER: usize = 64;
