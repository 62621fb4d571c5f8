//! Sandboxed transaction processors.
//!
//! Transaction logic is externalized to guest WebAssembly modules. The
//! registry loads and indexes them at startup; the host runs one guest
//! `process` invocation per transaction on a fresh instance with a fuel
//! budget and fixed memory limits.

mod host;
mod registry;

pub use host::{Processor, ProcessorDelta, ProcessorOutput};
pub use registry::ProcessorRegistry;

use crate::error::StoreError;
use crate::types::AccountId;

/// Read access to account state for a running guest.
///
/// The execution engine implements this over its working overlay plus the
/// committed store, so a guest observes every account the current apply has
/// already touched.
pub trait StateRead: Send + Sync {
    /// Look up `key` in `account`'s state. `Ok(None)` is NotFound.
    fn load(&self, account: &AccountId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
}

/// A view with no accounts at all; used for metadata-only guest calls.
pub(crate) struct NullStateRead;

impl StateRead for NullStateRead {
    fn load(&self, _account: &AccountId, _key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }
}
