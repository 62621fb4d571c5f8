//! Node wiring.
//!
//! One explicit context struct owns the services the protocol handlers
//! need; handler constructors take it directly instead of fishing
//! singletons out of a string-keyed node map.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::broadcaster::Broadcaster;
use crate::config::NodeConfig;
use crate::ledger::Ledger;
use crate::processor::ProcessorRegistry;
use crate::store::AccountStore;
use crate::sync::{SyncService, Syncer};

/// Everything a protocol handler can reach.
pub struct NodeContext {
    pub config: NodeConfig,
    pub ledger: Arc<Ledger>,
    pub sync: Arc<SyncService>,
    pub syncer: Arc<Syncer>,
    pub broadcaster: Arc<Broadcaster>,
}

impl NodeContext {
    /// Open the store, load the guest processors, and wire up the services.
    pub fn start(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

        let store = Arc::new(
            AccountStore::open(&config.data_dir.join("ledger.redb"))
                .context("failed to open account store")?,
        );

        let mut registry = ProcessorRegistry::new()?;
        let registered = registry
            .register_directory(&config.processor_dir)
            .with_context(|| {
                format!(
                    "failed to register processors from {}",
                    config.processor_dir.display()
                )
            })?;
        info!(processors = registered, "loaded guest processors");

        let ledger = Arc::new(Ledger::new(store, Arc::new(registry)));
        Ok(Self::from_parts(config, ledger))
    }

    /// Wire a context around an existing ledger (embedders and tests).
    pub fn from_parts(config: NodeConfig, ledger: Arc<Ledger>) -> Arc<Self> {
        let sync = Arc::new(
            SyncService::new(Arc::clone(&ledger)).with_chunk_size(config.chunk_size),
        );
        Arc::new(NodeContext {
            config,
            ledger,
            sync,
            syncer: Arc::new(Syncer::new()),
            broadcaster: Arc::new(Broadcaster::new()),
        })
    }
}
