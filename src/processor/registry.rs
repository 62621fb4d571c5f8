//! The processor registry.
//!
//! Loads guest modules at startup and indexes them by service name and by
//! transaction tag. Registration is final for the process lifetime: the
//! registry is built mutably during startup and then shared immutably, so
//! the execution engine reads it without locks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine};

use crate::error::ProcessorError;
use crate::processor::Processor;
use crate::types::Tag;

/// Registry of loaded guest processors, in registration order.
pub struct ProcessorRegistry {
    engine: Engine,
    processors: Vec<Arc<Processor>>,
    by_name: HashMap<String, usize>,
    by_tag: HashMap<u8, usize>,
}

impl ProcessorRegistry {
    /// Build an empty registry with a fuel-metered wasmtime engine.
    pub fn new() -> Result<Self, ProcessorError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|err| ProcessorError::InvalidModule {
            name: "<engine>".to_string(),
            reason: format!("{err:#}"),
        })?;
        Ok(ProcessorRegistry {
            engine,
            processors: Vec::new(),
            by_name: HashMap::new(),
            by_tag: HashMap::new(),
        })
    }

    /// Register every `*.wasm` module in `dir`; the file stem is the
    /// service name and the guest's `tag` export declares its tag.
    ///
    /// Modules register in filename order so every node derives the same
    /// processor ordering from the same directory.
    pub fn register_directory(&mut self, dir: &Path) -> Result<usize, ProcessorError> {
        let entries = std::fs::read_dir(dir).map_err(|err| ProcessorError::InvalidModule {
            name: dir.display().to_string(),
            reason: err.to_string(),
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "wasm"))
            .collect();
        paths.sort();

        let mut registered = 0usize;
        for path in paths {
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|err| ProcessorError::InvalidModule {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
            self.register_module(name, &bytes, None)?;
            registered += 1;
        }

        if registered == 0 {
            return Err(ProcessorError::EmptyDirectory {
                path: dir.display().to_string(),
            });
        }
        Ok(registered)
    }

    /// Register one guest module. `declared_tag` overrides the guest's
    /// `tag` metadata export (used for embedded modules in tests).
    pub fn register_module(
        &mut self,
        name: &str,
        bytes: &[u8],
        declared_tag: Option<u8>,
    ) -> Result<(), ProcessorError> {
        if self.by_name.contains_key(name) {
            return Err(ProcessorError::DuplicateName {
                name: name.to_string(),
            });
        }

        let processor = Processor::load(&self.engine, name, bytes, declared_tag)?;
        let tag = processor.tag();
        if let Some(&existing) = self.by_tag.get(&tag) {
            return Err(ProcessorError::DuplicateTag {
                tag,
                existing: self.processors[existing].name().to_string(),
            });
        }

        info!(module = name, tag, "registered transaction processor service");
        let index = self.processors.len();
        self.by_name.insert(name.to_string(), index);
        self.by_tag.insert(tag, index);
        self.processors.push(Arc::new(processor));
        Ok(())
    }

    /// Whether some processor (or the engine natively, for Nop) serves `tag`.
    pub fn supports_tag(&self, tag: Tag) -> bool {
        tag == Tag::Nop || self.by_tag.contains_key(&tag.as_u8())
    }

    /// Registered processors in registration order.
    pub fn processors(&self) -> &[Arc<Processor>] {
        &self.processors
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Processor>> {
        self.by_name.get(name).map(|&index| &self.processors[index])
    }

    pub fn get_by_tag(&self, tag: u8) -> Option<&Arc<Processor>> {
        self.by_tag.get(&tag).map(|&index| &self.processors[index])
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
