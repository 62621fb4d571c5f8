//! The processor host: runs one guest `process` invocation per transaction.
//!
//! Every call gets a fresh `wasmtime::Store` (and therefore a fresh guest
//! instance and memory), a fuel budget, and memory/table limits. Nothing is
//! shared between calls, so a misbehaving guest can only fail its own
//! transaction.
//!
//! ## Host ABI
//!
//! Imports are registered under the `env` module:
//!
//! - `tx_tag() -> i32`
//! - `tx_sender(dst: i32)` — writes 32 bytes
//! - `tx_payload_len() -> i32`
//! - `tx_payload(dst: i32)` — writes the payload
//! - `state_load(account: i32, key: i32, key_len: i32) -> i32` — value
//!   length, or -1 for NotFound; the value is staged for `state_read`
//! - `state_read(dst: i32)` — writes the staged value
//! - `emit_delta(account: i32, key: i32, key_len: i32, value: i32, value_len: i32)`
//! - `emit_pending(ptr: i32, len: i32)` — canonical transaction encoding
//! - `abort(ptr: i32, len: i32)` — reject the transaction with a reason
//!
//! The guest must export `process` (no arguments) and its linear `memory`.
//! At registration time the host also calls the guest's `tag() -> i32`
//! metadata export to learn which transaction tag it serves.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;
use wasmtime::{
    Caller, Engine, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
};

use crate::constants::{
    MAX_WIRE_MESSAGE_SIZE, VM_FUEL_BUDGET, VM_PAGES, VM_PAGE_SIZE, VM_TABLE_SIZE,
};
use crate::error::{CodecError, ProcessorError, StoreError};
use crate::processor::{NullStateRead, StateRead};
use crate::transaction::Transaction;
use crate::types::AccountId;

/// A state change emitted by a guest: (account, key, new value).
///
/// The engine fills in the old value when it applies the delta to its
/// working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorDelta {
    pub account: AccountId,
    pub key: Vec<u8>,
    pub new_value: Vec<u8>,
}

/// Everything one guest run produced.
#[derive(Debug, Default)]
pub struct ProcessorOutput {
    pub deltas: Vec<ProcessorDelta>,
    pub pending: Vec<Transaction>,
}

/// Per-call host state handed to the guest through the ABI.
struct HostState {
    tag: u8,
    sender: [u8; 32],
    payload: Vec<u8>,
    view: Arc<dyn StateRead>,
    staged: Option<Vec<u8>>,
    deltas: Vec<ProcessorDelta>,
    pending: Vec<Transaction>,
    abort_reason: Option<String>,
    host_error: Option<StoreError>,
    invalid_pending: Option<CodecError>,
    limits: StoreLimits,
}

impl HostState {
    fn for_transaction(tx: &Transaction, view: Arc<dyn StateRead>) -> Self {
        HostState {
            tag: tx.tag.as_u8(),
            sender: *tx.sender.as_bytes(),
            payload: tx.payload.clone(),
            view,
            staged: None,
            deltas: Vec::new(),
            pending: Vec::new(),
            abort_reason: None,
            host_error: None,
            invalid_pending: None,
            limits: vm_limits(),
        }
    }

    fn for_metadata() -> Self {
        HostState {
            tag: 0,
            sender: [0u8; 32],
            payload: Vec::new(),
            view: Arc::new(NullStateRead),
            staged: None,
            deltas: Vec::new(),
            pending: Vec::new(),
            abort_reason: None,
            host_error: None,
            invalid_pending: None,
            limits: vm_limits(),
        }
    }
}

fn vm_limits() -> StoreLimits {
    StoreLimitsBuilder::new()
        .memory_size((VM_PAGES * VM_PAGE_SIZE) as usize)
        .table_elements(VM_TABLE_SIZE as _)
        .instances(1)
        .build()
}

/// One registered guest processor.
pub struct Processor {
    name: String,
    tag: u8,
    engine: Engine,
    module: Module,
    linker: Linker<HostState>,
}

impl Processor {
    /// Compile and validate a guest module.
    ///
    /// The module must export `process`; its tag comes from `declared_tag`
    /// or, when absent, from calling the guest's `tag` metadata export.
    pub(crate) fn load(
        engine: &Engine,
        name: &str,
        bytes: &[u8],
        declared_tag: Option<u8>,
    ) -> Result<Self, ProcessorError> {
        let module = Module::new(engine, bytes).map_err(|err| ProcessorError::InvalidModule {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })?;

        if module.get_export("process").is_none() {
            return Err(ProcessorError::MissingExport {
                name: name.to_string(),
                export: "process",
            });
        }

        let mut linker = Linker::new(engine);
        register_host_functions(&mut linker).map_err(|err| ProcessorError::InvalidModule {
            name: name.to_string(),
            reason: format!("{err:#}"),
        })?;

        let processor = Processor {
            name: name.to_string(),
            tag: 0,
            engine: engine.clone(),
            module,
            linker,
        };

        let tag = match declared_tag {
            Some(tag) => tag,
            None => processor.read_guest_tag()?,
        };

        Ok(Processor { tag, ..processor })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Run the guest against one transaction.
    pub fn run(
        &self,
        tx: &Transaction,
        view: Arc<dyn StateRead>,
    ) -> Result<ProcessorOutput, ProcessorError> {
        let mut store = self.new_store(HostState::for_transaction(tx, view))?;

        let instance = match self.linker.instantiate(&mut store, &self.module) {
            Ok(instance) => instance,
            Err(err) => return Err(self.classify(err, store.data_mut())),
        };

        let process = instance
            .get_typed_func::<(), ()>(&mut store, "process")
            .map_err(|_| ProcessorError::MissingExport {
                name: self.name.clone(),
                export: "process",
            })?;

        match process.call(&mut store, ()) {
            Ok(()) => {
                let state = store.data_mut();
                let output = ProcessorOutput {
                    deltas: std::mem::take(&mut state.deltas),
                    pending: std::mem::take(&mut state.pending),
                };
                debug!(
                    processor = %self.name,
                    deltas = output.deltas.len(),
                    pending = output.pending.len(),
                    "processor run complete"
                );
                Ok(output)
            }
            Err(err) => Err(self.classify(err, store.data_mut())),
        }
    }

    fn new_store(&self, state: HostState) -> Result<Store<HostState>, ProcessorError> {
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(VM_FUEL_BUDGET)
            .map_err(|err| ProcessorError::InvalidModule {
                name: self.name.clone(),
                reason: format!("{err:#}"),
            })?;
        Ok(store)
    }

    fn read_guest_tag(&self) -> Result<u8, ProcessorError> {
        let mut store = self.new_store(HostState::for_metadata())?;
        let instance = match self.linker.instantiate(&mut store, &self.module) {
            Ok(instance) => instance,
            Err(err) => return Err(self.classify(err, store.data_mut())),
        };
        let tag_fn = instance
            .get_typed_func::<(), i32>(&mut store, "tag")
            .map_err(|_| ProcessorError::MissingExport {
                name: self.name.clone(),
                export: "tag",
            })?;
        let tag = match tag_fn.call(&mut store, ()) {
            Ok(tag) => tag,
            Err(err) => return Err(self.classify(err, store.data_mut())),
        };
        u8::try_from(tag).map_err(|_| ProcessorError::InvalidModule {
            name: self.name.clone(),
            reason: format!("guest declared out-of-range tag {tag}"),
        })
    }

    /// Map a guest failure to its taxonomy class, draining any reason the
    /// host functions recorded before trapping.
    fn classify(&self, err: anyhow::Error, state: &mut HostState) -> ProcessorError {
        if let Some(reason) = state.abort_reason.take() {
            return ProcessorError::Aborted {
                name: self.name.clone(),
                reason,
            };
        }
        if let Some(source) = state.invalid_pending.take() {
            return ProcessorError::InvalidPending {
                name: self.name.clone(),
                source,
            };
        }
        if let Some(source) = state.host_error.take() {
            return ProcessorError::Host {
                name: self.name.clone(),
                source,
            };
        }
        if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
            return ProcessorError::Exhausted {
                name: self.name.clone(),
            };
        }
        ProcessorError::Trap {
            name: self.name.clone(),
            reason: format!("{err:#}"),
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("guest does not export linear memory"))
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: usize) -> anyhow::Result<Vec<u8>> {
    if len > MAX_WIRE_MESSAGE_SIZE {
        return Err(anyhow!("guest read of {len} bytes exceeds limit"));
    }
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len];
    memory.read(&mut *caller, ptr as u32 as usize, &mut buf)?;
    Ok(buf)
}

fn write_guest(caller: &mut Caller<'_, HostState>, ptr: i32, data: &[u8]) -> anyhow::Result<()> {
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as u32 as usize, data)?;
    Ok(())
}

fn read_account_id(caller: &mut Caller<'_, HostState>, ptr: i32) -> anyhow::Result<AccountId> {
    let bytes = read_guest(caller, ptr, 32)?;
    Ok(AccountId(bytes.try_into().expect("32 bytes")))
}

fn register_host_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap("env", "tx_tag", |caller: Caller<'_, HostState>| -> i32 {
        caller.data().tag as i32
    })?;

    linker.func_wrap(
        "env",
        "tx_sender",
        |mut caller: Caller<'_, HostState>, dst: i32| -> anyhow::Result<()> {
            let sender = caller.data().sender;
            write_guest(&mut caller, dst, &sender)
        },
    )?;

    linker.func_wrap(
        "env",
        "tx_payload_len",
        |caller: Caller<'_, HostState>| -> i32 { caller.data().payload.len() as i32 },
    )?;

    linker.func_wrap(
        "env",
        "tx_payload",
        |mut caller: Caller<'_, HostState>, dst: i32| -> anyhow::Result<()> {
            let payload = caller.data().payload.clone();
            write_guest(&mut caller, dst, &payload)
        },
    )?;

    linker.func_wrap(
        "env",
        "state_load",
        |mut caller: Caller<'_, HostState>,
         account: i32,
         key: i32,
         key_len: i32|
         -> anyhow::Result<i32> {
            let account = read_account_id(&mut caller, account)?;
            let key = read_guest(&mut caller, key, key_len as u32 as usize)?;
            let view = Arc::clone(&caller.data().view);
            match view.load(&account, &key) {
                Ok(Some(value)) => {
                    let len = value.len() as i32;
                    caller.data_mut().staged = Some(value);
                    Ok(len)
                }
                Ok(None) => Ok(-1),
                Err(err) => {
                    caller.data_mut().host_error = Some(err);
                    Err(anyhow!("state_load failed against the store"))
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "state_read",
        |mut caller: Caller<'_, HostState>, dst: i32| -> anyhow::Result<()> {
            let staged = caller
                .data_mut()
                .staged
                .take()
                .ok_or_else(|| anyhow!("state_read without a prior state_load"))?;
            write_guest(&mut caller, dst, &staged)
        },
    )?;

    linker.func_wrap(
        "env",
        "emit_delta",
        |mut caller: Caller<'_, HostState>,
         account: i32,
         key: i32,
         key_len: i32,
         value: i32,
         value_len: i32|
         -> anyhow::Result<()> {
            let account = read_account_id(&mut caller, account)?;
            let key = read_guest(&mut caller, key, key_len as u32 as usize)?;
            let new_value = read_guest(&mut caller, value, value_len as u32 as usize)?;
            caller.data_mut().deltas.push(ProcessorDelta {
                account,
                key,
                new_value,
            });
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "emit_pending",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_guest(&mut caller, ptr, len as u32 as usize)?;
            match Transaction::decode(&bytes) {
                Ok(tx) => {
                    caller.data_mut().pending.push(tx);
                    Ok(())
                }
                Err(err) => {
                    caller.data_mut().invalid_pending = Some(err);
                    Err(anyhow!("emit_pending with undecodable transaction"))
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "abort",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let reason_bytes = read_guest(&mut caller, ptr, len as u32 as usize)?;
            let reason = String::from_utf8_lossy(&reason_bytes).into_owned();
            caller.data_mut().abort_reason = Some(reason);
            Err(anyhow!("processor abort"))
        },
    )?;

    Ok(())
}
