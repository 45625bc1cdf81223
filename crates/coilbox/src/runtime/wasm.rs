use tracing::{debug, instrument};
use wasmtime::{Engine, Linker, Memory, Store, Trap, TypedFunc};
use wasmtime_wasi::I32Exit;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::artifact::CompiledArtifact;
use crate::runtime::asyncify::{self, Asyncify, AsyncifyState, SuspendState};
use crate::runtime::{
    ENTRY_POINT, GuestSession, InvokeOutcome, MEMORY_EXPORT, ResumeToken, RuntimeFault,
    SessionLimiter,
};
use crate::sandbox::{LinkerExtension, SandboxError, SessionClock, VirtualRoot};
use crate::types::{LimitExceeded, ResourceLimits};

/// Host state carried by each store.
///
/// Host functions added with [`SandboxBuilder::linker`] see it as their
/// `Caller` data.
///
/// [`SandboxBuilder::linker`]: crate::sandbox::SandboxBuilder::linker
pub struct GuestState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limiter: SessionLimiter,
    pub(crate) suspend: SuspendState,
    pub(crate) clock: SessionClock,
}

/// A wasmtime store and instance running one guest.
///
/// Owns the scratch filesystem backing the guest's `/`; it is removed after
/// the store is dropped.
pub struct WasmSession {
    store: Store<GuestState>,
    entry: TypedFunc<(), ()>,
    memory: Memory,
    async_capable: bool,
    // Declared after `store` so open guest handles close first
    root: VirtualRoot,
}

impl WasmSession {
    #[instrument(skip_all, fields(fuel = limits.effective_fuel()))]
    pub(crate) fn new(
        engine: &Engine,
        artifact: &CompiledArtifact,
        wasi: WasiP1Ctx,
        root: VirtualRoot,
        limits: &ResourceLimits,
        clock: SessionClock,
        extensions: &[LinkerExtension],
    ) -> Result<Self, SandboxError> {
        let state = GuestState {
            wasi,
            limiter: SessionLimiter::new(limits),
            suspend: SuspendState::default(),
            clock,
        };
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limiter);
        store
            .set_fuel(limits.effective_fuel())
            .map_err(SandboxError::FuelUnavailable)?;

        let mut linker = Linker::new(engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| {
            &mut state.wasi
        })
        .map_err(SandboxError::Link)?;
        asyncify::add_suspend_points(&mut linker).map_err(SandboxError::Link)?;
        for extension in extensions {
            extension.apply(&mut linker).map_err(SandboxError::Link)?;
        }

        let instance = linker
            .instantiate(&mut store, artifact.module())
            .map_err(SandboxError::Instantiate)?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|_| SandboxError::MissingExport(ENTRY_POINT))?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or(SandboxError::MissingExport(MEMORY_EXPORT))?;

        let asyncify = Asyncify::from_instance(&instance, &mut store);
        let async_capable = asyncify.is_some();
        store.data_mut().suspend = SuspendState::new(asyncify, memory);

        debug!(
            async_capable,
            memory_bytes = memory.data_size(&store),
            root = ?root.path(),
            "instantiated guest"
        );
        Ok(Self {
            store,
            entry,
            memory,
            async_capable,
            root,
        })
    }

    /// Scratch filesystem backing the guest's `/`
    pub fn root(&self) -> &VirtualRoot {
        &self.root
    }

    fn asyncify(&self) -> Result<Asyncify, RuntimeFault> {
        self.store
            .data()
            .suspend
            .asyncify
            .clone()
            .ok_or_else(|| RuntimeFault::Protocol("guest is not async capable".to_string()))
    }
}

/// Map an error escaping the guest to a fault
fn fault(error: wasmtime::Error) -> RuntimeFault {
    if let Some(Trap::OutOfFuel) = error.downcast_ref::<Trap>() {
        return RuntimeFault::ResourceExhausted(LimitExceeded::Fuel);
    }
    if let Some(limit) = error.downcast_ref::<LimitExceeded>() {
        return RuntimeFault::ResourceExhausted(*limit);
    }
    RuntimeFault::Trap(format!("{error:#}"))
}

impl GuestSession for WasmSession {
    fn is_async_capable(&self) -> bool {
        self.async_capable
    }

    fn invoke_entry_point(&mut self) -> Result<InvokeOutcome, RuntimeFault> {
        if let Err(error) = self.entry.call(&mut self.store, ()) {
            if let Some(exit) = error.downcast_ref::<I32Exit>() {
                return Ok(InvokeOutcome::Exited(exit.0));
            }
            return Err(fault(error));
        }

        if !self.async_capable {
            return Ok(InvokeOutcome::Returned);
        }
        let asyncify = self.asyncify()?;
        match asyncify.state(&mut self.store).map_err(fault)? {
            AsyncifyState::Normal => Ok(InvokeOutcome::Returned),
            AsyncifyState::Unwinding => {
                let reason = self.store.data_mut().suspend.pending.take().ok_or_else(|| {
                    RuntimeFault::Protocol("guest unwound outside a suspend point".to_string())
                })?;
                Ok(InvokeOutcome::Suspended(reason))
            }
            AsyncifyState::Rewinding => Err(RuntimeFault::Protocol(
                "entry point returned before the rewind completed".to_string(),
            )),
        }
    }

    fn capture_execution_point(&mut self) -> Result<ResumeToken, RuntimeFault> {
        let asyncify = self.asyncify()?;
        asyncify.stop_unwind(&mut self.store).map_err(fault)?;
        let buffer = self.store.data().suspend.buffer.ok_or_else(|| {
            RuntimeFault::Protocol("no unwind buffer to capture".to_string())
        })?;
        Ok(ResumeToken::new(u64::from(buffer)))
    }

    fn restore_execution_point(&mut self, token: ResumeToken) -> Result<(), RuntimeFault> {
        let asyncify = self.asyncify()?;
        let buffer = u32::try_from(token.slot())
            .ok()
            .filter(|slot| Some(*slot) == self.store.data().suspend.buffer)
            .ok_or_else(|| {
                RuntimeFault::Protocol(format!("resume token {} is not from this session", token.slot()))
            })?;
        asyncify.start_rewind(&mut self.store, buffer).map_err(fault)
    }

    fn memory_bytes(&self) -> u64 {
        self.memory.data_size(&self.store) as u64
    }

    fn fuel(&self) -> u64 {
        // Fuel is always enabled on engines built by `new_engine`
        self.store.get_fuel().unwrap_or(0)
    }

    fn set_fuel(&mut self, fuel: u64) -> Result<(), RuntimeFault> {
        self.store.set_fuel(fuel).map_err(fault)
    }
}

impl std::fmt::Debug for WasmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmSession")
            .field("async_capable", &self.async_capable)
            .field("memory_bytes", &self.memory_bytes())
            .field("fuel", &self.fuel())
            .field("root", &self.root.path())
            .finish()
    }
}
