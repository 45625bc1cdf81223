//! Suspend points speaking the asyncify unwind/rewind protocol
//!
//! Two WASI imports are shadowed by host shims: `sched_yield` and
//! `poll_oneoff`. When the guest reaches one in the normal state, the shim
//! starts an unwind into a buffer in guest memory and records why; the entry
//! point then returns to the host with the guest's stack saved. To resume,
//! the host starts a rewind and calls the entry point again. The guest
//! replays its way back into the same shim, which stops the rewind and
//! completes the operation as if it had blocked.

use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::trace;
use wasmtime::{AsContextMut, Caller, Instance, Linker, Memory, TypedFunc};

use crate::runtime::wasm::GuestState;
use crate::types::SuspendReason;

pub(crate) const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Size of the unwind buffer allocated in guest memory
pub(crate) const UNWIND_BUFFER_BYTES: u32 = 1024 * 1024;

const WASM_PAGE_BYTES: u64 = 65_536;
const UNWIND_HEADER_BYTES: u32 = 8;

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;

const SUBSCRIPTION_BYTES: usize = 48;
const EVENT_BYTES: usize = 32;

const EVENTTYPE_CLOCK: u8 = 0;
const EVENTTYPE_FD_READ: u8 = 1;
const EVENTTYPE_FD_WRITE: u8 = 2;
const SUBCLOCKFLAG_ABSTIME: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncifyState {
    Normal,
    Unwinding,
    Rewinding,
}

impl AsyncifyState {
    fn from_raw(raw: i32) -> wasmtime::Result<Self> {
        match raw {
            0 => Ok(AsyncifyState::Normal),
            1 => Ok(AsyncifyState::Unwinding),
            2 => Ok(AsyncifyState::Rewinding),
            other => bail!("unknown asyncify state {other}"),
        }
    }
}

/// Typed handles to an instance's asyncify exports
#[derive(Clone)]
pub(crate) struct Asyncify {
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
    get_state: TypedFunc<(), i32>,
}

impl Asyncify {
    /// `None` unless all five exports are present with the expected types
    pub(crate) fn from_instance(instance: &Instance, mut store: impl AsContextMut) -> Option<Self> {
        Some(Self {
            start_unwind: instance
                .get_typed_func(&mut store, "asyncify_start_unwind")
                .ok()?,
            stop_unwind: instance
                .get_typed_func(&mut store, "asyncify_stop_unwind")
                .ok()?,
            start_rewind: instance
                .get_typed_func(&mut store, "asyncify_start_rewind")
                .ok()?,
            stop_rewind: instance
                .get_typed_func(&mut store, "asyncify_stop_rewind")
                .ok()?,
            get_state: instance
                .get_typed_func(&mut store, "asyncify_get_state")
                .ok()?,
        })
    }

    pub(crate) fn state(&self, store: impl AsContextMut) -> wasmtime::Result<AsyncifyState> {
        AsyncifyState::from_raw(self.get_state.call(store, ())?)
    }

    pub(crate) fn stop_unwind(&self, store: impl AsContextMut) -> wasmtime::Result<()> {
        self.stop_unwind.call(store, ())
    }

    pub(crate) fn start_rewind(&self, store: impl AsContextMut, buffer: u32) -> wasmtime::Result<()> {
        self.start_rewind.call(store, buffer as i32)
    }
}

/// Per-store bookkeeping for suspend points
#[derive(Default)]
pub(crate) struct SuspendState {
    pub(crate) asyncify: Option<Asyncify>,
    pub(crate) memory: Option<Memory>,
    /// Guest address of the unwind buffer, once allocated
    pub(crate) buffer: Option<u32>,
    /// Reason recorded by the suspend point that started the last unwind
    pub(crate) pending: Option<SuspendReason>,
}

impl SuspendState {
    pub(crate) fn new(asyncify: Option<Asyncify>, memory: Memory) -> Self {
        Self {
            asyncify,
            memory: Some(memory),
            buffer: None,
            pending: None,
        }
    }
}

/// What a shim should do after consulting the asyncify state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspendPoint {
    /// An unwind has started; the return value is discarded by the guest
    Unwinding,
    /// The guest has been rewound back here; complete the operation
    Resumed,
    /// The guest cannot suspend; complete the operation now
    Passthrough,
}

pub(crate) fn add_suspend_points(linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
    linker.allow_shadowing(true);
    linker.func_wrap(WASI_MODULE, "sched_yield", sched_yield)?;
    linker.func_wrap(WASI_MODULE, "poll_oneoff", poll_oneoff)?;
    linker.allow_shadowing(false);
    Ok(())
}

fn enter_suspend_point(
    caller: &mut Caller<'_, GuestState>,
    reason: SuspendReason,
) -> wasmtime::Result<SuspendPoint> {
    let Some(asyncify) = caller.data().suspend.asyncify.clone() else {
        return Ok(SuspendPoint::Passthrough);
    };

    match asyncify.state(&mut *caller)? {
        AsyncifyState::Normal => {
            let buffer = prepare_unwind_buffer(caller)?;
            asyncify.start_unwind.call(&mut *caller, buffer as i32)?;
            caller.data_mut().suspend.pending = Some(reason);
            trace!(?reason, buffer, "unwinding guest");
            Ok(SuspendPoint::Unwinding)
        }
        AsyncifyState::Rewinding => {
            asyncify.stop_rewind.call(&mut *caller, ())?;
            trace!(?reason, "guest rewound to suspend point");
            Ok(SuspendPoint::Resumed)
        }
        AsyncifyState::Unwinding => bail!("suspend point reached while the guest is unwinding"),
    }
}

/// Allocate the unwind buffer on first use and reset its header
fn prepare_unwind_buffer(caller: &mut Caller<'_, GuestState>) -> wasmtime::Result<u32> {
    let memory = caller
        .data()
        .suspend
        .memory
        .ok_or_else(|| anyhow!("guest memory is not available"))?;

    let start = match caller.data().suspend.buffer {
        Some(start) => start,
        None => {
            let pages = u64::from(UNWIND_BUFFER_BYTES).div_ceil(WASM_PAGE_BYTES);
            let previous = memory.grow(&mut *caller, pages)?;
            let start = u32::try_from(previous * WASM_PAGE_BYTES)
                .map_err(|_| anyhow!("unwind buffer does not fit a 32-bit address space"))?;
            caller.data_mut().suspend.buffer = Some(start);
            start
        }
    };

    let end = start
        .checked_add(UNWIND_BUFFER_BYTES)
        .ok_or_else(|| anyhow!("unwind buffer does not fit a 32-bit address space"))?;
    let mut header = [0u8; UNWIND_HEADER_BYTES as usize];
    header[..4].copy_from_slice(&(start + UNWIND_HEADER_BYTES).to_le_bytes());
    header[4..].copy_from_slice(&end.to_le_bytes());
    memory.write(&mut *caller, start as usize, &header)?;
    Ok(start)
}

fn sched_yield(mut caller: Caller<'_, GuestState>) -> wasmtime::Result<i32> {
    enter_suspend_point(&mut caller, SuspendReason::Yield)?;
    Ok(ERRNO_SUCCESS)
}

fn poll_oneoff(
    mut caller: Caller<'_, GuestState>,
    subscriptions_ptr: i32,
    events_ptr: i32,
    nsubscriptions: i32,
    nevents_ptr: i32,
) -> wasmtime::Result<i32> {
    let Ok(count) = usize::try_from(nsubscriptions) else {
        return Ok(ERRNO_INVAL);
    };
    if count == 0 {
        return Ok(ERRNO_INVAL);
    }
    let memory = caller
        .data()
        .suspend
        .memory
        .ok_or_else(|| anyhow!("guest memory is not available"))?;

    let Some(len) = count.checked_mul(SUBSCRIPTION_BYTES) else {
        return Ok(ERRNO_FAULT);
    };
    if len > memory.data_size(&caller) {
        return Ok(ERRNO_FAULT);
    }
    let mut raw = vec![0u8; len];
    if memory
        .read(&caller, subscriptions_ptr as u32 as usize, &mut raw)
        .is_err()
    {
        return Ok(ERRNO_FAULT);
    }
    let Some(subscriptions) = raw
        .chunks_exact(SUBSCRIPTION_BYTES)
        .map(Subscription::parse)
        .collect::<Option<Vec<_>>>()
    else {
        return Ok(ERRNO_INVAL);
    };

    let wait = {
        let clock = &caller.data().clock;
        wait_duration(&subscriptions, |id| clock.now_nanos(id))
    };

    if enter_suspend_point(&mut caller, SuspendReason::TimedWait(wait))?
        == SuspendPoint::Unwinding
    {
        return Ok(ERRNO_SUCCESS);
    }

    let fired = {
        let clock = &caller.data().clock;
        fired_events(&subscriptions, wait, |id| clock.now_nanos(id))
    };
    let mut events = Vec::with_capacity(fired.len() * EVENT_BYTES);
    for subscription in &fired {
        events.extend_from_slice(&subscription.event());
    }
    let nevents = u32::try_from(fired.len()).unwrap_or(u32::MAX);
    if memory
        .write(&mut caller, events_ptr as u32 as usize, &events)
        .and_then(|()| {
            memory.write(
                &mut caller,
                nevents_ptr as u32 as usize,
                &nevents.to_le_bytes(),
            )
        })
        .is_err()
    {
        return Ok(ERRNO_FAULT);
    }
    Ok(ERRNO_SUCCESS)
}

/// One decoded `poll_oneoff` subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub(crate) userdata: u64,
    pub(crate) kind: SubscriptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionKind {
    Clock {
        id: u32,
        timeout: u64,
        absolute: bool,
    },
    FdRead(u32),
    FdWrite(u32),
}

fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn le_u32(raw: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl Subscription {
    /// Decode a 48-byte preview1 subscription. `None` for short input or an
    /// unknown event type.
    pub(crate) fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < SUBSCRIPTION_BYTES {
            return None;
        }
        let kind = match raw[8] {
            EVENTTYPE_CLOCK => SubscriptionKind::Clock {
                id: le_u32(raw, 16),
                timeout: le_u64(raw, 24),
                absolute: le_u16(raw, 40) & SUBCLOCKFLAG_ABSTIME != 0,
            },
            EVENTTYPE_FD_READ => SubscriptionKind::FdRead(le_u32(raw, 16)),
            EVENTTYPE_FD_WRITE => SubscriptionKind::FdWrite(le_u32(raw, 16)),
            _ => return None,
        };
        Some(Self {
            userdata: le_u64(raw, 0),
            kind,
        })
    }

    /// Time until this subscription fires; `None` for fd subscriptions
    fn timeout(&self, now: impl Fn(u32) -> u64) -> Option<Duration> {
        match self.kind {
            SubscriptionKind::Clock {
                id,
                timeout,
                absolute,
            } => {
                let nanos = if absolute {
                    timeout.saturating_sub(now(id))
                } else {
                    timeout
                };
                Some(Duration::from_nanos(nanos))
            }
            SubscriptionKind::FdRead(_) | SubscriptionKind::FdWrite(_) => None,
        }
    }

    fn is_fd(&self) -> bool {
        matches!(
            self.kind,
            SubscriptionKind::FdRead(_) | SubscriptionKind::FdWrite(_)
        )
    }

    /// Encode the 32-byte event reporting this subscription as ready
    pub(crate) fn event(&self) -> [u8; EVENT_BYTES] {
        let mut event = [0u8; EVENT_BYTES];
        event[0..8].copy_from_slice(&self.userdata.to_le_bytes());
        // error (u16 at 8) stays zero
        event[10] = match self.kind {
            SubscriptionKind::Clock { .. } => EVENTTYPE_CLOCK,
            SubscriptionKind::FdRead(_) => EVENTTYPE_FD_READ,
            SubscriptionKind::FdWrite(_) => EVENTTYPE_FD_WRITE,
        };
        event
    }
}

/// How long a poll over `subscriptions` waits: the earliest clock deadline,
/// or zero when any fd subscription is present.
pub(crate) fn wait_duration(subscriptions: &[Subscription], now: impl Fn(u32) -> u64) -> Duration {
    if subscriptions.iter().any(Subscription::is_fd) {
        return Duration::ZERO;
    }
    subscriptions
        .iter()
        .filter_map(|subscription| subscription.timeout(&now))
        .min()
        .unwrap_or(Duration::ZERO)
}

/// Subscriptions reported ready on resume. Fd subscriptions are always
/// ready, relative timeouts when they fit in `waited`, and absolute deadlines
/// when the clock has reached them.
fn fired_events(
    subscriptions: &[Subscription],
    waited: Duration,
    now: impl Fn(u32) -> u64,
) -> Vec<Subscription> {
    subscriptions
        .iter()
        .filter(|subscription| match subscription.kind {
            SubscriptionKind::Clock {
                timeout,
                absolute: false,
                ..
            } => Duration::from_nanos(timeout) <= waited,
            SubscriptionKind::Clock {
                id,
                timeout,
                absolute: true,
            } => timeout <= now(id),
            SubscriptionKind::FdRead(_) | SubscriptionKind::FdWrite(_) => true,
        })
        .copied()
        .collect()
}
