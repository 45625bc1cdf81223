//! Capability providers injected into a sandbox
//!
//! Standard streams, clocks, randomness and networking. Defaults are the
//! inert choices: empty stdin, discarded output, real time, OS randomness
//! and no sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand::rngs::StdRng;
use wasmtime_wasi::p2::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::{HostMonotonicClock, HostWallClock, WasiCtxBuilder};

/// Source of bytes for the guest's standard input
#[derive(Debug, Clone, Default)]
pub enum InputSource {
    /// Reads hit end-of-file immediately
    #[default]
    Empty,
    /// Reads consume these bytes, then hit end-of-file
    Bytes(Vec<u8>),
}

impl InputSource {
    pub(crate) fn apply(&self, builder: &mut WasiCtxBuilder) {
        match self {
            InputSource::Empty => {}
            InputSource::Bytes(bytes) => {
                builder.stdin(MemoryInputPipe::new(bytes.clone()));
            }
        }
    }
}

/// Destination for the guest's standard output or error
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Writes succeed and are dropped
    #[default]
    Discard,
    /// Writes go to the host process's matching stream
    Inherit,
    /// Writes are buffered in memory for the caller to read back
    Capture(OutputCapture),
}

impl OutputSink {
    pub(crate) fn apply_stdout(&self, builder: &mut WasiCtxBuilder) {
        match self {
            OutputSink::Discard => {}
            OutputSink::Inherit => {
                builder.inherit_stdout();
            }
            OutputSink::Capture(capture) => {
                builder.stdout(capture.pipe.clone());
            }
        }
    }

    pub(crate) fn apply_stderr(&self, builder: &mut WasiCtxBuilder) {
        match self {
            OutputSink::Discard => {}
            OutputSink::Inherit => {
                builder.inherit_stderr();
            }
            OutputSink::Capture(capture) => {
                builder.stderr(capture.pipe.clone());
            }
        }
    }
}

/// Shared in-memory buffer collecting guest output.
///
/// Clones share the same buffer: keep one clone, hand the other to the
/// sandbox, and read it back after (or between) runs.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    pipe: MemoryOutputPipe,
}

impl OutputCapture {
    /// Capacity used by [`OutputCapture::new`]
    pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Writes beyond `capacity` bytes fail inside the guest
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pipe: MemoryOutputPipe::new(capacity),
        }
    }

    /// Everything the guest has written so far
    pub fn contents(&self) -> Vec<u8> {
        self.pipe.contents().to_vec()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Time as seen by the guest
#[derive(Debug, Clone, Default)]
pub enum ClockSource {
    /// Host wall clock and a monotonic clock starting at session creation
    #[default]
    Realtime,
    /// Deterministic time for reproducible runs
    Manual(ManualClock),
}

impl ClockSource {
    pub(crate) fn session_clock(&self) -> SessionClock {
        match self {
            ClockSource::Realtime => SessionClock::Realtime {
                origin: Instant::now(),
            },
            ClockSource::Manual(clock) => SessionClock::Manual(clock.clone()),
        }
    }
}

/// A clock that starts at a fixed wall time and advances by a fixed step
/// every time it is read, by either the wall or the monotonic view.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Duration,
    step: Duration,
    reads: Arc<AtomicU64>,
}

impl ManualClock {
    /// `start` earlier than the unix epoch is clamped to the epoch
    pub fn new(start: SystemTime, step: Duration) -> Self {
        Self {
            start: start.duration_since(UNIX_EPOCH).unwrap_or_default(),
            step,
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    fn tick(&self) -> Duration {
        let reads = self.reads.fetch_add(1, Ordering::SeqCst);
        let nanos = u64::try_from(self.step.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(nanos.saturating_mul(reads))
    }

    /// Time since the unix epoch, advancing the clock
    pub fn wall_now(&self) -> Duration {
        self.start.saturating_add(self.tick())
    }

    /// Nanoseconds since the clock was created, advancing the clock
    pub fn monotonic_now(&self) -> u64 {
        u64::try_from(self.tick().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Number of reads so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn resolution(&self) -> Duration {
        self.step.max(Duration::from_nanos(1))
    }
}

/// Clock installed into one session. Both the wall and monotonic views of
/// the guest come from here, as do deadlines for timed waits.
#[derive(Debug, Clone)]
pub(crate) enum SessionClock {
    Realtime { origin: Instant },
    Manual(ManualClock),
}

/// WASI clock id of the realtime clock
const CLOCK_REALTIME: u32 = 0;

impl SessionClock {
    /// Current reading of a WASI clock id in nanoseconds. CPU-time clocks
    /// are served by the monotonic view.
    pub(crate) fn now_nanos(&self, clock_id: u32) -> u64 {
        if clock_id == CLOCK_REALTIME {
            u64::try_from(HostWallClock::now(self).as_nanos()).unwrap_or(u64::MAX)
        } else {
            HostMonotonicClock::now(self)
        }
    }
}

impl HostWallClock for SessionClock {
    fn resolution(&self) -> Duration {
        match self {
            SessionClock::Realtime { .. } => Duration::from_nanos(1),
            SessionClock::Manual(clock) => clock.resolution(),
        }
    }

    fn now(&self) -> Duration {
        match self {
            SessionClock::Realtime { .. } => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
            SessionClock::Manual(clock) => clock.wall_now(),
        }
    }
}

impl HostMonotonicClock for SessionClock {
    fn resolution(&self) -> u64 {
        match self {
            SessionClock::Realtime { .. } => 1,
            SessionClock::Manual(clock) => {
                u64::try_from(clock.resolution().as_nanos()).unwrap_or(u64::MAX)
            }
        }
    }

    fn now(&self) -> u64 {
        match self {
            SessionClock::Realtime { origin } => {
                u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
            }
            SessionClock::Manual(clock) => clock.monotonic_now(),
        }
    }
}

/// Randomness as seen by the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RandomSource {
    /// Host operating system randomness
    #[default]
    Os,
    /// Deterministic stream from a fixed seed
    Seeded(u64),
}

impl RandomSource {
    pub(crate) fn apply(&self, builder: &mut WasiCtxBuilder) {
        if let RandomSource::Seeded(seed) = *self {
            builder.secure_random(StdRng::seed_from_u64(seed));
            builder.insecure_random(StdRng::seed_from_u64(seed.wrapping_add(1)));
            builder.insecure_random_seed(u128::from(seed));
        }
    }
}

/// Which guest socket operations are allowed. Everything is denied by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub allow_tcp: bool,
    pub allow_udp: bool,
    pub allow_ip_name_lookup: bool,
}

impl NetworkPolicy {
    /// Deny all socket operations
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        !(self.allow_tcp || self.allow_udp || self.allow_ip_name_lookup)
    }

    pub(crate) fn apply(&self, builder: &mut WasiCtxBuilder) {
        builder
            .allow_tcp(self.allow_tcp)
            .allow_udp(self.allow_udp)
            .allow_ip_name_lookup(self.allow_ip_name_lookup);
    }
}
