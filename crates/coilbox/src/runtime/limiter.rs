use tracing::debug;
use wasmtime::ResourceLimiter;

use crate::types::{LimitExceeded, ResourceLimits};

/// Store limiter enforcing a session's [`ResourceLimits`].
///
/// Growth past a ceiling fails with a [`LimitExceeded`] error rather than a
/// plain refusal, so the fault can be told apart from a guest that handles
/// a failed `memory.grow` itself.
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    memory_bytes: Option<u64>,
    table_elements: Option<u64>,
    instances: usize,
    tables: usize,
    memories: usize,
}

impl SessionLimiter {
    pub fn new(limits: &ResourceLimits) -> Self {
        let count = |value: Option<u32>, default: usize| {
            value.map_or(default, |n| usize::try_from(n).unwrap_or(usize::MAX))
        };
        Self {
            memory_bytes: limits.memory_bytes,
            table_elements: limits.table_elements,
            instances: count(limits.instances, wasmtime::DEFAULT_INSTANCE_LIMIT),
            tables: count(limits.tables, wasmtime::DEFAULT_TABLE_LIMIT),
            memories: count(limits.memories, wasmtime::DEFAULT_MEMORY_LIMIT),
        }
    }
}

impl ResourceLimiter for SessionLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let requested = desired as u64;
        if let Some(limit) = self.memory_bytes
            && requested > limit
        {
            debug!(current, requested, limit, "memory growth refused");
            return Err(LimitExceeded::Memory { requested, limit }.into());
        }
        Ok(maximum.is_none_or(|max| desired <= max))
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let requested = desired as u64;
        if let Some(limit) = self.table_elements
            && requested > limit
        {
            debug!(current, requested, limit, "table growth refused");
            return Err(LimitExceeded::Table { requested, limit }.into());
        }
        Ok(maximum.is_none_or(|max| desired <= max))
    }

    fn instances(&self) -> usize {
        self.instances
    }

    fn tables(&self) -> usize {
        self.tables
    }

    fn memories(&self) -> usize {
        self.memories
    }
}
