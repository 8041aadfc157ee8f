//! Byte-budget accounting for VM-side allocations.
//!
//! A runtime owns one [`HeapArena`] with a fixed capacity. Bytecode copies,
//! instance and environment stacks, and every page of guest linear memory
//! are charged against it and returned when their owner is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};
use wasmtime::ResourceLimiter;

use crate::handle::{Deleter, ForeignHandle};
use wasm_sandbox_common::{Resource, RuntimeError};

/// Fixed-capacity byte budget shared by everything a runtime allocates.
#[derive(Debug)]
pub struct HeapArena {
    capacity: u64,
    in_use: AtomicU64,
    peak: AtomicU64,
}

/// Bytes leased from a [`HeapArena`], returned on drop.
pub type ArenaLease = ForeignHandle<u64, ArenaRelease>;

impl HeapArena {
    /// Create an arena of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if `capacity` is zero.
    pub fn new(capacity: u64) -> Result<Arc<Self>, RuntimeError> {
        if capacity == 0 {
            return Err(RuntimeError::init_failed(
                Resource::Arena,
                "arena capacity must be non-zero",
            ));
        }

        debug!(capacity, "Heap arena created");

        Ok(Arc::new(Self {
            capacity,
            in_use: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }))
    }

    /// Total budget in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently charged.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest `in_use` value observed.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.in_use())
    }

    /// Charge `bytes` if they fit. Returns `false` and charges nothing otherwise.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.capacity)
            });

        match reserved {
            Ok(previous) => {
                self.peak.fetch_max(previous + bytes, Ordering::AcqRel);
                trace!(bytes, in_use = previous + bytes, "Arena reserve");
                true
            }
            Err(used) => {
                debug!(bytes, in_use = used, capacity = self.capacity, "Arena exhausted");
                false
            }
        }
    }

    /// Return `bytes` to the budget.
    /// Releasing more than is in use empties the arena.
    pub fn release(&self, bytes: u64) {
        let mut used = self.in_use.load(Ordering::Acquire);
        loop {
            let next = used.saturating_sub(bytes);
            match self
                .in_use
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if bytes > used {
                        debug!(bytes, in_use = used, "Arena over-release");
                    }
                    trace!(bytes, in_use = next, "Arena release");
                    return;
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Reserve `bytes` as an owned lease. A zero-byte lease is empty.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` for `resource` if the arena is exhausted.
    pub fn lease(self: &Arc<Self>, bytes: u64, resource: Resource) -> Result<ArenaLease, RuntimeError> {
        if !self.try_reserve(bytes) {
            return Err(RuntimeError::init_failed(
                resource,
                format!(
                    "heap arena exhausted: requested {bytes} bytes, {} of {} available",
                    self.available(),
                    self.capacity
                ),
            ));
        }

        Ok(ForeignHandle::new(bytes, ArenaRelease::new(Arc::clone(self))))
    }
}

/// Returns leased bytes to their arena.
#[derive(Debug, Clone)]
pub struct ArenaRelease {
    arena: Arc<HeapArena>,
}

impl ArenaRelease {
    /// A deleter releasing into `arena`.
    pub fn new(arena: Arc<HeapArena>) -> Self {
        Self { arena }
    }
}

impl Deleter<u64> for ArenaRelease {
    fn delete(&mut self, bytes: u64) {
        self.arena.release(bytes);
    }
}

/// Store limiter charging linear memory growth to the arena.
///
/// Everything charged is held in a single lease, so it goes back to the
/// arena when the store (and with it the limiter) is dropped.
#[derive(Debug)]
pub struct ArenaLimiter {
    charged: ArenaLease,
}

impl ArenaLimiter {
    /// A limiter with nothing charged yet.
    pub fn new(arena: Arc<HeapArena>) -> Self {
        Self {
            charged: ForeignHandle::null(ArenaRelease::new(arena)),
        }
    }

    /// Bytes of linear memory charged so far.
    pub fn charged(&self) -> u64 {
        self.charged.get()
    }
}

impl ResourceLimiter for ArenaLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if maximum.is_some_and(|max| desired > max) {
            return Ok(false);
        }

        let delta = desired.saturating_sub(current) as u64;
        if !self.charged.deleter().arena.try_reserve(delta) {
            return Ok(false);
        }

        let total = self.charged.release() + delta;
        self.charged.reset(total);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(maximum.is_none_or(|max| desired <= max))
    }
}
