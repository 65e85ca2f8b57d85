//! Backing memory for engine state.
//!
//! The real allocator hands out CPU-writable, GPU-readable buffers and maps
//! them for CPU access through a lock/unlock pair. [`SystemAllocator`] is a
//! host-memory stand-in with an optional byte budget.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Round `value` up to the nearest multiple of `alignment` (`alignment > 0`).
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => usize::MAX / alignment * alignment,
    }
}

/// Supplies buffers of a requested size and alignment.
pub trait BackingAllocator: Send + Sync {
    fn allocate(&self, size: usize, alignment: usize) -> Result<Box<dyn BackingMemory>>;
}

/// One allocated buffer.
pub trait BackingMemory: Send {
    /// Size in bytes.
    fn len(&self) -> usize;

    /// Address the engine uses to reach byte 0 of the buffer.
    fn gpu_address(&self) -> u64;

    /// Map the buffer for CPU writes.
    fn lock(&mut self) -> Result<&mut [u8]>;

    fn unlock(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// System Memory
// ============================================================================

/// Host-memory allocator with an optional total budget.
pub struct SystemAllocator {
    budget: Option<usize>,
    in_use: Arc<AtomicUsize>,
    next_address: AtomicU64,
}

impl SystemAllocator {
    /// Base of the synthetic address range handed out as GPU addresses.
    const ADDRESS_BASE: u64 = 0x1_0000_0000;

    pub fn new() -> Self {
        Self {
            budget: None,
            in_use: Arc::new(AtomicUsize::new(0)),
            next_address: AtomicU64::new(Self::ADDRESS_BASE),
        }
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingAllocator for SystemAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<Box<dyn BackingMemory>> {
        let fail = |reason: String| EngineError::Allocation {
            requested: size,
            alignment,
            reason,
        };

        if size == 0 {
            return Err(fail("zero-sized buffer".into()));
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(fail("alignment must be a power of two".into()));
        }

        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(size)?;
                match self.budget {
                    Some(budget) if next > budget => None,
                    _ => Some(next),
                }
            });
        if let Err(used) = reserved {
            return Err(fail(format!(
                "budget exhausted ({} of {:?} bytes in use)",
                used, self.budget
            )));
        }

        let span = align_up(size, alignment) as u64;
        let mut address = 0;
        let _ = self
            .next_address
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                address = align_up(next as usize, alignment) as u64;
                Some(address + span)
            });

        tracing::debug!("Allocated {} bytes at 0x{:X}", size, address);

        Ok(Box::new(SystemMemory {
            bytes: vec![0u8; size],
            address,
            locked: false,
            in_use: self.in_use.clone(),
        }))
    }
}

/// Buffer returned by [`SystemAllocator`]. Returns its bytes to the budget on drop.
pub struct SystemMemory {
    bytes: Vec<u8>,
    address: u64,
    locked: bool,
    in_use: Arc<AtomicUsize>,
}

impl BackingMemory for SystemMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn gpu_address(&self) -> u64 {
        self.address
    }

    fn lock(&mut self) -> Result<&mut [u8]> {
        self.locked = true;
        Ok(&mut self.bytes)
    }

    fn unlock(&mut self) {
        self.locked = false;
    }
}

impl Drop for SystemMemory {
    fn drop(&mut self) {
        if self.locked {
            tracing::warn!("Buffer at 0x{:X} released while mapped", self.address);
        }
        self.in_use.fetch_sub(self.bytes.len(), Ordering::AcqRel);
    }
}
