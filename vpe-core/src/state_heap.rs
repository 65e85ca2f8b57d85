//! # Engine State Heap
//!
//! A fixed ring of hardware-state instances shared between the driver (CPU
//! writes) and one engine instance (GPU reads). Every instance is cut into
//! the same named sub-regions, laid out once at creation:
//!
//! ```text
//!  instance 0                         instance 1
//! ┌──────┬──────┬─────┬──────┬─────┬───────┬─────┐┌──────┬─────
//! │ DNDI │ IECP │Gamut│Vertex│ Cap │ Gamma │ HDR ││ DNDI │ ...
//! └──────┴──────┴─────┴──────┴─────┴───────┴─────┘└──────┴─────
//! ```
//!
//! Slots are handed out strictly round-robin. A slot is reused only after
//! the engine has retired the tag of its previous use; when it has not,
//! [`StateHeap::acquire`] polls the fence up to a bound and then fails. It
//! never skips ahead to a later slot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::fence::{EngineHandle, FenceTracker};
use crate::memory::{BackingAllocator, BackingMemory};

// ============================================================================
// Sub-Regions
// ============================================================================

/// Logical state blocks inside one heap instance.
///
/// Declaration order is the layout order within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubRegionKind {
    /// Denoise / deinterlace state
    DenoiseDeinterlace,
    /// Color pipeline (IECP) state
    ColorPipeline,
    /// Gamut compression / expansion state
    Gamut,
    /// Vertex table (luma histogram bins)
    VertexTable,
    /// Capture pipe state
    CapturePipe,
    /// Gamma correction LUT
    GammaCorrection,
    /// HDR tone-mapping state
    Hdr,
}

impl SubRegionKind {
    pub const ALL: [SubRegionKind; 7] = [
        Self::DenoiseDeinterlace,
        Self::ColorPipeline,
        Self::Gamut,
        Self::VertexTable,
        Self::CapturePipe,
        Self::GammaCorrection,
        Self::Hdr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DenoiseDeinterlace => "DNDI",
            Self::ColorPipeline => "IECP",
            Self::Gamut => "Gamut",
            Self::VertexTable => "Vertex",
            Self::CapturePipe => "Capture",
            Self::GammaCorrection => "Gamma",
            Self::Hdr => "HDR",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Configured byte size of every sub-region kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubRegionSizes {
    pub denoise_deinterlace: usize,
    pub color_pipeline: usize,
    pub gamut: usize,
    pub vertex_table: usize,
    pub capture_pipe: usize,
    pub gamma_correction: usize,
    pub hdr: usize,
}

impl Default for SubRegionSizes {
    fn default() -> Self {
        Self {
            denoise_deinterlace: 1024,
            color_pipeline: 512,
            gamut: 2048,
            vertex_table: 2048,  // 512 histogram bins x 4 bytes
            capture_pipe: 256,
            gamma_correction: 4096, // 1024-entry LUT x 4 bytes
            hdr: 8192,
        }
    }
}

impl SubRegionSizes {
    pub fn size_of(&self, kind: SubRegionKind) -> usize {
        match kind {
            SubRegionKind::DenoiseDeinterlace => self.denoise_deinterlace,
            SubRegionKind::ColorPipeline => self.color_pipeline,
            SubRegionKind::Gamut => self.gamut,
            SubRegionKind::VertexTable => self.vertex_table,
            SubRegionKind::CapturePipe => self.capture_pipe,
            SubRegionKind::GammaCorrection => self.gamma_correction,
            SubRegionKind::Hdr => self.hdr,
        }
    }

    pub fn total(&self) -> usize {
        SubRegionKind::ALL.iter().map(|k| self.size_of(*k)).sum()
    }
}

/// One named block inside an instance. `offset` is relative to the instance start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRegion {
    pub kind: SubRegionKind,
    pub offset: usize,
    pub size: usize,
}

/// Instance layout, identical for every slot of a heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    regions: [SubRegion; 7],
    stride: usize,
}

impl HeapLayout {
    /// Concatenate the configured sizes in [`SubRegionKind::ALL`] order.
    pub fn new(sizes: &SubRegionSizes) -> Result<Self> {
        let mut offset = 0usize;
        let mut regions = [SubRegion {
            kind: SubRegionKind::DenoiseDeinterlace,
            offset: 0,
            size: 0,
        }; 7];

        for kind in SubRegionKind::ALL {
            let size = sizes.size_of(kind);
            regions[kind.index()] = SubRegion { kind, offset, size };
            offset = offset.checked_add(size).ok_or_else(|| {
                EngineError::Configuration(format!("sub-region sizes overflow at {:?}", kind))
            })?;
        }

        if offset == 0 {
            return Err(EngineError::Configuration(
                "every sub-region size is zero".into(),
            ));
        }

        Ok(Self {
            regions,
            stride: offset,
        })
    }

    pub fn region(&self, kind: SubRegionKind) -> SubRegion {
        self.regions[kind.index()]
    }

    pub fn regions(&self) -> &[SubRegion] {
        &self.regions
    }

    /// Bytes per instance.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Bookkeeping for one ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStatus {
    /// Tag that must retire before the slot may be overwritten.
    pub pending_tag: u64,
    /// Acquired and not yet observed retired.
    pub busy: bool,
    /// `finalize` was called for the current use.
    pub finalized: bool,
    /// Bumped on every acquire; stale tokens are rejected.
    pub generation: u64,
}

/// Token for one acquired instance.
///
/// Consumed by [`StateHeap::finalize`] or [`StateHeap::abandon`]. Dropping
/// it unfinalized leaves the slot busy under the tag reserved at acquire,
/// which the fence retires once later work on the engine completes.
#[derive(Debug)]
pub struct StateSlot {
    heap_id: u64,
    index: usize,
    generation: u64,
    tag: u64,
    base_offset: usize,
    base_address: u64,
    layout: Arc<HeapLayout>,
}

impl StateSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Tag reserved for this use of the slot.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Byte offset of the instance inside the heap buffer.
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Engine-visible address of the instance.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Byte offset of `kind` inside the heap buffer.
    pub fn region_offset(&self, kind: SubRegionKind) -> usize {
        self.base_offset + self.layout.region(kind).offset
    }

    /// Engine-visible address of `kind`.
    pub fn region_address(&self, kind: SubRegionKind) -> u64 {
        self.base_address + self.layout.region(kind).offset as u64
    }

    pub fn region(&self, kind: SubRegionKind) -> SubRegion {
        self.layout.region(kind)
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }
}

// ============================================================================
// Slot Writer
// ============================================================================

/// CPU write access to one acquired instance. Unmaps the heap buffer on drop.
pub struct SlotWriter<'a> {
    memory: &'a mut dyn BackingMemory,
    base: usize,
    layout: &'a HeapLayout,
}

impl<'a> SlotWriter<'a> {
    /// Mutable view of a whole sub-region.
    pub fn region_mut(&mut self, kind: SubRegionKind) -> Result<&mut [u8]> {
        let region = self.layout.region(kind);
        let start = self.base + region.offset;
        let bytes = self.memory.lock()?;
        Ok(&mut bytes[start..start + region.size])
    }

    pub fn write_bytes(&mut self, kind: SubRegionKind, offset: usize, data: &[u8]) -> Result<()> {
        let region = self.layout.region(kind);
        let end = offset.checked_add(data.len());
        if end.map_or(true, |end| end > region.size) {
            return Err(EngineError::RegionOverflow {
                kind,
                offset,
                len: data.len(),
                size: region.size,
            });
        }
        let dst = self.region_mut(kind)?;
        dst[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Write a plain-old-data state block at the start of `kind`.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, kind: SubRegionKind, value: &T) -> Result<()> {
        self.write_bytes(kind, 0, bytemuck::bytes_of(value))
    }

    /// Write a table of entries (LUTs, vertex tables) starting at the region base.
    pub fn write_slice<T: bytemuck::Pod>(&mut self, kind: SubRegionKind, values: &[T]) -> Result<()> {
        self.write_bytes(kind, 0, bytemuck::cast_slice(values))
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        self.memory.unlock();
    }
}

// ============================================================================
// Heap
// ============================================================================

/// Polling and placement knobs for a heap.
#[derive(Debug, Clone)]
pub struct HeapOptions {
    /// Alignment of the backing buffer.
    pub alignment: usize,
    /// Upper bound on how long `acquire` waits for a slot to retire.
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            alignment: 4096,
            acquire_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_micros(200),
        }
    }
}

/// Heap statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub capacity: usize,
    pub stride: usize,
    pub busy: usize,
    pub free: usize,
    pub acquires: u64,
    /// Acquires that had to poll the fence
    pub waits: u64,
    pub timeouts: u64,
    /// Busy slots observed retired and returned to the ring
    pub reclaims: u64,
    /// Slots given back without ever being submitted
    pub abandoned: u64,
}

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Ring of state instances owned by one engine instance.
pub struct StateHeap {
    id: u64,
    layout: Arc<HeapLayout>,
    capacity: usize,
    memory: Option<Box<dyn BackingMemory>>,
    base_address: u64,
    slots: Vec<SlotStatus>,
    next_slot: usize,
    sync_tag_base: u64,
    fence: FenceTracker,
    options: HeapOptions,
    stats: HeapStats,
}

impl StateHeap {
    /// Allocate `capacity` contiguous instances laid out from `sizes`.
    pub fn create(
        sizes: &SubRegionSizes,
        capacity: usize,
        allocator: &dyn BackingAllocator,
        fence: FenceTracker,
        options: HeapOptions,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::Configuration("heap capacity must be at least 1".into()));
        }

        let layout = HeapLayout::new(sizes)?;
        let total = layout.stride().checked_mul(capacity).ok_or_else(|| {
            EngineError::Configuration(format!(
                "{} instances of {} bytes overflow",
                capacity,
                layout.stride()
            ))
        })?;

        let memory = allocator.allocate(total, options.alignment)?;
        if memory.len() < total {
            return Err(EngineError::Allocation {
                requested: total,
                alignment: options.alignment,
                reason: format!("allocator returned only {} bytes", memory.len()),
            });
        }
        let base_address = memory.gpu_address();
        let sync_tag_base = fence.completed();

        tracing::info!(
            "{} state heap: {} x {} bytes at 0x{:X} (tag base {})",
            fence.engine(),
            capacity,
            layout.stride(),
            base_address,
            sync_tag_base
        );

        Ok(Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            stats: HeapStats {
                capacity,
                stride: layout.stride(),
                free: capacity,
                ..Default::default()
            },
            layout: Arc::new(layout),
            capacity,
            memory: Some(memory),
            base_address,
            slots: vec![SlotStatus::default(); capacity],
            next_slot: 0,
            sync_tag_base,
            fence,
            options,
        })
    }

    // ========================================================================
    // Ring Operations
    // ========================================================================

    /// Take the slot at `next_slot`, waiting (bounded) for its previous use to retire.
    ///
    /// The returned instance is zeroed across its full stride. On timeout the
    /// ring position is left unchanged.
    pub fn acquire(&mut self) -> Result<StateSlot> {
        let engine = self.fence.engine();
        if self.memory.is_none() {
            return Err(EngineError::HeapDestroyed { engine: engine.0 });
        }

        let index = self.next_slot;
        let status = self.slots[index];

        if status.busy {
            if !self.fence.is_retired(status.pending_tag) {
                self.stats.waits += 1;
                tracing::debug!(
                    "{} slot {} waiting on tag {}",
                    engine,
                    index,
                    status.pending_tag
                );
            }

            let waited = self.fence.wait_retired(
                status.pending_tag,
                self.options.acquire_timeout,
                self.options.poll_interval,
            );
            if let Err(completed) = waited {
                self.stats.timeouts += 1;
                tracing::error!(
                    "{} slot {} still in flight: tag {} not retired (completed {})",
                    engine,
                    index,
                    status.pending_tag,
                    completed
                );
                return Err(EngineError::Timeout {
                    engine: engine.0,
                    slot: index,
                    tag: status.pending_tag,
                    completed,
                    waited: self.options.acquire_timeout,
                });
            }
            self.release_slot(index);
        }

        let stride = self.layout.stride();
        let base_offset = index * stride;
        if let Some(memory) = self.memory.as_mut() {
            let bytes = memory.lock()?;
            bytes[base_offset..base_offset + stride].fill(0);
            memory.unlock();
        }

        let tag = self.fence.reserve();
        let slot = &mut self.slots[index];
        slot.busy = true;
        slot.finalized = false;
        slot.pending_tag = tag;
        slot.generation += 1;
        let generation = slot.generation;

        self.next_slot = (index + 1) % self.capacity;
        self.stats.acquires += 1;
        self.stats.busy += 1;
        self.stats.free -= 1;

        tracing::debug!("{} acquired slot {} (tag {})", engine, index, tag);

        Ok(StateSlot {
            heap_id: self.id,
            index,
            generation,
            tag,
            base_offset,
            base_address: self.base_address + base_offset as u64,
            layout: self.layout.clone(),
        })
    }

    /// Map an acquired slot for writing.
    pub fn writer(&mut self, slot: &StateSlot) -> Result<SlotWriter<'_>> {
        self.check_token(slot)?;
        let engine = self.fence.engine();
        let memory = self
            .memory
            .as_deref_mut()
            .ok_or(EngineError::HeapDestroyed { engine: engine.0 })?;
        Ok(SlotWriter {
            memory,
            base: slot.base_offset,
            layout: &self.layout,
        })
    }

    /// Record the tag the engine will signal once it has consumed `slot`.
    ///
    /// The slot stays busy until a later `acquire` or `reclaim` sees the tag retire.
    pub fn finalize(&mut self, slot: StateSlot, new_tag: u64) -> Result<()> {
        self.check_token(&slot)?;
        let engine = self.fence.engine();
        let status = &mut self.slots[slot.index];

        if new_tag < slot.tag {
            tracing::warn!(
                "{} slot {} finalized with tag {} below reserved {}; keeping reserved",
                engine,
                slot.index,
                new_tag,
                slot.tag
            );
        }
        status.pending_tag = new_tag.max(slot.tag);
        status.finalized = true;

        tracing::debug!(
            "{} finalized slot {} (tag {})",
            engine,
            slot.index,
            status.pending_tag
        );
        Ok(())
    }

    /// Give back a slot whose stream was never handed to the engine.
    ///
    /// Nothing engine-visible references the instance, so it is freed at once
    /// and the ring position is left alone. The reserved tag is never signaled
    /// for this slot; later completions on the engine cover it.
    pub fn abandon(&mut self, slot: StateSlot) -> Result<()> {
        self.check_token(&slot)?;
        let status = &mut self.slots[slot.index];
        status.busy = false;
        status.finalized = false;
        self.stats.busy -= 1;
        self.stats.free += 1;
        self.stats.abandoned += 1;

        tracing::debug!(
            "{} abandoned slot {} (tag {} unused)",
            self.fence.engine(),
            slot.index,
            slot.tag
        );
        Ok(())
    }

    /// Return every finalized slot whose tag has retired. Returns how many were freed.
    ///
    /// Unlike `acquire` and `destroy`, this leaves busy slots that were never
    /// finalized alone: their token may still be out with a writer. Such a
    /// slot is freed by `abandon`, or by `acquire` reaching it once its
    /// reserved tag retires.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.capacity {
            let status = self.slots[index];
            if status.busy && status.finalized && self.fence.is_retired(status.pending_tag) {
                self.release_slot(index);
                freed += 1;
            }
        }
        freed
    }

    /// Block until every busy slot has retired, or fail with `Timeout`.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<()> {
        let engine = self.fence.engine();
        let pending = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.busy)
            .max_by_key(|(_, s)| s.pending_tag)
            .map(|(i, s)| (i, s.pending_tag));

        if let Some((index, tag)) = pending {
            if let Err(completed) = self.fence.wait_retired(tag, timeout, self.options.poll_interval) {
                self.stats.timeouts += 1;
                return Err(EngineError::Timeout {
                    engine: engine.0,
                    slot: index,
                    tag,
                    completed,
                    waited: timeout,
                });
            }
        }

        for index in 0..self.capacity {
            if self.slots[index].busy {
                self.release_slot(index);
            }
        }
        Ok(())
    }

    /// Release the backing memory.
    ///
    /// Fails with `HeapInUse` while any slot is still unretired per the
    /// fence; the heap stays usable in that case.
    pub fn destroy(&mut self) -> Result<()> {
        let engine = self.fence.engine();
        if self.memory.is_none() {
            return Err(EngineError::HeapDestroyed { engine: engine.0 });
        }

        for index in 0..self.capacity {
            let status = self.slots[index];
            if status.busy && self.fence.is_retired(status.pending_tag) {
                self.release_slot(index);
            }
        }

        let busy = self.busy_slots();
        if busy > 0 {
            tracing::error!("{} heap destroy refused: {} slot(s) in flight", engine, busy);
            return Err(EngineError::HeapInUse {
                engine: engine.0,
                busy,
            });
        }

        self.memory = None;
        tracing::info!("{} state heap released", engine);
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Copy `len` bytes out of the heap buffer at an absolute offset.
    pub fn read_bytes(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let engine = self.fence.engine();
        let memory = self
            .memory
            .as_mut()
            .ok_or(EngineError::HeapDestroyed { engine: engine.0 })?;
        let total = memory.len();
        let end = offset.checked_add(len).filter(|end| *end <= total).ok_or_else(|| {
            EngineError::Configuration(format!(
                "read of {} bytes at {} exceeds heap of {} bytes",
                len, offset, total
            ))
        })?;
        let bytes = memory.lock()?;
        let out = bytes[offset..end].to_vec();
        memory.unlock();
        Ok(out)
    }

    /// Copy one sub-region of an acquired slot.
    pub fn read_region(&mut self, slot: &StateSlot, kind: SubRegionKind) -> Result<Vec<u8>> {
        self.check_token(slot)?;
        self.read_bytes(slot.region_offset(kind), slot.region(kind).size)
    }

    pub fn slot_status(&self, index: usize) -> Option<SlotStatus> {
        self.slots.get(index).copied()
    }

    pub fn next_slot(&self) -> usize {
        self.next_slot
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn engine(&self) -> EngineHandle {
        self.fence.engine()
    }

    pub fn sync_tag_base(&self) -> u64 {
        self.sync_tag_base
    }

    pub fn gpu_address(&self) -> u64 {
        self.base_address
    }

    pub fn fence(&self) -> &FenceTracker {
        &self.fence
    }

    pub fn is_destroyed(&self) -> bool {
        self.memory.is_none()
    }

    pub fn busy_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats.clone()
    }

    fn release_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if slot.busy {
            slot.busy = false;
            slot.finalized = false;
            self.stats.reclaims += 1;
            self.stats.busy -= 1;
            self.stats.free += 1;
        }
    }

    fn check_token(&self, slot: &StateSlot) -> Result<()> {
        if slot.heap_id != self.id {
            return Err(EngineError::ForeignSlot {
                heap: self.id,
                slot: slot.index,
            });
        }
        let status = self.slots[slot.index];
        if status.generation != slot.generation {
            return Err(EngineError::StaleSlot {
                slot: slot.index,
                held: slot.generation,
                current: status.generation,
            });
        }
        if !status.busy {
            return Err(EngineError::SlotNotBusy { slot: slot.index });
        }
        Ok(())
    }
}

impl Drop for StateHeap {
    fn drop(&mut self) {
        if self.memory.is_none() {
            return;
        }
        let in_flight = self
            .slots
            .iter()
            .filter(|s| s.busy && !self.fence.is_retired(s.pending_tag))
            .count();
        if in_flight > 0 {
            tracing::error!(
                "{} state heap dropped with {} slot(s) still in flight",
                self.fence.engine(),
                in_flight
            );
        }
    }
}

impl std::fmt::Debug for StateHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHeap")
            .field("id", &self.id)
            .field("engine", &self.fence.engine())
            .field("capacity", &self.capacity)
            .field("stride", &self.layout.stride())
            .field("next_slot", &self.next_slot)
            .field("busy", &self.busy_slots())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{FenceSource, SimFence};
    use crate::memory::SystemAllocator;
    use std::time::Instant;

    const ENGINE: EngineHandle = EngineHandle(0);

    fn small_sizes() -> SubRegionSizes {
        SubRegionSizes {
            denoise_deinterlace: 64,
            color_pipeline: 32,
            gamut: 16,
            vertex_table: 16,
            capture_pipe: 8,
            gamma_correction: 32,
            hdr: 64,
        }
    }

    fn fast_options() -> HeapOptions {
        HeapOptions {
            alignment: 64,
            acquire_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn heap(capacity: usize) -> (StateHeap, Arc<SimFence>) {
        let fence = SimFence::new();
        let tracker = FenceTracker::new(fence.clone(), ENGINE);
        let heap = StateHeap::create(
            &small_sizes(),
            capacity,
            &SystemAllocator::new(),
            tracker,
            fast_options(),
        )
        .unwrap();
        (heap, fence)
    }

    #[test]
    fn layout_concatenates_in_fixed_order() {
        let layout = HeapLayout::new(&small_sizes()).unwrap();
        assert_eq!(layout.stride(), 232);
        assert_eq!(layout.region(SubRegionKind::DenoiseDeinterlace).offset, 0);
        assert_eq!(layout.region(SubRegionKind::ColorPipeline).offset, 64);
        assert_eq!(layout.region(SubRegionKind::Gamut).offset, 96);
        assert_eq!(layout.region(SubRegionKind::VertexTable).offset, 112);
        assert_eq!(layout.region(SubRegionKind::CapturePipe).offset, 128);
        assert_eq!(layout.region(SubRegionKind::GammaCorrection).offset, 136);
        assert_eq!(layout.region(SubRegionKind::Hdr).offset, 168);
    }

    #[test]
    fn layout_rejects_all_zero_sizes() {
        let sizes = SubRegionSizes {
            denoise_deinterlace: 0,
            color_pipeline: 0,
            gamut: 0,
            vertex_table: 0,
            capture_pipe: 0,
            gamma_correction: 0,
            hdr: 0,
        };
        assert!(matches!(
            HeapLayout::new(&sizes),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn create_surfaces_allocation_error() {
        let fence = SimFence::new();
        let result = StateHeap::create(
            &small_sizes(),
            4,
            &SystemAllocator::with_budget(100),
            FenceTracker::new(fence, ENGINE),
            fast_options(),
        );
        assert!(matches!(result, Err(EngineError::Allocation { .. })));
    }

    /// Hands out half of what was asked for.
    struct ShortAllocator(SystemAllocator);

    impl BackingAllocator for ShortAllocator {
        fn allocate(&self, size: usize, alignment: usize) -> Result<Box<dyn BackingMemory>> {
            self.0.allocate(size / 2, alignment)
        }
    }

    #[test]
    fn create_rejects_short_backing_memory() {
        let fence = SimFence::new();
        let result = StateHeap::create(
            &small_sizes(),
            4,
            &ShortAllocator(SystemAllocator::new()),
            FenceTracker::new(fence, ENGINE),
            fast_options(),
        );
        match result {
            Err(EngineError::Allocation { requested, .. }) => assert_eq!(requested, 4 * 232),
            other => panic!("expected allocation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn region_round_trip_and_unwritten_regions_are_zero() {
        let (mut heap, _fence) = heap(2);
        let slot = heap.acquire().unwrap();

        {
            let mut writer = heap.writer(&slot).unwrap();
            writer.write_pod(SubRegionKind::Gamut, &0xDEAD_BEEF_u32).unwrap();
        }

        let offset = slot.region_offset(SubRegionKind::Gamut);
        let back = heap.read_bytes(offset, 4).unwrap();
        assert_eq!(back, 0xDEAD_BEEF_u32.to_ne_bytes());

        for kind in SubRegionKind::ALL {
            if kind == SubRegionKind::Gamut {
                continue;
            }
            let bytes = heap.read_region(&slot, kind).unwrap();
            assert!(bytes.iter().all(|b| *b == 0), "{:?} not zeroed", kind);
        }
    }

    #[test]
    fn reacquired_slot_is_zeroed() {
        let (mut heap, fence) = heap(1);
        let slot = heap.acquire().unwrap();
        heap.writer(&slot)
            .unwrap()
            .write_slice(SubRegionKind::Hdr, &[7u32; 16])
            .unwrap();
        let tag = slot.tag();
        heap.finalize(slot, tag).unwrap();
        fence.signal(ENGINE, tag);

        let slot = heap.acquire().unwrap();
        let hdr = heap.read_region(&slot, SubRegionKind::Hdr).unwrap();
        assert!(hdr.iter().all(|b| *b == 0));
    }

    #[test]
    fn write_past_region_end_is_rejected() {
        let (mut heap, _fence) = heap(1);
        let slot = heap.acquire().unwrap();
        let mut writer = heap.writer(&slot).unwrap();
        let err = writer
            .write_bytes(SubRegionKind::CapturePipe, 4, &[1u8; 8])
            .unwrap_err();
        assert!(matches!(err, EngineError::RegionOverflow { size: 8, .. }));
    }

    #[test]
    fn ring_cannot_overwrite_live_state() {
        let capacity = 3;
        let (mut heap, _fence) = heap(capacity);

        for _ in 0..capacity {
            let slot = heap.acquire().unwrap();
            let tag = slot.tag();
            heap.finalize(slot, tag).unwrap();
        }

        let started = Instant::now();
        let err = heap.acquire().unwrap_err();
        assert!(started.elapsed() >= fast_options().acquire_timeout);
        assert!(matches!(err, EngineError::Timeout { slot: 0, .. }));
        // The ring never skips ahead.
        assert_eq!(heap.next_slot(), 0);
        assert_eq!(heap.stats().timeouts, 1);
    }

    #[test]
    fn unfinalized_slots_also_block_the_ring() {
        let (mut heap, _fence) = heap(2);
        let _a = heap.acquire().unwrap();
        let _b = heap.acquire().unwrap();
        assert!(matches!(heap.acquire(), Err(EngineError::Timeout { .. })));
    }

    #[test]
    fn retirement_frees_slot_and_ring_wraps() {
        let (mut heap, fence) = heap(2);
        for _ in 0..2 {
            let slot = heap.acquire().unwrap();
            let tag = slot.tag();
            heap.finalize(slot, tag).unwrap();
        }
        fence.retire_all(ENGINE);

        let slot = heap.acquire().unwrap();
        assert_eq!(slot.index(), 0);
        assert_eq!(heap.next_slot(), 1);
        assert_eq!(heap.stats().reclaims, 1);
    }

    #[test]
    fn acquire_waits_for_late_retirement() {
        let (mut heap, fence) = heap(1);
        let slot = heap.acquire().unwrap();
        let tag = slot.tag();
        heap.finalize(slot, tag).unwrap();

        let signaler = {
            let fence = fence.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(3));
                fence.signal(ENGINE, tag);
            })
        };

        let slot = heap.acquire().unwrap();
        signaler.join().unwrap();
        assert_eq!(slot.index(), 0);
        assert_eq!(heap.stats().waits, 1);
    }

    #[test]
    fn abandoned_slot_is_reclaimed_by_later_completion() {
        let (mut heap, fence) = heap(2);
        let abandoned = heap.acquire().unwrap();
        drop(abandoned);

        let next = heap.acquire().unwrap();
        let tag = next.tag();
        heap.finalize(next, tag).unwrap();
        fence.signal(ENGINE, tag);

        let again = heap.acquire().unwrap();
        assert_eq!(again.index(), 0);
    }

    #[test]
    fn abandon_frees_slot_without_fence() {
        let (mut heap, _fence) = heap(1);
        let slot = heap.acquire().unwrap();
        heap.abandon(slot).unwrap();

        let stats = heap.stats();
        assert_eq!((stats.busy, stats.abandoned), (0, 1));
        // Capacity 1: the only slot is reusable with nothing retired.
        assert_eq!(heap.acquire().unwrap().index(), 0);
    }

    #[test]
    fn reclaim_leaves_unfinalized_slots() {
        let (mut heap, fence) = heap(2);
        let held = heap.acquire().unwrap();
        fence.retire_all(ENGINE);

        assert_eq!(heap.reclaim(), 0);
        assert!(heap.slot_status(held.index()).unwrap().busy);

        heap.abandon(held).unwrap();
        assert_eq!(heap.busy_slots(), 0);
    }

    #[test]
    fn finalize_records_pending_tag() {
        let (mut heap, fence) = heap(2);
        let slot = heap.acquire().unwrap();
        let later = fence.reserve_next_tag(ENGINE);
        heap.finalize(slot, later).unwrap();

        let status = heap.slot_status(0).unwrap();
        assert!(status.busy);
        assert!(status.finalized);
        assert_eq!(status.pending_tag, later);
    }

    #[test]
    fn finalize_rejects_foreign_token() {
        let (mut a, fence) = heap(1);
        let (mut b, _) = heap(1);

        let slot = a.acquire().unwrap();
        assert!(matches!(
            b.finalize(slot, 1),
            Err(EngineError::ForeignSlot { .. })
        ));

        // The rejected token was consumed; the slot still holds its reserved tag.
        fence.retire_all(ENGINE);
        let fresh = a.acquire().unwrap();
        let tag = fresh.tag();
        a.finalize(fresh, tag).unwrap();
        fence.retire_all(ENGINE);
        let newest = a.acquire().unwrap();
        assert_eq!(newest.index(), 0);
    }

    #[test]
    fn stale_token_cannot_write() {
        let (mut heap, fence) = heap(1);
        let old = heap.acquire().unwrap();
        fence.retire_all(ENGINE);
        let _current = heap.acquire().unwrap();

        assert!(matches!(
            heap.writer(&old).err(),
            Some(EngineError::StaleSlot { held: 1, current: 2, .. })
        ));
    }

    #[test]
    fn reclaim_sweeps_retired_slots() {
        let (mut heap, fence) = heap(4);
        for _ in 0..3 {
            let slot = heap.acquire().unwrap();
            let tag = slot.tag();
            heap.finalize(slot, tag).unwrap();
        }
        fence.signal(ENGINE, 2);

        assert_eq!(heap.reclaim(), 2);
        let stats = heap.stats();
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.free, 3);
    }

    #[test]
    fn destroy_refuses_while_in_flight() {
        let (mut heap, fence) = heap(2);
        let slot = heap.acquire().unwrap();
        let tag = slot.tag();
        heap.finalize(slot, tag).unwrap();

        assert!(matches!(
            heap.destroy(),
            Err(EngineError::HeapInUse { busy: 1, .. })
        ));
        assert!(!heap.is_destroyed());

        fence.signal(ENGINE, tag);
        heap.destroy().unwrap();
        assert!(heap.is_destroyed());
        assert!(matches!(
            heap.acquire(),
            Err(EngineError::HeapDestroyed { .. })
        ));
    }

    #[test]
    fn wait_idle_times_out_then_succeeds() {
        let (mut heap, fence) = heap(2);
        let slot = heap.acquire().unwrap();
        let tag = slot.tag();
        heap.finalize(slot, tag).unwrap();

        assert!(heap.wait_idle(Duration::from_millis(5)).is_err());
        fence.signal(ENGINE, tag);
        heap.wait_idle(Duration::from_millis(5)).unwrap();
        assert_eq!(heap.busy_slots(), 0);
    }

    #[test]
    fn tags_start_above_sync_base() {
        let fence = SimFence::new();
        fence.signal(ENGINE, 41);
        let mut heap = StateHeap::create(
            &small_sizes(),
            2,
            &SystemAllocator::new(),
            FenceTracker::new(fence.clone(), ENGINE),
            fast_options(),
        )
        .unwrap();
        assert_eq!(heap.sync_tag_base(), 41);
        let slot = heap.acquire().unwrap();
        assert!(slot.tag() > heap.sync_tag_base());
    }
}
