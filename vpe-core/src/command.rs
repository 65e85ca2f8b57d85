//! # Command Streams
//!
//! The boundary to the command-encoding layer. The coordinator drives a
//! [`CommandEncoder`] through a fixed sequence per engine:
//!
//! ```text
//! begin → [WaveStart barrier] → bind heap → surfaces → range → workload
//!       → [WaveJoin barrier] → store tag → finish
//! ```
//!
//! Barriers appear only in multi-engine waves: `WaveStart` at the head of
//! the first engine's stream, `WaveJoin` at the tail of the last one.
//! [`RecordingEncoder`] keeps the calls as [`CommandOp`]s instead of
//! hardware packets.

use serde::{Deserialize, Serialize};

use crate::assignment::EngineAssignment;
use crate::error::{EngineError, Result};
use crate::fence::EngineHandle;
use crate::memory::align_up;
use crate::partition::{OverfetchWindow, PartitionRange};
use crate::state_heap::{StateSlot, SubRegionKind};

// ============================================================================
// Surfaces
// ============================================================================

/// Role of a surface in one processing pass. Declaration order is emit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SurfaceKind {
    Input,
    Output,
    DenoiseReference,
    Statistics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Nv12,
    P010,
    Yuy2,
    Argb8888,
    /// Linear buffer, one byte per element
    Buffer,
}

impl SurfaceFormat {
    /// Bytes per pixel of the first plane.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Nv12 | Self::Buffer => 1,
            Self::P010 | Self::Yuy2 => 2,
            Self::Argb8888 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceDescriptor {
    pub kind: SurfaceKind,
    pub gpu_address: u64,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes
    pub pitch: u32,
    pub format: SurfaceFormat,
}

impl SurfaceDescriptor {
    /// Row pitch used when none is given
    pub const PITCH_ALIGNMENT: u32 = 64;

    pub fn new(kind: SurfaceKind, gpu_address: u64, width: u32, height: u32, format: SurfaceFormat) -> Self {
        let row = width as usize * format.bytes_per_pixel() as usize;
        Self {
            kind,
            gpu_address,
            width,
            height,
            pitch: align_up(row, Self::PITCH_ALIGNMENT as usize) as u32,
            format,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Barrier {
    /// Cross-engine sync point ahead of any engine's work.
    WaveStart { wave: u64, participants: usize },
    /// Join after the last engine; downstream consumers wait on it.
    WaveJoin { wave: u64, participants: usize },
}

/// Engine-visible addresses of one acquired state instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBinding {
    pub slot_index: usize,
    pub base_address: u64,
    pub regions: [(SubRegionKind, u64); 7],
}

impl StateBinding {
    pub fn from_slot(slot: &StateSlot) -> Self {
        let regions = SubRegionKind::ALL.map(|kind| (kind, slot.region_address(kind)));
        Self {
            slot_index: slot.index(),
            base_address: slot.base_address(),
            regions,
        }
    }

    pub fn region_address(&self, kind: SubRegionKind) -> u64 {
        self.regions
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, address)| *address)
            .unwrap_or(self.base_address)
    }
}

/// Work one engine executes: its column span of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub columns: u32,
    pub rows: u32,
}

/// One recorded encoder call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOp {
    Begin { engine: u32, assignment: EngineAssignment },
    Barrier(Barrier),
    BindStateHeap(StateBinding),
    Surface(SurfaceDescriptor),
    Partition {
        range: PartitionRange,
        overfetch: Option<OverfetchWindow>,
    },
    Workload(Workload),
    StoreTag(u64),
}

/// Finished stream for one engine, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandStream {
    pub engine_index: usize,
    pub engine: EngineHandle,
    /// Tag written back when the engine reaches the end of the stream
    pub signal_tag: u64,
    pub ops: Vec<CommandOp>,
}

impl CommandStream {
    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> {
        self.ops.iter().filter_map(|op| match op {
            CommandOp::Barrier(b) => Some(b),
            _ => None,
        })
    }

    pub fn partition(&self) -> Option<&PartitionRange> {
        self.ops.iter().find_map(|op| match op {
            CommandOp::Partition { range, .. } => Some(range),
            _ => None,
        })
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Command-encoding layer. One stream is open at a time.
pub trait CommandEncoder: Send {
    /// Start a stream for `engine`; discards any unfinished one.
    fn begin(&mut self, engine: EngineHandle, assignment: &EngineAssignment) -> Result<()>;

    fn barrier(&mut self, barrier: Barrier) -> Result<()>;

    /// Point the engine at the sub-regions of one state instance.
    fn bind_state_heap(&mut self, binding: &StateBinding) -> Result<()>;

    fn surface_state(&mut self, surface: &SurfaceDescriptor) -> Result<()>;

    /// Restrict processing to `range`; `overfetch` is the scaler input window.
    fn partition_range(&mut self, range: &PartitionRange, overfetch: Option<&OverfetchWindow>) -> Result<()>;

    fn workload(&mut self, workload: &Workload) -> Result<()>;

    /// Completion bookkeeping: write `tag` back once the engine is done.
    fn store_tag(&mut self, tag: u64) -> Result<()>;

    fn finish(&mut self) -> Result<CommandStream>;

    fn name(&self) -> &str;
}

struct OpenStream {
    engine_index: usize,
    engine: EngineHandle,
    signal_tag: Option<u64>,
    ops: Vec<CommandOp>,
}

/// Encoder that records calls instead of emitting hardware packets.
#[derive(Default)]
pub struct RecordingEncoder {
    open: Option<OpenStream>,
    finished: u64,
}

impl RecordingEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams completed through `finish`.
    pub fn finished(&self) -> u64 {
        self.finished
    }

    fn push(&mut self, op: CommandOp) -> Result<()> {
        match self.open.as_mut() {
            Some(stream) => {
                stream.ops.push(op);
                Ok(())
            }
            None => Err(EngineError::Encode {
                engine: usize::MAX,
                reason: "no stream open".into(),
            }),
        }
    }
}

impl CommandEncoder for RecordingEncoder {
    fn begin(&mut self, engine: EngineHandle, assignment: &EngineAssignment) -> Result<()> {
        if let Some(stale) = self.open.take() {
            tracing::debug!("Discarding unfinished stream for {}", stale.engine);
        }
        self.open = Some(OpenStream {
            engine_index: assignment.this_engine_index,
            engine,
            signal_tag: None,
            ops: vec![CommandOp::Begin {
                engine: engine.0,
                assignment: *assignment,
            }],
        });
        Ok(())
    }

    fn barrier(&mut self, barrier: Barrier) -> Result<()> {
        self.push(CommandOp::Barrier(barrier))
    }

    fn bind_state_heap(&mut self, binding: &StateBinding) -> Result<()> {
        self.push(CommandOp::BindStateHeap(*binding))
    }

    fn surface_state(&mut self, surface: &SurfaceDescriptor) -> Result<()> {
        self.push(CommandOp::Surface(*surface))
    }

    fn partition_range(&mut self, range: &PartitionRange, overfetch: Option<&OverfetchWindow>) -> Result<()> {
        self.push(CommandOp::Partition {
            range: *range,
            overfetch: overfetch.copied(),
        })
    }

    fn workload(&mut self, workload: &Workload) -> Result<()> {
        self.push(CommandOp::Workload(*workload))
    }

    fn store_tag(&mut self, tag: u64) -> Result<()> {
        self.push(CommandOp::StoreTag(tag))?;
        if let Some(stream) = self.open.as_mut() {
            stream.signal_tag = Some(tag);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<CommandStream> {
        let stream = self.open.take().ok_or(EngineError::Encode {
            engine: usize::MAX,
            reason: "finish without begin".into(),
        })?;
        let signal_tag = stream.signal_tag.ok_or(EngineError::Encode {
            engine: stream.engine_index,
            reason: "stream has no completion tag".into(),
        })?;
        self.finished += 1;
        Ok(CommandStream {
            engine_index: stream.engine_index,
            engine: stream.engine,
            signal_tag,
            ops: stream.ops,
        })
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> PartitionRange {
        PartitionRange {
            engine_index: 0,
            start_column: 0,
            end_column_inclusive: 959,
        }
    }

    #[test]
    fn records_calls_in_order() {
        let mut enc = RecordingEncoder::new();
        let assignment = EngineAssignment::new(2, false).unwrap();
        enc.begin(EngineHandle(0), &assignment).unwrap();
        enc.barrier(Barrier::WaveStart { wave: 1, participants: 2 }).unwrap();
        enc.partition_range(&range(), None).unwrap();
        enc.workload(&Workload { columns: 960, rows: 1080 }).unwrap();
        enc.store_tag(7).unwrap();

        let stream = enc.finish().unwrap();
        assert_eq!(stream.signal_tag, 7);
        assert_eq!(stream.ops.len(), 5);
        assert!(matches!(stream.ops[0], CommandOp::Begin { engine: 0, .. }));
        assert_eq!(stream.barriers().count(), 1);
        assert_eq!(stream.partition(), Some(&range()));
        assert_eq!(enc.finished(), 1);
    }

    #[test]
    fn finish_requires_tag() {
        let mut enc = RecordingEncoder::new();
        enc.begin(EngineHandle(1), &EngineAssignment::new(1, false).unwrap())
            .unwrap();
        assert!(matches!(enc.finish(), Err(EngineError::Encode { engine: 0, .. })));
    }

    #[test]
    fn calls_outside_stream_fail() {
        let mut enc = RecordingEncoder::new();
        assert!(enc.store_tag(1).is_err());
        assert!(enc.finish().is_err());
    }

    #[test]
    fn pitch_is_aligned() {
        let s = SurfaceDescriptor::new(SurfaceKind::Input, 0x1000, 1919, 1080, SurfaceFormat::P010);
        assert_eq!(s.pitch, 3840);
        let s = SurfaceDescriptor::new(SurfaceKind::Output, 0x1000, 100, 10, SurfaceFormat::Nv12);
        assert_eq!(s.pitch, 128);
    }
}
