//! # VPE Core
//!
//! Engine state heap and multi-engine scalability for a fixed-function
//! video enhancement engine.

// ============================================================================
// Foundations
// ============================================================================
pub mod error;
pub mod config;
pub mod fence;
pub mod memory;

// ============================================================================
// Engine State
// ============================================================================
pub mod state_heap;

// ============================================================================
// Scalability
// ============================================================================
pub mod partition;
pub mod assignment;

// ============================================================================
// Submission
// ============================================================================
pub mod command;
pub mod submission;

pub use assignment::EngineAssignment;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use fence::{EngineHandle, FenceSource, FenceTracker, SimFence};
pub use memory::{BackingAllocator, BackingMemory, SystemAllocator};
pub use partition::{OverfetchWindow, PartitionPlan, PartitionPlanner, PartitionRange};
pub use state_heap::{HeapOptions, HeapStats, SlotWriter, StateHeap, StateSlot, SubRegionKind, SubRegionSizes};
pub use submission::{
    EngineContext, EngineInstance, RecordingSink, SubmissionCoordinator, SubmissionSink, Wave, WaveReport,
    WaveRequest, WaveStatus,
};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
