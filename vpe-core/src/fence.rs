//! # Completion Fences
//!
//! The OS/graphics-kernel layer hands out monotonically increasing completion
//! tags per engine and writes back the last completed one. Tags are
//! cumulative: once tag `T` completes, every tag `<= T` is retired too.
//!
//! - [`FenceSource`]: the primitive supplied by the kernel layer
//! - [`FenceTracker`]: per-engine view answering "has tag T retired?"
//! - [`SimFence`]: in-process source used by tests and the simulator

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Engine Handle
// ============================================================================

/// Identifies one physical engine instance to the kernel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineHandle(pub u32);

impl std::fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine{}", self.0)
    }
}

// ============================================================================
// Fence Source
// ============================================================================

/// Fence query primitive supplied by the kernel layer.
pub trait FenceSource: Send + Sync {
    /// Last tag the engine has written back.
    fn query_completed_tag(&self, engine: EngineHandle) -> u64;

    /// Reserve the tag the next submission on `engine` will signal.
    fn reserve_next_tag(&self, engine: EngineHandle) -> u64;
}

// ============================================================================
// Fence Tracker
// ============================================================================

/// Per-engine wrapper over a [`FenceSource`].
///
/// The tracker remembers the highest completed value it has observed, so a
/// source that briefly reports a stale value never makes a retired tag look
/// live again.
pub struct FenceTracker {
    source: Arc<dyn FenceSource>,
    engine: EngineHandle,
    highest_seen: AtomicU64,
}

impl FenceTracker {
    pub fn new(source: Arc<dyn FenceSource>, engine: EngineHandle) -> Self {
        let initial = source.query_completed_tag(engine);
        Self {
            source,
            engine,
            highest_seen: AtomicU64::new(initial),
        }
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine
    }

    /// Current completed value, never lower than a previously observed one.
    pub fn completed(&self) -> u64 {
        let reported = self.source.query_completed_tag(self.engine);
        let previous = self.highest_seen.fetch_max(reported, Ordering::AcqRel);
        if reported < previous {
            tracing::warn!(
                "{} fence went backwards: reported {} after {}",
                self.engine,
                reported,
                previous
            );
            previous
        } else {
            reported
        }
    }

    pub fn is_retired(&self, tag: u64) -> bool {
        self.completed() >= tag
    }

    pub fn reserve(&self) -> u64 {
        self.source.reserve_next_tag(self.engine)
    }

    /// Poll until `tag` retires or `timeout` elapses.
    ///
    /// Returns the last completed value observed in the `Err` case.
    pub fn wait_retired(&self, tag: u64, timeout: Duration, poll_interval: Duration) -> Result<u64, u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let completed = self.completed();
            if completed >= tag {
                return Ok(completed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(completed);
            }
            std::thread::sleep(poll_interval.min(remaining));
        }
    }
}

impl std::fmt::Debug for FenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceTracker")
            .field("engine", &self.engine)
            .field("highest_seen", &self.highest_seen.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Simulated Fence
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct EngineCounters {
    completed: u64,
    last_reserved: u64,
}

/// Thread-safe in-process fence source.
///
/// Stands in for the kernel layer: `reserve_next_tag` hands out increasing
/// tags per engine and [`SimFence::signal`] plays the part of the engine
/// writing back a completion.
#[derive(Default)]
pub struct SimFence {
    engines: Mutex<HashMap<EngineHandle, EngineCounters>>,
}

impl SimFence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark everything up to `tag` complete on `engine`. Lower values are ignored.
    pub fn signal(&self, engine: EngineHandle, tag: u64) {
        let mut engines = self.engines.lock();
        let counters = engines.entry(engine).or_default();
        counters.completed = counters.completed.max(tag);
    }

    /// Complete every tag reserved so far on `engine`.
    pub fn retire_all(&self, engine: EngineHandle) {
        let mut engines = self.engines.lock();
        let counters = engines.entry(engine).or_default();
        counters.completed = counters.completed.max(counters.last_reserved);
    }

    pub fn last_reserved(&self, engine: EngineHandle) -> u64 {
        self.engines.lock().get(&engine).map(|c| c.last_reserved).unwrap_or(0)
    }
}

impl FenceSource for SimFence {
    fn query_completed_tag(&self, engine: EngineHandle) -> u64 {
        self.engines.lock().get(&engine).map(|c| c.completed).unwrap_or(0)
    }

    fn reserve_next_tag(&self, engine: EngineHandle) -> u64 {
        let mut engines = self.engines.lock();
        let counters = engines.entry(engine).or_default();
        counters.last_reserved = counters.last_reserved.max(counters.completed) + 1;
        counters.last_reserved
    }
}

// ============================================================================
// Tests
// ============================================================================
