//! # Multi-Engine Partitioning
//!
//! Splits one frame's width into per-engine column ranges:
//!
//! ```text
//!  0          m          2m         width-1
//!  ├──────────┼──────────┼────────────┤
//!  │ engine 0 │ engine 1 │ engine 2   │   last engine absorbs the remainder
//!  └──────────┴──────────┴────────────┘
//!             ◄q┤        ◄q┤              scaler overfetch (left / right)
//! ```
//!
//! `m` is `width / engines` floored to the alignment quantum `q`. When a
//! scaler is chained behind the engines, every interior boundary gets `q`
//! extra input columns on each side, provided `q` fits the overfetch budget.
//! The processing ranges themselves never change.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Most engine instances one frame can be split across.
pub const MAX_ENGINES: usize = 4;

/// Round `value` down to a multiple of `quantum`.
pub fn floor_align(value: u32, quantum: u32) -> u32 {
    debug_assert!(quantum > 0);
    value / quantum * quantum
}

// ============================================================================
// Ranges
// ============================================================================

/// Columns one engine instance processes, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub engine_index: usize,
    pub start_column: u32,
    pub end_column_inclusive: u32,
}

impl PartitionRange {
    pub fn len(&self) -> u32 {
        self.end_column_inclusive - self.start_column + 1
    }
}

/// Input window a chained scaler reads for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverfetchWindow {
    pub engine_index: usize,
    pub fetch_start: u32,
    pub fetch_end_inclusive: u32,
    pub left_overfetch: u32,
    pub right_overfetch: u32,
}

impl OverfetchWindow {
    /// Start column used for scaler addressing (left overfetch applied).
    pub fn scaler_start_column(&self) -> u32 {
        self.fetch_start
    }
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub width: u32,
    pub alignment_quantum: u32,
    /// Aligned per-engine width; equals `width` for a single engine.
    pub medium_x: u32,
    ranges: Vec<PartitionRange>,
    overfetch: Vec<OverfetchWindow>,
}

impl PartitionPlan {
    pub fn engine_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[PartitionRange] {
        &self.ranges
    }

    pub fn range(&self, engine_index: usize) -> Option<&PartitionRange> {
        self.ranges.get(engine_index)
    }

    /// True when scaler overfetch windows were computed for this plan.
    pub fn has_overfetch(&self) -> bool {
        !self.overfetch.is_empty()
    }

    pub fn overfetch_window(&self, engine_index: usize) -> Option<&OverfetchWindow> {
        self.overfetch.get(engine_index)
    }

    /// Scaler-side start for `engine_index`; the processing start when no overfetch applies.
    pub fn scaler_start_column(&self, engine_index: usize) -> Option<u32> {
        match self.overfetch.get(engine_index) {
            Some(window) => Some(window.scaler_start_column()),
            None => self.ranges.get(engine_index).map(|r| r.start_column),
        }
    }

    /// Check the processing ranges cover `[0, width)` exactly once.
    ///
    /// Every range but the last must also be a whole number of quanta.
    pub fn check_coverage(&self, width: u32) -> Result<()> {
        let fail = |msg: String| Err(EngineError::Configuration(format!("partition coverage: {}", msg)));

        if width == 0 || self.ranges.is_empty() {
            return fail("empty plan".into());
        }

        let mut expected_start = 0u32;
        let last = self.ranges.len() - 1;
        for (i, range) in self.ranges.iter().enumerate() {
            if range.engine_index != i {
                return fail(format!("range {} tagged for engine {}", i, range.engine_index));
            }
            if range.start_column != expected_start {
                return fail(format!(
                    "engine {} starts at {} (expected {})",
                    i, range.start_column, expected_start
                ));
            }
            if range.end_column_inclusive < range.start_column {
                return fail(format!("engine {} range is inverted", i));
            }
            if range.len() < self.alignment_quantum {
                return fail(format!(
                    "engine {} covers {} columns, below quantum {}",
                    i,
                    range.len(),
                    self.alignment_quantum
                ));
            }
            if i != last && range.len() % self.alignment_quantum != 0 {
                return fail(format!("engine {} length {} is unaligned", i, range.len()));
            }
            expected_start = range.end_column_inclusive + 1;
        }

        if expected_start != width {
            return fail(format!("ranges end at {} for width {}", expected_start, width));
        }
        Ok(())
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Deterministic width splitter for 1..=4 engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlanner {
    /// Largest overfetch (columns per side) a chained scaler may be given.
    pub overfetch_budget: u32,
}

impl PartitionPlanner {
    pub fn new(overfetch_budget: u32) -> Self {
        Self { overfetch_budget }
    }

    pub fn plan(
        &self,
        width: u32,
        engine_count: usize,
        alignment_quantum: u32,
        uses_secondary_scaler: bool,
    ) -> Result<PartitionPlan> {
        validate(width, engine_count, alignment_quantum)?;

        if engine_count == 1 {
            return Ok(PartitionPlan {
                width,
                alignment_quantum,
                medium_x: width,
                ranges: vec![PartitionRange {
                    engine_index: 0,
                    start_column: 0,
                    end_column_inclusive: width - 1,
                }],
                overfetch: Vec::new(),
            });
        }

        let q = alignment_quantum;
        let engines = engine_count as u32;
        let medium_x = floor_align(width / engines, q)
            .max(q)
            .min(width - (q - 1));

        let last = engine_count - 1;
        let ranges: Vec<PartitionRange> = (0..engine_count)
            .map(|i| {
                let start = i as u32 * medium_x;
                let end = if i == last {
                    width - 1
                } else {
                    (i as u32 + 1) * medium_x - 1
                };
                PartitionRange {
                    engine_index: i,
                    start_column: start,
                    end_column_inclusive: end,
                }
            })
            .collect();

        let overfetch = if !uses_secondary_scaler {
            Vec::new()
        } else if q > self.overfetch_budget {
            tracing::warn!(
                "Scaler overfetch of {} columns exceeds budget {}; scaler reads processing ranges only",
                q,
                self.overfetch_budget
            );
            Vec::new()
        } else {
            ranges
                .iter()
                .map(|r| {
                    let left = if r.engine_index > 0 { q } else { 0 };
                    let right = if r.engine_index < last { q } else { 0 };
                    OverfetchWindow {
                        engine_index: r.engine_index,
                        fetch_start: r.start_column - left,
                        fetch_end_inclusive: (r.end_column_inclusive + right).min(width - 1),
                        left_overfetch: left,
                        right_overfetch: right,
                    }
                })
                .collect()
        };

        tracing::debug!(
            "Partitioned width {} across {} engines (medium {}, overfetch {})",
            width,
            engine_count,
            medium_x,
            !overfetch.is_empty()
        );

        Ok(PartitionPlan {
            width,
            alignment_quantum,
            medium_x,
            ranges,
            overfetch,
        })
    }
}

fn validate(width: u32, engine_count: usize, alignment_quantum: u32) -> Result<()> {
    if width == 0 {
        return Err(EngineError::Configuration("frame width must be positive".into()));
    }
    if engine_count == 0 || engine_count > MAX_ENGINES {
        return Err(EngineError::Configuration(format!(
            "engine count {} outside 1..={}",
            engine_count, MAX_ENGINES
        )));
    }
    if alignment_quantum == 0 {
        return Err(EngineError::Configuration("alignment quantum must be positive".into()));
    }
    let needed = alignment_quantum as u64 * engine_count as u64;
    if (width as u64) < needed {
        return Err(EngineError::Configuration(format!(
            "width {} cannot hold {} engines x {} aligned columns",
            width, engine_count, alignment_quantum
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
