//! Engine selection for one submission wave.
//!
//! Written once when a wave is planned and read-only afterwards. Each engine's
//! build gets its own copy with `this_engine_index` filled in.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::partition::MAX_ENGINES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAssignment {
    pub enabled_engine_count: usize,
    pub this_engine_index: usize,
    pub uses_secondary_scaler: bool,
}

impl EngineAssignment {
    pub fn new(enabled_engine_count: usize, uses_secondary_scaler: bool) -> Result<Self> {
        if enabled_engine_count == 0 || enabled_engine_count > MAX_ENGINES {
            return Err(EngineError::Configuration(format!(
                "engine count {} outside 1..={}",
                enabled_engine_count, MAX_ENGINES
            )));
        }
        Ok(Self {
            enabled_engine_count,
            this_engine_index: 0,
            uses_secondary_scaler,
        })
    }

    /// Same assignment viewed from `index`.
    pub fn for_engine(&self, index: usize) -> Result<Self> {
        if index >= self.enabled_engine_count {
            return Err(EngineError::Configuration(format!(
                "engine index {} out of range for {} engine(s)",
                index, self.enabled_engine_count
            )));
        }
        Ok(Self {
            this_engine_index: index,
            ..*self
        })
    }

    /// More than one engine shares the frame.
    pub fn is_scalable(&self) -> bool {
        self.enabled_engine_count > 1
    }

    pub fn is_first(&self) -> bool {
        self.this_engine_index == 0
    }

    pub fn is_last(&self) -> bool {
        self.this_engine_index + 1 == self.enabled_engine_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_engine_view() {
        let wave = EngineAssignment::new(3, true).unwrap();
        assert!(wave.is_scalable());

        let middle = wave.for_engine(1).unwrap();
        assert!(!middle.is_first() && !middle.is_last());
        assert!(middle.uses_secondary_scaler);
        assert!(wave.for_engine(2).unwrap().is_last());
        assert!(wave.for_engine(3).is_err());
    }

    #[test]
    fn single_engine_is_first_and_last() {
        let solo = EngineAssignment::new(1, false).unwrap();
        assert!(!solo.is_scalable());
        assert!(solo.is_first() && solo.is_last());
    }

    #[test]
    fn rejects_out_of_range_counts() {
        assert!(EngineAssignment::new(0, false).is_err());
        assert!(EngineAssignment::new(MAX_ENGINES + 1, false).is_err());
    }
}
