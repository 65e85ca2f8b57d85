//! Error taxonomy for the engine core.
//!
//! The four failure kinds that callers must handle are `Allocation`,
//! `Timeout`, `Configuration` and `PartialWaveFailure`. Nothing in the core
//! retries on any of them; retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::state_heap::SubRegionKind;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Backing memory unavailable: requested {requested} bytes (align {alignment}): {reason}")]
    Allocation {
        requested: usize,
        alignment: usize,
        reason: String,
    },

    #[error("Engine {engine} slot {slot} did not retire tag {tag} within {waited:?} (completed {completed})")]
    Timeout {
        engine: u32,
        slot: usize,
        tag: u64,
        completed: u64,
        waited: Duration,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Some engines of the wave were submitted, another one failed.
    #[error("Wave {wave} failed on engine {failed_engine} (submitted engines: {submitted:?}): {source}")]
    PartialWaveFailure {
        wave: u64,
        failed_engine: usize,
        submitted: Vec<usize>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Engine {engine} heap still has {busy} slot(s) in flight")]
    HeapInUse { engine: u32, busy: usize },

    #[error("Engine {engine} heap has been destroyed")]
    HeapDestroyed { engine: u32 },

    #[error("Slot {slot} does not belong to heap {heap}")]
    ForeignSlot { heap: u64, slot: usize },

    #[error("Slot {slot} is not currently acquired")]
    SlotNotBusy { slot: usize },

    #[error("Slot {slot} token is stale (generation {held}, heap is at {current})")]
    StaleSlot { slot: usize, held: u64, current: u64 },

    #[error("Write of {len} bytes at offset {offset} overflows {kind:?} region of {size} bytes")]
    RegionOverflow {
        kind: SubRegionKind,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Wave {wave}: {reason}")]
    WaveState { wave: u64, reason: String },

    #[error("Command encoding failed on engine {engine}: {reason}")]
    Encode { engine: usize, reason: String },

    #[error("Submission rejected for engine {engine}: {reason}")]
    Submit { engine: u32, reason: String },

    #[error("Failed to access config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[source] Arc<serde_json::Error>),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigParse(Arc::new(err))
    }
}

impl EngineError {
    /// True for errors that invalidate the whole wave rather than one call.
    ///
    /// A wave that failed before any engine reached the sink reports its
    /// engine's own error, so build and submission errors count here too.
    pub fn is_fatal_for_wave(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::Timeout { .. }
                | Self::PartialWaveFailure { .. }
                | Self::RegionOverflow { .. }
                | Self::Encode { .. }
                | Self::Submit { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_fatal_for_wave() {
        let err = EngineError::Timeout {
            engine: 1,
            slot: 3,
            tag: 42,
            completed: 40,
            waited: Duration::from_millis(5),
        };
        assert!(err.is_fatal_for_wave());
        assert!(err.to_string().contains("tag 42"));
    }

    #[test]
    fn partial_failure_keeps_its_cause() {
        let err = EngineError::PartialWaveFailure {
            wave: 3,
            failed_engine: 2,
            submitted: vec![0, 1],
            source: Box::new(EngineError::Configuration("bad".into())),
        };
        let cause = std::error::Error::source(&err).unwrap();
        assert!(cause.to_string().contains("bad"));
        assert!(err.clone().to_string().contains("engine 2"));
    }

    #[test]
    fn configuration_is_not_wave_fatal() {
        let err = EngineError::Configuration("width 0".into());
        assert!(!err.is_fatal_for_wave());
    }

    #[test]
    fn sink_rejection_is_wave_fatal() {
        let err = EngineError::Submit {
            engine: 0,
            reason: "queue full".into(),
        };
        assert!(err.is_fatal_for_wave());
    }
}
