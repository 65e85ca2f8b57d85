//! # Submission Coordinator
//!
//! Drives one submission wave across the active engine instances:
//!
//! ```text
//! Idle → Planning → PerEngineBuild (×N) → Barrier? → Submitted → AwaitingCompletion → Idle
//! ```
//!
//! - Planning errors leave every heap and the sink untouched.
//! - Engines are built in index order, each from its own heap. A slot is
//!   finalized with its stream's tag once the sink accepts the stream, and
//!   abandoned if the build or the sink fails.
//! - If engine `k` fails, engines `0..k` are still submitted and the wave is
//!   reported as [`EngineError::PartialWaveFailure`]. When nothing reached
//!   the sink, the failing engine's own error is returned instead.
//! - Completion is not awaited. It is observed by the next `acquire` on each
//!   heap, or explicitly through [`SubmissionCoordinator::poll_wave`].

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assignment::EngineAssignment;
use crate::command::{Barrier, CommandEncoder, CommandStream, StateBinding, SurfaceDescriptor, Workload};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fence::{EngineHandle, FenceSource, FenceTracker};
use crate::memory::BackingAllocator;
use crate::partition::{OverfetchWindow, PartitionPlan, PartitionPlanner, PartitionRange, MAX_ENGINES};
use crate::state_heap::{SlotWriter, StateHeap, StateSlot};

// ============================================================================
// Submission Sink
// ============================================================================

/// Kernel-layer submission primitive.
pub trait SubmissionSink: Send {
    /// Queue `stream` for execution on `stream.engine`.
    fn submit(&mut self, stream: &CommandStream) -> Result<()>;
}

/// Sink that keeps every submitted stream. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    submitted: Arc<Mutex<Vec<CommandStream>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<CommandStream> {
        self.submitted.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubmissionSink for RecordingSink {
    fn submit(&mut self, stream: &CommandStream) -> Result<()> {
        self.submitted.lock().push(stream.clone());
        Ok(())
    }
}

// ============================================================================
// Wave Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WavePhase {
    Idle,
    Planning,
    PerEngineBuild,
    /// Every engine of a multi-engine wave is built, join barrier included
    Barrier,
    Submitted,
    AwaitingCompletion,
}

/// What the caller wants processed in one wave.
#[derive(Debug, Clone)]
pub struct WaveRequest {
    pub width: u32,
    pub height: u32,
    pub uses_secondary_scaler: bool,
    pub surfaces: Vec<SurfaceDescriptor>,
}

impl WaveRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            uses_secondary_scaler: false,
            surfaces: Vec::new(),
        }
    }

    pub fn with_scaler(mut self, enabled: bool) -> Self {
        self.uses_secondary_scaler = enabled;
        self
    }

    pub fn with_surface(mut self, surface: SurfaceDescriptor) -> Self {
        self.surfaces.push(surface);
        self
    }
}

/// Everything the state writer for one engine needs to know.
#[derive(Debug, Clone, Copy)]
pub struct EngineContext {
    pub wave: u64,
    pub assignment: EngineAssignment,
    pub range: PartitionRange,
    pub overfetch: Option<OverfetchWindow>,
    pub rows: u32,
    pub slot_index: usize,
    /// Tag the engine's stream will signal
    pub tag: u64,
}

/// A wave between `begin_wave` and `submit`.
///
/// Must be handed back to [`SubmissionCoordinator::submit`]; the coordinator
/// refuses to plan another wave while one is open.
#[derive(Debug)]
pub struct Wave {
    id: u64,
    request: WaveRequest,
    plan: PartitionPlan,
    assignment: EngineAssignment,
    staged: Vec<StagedEngine>,
    failure: Option<(usize, EngineError)>,
}

/// An encoded stream and the slot it references, held until submit.
#[derive(Debug)]
struct StagedEngine {
    stream: CommandStream,
    slot: StateSlot,
}

impl Wave {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn assignment(&self) -> &EngineAssignment {
        &self.assignment
    }

    pub fn request(&self) -> &WaveRequest {
        &self.request
    }

    /// Index of the engine `build_engine` expects next.
    pub fn next_engine(&self) -> usize {
        self.staged.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Streams built so far, in engine order.
    pub fn staged(&self) -> impl Iterator<Item = &CommandStream> {
        self.staged.iter().map(|staged| &staged.stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmittedEngine {
    pub engine_index: usize,
    pub engine: EngineHandle,
    pub tag: u64,
}

/// Receipt for a submitted wave.
#[derive(Debug, Clone)]
pub struct WaveReport {
    pub wave: u64,
    pub engines: Vec<SubmittedEngine>,
    pub submitted_at: Instant,
    /// Watchdog deadline; only armed for multi-engine waves
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveStatus {
    Pending,
    Complete,
    TimedOut { hung_engines: Vec<usize> },
}

// ============================================================================
// Coordinator
// ============================================================================

/// One engine instance and the heap it owns exclusively.
#[derive(Debug)]
pub struct EngineInstance {
    handle: EngineHandle,
    heap: StateHeap,
}

impl EngineInstance {
    pub fn new(heap: StateHeap) -> Self {
        Self {
            handle: heap.engine(),
            heap,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }

    pub fn heap(&self) -> &StateHeap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut StateHeap {
        &mut self.heap
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub alignment_quantum: u32,
    pub overfetch_budget: u32,
    pub watchdog: Duration,
}

impl From<&EngineConfig> for CoordinatorOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            alignment_quantum: config.alignment_quantum,
            overfetch_budget: config.overfetch_budget,
            watchdog: config.wave_watchdog(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub waves_begun: u64,
    pub waves_submitted: u64,
    pub waves_failed: u64,
    pub planning_failures: u64,
    pub streams_submitted: u64,
    pub watchdog_timeouts: u64,
}

pub struct SubmissionCoordinator {
    engines: Vec<EngineInstance>,
    planner: PartitionPlanner,
    options: CoordinatorOptions,
    encoder: Box<dyn CommandEncoder>,
    sink: Box<dyn SubmissionSink>,
    phase: WavePhase,
    open_wave: Option<u64>,
    last_submitted: Option<u64>,
    last_timed_out: Option<u64>,
    next_wave: u64,
    stats: CoordinatorStats,
}

impl SubmissionCoordinator {
    pub fn new(
        engines: Vec<EngineInstance>,
        encoder: Box<dyn CommandEncoder>,
        sink: Box<dyn SubmissionSink>,
        options: CoordinatorOptions,
    ) -> Result<Self> {
        if engines.is_empty() || engines.len() > MAX_ENGINES {
            return Err(EngineError::Configuration(format!(
                "{} engine instance(s) given, expected 1..={}",
                engines.len(),
                MAX_ENGINES
            )));
        }
        for (i, engine) in engines.iter().enumerate() {
            if engines[..i].iter().any(|e| e.handle == engine.handle) {
                return Err(EngineError::Configuration(format!(
                    "{} appears twice; heaps are never shared",
                    engine.handle
                )));
            }
        }
        if options.alignment_quantum == 0 {
            return Err(EngineError::Configuration("alignment quantum must be positive".into()));
        }

        tracing::info!(
            "Submission coordinator: {} engine(s), quantum {}, encoder {}",
            engines.len(),
            options.alignment_quantum,
            encoder.name()
        );

        Ok(Self {
            planner: PartitionPlanner::new(options.overfetch_budget),
            engines,
            options,
            encoder,
            sink,
            phase: WavePhase::Idle,
            open_wave: None,
            last_submitted: None,
            last_timed_out: None,
            next_wave: 1,
            stats: CoordinatorStats::default(),
        })
    }

    /// Create one heap per engine (`EngineHandle(0..engine_count)`) from `config`.
    pub fn from_config(
        config: &EngineConfig,
        fence: Arc<dyn FenceSource>,
        allocator: &dyn BackingAllocator,
        encoder: Box<dyn CommandEncoder>,
        sink: Box<dyn SubmissionSink>,
    ) -> Result<Self> {
        config.validate()?;
        let engines = (0..config.engine_count)
            .map(|i| {
                let tracker = FenceTracker::new(fence.clone(), EngineHandle(i as u32));
                StateHeap::create(
                    &config.sub_region_sizes,
                    config.heap_capacity,
                    allocator,
                    tracker,
                    config.heap_options(),
                )
                .map(EngineInstance::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(engines, encoder, sink, CoordinatorOptions::from(config))
    }

    // ========================================================================
    // Wave Lifecycle
    // ========================================================================

    /// Plan a wave. On error nothing has been acquired, written or submitted.
    pub fn begin_wave(&mut self, mut request: WaveRequest) -> Result<Wave> {
        if let Some(open) = self.open_wave {
            return Err(EngineError::WaveState {
                wave: open,
                reason: "previous wave was never submitted".into(),
            });
        }

        let previous = self.phase;
        self.phase = WavePhase::Planning;
        let (plan, assignment) = match self.plan_wave(&mut request) {
            Ok(planned) => planned,
            Err(err) => {
                self.phase = previous;
                self.stats.planning_failures += 1;
                tracing::error!("Wave planning failed: {}", err);
                return Err(err);
            }
        };

        let id = self.next_wave;
        self.next_wave += 1;
        self.open_wave = Some(id);
        self.phase = WavePhase::PerEngineBuild;
        self.stats.waves_begun += 1;

        tracing::debug!(
            "Wave {} planned: {}x{} over {} engine(s)",
            id,
            request.width,
            request.height,
            plan.engine_count()
        );

        Ok(Wave {
            id,
            staged: Vec::with_capacity(plan.engine_count()),
            request,
            plan,
            assignment,
            failure: None,
        })
    }

    /// Acquire a slot on `engine_index`, let `write` fill it, and encode the engine's stream.
    ///
    /// Engines must be built in index order. After a failure the wave accepts
    /// no further builds and must be submitted.
    pub fn build_engine<F>(&mut self, wave: &mut Wave, engine_index: usize, write: F) -> Result<()>
    where
        F: FnOnce(&EngineContext, &mut SlotWriter<'_>) -> Result<()>,
    {
        self.check_open(wave)?;
        if let Some((failed, _)) = &wave.failure {
            return Err(EngineError::WaveState {
                wave: wave.id,
                reason: format!("engine {} already failed; submit the wave", failed),
            });
        }
        let expected = wave.next_engine();
        if expected >= wave.plan.engine_count() {
            return Err(EngineError::WaveState {
                wave: wave.id,
                reason: "every engine is already built".into(),
            });
        }
        if engine_index != expected {
            return Err(EngineError::WaveState {
                wave: wave.id,
                reason: format!("engine {} built out of order (expected {})", engine_index, expected),
            });
        }

        match self.build_stream(wave, engine_index, write) {
            Ok(staged) => {
                wave.staged.push(staged);
                if wave.assignment.is_scalable() && wave.next_engine() == wave.plan.engine_count() {
                    self.phase = WavePhase::Barrier;
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!("Wave {} engine {} build failed: {}", wave.id, engine_index, err);
                wave.failure = Some((engine_index, err.clone()));
                Err(err)
            }
        }
    }

    /// Submit every built stream.
    ///
    /// Streams that were built are always submitted, even when another engine
    /// failed or was never built; the wave is then reported as
    /// `PartialWaveFailure`. If no stream was accepted, the error of the
    /// failing engine is returned as is.
    pub fn submit(&mut self, mut wave: Wave) -> Result<WaveReport> {
        self.check_open(&wave)?;
        let engine_count = wave.plan.engine_count();
        let mut failure = wave.failure.take();
        if failure.is_none() && wave.next_engine() < engine_count {
            let missing = wave.next_engine();
            failure = Some((
                missing,
                EngineError::WaveState {
                    wave: wave.id,
                    reason: format!("engine {} was never built", missing),
                },
            ));
        }

        self.phase = WavePhase::Submitted;
        let mut engines = Vec::with_capacity(wave.staged.len());
        for StagedEngine { stream, slot } in wave.staged.drain(..) {
            let accepted = self.sink.submit(&stream);
            let heap = &mut self.engines[stream.engine_index].heap;
            match accepted {
                Ok(()) => {
                    if let Err(err) = heap.finalize(slot, stream.signal_tag) {
                        tracing::error!("Wave {} {} slot not finalized: {}", wave.id, stream.engine, err);
                    }
                    engines.push(SubmittedEngine {
                        engine_index: stream.engine_index,
                        engine: stream.engine,
                        tag: stream.signal_tag,
                    });
                }
                Err(err) => {
                    tracing::error!("Wave {} {} submission rejected: {}", wave.id, stream.engine, err);
                    if let Err(abandon_err) = heap.abandon(slot) {
                        tracing::error!("Wave {} {} slot not released: {}", wave.id, stream.engine, abandon_err);
                    }
                    if failure.is_none() {
                        failure = Some((stream.engine_index, err));
                    }
                }
            }
        }

        let now = Instant::now();
        self.open_wave = None;
        self.stats.streams_submitted += engines.len() as u64;
        self.phase = if engines.is_empty() {
            WavePhase::Idle
        } else {
            self.last_submitted = Some(wave.id);
            WavePhase::AwaitingCompletion
        };

        if let Some((failed_engine, cause)) = failure {
            self.stats.waves_failed += 1;
            let submitted: Vec<usize> = engines.iter().map(|e| e.engine_index).collect();
            if submitted.is_empty() {
                tracing::error!("Wave {} failed on engine {}, nothing submitted: {}", wave.id, failed_engine, cause);
                return Err(cause);
            }
            tracing::error!(
                "Wave {} output invalid: engine {} failed ({}); submitted {:?}",
                wave.id,
                failed_engine,
                cause,
                submitted
            );
            return Err(EngineError::PartialWaveFailure {
                wave: wave.id,
                failed_engine,
                submitted,
                source: Box::new(cause),
            });
        }

        self.stats.waves_submitted += 1;
        tracing::info!("Wave {} submitted to {} engine(s)", wave.id, engines.len());

        Ok(WaveReport {
            wave: wave.id,
            engines,
            submitted_at: now,
            deadline: (engine_count > 1).then(|| now + self.options.watchdog),
        })
    }

    /// Plan, build every engine with `write`, and submit.
    pub fn run_wave<F>(&mut self, request: WaveRequest, mut write: F) -> Result<WaveReport>
    where
        F: FnMut(&EngineContext, &mut SlotWriter<'_>) -> Result<()>,
    {
        let mut wave = self.begin_wave(request)?;
        for index in 0..wave.plan.engine_count() {
            if self.build_engine(&mut wave, index, &mut write).is_err() {
                break;
            }
        }
        self.submit(wave)
    }

    /// Check a submitted wave against the fences without blocking.
    ///
    /// Once the watchdog deadline has passed, engines that have not retired
    /// their tag are reported as hung.
    pub fn poll_wave(&mut self, report: &WaveReport) -> WaveStatus {
        let pending: Vec<usize> = report
            .engines
            .iter()
            .filter(|e| {
                self.engines
                    .get(e.engine_index)
                    .map_or(false, |engine| !engine.heap.fence().is_retired(e.tag))
            })
            .map(|e| e.engine_index)
            .collect();

        if pending.is_empty() {
            if self.last_submitted == Some(report.wave) && self.phase == WavePhase::AwaitingCompletion {
                self.phase = WavePhase::Idle;
            }
            return WaveStatus::Complete;
        }

        match report.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                if self.last_timed_out != Some(report.wave) {
                    self.last_timed_out = Some(report.wave);
                    self.stats.watchdog_timeouts += 1;
                    tracing::error!(
                        "Wave {} watchdog expired; engines {:?} still running",
                        report.wave,
                        pending
                    );
                }
                WaveStatus::TimedOut { hung_engines: pending }
            }
            _ => WaveStatus::Pending,
        }
    }

    /// Wait for every heap to go idle, then release them.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if let Some(open) = self.open_wave {
            return Err(EngineError::WaveState {
                wave: open,
                reason: "cannot shut down with a wave open".into(),
            });
        }
        for engine in &mut self.engines {
            engine.heap.wait_idle(timeout)?;
            engine.heap.destroy()?;
        }
        self.phase = WavePhase::Idle;
        tracing::info!("Submission coordinator shut down");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    pub fn engine(&self, index: usize) -> Option<&EngineInstance> {
        self.engines.get(index)
    }

    pub fn engines(&self) -> &[EngineInstance] {
        &self.engines
    }

    pub fn heap_mut(&mut self, index: usize) -> Option<&mut StateHeap> {
        self.engines.get_mut(index).map(|e| &mut e.heap)
    }

    pub fn phase(&self) -> WavePhase {
        self.phase
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats.clone()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_open(&self, wave: &Wave) -> Result<()> {
        if self.open_wave != Some(wave.id) {
            return Err(EngineError::WaveState {
                wave: wave.id,
                reason: "wave is not open on this coordinator".into(),
            });
        }
        Ok(())
    }

    fn plan_wave(&self, request: &mut WaveRequest) -> Result<(PartitionPlan, EngineAssignment)> {
        if request.height == 0 {
            return Err(EngineError::Configuration("frame height must be positive".into()));
        }

        request.surfaces.sort_by_key(|s| s.kind);
        if let Some(pair) = request.surfaces.windows(2).find(|w| w[0].kind == w[1].kind) {
            return Err(EngineError::Configuration(format!(
                "surface {:?} given more than once",
                pair[0].kind
            )));
        }

        let engine_count = self.engines.len();
        let plan = self.planner.plan(
            request.width,
            engine_count,
            self.options.alignment_quantum,
            request.uses_secondary_scaler,
        )?;
        plan.check_coverage(request.width)?;
        let assignment = EngineAssignment::new(engine_count, request.uses_secondary_scaler)?;
        Ok((plan, assignment))
    }

    /// Acquire and fill a slot, then encode against it. The slot is abandoned on failure.
    fn build_stream<F>(&mut self, wave: &Wave, engine_index: usize, write: F) -> Result<StagedEngine>
    where
        F: FnOnce(&EngineContext, &mut SlotWriter<'_>) -> Result<()>,
    {
        let assignment = wave.assignment.for_engine(engine_index)?;
        let range = *wave.plan.range(engine_index).ok_or_else(|| EngineError::WaveState {
            wave: wave.id,
            reason: format!("no partition for engine {}", engine_index),
        })?;
        let overfetch = wave.plan.overfetch_window(engine_index).copied();

        let instance = &mut self.engines[engine_index];
        let handle = instance.handle;
        let slot = instance.heap.acquire()?;
        let context = EngineContext {
            wave: wave.id,
            assignment,
            range,
            overfetch,
            rows: wave.request.height,
            slot_index: slot.index(),
            tag: slot.tag(),
        };

        let written = instance
            .heap
            .writer(&slot)
            .and_then(|mut writer| write(&context, &mut writer));
        let encoded = written.and_then(|()| self.encode(wave, &context, handle, &slot));

        match encoded {
            Ok(stream) => Ok(StagedEngine { stream, slot }),
            Err(err) => {
                self.engines[engine_index].heap.abandon(slot)?;
                Err(err)
            }
        }
    }

    fn encode(
        &mut self,
        wave: &Wave,
        context: &EngineContext,
        handle: EngineHandle,
        slot: &StateSlot,
    ) -> Result<CommandStream> {
        let assignment = &context.assignment;
        let participants = assignment.enabled_engine_count;
        let encoder = self.encoder.as_mut();

        encoder.begin(handle, assignment)?;
        if assignment.is_scalable() && assignment.is_first() {
            encoder.barrier(Barrier::WaveStart {
                wave: wave.id,
                participants,
            })?;
        }
        encoder.bind_state_heap(&StateBinding::from_slot(slot))?;
        for surface in &wave.request.surfaces {
            encoder.surface_state(surface)?;
        }
        encoder.partition_range(&context.range, context.overfetch.as_ref())?;
        encoder.workload(&Workload {
            columns: context.range.len(),
            rows: context.rows,
        })?;
        if assignment.is_scalable() && assignment.is_last() {
            encoder.barrier(Barrier::WaveJoin {
                wave: wave.id,
                participants,
            })?;
        }
        encoder.store_tag(context.tag)?;
        encoder.finish()
    }
}

impl std::fmt::Debug for SubmissionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionCoordinator")
            .field("engines", &self.engines.len())
            .field("phase", &self.phase)
            .field("open_wave", &self.open_wave)
            .field("next_wave", &self.next_wave)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOp, RecordingEncoder, SurfaceFormat, SurfaceKind};
    use crate::fence::SimFence;
    use crate::memory::SystemAllocator;
    use crate::state_heap::SubRegionKind;

    fn coordinator(engines: usize, capacity: usize) -> (SubmissionCoordinator, Arc<SimFence>, RecordingSink) {
        let config = EngineConfig {
            engine_count: engines,
            heap_capacity: capacity,
            acquire_timeout_ms: 5,
            poll_interval_us: 100,
            wave_watchdog_ms: 1000,
            ..Default::default()
        };
        let fence = SimFence::new();
        let sink = RecordingSink::new();
        let coord = SubmissionCoordinator::from_config(
            &config,
            fence.clone(),
            &SystemAllocator::new(),
            Box::new(RecordingEncoder::new()),
            Box::new(sink.clone()),
        )
        .unwrap();
        (coord, fence, sink)
    }

    fn noop(_: &EngineContext, _: &mut SlotWriter<'_>) -> Result<()> {
        Ok(())
    }

    fn retire_all(coord: &SubmissionCoordinator, fence: &SimFence) {
        for engine in coord.engines() {
            fence.retire_all(engine.handle());
        }
    }

    #[test]
    fn single_engine_wave_has_no_barriers() {
        let (mut coord, _fence, sink) = coordinator(1, 2);
        let report = coord.run_wave(WaveRequest::new(1920, 1080), noop).unwrap();

        assert!(report.deadline.is_none());
        let streams = sink.submitted();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].barriers().count(), 0);
        assert_eq!(streams[0].partition().unwrap().end_column_inclusive, 1919);

        let status = coord.engine(0).unwrap().heap().slot_status(0).unwrap();
        assert!(status.busy && status.finalized);
        assert_eq!(status.pending_tag, streams[0].signal_tag);
        assert_eq!(coord.phase(), WavePhase::AwaitingCompletion);
    }

    #[test]
    fn three_engine_wave_with_scaler() {
        let (mut coord, _fence, sink) = coordinator(3, 2);
        let request = WaveRequest::new(3840, 2160)
            .with_scaler(true)
            .with_surface(SurfaceDescriptor::new(SurfaceKind::Output, 0x20_0000, 3840, 2160, SurfaceFormat::Nv12))
            .with_surface(SurfaceDescriptor::new(SurfaceKind::Input, 0x10_0000, 3840, 2160, SurfaceFormat::Nv12));

        let mut seen = Vec::new();
        let report = coord
            .run_wave(request, |ctx, _| {
                seen.push((ctx.range.start_column, ctx.overfetch.map(|o| o.scaler_start_column())));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec![(0, Some(0)), (1280, Some(1216)), (2560, Some(2496))]);
        assert_eq!(report.engines.len(), 3);
        assert!(report.deadline.is_some());

        let streams = sink.submitted();
        assert!(matches!(
            streams[0].ops[1],
            CommandOp::Barrier(Barrier::WaveStart { participants: 3, .. })
        ));
        assert_eq!(streams[1].barriers().count(), 0);
        let tail = &streams[2].ops[streams[2].ops.len() - 2..];
        assert!(matches!(tail[0], CommandOp::Barrier(Barrier::WaveJoin { participants: 3, .. })));
        assert!(matches!(tail[1], CommandOp::StoreTag(_)));

        // Surfaces are emitted input first regardless of request order.
        let kinds: Vec<SurfaceKind> = streams[1]
            .ops
            .iter()
            .filter_map(|op| match op {
                CommandOp::Surface(s) => Some(s.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![SurfaceKind::Input, SurfaceKind::Output]);
    }

    #[test]
    fn failed_engine_still_submits_built_engines() {
        let (mut coord, _fence, sink) = coordinator(3, 2);
        let result = coord.run_wave(WaveRequest::new(3840, 2160), |ctx, writer| {
            if ctx.assignment.this_engine_index == 2 {
                let oversized = vec![0xAAu8; 1 << 20];
                writer.write_bytes(SubRegionKind::Hdr, 0, &oversized)?;
            }
            Ok(())
        });

        match result {
            Err(EngineError::PartialWaveFailure {
                failed_engine,
                submitted,
                source,
                ..
            }) => {
                assert_eq!(failed_engine, 2);
                assert_eq!(submitted, vec![0, 1]);
                assert!(matches!(*source, EngineError::RegionOverflow { .. }));
            }
            other => panic!("expected partial wave failure, got {:?}", other),
        }

        let streams = sink.submitted();
        assert_eq!(streams.iter().map(|s| s.engine_index).collect::<Vec<_>>(), vec![0, 1]);
        for index in 0..2 {
            let status = coord.engine(index).unwrap().heap().slot_status(0).unwrap();
            assert!(status.pending_tag > 0);
            assert!(status.busy);
        }

        let failed_heap = coord.engine(2).unwrap().heap();
        assert_eq!(failed_heap.busy_slots(), 0);
        assert_eq!(failed_heap.stats().abandoned, 1);
        assert_eq!(coord.stats().waves_failed, 1);
    }

    #[test]
    fn planning_failure_has_no_side_effects() {
        let (mut coord, _fence, sink) = coordinator(2, 2);
        let err = coord.begin_wave(WaveRequest::new(100, 64)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        assert!(sink.is_empty());
        assert_eq!(coord.phase(), WavePhase::Idle);
        for engine in coord.engines() {
            assert_eq!(engine.heap().stats().acquires, 0);
        }

        let wave = coord.begin_wave(WaveRequest::new(1920, 1080)).unwrap();
        assert_eq!(wave.id(), 1);
    }

    #[test]
    fn duplicate_surfaces_are_rejected() {
        let (mut coord, _fence, _sink) = coordinator(1, 2);
        let input = SurfaceDescriptor::new(SurfaceKind::Input, 0x1000, 640, 480, SurfaceFormat::Nv12);
        let request = WaveRequest::new(640, 480).with_surface(input).with_surface(input);
        assert!(matches!(
            coord.begin_wave(request),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn builds_must_follow_engine_order() {
        let (mut coord, _fence, _sink) = coordinator(2, 2);
        let mut wave = coord.begin_wave(WaveRequest::new(1920, 1080)).unwrap();

        assert!(matches!(
            coord.build_engine(&mut wave, 1, noop),
            Err(EngineError::WaveState { .. })
        ));
        coord.build_engine(&mut wave, 0, noop).unwrap();
        assert_eq!(coord.phase(), WavePhase::PerEngineBuild);
        coord.build_engine(&mut wave, 1, noop).unwrap();
        assert_eq!(coord.phase(), WavePhase::Barrier);
        assert!(coord.build_engine(&mut wave, 2, noop).is_err());

        coord.submit(wave).unwrap();
    }

    #[test]
    fn unbuilt_engine_fails_the_wave() {
        let (mut coord, _fence, sink) = coordinator(2, 2);
        let mut wave = coord.begin_wave(WaveRequest::new(1920, 1080)).unwrap();
        coord.build_engine(&mut wave, 0, noop).unwrap();

        match coord.submit(wave) {
            Err(EngineError::PartialWaveFailure {
                failed_engine,
                submitted,
                source,
                ..
            }) => {
                assert_eq!(failed_engine, 1);
                assert_eq!(submitted, vec![0]);
                assert!(matches!(*source, EngineError::WaveState { .. }));
            }
            other => panic!("expected partial wave failure, got {:?}", other),
        }
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn open_wave_blocks_next_plan() {
        let (mut coord, _fence, _sink) = coordinator(1, 2);
        let mut wave = coord.begin_wave(WaveRequest::new(640, 480)).unwrap();
        assert!(matches!(
            coord.begin_wave(WaveRequest::new(640, 480)),
            Err(EngineError::WaveState { wave: 1, .. })
        ));
        coord.build_engine(&mut wave, 0, noop).unwrap();
        coord.submit(wave).unwrap();
        assert!(coord.begin_wave(WaveRequest::new(640, 480)).is_ok());
    }

    #[test]
    fn acquire_timeout_fails_the_wave() {
        let (mut coord, _fence, sink) = coordinator(1, 1);
        coord.run_wave(WaveRequest::new(640, 480), noop).unwrap();

        let err = coord.run_wave(WaveRequest::new(640, 480), noop).unwrap_err();
        assert!(matches!(err, EngineError::Timeout { engine: 0, slot: 0, .. }));
        assert_eq!(sink.len(), 1);
        assert_eq!(coord.stats().waves_failed, 1);
        assert_eq!(coord.phase(), WavePhase::Idle);
    }

    /// Rejects the first `remaining` streams and records the rest.
    struct RejectingSink {
        remaining: usize,
        accepted: RecordingSink,
    }

    impl SubmissionSink for RejectingSink {
        fn submit(&mut self, stream: &CommandStream) -> Result<()> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Err(EngineError::Submit {
                    engine: stream.engine.0,
                    reason: "queue full".into(),
                });
            }
            self.accepted.submit(stream)
        }
    }

    #[test]
    fn rejected_stream_frees_its_slot() {
        let config = EngineConfig {
            engine_count: 1,
            heap_capacity: 1,
            acquire_timeout_ms: 5,
            poll_interval_us: 100,
            ..Default::default()
        };
        let accepted = RecordingSink::new();
        let sink = RejectingSink {
            remaining: 1,
            accepted: accepted.clone(),
        };
        let mut coord = SubmissionCoordinator::from_config(
            &config,
            SimFence::new(),
            &SystemAllocator::new(),
            Box::new(RecordingEncoder::new()),
            Box::new(sink),
        )
        .unwrap();

        let err = coord.run_wave(WaveRequest::new(640, 480), noop).unwrap_err();
        assert!(matches!(err, EngineError::Submit { engine: 0, .. }));
        let heap = coord.engine(0).unwrap().heap();
        assert_eq!(heap.busy_slots(), 0);
        assert_eq!(heap.stats().abandoned, 1);
        assert_eq!(coord.phase(), WavePhase::Idle);

        // One slot and no fence progress: this only succeeds if the rejected slot was freed.
        let report = coord.run_wave(WaveRequest::new(640, 480), noop).unwrap();
        assert_eq!(accepted.len(), 1);
        let status = coord.engine(0).unwrap().heap().slot_status(0).unwrap();
        assert!(status.busy && status.finalized);
        assert_eq!(status.pending_tag, report.engines[0].tag);
    }

    #[test]
    fn poll_reports_completion() {
        let (mut coord, fence, _sink) = coordinator(2, 2);
        let report = coord.run_wave(WaveRequest::new(1920, 1080), noop).unwrap();
        assert_eq!(coord.poll_wave(&report), WaveStatus::Pending);

        retire_all(&coord, &fence);
        assert_eq!(coord.poll_wave(&report), WaveStatus::Complete);
        assert_eq!(coord.phase(), WavePhase::Idle);
    }

    #[test]
    fn watchdog_names_hung_engines() {
        let (mut coord, fence, _sink) = coordinator(2, 2);
        let mut report = coord.run_wave(WaveRequest::new(1920, 1080), noop).unwrap();
        report.deadline = Some(report.submitted_at);

        fence.signal(EngineHandle(0), report.engines[0].tag);
        assert_eq!(
            coord.poll_wave(&report),
            WaveStatus::TimedOut { hung_engines: vec![1] }
        );
        coord.poll_wave(&report);
        assert_eq!(coord.stats().watchdog_timeouts, 1);
    }

    #[test]
    fn state_writes_land_in_the_slot() {
        let (mut coord, _fence, _sink) = coordinator(1, 2);
        coord
            .run_wave(WaveRequest::new(640, 480), |_, writer| {
                writer.write_pod(SubRegionKind::Gamut, &[1u32, 2, 3, 4])
            })
            .unwrap();

        let heap = coord.heap_mut(0).unwrap();
        let offset = heap.layout().region(SubRegionKind::Gamut).offset;
        let bytes = heap.read_bytes(offset, 16).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4]));
    }

    #[test]
    fn shutdown_waits_for_retirement() {
        let (mut coord, fence, _sink) = coordinator(2, 2);
        coord.run_wave(WaveRequest::new(1920, 1080), noop).unwrap();
        assert!(coord.shutdown(Duration::from_millis(2)).is_err());

        retire_all(&coord, &fence);
        coord.shutdown(Duration::from_millis(50)).unwrap();
        assert!(coord.engines().iter().all(|e| e.heap().is_destroyed()));
    }
}
