//! # VPE Simulator
//!
//! Drives submission waves through the engine core against a simulated GPU.
//! Each engine retires its tags after a fixed latency on a background thread.

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vpe_core::command::{CommandStream, RecordingEncoder, SurfaceDescriptor, SurfaceFormat, SurfaceKind};
use vpe_core::submission::SubmissionSink;
use vpe_core::{
    EngineConfig, EngineError, EngineHandle, SimFence, SubRegionKind, SubmissionCoordinator, SystemAllocator,
    WaveReport, WaveRequest, WaveStatus,
};

// ============================================================================
// Options
// ============================================================================

struct SimOptions {
    config: Option<PathBuf>,
    engines: Option<usize>,
    waves: u64,
    width: u32,
    height: u32,
    latency: Duration,
    scaler: bool,
    hang_engine: Option<u32>,
    fail_wave: Option<u64>,
    dump: bool,
}

fn parse_args(args: &[String]) -> Result<SimOptions> {
    let mut options = SimOptions {
        config: None,
        engines: None,
        waves: 16,
        width: 3840,
        height: 2160,
        latency: Duration::from_millis(4),
        scaler: false,
        hang_engine: None,
        fail_wave: None,
        dump: false,
    };

    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
        args.get(i + 1)
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    }

    fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        raw.parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value {} for {}: {}", raw, flag, e))
    }

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--engines" | "-e" => {
                options.engines = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--waves" | "-n" => {
                options.waves = number(value(args, i, flag)?, flag)?;
                i += 2;
            }
            "--width" => {
                options.width = number(value(args, i, flag)?, flag)?;
                i += 2;
            }
            "--height" => {
                options.height = number(value(args, i, flag)?, flag)?;
                i += 2;
            }
            "--latency-ms" => {
                options.latency = Duration::from_millis(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--hang-engine" => {
                options.hang_engine = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--fail-wave" => {
                options.fail_wave = Some(number(value(args, i, flag)?, flag)?);
                i += 2;
            }
            "--scaler" => {
                options.scaler = true;
                i += 1;
            }
            "--dump" => {
                options.dump = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                print_usage();
                return Err(anyhow::anyhow!("Unknown argument {}", other));
            }
        }
    }

    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  vpe-sim [--config <file>] [--engines <n>] [--waves <n>] [--width <px>] [--height <px>]\n          \
         [--latency-ms <ms>] [--scaler] [--hang-engine <n>] [--fail-wave <n>] [--dump]\n\n\
         Config defaults to {}\n",
        EngineConfig::default_path().display()
    );
}

// ============================================================================
// Simulated GPU
// ============================================================================

struct Job {
    engine: EngineHandle,
    tag: u64,
    due: Instant,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopped: bool,
}

/// Retires submitted tags on the fence once their latency has elapsed.
struct SimGpu {
    queue: Mutex<Queue>,
    ready: Condvar,
    fence: Arc<SimFence>,
    latency: Duration,
}

impl SimGpu {
    fn start(fence: Arc<SimFence>, latency: Duration) -> (Arc<Self>, thread::JoinHandle<()>) {
        let gpu = Arc::new(Self {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
            fence,
            latency,
        });
        let worker = gpu.clone();
        let handle = thread::spawn(move || worker.run());
        (gpu, handle)
    }

    fn enqueue(&self, engine: EngineHandle, tag: u64) {
        let mut queue = self.queue.lock();
        queue.jobs.push_back(Job {
            engine,
            tag,
            due: Instant::now() + self.latency,
        });
        self.ready.notify_one();
    }

    fn stop(&self) {
        self.queue.lock().stopped = true;
        self.ready.notify_all();
    }

    fn run(&self) {
        let mut queue = self.queue.lock();
        while !queue.stopped {
            let due = match queue.jobs.front() {
                Some(job) => job.due,
                None => {
                    self.ready.wait(&mut queue);
                    continue;
                }
            };

            let now = Instant::now();
            if due > now {
                self.ready.wait_for(&mut queue, due - now);
                continue;
            }
            if let Some(job) = queue.jobs.pop_front() {
                tracing::debug!("{} retired tag {}", job.engine, job.tag);
                self.fence.signal(job.engine, job.tag);
            }
        }
    }
}

/// Hands streams to the simulated GPU.
struct SimSink {
    gpu: Arc<SimGpu>,
    hang_engine: Option<EngineHandle>,
    dump: bool,
}

impl SubmissionSink for SimSink {
    fn submit(&mut self, stream: &CommandStream) -> vpe_core::Result<()> {
        if self.dump {
            let json = serde_json::to_string(stream).map_err(|e| EngineError::Submit {
                engine: stream.engine.0,
                reason: format!("stream dump failed: {}", e),
            })?;
            println!("{}", json);
        }
        if self.hang_engine == Some(stream.engine) {
            tracing::debug!("{} is hung; tag {} will never retire", stream.engine, stream.signal_tag);
            return Ok(());
        }
        self.gpu.enqueue(stream.engine, stream.signal_tag);
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vpe_core=info,vpe_sim=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = parse_args(&args)?;
    tracing::info!("VPE simulator v{}", vpe_core::VERSION);

    let config_path = options.config.clone().unwrap_or_else(EngineConfig::default_path);
    let mut config = EngineConfig::load_or_default(&config_path)?;
    if let Some(engines) = options.engines {
        config.engine_count = engines;
        config.validate()?;
    }

    run(&options, &config)
}

fn run(options: &SimOptions, config: &EngineConfig) -> Result<()> {
    let fence = SimFence::new();
    let (gpu, gpu_thread) = SimGpu::start(fence.clone(), options.latency);
    let sink = SimSink {
        gpu: gpu.clone(),
        hang_engine: options.hang_engine.map(EngineHandle),
        dump: options.dump,
    };

    let mut coordinator = SubmissionCoordinator::from_config(
        config,
        fence,
        &SystemAllocator::new(),
        Box::new(RecordingEncoder::new()),
        Box::new(sink),
    )?;

    tracing::info!(
        "Running {} wave(s) of {}x{} on {} engine(s), latency {:?}",
        options.waves,
        options.width,
        options.height,
        config.engine_count,
        options.latency
    );

    let started = Instant::now();
    let mut in_flight: Vec<WaveReport> = Vec::new();
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut hung = 0u64;

    for wave in 1..=options.waves {
        let request = wave_request(options);
        let fail_here = options.fail_wave == Some(wave);

        let result = coordinator.run_wave(request, |ctx, writer| {
            if fail_here && ctx.assignment.is_last() {
                return Err(EngineError::Encode {
                    engine: ctx.assignment.this_engine_index,
                    reason: "injected build failure".into(),
                });
            }
            let params = [
                ctx.range.start_column,
                ctx.range.end_column_inclusive,
                ctx.rows,
                ctx.overfetch.map_or(ctx.range.start_column, |o| o.scaler_start_column()),
            ];
            writer.write_pod(SubRegionKind::ColorPipeline, &params)?;
            writer.write_pod(SubRegionKind::DenoiseDeinterlace, &(ctx.wave as u32))
        });

        match result {
            Ok(report) => in_flight.push(report),
            Err(err) if err.is_fatal_for_wave() => {
                tracing::warn!("Wave {} dropped: {}", wave, err);
                failed += 1;
            }
            Err(err) => {
                gpu.stop();
                let _ = gpu_thread.join();
                return Err(err.into());
            }
        }

        poll_in_flight(&mut coordinator, &mut in_flight, &mut completed, &mut hung);
    }

    let drain_deadline = Instant::now() + config.wave_watchdog() + options.latency * 2;
    while !in_flight.is_empty() && Instant::now() < drain_deadline {
        thread::sleep(Duration::from_millis(1));
        poll_in_flight(&mut coordinator, &mut in_flight, &mut completed, &mut hung);
    }

    tracing::info!(
        "Finished in {:?}: {} complete, {} failed, {} hung, {} unresolved",
        started.elapsed(),
        completed,
        failed,
        hung,
        in_flight.len()
    );
    for engine in coordinator.engines() {
        tracing::info!(
            "{} heap: {}",
            engine.handle(),
            serde_json::to_string(&engine.heap().stats())?
        );
    }
    tracing::info!("Coordinator: {}", serde_json::to_string(&coordinator.stats())?);

    if let Err(err) = coordinator.shutdown(config.wave_watchdog()) {
        tracing::warn!("Heaps not released cleanly: {}", err);
    }

    gpu.stop();
    if gpu_thread.join().is_err() {
        tracing::error!("Simulated GPU thread panicked");
    }
    Ok(())
}

fn wave_request(options: &SimOptions) -> WaveRequest {
    let (w, h) = (options.width, options.height);
    WaveRequest::new(w, h)
        .with_scaler(options.scaler)
        .with_surface(SurfaceDescriptor::new(SurfaceKind::Input, 0x4000_0000, w, h, SurfaceFormat::Nv12))
        .with_surface(SurfaceDescriptor::new(SurfaceKind::Output, 0x8000_0000, w, h, SurfaceFormat::Nv12))
}

fn poll_in_flight(
    coordinator: &mut SubmissionCoordinator,
    in_flight: &mut Vec<WaveReport>,
    completed: &mut u64,
    hung: &mut u64,
) {
    in_flight.retain(|report| match coordinator.poll_wave(report) {
        WaveStatus::Pending => true,
        WaveStatus::Complete => {
            *completed += 1;
            false
        }
        WaveStatus::TimedOut { hung_engines } => {
            tracing::warn!("Wave {} hung on engines {:?}", report.wave, hung_engines);
            *hung += 1;
            false
        }
    });
}
