//! # Signal Router
//!
//! Owns the processing context, the input device and the routing graph,
//! and runs the periodic detection task.
//!
//! ## Lifecycle
//! ```text
//! Uninitialized --initialize--> Initialized --start--> Running
//! Running --stop--> Stopped --start--> Running
//! any --destroy--> Destroyed
//! ```
//!
//! ## Detection task
//! A dedicated thread waits on a `crossbeam_channel::tick` and a shutdown
//! channel. Each tick copies the latest frame out of the analysis tap,
//! gates it on RMS, runs YIN and hands a [`DetectionEvent`] to the handler.
//! The estimator travels into the thread and comes back through its
//! `JoinHandle`, so it is never shared.

use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::device::{CaptureBackend, CaptureConstraints, CaptureDevice, CpalBackend, ProcessingContext};
use crate::error::{EngineError, Result};
use crate::graph::{AnalysisTap, RoutingGraph, SharedF32};
use crate::pitch::{self, PitchDetector, PitchEstimate, YinEstimator};
use crate::tuning;

/// Lifecycle state of a [`SignalRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

/// What the detection task reports for a tick that found a pitch.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub frequency_hz: f64,
    /// Nearest equal-tempered note, e.g. `"A4"`.
    pub note_label: String,
    /// Distance from that note in cents, within `[-50, 50]`.
    pub cents_deviation: f64,
    pub confidence: f64,
}

impl From<PitchEstimate> for DetectionEvent {
    fn from(estimate: PitchEstimate) -> Self {
        let pitch_unit = tuning::frequency_to_pitch_unit(estimate.frequency_hz);
        Self {
            frequency_hz: estimate.frequency_hz,
            note_label: tuning::pitch_unit_to_note_label(pitch_unit),
            cents_deviation: tuning::cents_deviation(estimate.frequency_hz),
            confidence: estimate.confidence,
        }
    }
}

/// Runs one frame through the silence gate and the detector.
///
/// Frames whose RMS is below `silence_threshold` never reach the detector.
pub fn analyze_frame<D: PitchDetector>(
    detector: &mut D,
    frame: &[f32],
    silence_threshold: f32,
) -> Option<DetectionEvent> {
    let level = pitch::rms(frame);
    if level < silence_threshold {
        trace!("Frame below silence threshold (rms {:.4})", level);
        return None;
    }
    detector.detect(frame).map(DetectionEvent::from)
}

/// State carried by the detection thread.
struct DetectionWorker {
    estimator: YinEstimator,
    frame: Vec<f32>,
    tap: AnalysisTap,
    silence_threshold: f32,
    threshold: SharedF32,
}

impl DetectionWorker {
    fn tick(&mut self) -> Option<DetectionEvent> {
        let threshold = self.threshold.get();
        if threshold != self.estimator.threshold() {
            self.estimator.set_threshold(threshold);
        }
        if !self.tap.snapshot_into(&mut self.frame) {
            return None;
        }
        analyze_frame(&mut self.estimator, &self.frame, self.silence_threshold)
    }
}

/// Handle to a running detection thread.
struct DetectionTask {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<YinEstimator>,
}

struct Resources<B: CaptureBackend> {
    context: B::Context,
    device: B::Device,
}

/// The capture and detection engine.
///
/// Exclusively owns its device, context and graph. Dropping the router
/// destroys it.
pub struct SignalRouter<B: CaptureBackend = CpalBackend> {
    backend: B,
    config: EngineConfig,
    state: EngineState,
    graph: RoutingGraph,
    resources: Option<Resources<B>>,
    estimator: Option<YinEstimator>,
    threshold: SharedF32,
    detection: Option<DetectionTask>,
}

impl SignalRouter<CpalBackend> {
    /// A router on the default CPAL host.
    pub fn cpal(config: EngineConfig) -> Result<Self> {
        Self::new(CpalBackend::new(), config)
    }
}

impl<B: CaptureBackend> SignalRouter<B> {
    /// Creates an uninitialized router. Nothing is acquired yet.
    pub fn new(backend: B, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let graph = RoutingGraph::new(config.frame_length, config.volume, config.monitor_output);
        let threshold = SharedF32::new(pitch::clamp_threshold(config.threshold));
        Ok(Self {
            backend,
            config,
            state: EngineState::Uninitialized,
            graph,
            resources: None,
            estimator: None,
            threshold,
            detection: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sample rate negotiated with the device, once initialized.
    pub fn sample_rate(&self) -> Option<u32> {
        self.resources.as_ref().map(|r| r.context.sample_rate())
    }

    pub fn is_detecting(&self) -> bool {
        self.detection.is_some()
    }

    /// Acquires the device and builds the routing graph.
    ///
    /// Input processing (echo cancellation, noise suppression, automatic
    /// gain control) is requested off. Any failure comes back as
    /// [`EngineError::CaptureUnavailable`] with everything acquired so far
    /// already released and the router still `Uninitialized`. No retries.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            EngineState::Uninitialized => {}
            EngineState::Destroyed => return Err(invalid("initialize", self.state)),
            _ => return Ok(()),
        }

        let constraints = CaptureConstraints::raw(self.config.sample_rate);

        let mut context = self
            .backend
            .create_context(&constraints)
            .map_err(into_capture_error)?;

        let device = match self.backend.acquire_input(&mut context, &constraints, &self.graph) {
            Ok(device) => device,
            Err(e) => {
                context.close();
                return Err(into_capture_error(e));
            }
        };

        self.graph.connect();
        if let Err(e) = context.connect_output(&self.graph) {
            self.graph.disconnect();
            device.release();
            context.close();
            return Err(into_capture_error(e));
        }

        let sample_rate = context.sample_rate();
        if self.config.frame_length / 2 <= (sample_rate as f64 / pitch::MIN_FREQUENCY) as usize {
            warn!(
                "Frame of {} samples cannot resolve {} Hz at {} Hz",
                self.config.frame_length,
                pitch::MIN_FREQUENCY,
                sample_rate
            );
        }
        self.estimator = Some(self.new_estimator(sample_rate));
        self.resources = Some(Resources { context, device });
        self.state = EngineState::Initialized;
        info!("Engine initialized at {} Hz", sample_rate);
        Ok(())
    }

    /// Resumes the context and the device. No-op while running.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state;
        match state {
            EngineState::Running => return Ok(()),
            EngineState::Uninitialized | EngineState::Destroyed => {
                return Err(invalid("start", state));
            }
            EngineState::Initialized | EngineState::Stopped => {}
        }
        let Some(resources) = self.resources.as_mut() else {
            return Err(invalid("start", state));
        };
        resources.context.resume()?;
        resources.device.resume()?;
        self.state = EngineState::Running;
        info!("Engine running");
        Ok(())
    }

    /// Stops detection and suspends device and context, keeping both.
    ///
    /// Safe to call in any state; only a running engine changes state.
    /// Both are suspended even if one of them fails, and the engine ends up
    /// `Stopped` either way; the first failure is returned.
    pub fn stop(&mut self) -> Result<()> {
        self.stop_detection();
        if self.state != EngineState::Running {
            return Ok(());
        }
        let suspended = match self.resources.as_mut() {
            Some(resources) => {
                let device = resources.device.suspend();
                let context = resources.context.suspend();
                device.and(context)
            }
            None => Ok(()),
        };
        self.state = EngineState::Stopped;
        match &suspended {
            Ok(()) => info!("Engine stopped"),
            Err(e) => warn!("Engine stopped with a suspend failure: {}", e),
        }
        suspended
    }

    /// Releases everything the router holds.
    ///
    /// Teardown order: detection task, graph nodes, device, context.
    /// Idempotent and callable from every state.
    pub fn destroy(&mut self) {
        if self.state == EngineState::Destroyed {
            return;
        }
        self.stop_detection();
        self.graph.disconnect();
        if let Some(Resources { context, device }) = self.resources.take() {
            device.release();
            context.close();
        }
        self.estimator = None;
        self.state = EngineState::Destroyed;
        info!("Engine destroyed");
    }

    /// Starts the periodic detection task, calling `handler` from the task
    /// thread for every tick that finds a pitch.
    ///
    /// An already running task is cancelled and joined first. Handler calls
    /// never overlap and should stay cheap.
    pub fn start_detection_with<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(DetectionEvent) + Send + 'static,
    {
        if matches!(self.state, EngineState::Uninitialized | EngineState::Destroyed) {
            return Err(invalid("start detection", self.state));
        }
        self.stop_detection();

        let estimator = match self.estimator.take() {
            Some(estimator) => estimator,
            None => return Err(invalid("start detection", self.state)),
        };
        let sample_rate = estimator.sample_rate();
        let worker = DetectionWorker {
            frame: vec![0.0; estimator.frame_length()],
            estimator,
            tap: self.graph.tap().clone(),
            silence_threshold: self.config.silence_threshold,
            threshold: self.threshold.clone(),
        };
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = self.config.tick_interval();

        let spawned = thread::Builder::new()
            .name("pitch-detection".to_string())
            .spawn(move || run_detection(worker, interval, shutdown_rx, handler));

        match spawned {
            Ok(handle) => {
                self.detection = Some(DetectionTask { shutdown_tx, handle });
                info!("Detection started, every {:?}", interval);
                Ok(())
            }
            Err(e) => {
                error!("Could not spawn detection thread: {}", e);
                self.estimator = Some(self.new_estimator(sample_rate));
                Err(e.into())
            }
        }
    }

    /// Starts the detection task and returns a single-slot channel of
    /// events.
    ///
    /// The slot always holds the latest detection: an event nobody picked
    /// up is replaced by the next one.
    pub fn start_detection(&mut self) -> Result<Receiver<DetectionEvent>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let stale = rx.clone();
        self.start_detection_with(move |event| {
            if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                let _ = stale.try_recv();
                let _ = tx.try_send(event);
            }
        })?;
        Ok(rx)
    }

    /// Cancels the detection task and waits for an in-flight tick to finish.
    /// No-op when no task is running.
    pub fn stop_detection(&mut self) {
        let Some(task) = self.detection.take() else {
            return;
        };
        drop(task.shutdown_tx);
        match task.handle.join() {
            Ok(estimator) => self.estimator = Some(estimator),
            Err(_) => {
                error!("Detection thread panicked, rebuilding the estimator");
                if let Some(sample_rate) = self.sample_rate() {
                    self.estimator = Some(self.new_estimator(sample_rate));
                }
            }
        }
        debug!("Detection stopped");
    }

    /// Output gain in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.graph.volume()
    }

    /// Sets the output gain, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) {
        self.graph.set_volume(volume);
    }

    pub fn threshold(&self) -> f32 {
        self.threshold.get()
    }

    /// Sets the YIN threshold, clamped to `[0.01, 0.5]`. A running task
    /// picks it up on its next tick.
    pub fn set_threshold(&mut self, threshold: f32) {
        let threshold = pitch::clamp_threshold(threshold);
        self.threshold.set(threshold);
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.set_threshold(threshold);
        }
    }

    /// Latest captured samples, oldest first. For display only.
    pub fn time_domain_snapshot(&self) -> Vec<f32> {
        self.graph.time_domain_snapshot()
    }

    /// Magnitude spectrum of the latest captured samples. For display only.
    pub fn frequency_snapshot(&self) -> Vec<f32> {
        self.graph.frequency_snapshot()
    }

    fn new_estimator(&self, sample_rate: u32) -> YinEstimator {
        YinEstimator::new(sample_rate, self.config.frame_length, self.threshold.get())
    }
}

impl<B: CaptureBackend> Drop for SignalRouter<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_detection<F>(
    mut worker: DetectionWorker,
    interval: std::time::Duration,
    shutdown_rx: Receiver<()>,
    mut handler: F,
) -> YinEstimator
where
    F: FnMut(DetectionEvent),
{
    let ticker = crossbeam_channel::tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                if let Some(event) = worker.tick() {
                    handler(event);
                }
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
    worker.estimator
}

fn invalid(operation: &'static str, state: EngineState) -> EngineError {
    EngineError::InvalidState { operation, state }
}

fn into_capture_error(err: EngineError) -> EngineError {
    match err {
        EngineError::CaptureUnavailable(_) => err,
        other => EngineError::CaptureUnavailable(other.to_string()),
    }
}
