//! Integration tests for the router lifecycle and the detection task, run
//! against a scripted in-memory backend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tune_core::{
    CaptureBackend, CaptureConstraints, CaptureDevice, EngineConfig, EngineError, EngineState,
    ProcessingContext, Result, RoutingGraph, SignalRouter,
};

const SAMPLE_RATE: u32 = 44_100;

/// Shared record of what the backend handed out and got back.
#[derive(Default)]
struct Ledger {
    contexts_created: AtomicUsize,
    contexts_closed: AtomicUsize,
    devices_acquired: AtomicUsize,
    devices_released: AtomicUsize,
    resumes: AtomicUsize,
    suspends: AtomicUsize,
    released_while_connected: AtomicBool,
    constraints: Mutex<Option<CaptureConstraints>>,
    graph: Mutex<Option<RoutingGraph>>,
    fail_context: AtomicBool,
    fail_input: AtomicBool,
    fail_output: AtomicBool,
    fail_device_suspend: AtomicBool,
}

impl Ledger {
    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Feeds samples into the graph the way a device callback would.
    fn feed(&self, samples: &[f32]) {
        let graph = self.graph.lock().unwrap();
        graph.as_ref().expect("no device acquired").process_input(samples);
    }
}

struct ScriptedBackend {
    ledger: Arc<Ledger>,
}

struct ScriptedContext {
    ledger: Arc<Ledger>,
}

struct ScriptedDevice {
    ledger: Arc<Ledger>,
    graph: RoutingGraph,
}

impl CaptureBackend for ScriptedBackend {
    type Context = ScriptedContext;
    type Device = ScriptedDevice;

    fn create_context(&mut self, constraints: &CaptureConstraints) -> Result<ScriptedContext> {
        if self.ledger.fail_context.load(Ordering::SeqCst) {
            return Err(EngineError::CaptureUnavailable("permission denied".into()));
        }
        *self.ledger.constraints.lock().unwrap() = Some(*constraints);
        self.ledger.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            ledger: self.ledger.clone(),
        })
    }

    fn acquire_input(
        &mut self,
        _context: &mut ScriptedContext,
        _constraints: &CaptureConstraints,
        graph: &RoutingGraph,
    ) -> Result<ScriptedDevice> {
        if self.ledger.fail_input.load(Ordering::SeqCst) {
            return Err(EngineError::Stream("device busy".into()));
        }
        self.ledger.devices_acquired.fetch_add(1, Ordering::SeqCst);
        *self.ledger.graph.lock().unwrap() = Some(graph.clone());
        Ok(ScriptedDevice {
            ledger: self.ledger.clone(),
            graph: graph.clone(),
        })
    }
}

impl ProcessingContext for ScriptedContext {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn connect_output(&mut self, _graph: &RoutingGraph) -> Result<()> {
        if self.ledger.fail_output.load(Ordering::SeqCst) {
            return Err(EngineError::Stream("no output".into()));
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.ledger.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.ledger.suspends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self) {
        self.ledger.contexts_closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureDevice for ScriptedDevice {
    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if self.ledger.fail_device_suspend.load(Ordering::SeqCst) {
            return Err(EngineError::Stream("device unplugged".into()));
        }
        Ok(())
    }

    fn release(self) {
        if self.graph.is_connected() {
            self.ledger.released_while_connected.store(true, Ordering::SeqCst);
        }
        self.ledger.devices_released.fetch_add(1, Ordering::SeqCst);
    }
}

fn router() -> (SignalRouter<ScriptedBackend>, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let config = EngineConfig {
        tick_interval_ms: 5,
        monitor_output: false,
        ..EngineConfig::default()
    };
    let backend = ScriptedBackend {
        ledger: ledger.clone(),
    };
    (SignalRouter::new(backend, config).unwrap(), ledger)
}

fn sine(frequency: f64, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE as f64;
            0.5 * (2.0 * std::f64::consts::PI * frequency * t).sin() as f32
        })
        .collect()
}

#[test]
fn initialize_requests_raw_capture() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    assert_eq!(router.state(), EngineState::Initialized);
    assert_eq!(router.sample_rate(), Some(SAMPLE_RATE));
    let constraints = ledger.constraints.lock().unwrap().unwrap();
    assert!(!constraints.echo_cancellation);
    assert!(!constraints.noise_suppression);
    assert!(!constraints.auto_gain_control);
}

#[test]
fn full_lifecycle_releases_everything_once() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.initialize().unwrap();
    router.start().unwrap();
    router.start().unwrap();
    assert_eq!(router.state(), EngineState::Running);
    assert_eq!(Ledger::count(&ledger.resumes), 1);

    router.stop().unwrap();
    router.stop().unwrap();
    assert_eq!(router.state(), EngineState::Stopped);
    assert_eq!(Ledger::count(&ledger.suspends), 1);
    assert_eq!(Ledger::count(&ledger.devices_released), 0);

    router.start().unwrap();
    assert_eq!(router.state(), EngineState::Running);

    router.destroy();
    router.destroy();
    assert_eq!(router.state(), EngineState::Destroyed);
    assert_eq!(Ledger::count(&ledger.contexts_created), 1);
    assert_eq!(Ledger::count(&ledger.devices_acquired), 1);
    assert_eq!(Ledger::count(&ledger.devices_released), 1);
    assert_eq!(Ledger::count(&ledger.contexts_closed), 1);
    assert!(!ledger.released_while_connected.load(Ordering::SeqCst));
}

#[test]
fn destroy_is_safe_from_every_state() {
    let (mut fresh, ledger) = router();
    fresh.destroy();
    assert_eq!(fresh.state(), EngineState::Destroyed);
    assert_eq!(Ledger::count(&ledger.contexts_closed), 0);

    let (mut initialized, ledger) = router();
    initialized.initialize().unwrap();
    initialized.destroy();
    assert_eq!(Ledger::count(&ledger.contexts_closed), 1);

    let (mut stopped, ledger) = router();
    stopped.initialize().unwrap();
    stopped.start().unwrap();
    stopped.stop().unwrap();
    stopped.destroy();
    assert_eq!(Ledger::count(&ledger.devices_released), 1);
}

#[test]
fn dropping_the_router_releases_the_device() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    drop(router);
    assert_eq!(Ledger::count(&ledger.devices_released), 1);
    assert_eq!(Ledger::count(&ledger.contexts_closed), 1);
}

#[test]
fn failed_input_releases_the_context_and_allows_a_retry() {
    let (mut router, ledger) = router();
    ledger.fail_input.store(true, Ordering::SeqCst);

    let err = router.initialize().unwrap_err();
    assert!(matches!(err, EngineError::CaptureUnavailable(ref msg) if msg.contains("busy")));
    assert_eq!(router.state(), EngineState::Uninitialized);
    assert_eq!(Ledger::count(&ledger.contexts_created), 1);
    assert_eq!(Ledger::count(&ledger.contexts_closed), 1);

    ledger.fail_input.store(false, Ordering::SeqCst);
    router.initialize().unwrap();
    assert_eq!(router.state(), EngineState::Initialized);
}

#[test]
fn failed_output_releases_device_then_context() {
    let (mut router, ledger) = router();
    ledger.fail_output.store(true, Ordering::SeqCst);

    assert!(matches!(router.initialize(), Err(EngineError::CaptureUnavailable(_))));
    assert_eq!(router.state(), EngineState::Uninitialized);
    assert_eq!(Ledger::count(&ledger.devices_released), 1);
    assert_eq!(Ledger::count(&ledger.contexts_closed), 1);
    assert!(!ledger.released_while_connected.load(Ordering::SeqCst));
}

#[test]
fn denied_permission_is_capture_unavailable() {
    let (mut router, ledger) = router();
    ledger.fail_context.store(true, Ordering::SeqCst);
    assert!(matches!(router.initialize(), Err(EngineError::CaptureUnavailable(_))));
    assert_eq!(router.state(), EngineState::Uninitialized);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let (mut router, _ledger) = router();
    assert!(matches!(router.start(), Err(EngineError::InvalidState { .. })));
    assert!(router.start_detection().is_err());
    router.stop().unwrap();
    router.stop_detection();

    router.destroy();
    assert!(matches!(router.initialize(), Err(EngineError::InvalidState { .. })));
    assert!(matches!(router.start(), Err(EngineError::InvalidState { .. })));
}

#[test]
fn detects_a_sung_a4() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    ledger.feed(&sine(440.0, 2048));

    let events = router.start_detection().unwrap();
    let event = events
        .recv_timeout(Duration::from_secs(2))
        .expect("expected a detection event");
    assert_eq!(event.note_label, "A4");
    assert!((event.frequency_hz - 440.0).abs() < 1.5);
    assert!(event.cents_deviation.abs() < 5.0);

    router.stop_detection();
    assert!(!router.is_detecting());
}

#[test]
fn silence_never_reaches_the_handler() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    ledger.feed(&[0.0; 2048]);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    router
        .start_detection_with(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    router.stop_detection();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn restarting_detection_cancels_the_previous_task() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    ledger.feed(&[0.0; 2048]);

    let first = router.start_detection().unwrap();
    let second = router.start_detection().unwrap();
    assert_eq!(
        first.recv_timeout(Duration::from_millis(500)),
        Err(RecvTimeoutError::Disconnected)
    );
    assert!(router.is_detecting());

    router.stop().unwrap();
    assert!(!router.is_detecting());
    assert_eq!(
        second.recv_timeout(Duration::from_millis(500)),
        Err(RecvTimeoutError::Disconnected)
    );
}

#[test]
fn unread_events_are_replaced_by_the_latest() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    ledger.feed(&sine(440.0, 2048));

    let events = router.start_detection().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    ledger.feed(&sine(220.0, 2048));
    std::thread::sleep(Duration::from_millis(200));

    let event = events
        .recv_timeout(Duration::from_secs(2))
        .expect("expected a detection event");
    assert_eq!(event.note_label, "A3");
    router.stop_detection();
}

#[test]
fn failed_device_suspend_still_suspends_the_context() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    router.start().unwrap();
    ledger.fail_device_suspend.store(true, Ordering::SeqCst);

    assert!(matches!(router.stop(), Err(EngineError::Stream(_))));
    assert_eq!(router.state(), EngineState::Stopped);
    assert_eq!(Ledger::count(&ledger.suspends), 1);
    assert!(!router.is_detecting());

    ledger.fail_device_suspend.store(false, Ordering::SeqCst);
    router.start().unwrap();
    assert_eq!(router.state(), EngineState::Running);
}

#[test]
fn volume_and_threshold_are_clamped() {
    let (mut router, _ledger) = router();
    router.set_volume(1.7);
    assert_eq!(router.volume(), 1.0);
    router.set_volume(-3.0);
    assert_eq!(router.volume(), 0.0);

    router.initialize().unwrap();
    router.set_threshold(-1.0);
    assert_eq!(router.threshold(), 0.01);
    router.set_threshold(10.0);
    assert_eq!(router.threshold(), 0.5);
}

#[test]
fn snapshots_expose_the_analysis_tap() {
    let (mut router, ledger) = router();
    router.initialize().unwrap();
    ledger.feed(&sine(440.0, 4096));
    assert_eq!(router.time_domain_snapshot().len(), 2048);
    assert_eq!(router.frequency_snapshot().len(), 1024);

    router.destroy();
    assert!(router.time_domain_snapshot().is_empty());
}
