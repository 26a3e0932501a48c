// tune-core/src/lib.rs

//! The core logic for the Jendrix vocal tuner.
//! This crate is responsible for audio capture, pitch detection and
//! scale-quantized correction amounts. It is completely headless
//! and contains no GUI code.
//!
//! ```no_run
//! use tune_core::{EngineConfig, SessionParams, SignalRouter};
//!
//! fn run() -> tune_core::Result<()> {
//!     let mut router = SignalRouter::cpal(EngineConfig::default())?;
//!     router.initialize()?;
//!     router.start()?;
//!     let events = router.start_detection()?;
//!     let session = SessionParams::default();
//!     for event in events.iter().take(10) {
//!         let correction = session.correction_for(event.frequency_hz);
//!         println!("{} {:+.1} cents -> {:?}", event.note_label, event.cents_deviation, correction);
//!     }
//!     router.destroy();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod fft;
pub mod graph;
pub mod pitch;
pub mod session;
pub mod tuning;

pub use config::EngineConfig;
pub use device::{CaptureBackend, CaptureConstraints, CaptureDevice, CpalBackend, ProcessingContext};
pub use engine::{DetectionEvent, EngineState, SignalRouter, analyze_frame};
pub use error::{EngineError, Result};
pub use graph::RoutingGraph;
pub use pitch::{PitchDetector, PitchEstimate, YinEstimator};
pub use session::SessionParams;
pub use tuning::{PitchClass, PitchCorrection, ScaleDefinition, ScaleKind};
