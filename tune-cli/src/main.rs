//! # Jendrix Tune - Command Line Tuner
//!
//! Headless front end for the tuning engine. Captures the default input
//! device, prints every detected pitch together with the correction into
//! the chosen key and scale, and tears the engine down on exit.
//!
//! ## Architecture
//! - **Main Thread**: argument parsing, engine lifecycle, printing
//! - **Detection Thread**: owned by the engine, ticks every 16 ms
//! - **Communication**: single-slot crossbeam channel of detection events,
//!   plus a shutdown channel fed by the Ctrl-C handler

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tune_core::{
    DetectionEvent, EngineConfig, PitchClass, ScaleKind, SessionParams, SignalRouter, tuning,
};

/// Real-time vocal pitch detection with scale-quantized correction.
#[derive(Debug, Parser)]
#[command(name = "jendrix-tune", version, about)]
struct Args {
    /// JSON engine configuration; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Key of the target scale, e.g. C, F#, Bb.
    #[arg(long, default_value = "C")]
    key: PitchClass,

    /// Scale shape: major or minor.
    #[arg(long, default_value = "major")]
    scale: ScaleKind,

    /// YIN threshold (0.01-0.5), lower is stricter.
    #[arg(long)]
    threshold: Option<f32>,

    /// Monitor output volume (0-1).
    #[arg(long)]
    volume: Option<f32>,

    /// RMS level under which frames are treated as silence.
    #[arg(long)]
    silence: Option<f32>,

    /// Do not play the input back through the output device.
    #[arg(long)]
    no_monitor: bool,

    /// Print detections without correction.
    #[arg(long)]
    bypass: bool,

    /// Seconds to run, 0 runs until interrupted with Ctrl-C.
    #[arg(long, default_value_t = 0)]
    duration: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let session = SessionParams {
        key: args.key,
        scale: args.scale,
        bypass: args.bypass,
        ..SessionParams::default()
    };

    info!("Starting Jendrix Tune in {}", session.scale_definition());

    let mut router = SignalRouter::cpal(config).context("invalid engine configuration")?;
    router
        .initialize()
        .context("microphone unavailable")?;
    router.start().context("failed to start audio")?;
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("failed to install the Ctrl-C handler")?;

    let events = router.start_detection().context("failed to start detection")?;
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let reason = pump_events(&events, &shutdown_rx, deadline, |event| print_event(event, &session));
    info!("Shutting down: {:?}", reason);

    let stopped = router.stop();
    router.destroy();
    stopped.context("failed to stop audio")?;
    info!("Jendrix Tune finished");
    Ok(())
}

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    DeadlineReached,
    DetectionClosed,
}

/// Hands every detection to `on_event` until Ctrl-C, the deadline, or the
/// end of the detection task.
fn pump_events(
    events: &Receiver<DetectionEvent>,
    shutdown: &Receiver<()>,
    deadline: Option<Instant>,
    mut on_event: impl FnMut(&DetectionEvent),
) -> StopReason {
    let timeout = match deadline {
        Some(at) => crossbeam_channel::at(at),
        None => crossbeam_channel::never(),
    };
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => on_event(&event),
                Err(_) => {
                    warn!("Detection channel closed");
                    return StopReason::DetectionClosed;
                }
            },
            recv(shutdown) -> _ => return StopReason::Interrupted,
            recv(timeout) -> _ => return StopReason::DeadlineReached,
        }
    }
}

/// Merges the optional config file with command-line overrides.
fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if let Some(silence) = args.silence {
        config.silence_threshold = silence;
    }
    if args.no_monitor {
        config.monitor_output = false;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn print_event(event: &DetectionEvent, session: &SessionParams) {
    let detected = format!(
        "{:8.2} Hz  {:<4} {:+6.1} cents  conf {:.2}",
        event.frequency_hz, event.note_label, event.cents_deviation, event.confidence
    );
    match session.correction_for(event.frequency_hz) {
        Some(correction) => println!(
            "{detected}  -> {:<4} {:+6.2} st ({:+7.1} cents)",
            correction.target_note_label,
            correction.semitone_shift,
            tuning::calculate_cents_deviation(correction.target_frequency_hz, event.frequency_hz),
        ),
        None => println!("{detected}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "jendrix-tune",
            "--key",
            "Bb",
            "--scale",
            "minor",
            "--threshold",
            "0.2",
            "--no-monitor",
        ]);
        assert_eq!(args.key.index(), 10);
        assert_eq!(args.scale, ScaleKind::Minor);
        let config = build_config(&args).unwrap();
        assert_eq!(config.threshold, 0.2);
        assert!(!config.monitor_output);
        assert_eq!(config.frame_length, 2048);
    }

    fn event(note_label: &str) -> DetectionEvent {
        DetectionEvent {
            frequency_hz: 440.0,
            note_label: note_label.to_string(),
            cents_deviation: 0.0,
            confidence: 1.0,
        }
    }

    #[test]
    fn interrupt_ends_an_open_ended_run() {
        let (event_tx, events) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown) = crossbeam_channel::bounded(1);
        event_tx.send(event("A4")).unwrap();

        let mut seen = Vec::new();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            shutdown_tx.send(()).unwrap();
            event_tx
        });
        let reason = pump_events(&events, &shutdown, None, |e| seen.push(e.note_label.clone()));
        let _event_tx = worker.join().unwrap();

        assert_eq!(reason, StopReason::Interrupted);
        assert_eq!(seen, vec!["A4".to_string()]);
    }

    #[test]
    fn deadline_and_closed_channel_end_the_run() {
        let (_event_tx, events) = crossbeam_channel::bounded::<DetectionEvent>(1);
        let (_shutdown_tx, shutdown) = crossbeam_channel::bounded(1);
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        assert_eq!(pump_events(&events, &shutdown, deadline, |_| {}), StopReason::DeadlineReached);

        let (event_tx, events) = crossbeam_channel::bounded::<DetectionEvent>(1);
        drop(event_tx);
        assert_eq!(pump_events(&events, &shutdown, None, |_| {}), StopReason::DetectionClosed);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_volumes() {
        assert!(Args::try_parse_from(["jendrix-tune", "--key", "H"]).is_err());
        let args = Args::parse_from(["jendrix-tune", "--volume", "4"]);
        assert!(build_config(&args).is_err());
    }
}
