//! # Audio Device Module
//!
//! The seam between the router and the audio hardware, plus the CPAL
//! (Cross-Platform Audio Library) implementation of it.
//!
//! A backend hands out two resources:
//! - a [`ProcessingContext`]: the host, the negotiated sample rate and the
//!   output node the gain stage plays through
//! - a [`CaptureDevice`]: the live input stream feeding the routing graph
//!
//! Both are released explicitly, device first, then context.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfigRange};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::graph::RoutingGraph;

/// Properties requested from the input device.
///
/// Pitch analysis needs the raw signal, so the engine always asks for
/// every form of input processing to be off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Rate the backend should get as close to as it can.
    pub preferred_sample_rate: u32,
}

impl CaptureConstraints {
    /// Unprocessed capture at the given preferred rate.
    pub fn raw(preferred_sample_rate: u32) -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            preferred_sample_rate,
        }
    }

    pub fn is_raw(&self) -> bool {
        !self.echo_cancellation && !self.noise_suppression && !self.auto_gain_control
    }
}

/// Source of processing contexts and input devices.
pub trait CaptureBackend {
    type Context: ProcessingContext;
    type Device: CaptureDevice;

    /// Opens the host side and settles on a sample rate.
    fn create_context(&mut self, constraints: &CaptureConstraints) -> Result<Self::Context>;

    /// Acquires the input device and routes its samples into `graph`.
    fn acquire_input(
        &mut self,
        context: &mut Self::Context,
        constraints: &CaptureConstraints,
        graph: &RoutingGraph,
    ) -> Result<Self::Device>;
}

/// Host-side processing state, the equivalent of an audio context.
pub trait ProcessingContext {
    fn sample_rate(&self) -> u32;

    /// Attaches the graph's gain stage to the output.
    fn connect_output(&mut self, graph: &RoutingGraph) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn suspend(&mut self) -> Result<()>;

    /// Releases the context. Called last during teardown.
    fn close(self);
}

/// A live input device.
pub trait CaptureDevice {
    fn resume(&mut self) -> Result<()>;

    fn suspend(&mut self) -> Result<()>;

    /// Releases the device. Called before the context is closed.
    fn release(self);
}

/// Backend built on the default CPAL host.
///
/// CPAL hands over the device signal as the driver delivers it, with no
/// echo cancellation, noise suppression or gain control in between, which
/// is exactly what [`CaptureConstraints::raw`] asks for.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Host, chosen input device and the optional monitor output stream.
pub struct CpalContext {
    host: cpal::Host,
    input_device: cpal::Device,
    input_config: cpal::StreamConfig,
    output: Option<cpal::Stream>,
}

/// The input stream feeding the routing graph.
pub struct CpalInput {
    stream: cpal::Stream,
}

impl CaptureBackend for CpalBackend {
    type Context = CpalContext;
    type Device = CpalInput;

    fn create_context(&mut self, constraints: &CaptureConstraints) -> Result<CpalContext> {
        if !constraints.is_raw() {
            return Err(EngineError::capture(
                "input processing cannot be enabled on the CPAL backend",
            ));
        }

        let host = cpal::default_host();
        let input_device = host
            .default_input_device()
            .ok_or_else(|| EngineError::capture("No input device available"))?;

        info!(
            "Using audio input device: {}",
            input_device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let configs = input_device
            .supported_input_configs()
            .map_err(EngineError::capture)?
            .collect::<Vec<_>>();
        let supported = find_supported_config(configs, constraints.preferred_sample_rate)
            .ok_or_else(|| EngineError::capture("No suitable f32 input format found"))?;

        let rate = constraints
            .preferred_sample_rate
            .clamp(supported.min_sample_rate().0, supported.max_sample_rate().0);
        let input_config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).into();

        info!(
            "Selected sample rate: {} Hz, {} input channel(s)",
            input_config.sample_rate.0, input_config.channels
        );

        Ok(CpalContext {
            host,
            input_device,
            input_config,
            output: None,
        })
    }

    fn acquire_input(
        &mut self,
        context: &mut CpalContext,
        _constraints: &CaptureConstraints,
        graph: &RoutingGraph,
    ) -> Result<CpalInput> {
        let channels = context.input_config.channels.max(1) as usize;
        let graph = graph.clone();
        let mut mono = Vec::new();

        let stream = context
            .input_device
            .build_input_stream(
                &context.input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if channels == 1 {
                        graph.process_input(data);
                        return;
                    }
                    mono.clear();
                    mono.extend(
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                    graph.process_input(&mono);
                },
                |err| error!("An error occurred on the input stream: {}", err),
                None,
            )
            .map_err(EngineError::capture)?;

        // Some hosts start streams as soon as they are built.
        stream.pause().map_err(EngineError::capture)?;
        debug!("Input stream built");

        Ok(CpalInput { stream })
    }
}

impl ProcessingContext for CpalContext {
    fn sample_rate(&self) -> u32 {
        self.input_config.sample_rate.0
    }

    fn connect_output(&mut self, graph: &RoutingGraph) -> Result<()> {
        if !graph.monitor_enabled() {
            debug!("Monitor output disabled");
            return Ok(());
        }

        // Monitoring is a convenience; analysis runs without it.
        let Some(device) = self.host.default_output_device() else {
            warn!("No output device available, monitoring disabled");
            return Ok(());
        };
        let channels = match device.default_output_config() {
            Ok(config) => config.channels().max(1) as usize,
            Err(e) => {
                warn!("No usable output config ({}), monitoring disabled", e);
                return Ok(());
            }
        };
        let config = cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: self.input_config.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let mut reader = graph.monitor_reader();
        let mut mono = Vec::new();
        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                reader.fill(&mut mono);
                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill(sample);
                }
            },
            |err| error!("An error occurred on the output stream: {}", err),
            None,
        );

        match stream {
            Ok(stream) => {
                if let Err(e) = stream.pause() {
                    warn!("Could not pause new output stream: {}", e);
                }
                info!(
                    "Monitoring through: {}",
                    device.name().unwrap_or_else(|_| "Unknown".to_string())
                );
                self.output = Some(stream);
            }
            Err(e) => warn!("Could not open output stream ({}), monitoring disabled", e),
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if let Some(output) = &self.output {
            output.play().map_err(|e| EngineError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if let Some(output) = &self.output {
            output.pause().map_err(|e| EngineError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn close(self) {
        if let Some(output) = self.output {
            if let Err(e) = output.pause() {
                warn!("Error pausing output stream: {}", e);
            }
            drop(output);
        }
        debug!("Processing context closed");
    }
}

impl CaptureDevice for CpalInput {
    fn resume(&mut self) -> Result<()> {
        self.stream.play().map_err(|e| EngineError::Stream(e.to_string()))
    }

    fn suspend(&mut self) -> Result<()> {
        self.stream.pause().map_err(|e| EngineError::Stream(e.to_string()))
    }

    fn release(self) {
        if let Err(e) = self.stream.pause() {
            warn!("Error pausing input stream: {}", e);
        }
        drop(self.stream);
        debug!("Input device released");
    }
}

/// Finds the best supported f32 input configuration.
///
/// Mono is preferred over multi-channel, then the range closest to the
/// target rate wins.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .min_by_key(|c| {
            let distance = if (c.min_sample_rate().0..=c.max_sample_rate().0).contains(&target_rate) {
                0
            } else {
                let min_diff = c.min_sample_rate().0.abs_diff(target_rate);
                let max_diff = c.max_sample_rate().0.abs_diff(target_rate);
                min_diff.min(max_diff)
            };
            (c.channels() != 1, distance)
        })
}
