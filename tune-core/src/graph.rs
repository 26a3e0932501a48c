//! # Routing Graph
//!
//! The signal path owned by the router:
//!
//! ```text
//! capture -> analysis tap -> gain -> monitor output
//! ```
//!
//! Every node is cheap to clone (shared handles), so the device callback,
//! the output callback and the detection task each hold their own copy.
//! A disconnected graph drops everything it is fed.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use crate::fft;

/// Number of monitor chunks buffered between the input and output callbacks.
const MONITOR_QUEUE_DEPTH: usize = 16;
/// Chunk buffers in circulation: the queue, the reader's current chunk and
/// one being filled.
const MONITOR_POOL_SIZE: usize = MONITOR_QUEUE_DEPTH + 2;
/// Samples each pooled chunk can hold before it has to grow.
const MONITOR_CHUNK_CAPACITY: usize = 2048;

/// An `f32` that can be read and written from several threads.
#[derive(Debug, Clone)]
pub struct SharedF32(Arc<AtomicU32>);

impl SharedF32 {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Keeps the most recent `capacity` captured samples.
#[derive(Debug, Clone)]
pub struct AnalysisTap {
    samples: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl AnalysisTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends captured samples, discarding the oldest beyond capacity.
    pub fn push(&self, data: &[f32]) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        let incoming = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (samples.len() + incoming.len()).saturating_sub(self.capacity);
        samples.drain(..overflow);
        samples.extend(incoming.iter().copied());
    }

    /// Copies the latest `out.len()` samples into `out`.
    ///
    /// # Returns
    /// * `false` - if fewer samples than requested have been captured yet
    pub fn snapshot_into(&self, out: &mut [f32]) -> bool {
        let Ok(samples) = self.samples.lock() else {
            return false;
        };
        if samples.len() < out.len() {
            return false;
        }
        let skip = samples.len() - out.len();
        for (dst, src) in out.iter_mut().zip(samples.iter().skip(skip)) {
            *dst = *src;
        }
        true
    }

    /// Copy of everything currently held, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples
            .lock()
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }
}

/// Output side of the monitor path, owned by the output callback.
///
/// Pulls gained chunks from the graph and pads with silence on underrun.
/// Spent chunks go back to the graph's pool.
#[derive(Debug)]
pub struct MonitorReader {
    receiver: Receiver<Vec<f32>>,
    recycle: Sender<Vec<f32>>,
    readers: Arc<AtomicUsize>,
    pending: Vec<f32>,
    position: usize,
}

impl MonitorReader {
    /// Fills `out` with monitor samples, zeros where none are queued.
    pub fn fill(&mut self, out: &mut [f32]) {
        let mut written = 0;
        while written < out.len() {
            if self.position >= self.pending.len() {
                match self.receiver.try_recv() {
                    Ok(chunk) => {
                        let spent = std::mem::replace(&mut self.pending, chunk);
                        if spent.capacity() > 0 {
                            let _ = self.recycle.try_send(spent);
                        }
                        self.position = 0;
                        continue;
                    }
                    Err(_) => break,
                }
            }
            let n = (out.len() - written).min(self.pending.len() - self.position);
            out[written..written + n].copy_from_slice(&self.pending[self.position..self.position + n]);
            written += n;
            self.position += n;
        }
        out[written..].fill(0.0);
    }
}

impl Drop for MonitorReader {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Capture -> analysis tap -> gain -> output.
#[derive(Debug, Clone)]
pub struct RoutingGraph {
    tap: AnalysisTap,
    gain: SharedF32,
    connected: Arc<AtomicBool>,
    monitor_tx: Sender<Vec<f32>>,
    monitor_rx: Receiver<Vec<f32>>,
    recycle_tx: Sender<Vec<f32>>,
    recycle_rx: Receiver<Vec<f32>>,
    monitor_readers: Arc<AtomicUsize>,
    monitor_enabled: bool,
}

impl RoutingGraph {
    /// Creates a disconnected graph.
    ///
    /// # Arguments
    /// * `frame_length` - Samples the analysis tap keeps
    /// * `volume` - Initial gain, clamped to `[0, 1]`
    /// * `monitor_enabled` - Whether the gain stage feeds an output
    pub fn new(frame_length: usize, volume: f32, monitor_enabled: bool) -> Self {
        let (monitor_tx, monitor_rx) = crossbeam_channel::bounded(MONITOR_QUEUE_DEPTH);
        let (recycle_tx, recycle_rx) = crossbeam_channel::bounded(MONITOR_POOL_SIZE);
        if monitor_enabled {
            for _ in 0..MONITOR_POOL_SIZE {
                let _ = recycle_tx.try_send(Vec::with_capacity(MONITOR_CHUNK_CAPACITY));
            }
        }
        Self {
            tap: AnalysisTap::new(frame_length),
            gain: SharedF32::new(clamp_volume(volume)),
            connected: Arc::new(AtomicBool::new(false)),
            monitor_tx,
            monitor_rx,
            recycle_tx,
            recycle_rx,
            monitor_readers: Arc::new(AtomicUsize::new(0)),
            monitor_enabled,
        }
    }

    pub fn tap(&self) -> &AnalysisTap {
        &self.tap
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor_enabled
    }

    pub fn connect(&self) {
        debug!("Routing graph connected");
        self.connected.store(true, Ordering::Release);
    }

    /// Stops the flow through every node and empties the buffers.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!("Routing graph disconnected");
        }
        self.tap.clear();
        while let Ok(chunk) = self.monitor_rx.try_recv() {
            let _ = self.recycle_tx.try_send(chunk);
        }
    }

    pub fn volume(&self) -> f32 {
        self.gain.get()
    }

    /// Sets the output gain, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) {
        self.gain.set(clamp_volume(volume));
    }

    /// Entry point for the capture node, called from the device callback
    /// with mono samples.
    ///
    /// The gain stage only runs while an output reader exists, and fills
    /// pooled chunks so a warm callback does not allocate.
    pub fn process_input(&self, samples: &[f32]) {
        if !self.is_connected() {
            return;
        }
        self.tap.push(samples);

        if self.monitor_enabled && self.monitor_readers.load(Ordering::Acquire) > 0 {
            let gain = self.gain.get();
            let mut chunk = self.recycle_rx.try_recv().unwrap_or_default();
            chunk.clear();
            chunk.extend(samples.iter().map(|&s| s * gain));
            if let Err(TrySendError::Full(chunk)) = self.monitor_tx.try_send(chunk) {
                trace!("Monitor queue full, dropping chunk");
                let _ = self.recycle_tx.try_send(chunk);
            }
        }
    }

    /// Reader for the output node.
    pub fn monitor_reader(&self) -> MonitorReader {
        self.monitor_readers.fetch_add(1, Ordering::AcqRel);
        MonitorReader {
            receiver: self.monitor_rx.clone(),
            recycle: self.recycle_tx.clone(),
            readers: self.monitor_readers.clone(),
            pending: Vec::new(),
            position: 0,
        }
    }

    /// Copy of the analysis tap, oldest sample first.
    pub fn time_domain_snapshot(&self) -> Vec<f32> {
        self.tap.snapshot()
    }

    /// Magnitude spectrum of the analysis tap.
    pub fn frequency_snapshot(&self) -> Vec<f32> {
        fft::magnitude_spectrum(&self.tap.snapshot())
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp(0.0, 1.0)
}
