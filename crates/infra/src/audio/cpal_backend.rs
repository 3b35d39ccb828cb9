//! CPAL-based output devices and the system audio backend
//!
//! CPAL streams are pull-based: the device thread asks for samples through a
//! callback. [`CpalSink`] turns that into the blocking-write contract of
//! [`AudioSink`] with a bounded channel of sample blocks, so a write returns
//! only once its audio is queued for the device.

use super::capture::{CaptureSettings, CaptureSupervisor};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig as CpalStreamConfig;
use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender};
use crossbeam::utils::CachePadded;
use minstrel_core::domain::audio::{
    decode_samples, AudioBackend, AudioError, AudioFormat, AudioSink, CaptureSource, DeviceInfo,
    Result,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sample blocks queued ahead of the device callback
const SINK_QUEUE_BLOCKS: usize = 2;

/// How often a blocked write re-checks for a device failure
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Slack added to the expected playout time when draining
const DRAIN_MARGIN: Duration = Duration::from_millis(500);

/// Enumerates output devices of the default CPAL host
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalEnumerator;

impl CpalEnumerator {
    pub fn new() -> Self {
        Self
    }

    /// List output devices, flagging the host default
    pub fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        debug!("Using audio host: {:?}", host.id());

        #[allow(deprecated)]
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host
            .output_devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        let mut infos = Vec::new();
        for device in devices {
            #[allow(deprecated)]
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping device due to error: {}", e);
                    continue;
                }
            };
            let is_default = default_name.as_deref() == Some(name.as_str());
            debug!("Found output device: {}", name);
            infos.push(DeviceInfo::new(name, is_default));
        }

        info!("Found {} output devices", infos.len());
        Ok(infos)
    }

    /// Look up the CPAL device behind `info`
    fn find_device(&self, info: &DeviceInfo) -> Result<cpal::Device> {
        let host = cpal::default_host();
        #[allow(deprecated)]
        let device = host
            .output_devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(info.id.as_str()));

        device.ok_or_else(|| AudioError::DeviceNotFound(info.name.clone()))
    }
}

/// State shared between the writer and the device callback
#[derive(Debug, Default)]
struct SinkShared {
    /// Samples written but not yet handed to the device
    pending: CachePadded<AtomicUsize>,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl SinkShared {
    fn fail(&self, message: String) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(message);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn failure(&self) -> Option<AudioError> {
        if !self.failed.load(Ordering::Acquire) {
            return None;
        }
        let message = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "output stream failed".to_string());
        Some(AudioError::WriteFailed(message))
    }
}

/// Blocking writer on a CPAL output stream
///
/// The stream lives on its own thread, which keeps this handle `Send` on
/// every host.
pub struct CpalSink {
    blocks: Option<Sender<Vec<f32>>>,
    shutdown: Option<Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
    shared: Arc<SinkShared>,
    format: AudioFormat,
    block_samples: usize,
    scratch: Vec<f32>,
}

impl CpalSink {
    /// Open and start an output stream on `device`
    pub fn open(
        enumerator: &CpalEnumerator,
        device: &DeviceInfo,
        format: &AudioFormat,
        buffer_frames: usize,
    ) -> Result<Self> {
        info!(
            "Creating output stream: device={}, format={:?}",
            device.name, format
        );

        let cpal_device = enumerator.find_device(device)?;
        let cpal_config = CpalStreamConfig {
            channels: format.channels,
            sample_rate: format.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let block_samples = buffer_frames.max(1) * format.channels as usize;
        let (block_tx, block_rx) = bounded::<Vec<f32>>(SINK_QUEUE_BLOCKS);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let shared = Arc::new(SinkShared::default());

        let thread_shared = Arc::clone(&shared);
        let stream_thread = thread::Builder::new()
            .name("output-stream".to_string())
            .spawn(move || {
                run_stream(
                    cpal_device,
                    cpal_config,
                    block_rx,
                    shutdown_rx,
                    ready_tx,
                    thread_shared,
                )
            })
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = stream_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stream_thread.join();
                return Err(AudioError::StreamError(
                    "output stream thread exited during setup".to_string(),
                ));
            }
        }

        debug!(block_samples, "Output stream running");
        Ok(Self {
            blocks: Some(block_tx),
            shutdown: Some(shutdown_tx),
            stream_thread: Some(stream_thread),
            shared,
            format: *format,
            block_samples,
            scratch: Vec::new(),
        })
    }

    fn send_block(&self, blocks: &Sender<Vec<f32>>, mut block: Vec<f32>) -> Result<()> {
        let len = block.len();
        self.shared.pending.fetch_add(len, Ordering::AcqRel);
        loop {
            if let Some(e) = self.shared.failure() {
                self.shared.pending.fetch_sub(len, Ordering::AcqRel);
                return Err(e);
            }
            match blocks.send_timeout(block, WRITE_RETRY_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => block = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.shared.pending.fetch_sub(len, Ordering::AcqRel);
                    return Err(AudioError::WriteFailed("output stream closed".to_string()));
                }
            }
        }
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(e) = self.shared.failure() {
            return Err(e);
        }
        let Some(blocks) = self.blocks.clone() else {
            return Err(AudioError::WriteFailed("output stream closed".to_string()));
        };

        let mut scratch = std::mem::take(&mut self.scratch);
        decode_samples(bytes, &mut scratch);
        let result = scratch
            .chunks(self.block_samples)
            .try_for_each(|block| self.send_block(&blocks, block.to_vec()));
        self.scratch = scratch;
        result
    }

    fn drain(&mut self) -> Result<()> {
        let pending = self.shared.pending.load(Ordering::Acquire);
        let samples_per_sec = self.format.sample_rate as u64 * self.format.channels as u64;
        let playout = Duration::from_millis(pending as u64 * 1000 / samples_per_sec.max(1));
        let deadline = Instant::now() + playout + DRAIN_MARGIN;

        while self.shared.pending.load(Ordering::Acquire) > 0 {
            if let Some(e) = self.shared.failure() {
                return Err(e);
            }
            if Instant::now() >= deadline {
                warn!(
                    pending = self.shared.pending.load(Ordering::Acquire),
                    "Output drain timed out"
                );
                return Err(AudioError::WriteFailed("drain timed out".to_string()));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.blocks = None;
        self.shutdown = None;
        if let Some(handle) = self.stream_thread.take() {
            if handle.join().is_err() {
                error!("Output stream thread panicked");
            }
            info!("Output stream closed");
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CpalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalSink")
            .field("format", &self.format)
            .field("block_samples", &self.block_samples)
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish()
    }
}

/// Build the stream, report readiness, then hold it until shutdown
fn run_stream(
    device: cpal::Device,
    config: CpalStreamConfig,
    blocks: Receiver<Vec<f32>>,
    shutdown: Receiver<()>,
    ready: Sender<Result<()>>,
    shared: Arc<SinkShared>,
) {
    let mut current: VecDeque<f32> = VecDeque::new();
    let callback_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut filled = 0;
            while filled < data.len() {
                if current.is_empty() {
                    match blocks.try_recv() {
                        Ok(block) => current.extend(block),
                        Err(_) => break,
                    }
                }
                let n = current.len().min(data.len() - filled);
                for (dst, src) in data[filled..filled + n].iter_mut().zip(current.drain(..n)) {
                    *dst = src;
                }
                filled += n;
            }
            // Underrun: play silence rather than stale samples.
            data[filled..].fill(0.0);
            callback_shared.pending.fetch_sub(filled, Ordering::AcqRel);
        },
        move |err| {
            error!("Output stream error: {}", err);
            error_shared.fail(err.to_string());
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(AudioError::StreamError(format!(
                "Failed to build stream: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(AudioError::StreamError(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    if ready.send(Ok(())).is_err() {
        return;
    }

    // Disconnection is the shutdown signal.
    let _ = shutdown.recv();
    drop(stream);
    debug!("Output stream released");
}

/// Production backend: `parec` capture and CPAL output
#[derive(Debug, Clone)]
pub struct SystemBackend {
    enumerator: CpalEnumerator,
    capture: CaptureSettings,
    buffer_frames: usize,
}

impl SystemBackend {
    pub fn new(capture: CaptureSettings, buffer_frames: usize) -> Self {
        Self {
            enumerator: CpalEnumerator::new(),
            capture,
            buffer_frames,
        }
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }
}

impl AudioBackend for SystemBackend {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.enumerator.output_devices()
    }

    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn CaptureSource>> {
        let capture = CaptureSupervisor::start(&self.capture, format)?;
        Ok(Box::new(capture))
    }

    fn open_sink(&self, device: &DeviceInfo, format: &AudioFormat) -> Result<Box<dyn AudioSink>> {
        let sink = CpalSink::open(&self.enumerator, device, format, self.buffer_frames)?;
        Ok(Box::new(sink))
    }
}
