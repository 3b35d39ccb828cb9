//! Synthetic audio backend for integration tests
//!
//! [`SyntheticBackend`] replays scripted capture chunks and records every
//! byte written to its sink, so tests can drive an `EqualizerProcessor`
//! end to end without a capture process or a sound card. Probes count
//! opens, shutdowns and closes to check that sessions release everything.

use minstrel_core::domain::audio::{
    encode_samples, AudioBackend, AudioError, AudioFormat, AudioSink, CaptureSource, DeviceInfo,
    Result,
};
use minstrel_core::domain::dsp::{EqualizerEngine, BAND_COUNT};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// What the capture does once its scripted chunks run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterScript {
    /// Keep running without delivering data
    Idle,
    /// Fail as if the capture process died
    Crash,
}

/// Observations about the capture side
#[derive(Debug, Default)]
pub struct CaptureProbe {
    pub opened: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub live: AtomicUsize,
}

/// Observations about the output side
#[derive(Debug, Default)]
pub struct SinkProbe {
    pub opened: AtomicUsize,
    pub writes: AtomicUsize,
    pub drains: AtomicUsize,
    pub closes: AtomicUsize,
    pub live: AtomicUsize,
    bytes: Mutex<Vec<u8>>,
}

impl SinkProbe {
    /// Everything written so far, in order
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn byte_count(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }
}

struct ScriptedCapture {
    chunks: VecDeque<Vec<u8>>,
    after: AfterScript,
    probe: Arc<CaptureProbe>,
    released: bool,
}

impl CaptureSource for ScriptedCapture {
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        match self.after {
            AfterScript::Crash => Err(AudioError::CaptureExited(
                "synthetic capture crashed".to_string(),
            )),
            AfterScript::Idle => {
                thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn shutdown(&mut self) {
        if !self.released {
            self.released = true;
            self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct RecordingSink {
    probe: Arc<SinkProbe>,
    fail_after_writes: Option<usize>,
    closed: bool,
}

impl AudioSink for RecordingSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let done = self.probe.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after_writes {
            if done >= limit {
                return Err(AudioError::WriteFailed("synthetic device unplugged".to_string()));
            }
        }
        self.probe.bytes.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.probe.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            self.probe.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Scriptable [`AudioBackend`]
pub struct SyntheticBackend {
    devices: Vec<DeviceInfo>,
    chunks: Mutex<Vec<Vec<u8>>>,
    after: AfterScript,
    capture_error: Option<AudioError>,
    fail_after_writes: Option<usize>,
    capture: Arc<CaptureProbe>,
    sink: Arc<SinkProbe>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    /// Backend with one default output device and an idle capture
    pub fn new() -> Self {
        Self {
            devices: vec![
                DeviceInfo::new("Built-in Speakers", true),
                DeviceInfo::new("Equalizer_Output", false),
            ],
            chunks: Mutex::new(Vec::new()),
            after: AfterScript::Idle,
            capture_error: None,
            fail_after_writes: None,
            capture: Arc::default(),
            sink: Arc::default(),
        }
    }

    /// Chunks replayed by every capture opened from now on
    pub fn with_chunks(self, chunks: Vec<Vec<u8>>) -> Self {
        *self.chunks.lock().unwrap() = chunks;
        self
    }

    pub fn crash_after_script(mut self) -> Self {
        self.after = AfterScript::Crash;
        self
    }

    pub fn fail_writes_after(mut self, writes: usize) -> Self {
        self.fail_after_writes = Some(writes);
        self
    }

    pub fn without_devices(mut self) -> Self {
        self.devices.clear();
        self
    }

    pub fn fail_capture_start(mut self, error: AudioError) -> Self {
        self.capture_error = Some(error);
        self
    }

    pub fn capture_probe(&self) -> Arc<CaptureProbe> {
        Arc::clone(&self.capture)
    }

    pub fn sink_probe(&self) -> Arc<SinkProbe> {
        Arc::clone(&self.sink)
    }
}

impl AudioBackend for SyntheticBackend {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn open_capture(&self, _format: &AudioFormat) -> Result<Box<dyn CaptureSource>> {
        if let Some(e) = &self.capture_error {
            return Err(e.clone());
        }
        self.capture.opened.fetch_add(1, Ordering::SeqCst);
        self.capture.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedCapture {
            chunks: self.chunks.lock().unwrap().iter().cloned().collect(),
            after: self.after,
            probe: Arc::clone(&self.capture),
            released: false,
        }))
    }

    fn open_sink(&self, _device: &DeviceInfo, _format: &AudioFormat) -> Result<Box<dyn AudioSink>> {
        self.sink.opened.fetch_add(1, Ordering::SeqCst);
        self.sink.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            probe: Arc::clone(&self.sink),
            fail_after_writes: self.fail_after_writes,
            closed: false,
        }))
    }
}

/// Interleaved sine at `frequency`, identical on every channel, as f32 LE bytes
pub fn sine_bytes(format: &AudioFormat, frequency: f64, frames: usize) -> Vec<u8> {
    let channels = format.channels as usize;
    let samples: Vec<f32> = (0..frames)
        .flat_map(|i| {
            let t = i as f64 / format.sample_rate as f64;
            let s = (0.5 * (2.0 * std::f64::consts::PI * frequency * t).sin()) as f32;
            std::iter::repeat(s).take(channels)
        })
        .collect();

    let mut bytes = vec![0u8; samples.len() * 4];
    encode_samples(&samples, &mut bytes);
    bytes
}

/// Cut `bytes` into chunks cycling through `sizes`, ignoring frame boundaries
pub fn split_irregular(bytes: &[u8], sizes: &[usize]) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    for size in sizes.iter().cycle() {
        if offset >= bytes.len() {
            break;
        }
        let end = (offset + (*size).max(1)).min(bytes.len());
        chunks.push(bytes[offset..end].to_vec());
        offset = end;
    }
    chunks
}

/// Filter `bytes` in one pass with a fresh equalizer
pub fn filter_reference(format: &AudioFormat, gains: [f64; BAND_COUNT], bytes: &[u8]) -> Vec<u8> {
    let (_, mut bank) = EqualizerEngine::with_gains(format.sample_rate as f64, gains).into_parts();
    let mut out = bytes.to_vec();
    bank.process_bytes(&mut out, format.channels as usize);
    out
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Route `tracing` output through the test harness; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_irregular_covers_everything() {
        let bytes: Vec<u8> = (0..100).collect();
        let chunks = split_irregular(&bytes, &[7, 13, 1]);
        assert_eq!(chunks.concat(), bytes);
        assert_eq!(chunks[0].len(), 7);
        assert_eq!(chunks[1].len(), 13);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn test_sine_bytes_length() {
        let format = AudioFormat::new(44100, 2);
        assert_eq!(sine_bytes(&format, 440.0, 100).len(), 100 * 8);
    }

    #[test]
    fn test_scripted_capture_crashes_after_script() {
        let backend = SyntheticBackend::new()
            .with_chunks(vec![vec![1, 2, 3]])
            .crash_after_script();
        let mut capture = backend.open_capture(&AudioFormat::default()).unwrap();

        assert_eq!(capture.read(Duration::ZERO).unwrap(), Some(vec![1, 2, 3]));
        assert!(capture.read(Duration::ZERO).is_err());

        capture.shutdown();
        capture.shutdown();
        assert_eq!(backend.capture_probe().shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(backend.capture_probe().live.load(Ordering::SeqCst), 0);
    }
}
