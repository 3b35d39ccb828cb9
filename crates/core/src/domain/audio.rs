//! Audio format, device and backend abstractions
//!
//! This module defines the platform-agnostic side of capture and playback.
//! The `infra` crate implements [`AudioBackend`] on top of an external
//! capture process and CPAL; tests implement it with synthetic sources.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Format configuration cannot be used by the pipeline
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// No output device is available at all
    #[error("No audio output device available")]
    NoOutputDevice,

    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The capture process could not be launched
    #[error("Failed to start capture: {0}")]
    CaptureSpawn(String),

    /// A capture source did not confirm startup within its timeout
    #[error("Capture did not start within {0} ms")]
    CaptureStartupTimeout(u64),

    /// The capture process exited, crashed or its stream broke while running
    #[error("Capture stopped unexpectedly: {0}")]
    CaptureExited(String),

    /// Error in output stream creation
    #[error("Stream error: {0}")]
    StreamError(String),

    /// A blocking write to the output device failed
    #[error("Output write failed: {0}")]
    WriteFailed(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),
}

impl AudioError {
    /// Whether this error can only happen while starting a session
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            AudioError::InvalidFormat(_)
                | AudioError::NoOutputDevice
                | AudioError::DeviceNotFound(_)
                | AudioError::CaptureSpawn(_)
                | AudioError::CaptureStartupTimeout(_)
                | AudioError::StreamError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Supported audio sample formats
///
/// The pipeline runs a single native format end to end; there is no format
/// negotiation with the capture process or the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit IEEE float, little-endian
    #[default]
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32Le => 4,
        }
    }

    /// Name understood by PulseAudio tools (`--format=`)
    pub fn pulse_name(&self) -> &'static str {
        match self {
            SampleFormat::F32Le => "float32le",
        }
    }
}

/// Fixed stream format shared by capture, filtering and output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            sample_format: SampleFormat::F32Le,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::F32Le,
        }
    }

    /// Size of one interleaved frame in bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// Bytes of audio covering `duration`, rounded down to whole frames
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_micros()) / 1_000_000;
        frames as usize * self.bytes_per_frame()
    }

    /// Largest frame-aligned length not exceeding `len`
    pub fn align_down(&self, len: usize) -> usize {
        let frame = self.bytes_per_frame();
        if frame == 0 {
            return 0;
        }
        len - len % frame
    }

    /// Check that the filter bank and both stream ends can use this format
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.channels) {
            return Err(AudioError::InvalidFormat(format!(
                "channel count {} (expected 1 or 2)",
                self.channels
            )));
        }

        let nyquist = self.sample_rate as f64 / 2.0;
        let highest_band = crate::domain::dsp::BAND_FREQUENCIES[crate::domain::dsp::BAND_COUNT - 1];
        if nyquist <= highest_band {
            return Err(AudioError::InvalidFormat(format!(
                "sample rate {} Hz puts the {} Hz band above Nyquist",
                self.sample_rate, highest_band
            )));
        }

        Ok(())
    }
}

/// Decode interleaved little-endian f32 bytes into `out`, replacing its contents
pub fn decode_samples(bytes: &[u8], out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    );
}

/// Encode samples back into `bytes` as little-endian f32
///
/// `bytes` must hold exactly `samples.len() * 4` bytes.
pub fn encode_samples(samples: &[f32], bytes: &mut [u8]) {
    for (dst, sample) in bytes.chunks_exact_mut(4).zip(samples) {
        dst.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Unique identifier for an audio device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Information about an output device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    /// Whether the platform reports this as its default output
    pub is_default: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, is_default: bool) -> Self {
        let name = name.into();
        Self {
            id: DeviceId::new(name.clone()),
            name,
            is_default,
        }
    }
}

/// Pick the output device for a session
///
/// Prefers the first device whose name contains `keyword` (case-insensitive),
/// then the platform default, then whatever device was listed first.
pub fn select_output_device<'a>(devices: &'a [DeviceInfo], keyword: &str) -> Result<&'a DeviceInfo> {
    let needle = keyword.to_lowercase();

    if !needle.is_empty() {
        if let Some(device) = devices
            .iter()
            .find(|d| d.name.to_lowercase().contains(&needle))
        {
            return Ok(device);
        }
    }

    devices
        .iter()
        .find(|d| d.is_default)
        .or_else(|| devices.first())
        .ok_or(AudioError::NoOutputDevice)
}

/// Raw PCM byte stream delivered by a capture process
pub trait CaptureSource: Send {
    /// Wait up to `timeout` for captured bytes
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Chunks are not
    /// guaranteed to be frame-aligned. An error means the capture ended and
    /// will not deliver any more data.
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Stop capturing and release the underlying process
    ///
    /// Blocks until the capture is confirmed gone. Calling it twice is a no-op.
    fn shutdown(&mut self);
}

/// Blocking PCM writer bound to one output device
pub trait AudioSink: Send {
    /// Write frame-aligned bytes, blocking while the device buffer is full
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block until the device has consumed everything written so far
    fn drain(&mut self) -> Result<()>;

    /// Release the device
    fn close(&mut self);
}

/// Factory for the capture and output ends of a session
pub trait AudioBackend: Send + Sync {
    /// List all available output devices
    fn output_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Launch the capture side for `format`
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn CaptureSource>>;

    /// Open a blocking write stream on `device`
    fn open_sink(&self, device: &DeviceInfo, format: &AudioFormat) -> Result<Box<dyn AudioSink>>;
}
