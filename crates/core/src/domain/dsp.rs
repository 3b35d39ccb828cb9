//! Ten-band peaking equalizer
//!
//! This module provides:
//! - A Direct Form I biquad with peaking-EQ coefficients
//! - Whole-bank coefficient sets computed off the audio thread
//! - [`GainControl`], the control-side handle that publishes new sets
//! - [`FilterBank`], the audio-side cascade that owns all filter state
//! - [`EqualizerEngine`], both halves together for single-threaded use
//!
//! Gain changes never touch filter history: a new coefficient set is swapped
//! in between buffers and the cascade keeps running from its previous state.

use crossbeam::atomic::AtomicCell;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Number of bands in the filter bank
pub const BAND_COUNT: usize = 10;

/// Center frequency of each band in Hz, in band-index order
pub const BAND_FREQUENCIES: [f64; BAND_COUNT] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Parameter constraints for the filter bank
pub mod params {
    /// Band gain range in dB
    pub const GAIN_MIN_DB: f64 = -30.0;
    pub const GAIN_MAX_DB: f64 = 30.0;

    /// Q shared by every band
    pub const BAND_Q: f64 = 1.0;

    /// Bands at or below this absolute gain are skipped while processing
    pub const BYPASS_THRESHOLD_DB: f64 = 0.01;

    /// Magnitudes below this are flushed to zero
    pub const DENORMAL_THRESHOLD: f64 = 1e-15;

    /// Hard limit on each filter's output
    pub const OUTPUT_LIMIT: f64 = 10.0;

    /// Sample rate used before one is configured
    pub const DEFAULT_SAMPLE_RATE: f64 = 48000.0;
}

/// Clamp a requested band gain into the supported range
///
/// NaN is treated as flat.
#[inline]
pub fn clamp_gain(gain_db: f64) -> f64 {
    if gain_db.is_nan() {
        return 0.0;
    }
    gain_db.clamp(params::GAIN_MIN_DB, params::GAIN_MAX_DB)
}

#[inline]
fn flush_denormal(value: f64) -> f64 {
    if value.abs() < params::DENORMAL_THRESHOLD {
        0.0
    } else {
        value
    }
}

// ============================================================================
// BIQUAD FILTER
// ============================================================================

/// Biquad filter coefficients
///
/// Normalized so that a0 is 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    /// Numerator coefficients
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    /// Denominator coefficients (a0 is normalized to 1.0)
    pub a1: f64,
    pub a2: f64,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        // Unity gain (no filtering)
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Calculate coefficients for a peaking EQ filter (Audio EQ Cookbook)
    ///
    /// Boosts or cuts frequencies around `frequency` while leaving the rest of
    /// the spectrum near unity. At 0 dB the numerator and denominator are
    /// identical, so the section is an exact identity.
    #[must_use]
    pub fn peaking(frequency: f64, sample_rate: f64, gain_db: f64, q: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * std::f64::consts::PI * frequency / sample_rate;
        let alpha = omega.sin() / (2.0 * q);
        let cos_w = omega.cos();

        let a0 = 1.0 + alpha / a;

        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    /// Both poles strictly inside the unit circle (stability triangle)
    pub fn is_stable(&self) -> bool {
        self.a2.abs() < 1.0 && self.a1.abs() < 1.0 + self.a2
    }

    /// Magnitude response in dB at `frequency`
    pub fn magnitude_db(&self, frequency: f64, sample_rate: f64) -> f64 {
        let omega = 2.0 * std::f64::consts::PI * frequency / sample_rate;
        let z1 = Complex64::from_polar(1.0, -omega);
        let z2 = z1 * z1;

        let numerator = self.b0 + self.b1 * z1 + self.b2 * z2;
        let denominator = 1.0 + self.a1 * z1 + self.a2 * z2;

        20.0 * (numerator / denominator).norm().log10()
    }
}

/// Stateful biquad filter using Direct Form I
///
/// Direct Form I keeps the raw input/output history, so swapping
/// coefficients mid-stream does not disturb the stored state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BiquadFilter {
    coeffs: BiquadCoeffs,
    // Previous input samples (x[n-1], x[n-2])
    x1: f64,
    x2: f64,
    // Previous output samples (y[n-1], y[n-2])
    y1: f64,
    y2: f64,
}

impl BiquadFilter {
    /// Create a new biquad filter with given coefficients
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            ..Self::default()
        }
    }

    /// Recompute coefficients as a peaking EQ; state is kept
    pub fn set_peaking_eq(&mut self, frequency: f64, sample_rate: f64, gain_db: f64, q: f64) {
        self.coeffs = BiquadCoeffs::peaking(frequency, sample_rate, gain_db, q);
    }

    /// Replace coefficients; state is kept
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Process a single sample
    #[inline]
    pub fn process(&mut self, input: f64) -> f64 {
        let x = flush_denormal(input);

        // y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
        let y = self.coeffs.b0 * x + self.coeffs.b1 * self.x1 + self.coeffs.b2 * self.x2
            - self.coeffs.a1 * self.y1
            - self.coeffs.a2 * self.y2;

        let y = flush_denormal(y).clamp(-params::OUTPUT_LIMIT, params::OUTPUT_LIMIT);

        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;

        y
    }

    /// Reset filter state
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

// ============================================================================
// COEFFICIENT SETS
// ============================================================================

/// Immutable snapshot of every band's gain and coefficients
///
/// Sets are built whole on the control side and handed to the audio side as
/// one `Arc`, so a reader can never observe a half-updated bank.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSet {
    sample_rate: f64,
    gains: [f64; BAND_COUNT],
    coeffs: [BiquadCoeffs; BAND_COUNT],
}

impl CoefficientSet {
    /// Derive coefficients for all bands; gains must already be clamped
    pub fn compute(sample_rate: f64, gains: [f64; BAND_COUNT]) -> Self {
        let mut coeffs = [BiquadCoeffs::default(); BAND_COUNT];
        for (band, c) in coeffs.iter_mut().enumerate() {
            *c = BiquadCoeffs::peaking(BAND_FREQUENCIES[band], sample_rate, gains[band], params::BAND_Q);
        }

        Self {
            sample_rate,
            gains,
            coeffs,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn gains(&self) -> &[f64; BAND_COUNT] {
        &self.gains
    }

    pub fn coeffs(&self, band: usize) -> Option<&BiquadCoeffs> {
        self.coeffs.get(band)
    }

    /// Whether `band` takes part in processing
    #[inline]
    pub fn is_active(&self, band: usize) -> bool {
        self.gains[band].abs() > params::BYPASS_THRESHOLD_DB
    }

    /// Magnitude response of the active cascade at `frequency`, in dB
    pub fn response_db(&self, frequency: f64) -> f64 {
        (0..BAND_COUNT)
            .filter(|&band| self.is_active(band))
            .map(|band| self.coeffs[band].magnitude_db(frequency, self.sample_rate))
            .sum()
    }
}

// ============================================================================
// GAIN CONTROL (control side)
// ============================================================================

struct GainState {
    current: Arc<CoefficientSet>,
}

struct GainShared {
    state: Mutex<GainState>,
    /// Latest set not yet picked up by the filter bank
    pending: AtomicCell<Option<Arc<CoefficientSet>>>,
}

/// Control-side handle to the equalizer's gain vector
///
/// Cheap to clone and safe to use from any thread. Every mutation recomputes
/// all coefficients and publishes them as one set; the filter bank adopts it
/// at the start of its next buffer. Calls never wait on the audio threads.
#[derive(Clone)]
pub struct GainControl {
    shared: Arc<GainShared>,
}

impl GainControl {
    /// Create a control starting from `gains` (clamped)
    pub fn new(sample_rate: f64, gains: [f64; BAND_COUNT]) -> Self {
        let current = Arc::new(CoefficientSet::compute(sample_rate, gains.map(clamp_gain)));
        Self {
            shared: Arc::new(GainShared {
                state: Mutex::new(GainState { current }),
                pending: AtomicCell::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GainState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute and publish while holding the state lock, so concurrent
    /// callers publish in the same order they mutate.
    fn publish(&self, state: &mut GainState, sample_rate: f64, gains: [f64; BAND_COUNT]) {
        let set = Arc::new(CoefficientSet::compute(sample_rate, gains));
        state.current = Arc::clone(&set);
        self.shared.pending.store(Some(set));

        trace!(sample_rate, ?gains, "Equalizer coefficients published");
    }

    pub fn set_sample_rate(&self, sample_rate: f64) {
        let mut state = self.lock();
        let gains = state.current.gains;
        self.publish(&mut state, sample_rate, gains);
    }

    pub fn sample_rate(&self) -> f64 {
        self.lock().current.sample_rate
    }

    /// Set one band's gain; out-of-range bands are ignored
    pub fn set_band_gain(&self, band: usize, gain_db: f64) {
        if band >= BAND_COUNT {
            return;
        }

        let mut state = self.lock();
        let mut gains = state.current.gains;
        gains[band] = clamp_gain(gain_db);
        let sample_rate = state.current.sample_rate;
        self.publish(&mut state, sample_rate, gains);
    }

    /// Current gain of `band`, or 0.0 for an out-of-range band
    pub fn band_gain(&self, band: usize) -> f64 {
        self.lock().current.gains.get(band).copied().unwrap_or(0.0)
    }

    /// Replace the whole gain vector
    ///
    /// Returns `false` without changing anything when `gains` does not have
    /// exactly [`BAND_COUNT`] entries.
    pub fn set_all_gains(&self, gains: &[f64]) -> bool {
        if gains.len() != BAND_COUNT {
            return false;
        }

        let mut clamped = [0.0; BAND_COUNT];
        for (dst, &gain) in clamped.iter_mut().zip(gains) {
            *dst = clamp_gain(gain);
        }

        let mut state = self.lock();
        let sample_rate = state.current.sample_rate;
        self.publish(&mut state, sample_rate, clamped);
        true
    }

    pub fn all_gains(&self) -> [f64; BAND_COUNT] {
        self.lock().current.gains
    }

    /// The most recently published coefficient set
    pub fn snapshot(&self) -> Arc<CoefficientSet> {
        Arc::clone(&self.lock().current)
    }

    /// Take the newest unseen set, if any
    fn take_pending(&self) -> Option<Arc<CoefficientSet>> {
        self.shared.pending.take()
    }
}

impl std::fmt::Debug for GainControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GainControl")
            .field("gains", &self.all_gains())
            .finish()
    }
}

// ============================================================================
// FILTER BANK (audio side)
// ============================================================================

/// Maximum interleaved channels the bank keeps state for
pub const MAX_CHANNELS: usize = 2;

/// Audio-side cascade: one biquad per (channel, band)
///
/// Owns all filter state. Lives on whichever thread processes audio.
pub struct FilterBank {
    control: GainControl,
    current: Arc<CoefficientSet>,
    filters: [[BiquadFilter; BAND_COUNT]; MAX_CHANNELS],
    active: [bool; BAND_COUNT],
    scratch: Vec<f32>,
}

impl FilterBank {
    /// Create a bank following `control`, starting from its current set
    ///
    /// A control handle feeds one bank at a time; creating a second bank for
    /// the same control leaves the first one without further updates.
    pub fn new(control: &GainControl) -> Self {
        // Anything pending is already reflected in the snapshot.
        let _ = control.take_pending();
        let current = control.snapshot();

        let mut bank = Self {
            control: control.clone(),
            current: Arc::clone(&current),
            filters: Default::default(),
            active: [false; BAND_COUNT],
            scratch: Vec::new(),
        };
        bank.apply(current);
        bank
    }

    fn apply(&mut self, set: Arc<CoefficientSet>) {
        for band in 0..BAND_COUNT {
            let coeffs = set.coeffs[band];
            for channel in self.filters.iter_mut() {
                channel[band].set_coeffs(coeffs);
            }
            self.active[band] = set.is_active(band);
        }
        self.current = set;
    }

    /// Adopt the newest published coefficient set, keeping filter state
    pub fn sync(&mut self) {
        if let Some(set) = self.control.take_pending() {
            self.apply(set);
        }
    }

    /// Coefficient set the bank is currently running
    pub fn coefficients(&self) -> &Arc<CoefficientSet> {
        &self.current
    }

    /// Filter `frame_count` interleaved frames of `buffer` in place
    ///
    /// Bands run in ascending order per channel. Only mono and stereo are
    /// processed; any other channel count leaves the buffer untouched.
    pub fn process_buffer(&mut self, buffer: &mut [f32], frame_count: usize, channels: usize) {
        if channels == 0 || channels > MAX_CHANNELS {
            return;
        }

        self.sync();

        let frames = frame_count.min(buffer.len() / channels);
        let active = self.active;

        for frame in buffer[..frames * channels].chunks_exact_mut(channels) {
            for (sample, filters) in frame.iter_mut().zip(self.filters.iter_mut()) {
                let mut value = *sample as f64;
                for (band, filter) in filters.iter_mut().enumerate() {
                    if active[band] {
                        value = filter.process(value);
                    }
                }
                *sample = value as f32;
            }
        }
    }

    /// Filter raw little-endian f32 bytes in place
    ///
    /// Trailing bytes that do not form a whole frame are left untouched.
    pub fn process_bytes(&mut self, bytes: &mut [u8], channels: usize) {
        if channels == 0 || channels > MAX_CHANNELS {
            return;
        }

        let frame_bytes = channels * 4;
        let aligned = bytes.len() - bytes.len() % frame_bytes;

        let mut scratch = std::mem::take(&mut self.scratch);
        crate::domain::audio::decode_samples(&bytes[..aligned], &mut scratch);
        self.process_buffer(&mut scratch, aligned / frame_bytes, channels);
        crate::domain::audio::encode_samples(&scratch, &mut bytes[..aligned]);
        self.scratch = scratch;
    }

    /// Clear the history of every filter
    pub fn reset(&mut self) {
        for channel in self.filters.iter_mut() {
            for filter in channel.iter_mut() {
                filter.reset();
            }
        }
    }
}

impl std::fmt::Debug for FilterBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterBank")
            .field("gains", self.current.gains())
            .field("sample_rate", &self.current.sample_rate())
            .finish()
    }
}

// ============================================================================
// EQUALIZER ENGINE
// ============================================================================

/// Ten-band equalizer: gain control plus filter bank
///
/// Use it directly when one thread both sets gains and processes audio, or
/// split it with [`EqualizerEngine::into_parts`] to hand the bank to an audio
/// thread while keeping the [`GainControl`] on the control side.
#[derive(Debug)]
pub struct EqualizerEngine {
    control: GainControl,
    bank: FilterBank,
}

impl EqualizerEngine {
    /// Create a flat equalizer at `sample_rate`
    pub fn new(sample_rate: f64) -> Self {
        Self::with_gains(sample_rate, [0.0; BAND_COUNT])
    }

    /// Create an equalizer with initial gains (clamped)
    pub fn with_gains(sample_rate: f64, gains: [f64; BAND_COUNT]) -> Self {
        let control = GainControl::new(sample_rate, gains);
        let bank = FilterBank::new(&control);
        Self { control, bank }
    }

    /// Rejoin a control handle with its bank
    pub fn from_parts(control: GainControl, bank: FilterBank) -> Self {
        Self { control, bank }
    }

    pub fn into_parts(self) -> (GainControl, FilterBank) {
        (self.control, self.bank)
    }

    /// Handle for changing gains from other threads
    pub fn control(&self) -> GainControl {
        self.control.clone()
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.control.set_sample_rate(sample_rate);
    }

    pub fn sample_rate(&self) -> f64 {
        self.control.sample_rate()
    }

    pub fn set_band_gain(&mut self, band: usize, gain_db: f64) {
        self.control.set_band_gain(band, gain_db);
    }

    pub fn band_gain(&self, band: usize) -> f64 {
        self.control.band_gain(band)
    }

    pub fn set_all_gains(&mut self, gains: &[f64]) -> bool {
        self.control.set_all_gains(gains)
    }

    pub fn all_gains(&self) -> [f64; BAND_COUNT] {
        self.control.all_gains()
    }

    pub fn process_buffer(&mut self, buffer: &mut [f32], frame_count: usize, channels: usize) {
        self.bank.process_buffer(buffer, frame_count, channels);
    }

    pub fn reset(&mut self) {
        self.bank.reset();
    }

    /// Magnitude response of the current gains at `frequency`, in dB
    pub fn response_db(&self, frequency: f64) -> f64 {
        self.control.snapshot().response_db(frequency)
    }
}

impl Default for EqualizerEngine {
    fn default() -> Self {
        Self::new(params::DEFAULT_SAMPLE_RATE)
    }
}
