//! Reader and writer loops of a running session
//!
//! The reader pulls captured bytes, frame-aligns them, filters them and
//! pushes them onto the [`PipelineQueue`]. The writer drains the queue into
//! its accumulator and writes to the sink once the prebuffer is satisfied.
//! Each loop hands its I/O end back when it exits so the session owner can
//! release it.

use super::queue::{DrainOutcome, PipelineQueue, PushOutcome};
use crossbeam::utils::CachePadded;
use minstrel_core::domain::audio::{AudioError, AudioSink, CaptureSource};
use minstrel_core::domain::config::PrebufferMode;
use minstrel_core::domain::dsp::FilterBank;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Diagnostic counters for one processor
///
/// Updated by the worker loops, read by anyone. Not used for control
/// decisions.
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_captured: CachePadded<AtomicU64>,
    bytes_written: CachePadded<AtomicU64>,
    write_cycles: CachePadded<AtomicU64>,
    dropped_bytes: CachePadded<AtomicU64>,
    buffered_bytes: CachePadded<AtomicUsize>,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_captured: u64,
    pub bytes_written: u64,
    pub write_cycles: u64,
    pub dropped_bytes: u64,
    /// Bytes held in the writer's accumulator
    pub buffered_bytes: usize,
}

impl StatsSnapshot {
    pub fn average_write_bytes(&self) -> u64 {
        if self.write_cycles == 0 {
            0
        } else {
            self.bytes_written / self.write_cycles
        }
    }
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_cycles: self.write_cycles.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.bytes_captured.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.write_cycles.store(0, Ordering::Relaxed);
        self.dropped_bytes.store(0, Ordering::Relaxed);
        self.buffered_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn clear_buffered(&self) {
        self.buffered_bytes.store(0, Ordering::Relaxed);
    }
}

/// Called by a loop that hit an unrecoverable error
pub type FailureHook = Arc<dyn Fn(AudioError) + Send + Sync>;

/// Everything the reader loop needs
pub struct ReaderContext {
    pub capture: Box<dyn CaptureSource>,
    pub bank: FilterBank,
    pub queue: Arc<PipelineQueue>,
    pub running: Arc<AtomicBool>,
    pub stats: Arc<SessionStats>,
    pub on_failure: FailureHook,
    pub channels: usize,
    pub frame_bytes: usize,
    pub poll_interval: Duration,
}

/// Capture → filter → enqueue until stopped or the capture fails
///
/// Returns the capture source for teardown.
pub fn run_reader(ctx: ReaderContext) -> Box<dyn CaptureSource> {
    let ReaderContext {
        mut capture,
        mut bank,
        queue,
        running,
        stats,
        on_failure,
        channels,
        frame_bytes,
        poll_interval,
    } = ctx;

    // Bytes past the last whole frame, prepended to the next read.
    let mut carry: Vec<u8> = Vec::new();

    debug!("Reader loop started");
    while running.load(Ordering::Acquire) {
        let chunk = match capture.read(poll_interval) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    on_failure(e);
                }
                break;
            }
        };

        stats
            .bytes_captured
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        let mut data = if carry.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut carry);
            joined.extend_from_slice(&chunk);
            joined
        };

        let aligned = data.len() - data.len() % frame_bytes;
        if aligned < data.len() {
            carry.extend_from_slice(&data[aligned..]);
            data.truncate(aligned);
        }
        if data.is_empty() {
            continue;
        }

        bank.process_bytes(&mut data, channels);
        trace!(bytes = data.len(), "Chunk filtered");

        match queue.push(data) {
            PushOutcome::Queued => {}
            PushOutcome::DroppedOldest(n) | PushOutcome::DroppedNewest(n) => {
                stats.dropped_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            PushOutcome::Closed => break,
        }
    }

    debug!("Reader loop finished");
    capture
}

/// Everything the writer loop needs
pub struct WriterContext {
    pub sink: Box<dyn AudioSink>,
    pub queue: Arc<PipelineQueue>,
    pub running: Arc<AtomicBool>,
    pub stats: Arc<SessionStats>,
    pub on_failure: FailureHook,
    pub frame_bytes: usize,
    pub prebuffer_bytes: usize,
    pub prebuffer_mode: PrebufferMode,
    pub poll_interval: Duration,
}

/// Dequeue → accumulate → write until stopped or the sink fails
///
/// Returns the sink for drain and close.
pub fn run_writer(ctx: WriterContext) -> Box<dyn AudioSink> {
    let WriterContext {
        mut sink,
        queue,
        running,
        stats,
        on_failure,
        frame_bytes,
        prebuffer_bytes,
        prebuffer_mode,
        poll_interval,
    } = ctx;

    let mut acc: Vec<u8> = Vec::with_capacity(prebuffer_bytes * 2);
    let mut primed = false;

    debug!(prebuffer_bytes, mode = ?prebuffer_mode, "Writer loop started");
    while running.load(Ordering::Acquire) {
        match queue.drain_into(&mut acc, poll_interval) {
            DrainOutcome::Drained(_) => {}
            DrainOutcome::TimedOut => continue,
            DrainOutcome::Closed => break,
        }
        stats.buffered_bytes.store(acc.len(), Ordering::Relaxed);

        let threshold = match prebuffer_mode {
            PrebufferMode::EveryWrite => prebuffer_bytes,
            PrebufferMode::Startup if primed => 0,
            PrebufferMode::Startup => prebuffer_bytes,
        };
        if acc.len() < threshold.max(frame_bytes) {
            continue;
        }

        let len = acc.len() - acc.len() % frame_bytes;
        if let Err(e) = sink.write(&acc[..len]) {
            if running.load(Ordering::Acquire) {
                on_failure(e);
            }
            break;
        }
        acc.drain(..len);
        primed = true;

        stats.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
        stats.write_cycles.fetch_add(1, Ordering::Relaxed);
        stats.buffered_bytes.store(acc.len(), Ordering::Relaxed);
        trace!(bytes = len, "Chunk written");
    }

    debug!(discarded = acc.len(), "Writer loop finished");
    sink
}
