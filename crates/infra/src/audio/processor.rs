//! Equalizer processor: session lifecycle over capture, filter and output
//!
//! A session is one `start()` .. `stop()` span. Starting opens the capture
//! and the output sink, then launches three threads: the reader and writer
//! loops, and a monitor that waits for a runtime failure. Every path out of
//! a session (explicit stop, capture crash, write failure, drop) runs the
//! same teardown exactly once.

use super::pipeline::{
    run_reader, run_writer, FailureHook, ReaderContext, SessionStats, StatsSnapshot,
    WriterContext,
};
use super::queue::PipelineQueue;
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use minstrel_core::domain::audio::{
    select_output_device, AudioBackend, AudioError, AudioFormat, AudioSink, CaptureSource,
    DeviceInfo, Result,
};
use minstrel_core::domain::config::{EqualizerConfig, OverflowPolicy, PrebufferMode};
use minstrel_core::domain::dsp::{FilterBank, GainControl, BAND_COUNT};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Processor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A runtime error was reported; teardown to `Stopped` is under way
    Failed,
}

/// Lifecycle notifications for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    Started,
    Stopped,
    Error(String),
}

/// Session parameters taken from the configuration
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub format: AudioFormat,
    pub device_keyword: String,
    pub prebuffer: Duration,
    pub prebuffer_mode: PrebufferMode,
    pub queue_capacity: Duration,
    pub overflow: OverflowPolicy,
    pub poll_interval: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from(&EqualizerConfig::default())
    }
}

impl From<&EqualizerConfig> for ProcessorSettings {
    fn from(config: &EqualizerConfig) -> Self {
        Self {
            format: config.audio,
            device_keyword: config.output.device_keyword.clone(),
            prebuffer: Duration::from_millis(config.pipeline.prebuffer_ms),
            prebuffer_mode: config.pipeline.prebuffer_mode,
            queue_capacity: Duration::from_millis(config.pipeline.queue_capacity_ms),
            overflow: config.pipeline.overflow,
            poll_interval: config.pipeline.poll_interval(),
        }
    }
}

struct Session {
    id: u64,
    device: DeviceInfo,
    running: Arc<AtomicBool>,
    queue: Arc<PipelineQueue>,
    reader: Option<JoinHandle<Box<dyn CaptureSource>>>,
    writer: Option<JoinHandle<Box<dyn AudioSink>>>,
    monitor: Option<JoinHandle<()>>,
}

struct ProcessorShared {
    backend: Arc<dyn AudioBackend>,
    settings: ProcessorSettings,
    control: GainControl,
    session: Mutex<Option<Session>>,
    state: AtomicCell<ProcessorState>,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<ProcessorEvent>>>,
    stats: Arc<SessionStats>,
    next_session: AtomicU64,
}

/// Real-time equalizer between a capture source and an output device
pub struct EqualizerProcessor {
    shared: Arc<ProcessorShared>,
}

impl EqualizerProcessor {
    pub fn new(
        settings: ProcessorSettings,
        backend: Arc<dyn AudioBackend>,
        gains: [f64; BAND_COUNT],
    ) -> Self {
        let control = GainControl::new(settings.format.sample_rate as f64, gains);
        Self {
            shared: Arc::new(ProcessorShared {
                backend,
                settings,
                control,
                session: Mutex::new(None),
                state: AtomicCell::new(ProcessorState::Stopped),
                last_error: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                stats: Arc::new(SessionStats::default()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &EqualizerConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self::new(config.into(), backend, config.initial_gains())
    }

    /// Start a session; returns whether the processor is running afterwards
    ///
    /// Calling this while running is a no-op that returns `true`. On failure
    /// nothing stays open and the reason is available from [`last_error`].
    ///
    /// [`last_error`]: EqualizerProcessor::last_error
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        let mut stale_monitor = None;

        let started = {
            let mut slot = shared.lock_session();
            if let Some(session) = slot.take() {
                if shared.state.load() == ProcessorState::Running {
                    *slot = Some(session);
                    debug!("Processor already running");
                    return true;
                }
                // A failed session whose monitor has not run yet.
                stale_monitor = shared.teardown(session);
            }

            shared.state.store(ProcessorState::Starting);
            *shared.lock_last_error() = None;

            match ProcessorShared::launch(shared) {
                Ok(session) => {
                    info!(device = %session.device.name, "Equalizer processor started");
                    *slot = Some(session);
                    true
                }
                Err(e) => {
                    error!(error = %e, "Failed to start equalizer processor");
                    *shared.lock_last_error() = Some(e.to_string());
                    shared.state.store(ProcessorState::Stopped);
                    shared.emit(ProcessorEvent::Error(e.to_string()));
                    false
                }
            }
        };

        join_monitor(stale_monitor);
        started
    }

    /// Stop the session and release every resource; no-op when stopped
    pub fn stop(&self) {
        let monitor = {
            let mut slot = self.shared.lock_session();
            match slot.take() {
                Some(session) => self.shared.teardown(session),
                None => return,
            }
        };
        join_monitor(monitor);
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.load() == ProcessorState::Running
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state.load()
    }

    /// Message of the most recent startup or runtime error
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock_last_error().clone()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> Receiver<ProcessorEvent> {
        let (tx, rx) = unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Handle for changing gains while running
    pub fn gain_control(&self) -> GainControl {
        self.shared.control.clone()
    }

    pub fn set_band_gain(&self, band: usize, gain_db: f64) {
        self.shared.control.set_band_gain(band, gain_db);
    }

    pub fn set_all_gains(&self, gains: &[f64]) -> bool {
        self.shared.control.set_all_gains(gains)
    }

    pub fn band_gain(&self, band: usize) -> f64 {
        self.shared.control.band_gain(band)
    }

    pub fn all_gains(&self) -> [f64; BAND_COUNT] {
        self.shared.control.all_gains()
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Bytes waiting in the queue or the writer's accumulator
    pub fn pending_bytes(&self) -> usize {
        let queued = self
            .shared
            .lock_session()
            .as_ref()
            .map_or(0, |s| s.queue.queued_bytes());
        queued + self.shared.stats.snapshot().buffered_bytes
    }
}

impl Drop for EqualizerProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EqualizerProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EqualizerProcessor")
            .field("state", &self.state())
            .field("settings", &self.shared.settings)
            .field("gains", &self.all_gains())
            .finish()
    }
}

impl ProcessorShared {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_error(&self) -> MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ProcessorEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Latch a runtime failure; only the first one per session wins
    fn report_failure(&self, error: &AudioError) -> bool {
        if self
            .state
            .compare_exchange(ProcessorState::Running, ProcessorState::Failed)
            .is_err()
        {
            debug!(error = %error, "Ignoring error outside of a running session");
            return false;
        }

        error!(error = %error, "Equalizer processor failed");
        *self.lock_last_error() = Some(error.to_string());
        self.emit(ProcessorEvent::Error(error.to_string()));
        true
    }

    /// Open both ends and launch the worker threads
    ///
    /// Called with the session slot locked.
    fn launch(this: &Arc<Self>) -> Result<Session> {
        let settings = &this.settings;
        let format = settings.format;
        format.validate()?;

        let devices = this.backend.output_devices()?;
        let device = select_output_device(&devices, &settings.device_keyword)?.clone();
        if !device
            .name
            .to_lowercase()
            .contains(&settings.device_keyword.to_lowercase())
        {
            warn!(
                keyword = %settings.device_keyword,
                device = %device.name,
                "No output device matches keyword, using fallback"
            );
        }
        debug!(device = %device.name, "Selected output device");

        let mut capture = this.backend.open_capture(&format)?;
        let sink = match this.backend.open_sink(&device, &format) {
            Ok(sink) => sink,
            Err(e) => {
                capture.shutdown();
                return Err(e);
            }
        };

        let sample_rate = format.sample_rate as f64;
        if this.control.sample_rate() != sample_rate {
            this.control.set_sample_rate(sample_rate);
        }
        let bank = FilterBank::new(&this.control);

        let frame_bytes = format.bytes_per_frame();
        let queue = Arc::new(PipelineQueue::new(
            format.bytes_for(settings.queue_capacity),
            frame_bytes,
            settings.overflow,
        ));
        let running = Arc::new(AtomicBool::new(true));
        let id = this.next_session.fetch_add(1, Ordering::Relaxed);

        this.stats.reset();

        let (failure_tx, failure_rx) = bounded::<()>(1);
        let on_failure: FailureHook = {
            let shared = Arc::clone(this);
            Arc::new(move |e: AudioError| {
                if shared.report_failure(&e) {
                    let _ = failure_tx.try_send(());
                }
            })
        };

        // Workers hold until the session is announced; a dropped sender sends
        // them home without touching their resources.
        let (go_tx, go_rx) = bounded::<()>(2);

        let mut session = Session {
            id,
            device,
            running: Arc::clone(&running),
            queue: Arc::clone(&queue),
            reader: None,
            writer: None,
            monitor: None,
        };

        let monitor = {
            let shared = Arc::clone(this);
            thread::Builder::new()
                .name("eq-monitor".to_string())
                .spawn(move || {
                    // Disconnects once both loops have exited without failing.
                    if failure_rx.recv().is_ok() {
                        shared.teardown_failed(id);
                    }
                })
        };
        match monitor {
            Ok(handle) => session.monitor = Some(handle),
            Err(e) => {
                capture.shutdown();
                drop(on_failure);
                return Err(this.abort_launch(session, spawn_failed(e)));
            }
        }

        let writer_ctx = WriterContext {
            sink,
            queue: Arc::clone(&queue),
            running: Arc::clone(&running),
            stats: Arc::clone(&this.stats),
            on_failure: Arc::clone(&on_failure),
            frame_bytes,
            prebuffer_bytes: format.bytes_for(settings.prebuffer),
            prebuffer_mode: settings.prebuffer_mode,
            poll_interval: settings.poll_interval,
        };
        let writer_go = go_rx.clone();
        let writer = thread::Builder::new()
            .name("eq-writer".to_string())
            .spawn(move || match writer_go.recv() {
                Ok(()) => run_writer(writer_ctx),
                Err(_) => writer_ctx.sink,
            });
        match writer {
            Ok(handle) => session.writer = Some(handle),
            Err(e) => {
                capture.shutdown();
                drop(on_failure);
                drop(go_tx);
                return Err(this.abort_launch(session, spawn_failed(e)));
            }
        }

        let reader_ctx = ReaderContext {
            capture,
            bank,
            queue,
            running,
            stats: Arc::clone(&this.stats),
            on_failure,
            channels: format.channels as usize,
            frame_bytes,
            poll_interval: settings.poll_interval,
        };
        let reader = thread::Builder::new()
            .name("eq-reader".to_string())
            .spawn(move || match go_rx.recv() {
                Ok(()) => run_reader(reader_ctx),
                Err(_) => reader_ctx.capture,
            });
        match reader {
            Ok(handle) => session.reader = Some(handle),
            Err(e) => {
                drop(go_tx);
                return Err(this.abort_launch(session, spawn_failed(e)));
            }
        }

        this.state.store(ProcessorState::Running);
        this.emit(ProcessorEvent::Started);
        for _ in 0..2 {
            let _ = go_tx.send(());
        }

        Ok(session)
    }

    /// Undo a partially launched session after a thread failed to spawn
    ///
    /// The monitor is left to exit on its own: it may be waiting for the
    /// session lock the caller holds.
    fn abort_launch(&self, session: Session, error: AudioError) -> AudioError {
        drop(self.teardown(session));
        error
    }

    /// Monitor-side teardown after a runtime failure
    fn teardown_failed(&self, id: u64) {
        let monitor = {
            let mut slot = self.lock_session();
            if slot.as_ref().map(|s| s.id) != Some(id) {
                // Already stopped by someone else.
                return;
            }
            match slot.take() {
                Some(session) => self.teardown(session),
                None => return,
            }
        };
        join_monitor(monitor);
    }

    /// Stop both loops, release capture and sink, end in `Stopped`
    ///
    /// Runs with the session slot locked. Returns the monitor thread when the
    /// caller must join it after unlocking.
    fn teardown(&self, mut session: Session) -> Option<JoinHandle<()>> {
        // An aborted launch never announced itself, so it ends silently.
        let announced = self.state.load() != ProcessorState::Starting;
        // A failed session stays `Failed` until it reaches `Stopped`.
        let _ = self
            .state
            .compare_exchange(ProcessorState::Running, ProcessorState::Stopping);
        info!(device = %session.device.name, "Stopping equalizer processor");

        session.running.store(false, Ordering::Release);
        session.queue.close();

        if let Some(reader) = session.reader.take() {
            match reader.join() {
                Ok(mut capture) => capture.shutdown(),
                Err(_) => error!("Reader thread panicked"),
            }
        }

        if let Some(writer) = session.writer.take() {
            match writer.join() {
                Ok(mut sink) => {
                    if let Err(e) = sink.drain() {
                        debug!(error = %e, "Output drain failed");
                    }
                    sink.close();
                }
                Err(_) => error!("Writer thread panicked"),
            }
        }

        session.queue.clear();
        self.stats.clear_buffered();

        let stats = self.stats.snapshot();
        info!(
            bytes_captured = stats.bytes_captured,
            bytes_written = stats.bytes_written,
            write_cycles = stats.write_cycles,
            dropped_bytes = stats.dropped_bytes,
            average_write_bytes = stats.average_write_bytes(),
            "Session statistics"
        );

        self.state.store(ProcessorState::Stopped);
        if announced {
            self.emit(ProcessorEvent::Stopped);
        }
        info!("Equalizer processor stopped");

        session
            .monitor
            .take()
            .filter(|m| m.thread().id() != thread::current().id())
    }
}

fn spawn_failed(e: std::io::Error) -> AudioError {
    AudioError::OsError(format!("failed to spawn worker thread: {}", e))
}

fn join_monitor(monitor: Option<JoinHandle<()>>) {
    if let Some(monitor) = monitor {
        if monitor.join().is_err() {
            error!("Monitor thread panicked");
        }
    }
}
