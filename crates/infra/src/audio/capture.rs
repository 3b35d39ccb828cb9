//! External-process audio capture
//!
//! Capture runs `parec` (or any program with the same contract) against a
//! monitor source and reads raw interleaved PCM from its stdout. A pump
//! thread moves stdout into a channel so reads can time out; a second thread
//! keeps the last lines of stderr for failure reports.
//!
//! Startup succeeds once the process is running. A monitor source with no
//! audio yet is not a failure; exiting before the startup window ends is.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use minstrel_core::domain::audio::{AudioError, AudioFormat, CaptureSource, Result};
use minstrel_core::domain::config::CaptureConfig;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lines of stderr kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Chunks buffered between the pump thread and the reader loop
const PUMP_CHANNEL_DEPTH: usize = 64;

/// Interval between exit checks while waiting for the process
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one capture process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Capturing,
    Stopping,
    Failed,
}

/// How to launch and supervise the capture process
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub program: String,
    pub monitor_source: String,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub read_block_frames: usize,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            program: config.program.clone(),
            monitor_source: config.monitor_source.clone(),
            startup_timeout: config.startup_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            read_block_frames: config.read_block_frames as usize,
        }
    }
}

impl CaptureSettings {
    /// Command line for recording `format` from the monitor source
    pub fn command(&self, format: &AudioFormat) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(format!("--device={}", self.monitor_source))
            .arg(format!("--format={}", format.sample_format.pulse_name()))
            .arg(format!("--rate={}", format.sample_rate))
            .arg(format!("--channels={}", format.channels));
        command
    }
}

enum PumpMessage {
    Data(Vec<u8>),
    Eof,
    Failed(String),
}

/// Supervised capture process
///
/// Dropping the supervisor shuts the process down.
pub struct CaptureSupervisor {
    child: Option<Child>,
    data: Receiver<PumpMessage>,
    pending: Option<Vec<u8>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    pump: Option<JoinHandle<()>>,
    stderr_collector: Option<JoinHandle<()>>,
    state: CaptureState,
    shutdown_timeout: Duration,
}

impl CaptureSupervisor {
    /// Launch capture for `format` and wait until it delivers audio
    pub fn start(settings: &CaptureSettings, format: &AudioFormat) -> Result<Self> {
        let block_bytes = settings.read_block_frames.max(1) * format.bytes_per_frame();
        Self::spawn(
            settings.command(format),
            block_bytes,
            settings.startup_timeout,
            settings.shutdown_timeout,
        )
    }

    /// Launch an arbitrary capture command
    ///
    /// The process counts as started once it is running: startup ends early
    /// when the first stdout bytes arrive, and a process still alive after
    /// `startup_timeout` is accepted even if it has not written anything yet.
    /// Exiting inside that window is a startup error.
    pub fn spawn(
        mut command: Command,
        block_bytes: usize,
        startup_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Result<Self> {
        info!(command = ?command, "Starting capture process");

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AudioError::CaptureSpawn(e.to_string()))?;

        debug!(pid = child.id(), "Capture process spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = bounded(PUMP_CHANNEL_DEPTH);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let mut supervisor = Self {
            child: Some(child),
            data: rx,
            pending: None,
            stderr_tail: Arc::clone(&stderr_tail),
            pump: None,
            stderr_collector: None,
            state: CaptureState::Starting,
            shutdown_timeout,
        };

        if let Some(stdout) = stdout {
            match spawn_pump(stdout, block_bytes.max(1), tx) {
                Ok(handle) => supervisor.pump = Some(handle),
                Err(e) => {
                    supervisor.shutdown();
                    return Err(AudioError::CaptureSpawn(e.to_string()));
                }
            }
        }
        if let Some(stderr) = stderr {
            match spawn_stderr_collector(stderr, stderr_tail) {
                Ok(handle) => supervisor.stderr_collector = Some(handle),
                Err(e) => {
                    supervisor.shutdown();
                    return Err(AudioError::CaptureSpawn(e.to_string()));
                }
            }
        }

        match supervisor.data.recv_timeout(startup_timeout) {
            Ok(PumpMessage::Data(chunk)) => {
                supervisor.pending = Some(chunk);
                supervisor.state = CaptureState::Capturing;
                info!("Capture running");
                Ok(supervisor)
            }
            Ok(PumpMessage::Eof) | Ok(PumpMessage::Failed(_)) | Err(RecvTimeoutError::Disconnected) => {
                let reason = supervisor.exit_report();
                supervisor.shutdown();
                error!(%reason, "Capture process failed to start");
                Err(AudioError::CaptureSpawn(reason))
            }
            Err(RecvTimeoutError::Timeout) => match supervisor.has_exited() {
                Some(status) => {
                    let reason = supervisor.exit_report();
                    supervisor.shutdown();
                    error!(%status, %reason, "Capture process failed to start");
                    Err(AudioError::CaptureSpawn(reason))
                }
                None => {
                    supervisor.state = CaptureState::Capturing;
                    info!(
                        timeout_ms = startup_timeout.as_millis() as u64,
                        "Capture running, no data yet"
                    );
                    Ok(supervisor)
                }
            },
        }
    }

    /// Exit status if the process is already gone
    fn has_exited(&mut self) -> Option<ExitStatus> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Process id while the process is held
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Most recent stderr lines, oldest first
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Exit status plus stderr tail, waiting briefly for the exit to land
    fn exit_report(&mut self) -> String {
        let deadline = Instant::now() + self.shutdown_timeout;
        let status = self
            .child
            .as_mut()
            .and_then(|child| wait_until(child, deadline));

        let mut report = match status {
            Some(status) => {
                // Exited, so stderr is at EOF and the collector holds every line.
                if let Some(collector) = self.stderr_collector.take() {
                    join_until(collector, deadline);
                }
                format!("capture process exited ({})", status)
            }
            None => "capture stream closed".to_string(),
        };

        let tail = self.stderr_tail();
        if !tail.is_empty() {
            report.push_str(": ");
            report.push_str(&tail.join(" | "));
        }
        report
    }

    fn fail(&mut self, reason: String) -> AudioError {
        self.state = CaptureState::Failed;
        error!(%reason, "Capture stopped unexpectedly");
        AudioError::CaptureExited(reason)
    }
}

impl CaptureSource for CaptureSupervisor {
    fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }

        match self.state {
            CaptureState::Capturing => {}
            CaptureState::Failed => {
                return Err(AudioError::CaptureExited("capture already failed".to_string()))
            }
            _ => return Err(AudioError::CaptureExited("capture is not running".to_string())),
        }

        match self.data.recv_timeout(timeout) {
            Ok(PumpMessage::Data(chunk)) => {
                trace!(bytes = chunk.len(), "Captured chunk");
                Ok(Some(chunk))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Ok(PumpMessage::Failed(e)) => {
                let report = self.exit_report();
                Err(self.fail(format!("{}; {}", e, report)))
            }
            Ok(PumpMessage::Eof) | Err(RecvTimeoutError::Disconnected) => {
                let report = self.exit_report();
                Err(self.fail(report))
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if self.state != CaptureState::Failed {
            self.state = CaptureState::Stopping;
        }
        debug!(pid = child.id(), "Stopping capture process");

        // The pump may be blocked sending into a full channel.
        while self.data.try_recv().is_ok() {}

        let deadline = Instant::now() + self.shutdown_timeout;
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                request_terminate(&mut child);
                wait_until(&mut child, deadline)
            }
        };

        match status {
            Some(status) => debug!(%status, "Capture process exited"),
            None => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Capture process ignored termination, killing"
                );
                if let Err(e) = child.kill() {
                    warn!(error = %e, "Failed to kill capture process");
                }
                match child.wait() {
                    Ok(status) => debug!(%status, "Capture process killed"),
                    Err(e) => error!(error = %e, "Failed to reap capture process"),
                }
            }
        }

        // The pipes close with the process unless a grandchild inherited them.
        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            match self.data.recv_timeout(EXIT_POLL_INTERVAL) {
                Err(RecvTimeoutError::Disconnected) => break,
                _ if Instant::now() >= deadline => {
                    warn!("Capture output still open after exit, detaching reader");
                    break;
                }
                _ => continue,
            }
        }
        for worker in [self.pump.take(), self.stderr_collector.take()]
            .into_iter()
            .flatten()
        {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }

        self.pending = None;
        if self.state == CaptureState::Stopping {
            self.state = CaptureState::Idle;
        }
        info!("Capture stopped");
    }
}

impl Drop for CaptureSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CaptureSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSupervisor")
            .field("pid", &self.pid())
            .field("state", &self.state)
            .finish()
    }
}

fn spawn_pump(
    mut stdout: ChildStdout,
    block_bytes: usize,
    tx: crossbeam::channel::Sender<PumpMessage>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("capture-pump".to_string())
        .spawn(move || {
            let mut block = vec![0u8; block_bytes];
            loop {
                match stdout.read(&mut block) {
                    Ok(0) => {
                        let _ = tx.send(PumpMessage::Eof);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(PumpMessage::Data(block[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(PumpMessage::Failed(format!("read error: {}", e)));
                        break;
                    }
                }
            }
        })
}

fn spawn_stderr_collector(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("capture-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                debug!(line = %line, "capture stderr");
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
}

/// Join `worker` if it finishes before `deadline`, otherwise detach it
fn join_until(worker: JoinHandle<()>, deadline: Instant) {
    while !worker.is_finished() && Instant::now() < deadline {
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    if worker.is_finished() {
        let _ = worker.join();
    }
}

/// Poll for exit until `deadline`
fn wait_until(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to poll capture process");
                return None;
            }
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: the pid belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Terminate request failed");
    }
}
