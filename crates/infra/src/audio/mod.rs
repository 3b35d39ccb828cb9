//! Platform audio backends and the real-time processing pipeline
//!
//! - `capture`: supervised `parec` process delivering raw PCM
//! - `cpal_backend`: CPAL output devices and the blocking sink
//! - `queue`: bounded FIFO between the reader and writer loops
//! - `pipeline`: the reader and writer loops
//! - `processor`: session lifecycle and the control surface

pub mod capture;
pub mod cpal_backend;
pub mod pipeline;
pub mod processor;
pub mod queue;

pub use capture::{CaptureSettings, CaptureState, CaptureSupervisor};
pub use cpal_backend::{CpalEnumerator, CpalSink, SystemBackend};
pub use pipeline::{SessionStats, StatsSnapshot};
pub use processor::{EqualizerProcessor, ProcessorEvent, ProcessorSettings, ProcessorState};
pub use queue::{DrainOutcome, PipelineQueue, PushOutcome};
