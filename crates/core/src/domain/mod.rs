//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod gains;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    select_output_device, AudioBackend, AudioError, AudioFormat, AudioSink, CaptureSource,
    DeviceId, DeviceInfo, SampleFormat,
};
pub use config::*;
pub use dsp::*;
pub use gains::{parse_gain_update, GainUpdateError};
