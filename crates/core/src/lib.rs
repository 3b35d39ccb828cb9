//! Minstrel core: platform-agnostic equalizer domain
//!
//! Holds the filter bank, gain control, configuration and the traits the
//! capture/playback backends implement. Nothing in here touches a device or
//! spawns a process.

pub mod domain;

pub use domain::*;
