//! Minstrel infrastructure: capture process, output devices and threading

pub mod audio;

pub use audio::*;
