//! End-to-end byte flow through the processor
//!
//! Captured chunks arrive with arbitrary sizes; what reaches the sink must
//! be the filtered concatenation of the input, in order, with nothing lost
//! or duplicated.

use minstrel_core::domain::audio::{decode_samples, AudioFormat};
use minstrel_core::domain::config::{OverflowPolicy, PrebufferMode};
use minstrel_core::domain::dsp::BAND_COUNT;
use minstrel_infra::audio::{EqualizerProcessor, ProcessorSettings, ProcessorState};
use minstrel_tests::{
    filter_reference, init_tracing, sine_bytes, split_irregular, wait_until, SyntheticBackend,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn settings(mode: PrebufferMode, prebuffer_ms: u64) -> ProcessorSettings {
    ProcessorSettings {
        format: AudioFormat::new(44100, 2),
        device_keyword: "Equalizer_Output".to_string(),
        prebuffer: Duration::from_millis(prebuffer_ms),
        prebuffer_mode: mode,
        queue_capacity: Duration::from_secs(5),
        overflow: OverflowPolicy::Block,
        poll_interval: Duration::from_millis(2),
    }
}

fn shaped_gains() -> [f64; BAND_COUNT] {
    [6.0, 4.0, -3.0, 0.0, 2.5, -8.0, 0.0, 5.0, -2.0, 12.0]
}

#[test]
fn test_byte_integrity_with_startup_prebuffer() {
    init_tracing();
    let format = AudioFormat::new(44100, 2);
    let input = sine_bytes(&format, 997.0, 4410);
    let chunks = split_irregular(&input, &[1000, 333, 4096, 7, 2050]);
    let expected = filter_reference(&format, shaped_gains(), &input);

    let backend = SyntheticBackend::new().with_chunks(chunks);
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(
        settings(PrebufferMode::Startup, 20),
        Arc::new(backend),
        shaped_gains(),
    );

    assert!(processor.start());
    assert!(wait_until(TIMEOUT, || sink.byte_count() >= expected.len()));
    processor.stop();

    let written = sink.bytes();
    assert_eq!(written.len(), expected.len());
    assert!(written == expected, "filtered output differs from reference");
    assert_eq!(processor.stats().bytes_captured, input.len() as u64);
    assert_eq!(processor.stats().bytes_written, input.len() as u64);
}

#[test]
fn test_byte_integrity_with_prebuffer_on_every_write() {
    init_tracing();
    let format = AudioFormat::new(44100, 2);
    // 10 ms prebuffer is 441 frames. Whole-prebuffer chunks keep the tail
    // from stalling below the threshold.
    let block = format.bytes_for(Duration::from_millis(10));
    let input = sine_bytes(&format, 125.0, 441 * 5);
    let chunks = split_irregular(&input, &[block]);
    let expected = filter_reference(&format, shaped_gains(), &input);

    let backend = SyntheticBackend::new().with_chunks(chunks);
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(
        settings(PrebufferMode::EveryWrite, 10),
        Arc::new(backend),
        shaped_gains(),
    );

    assert!(processor.start());
    assert!(wait_until(TIMEOUT, || sink.byte_count() >= expected.len()));
    processor.stop();

    assert!(sink.bytes() == expected, "filtered output differs from reference");

    // Every write carried at least one prebuffer's worth of audio.
    let stats = processor.stats();
    assert!(stats.write_cycles >= 1);
    assert!(stats.average_write_bytes() >= block as u64);
}

#[test]
fn test_flat_gains_pass_audio_through() {
    let format = AudioFormat::new(48000, 1);
    let input = sine_bytes(&format, 440.0, 4800);

    let backend = SyntheticBackend::new().with_chunks(split_irregular(&input, &[777]));
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(
        ProcessorSettings {
            format,
            ..settings(PrebufferMode::Startup, 5)
        },
        Arc::new(backend),
        [0.0; BAND_COUNT],
    );

    assert!(processor.start());
    assert!(wait_until(TIMEOUT, || sink.byte_count() >= input.len()));
    processor.stop();

    assert!(sink.bytes() == input);
}

#[test]
fn test_gain_changes_while_running_stay_finite() {
    let format = AudioFormat::new(44100, 2);
    let input = sine_bytes(&format, 1000.0, 44100);
    let chunks = split_irregular(&input, &[4096]);

    let backend = SyntheticBackend::new().with_chunks(chunks);
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(
        settings(PrebufferMode::Startup, 10),
        Arc::new(backend),
        [0.0; BAND_COUNT],
    );
    let control = processor.gain_control();

    assert!(processor.start());
    for step in 0..50 {
        let gain = if step % 2 == 0 { 30.0 } else { -30.0 };
        control.set_all_gains(&[gain; BAND_COUNT]);
        control.apply_json("[0, 3, -2, 0, 5, 0, -3, 2, 0, 1]").unwrap();
    }
    assert!(wait_until(TIMEOUT, || sink.byte_count() >= input.len()));
    processor.stop();

    let mut samples = Vec::new();
    decode_samples(&sink.bytes(), &mut samples);
    assert_eq!(samples.len(), input.len() / 4);
    assert!(samples.iter().all(|s| s.is_finite() && s.abs() <= 10.0));
    assert_eq!(processor.all_gains()[4], 5.0);
}

#[test]
fn test_restart_replays_a_fresh_session() {
    let format = AudioFormat::new(44100, 2);
    let input = sine_bytes(&format, 250.0, 2205);

    let backend = SyntheticBackend::new().with_chunks(split_irregular(&input, &[1500]));
    let sink = backend.sink_probe();
    let capture = backend.capture_probe();
    let processor = EqualizerProcessor::new(
        settings(PrebufferMode::Startup, 5),
        Arc::new(backend),
        [0.0; BAND_COUNT],
    );

    for session in 1..=2 {
        assert!(processor.start());
        assert!(wait_until(TIMEOUT, || sink.byte_count() >= input.len() * session));
        processor.stop();
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    use std::sync::atomic::Ordering;
    assert_eq!(capture.opened.load(Ordering::SeqCst), 2);
    assert_eq!(capture.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.bytes(), [input.clone(), input].concat());
}
