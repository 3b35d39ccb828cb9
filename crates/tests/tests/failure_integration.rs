//! Startup and runtime failure handling of the processor

use crossbeam::channel::Receiver;
use minstrel_core::domain::audio::{AudioError, AudioFormat};
use minstrel_core::domain::config::{OverflowPolicy, PrebufferMode};
use minstrel_core::domain::dsp::BAND_COUNT;
use minstrel_infra::audio::{EqualizerProcessor, ProcessorEvent, ProcessorSettings, ProcessorState};
use minstrel_tests::{init_tracing, sine_bytes, split_irregular, wait_until, SyntheticBackend};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn settings() -> ProcessorSettings {
    ProcessorSettings {
        format: AudioFormat::new(44100, 2),
        device_keyword: "Equalizer_Output".to_string(),
        prebuffer: Duration::from_millis(5),
        prebuffer_mode: PrebufferMode::Startup,
        queue_capacity: Duration::from_secs(1),
        overflow: OverflowPolicy::DropOldest,
        poll_interval: Duration::from_millis(2),
    }
}

/// Collect events until `Stopped` or the timeout
fn events_until_stopped(events: &Receiver<ProcessorEvent>) -> Vec<ProcessorEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(TIMEOUT) {
        let stopped = event == ProcessorEvent::Stopped;
        seen.push(event);
        if stopped {
            break;
        }
    }
    seen
}

fn error_count(events: &[ProcessorEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ProcessorEvent::Error(_)))
        .count()
}

#[test]
fn test_capture_crash_reports_once_and_releases_everything() {
    init_tracing();
    let format = AudioFormat::new(44100, 2);
    let input = sine_bytes(&format, 440.0, 2000);

    let backend = SyntheticBackend::new()
        .with_chunks(split_irregular(&input, &[999]))
        .crash_after_script();
    let capture = backend.capture_probe();
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(settings(), Arc::new(backend), [0.0; BAND_COUNT]);
    let events = processor.subscribe();

    assert!(processor.start());
    let events = events_until_stopped(&events);

    assert_eq!(events.first(), Some(&ProcessorEvent::Started));
    assert_eq!(events.last(), Some(&ProcessorEvent::Stopped));
    assert_eq!(error_count(&events), 1);

    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert!(!processor.is_running());
    assert!(processor.last_error().unwrap().contains("synthetic capture crashed"));
    assert_eq!(processor.pending_bytes(), 0);
    assert_eq!(capture.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(capture.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.live.load(Ordering::SeqCst), 0);

    // The failure already stopped everything.
    processor.stop();
    assert_eq!(capture.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_write_failure_stops_processor() {
    init_tracing();
    let format = AudioFormat::new(44100, 2);
    let input = sine_bytes(&format, 440.0, 8000);

    let backend = SyntheticBackend::new()
        .with_chunks(split_irregular(&input, &[2048]))
        .fail_writes_after(1);
    let capture = backend.capture_probe();
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(settings(), Arc::new(backend), [0.0; BAND_COUNT]);
    let events = processor.subscribe();

    assert!(processor.start());
    let events = events_until_stopped(&events);

    assert_eq!(error_count(&events), 1);
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert!(processor.last_error().unwrap().contains("unplugged"));
    assert_eq!(capture.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.live.load(Ordering::SeqCst), 0);

    // A new session starts after the failure; its sink fails again.
    assert!(processor.start());
    processor.stop();
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(capture.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.live.load(Ordering::SeqCst), 0);
}

#[test]
fn test_no_output_device_is_startup_error() {
    let backend = SyntheticBackend::new().without_devices();
    let capture = backend.capture_probe();
    let processor = EqualizerProcessor::new(settings(), Arc::new(backend), [0.0; BAND_COUNT]);

    assert!(!processor.start());
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(
        processor.last_error(),
        Some(AudioError::NoOutputDevice.to_string())
    );
    assert_eq!(capture.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn test_capture_startup_timeout_opens_no_sink() {
    let backend = SyntheticBackend::new().fail_capture_start(AudioError::CaptureStartupTimeout(2000));
    let sink = backend.sink_probe();
    let processor = EqualizerProcessor::new(settings(), Arc::new(backend), [0.0; BAND_COUNT]);
    let events = processor.subscribe();

    assert!(!processor.start());
    assert_eq!(sink.opened.load(Ordering::SeqCst), 0);
    assert!(processor.last_error().unwrap().contains("2000"));
    assert!(matches!(events.try_recv(), Ok(ProcessorEvent::Error(_))));
    assert!(events.try_recv().is_err());
}

#[test]
fn test_concurrent_stops_tear_down_once() {
    let backend = SyntheticBackend::new();
    let capture = backend.capture_probe();
    let sink = backend.sink_probe();
    let processor = Arc::new(EqualizerProcessor::new(
        settings(),
        Arc::new(backend),
        [0.0; BAND_COUNT],
    ));

    assert!(processor.start());
    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || processor.stop())
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(capture.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    assert!(processor.last_error().is_none());
}

#[test]
fn test_drop_stops_running_processor() {
    let backend = SyntheticBackend::new();
    let capture = backend.capture_probe();
    let sink = backend.sink_probe();

    {
        let processor = EqualizerProcessor::new(settings(), Arc::new(backend), [0.0; BAND_COUNT]);
        assert!(processor.start());
        assert!(wait_until(TIMEOUT, || processor.is_running()));
    }

    assert_eq!(capture.live.load(Ordering::SeqCst), 0);
    assert_eq!(sink.live.load(Ordering::SeqCst), 0);
}
