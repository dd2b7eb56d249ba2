//! Pipeline negotiation against the scripted backend

use auscult_core::domain::audio::{DeviceId, PreferredDeviceProvider};
use auscult_core::domain::settings::Settings;
use auscult_infra::audio::PipelineNegotiator;
use auscult_tests::ScriptedBackend;
use std::sync::Arc;

#[test]
fn test_preferred_rate_wins_when_it_opens() {
    let backend = ScriptedBackend::new();
    let pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default(), None)
        .unwrap();

    assert_eq!(pipeline.sample_rate(), 4000);
    assert_eq!(pipeline.buffer_frames(), 4000);
    assert_eq!(backend.capture_attempts(), vec![4000]);
}

#[test]
fn test_falls_back_in_order_and_releases_failed_candidates() {
    let backend = ScriptedBackend::new()
        .with_failing_capture_rates(&[2000])
        .with_failing_playback_rates(&[4000]);

    let mut pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default(), None)
        .unwrap();

    assert_eq!(pipeline.sample_rate(), 8000);
    assert_eq!(backend.capture_attempts(), vec![4000, 2000, 8000]);
    // The 4000 Hz capture opened but its playback failed
    assert_eq!(backend.captures_opened(), 2);
    assert_eq!(backend.live_streams(), 2);

    pipeline.release();
    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.double_releases(), 0);
}

#[test]
fn test_rates_without_buffer_size_are_skipped() {
    let backend = ScriptedBackend::new().with_unsupported_rates(&[4000, 2000]);
    let pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default(), None)
        .unwrap();

    assert_eq!(pipeline.sample_rate(), 8000);
    assert_eq!(backend.capture_attempts(), vec![8000]);
}

#[test]
fn test_buffer_is_at_least_one_second() {
    let backend = ScriptedBackend::new().with_min_buffer_frames(6000);
    let pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default().with_preferred_sample_rate(8000), None)
        .unwrap();
    assert_eq!(pipeline.buffer_frames(), 8000);
    drop(pipeline);

    let backend = ScriptedBackend::new().with_min_buffer_frames(6000);
    let pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default().with_preferred_sample_rate(2000), None)
        .unwrap();
    assert_eq!(pipeline.buffer_frames(), 6000);
}

#[test]
fn test_no_workable_rate_leaves_nothing_open() {
    let all = [4000, 2000, 8000, 16000, 44100];
    let backend = ScriptedBackend::new()
        .with_failing_capture_rates(&all[..2])
        .with_failing_playback_rates(&all[2..]);

    let pipeline = PipelineNegotiator::new(&backend).negotiate(&Settings::default(), None);

    assert!(pipeline.is_none());
    assert_eq!(backend.capture_attempts(), all.to_vec());
    assert_eq!(backend.captures_opened(), 3);
    assert_eq!(backend.live_streams(), 0);
}

#[test]
fn test_preferred_device_goes_into_capture_request() {
    let backend = ScriptedBackend::new();
    let provider: PreferredDeviceProvider =
        Arc::new(|| Some(DeviceId::new("Digital Stethoscope")));

    let _pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default(), Some(&provider))
        .unwrap();

    let requests = backend.capture_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].device.as_ref().map(DeviceId::as_str),
        Some("Digital Stethoscope")
    );
}

#[test]
fn test_dropping_pipeline_releases_once() {
    let backend = ScriptedBackend::new();
    let mut pipeline = PipelineNegotiator::new(&backend)
        .negotiate(&Settings::default(), None)
        .unwrap();
    pipeline.start().unwrap();
    pipeline.release();
    assert!(pipeline.is_released());
    drop(pipeline);

    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.double_releases(), 0);
}
