//! Engine start/stop lifecycle and resource release

use auscult_core::domain::settings::Settings;
use auscult_infra::audio::{AuscultEngine, EngineState};
use auscult_tests::{wait_until, ScriptedBackend, Signal};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn engine_on(backend: &ScriptedBackend) -> AuscultEngine {
    AuscultEngine::new(Arc::new(backend.clone()), Settings::default())
}

#[test]
fn test_start_runs_and_reports_pipeline() {
    let backend = ScriptedBackend::new();
    let engine = engine_on(&backend);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.pipeline_info().is_none());

    assert!(engine.start());
    assert_eq!(engine.state(), EngineState::Running);
    let info = engine.pipeline_info().unwrap();
    assert_eq!(info.sample_rate_hz, 4000);
    assert_eq!(info.buffer_frames, 4000);

    engine.stop();
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.pipeline_info().is_none());
}

#[test]
fn test_start_twice_keeps_one_pipeline() {
    let backend = ScriptedBackend::new();
    let engine = engine_on(&backend);

    assert!(engine.start());
    assert!(engine.start());
    assert_eq!(backend.captures_opened(), 1);
    assert_eq!(backend.playbacks_opened(), 1);
}

#[test]
fn test_stop_is_idempotent_and_releases_once() {
    let backend = ScriptedBackend::new().with_signal(Signal::Sine {
        frequency_hz: 100.0,
        amplitude: 0.2,
    });
    let engine = engine_on(&backend);

    engine.stop();
    assert!(engine.start());
    assert!(wait_until(TIMEOUT, || backend.frames_played() > 0));

    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.captures_released(), 1);
    assert_eq!(backend.playbacks_released(), 1);
    assert_eq!(backend.double_releases(), 0);
}

#[test]
fn test_concurrent_stop_calls() {
    let backend = ScriptedBackend::new();
    let engine = Arc::new(engine_on(&backend));
    assert!(engine.start());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.stop())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.double_releases(), 0);
}

#[test]
fn test_failed_negotiation_stays_idle() {
    let all = [4000, 2000, 8000, 16000, 44100];
    let backend = ScriptedBackend::new().with_failing_capture_rates(&all);
    let engine = engine_on(&backend);

    assert!(!engine.start());
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.pipeline_info().is_none());
    assert_eq!(backend.live_streams(), 0);

    // Nothing to stop, still fine
    engine.stop();
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_restart_after_stop_opens_fresh_pipeline() {
    let backend = ScriptedBackend::new();
    let engine = engine_on(&backend);

    for _ in 0..3 {
        assert!(engine.start());
        engine.stop();
    }

    assert_eq!(backend.captures_opened(), 3);
    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.double_releases(), 0);
}

#[test]
fn test_rapid_start_stop_cycles() {
    let backend = ScriptedBackend::new().with_signal(Signal::Sine {
        frequency_hz: 80.0,
        amplitude: 0.3,
    });
    let engine = engine_on(&backend);

    for _ in 0..20 {
        engine.start();
        engine.stop();
    }

    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(backend.live_streams(), 0);
    assert_eq!(backend.double_releases(), 0);
}

#[test]
fn test_drop_releases_running_pipeline() {
    let backend = ScriptedBackend::new();
    {
        let engine = engine_on(&backend);
        assert!(engine.start());
        assert_eq!(backend.live_streams(), 2);
    }
    assert_eq!(backend.live_streams(), 0);
}

#[test]
fn test_stop_resets_mute() {
    let backend = ScriptedBackend::new();
    let engine = engine_on(&backend);
    assert!(engine.start());
    engine.set_muted(true);
    engine.stop();
    assert!(!engine.is_muted());
}

#[test]
fn test_oversized_envelope_capacity_is_capped() {
    let backend = ScriptedBackend::new().with_input_limit(4000);
    let engine = AuscultEngine::with_envelope_capacity(
        Arc::new(backend.clone()),
        Settings::default(),
        usize::MAX,
    );
    let envelopes = engine.envelope_receiver();
    assert_eq!(envelopes.capacity(), Some(65_536));

    assert!(engine.start());
    assert!(wait_until(TIMEOUT, || engine.published_envelopes() == 25));
    engine.stop();
    assert_eq!(engine.dropped_envelopes(), 0);
}
