//! End-to-end scheduling tests driving a full engine against the offline
//! backend with a deliberately jittery host timer.

use crate::backend::{AudioBackend, NodeId, ParamKind, ParamRef};
use crate::engine::Engine;
use crate::instrument::AutomationSource;
use crate::lfo::Lfo;
use crate::offline::{NodeKind, OfflineBackend, ParamEvent};
use crate::pattern::{Chord, Cycle, Pattern};
use crate::synth::Synth;

/// Advance the engine's clock in uneven increments, ticking as a host would.
fn run_for(engine: &mut Engine<OfflineBackend>, seconds: f64) {
    let mut elapsed = engine.backend().now();
    let target = elapsed + seconds;
    let mut i = 0u32;
    while elapsed < target {
        elapsed += if i % 4 == 0 { 0.035 } else { 0.021 };
        engine.backend_mut().set_now(elapsed);
        engine.tick();
        i += 1;
    }
}

fn oscillator_starts(backend: &OfflineBackend) -> Vec<f64> {
    let mut starts: Vec<f64> = (0..backend.node_count() as u64)
        .map(NodeId)
        .filter(|n| matches!(backend.node_kind(*n), Some(NodeKind::Oscillator(_))))
        .filter_map(|n| backend.source_start(n))
        .map(|(when, _)| when)
        .collect();
    starts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    starts
}

#[test]
fn test_voices_land_on_bar_grid_despite_timer_jitter() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 8.0);

    let starts = oscillator_starts(engine.backend());
    assert!(starts.len() >= 4, "one voice per 2 s bar over 8 s");
    for (i, start) in starts.iter().enumerate() {
        assert!(
            (start - i as f64 * 2.0).abs() < 1e-9,
            "voice {} should start exactly at {}, got {}",
            i,
            i as f64 * 2.0,
            start
        );
    }
}

#[test]
fn test_pause_freezes_scheduling() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 3.0);
    let before = oscillator_starts(engine.backend()).len();

    engine.pause();
    run_for(&mut engine, 4.0);
    assert_eq!(
        oscillator_starts(engine.backend()).len(),
        before,
        "paused transport schedules nothing"
    );
}

#[test]
fn test_euclid_pattern_places_onsets_within_bar() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_steps(vec![Chord::single(60.0); 8])]);
    synth.pattern_mut().euclid(3, 8, 0);
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 1.8);

    // Tresillo over a 2 s bar: onsets at steps 0, 3, 6 of 8.
    let starts = oscillator_starts(engine.backend());
    assert_eq!(starts, vec![0.0, 0.75, 1.5]);
}

#[test]
fn test_lfo_rearms_every_bar() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
    synth
        .core_mut()
        .set_pan(AutomationSource::Lfo(Lfo::from_range(-1.0, 1.0, 1.0, 120.0)));
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 4.5);

    // Voice oscillators start exactly on bar lines (0, 2, 4); the LFO
    // carrier restarts each bar half a cycle in (1 cycle/bar = 0.5 Hz, so
    // one second after the line).
    let starts = oscillator_starts(engine.backend());
    let carriers: Vec<f64> = starts
        .iter()
        .copied()
        .filter(|s| (s.rem_euclid(2.0) - 1.0).abs() < 1e-9)
        .collect();
    assert_eq!(carriers, vec![1.0, 3.0, 5.0], "one restart per bar");
}

#[test]
fn test_stepped_pan_automation_writes_each_bar() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
    synth
        .core_mut()
        .set_pan(AutomationSource::Steps(Pattern::from_steps(vec![
            Some(-1.0),
            Some(1.0),
        ])));
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 1.0);

    let pan_node = (0..engine.backend().node_count() as u64)
        .map(NodeId)
        .find(|n| matches!(engine.backend().node_kind(*n), Some(NodeKind::Panner)))
        .expect("chain owns a panner");
    let events = engine
        .backend()
        .param_events(ParamRef::new(pan_node, ParamKind::Pan));

    let ramps: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            ParamEvent::RampTo { value, .. } => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(ramps, vec![-1.0, 1.0], "both steps scheduled for bar 0");
}

#[test]
fn test_stop_releases_voices_and_resets_transport() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 1.0);
    engine.stop();

    assert!(engine.clock().paused());
    assert_eq!(engine.clock().position().bar, 0);

    let count_before = oscillator_starts(engine.backend()).len();
    run_for(&mut engine, 4.0);
    assert_eq!(
        oscillator_starts(engine.backend()).len(),
        count_before,
        "stopped engine schedules no new voices"
    );
}

#[test]
fn test_multi_cycle_pattern_alternates_by_bar() {
    let mut engine = Engine::new(OfflineBackend::new(), 120.0);
    let mut synth = Synth::new();
    synth.set_pattern(vec![
        Cycle::from_notes(vec![Some(60.0)]),
        Cycle::from_notes(vec![None]),
    ]);
    engine.add_instrument(Box::new(synth), 0);

    engine.start();
    run_for(&mut engine, 7.5);

    let starts = oscillator_starts(engine.backend());
    // Bars 0 and 2 sound, bars 1 and 3 are the rest cycle.
    assert_eq!(starts, vec![0.0, 4.0]);
}
