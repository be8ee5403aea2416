//! Oscillator-based instrument.
//!
//! Pattern values are MIDI note numbers. Each sounding step spawns one voice
//! gain pair and one oscillator per (waveform, chord value) combination, all
//! summed into the same envelope.

use tracing::warn;

use crate::backend::{AudioBackend, NodeId, Waveform};
use crate::disposal::DisposalQueue;
use crate::engine::ImpulseCache;
use crate::instrument::{notes_in_bar, BarContext, Instrument, InstrumentCore};
use crate::pattern::{Chord, Cycle, Pattern};
use crate::sample_bank::SampleBank;

/// MIDI note to frequency in Hz, A4 = 440. Out-of-range input yields 0,
/// which callers treat as "skip this voice".
pub fn midi_to_frequency(midi: f64) -> f64 {
    if midi > 127.0 {
        warn!(midi, "midi note above 127, muting voice");
        return 0.0;
    }
    if midi <= 0.0 {
        return 0.0;
    }
    440.0 * 2f64.powf((midi - 69.0) / 12.0)
}

pub struct Synth {
    core: InstrumentCore,
    pattern: Pattern<f64>,
    waveforms: Vec<Waveform>,
}

impl Default for Synth {
    fn default() -> Self {
        Self::new()
    }
}

impl Synth {
    /// A synth that plays middle C every bar until given a pattern.
    pub fn new() -> Self {
        Self {
            core: InstrumentCore::new(),
            pattern: Pattern::new(vec![Cycle::from_steps(vec![Chord::single(60.0)])]),
            waveforms: vec![Waveform::Sine],
        }
    }

    pub fn set_pattern(&mut self, cycles: Vec<Cycle<f64>>) -> &mut Self {
        self.pattern.set(cycles);
        self
    }

    pub fn set_waveforms(&mut self, waveforms: Vec<Waveform>) -> &mut Self {
        if !waveforms.is_empty() {
            self.waveforms = waveforms;
        }
        self
    }

    pub fn pattern_mut(&mut self) -> &mut Pattern<f64> {
        &mut self.pattern
    }

    pub fn core_mut(&mut self) -> &mut InstrumentCore {
        &mut self.core
    }
}

impl Instrument for Synth {
    fn play(
        &mut self,
        backend: &mut dyn AudioBackend,
        _bank: &SampleBank,
        impulses: &mut ImpulseCache,
        disposal: &mut DisposalQueue,
        ctx: &BarContext,
    ) {
        let notes = notes_in_bar(&self.pattern, ctx);
        self.core
            .before_play(backend, impulses, disposal, ctx, &notes);

        for (step, note) in notes {
            let (env_gain, base_gain, end) =
                self.core.create_voice_gain(backend, ctx, step, &note);

            for &waveform in &self.waveforms {
                for &midi in &note.values {
                    let frequency = midi_to_frequency(midi);
                    if frequency <= 0.0 {
                        continue;
                    }
                    let osc = backend.create_oscillator(waveform, frequency);
                    self.core.apply_detune(backend, osc, ctx, step, &note);
                    backend.connect(osc, env_gain);
                    backend.start_source(osc, note.start, 0.0);
                    backend.stop_source(osc, end);
                    self.core
                        .track_voice(osc, vec![env_gain, base_gain], note.start);
                }
            }
        }
    }

    fn stop(&mut self, backend: &mut dyn AudioBackend, disposal: &mut DisposalQueue, when: f64) {
        self.core.stop_voices(backend, disposal, when);
    }

    fn handle_ended(&mut self, backend: &mut dyn AudioBackend, ended: &[NodeId]) {
        self.core.reclaim_ended(backend, ended);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{NodeKind, OfflineBackend};

    fn ctx(destination: NodeId) -> BarContext {
        BarContext {
            bar: 0,
            start: 0.0,
            duration: 2.0,
            destination,
        }
    }

    #[test]
    fn test_midi_to_frequency() {
        assert_eq!(midi_to_frequency(69.0), 440.0);
        assert!((midi_to_frequency(60.0) - 261.6255653).abs() < 1e-6);
        assert!((midi_to_frequency(81.0) - 880.0).abs() < 1e-9);
        assert_eq!(midi_to_frequency(128.0), 0.0, "above range mutes");
        assert_eq!(midi_to_frequency(0.0), 0.0);
        assert_eq!(midi_to_frequency(-5.0), 0.0);
    }

    #[test]
    fn test_voices_scheduled_at_step_times() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let bank = SampleBank::with_search_dirs(vec![]);
        let dest = backend.destination();

        let mut synth = Synth::new();
        synth.set_pattern(vec![Cycle::from_notes(vec![
            Some(60.0),
            None,
            Some(67.0),
            None,
        ])]);
        synth.play(&mut backend, &bank, &mut impulses, &mut disposal, &ctx(dest));

        assert_eq!(synth.core.active_voices(), 2);

        let starts: Vec<f64> = (0..backend.node_count() as u64)
            .map(NodeId)
            .filter(|n| matches!(backend.node_kind(*n), Some(NodeKind::Oscillator(_))))
            .filter_map(|n| backend.source_start(n))
            .map(|(when, _)| when)
            .collect();
        assert_eq!(starts, vec![0.0, 1.0], "steps land on quarter-bar grid");
    }

    #[test]
    fn test_chord_and_waveform_cartesian() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let bank = SampleBank::with_search_dirs(vec![]);
        let dest = backend.destination();

        let mut synth = Synth::new();
        synth
            .set_pattern(vec![Cycle::from_steps(vec![Chord::of(vec![60.0, 64.0])])])
            .set_waveforms(vec![Waveform::Sine, Waveform::Saw]);
        synth.play(&mut backend, &bank, &mut impulses, &mut disposal, &ctx(dest));

        assert_eq!(synth.core.active_voices(), 4, "2 waveforms x 2 chord notes");
    }

    #[test]
    fn test_out_of_range_notes_spawn_no_voice() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let bank = SampleBank::with_search_dirs(vec![]);
        let dest = backend.destination();

        let mut synth = Synth::new();
        synth.set_pattern(vec![Cycle::from_notes(vec![Some(200.0)])]);
        synth.play(&mut backend, &bank, &mut impulses, &mut disposal, &ctx(dest));
        assert_eq!(synth.core.active_voices(), 0);
    }

    #[test]
    fn test_oscillators_stop_at_envelope_end() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let bank = SampleBank::with_search_dirs(vec![]);
        let dest = backend.destination();

        let mut synth = Synth::new();
        synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
        // Fit mode with a half-duration release tail past the 2 s note.
        synth
            .core_mut()
            .gain_env_mut()
            .set_adsr(0.01, 0.0, 1.0, 0.5);
        synth.play(&mut backend, &bank, &mut impulses, &mut disposal, &ctx(dest));

        let osc = (0..backend.node_count() as u64)
            .map(NodeId)
            .find(|n| matches!(backend.node_kind(*n), Some(NodeKind::Oscillator(_))))
            .unwrap();
        assert_eq!(backend.source_stop(osc), Some(3.0), "2.0 + 0.5 * 2.0");
    }
}
