//! Sample-playback instrument.
//!
//! Pattern values are normalized begin offsets into the sample (0 = start,
//! 1 = end), which makes slicing idioms like [`Sampler::chop`] fall out of
//! the pattern model. Buffers come from the engine's preloaded bank; a
//! sample that has not finished loading by trigger time is skipped, never
//! awaited.

use std::sync::Arc;

use tracing::warn;

use crate::backend::{AudioBackend, NodeId};
use crate::disposal::DisposalQueue;
use crate::engine::ImpulseCache;
use crate::instrument::{notes_in_bar, BarContext, Instrument, InstrumentCore, Note};
use crate::pattern::{Cycle, Pattern};
use crate::sample_bank::{SampleBank, SampleBuffer, SampleKey};

pub struct Sampler {
    core: InstrumentCore,
    key: SampleKey,
    pattern: Pattern<f64>,
    playback_rate: f64,
    looped: bool,
    /// When set, playback rate is derived so the whole sample spans this
    /// many bars.
    fit_bars: Option<f64>,
    /// Cut playback at the step boundary instead of letting the sample ring.
    cut: bool,
}

impl Sampler {
    pub fn new(bank: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            core: InstrumentCore::new(),
            key: SampleKey::new(bank, name, 0),
            pattern: Pattern::from_steps(vec![Some(0.0)]),
            playback_rate: 1.0,
            looped: false,
            fit_bars: None,
            cut: false,
        }
    }

    pub fn set_index(&mut self, index: usize) -> &mut Self {
        self.key.index = index;
        self
    }

    pub fn set_pattern(&mut self, cycles: Vec<Cycle<f64>>) -> &mut Self {
        self.pattern.set(cycles);
        self
    }

    /// Playback speed multiplier; negative plays the sample reversed.
    pub fn set_rate(&mut self, rate: f64) -> &mut Self {
        self.playback_rate = rate;
        self
    }

    pub fn set_looped(&mut self, looped: bool) -> &mut Self {
        self.looped = looped;
        self
    }

    pub fn set_cut(&mut self, cut: bool) -> &mut Self {
        self.cut = cut;
        self
    }

    /// Stretch playback so the full sample lasts exactly `bars` bars.
    pub fn fit(&mut self, bars: f64) -> &mut Self {
        if bars > 0.0 {
            self.fit_bars = Some(bars);
        }
        self
    }

    /// Slice the sample into `n` equal pieces played in order, one per step,
    /// spread across the pattern's cycles.
    pub fn chop(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        let cycles = self.pattern.len().max(1);
        let per_cycle = (n / cycles).max(1);
        let slice = 1.0 / (per_cycle * cycles) as f64;

        let chopped: Vec<Cycle<f64>> = (0..cycles)
            .map(|c| {
                Cycle::from_notes(
                    (0..per_cycle)
                        .map(|i| Some((c * per_cycle + i) as f64 * slice))
                        .collect(),
                )
            })
            .collect();
        self.pattern.set(chopped);
        self.cut = true;
        self
    }

    pub fn pattern_mut(&mut self) -> &mut Pattern<f64> {
        &mut self.pattern
    }

    pub fn core_mut(&mut self) -> &mut InstrumentCore {
        &mut self.core
    }

    fn effective_rate(&self, buffer: &SampleBuffer, bar_duration: f64) -> f64 {
        match self.fit_bars {
            Some(bars) => buffer.duration() / (bar_duration * bars),
            None => self.playback_rate.abs(),
        }
    }
}

impl Instrument for Sampler {
    fn play(
        &mut self,
        backend: &mut dyn AudioBackend,
        bank: &SampleBank,
        impulses: &mut ImpulseCache,
        disposal: &mut DisposalQueue,
        ctx: &BarContext,
    ) {
        let Some(buffer) = bank.get(&self.key) else {
            warn!(id = %self.key.id(), "sample not loaded yet, skipping bar");
            return;
        };
        let buffer = if self.playback_rate < 0.0 && self.fit_bars.is_none() {
            Arc::new(buffer.reversed())
        } else {
            buffer
        };

        let notes = notes_in_bar(&self.pattern, ctx);
        self.core
            .before_play(backend, impulses, disposal, ctx, &notes);

        let rate = self.effective_rate(&buffer, ctx.duration);
        if rate <= 0.0 {
            return;
        }

        for (step, note) in notes {
            // The envelope of the step's gain pair spans either the step
            // slot or the longest remaining tail among the chord's slices.
            let longest = note
                .values
                .iter()
                .map(|v| (buffer.duration() - v.clamp(0.0, 1.0) * buffer.duration()) / rate)
                .fold(0.0, f64::max);
            let envelope_note = Note {
                values: note.values.clone(),
                start: note.start,
                duration: if self.cut || self.looped {
                    note.duration
                } else {
                    longest
                },
            };
            let (env_gain, base_gain, end) =
                self.core
                    .create_voice_gain(backend, ctx, step, &envelope_note);

            for &value in &note.values {
                let offset = value.clamp(0.0, 1.0) * buffer.duration();
                let source = backend.create_buffer_source(buffer.clone(), rate, self.looped);
                self.core.apply_detune(backend, source, ctx, step, &note);
                backend.connect(source, env_gain);
                backend.start_source(source, note.start, offset);
                if self.cut || self.looped {
                    backend.stop_source(source, end);
                }
                self.core
                    .track_voice(source, vec![env_gain, base_gain], note.start);
            }
        }
    }

    fn stop(&mut self, backend: &mut dyn AudioBackend, disposal: &mut DisposalQueue, when: f64) {
        self.core.stop_voices(backend, disposal, when);
    }

    fn handle_ended(&mut self, backend: &mut dyn AudioBackend, ended: &[NodeId]) {
        self.core.reclaim_ended(backend, ended);
    }

    fn sample_keys(&self) -> Vec<SampleKey> {
        vec![self.key.clone()]
    }
}
