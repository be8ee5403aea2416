//! The shared voice orchestrator behind every instrument.
//!
//! An instrument reacts to bar events: it reads the cycle for the incoming
//! bar, re-arms its tempo-synced modulators, refreshes its persistent output
//! chain (filters, panner, post-gain), and spawns one short-lived voice per
//! sounding step. [`InstrumentCore`] holds everything common to synths and
//! samplers; the instruments themselves only decide what kind of source node
//! a voice is.

use tracing::{debug, warn};

use crate::backend::{AudioBackend, FilterKind, NodeId, ParamKind, ParamRef};
use crate::disposal::DisposalQueue;
use crate::engine::ImpulseCache;
use crate::envelope::Envelope;
use crate::lfo::Lfo;
use crate::pattern::Pattern;
use crate::sample_bank::{SampleBank, SampleKey};
use crate::stepped_ramp;

/// Release tail applied when a voice is cut short, in seconds.
pub const FORCED_RELEASE: f64 = 0.15;

/// Where a bar-synced parameter gets its motion from.
///
/// A single tagged source per parameter replaces per-kind fields: patterns
/// become stepped ramps, LFOs run for the bar, envelopes sweep once over it.
pub enum AutomationSource {
    Steps(Pattern<f64>),
    Lfo(Lfo),
    Envelope(Envelope),
}

impl AutomationSource {
    fn apply(
        &mut self,
        backend: &mut dyn AudioBackend,
        disposal: &mut DisposalQueue,
        target: ParamRef,
        ctx: &BarContext,
        notes: &[(usize, Note)],
    ) {
        match self {
            AutomationSource::Steps(pattern) => {
                let steps = pattern.step_values(ctx.bar);
                stepped_ramp::apply(backend, target, ctx.start, ctx.duration, &steps);
            }
            AutomationSource::Lfo(lfo) => {
                lfo.stop(backend, ctx.start, disposal);
                lfo.connect(backend, target);
                lfo.start(backend, ctx.start);
            }
            AutomationSource::Envelope(env) => {
                // The envelope retriggers on every sounding note, ending a
                // sliver early so the next cancel lands after the tail.
                for (_, note) in notes {
                    env.apply(backend, target, note.start, note.duration - 0.001);
                }
            }
        }
    }

    fn stop_lfo(&mut self, backend: &mut dyn AudioBackend, when: f64, disposal: &mut DisposalQueue) {
        if let AutomationSource::Lfo(lfo) = self {
            lfo.stop(backend, when, disposal);
        }
    }
}

/// One sounding step: the chord values plus its slice of the bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub values: Vec<f64>,
    pub start: f64,
    pub duration: f64,
}

/// Everything an instrument needs to schedule a bar.
#[derive(Debug, Clone, Copy)]
pub struct BarContext {
    pub bar: i64,
    /// Render time the bar begins at.
    pub start: f64,
    pub duration: f64,
    /// Channel node the instrument's chain feeds into.
    pub destination: NodeId,
}

/// Derive the sounding notes of `pattern`'s cycle for this bar. Rests are
/// skipped; the step index is kept for per-step parameter lookups.
pub fn notes_in_bar(pattern: &Pattern<f64>, ctx: &BarContext) -> Vec<(usize, Note)> {
    let cycle = pattern.cycle_at(ctx.bar);
    if cycle.is_empty() {
        return Vec::new();
    }
    let step_duration = ctx.duration / cycle.len() as f64;
    cycle
        .steps()
        .iter()
        .enumerate()
        .filter_map(|(i, chord)| {
            let values = chord.sounding();
            if values.is_empty() {
                return None;
            }
            Some((
                i,
                Note {
                    values,
                    start: ctx.start + step_duration * i as f64,
                    duration: step_duration,
                },
            ))
        })
        .collect()
}

/// Anything the engine can drive from bar events.
pub trait Instrument {
    /// Schedule everything this instrument plays in the given bar.
    fn play(
        &mut self,
        backend: &mut dyn AudioBackend,
        bank: &SampleBank,
        impulses: &mut ImpulseCache,
        disposal: &mut DisposalQueue,
        ctx: &BarContext,
    );

    /// Cut all voices short at `when` with a release tail.
    fn stop(&mut self, backend: &mut dyn AudioBackend, disposal: &mut DisposalQueue, when: f64);

    /// React to sources the backend reports as naturally finished.
    fn handle_ended(&mut self, backend: &mut dyn AudioBackend, ended: &[NodeId]);

    /// Samples to preload before the transport starts.
    fn sample_keys(&self) -> Vec<SampleKey> {
        Vec::new()
    }
}

/// A persistent filter stage in the output chain.
pub struct FilterSlot {
    kind: FilterKind,
    frequency: Option<f64>,
    q: Option<f64>,
    source: Option<AutomationSource>,
    node: Option<NodeId>,
}

impl FilterSlot {
    pub fn new(kind: FilterKind, frequency: f64) -> Self {
        Self {
            kind,
            frequency: Some(frequency),
            q: None,
            source: None,
            node: None,
        }
    }

    /// Filter whose frequency comes entirely from an automation source.
    pub fn automated(kind: FilterKind, source: AutomationSource) -> Self {
        Self {
            kind,
            frequency: None,
            q: None,
            source: Some(source),
            node: None,
        }
    }

    pub fn with_q(mut self, q: f64) -> Self {
        self.q = Some(q);
        self
    }

    pub fn with_source(mut self, source: AutomationSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// The audio-rate effect behind a send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EffectKind {
    Reverb {
        decay: f64,
        /// Optional start/end of a lowpass sweep baked into the impulse.
        lowpass: Option<(f64, f64)>,
    },
    Delay {
        time: f64,
        feedback: f64,
    },
    Distortion {
        amount: f64,
    },
    Bitcrush {
        bits: u32,
    },
}

struct SendNodes {
    input: NodeId,
    dry: NodeId,
    effect: NodeId,
    wet: NodeId,
}

/// A wet/dry effect stage in the persistent output chain.
///
/// The stage splits its input into a unity dry path and an effect path whose
/// wet gain carries the mix; the mix is re-automated every bar like any other
/// chain parameter. The effect node itself is the backend's business.
pub struct EffectSend {
    kind: EffectKind,
    mix: AutomationSource,
    nodes: Option<SendNodes>,
}

impl EffectSend {
    pub fn new(kind: EffectKind) -> Self {
        let default_mix = match kind {
            EffectKind::Reverb { .. } => 0.1,
            EffectKind::Delay { .. } => 0.2,
            EffectKind::Distortion { .. } | EffectKind::Bitcrush { .. } => 1.0,
        };
        Self {
            kind,
            mix: AutomationSource::Steps(Pattern::from_steps(vec![Some(default_mix)])),
            nodes: None,
        }
    }

    pub fn with_mix(mut self, mix: AutomationSource) -> Self {
        self.mix = mix;
        self
    }

    pub fn kind(&self) -> EffectKind {
        self.kind
    }
}

struct Voice {
    source: NodeId,
    gains: Vec<NodeId>,
    start: f64,
}

/// State shared by all instrument kinds: the output chain, per-voice gain
/// staging, and bar-synced parameter automation.
pub struct InstrumentCore {
    gain_pattern: Option<Pattern<f64>>,
    gain_env: Envelope,
    base_gain_env: Envelope,
    postgain: Option<AutomationSource>,
    pan: Option<AutomationSource>,
    detune: Option<AutomationSource>,
    filters: Vec<FilterSlot>,
    sends: Vec<EffectSend>,
    postgain_node: Option<NodeId>,
    pan_node: Option<NodeId>,
    connected: bool,
    voices: Vec<Voice>,
}

impl Default for InstrumentCore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentCore {
    pub fn new() -> Self {
        let mut gain_env = Envelope::new(0.0, 1.0);
        gain_env.set_attack(0.001);
        let mut base_gain_env = Envelope::new(0.0, 0.75);
        base_gain_env.set_attack(0.005);
        Self {
            gain_pattern: None,
            gain_env,
            base_gain_env,
            postgain: None,
            pan: None,
            detune: None,
            filters: Vec::new(),
            sends: Vec::new(),
            postgain_node: None,
            pan_node: None,
            connected: false,
            voices: Vec::new(),
        }
    }

    pub fn gain_env_mut(&mut self) -> &mut Envelope {
        &mut self.gain_env
    }

    pub fn base_gain_env_mut(&mut self) -> &mut Envelope {
        &mut self.base_gain_env
    }

    pub fn set_gain_pattern(&mut self, pattern: Pattern<f64>) {
        self.gain_pattern = Some(pattern);
    }

    pub fn set_postgain(&mut self, source: AutomationSource) {
        self.postgain = Some(source);
    }

    pub fn set_pan(&mut self, source: AutomationSource) {
        self.pan = Some(source);
    }

    pub fn set_detune(&mut self, source: AutomationSource) {
        self.detune = Some(source);
    }

    pub fn add_filter(&mut self, slot: FilterSlot) {
        self.filters.push(slot);
    }

    pub fn add_send(&mut self, send: EffectSend) {
        self.sends.push(send);
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Refresh the output chain and bar-synced automation before voices are
    /// scheduled. Call once per bar event with the bar's sounding notes.
    pub fn before_play(
        &mut self,
        backend: &mut dyn AudioBackend,
        impulses: &mut ImpulseCache,
        disposal: &mut DisposalQueue,
        ctx: &BarContext,
        notes: &[(usize, Note)],
    ) {
        // LFOs restart phase-aligned to every bar.
        for source in self.automation_sources() {
            source.stop_lfo(backend, ctx.start, disposal);
        }

        let postgain_node = *self
            .postgain_node
            .get_or_insert_with(|| backend.create_gain(1.0));
        let pan_node = *self.pan_node.get_or_insert_with(|| backend.create_panner());

        if let Some(source) = &mut self.postgain {
            source.apply(
                backend,
                disposal,
                ParamRef::new(postgain_node, ParamKind::Gain),
                ctx,
                notes,
            );
        }
        if let Some(source) = &mut self.pan {
            source.apply(
                backend,
                disposal,
                ParamRef::new(pan_node, ParamKind::Pan),
                ctx,
                notes,
            );
        }

        for slot in &mut self.filters {
            if slot.frequency.is_none() && slot.source.is_none() {
                warn!("filter has neither a frequency nor an automation source, skipping");
                continue;
            }
            let node = *slot.node.get_or_insert_with(|| {
                backend.create_filter(slot.kind, slot.frequency.unwrap_or(1000.0))
            });
            if let Some(q) = slot.q {
                backend.set_param(ParamRef::new(node, ParamKind::Q), q);
            }
            if let Some(source) = &mut slot.source {
                source.apply(
                    backend,
                    disposal,
                    ParamRef::new(node, ParamKind::Frequency),
                    ctx,
                    notes,
                );
            }
        }

        for send in &mut self.sends {
            if send.nodes.is_none() {
                let input = backend.create_gain(1.0);
                let dry = backend.create_gain(1.0);
                let effect = match send.kind {
                    EffectKind::Reverb { decay, lowpass } => {
                        let impulse =
                            impulses.get_or_create(decay, lowpass, backend.sample_rate());
                        backend.create_convolver(impulse)
                    }
                    EffectKind::Delay { time, feedback } => {
                        let delay = backend.create_delay(time);
                        let feedback_gain = backend.create_gain(feedback);
                        backend.connect(delay, feedback_gain);
                        backend.connect(feedback_gain, delay);
                        delay
                    }
                    EffectKind::Distortion { amount } => backend.create_distortion(amount),
                    EffectKind::Bitcrush { bits } => backend.create_bitcrusher(bits),
                };
                let wet = backend.create_gain(0.0);
                backend.connect(input, dry);
                backend.connect(input, effect);
                backend.connect(effect, wet);
                send.nodes = Some(SendNodes {
                    input,
                    dry,
                    effect,
                    wet,
                });
                debug!(kind = ?send.kind, "effect send created");
            }
            if let Some(nodes) = &send.nodes {
                send.mix.apply(
                    backend,
                    disposal,
                    ParamRef::new(nodes.wet, ParamKind::Gain),
                    ctx,
                    notes,
                );
            }
        }

        if !self.connected {
            let mut upstream: Option<NodeId> = None;
            for slot in &self.filters {
                if let Some(node) = slot.node {
                    if let Some(prev) = upstream {
                        backend.connect(prev, node);
                    }
                    upstream = Some(node);
                }
            }
            if let Some(prev) = upstream {
                backend.connect(prev, pan_node);
            }
            backend.connect(pan_node, postgain_node);

            // Each send fans the current outputs into its input and replaces
            // them with its dry and wet paths.
            let mut outputs = vec![postgain_node];
            for send in &self.sends {
                if let Some(nodes) = &send.nodes {
                    for out in &outputs {
                        backend.connect(*out, nodes.input);
                    }
                    outputs = vec![nodes.dry, nodes.wet];
                }
            }
            for out in &outputs {
                backend.connect(*out, ctx.destination);
            }
            self.connected = true;
            debug!(
                filters = self.filters.len(),
                sends = self.sends.len(),
                "output chain connected"
            );
        }
    }

    /// First node of the output chain, where voices feed in.
    pub fn chain_input(&self) -> Option<NodeId> {
        self.filters
            .iter()
            .find_map(|slot| slot.node)
            .or(self.pan_node)
    }

    /// Build the two-stage gain for one voice and schedule its envelopes.
    ///
    /// The outer stage carries the note envelope, with its peak taken from
    /// the per-step gain pattern; the inner stage carries the instrument's
    /// base level. Returns both gain nodes (sources connect into the first)
    /// and the absolute release-end time.
    pub fn create_voice_gain(
        &mut self,
        backend: &mut dyn AudioBackend,
        ctx: &BarContext,
        step: usize,
        note: &Note,
    ) -> (NodeId, NodeId, f64) {
        let peak = self
            .gain_pattern
            .as_ref()
            .map(|p| p.value_or(ctx.bar, step, 1.0))
            .unwrap_or(1.0);
        self.gain_env.set_max_value(peak);

        let env_gain = backend.create_gain(0.0);
        let end = self.gain_env.apply(
            backend,
            ParamRef::new(env_gain, ParamKind::Gain),
            note.start,
            note.duration,
        );

        // The base stage never opens faster than the note envelope, and the
        // two stages release together.
        if self.base_gain_env.attack() < self.gain_env.attack() {
            self.base_gain_env.set_attack(self.gain_env.attack());
        }
        self.base_gain_env.set_release(self.gain_env.release());

        let base_gain = backend.create_gain(0.0);
        self.base_gain_env.apply(
            backend,
            ParamRef::new(base_gain, ParamKind::Gain),
            note.start,
            note.duration,
        );

        backend.connect(env_gain, base_gain);
        let chain_input = self.chain_input().unwrap_or(ctx.destination);
        backend.connect(base_gain, chain_input);

        (env_gain, base_gain, end)
    }

    /// Schedule detune for one voice's source node. A running LFO wins over
    /// an envelope, which wins over a stepped value.
    pub fn apply_detune(
        &mut self,
        backend: &mut dyn AudioBackend,
        source_node: NodeId,
        ctx: &BarContext,
        step: usize,
        note: &Note,
    ) {
        let target = ParamRef::new(source_node, ParamKind::Detune);
        match &mut self.detune {
            Some(AutomationSource::Lfo(lfo)) => {
                lfo.connect(backend, target);
                lfo.start(backend, ctx.start);
            }
            Some(AutomationSource::Envelope(env)) => {
                env.apply(backend, target, note.start, note.duration);
            }
            Some(AutomationSource::Steps(pattern)) => {
                let cents = pattern.value_or(ctx.bar, step, 0.0);
                backend.set_param(target, cents);
            }
            None => {}
        }
    }

    /// Register a started voice so it can be stopped and reclaimed later.
    pub fn track_voice(&mut self, source: NodeId, gains: Vec<NodeId>, start: f64) {
        self.voices.push(Voice {
            source,
            gains,
            start,
        });
    }

    /// Cut every voice short at `when`.
    ///
    /// Voices that have not started yet are cancelled outright; audible ones
    /// get a short release ramp before their nodes are queued for teardown.
    pub fn stop_voices(
        &mut self,
        backend: &mut dyn AudioBackend,
        disposal: &mut DisposalQueue,
        when: f64,
    ) {
        for source in self.automation_sources() {
            source.stop_lfo(backend, when, disposal);
        }

        for voice in self.voices.drain(..) {
            let mut doomed = voice.gains.clone();
            doomed.push(voice.source);

            if voice.start > when {
                backend.stop_source(voice.source, when);
                disposal.defer(when, doomed);
                continue;
            }

            for gain in &voice.gains {
                let target = ParamRef::new(*gain, ParamKind::Gain);
                let current = backend.param_value(target);
                backend.cancel_scheduled(target, when);
                backend.set_value_at(target, when, current);
                backend.ramp_to_at(target, when + FORCED_RELEASE, 0.0);
            }
            backend.stop_source(voice.source, when + FORCED_RELEASE);
            disposal.defer(when + FORCED_RELEASE, doomed);
        }
        self.connected = false;
        if let Some(node) = self.postgain_node {
            backend.set_param(ParamRef::new(node, ParamKind::Gain), 1.0);
        }
    }

    /// Reclaim voices whose sources ended on their own. Natural ends are
    /// already silent, so the nodes are disconnected immediately.
    pub fn reclaim_ended(&mut self, backend: &mut dyn AudioBackend, ended: &[NodeId]) {
        let mut i = 0;
        while i < self.voices.len() {
            if ended.contains(&self.voices[i].source) {
                let voice = self.voices.swap_remove(i);
                backend.disconnect(voice.source);
                for gain in voice.gains {
                    backend.disconnect(gain);
                }
            } else {
                i += 1;
            }
        }
    }

    fn automation_sources(&mut self) -> impl Iterator<Item = &mut AutomationSource> {
        self.postgain
            .iter_mut()
            .chain(self.pan.iter_mut())
            .chain(self.detune.iter_mut())
            .chain(self.filters.iter_mut().filter_map(|f| f.source.as_mut()))
            .chain(self.sends.iter_mut().map(|s| &mut s.mix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Waveform;
    use crate::offline::{OfflineBackend, ParamEvent};

    fn bar(destination: NodeId) -> BarContext {
        BarContext {
            bar: 0,
            start: 0.0,
            duration: 2.0,
            destination,
        }
    }

    #[test]
    fn test_notes_in_bar_skips_rests_and_slices_evenly() {
        let pattern = Pattern::from_steps(vec![Some(60.0), None, Some(64.0), Some(67.0)]);
        let ctx = BarContext {
            bar: 0,
            start: 4.0,
            duration: 2.0,
            destination: NodeId(0),
        };
        let notes = notes_in_bar(&pattern, &ctx);
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].0, 0);
        assert_eq!(notes[0].1.start, 4.0);
        assert_eq!(notes[0].1.duration, 0.5);
        assert_eq!(notes[1].0, 2);
        assert_eq!(notes[1].1.start, 5.0);
        assert_eq!(notes[1].1.values, vec![64.0]);
    }

    #[test]
    fn test_chain_connects_once_in_order() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();

        let mut core = InstrumentCore::new();
        core.add_filter(FilterSlot::new(FilterKind::Lowpass, 800.0));
        let ctx = bar(dest);

        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);
        let filter = core.filters[0].node.unwrap();
        let pan = core.pan_node.unwrap();
        let postgain = core.postgain_node.unwrap();

        assert!(backend.is_connected(filter, pan));
        assert!(backend.is_connected(pan, postgain));
        assert!(backend.is_connected(postgain, dest));
        assert_eq!(core.chain_input(), Some(filter));

        let nodes_before = backend.node_count();
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);
        assert_eq!(backend.node_count(), nodes_before, "chain nodes are reused");
    }

    #[test]
    fn test_unconfigured_filter_is_skipped() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();

        let mut core = InstrumentCore::new();
        core.add_filter(FilterSlot {
            kind: FilterKind::Highpass,
            frequency: None,
            q: None,
            source: None,
            node: None,
        });
        core.before_play(&mut backend, &mut impulses, &mut disposal, &bar(dest), &[]);

        assert!(core.filters[0].node.is_none());
        assert_eq!(core.chain_input(), core.pan_node);
    }

    #[test]
    fn test_voice_gain_peak_follows_gain_pattern() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.set_gain_pattern(Pattern::from_steps(vec![Some(0.25), Some(1.0)]));
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);

        let note = Note {
            values: vec![60.0],
            start: 0.0,
            duration: 1.0,
        };
        let (env_gain, _, _) = core.create_voice_gain(&mut backend, &ctx, 0, &note);

        let events = backend.param_events(ParamRef::new(env_gain, ParamKind::Gain));
        let peak = events
            .iter()
            .filter_map(|e| match e {
                ParamEvent::RampTo { value, .. } => Some(*value),
                _ => None,
            })
            .fold(f64::MIN, f64::max);
        assert_eq!(peak, 0.25, "envelope peaks at the step's gain value");
    }

    #[test]
    fn test_stop_ramps_audible_voices_and_defers_teardown() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);

        let note = Note {
            values: vec![60.0],
            start: 0.0,
            duration: 2.0,
        };
        let (env_gain, _, _) = core.create_voice_gain(&mut backend, &ctx, 0, &note);
        let osc = backend.create_oscillator(Waveform::Saw, 220.0);
        backend.connect(osc, env_gain);
        backend.start_source(osc, 0.0, 0.0);
        core.track_voice(osc, vec![env_gain], 0.0);

        backend.set_now(1.0);
        core.stop_voices(&mut backend, &mut disposal, 1.0);

        assert_eq!(core.active_voices(), 0);
        assert_eq!(
            backend.source_stop(osc),
            Some(1.0 + FORCED_RELEASE),
            "source outlives the release tail"
        );
        let events = backend.param_events(ParamRef::new(env_gain, ParamKind::Gain));
        assert_eq!(
            events.last(),
            Some(&ParamEvent::RampTo {
                at: 1.0 + FORCED_RELEASE,
                value: 0.0
            })
        );
        assert_eq!(disposal.len(), 1);
    }

    #[test]
    fn test_stop_cancels_future_voices_immediately() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);

        let osc = backend.create_oscillator(Waveform::Sine, 440.0);
        backend.start_source(osc, 5.0, 0.0);
        core.track_voice(osc, vec![], 5.0);

        core.stop_voices(&mut backend, &mut disposal, 1.0);
        assert_eq!(backend.source_stop(osc), Some(1.0), "no tail for unheard voices");
    }

    #[test]
    fn test_default_envelope_attacks() {
        let mut core = InstrumentCore::new();
        assert_eq!(core.gain_env_mut().attack(), 0.001);
        assert_eq!(core.base_gain_env_mut().attack(), 0.005);
        assert_eq!(core.base_gain_env_mut().max_value(), 0.75);
    }

    #[test]
    fn test_pan_envelope_retriggers_per_note() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.set_pan(AutomationSource::Envelope(Envelope::with_end(
            -1.0, 1.0, -1.0,
        )));

        let pattern = Pattern::from_steps(vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]);
        let notes = notes_in_bar(&pattern, &ctx);
        assert_eq!(notes.len(), 4);
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &notes);

        let pan = ParamRef::new(core.pan_node.unwrap(), ParamKind::Pan);
        let cancels = backend
            .param_events(pan)
            .iter()
            .filter(|e| matches!(e, ParamEvent::Cancel { .. }))
            .count();
        assert_eq!(cancels, 4, "the envelope restarts on every sounding note");
    }

    #[test]
    fn test_reverb_send_splits_wet_and_dry() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.add_send(EffectSend::new(EffectKind::Reverb {
            decay: 2.0,
            lowpass: None,
        }));
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);

        assert_eq!(impulses.len(), 1, "the impulse response is cached");
        let postgain = core.postgain_node.unwrap();
        let nodes = core.sends[0].nodes.as_ref().unwrap();
        assert!(backend.is_connected(postgain, nodes.input));
        assert!(backend.is_connected(nodes.input, nodes.dry));
        assert!(backend.is_connected(nodes.input, nodes.effect));
        assert!(backend.is_connected(nodes.effect, nodes.wet));
        assert!(backend.is_connected(nodes.dry, dest));
        assert!(backend.is_connected(nodes.wet, dest));
        assert!(
            !backend.is_connected(postgain, dest),
            "the send replaces the direct path to the destination"
        );
        assert!(matches!(
            backend.node_kind(nodes.effect),
            Some(crate::offline::NodeKind::Convolver(_))
        ));

        let nodes_before = backend.node_count();
        let input = nodes.input;
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);
        assert_eq!(backend.node_count(), nodes_before, "send nodes are reused");
        assert_eq!(core.sends[0].nodes.as_ref().unwrap().input, input);
    }

    #[test]
    fn test_send_mix_written_to_wet_gain() {
        let mut backend = OfflineBackend::new();
        let mut impulses = ImpulseCache::new();
        let mut disposal = DisposalQueue::new();
        let dest = backend.destination();
        let ctx = bar(dest);

        let mut core = InstrumentCore::new();
        core.add_send(
            EffectSend::new(EffectKind::Delay {
                time: 0.25,
                feedback: 0.1,
            })
            .with_mix(AutomationSource::Steps(Pattern::from_steps(vec![
                Some(0.5),
                Some(0.0),
            ]))),
        );
        core.before_play(&mut backend, &mut impulses, &mut disposal, &ctx, &[]);

        let wet = core.sends[0].nodes.as_ref().unwrap().wet;
        let events = backend.param_events(ParamRef::new(wet, ParamKind::Gain));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ParamEvent::RampTo { value, .. } if *value == 0.5)),
            "the stepped mix drives the wet gain: {:?}",
            events
        );
    }

    #[test]
    fn test_reclaim_disconnects_only_ended_voices() {
        let mut backend = OfflineBackend::new();
        let dest = backend.destination();

        let mut core = InstrumentCore::new();
        let g1 = backend.create_gain(1.0);
        let g2 = backend.create_gain(1.0);
        let a = backend.create_oscillator(Waveform::Sine, 440.0);
        let b = backend.create_oscillator(Waveform::Sine, 220.0);
        backend.connect(g1, dest);
        backend.connect(g2, dest);
        core.track_voice(a, vec![g1], 0.0);
        core.track_voice(b, vec![g2], 0.0);

        core.reclaim_ended(&mut backend, &[a]);
        assert_eq!(core.active_voices(), 1);
        assert!(!backend.is_connected(g1, dest));
        assert!(backend.is_connected(g2, dest));
    }
}
