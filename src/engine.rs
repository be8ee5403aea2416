//! The engine: transport, mixer channels, instruments, and housekeeping.
//!
//! [`Engine::tick`] is the single pump everything runs from. Each tick it
//! advances the look-ahead clock, dispatches bar events to instruments with
//! future-dated render times, reclaims naturally finished voices, and drains
//! the disposal queue. The host only has to call it roughly every
//! [`crate::clock::LOOKAHEAD_MS`] milliseconds; scheduling accuracy comes
//! from the look-ahead window, not from the host timer.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::backend::{AudioBackend, NodeId, ParamKind, ParamRef};
use crate::clock::{Clock, ClockEvent, ClockEventKind};
use crate::disposal::DisposalQueue;
use crate::instrument::{BarContext, Instrument};
use crate::sample_bank::{SampleBank, SampleBuffer};

/// Fixed mixer width.
pub const NUM_CHANNELS: usize = 8;
/// Headroom gain on every channel strip.
pub const CHANNEL_GAIN: f64 = 0.75;

/// Write-once cache of generated reverb impulse responses, keyed by their
/// generation parameters.
#[derive(Default)]
pub struct ImpulseCache {
    buffers: HashMap<String, Arc<SampleBuffer>>,
}

impl ImpulseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(decay: f64, lowpass: Option<(f64, f64)>) -> String {
        let (lpf_start, lpf_end) = lowpass.unwrap_or((0.0, 0.0));
        format!("{}-{}-{}", decay, lpf_start, lpf_end)
    }

    /// Fetch or generate the impulse for the given decay, with an optional
    /// lowpass sweep baked into the tail.
    pub fn get_or_create(
        &mut self,
        decay: f64,
        lowpass: Option<(f64, f64)>,
        sample_rate: u32,
    ) -> Arc<SampleBuffer> {
        let key = Self::cache_key(decay, lowpass);
        self.buffers
            .entry(key)
            .or_insert_with(|| Arc::new(generate_impulse(decay, lowpass, sample_rate)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Exponentially decaying stereo noise burst with a short fade-in, the
/// classic synthetic reverb impulse. The tail decays to -60 dB at `decay`
/// seconds and runs half a decay longer.
fn generate_impulse(decay: f64, lowpass: Option<(f64, f64)>, sample_rate: u32) -> SampleBuffer {
    let total_time = decay * 1.5;
    let length = (total_time * sample_rate as f64).round() as usize;
    let decay_frames = (decay * sample_rate as f64).round().max(1.0);
    let fade_in_frames = (0.05 * sample_rate as f64).round() as usize;
    let decay_base = (1.0f64 / 1000.0).powf(1.0 / decay_frames);

    let mut rng = rand::thread_rng();
    let mut channels: Vec<Vec<f32>> = Vec::with_capacity(2);
    for _ in 0..2 {
        let mut chan = Vec::with_capacity(length);
        for i in 0..length {
            let noise: f64 = rng.gen_range(-1.0..1.0);
            chan.push((noise * decay_base.powi(i as i32)) as f32);
        }
        for i in 0..fade_in_frames.min(length) {
            chan[i] *= i as f32 / fade_in_frames as f32;
        }
        if let Some((lpf_start, lpf_end)) = lowpass {
            sweep_lowpass(&mut chan, lpf_start, lpf_end, sample_rate);
        }
        channels.push(chan);
    }

    let right = channels.pop().unwrap_or_default();
    let left = channels.pop().unwrap_or_default();
    SampleBuffer::stereo(left, right, sample_rate)
}

/// One-pole lowpass whose cutoff ramps linearly from `start` to `end` Hz
/// over the buffer.
fn sweep_lowpass(samples: &mut [f32], start: f64, end: f64, sample_rate: u32) {
    let len = samples.len();
    if len == 0 {
        return;
    }
    let mut state = 0.0f64;
    for (i, sample) in samples.iter_mut().enumerate() {
        let cutoff = start + (end - start) * i as f64 / len as f64;
        let coeff = 1.0 - (-2.0 * std::f64::consts::PI * cutoff / sample_rate as f64).exp();
        state += coeff.clamp(0.0, 1.0) * (*sample as f64 - state);
        *sample = state as f32;
    }
}

/// Top-level orchestrator owning the backend and everything scheduled on it.
pub struct Engine<B: AudioBackend> {
    backend: B,
    clock: Clock,
    channels: Vec<NodeId>,
    instruments: Vec<(Box<dyn Instrument>, usize)>,
    samples: SampleBank,
    impulses: ImpulseCache,
    disposal: DisposalQueue,
}

impl<B: AudioBackend> Engine<B> {
    pub fn new(mut backend: B, bpm: f64) -> Self {
        let destination = backend.destination();
        let channels = (0..NUM_CHANNELS)
            .map(|_| {
                let node = backend.create_gain(CHANNEL_GAIN);
                backend.connect(node, destination);
                node
            })
            .collect();
        Self {
            backend,
            clock: Clock::new(bpm),
            channels,
            instruments: Vec::new(),
            samples: SampleBank::new(),
            impulses: ImpulseCache::new(),
            disposal: DisposalQueue::new(),
        }
    }

    /// Register an instrument on a mixer channel (wrapped modulo the mixer
    /// width). Returns its index for later removal.
    pub fn add_instrument(&mut self, instrument: Box<dyn Instrument>, channel: usize) -> usize {
        self.instruments
            .push((instrument, channel % NUM_CHANNELS));
        self.instruments.len() - 1
    }

    pub fn remove_instrument(&mut self, index: usize) {
        if index < self.instruments.len() {
            let now = self.backend.now();
            let (mut instrument, _) = self.instruments.remove(index);
            instrument.stop(&mut self.backend, &mut self.disposal, now);
        }
    }

    /// Resume the backend, preload every declared sample, and start the
    /// transport.
    pub fn start(&mut self) {
        self.backend.resume();

        let keys: Vec<_> = self
            .instruments
            .iter()
            .flat_map(|(i, _)| i.sample_keys())
            .collect();
        self.samples.preload(&keys);

        let now = self.backend.now();
        info!(bpm = self.clock.bpm(), now, "engine start");
        self.clock.start(now);
    }

    /// The cooperative pump. Call roughly every 25 ms.
    pub fn tick(&mut self) {
        let now = self.backend.now();
        let events = self.clock.advance(now);
        for event in &events {
            self.dispatch(event);
        }

        let ended = self.backend.poll_ended();
        if !ended.is_empty() {
            for (instrument, _) in &mut self.instruments {
                instrument.handle_ended(&mut self.backend, &ended);
            }
        }
        self.disposal.process(&mut self.backend, now);
    }

    fn dispatch(&mut self, event: &ClockEvent) {
        if event.kind != ClockEventKind::Bar {
            return;
        }
        debug!(bar = event.position.bar, time = event.time, "bar");
        let duration = self.clock.bar_duration();
        for (instrument, channel) in &mut self.instruments {
            let ctx = BarContext {
                bar: event.position.bar,
                start: event.time,
                duration,
                destination: self.channels[*channel],
            };
            instrument.play(
                &mut self.backend,
                &self.samples,
                &mut self.impulses,
                &mut self.disposal,
                &ctx,
            );
        }
    }

    /// Suspend the transport, leaving positions and voices intact.
    pub fn pause(&mut self) {
        let now = self.backend.now();
        self.clock.pause(now);
    }

    /// Stop everything: transport reset, voices released, channel strips
    /// restored to their default level.
    pub fn stop(&mut self) {
        let now = self.backend.now();
        self.clock.stop(now);
        for (instrument, _) in &mut self.instruments {
            instrument.stop(&mut self.backend, &mut self.disposal, now);
        }
        for &channel in &self.channels {
            let target = ParamRef::new(channel, ParamKind::Gain);
            self.backend.cancel_scheduled(target, now);
            self.backend.set_param(target, CHANNEL_GAIN);
        }
        info!(now, "engine stop");
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.clock.set_bpm(bpm);
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn samples_mut(&mut self) -> &mut SampleBank {
        &mut self.samples
    }

    pub fn impulses_mut(&mut self) -> &mut ImpulseCache {
        &mut self.impulses
    }

    pub fn channel(&self, index: usize) -> NodeId {
        self.channels[index % NUM_CHANNELS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::OfflineBackend;
    use crate::pattern::Cycle;
    use crate::synth::Synth;

    fn engine() -> Engine<OfflineBackend> {
        Engine::new(OfflineBackend::new(), 120.0)
    }

    #[test]
    fn test_channels_wired_to_destination() {
        let engine = engine();
        let dest = engine.backend().destination();
        for i in 0..NUM_CHANNELS {
            let channel = engine.channel(i);
            assert!(engine.backend().is_connected(channel, dest));
            assert_eq!(
                engine
                    .backend()
                    .param_value(ParamRef::new(channel, ParamKind::Gain)),
                CHANNEL_GAIN
            );
        }
        assert_eq!(engine.channel(NUM_CHANNELS + 1), engine.channel(1));
    }

    #[test]
    fn test_tick_dispatches_bars_to_instruments() {
        let mut engine = engine();
        let mut synth = Synth::new();
        synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
        engine.add_instrument(Box::new(synth), 0);

        engine.start();
        assert!(engine.backend().resumed());
        engine.tick();

        // Bar 0 at t=0 falls inside the first look-ahead window.
        let sources: Vec<_> = (0..engine.backend().node_count() as u64)
            .map(NodeId)
            .filter_map(|n| engine.backend().source_start(n))
            .collect();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, 0.0);
    }

    #[test]
    fn test_bar_dispatch_builds_reverb_send() {
        use crate::instrument::{EffectKind, EffectSend};

        let mut engine = engine();
        let mut synth = Synth::new();
        synth.set_pattern(vec![Cycle::from_notes(vec![Some(60.0)])]);
        synth.core_mut().add_send(EffectSend::new(EffectKind::Reverb {
            decay: 1.0,
            lowpass: None,
        }));
        engine.add_instrument(Box::new(synth), 0);

        engine.start();
        engine.tick();

        assert_eq!(
            engine.impulses.len(),
            1,
            "playing through a reverb send fills the impulse cache"
        );
    }

    #[test]
    fn test_stop_restores_channel_gain() {
        let mut engine = engine();
        let channel = engine.channel(0);
        let target = ParamRef::new(channel, ParamKind::Gain);
        engine.backend_mut().set_param(target, 0.1);

        engine.start();
        engine.stop();

        assert_eq!(engine.backend().param_value(target), CHANNEL_GAIN);
        assert!(engine.clock().paused());
    }

    #[test]
    fn test_impulse_cache_is_write_once() {
        let mut cache = ImpulseCache::new();
        let a = cache.get_or_create(0.5, Some((8000.0, 200.0)), 8000);
        let b = cache.get_or_create(0.5, Some((8000.0, 200.0)), 8000);
        assert!(Arc::ptr_eq(&a, &b), "same key returns the cached buffer");
        assert_eq!(cache.len(), 1);

        cache.get_or_create(0.25, None, 8000);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_impulse_decays_and_fades_in() {
        let mut cache = ImpulseCache::new();
        let impulse = cache.get_or_create(0.5, None, 8000);

        assert_eq!(impulse.frames(), (0.5 * 1.5 * 8000.0) as usize);
        assert!(impulse.right.is_some(), "impulses are stereo");
        assert_eq!(impulse.left[0], 0.0, "fade-in starts from silence");

        let early: f32 = impulse.left[400..800].iter().map(|s| s.abs()).sum();
        let late: f32 = impulse.left[5600..6000].iter().map(|s| s.abs()).sum();
        assert!(late < early, "tail energy decays");
    }
}
