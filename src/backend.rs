//! The boundary between the scheduling core and a real-time rendering backend.
//!
//! Everything the engine does to make sound goes through [`AudioBackend`]:
//! reading the render clock, creating nodes, wiring them together, scheduling
//! parameter automation, and starting/stopping sources at future timestamps.
//! The core never blocks on the backend; all scheduling is fire-and-forget
//! against render-domain times returned by [`AudioBackend::now`].

use std::sync::Arc;

use crate::sample_bank::SampleBuffer;

/// Opaque handle to a node owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Oscillator waveforms for synth voices and LFO carriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

/// Biquad filter kinds used in the persistent chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Lowpass,
    Highpass,
    Bandpass,
}

/// A schedulable parameter on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Gain,
    Pan,
    Frequency,
    Q,
    Detune,
    PlaybackRate,
}

/// Address of one automatable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamRef {
    pub node: NodeId,
    pub kind: ParamKind,
}

impl ParamRef {
    pub fn new(node: NodeId, kind: ParamKind) -> Self {
        Self { node, kind }
    }
}

/// Contract the engine schedules against.
///
/// Times are in the backend's monotonic render-clock domain (seconds), not
/// wall-clock. Parameter scheduling follows the Web-Audio-style model: a
/// cancel drops pending automation points at or after the given time, a set
/// places a flat value, a ramp moves linearly from the previous point.
pub trait AudioBackend {
    /// Current render time in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Render rate in frames per second.
    fn sample_rate(&self) -> u32;

    /// Wake a suspended backend. Idempotent.
    fn resume(&mut self);

    /// The final mix destination node.
    fn destination(&self) -> NodeId;

    fn create_gain(&mut self, gain: f64) -> NodeId;
    fn create_panner(&mut self) -> NodeId;
    fn create_filter(&mut self, kind: FilterKind, frequency: f64) -> NodeId;
    fn create_oscillator(&mut self, waveform: Waveform, frequency: f64) -> NodeId;
    fn create_buffer_source(
        &mut self,
        buffer: Arc<SampleBuffer>,
        playback_rate: f64,
        looped: bool,
    ) -> NodeId;
    /// Constant-valued source, used for unipolar LFO offsetting.
    fn create_constant(&mut self, value: f64) -> NodeId;
    /// Convolution node for reverb sends; `impulse` is its response.
    fn create_convolver(&mut self, impulse: Arc<SampleBuffer>) -> NodeId;
    /// Fixed delay line of `time` seconds.
    fn create_delay(&mut self, time: f64) -> NodeId;
    /// Waveshaping distortion with the given curve amount.
    fn create_distortion(&mut self, amount: f64) -> NodeId;
    /// Bit-depth reduction.
    fn create_bitcrusher(&mut self, bits: u32) -> NodeId;

    /// Connect audio output of `from` into `to`.
    fn connect(&mut self, from: NodeId, to: NodeId);
    /// Connect audio output of `from` as a modulator of `target`.
    fn connect_to_param(&mut self, from: NodeId, target: ParamRef);
    /// Remove every connection from and to `node`.
    fn disconnect(&mut self, node: NodeId);

    /// Schedule a source to begin at `when`, `offset` seconds into its
    /// buffer (ignored for oscillators and constants).
    fn start_source(&mut self, node: NodeId, when: f64, offset: f64);
    /// Schedule a source to stop at `when`.
    fn stop_source(&mut self, node: NodeId, when: f64);
    /// Drain sources that reached their natural end since the last poll.
    fn poll_ended(&mut self) -> Vec<NodeId>;

    /// Present value of a parameter.
    fn param_value(&self, target: ParamRef) -> f64;
    /// Set a parameter immediately, outside the automation schedule.
    fn set_param(&mut self, target: ParamRef, value: f64);
    /// Cancel automation points scheduled at or after `from`.
    fn cancel_scheduled(&mut self, target: ParamRef, from: f64);
    /// Schedule a flat value at `when`.
    fn set_value_at(&mut self, target: ParamRef, when: f64, value: f64);
    /// Schedule a linear ramp ending at `when`.
    fn ramp_to_at(&mut self, target: ParamRef, when: f64, value: f64);
}
