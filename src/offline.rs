//! Non-realtime backend.
//!
//! Records every node, connection, and scheduled automation event instead of
//! producing audio, with a manually advanced clock. This is what the tests
//! schedule against, and what the demo binary uses to show the scheduler
//! running without an audio device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{AudioBackend, FilterKind, NodeId, ParamKind, ParamRef, Waveform};
use crate::sample_bank::SampleBuffer;

/// What a recorded node is.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Destination,
    Gain,
    Panner,
    Filter(FilterKind),
    Oscillator(Waveform),
    BufferSource {
        buffer: Arc<SampleBuffer>,
        playback_rate: f64,
        looped: bool,
    },
    Constant(f64),
    Convolver(Arc<SampleBuffer>),
    Delay(f64),
    Distortion(f64),
    Bitcrusher(u32),
}

/// One recorded automation event on a parameter, in schedule order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamEvent {
    Cancel { from: f64 },
    SetValue { at: f64, value: f64 },
    RampTo { at: f64, value: f64 },
}

#[derive(Debug, Clone, Copy)]
struct SourceState {
    start_when: f64,
    offset: f64,
    started: bool,
    stop_when: Option<f64>,
    reported: bool,
}

/// Recording [`AudioBackend`] with a manually driven clock.
pub struct OfflineBackend {
    now: f64,
    resumed: bool,
    next_node: u64,
    nodes: HashMap<NodeId, NodeKind>,
    connections: Vec<(NodeId, NodeId)>,
    param_connections: Vec<(NodeId, ParamRef)>,
    param_values: HashMap<ParamRef, f64>,
    param_events: HashMap<ParamRef, Vec<ParamEvent>>,
    sources: HashMap<NodeId, SourceState>,
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineBackend {
    pub fn new() -> Self {
        let mut backend = Self {
            now: 0.0,
            resumed: false,
            next_node: 0,
            nodes: HashMap::new(),
            connections: Vec::new(),
            param_connections: Vec::new(),
            param_values: HashMap::new(),
            param_events: HashMap::new(),
            sources: HashMap::new(),
        };
        backend.add_node(NodeKind::Destination);
        backend
    }

    /// Advance (or rewind, for test setup) the render clock.
    pub fn set_now(&mut self, now: f64) {
        self.now = now;
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn node_kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.nodes.get(&node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All automation recorded against `target`, in the order scheduled.
    pub fn param_events(&self, target: ParamRef) -> Vec<ParamEvent> {
        self.param_events.get(&target).cloned().unwrap_or_default()
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.connections.contains(&(from, to))
    }

    pub fn is_connected_to_param(&self, from: NodeId, target: ParamRef) -> bool {
        self.param_connections.contains(&(from, target))
    }

    /// Whether a start has been scheduled for `node`, and at what time.
    pub fn source_start(&self, node: NodeId) -> Option<(f64, f64)> {
        self.sources
            .get(&node)
            .filter(|s| s.started)
            .map(|s| (s.start_when, s.offset))
    }

    pub fn source_stop(&self, node: NodeId) -> Option<f64> {
        self.sources.get(&node).and_then(|s| s.stop_when)
    }

    fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(id, kind);
        id
    }

    fn initial_param(&mut self, node: NodeId, kind: ParamKind, value: f64) {
        self.param_values.insert(ParamRef::new(node, kind), value);
    }

    fn record(&mut self, target: ParamRef, event: ParamEvent) {
        self.param_events.entry(target).or_default().push(event);
    }

    /// Natural end time of a non-looping buffer source, if determinable.
    fn natural_end(&self, node: NodeId, state: &SourceState) -> Option<f64> {
        match self.nodes.get(&node)? {
            NodeKind::BufferSource {
                buffer,
                playback_rate,
                looped,
            } => {
                if *looped || *playback_rate == 0.0 {
                    return None;
                }
                let remaining = (buffer.duration() - state.offset).max(0.0);
                Some(state.start_when + remaining / playback_rate.abs())
            }
            _ => None,
        }
    }
}

impl AudioBackend for OfflineBackend {
    fn now(&self) -> f64 {
        self.now
    }

    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn resume(&mut self) {
        self.resumed = true;
    }

    fn destination(&self) -> NodeId {
        NodeId(0)
    }

    fn create_gain(&mut self, gain: f64) -> NodeId {
        let id = self.add_node(NodeKind::Gain);
        self.initial_param(id, ParamKind::Gain, gain);
        id
    }

    fn create_panner(&mut self) -> NodeId {
        let id = self.add_node(NodeKind::Panner);
        self.initial_param(id, ParamKind::Pan, 0.0);
        id
    }

    fn create_filter(&mut self, kind: FilterKind, frequency: f64) -> NodeId {
        let id = self.add_node(NodeKind::Filter(kind));
        self.initial_param(id, ParamKind::Frequency, frequency);
        self.initial_param(id, ParamKind::Q, 1.0);
        id
    }

    fn create_oscillator(&mut self, waveform: Waveform, frequency: f64) -> NodeId {
        let id = self.add_node(NodeKind::Oscillator(waveform));
        self.initial_param(id, ParamKind::Frequency, frequency);
        self.initial_param(id, ParamKind::Detune, 0.0);
        self.sources.insert(
            id,
            SourceState {
                start_when: 0.0,
                offset: 0.0,
                started: false,
                stop_when: None,
                reported: false,
            },
        );
        id
    }

    fn create_buffer_source(
        &mut self,
        buffer: Arc<SampleBuffer>,
        playback_rate: f64,
        looped: bool,
    ) -> NodeId {
        let id = self.add_node(NodeKind::BufferSource {
            buffer,
            playback_rate,
            looped,
        });
        self.initial_param(id, ParamKind::PlaybackRate, playback_rate);
        self.initial_param(id, ParamKind::Detune, 0.0);
        self.sources.insert(
            id,
            SourceState {
                start_when: 0.0,
                offset: 0.0,
                started: false,
                stop_when: None,
                reported: false,
            },
        );
        id
    }

    fn create_constant(&mut self, value: f64) -> NodeId {
        let id = self.add_node(NodeKind::Constant(value));
        self.sources.insert(
            id,
            SourceState {
                start_when: 0.0,
                offset: 0.0,
                started: false,
                stop_when: None,
                reported: false,
            },
        );
        id
    }

    fn create_convolver(&mut self, impulse: Arc<SampleBuffer>) -> NodeId {
        self.add_node(NodeKind::Convolver(impulse))
    }

    fn create_delay(&mut self, time: f64) -> NodeId {
        self.add_node(NodeKind::Delay(time))
    }

    fn create_distortion(&mut self, amount: f64) -> NodeId {
        self.add_node(NodeKind::Distortion(amount))
    }

    fn create_bitcrusher(&mut self, bits: u32) -> NodeId {
        self.add_node(NodeKind::Bitcrusher(bits))
    }

    fn connect(&mut self, from: NodeId, to: NodeId) {
        if !self.connections.contains(&(from, to)) {
            self.connections.push((from, to));
        }
    }

    fn connect_to_param(&mut self, from: NodeId, target: ParamRef) {
        if !self.param_connections.contains(&(from, target)) {
            self.param_connections.push((from, target));
        }
    }

    fn disconnect(&mut self, node: NodeId) {
        self.connections.retain(|(a, b)| *a != node && *b != node);
        self.param_connections
            .retain(|(a, t)| *a != node && t.node != node);
    }

    fn start_source(&mut self, node: NodeId, when: f64, offset: f64) {
        if let Some(state) = self.sources.get_mut(&node) {
            if !state.started {
                state.started = true;
                state.start_when = when;
                state.offset = offset;
            }
        }
    }

    fn stop_source(&mut self, node: NodeId, when: f64) {
        if let Some(state) = self.sources.get_mut(&node) {
            state.stop_when = Some(when);
        }
    }

    fn poll_ended(&mut self) -> Vec<NodeId> {
        let now = self.now;
        let mut ended: Vec<NodeId> = Vec::new();
        let ids: Vec<NodeId> = self.sources.keys().copied().collect();
        for id in ids {
            let state = self.sources[&id];
            if state.reported || !state.started {
                continue;
            }
            let stop = state.stop_when;
            let natural = self.natural_end(id, &state);
            let end = match (stop, natural) {
                (Some(s), Some(n)) => Some(s.min(n)),
                (Some(s), None) => Some(s),
                (None, n) => n,
            };
            if let Some(end) = end {
                if end <= now {
                    self.sources.get_mut(&id).unwrap().reported = true;
                    ended.push(id);
                }
            }
        }
        ended.sort();
        ended
    }

    fn param_value(&self, target: ParamRef) -> f64 {
        self.param_values.get(&target).copied().unwrap_or(0.0)
    }

    fn set_param(&mut self, target: ParamRef, value: f64) {
        self.param_values.insert(target, value);
    }

    fn cancel_scheduled(&mut self, target: ParamRef, from: f64) {
        self.record(target, ParamEvent::Cancel { from });
    }

    fn set_value_at(&mut self, target: ParamRef, when: f64, value: f64) {
        self.record(target, ParamEvent::SetValue { at: when, value });
        self.param_values.insert(target, value);
    }

    fn ramp_to_at(&mut self, target: ParamRef, when: f64, value: f64) {
        self.record(target, ParamEvent::RampTo { at: when, value });
        self.param_values.insert(target, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_is_node_zero() {
        let backend = OfflineBackend::new();
        assert_eq!(backend.destination(), NodeId(0));
        assert!(matches!(
            backend.node_kind(NodeId(0)),
            Some(NodeKind::Destination)
        ));
    }

    #[test]
    fn test_disconnect_removes_both_directions() {
        let mut backend = OfflineBackend::new();
        let a = backend.create_gain(1.0);
        let b = backend.create_gain(1.0);
        let dest = backend.destination();
        backend.connect(a, b);
        backend.connect(b, dest);

        backend.disconnect(b);
        assert!(!backend.is_connected(a, b));
        assert!(!backend.is_connected(b, dest));
    }

    #[test]
    fn test_stopped_oscillator_reports_ended_once() {
        let mut backend = OfflineBackend::new();
        let osc = backend.create_oscillator(Waveform::Sine, 440.0);
        backend.start_source(osc, 0.0, 0.0);
        backend.stop_source(osc, 1.0);

        backend.set_now(0.5);
        assert!(backend.poll_ended().is_empty());

        backend.set_now(1.0);
        assert_eq!(backend.poll_ended(), vec![osc]);
        assert!(backend.poll_ended().is_empty(), "reported exactly once");
    }

    #[test]
    fn test_buffer_source_ends_naturally() {
        let mut backend = OfflineBackend::new();
        let buffer = Arc::new(SampleBuffer::mono(vec![0.0; 44100], 44100));
        let src = backend.create_buffer_source(buffer, 2.0, false);
        backend.start_source(src, 1.0, 0.0);

        // 1 s of audio at double speed ends at t = 1.5.
        backend.set_now(1.4);
        assert!(backend.poll_ended().is_empty());
        backend.set_now(1.5);
        assert_eq!(backend.poll_ended(), vec![src]);
    }

    #[test]
    fn test_looped_source_never_ends_naturally() {
        let mut backend = OfflineBackend::new();
        let buffer = Arc::new(SampleBuffer::mono(vec![0.0; 100], 44100));
        let src = backend.create_buffer_source(buffer, 1.0, true);
        backend.start_source(src, 0.0, 0.0);
        backend.set_now(1000.0);
        assert!(backend.poll_ended().is_empty());
    }

    #[test]
    fn test_unstarted_source_never_ends() {
        let mut backend = OfflineBackend::new();
        let osc = backend.create_oscillator(Waveform::Saw, 110.0);
        backend.stop_source(osc, 0.0);
        backend.set_now(10.0);
        assert!(backend.poll_ended().is_empty());
    }
}
