//! Tempo-synced low-frequency oscillator.
//!
//! An [`Lfo`] modulates a backend parameter around a base value at a speed
//! expressed in cycles per bar. `speed = 1` completes one full cycle every
//! bar at the current tempo; the oscillator is started with a half-cycle
//! phase offset so it crosses its base value exactly on the bar line.

use tracing::debug;

use crate::backend::{AudioBackend, ParamRef, Waveform};
use crate::disposal::DisposalQueue;

/// Lifecycle of the LFO's backend nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoState {
    /// No nodes exist yet.
    Idle,
    /// Nodes created and connected, oscillator not started.
    Armed,
    /// Oscillator running.
    Running,
}

#[derive(Debug, Clone, Copy)]
struct LfoNodes {
    oscillator: crate::backend::NodeId,
    depth_gain: crate::backend::NodeId,
    /// Present only in unipolar mode: (constant source, offset gain).
    offset: Option<(crate::backend::NodeId, crate::backend::NodeId)>,
}

/// A bar-synced LFO bound to at most one parameter at a time.
#[derive(Debug, Clone)]
pub struct Lfo {
    base_value: f64,
    depth: f64,
    speed: f64,
    bpm: f64,
    waveform: Waveform,
    unipolar: bool,
    state: LfoState,
    nodes: Option<LfoNodes>,
}

impl Lfo {
    pub fn new(base_value: f64, depth: f64, speed: f64, bpm: f64) -> Self {
        Self {
            base_value,
            depth,
            speed,
            bpm,
            waveform: Waveform::Sine,
            unipolar: false,
            state: LfoState::Idle,
            nodes: None,
        }
    }

    /// LFO sweeping between `min` and `max`.
    pub fn from_range(min: f64, max: f64, speed: f64, bpm: f64) -> Self {
        let base = (max + min) / 2.0;
        Self::new(base, max - base, speed, bpm)
    }

    pub fn set_waveform(&mut self, waveform: Waveform) -> &mut Self {
        self.waveform = waveform;
        self
    }

    /// Remap the output into [0, 2 * depth] above zero instead of swinging
    /// around the base value. Used for parameters that must stay positive.
    pub fn set_unipolar(&mut self, unipolar: bool) -> &mut Self {
        self.unipolar = unipolar;
        self
    }

    pub fn set_bpm(&mut self, bpm: f64) -> &mut Self {
        if bpm > 0.0 {
            self.bpm = bpm;
        }
        self
    }

    pub fn base_value(&self) -> f64 {
        self.base_value
    }

    pub fn depth(&self) -> f64 {
        self.depth
    }

    /// Oscillator frequency in Hz: `speed` cycles per bar at the current
    /// tempo, with 4 beats to the bar.
    pub fn frequency(&self) -> f64 {
        self.speed * self.bpm / 240.0
    }

    /// Half-cycle start offset, so the carrier crosses its base value on
    /// the bar line rather than jumping to it.
    pub fn phase_offset(&self) -> f64 {
        let f = self.frequency();
        if f > 0.0 {
            1.0 / (2.0 * f)
        } else {
            0.0
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == LfoState::Running
    }

    pub fn state(&self) -> LfoState {
        self.state
    }

    /// Build the node graph. No-op unless idle.
    pub fn create(&mut self, backend: &mut dyn AudioBackend) {
        if self.state != LfoState::Idle {
            return;
        }
        let oscillator = backend.create_oscillator(self.waveform, self.frequency());
        let depth_gain = backend.create_gain(self.depth);
        backend.connect(oscillator, depth_gain);

        let offset = if self.unipolar {
            // Shift [-depth, depth] up to [0, 2 * depth]: halve the swing,
            // then add a constant 1 through the same half gain.
            let offset_gain = backend.create_gain(0.5);
            let constant = backend.create_constant(1.0);
            backend.connect(depth_gain, offset_gain);
            backend.connect(constant, offset_gain);
            Some((constant, offset_gain))
        } else {
            None
        };

        self.nodes = Some(LfoNodes {
            oscillator,
            depth_gain,
            offset,
        });
        self.state = LfoState::Armed;
    }

    /// Attach the output to `target`. The parameter keeps its own static
    /// value; the LFO sums on top of it.
    pub fn connect(&mut self, backend: &mut dyn AudioBackend, target: ParamRef) {
        self.create(backend);
        let Some(nodes) = self.nodes else { return };
        let output = nodes.offset.map(|(_, g)| g).unwrap_or(nodes.depth_gain);
        backend.connect_to_param(output, target);
        backend.set_param(target, self.base_value);
    }

    /// Start the oscillator, phase-aligned to a bar beginning at `when`.
    pub fn start(&mut self, backend: &mut dyn AudioBackend, when: f64) {
        if self.state != LfoState::Armed {
            return;
        }
        let Some(nodes) = self.nodes else { return };
        backend.start_source(nodes.oscillator, when + self.phase_offset(), 0.0);
        if let Some((constant, _)) = nodes.offset {
            backend.start_source(constant, when + self.phase_offset(), 0.0);
        }
        self.state = LfoState::Running;
        debug!(
            frequency = self.frequency(),
            when, "lfo started"
        );
    }

    /// Stop at `when` and hand the nodes to the disposal queue. The LFO
    /// returns to idle and can be re-created on the next bar.
    pub fn stop(&mut self, backend: &mut dyn AudioBackend, when: f64, disposal: &mut DisposalQueue) {
        let Some(nodes) = self.nodes.take() else {
            self.state = LfoState::Idle;
            return;
        };
        if self.state == LfoState::Running {
            backend.stop_source(nodes.oscillator, when);
            if let Some((constant, _)) = nodes.offset {
                backend.stop_source(constant, when);
            }
        }
        let mut doomed = vec![nodes.oscillator, nodes.depth_gain];
        if let Some((constant, offset_gain)) = nodes.offset {
            doomed.push(constant);
            doomed.push(offset_gain);
        }
        disposal.defer(when, doomed);
        self.state = LfoState::Idle;
    }
}
