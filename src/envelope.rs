//! ADSR envelope automation.
//!
//! An [`Envelope`] computes breakpoint times for a note and writes them to a
//! backend parameter as a cancel-then-ramp sequence. Three timing modes
//! control how attack/decay/release relate to the note's nominal duration:
//!
//! - `Clip`: a/d/r are fractions of the duration, normalized when their sum
//!   exceeds 1 — the whole envelope fits inside the note (sustain may be
//!   crushed to near zero).
//! - `Fit`: only a+d are normalized; sustain holds for the full duration and
//!   the release extends past it by `r * duration` of extra tail time.
//! - `Free`: a/d/r are literal seconds, duration is ignored (a long release
//!   may overlap the next note; overlapping voices simply sum).

use crate::backend::{AudioBackend, ParamRef};

/// Envelope timing mode. See the module docs for the semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeMode {
    Clip,
    #[default]
    Fit,
    Free,
}

/// Breakpoint times relative to the note start, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrTimes {
    pub attack_end: f64,
    pub decay_end: f64,
    pub release_start: f64,
    pub release_end: f64,
}

/// ADSR envelope with explicit start/max/end values.
///
/// Owned by the instrument or parameter that created it; setters mutate in
/// place and return `&mut Self` for chaining, `apply` is read-only.
#[derive(Debug, Clone)]
pub struct Envelope {
    start_value: f64,
    max_value: f64,
    end_value: f64,
    attack: f64,
    decay: f64,
    sustain: f64,
    release: f64,
    mode: EnvelopeMode,
}

impl Envelope {
    /// New envelope rising from `start_value` to `max_value` and ending back
    /// at `start_value`.
    pub fn new(start_value: f64, max_value: f64) -> Self {
        Self {
            start_value,
            max_value,
            end_value: start_value,
            attack: 0.01,
            decay: 0.0,
            sustain: 1.0,
            release: 0.01,
            mode: EnvelopeMode::default(),
        }
    }

    /// New envelope with an explicit end value.
    pub fn with_end(start_value: f64, max_value: f64, end_value: f64) -> Self {
        let mut env = Self::new(start_value, max_value);
        env.end_value = end_value;
        env
    }

    pub fn set_mode(&mut self, mode: EnvelopeMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_adsr(&mut self, attack: f64, decay: f64, sustain: f64, release: f64) -> &mut Self {
        self.attack = attack;
        self.decay = decay;
        self.sustain = sustain.clamp(0.0, 1.0);
        self.release = release;
        self
    }

    pub fn set_attack(&mut self, attack: f64) -> &mut Self {
        self.attack = attack;
        self
    }

    pub fn set_decay(&mut self, decay: f64) -> &mut Self {
        self.decay = decay;
        self
    }

    pub fn set_sustain(&mut self, sustain: f64) -> &mut Self {
        self.sustain = sustain.clamp(0.0, 1.0);
        self
    }

    pub fn set_release(&mut self, release: f64) -> &mut Self {
        self.release = release;
        self
    }

    pub fn set_max_value(&mut self, max_value: f64) -> &mut Self {
        self.max_value = max_value;
        self
    }

    pub fn start_value(&self) -> f64 {
        self.start_value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    pub fn attack(&self) -> f64 {
        self.attack
    }

    pub fn release(&self) -> f64 {
        self.release
    }

    pub fn mode(&self) -> EnvelopeMode {
        self.mode
    }

    /// Compute breakpoint times for a note of `duration` seconds.
    pub fn breakpoints(&self, duration: f64) -> AdsrTimes {
        let (a, d, r) = (self.attack, self.decay, self.release);
        match self.mode {
            EnvelopeMode::Clip => {
                let sum = a + d + r;
                let (na, nd, nr) = if sum > 1.0 {
                    (a / sum, d / sum, r / sum)
                } else {
                    (a, d, r)
                };
                let attack_end = na * duration;
                AdsrTimes {
                    attack_end,
                    decay_end: attack_end + nd * duration,
                    release_start: duration - nr * duration,
                    release_end: duration,
                }
            }
            EnvelopeMode::Fit => {
                let sum = a + d;
                let (na, nd) = if sum > 1.0 { (a / sum, d / sum) } else { (a, d) };
                let attack_end = na * duration;
                AdsrTimes {
                    attack_end,
                    decay_end: attack_end + nd * duration,
                    release_start: duration,
                    release_end: duration + r * duration,
                }
            }
            EnvelopeMode::Free => AdsrTimes {
                attack_end: a,
                decay_end: a + d,
                release_start: a + d,
                release_end: a + d + r,
            },
        }
    }

    /// Write the envelope onto `target` for a note starting at `start`.
    ///
    /// Cancels pending automation first, then: near-instant jump to the
    /// start value, linear ramp to max at attack end, linear ramp to the
    /// sustain level at decay end, flat hold until release start, linear
    /// ramp to the end value at release end. Returns the absolute
    /// release-end time, the earliest safe moment to stop the voice.
    pub fn apply(
        &self,
        backend: &mut dyn AudioBackend,
        target: ParamRef,
        start: f64,
        duration: f64,
    ) -> f64 {
        let times = self.breakpoints(duration);
        let sustain_value = self.max_value * self.sustain;

        backend.cancel_scheduled(target, start);
        backend.ramp_to_at(target, start + 0.0001, self.start_value);
        backend.ramp_to_at(target, start + times.attack_end, self.max_value);
        backend.ramp_to_at(target, start + times.decay_end, sustain_value);
        backend.set_value_at(target, start + times.release_start, sustain_value);
        backend.ramp_to_at(target, start + times.release_end, self.end_value);

        start + times.release_end
    }
}
