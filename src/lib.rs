//! Ostinato: a live-coding pattern engine.
//!
//! A look-ahead transport clock turns a coarse host timer into
//! sample-accurate bar and beat events; instruments respond to each bar by
//! scheduling voices, envelopes, LFOs, and stepped parameter ramps against
//! future render timestamps. Everything renders through the [`backend`]
//! seam, so the same engine drives a real audio device or the recording
//! [`offline`] backend used by the tests and the demo binary.
//!
//! The moving parts:
//! - [`clock`]: the look-ahead scheduler
//! - [`pattern`]: cycles, chords, and Euclidean rhythms
//! - [`envelope`], [`lfo`], [`stepped_ramp`]: parameter automation
//! - [`instrument`], [`synth`], [`sampler`]: voice orchestration
//! - [`engine`]: the tick pump tying it all together

pub mod backend;
pub mod clock;
pub mod disposal;
pub mod engine;
pub mod envelope;
pub mod instrument;
pub mod lfo;
pub mod offline;
pub mod pattern;
pub mod sample_bank;
pub mod sampler;
pub mod stepped_ramp;
pub mod synth;

#[cfg(test)]
mod integration_tests;
