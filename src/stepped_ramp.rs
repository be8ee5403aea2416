//! Stepped ramp automation.
//!
//! Writes a step sequence onto a parameter as a series of short ramps and
//! flat holds, giving "stepped" motion with a tiny fade at each transition to
//! avoid clicks. `None` steps extend the hold of the previous value.

use crate::backend::{AudioBackend, ParamRef};

/// Transition fade at the start of each step, in seconds.
pub const DEFAULT_FADE: f64 = 0.001;

/// Schedule `steps` across `duration` seconds starting at `start`.
///
/// Each step occupies an equal slice of the duration (minus the fades). A
/// step ramps in over [`DEFAULT_FADE`] seconds and then holds flat until the
/// next non-empty step begins; trailing `None`s hold to the end. Empty step
/// slices are a no-op.
pub fn apply(
    backend: &mut dyn AudioBackend,
    target: ParamRef,
    start: f64,
    duration: f64,
    steps: &[Option<f64>],
) {
    apply_with_fade(backend, target, start, duration, steps, DEFAULT_FADE);
}

/// [`apply`] with an explicit fade time.
pub fn apply_with_fade(
    backend: &mut dyn AudioBackend,
    target: ParamRef,
    start: f64,
    duration: f64,
    steps: &[Option<f64>],
    fade: f64,
) {
    let len = steps.len();
    if len == 0 {
        return;
    }
    let step_len = (duration - fade * len as f64) / len as f64;

    let current = backend.param_value(target);
    backend.cancel_scheduled(target, start);
    backend.set_value_at(target, start, current);

    for (i, step) in steps.iter().enumerate() {
        let Some(value) = step else { continue };

        // Hold until the next defined step, or to the end of the sequence.
        let hold_steps = steps[i + 1..]
            .iter()
            .position(|s| s.is_some())
            .map(|offset| offset + 1)
            .unwrap_or(len - i);

        let ramp_end = start + step_len * i as f64 + fade;
        let hold_end = start + step_len * (i + hold_steps) as f64;
        backend.ramp_to_at(target, ramp_end, *value);
        backend.set_value_at(target, hold_end, *value);
    }
}
