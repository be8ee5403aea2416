//! Pattern data model: cycles of chords, with wraparound indexing,
//! time-reversal, and a Euclidean-rhythm transform.
//!
//! A [`Pattern`] is an ordered sequence of [`Cycle`]s (one per bar); a cycle
//! is an ordered sequence of [`Chord`]s (one per step); a chord holds the
//! parallel note values sounding at that step, where `None` entries are
//! rests. Cycle selection wraps by `bar mod pattern.len()`, step lookup wraps
//! by `step mod cycle.len()`, so patterns of different lengths stay usable
//! against each other.

/// One step of a cycle: zero or more parallel values. An empty chord, or a
/// chord whose values are all `None`, is a rest.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chord<T> {
    values: Vec<Option<T>>,
}

impl<T: Clone> Chord<T> {
    pub fn single(value: T) -> Self {
        Self {
            values: vec![Some(value)],
        }
    }

    pub fn rest() -> Self {
        Self { values: vec![None] }
    }

    pub fn of(values: Vec<T>) -> Self {
        Self {
            values: values.into_iter().map(Some).collect(),
        }
    }

    pub fn from_values(values: Vec<Option<T>>) -> Self {
        Self { values }
    }

    pub fn is_rest(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }

    pub fn values(&self) -> &[Option<T>] {
        &self.values
    }

    /// The sounding values, rests filtered out.
    pub fn sounding(&self) -> Vec<T> {
        self.values.iter().filter_map(|v| v.clone()).collect()
    }
}

/// One bar's worth of a pattern.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cycle<T> {
    chords: Vec<Chord<T>>,
}

impl<T: Clone> Cycle<T> {
    pub fn from_steps(chords: Vec<Chord<T>>) -> Self {
        Self { chords }
    }

    /// Convenience: one single-valued chord per entry, `None` = rest.
    pub fn from_notes(notes: Vec<Option<T>>) -> Self {
        Self {
            chords: notes
                .into_iter()
                .map(|n| match n {
                    Some(v) => Chord::single(v),
                    None => Chord::rest(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.chords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chords.is_empty()
    }

    /// Wraparound step lookup. Panics on an empty cycle.
    pub fn at(&self, step: usize) -> &Chord<T> {
        &self.chords[step % self.chords.len()]
    }

    pub fn steps(&self) -> &[Chord<T>] {
        &self.chords
    }

    fn reverse(&mut self) {
        self.chords.reverse();
    }
}

/// An ordered sequence of cycles plus a fallback used while no cycles have
/// been set. The visible pattern always has length >= 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern<T> {
    cycles: Vec<Cycle<T>>,
    fallback: Vec<Cycle<T>>,
}

impl<T: Clone> Pattern<T> {
    /// Create an empty pattern backed by `fallback`. An empty fallback is
    /// replaced with a single one-rest cycle so the length invariant holds.
    pub fn new(fallback: Vec<Cycle<T>>) -> Self {
        let fallback = if fallback.is_empty() {
            vec![Cycle::from_steps(vec![Chord::rest()])]
        } else {
            fallback
        };
        Self {
            cycles: Vec::new(),
            fallback,
        }
    }

    /// Pattern with cycles already set.
    pub fn from_cycles(cycles: Vec<Cycle<T>>) -> Self {
        let mut pattern = Self::new(Vec::new());
        pattern.set(cycles);
        pattern
    }

    /// Single cycle of single-valued steps. Handy for parameter patterns.
    pub fn from_steps(steps: Vec<Option<T>>) -> Self {
        Self::from_cycles(vec![Cycle::from_notes(steps)])
    }

    /// Replace the pattern wholesale (the `.note(...)` operation).
    pub fn set(&mut self, cycles: Vec<Cycle<T>>) {
        self.cycles = cycles;
    }

    pub fn set_fallback(&mut self, fallback: Vec<Cycle<T>>) {
        if !fallback.is_empty() {
            self.fallback = fallback;
        }
    }

    /// The active cycles: the set ones, or the fallback while unset.
    pub fn cycles(&self) -> &[Cycle<T>] {
        if self.cycles.is_empty() {
            &self.fallback
        } else {
            &self.cycles
        }
    }

    pub fn len(&self) -> usize {
        self.cycles().len()
    }

    /// Wraparound cycle lookup by (possibly negative) bar index.
    pub fn cycle_at(&self, bar: i64) -> &Cycle<T> {
        let cycles = self.cycles();
        let index = bar.rem_euclid(cycles.len() as i64) as usize;
        &cycles[index]
    }

    /// Wraparound chord lookup.
    pub fn at(&self, bar: i64, step: usize) -> &Chord<T> {
        self.cycle_at(bar).at(step)
    }

    /// First sounding value at a step, or `default` for rests and empty
    /// cycles.
    pub fn value_or(&self, bar: i64, step: usize, default: T) -> T {
        let cycle = self.cycle_at(bar);
        if cycle.is_empty() {
            return default;
        }
        cycle
            .at(step)
            .values()
            .iter()
            .find_map(|v| v.clone())
            .unwrap_or(default)
    }

    /// Step values of a cycle as a flat `Option` list (first value of each
    /// chord), for stepped-ramp automation.
    pub fn step_values(&self, bar: i64) -> Vec<Option<T>> {
        self.cycle_at(bar)
            .steps()
            .iter()
            .map(|chord| chord.values().iter().find_map(|v| v.clone()))
            .collect()
    }

    /// Time-reversal: reverse cycle order and chord order within each cycle.
    pub fn reverse(&mut self) {
        let mut cycles = self.cycles().to_vec();
        cycles.reverse();
        for cycle in &mut cycles {
            cycle.reverse();
        }
        self.cycles = cycles;
    }

    /// Redistribute the existing chord values over Euclidean rhythms, one
    /// boolean mask per `pulses` entry. At each `true` slot the next chord of
    /// the existing cycle is consumed (cycling by `mod`); `false` slots
    /// become rests. The result has `max(existing, masks)` cycles, both
    /// sides indexed cyclically.
    pub fn euclid_multi(&mut self, pulses: &[usize], steps: usize, rotation: i32) {
        let masks: Vec<Vec<bool>> = pulses
            .iter()
            .map(|&p| euclid_mask(p, steps, rotation))
            .collect();
        if masks.is_empty() {
            return;
        }

        let current = self.cycles().to_vec();
        let loops = current.len().max(masks.len());
        let mut next = Vec::with_capacity(loops);

        for i in 0..loops {
            let cycle = &current[i % current.len()];
            let mask = &masks[i % masks.len()];
            let mut note_index = 0usize;
            let chords = mask
                .iter()
                .map(|&on| {
                    if on && !cycle.is_empty() {
                        let chord = cycle.at(note_index).clone();
                        note_index += 1;
                        chord
                    } else {
                        Chord::rest()
                    }
                })
                .collect();
            next.push(Cycle::from_steps(chords));
        }

        self.cycles = next;
    }

    /// Single-mask Euclidean transform.
    pub fn euclid(&mut self, pulses: usize, steps: usize, rotation: i32) {
        self.euclid_multi(&[pulses], steps, rotation);
    }
}

/// Distribute `pulses` onsets as evenly as possible across `steps` slots,
/// then left-rotate by `rotation` (normalized into range). Returns an empty
/// mask when `pulses > steps` or `steps == 0`.
///
/// Uses the group-merging formulation of Bjorklund's algorithm: singleton
/// `[1]` and `[0]` groups are repeatedly folded together, shorter list onto
/// longer, until fewer than two remainder groups survive.
pub fn euclid_mask(pulses: usize, steps: usize, rotation: i32) -> Vec<bool> {
    if steps == 0 || pulses > steps {
        return Vec::new();
    }

    let mut first: Vec<Vec<bool>> = vec![vec![true]; pulses];
    let mut second: Vec<Vec<bool>> = vec![vec![false]; steps - pulses];
    let mut threshold = 0usize;

    loop {
        let min_len = first.len().min(second.len());
        if min_len <= threshold {
            break;
        }
        threshold = 1;

        for x in 0..min_len {
            let tail = std::mem::take(&mut second[x]);
            first[x].extend(tail);
        }

        if min_len == first.len() {
            second.drain(..min_len);
        } else {
            second = first.split_off(min_len);
        }
    }

    let mut mask: Vec<bool> = first.into_iter().chain(second).flatten().collect();

    if rotation != 0 && !mask.is_empty() {
        let len = mask.len() as i32;
        let offset = ((rotation % len) + len) % len;
        mask.rotate_left(offset as usize);
    }

    mask
}
