//! Look-ahead transport clock.
//!
//! A coarse, jittery software timer (anything that calls [`Clock::advance`]
//! roughly every [`LOOKAHEAD_MS`]) is converted into sample-accurate musical
//! time: whenever the next beat falls inside the [`SCHEDULE_AHEAD`] window,
//! the clock advances its position and hands consumers the *future* render
//! timestamp that beat occurs at, so they schedule against the precise render
//! clock instead of "now".

use tracing::debug;

/// How often the driving timer should fire, in milliseconds.
pub const LOOKAHEAD_MS: f64 = 25.0;
/// How far ahead of the render clock beats are scheduled, in seconds.
pub const SCHEDULE_AHEAD: f64 = 0.1;
/// Fixed 4/4 time.
pub const BEATS_PER_BAR: i64 = 4;

/// Musical position. `bar` is monotonic and signed; -1 means the transport
/// has started but the first bar has not been reached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MusicalPosition {
    pub beat: i64,
    pub bar: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockEventKind {
    Start,
    Beat,
    Bar,
    Pause,
    Stop,
}

/// An emitted transport event: what happened, where in musical time, and the
/// render timestamp it occurs at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEvent {
    pub kind: ClockEventKind,
    pub position: MusicalPosition,
    pub time: f64,
}

/// Identifier returned by [`Clock::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ClockCallback = Box<dyn FnMut(MusicalPosition, f64) + Send>;

/// The transport scheduler.
///
/// The clock itself owns no timer: the engine (or any host loop) calls
/// [`Clock::advance`] with the current render time. Events are both returned
/// to the caller and forwarded to registered listeners.
pub struct Clock {
    bpm: f64,
    position: MusicalPosition,
    next_beat_time: f64,
    paused: bool,
    listeners: Vec<(ListenerId, ClockEventKind, ClockCallback)>,
    next_listener_id: u64,
}

impl Clock {
    pub fn new(bpm: f64) -> Self {
        let mut clock = Self {
            bpm: 120.0,
            position: MusicalPosition { beat: 0, bar: 0 },
            next_beat_time: 0.0,
            paused: true,
            listeners: Vec::new(),
            next_listener_id: 0,
        };
        clock.set_bpm(bpm);
        clock
    }

    /// Set the tempo. Ignored if `bpm <= 0`. Takes effect on the next
    /// computed beat interval; beats already inside the look-ahead window
    /// are not rescheduled.
    pub fn set_bpm(&mut self, bpm: f64) {
        if bpm > 0.0 {
            self.bpm = bpm;
        }
    }

    /// Begin playback at render time `now`. No-op if already running.
    pub fn start(&mut self, now: f64) -> Vec<ClockEvent> {
        if !self.paused {
            return Vec::new();
        }
        self.position = MusicalPosition { beat: -1, bar: -1 };
        self.next_beat_time = now;
        self.paused = false;
        debug!(bpm = self.bpm, now, "transport start");
        vec![self.emit(ClockEventKind::Start, self.next_beat_time)]
    }

    /// Advance musical time up to `now + SCHEDULE_AHEAD`, emitting one event
    /// per beat crossed (plus a bar event on each wraparound). Returns
    /// nothing while paused.
    pub fn advance(&mut self, now: f64) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        if self.paused {
            return events;
        }

        while self.next_beat_time < now + SCHEDULE_AHEAD {
            self.position.beat = (self.position.beat + 1) % BEATS_PER_BAR;

            if self.position.beat == 0 {
                self.position.bar += 1;
                events.push(self.emit(ClockEventKind::Bar, self.next_beat_time));
            }
            events.push(self.emit(ClockEventKind::Beat, self.next_beat_time));

            self.next_beat_time += 60.0 / self.bpm;
        }

        events
    }

    /// Suspend the transport without resetting position.
    pub fn pause(&mut self, now: f64) -> Vec<ClockEvent> {
        if self.paused {
            return Vec::new();
        }
        self.paused = true;
        debug!(now, "transport pause");
        vec![self.emit(ClockEventKind::Pause, now)]
    }

    /// Full teardown: emits `stop`, pauses, and resets position and the beat
    /// schedule to zero. Not resumable without [`Clock::start`].
    pub fn stop(&mut self, now: f64) -> Vec<ClockEvent> {
        let mut events = vec![self.emit(ClockEventKind::Stop, now)];
        events.extend(self.pause(now));
        self.position = MusicalPosition { beat: 0, bar: 0 };
        self.next_beat_time = 0.0;
        events
    }

    /// Subscribe to one event kind.
    pub fn on(
        &mut self,
        kind: ClockEventKind,
        callback: impl FnMut(MusicalPosition, f64) + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, kind, Box::new(callback)));
        id
    }

    /// Unsubscribe a listener. Unknown ids are ignored.
    pub fn off(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _, _)| *lid != id);
    }

    fn emit(&mut self, kind: ClockEventKind, time: f64) -> ClockEvent {
        let position = self.position;
        for (_, lkind, callback) in &mut self.listeners {
            if *lkind == kind {
                callback(position, time);
            }
        }
        ClockEvent {
            kind,
            position,
            time,
        }
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn position(&self) -> MusicalPosition {
        self.position
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn beat_duration(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn bar_duration(&self) -> f64 {
        self.beat_duration() * BEATS_PER_BAR as f64
    }

    /// Render time of the next unscheduled beat.
    pub fn next_beat_time(&self) -> f64 {
        self.next_beat_time
    }
}
