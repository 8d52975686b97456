//! MIDI controller and note state, sampled by trigger decisions and
//! modulation generators.
//!
//! All mutation happens on the audio thread through the synth's event
//! methods; timestamps are absolute sample counts and must be monotonic
//! within a block. The on-velocity of a note survives its note-off so
//! release-triggered regions can reuse it.

use crate::config;

/// Bounded per-CC change history within the current block, read by
/// CC-smoothing modulators.
pub const CC_HISTORY_LEN: usize = 8;

/// One timestamped controller change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CcEvent {
    pub time: u64,
    pub value: u8,
}

#[derive(Clone, Copy)]
struct CcHistory {
    events: [CcEvent; CC_HISTORY_LEN],
    len: u8,
}

impl Default for CcHistory {
    fn default() -> Self {
        Self { events: [CcEvent { time: 0, value: 0 }; CC_HISTORY_LEN], len: 0 }
    }
}

impl CcHistory {
    fn push(&mut self, event: CcEvent) {
        if (self.len as usize) < CC_HISTORY_LEN {
            self.events[self.len as usize] = event;
            self.len += 1;
        } else {
            // Keep the most recent changes: shift out the oldest.
            self.events.copy_within(1.., 0);
            self.events[CC_HISTORY_LEN - 1] = event;
        }
    }
}

/// Snapshot of the MIDI channel state.
pub struct MidiState {
    cc: [u8; 128],
    note_on_velocity: [u8; 128],
    note_active: [bool; 128],
    active_notes: usize,
    pitch_bend: i16,
    channel_aftertouch: u8,
    poly_aftertouch: [u8; 128],
    tempo_sec_per_quarter: f32,
    last_event_time: u64,
    cc_history: [CcHistory; 128],
}

impl MidiState {
    pub fn new() -> Self {
        Self {
            cc: [0; 128],
            note_on_velocity: [0; 128],
            note_active: [false; 128],
            active_notes: 0,
            pitch_bend: 0,
            channel_aftertouch: 0,
            poly_aftertouch: [0; 128],
            tempo_sec_per_quarter: config::DEFAULT_TEMPO,
            last_event_time: 0,
            cc_history: [CcHistory::default(); 128],
        }
    }

    /// Forget everything; used by `load_sfz_file`.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Drop per-block histories. Called at the top of every render block.
    pub fn advance_block(&mut self) {
        for history in self.cc_history.iter_mut() {
            history.len = 0;
        }
    }

    fn observe_time(&mut self, time: u64) {
        debug_assert!(
            time >= self.last_event_time,
            "event timestamps must be monotonic within a block ({} < {})",
            time,
            self.last_event_time
        );
        self.last_event_time = self.last_event_time.max(time);
    }

    // -- event ingest -------------------------------------------------------

    pub fn note_on(&mut self, time: u64, key: u8, velocity: u8) {
        self.observe_time(time);
        let key = key.min(127) as usize;
        self.note_on_velocity[key] = velocity.min(127);
        if !self.note_active[key] {
            self.note_active[key] = true;
            self.active_notes += 1;
        }
    }

    pub fn note_off(&mut self, time: u64, key: u8) {
        self.observe_time(time);
        let key = key.min(127) as usize;
        if self.note_active[key] {
            self.note_active[key] = false;
            self.active_notes -= 1;
        }
        // The on-velocity is preserved for release triggers.
    }

    pub fn cc(&mut self, time: u64, number: u8, value: u8) {
        self.observe_time(time);
        let number = number.min(127) as usize;
        let value = value.min(127);
        self.cc[number] = value;
        self.cc_history[number].push(CcEvent { time, value });
    }

    pub fn pitch_bend(&mut self, time: u64, value: i16) {
        self.observe_time(time);
        self.pitch_bend = value.clamp(-8192, 8191);
    }

    pub fn channel_aftertouch(&mut self, time: u64, value: u8) {
        self.observe_time(time);
        self.channel_aftertouch = value.min(127);
    }

    pub fn poly_aftertouch(&mut self, time: u64, key: u8, value: u8) {
        self.observe_time(time);
        self.poly_aftertouch[key.min(127) as usize] = value.min(127);
    }

    pub fn tempo(&mut self, time: u64, sec_per_quarter: f32) {
        self.observe_time(time);
        if sec_per_quarter > 0.0 && sec_per_quarter.is_finite() {
            self.tempo_sec_per_quarter = sec_per_quarter;
        }
    }

    // -- queries ------------------------------------------------------------

    #[inline]
    pub fn cc_value(&self, number: u8) -> u8 {
        self.cc[number.min(127) as usize]
    }

    /// Controller value normalized to [0, 1].
    #[inline]
    pub fn cc_normalized(&self, number: u8) -> f32 {
        self.cc[number.min(127) as usize] as f32 / 127.0
    }

    /// Changes to `number` within the current block, oldest first.
    pub fn cc_changes(&self, number: u8) -> &[CcEvent] {
        let history = &self.cc_history[number.min(127) as usize];
        &history.events[..history.len as usize]
    }

    /// On-velocity of the most recent note-on for `key`, kept across
    /// note-off.
    #[inline]
    pub fn note_velocity(&self, key: u8) -> u8 {
        self.note_on_velocity[key.min(127) as usize]
    }

    #[inline]
    pub fn is_note_active(&self, key: u8) -> bool {
        self.note_active[key.min(127) as usize]
    }

    /// Number of keys currently held.
    #[inline]
    pub fn active_notes(&self) -> usize {
        self.active_notes
    }

    /// Raw 14-bit pitch bend in [-8192, 8191].
    #[inline]
    pub fn pitch_bend_value(&self) -> i16 {
        self.pitch_bend
    }

    /// Pitch bend normalized to [-1, 1].
    #[inline]
    pub fn pitch_bend_normalized(&self) -> f32 {
        self.pitch_bend as f32 / 8192.0
    }

    #[inline]
    pub fn channel_aftertouch_value(&self) -> u8 {
        self.channel_aftertouch
    }

    #[inline]
    pub fn poly_aftertouch_value(&self, key: u8) -> u8 {
        self.poly_aftertouch[key.min(127) as usize]
    }

    #[inline]
    pub fn tempo_sec_per_quarter(&self) -> f32 {
        self.tempo_sec_per_quarter
    }

    #[inline]
    pub fn last_event_time(&self) -> u64 {
        self.last_event_time
    }
}

impl Default for MidiState {
    fn default() -> Self {
        Self::new()
    }
}
