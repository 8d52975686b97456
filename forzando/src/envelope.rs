//! ADSR envelope generator.
//!
//! One instance lives in each voice per envelope (amp EG always, pitch and
//! filter EGs when the region defines them). The attack segment is linear;
//! decay and release decay exponentially toward their targets, which is how
//! amplitude envelopes are expected to sound. Release can be scheduled at a
//! frame offset inside the next block for sample-accurate note-off.

use smallvec::SmallVec;

use crate::config;
use crate::midi_state::MidiState;

/// Envelope parameters as parsed from a region, before velocity and CC
/// modulation are folded in at trigger time. Times are seconds.
#[derive(Clone, Debug)]
pub struct EgDescription {
    pub delay: f32,
    pub attack: f32,
    pub hold: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    pub start: f32,
    pub vel_to_attack: f32,
    pub vel_to_decay: f32,
    pub vel_to_release: f32,
    pub vel_to_sustain: f32,
    pub attack_cc: SmallVec<[(u8, f32); 2]>,
    pub decay_cc: SmallVec<[(u8, f32); 2]>,
    pub release_cc: SmallVec<[(u8, f32); 2]>,
    pub sustain_cc: SmallVec<[(u8, f32); 2]>,
}

impl Default for EgDescription {
    fn default() -> Self {
        Self {
            delay: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.0,
            start: 0.0,
            vel_to_attack: 0.0,
            vel_to_decay: 0.0,
            vel_to_release: 0.0,
            vel_to_sustain: 0.0,
            attack_cc: SmallVec::new(),
            decay_cc: SmallVec::new(),
            release_cc: SmallVec::new(),
            sustain_cc: SmallVec::new(),
        }
    }
}

impl EgDescription {
    fn cc_offset(list: &[(u8, f32)], midi: &MidiState) -> f32 {
        list.iter().map(|&(cc, depth)| depth * midi.cc_normalized(cc)).sum()
    }

    /// Effective attack seconds for this trigger.
    pub fn attack_for(&self, velocity: f32, midi: &MidiState) -> f32 {
        (self.attack + self.vel_to_attack * velocity + Self::cc_offset(&self.attack_cc, midi))
            .max(0.0)
    }

    pub fn decay_for(&self, velocity: f32, midi: &MidiState) -> f32 {
        (self.decay + self.vel_to_decay * velocity + Self::cc_offset(&self.decay_cc, midi)).max(0.0)
    }

    pub fn release_for(&self, velocity: f32, midi: &MidiState) -> f32 {
        (self.release + self.vel_to_release * velocity + Self::cc_offset(&self.release_cc, midi))
            .max(0.0)
    }

    pub fn sustain_for(&self, velocity: f32, midi: &MidiState) -> f32 {
        (self.sustain + self.vel_to_sustain * velocity + Self::cc_offset(&self.sustain_cc, midi))
            .clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    Delay,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    Done,
}

/// A running ADSR instance.
pub struct Adsr {
    stage: Stage,
    remaining: u32,
    value: f32,
    attack_step: f32,
    attack_remaining: u32,
    hold_samples: u32,
    decay_pole: f32,
    sustain: f32,
    release_pole: f32,
    start: f32,
    bounded: bool,
    release_at: Option<u32>,
    release_samples: u32,
}

impl Adsr {
    pub fn new() -> Self {
        Self {
            stage: Stage::Done,
            remaining: 0,
            value: 0.0,
            attack_step: 0.0,
            attack_remaining: 0,
            hold_samples: 0,
            decay_pole: 1.0,
            sustain: 1.0,
            release_pole: 0.0,
            start: 0.0,
            bounded: true,
            release_at: None,
            release_samples: 0,
        }
    }

    /// Arm the envelope for a new note. `velocity` is normalized to [0, 1];
    /// `bounded` clamps the output to [0, 1] (the amp EG case).
    pub fn trigger(
        &mut self,
        desc: &EgDescription,
        sample_rate: f32,
        velocity: f32,
        midi: &MidiState,
        bounded: bool,
    ) {
        let to_samples = |seconds: f32| (seconds * sample_rate).round().max(0.0) as u32;

        let delay_samples = to_samples(desc.delay);
        let attack_samples = to_samples(desc.attack_for(velocity, midi));
        self.hold_samples = to_samples(desc.hold);
        let decay_samples = to_samples(desc.decay_for(velocity, midi));
        self.release_samples = to_samples(desc.release_for(velocity, midi));
        self.sustain = desc.sustain_for(velocity, midi);
        self.start = desc.start.clamp(0.0, 1.0);
        self.bounded = bounded;
        self.release_at = None;

        self.attack_remaining = attack_samples;
        self.attack_step =
            if attack_samples > 0 { (1.0 - self.start) / attack_samples as f32 } else { 0.0 };

        // Exponential approach: the pole is sized so the segment traverses
        // its nominal range within the configured time.
        self.decay_pole = if decay_samples > 0 {
            self.sustain.max(config::VIRTUALLY_ZERO).powf(1.0 / decay_samples as f32)
        } else {
            0.0
        };
        self.release_pole = pole_for(self.release_samples);

        if delay_samples > 0 {
            self.stage = Stage::Delay;
            self.remaining = delay_samples;
            self.value = 0.0;
        } else {
            self.enter_attack();
        }
    }

    /// Schedule the release `offset` frames into the next `get_block` call.
    pub fn start_release(&mut self, offset: usize) {
        if self.stage != Stage::Release && self.stage != Stage::Done {
            self.release_at = Some(offset as u32);
        }
    }

    /// Immediately force a short release, used by stealing and `off_by`
    /// chokes. `seconds` bounds the ramp; the configured release is used
    /// when shorter.
    pub fn quick_release(&mut self, sample_rate: f32, seconds: f32) {
        let quick = (seconds * sample_rate).round() as u32;
        let samples = self.release_samples.min(quick.max(1));
        self.release_pole = pole_for(samples);
        self.release_at = None;
        self.stage = Stage::Release;
    }

    /// True once the envelope has decayed below the silence threshold.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Done
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        matches!(self.stage, Stage::Release | Stage::Done)
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Fill `out` with one block of envelope values. Returns true while the
    /// envelope still produces signal.
    pub fn get_block(&mut self, out: &mut [f32]) -> bool {
        let mut release_at = self.release_at.take();
        for (i, sample) in out.iter_mut().enumerate() {
            if let Some(at) = release_at {
                if i as u32 >= at {
                    if self.stage != Stage::Done {
                        self.stage = Stage::Release;
                    }
                    release_at = None;
                }
            }
            *sample = self.tick();
        }
        // A release offset beyond this block carries over.
        if let Some(at) = release_at {
            self.release_at = Some(at.saturating_sub(out.len() as u32));
        }
        self.stage != Stage::Done
    }

    fn enter_attack(&mut self) {
        if self.attack_remaining > 0 {
            self.stage = Stage::Attack;
            self.value = self.start;
        } else {
            self.value = 1.0;
            self.enter_hold();
        }
    }

    fn enter_hold(&mut self) {
        if self.hold_samples > 0 {
            self.stage = Stage::Hold;
            self.remaining = self.hold_samples;
        } else {
            self.enter_decay();
        }
    }

    fn enter_decay(&mut self) {
        if self.decay_pole > 0.0 && self.value > self.sustain {
            self.stage = Stage::Decay;
        } else {
            self.value = self.sustain;
            self.stage = Stage::Sustain;
        }
    }

    #[inline]
    fn tick(&mut self) -> f32 {
        match self.stage {
            Stage::Delay => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.enter_attack();
                }
                0.0
            }
            Stage::Attack => {
                let out = self.value;
                self.value += self.attack_step;
                self.attack_remaining -= 1;
                if self.attack_remaining == 0 || self.value >= 1.0 {
                    self.value = 1.0;
                    self.enter_hold();
                }
                out
            }
            Stage::Hold => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.enter_decay();
                }
                1.0
            }
            Stage::Decay => {
                let out = self.value;
                self.value *= self.decay_pole;
                if self.value <= self.sustain.max(config::VIRTUALLY_ZERO) {
                    self.value = self.sustain;
                    self.stage = Stage::Sustain;
                }
                self.clamp_output(out)
            }
            Stage::Sustain => {
                if self.sustain <= config::VIRTUALLY_ZERO {
                    // A zero-sustain envelope ends by itself.
                    self.stage = Stage::Release;
                }
                self.clamp_output(self.sustain)
            }
            Stage::Release => {
                let out = self.value;
                self.value *= self.release_pole;
                if self.value < config::VIRTUALLY_ZERO {
                    self.value = 0.0;
                    self.stage = Stage::Done;
                }
                self.clamp_output(out)
            }
            Stage::Done => 0.0,
        }
    }

    #[inline]
    fn clamp_output(&self, value: f32) -> f32 {
        if self.bounded { value.clamp(0.0, 1.0) } else { value }
    }
}

impl Default for Adsr {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sample multiplier that drains from 1.0 to the silence threshold over
/// `samples`.
fn pole_for(samples: u32) -> f32 {
    if samples > 0 {
        config::VIRTUALLY_ZERO.powf(1.0 / samples as f32)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(adsr: &mut Adsr, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        adsr.get_block(&mut out);
        out
    }

    fn simple_desc() -> EgDescription {
        EgDescription {
            attack: 0.010,
            decay: 0.050,
            sustain: 0.5,
            release: 0.020,
            ..EgDescription::default()
        }
    }

    #[test]
    fn attack_reaches_one_in_time() {
        let midi = MidiState::new();
        let mut adsr = Adsr::new();
        adsr.trigger(&simple_desc(), 1000.0, 1.0, &midi, true);
        // attack = 10 ms at 1 kHz = 10 samples
        let out = run(&mut adsr, 12);
        assert!(out[0] < 0.2);
        assert!(out[5] > 0.3 && out[5] < 0.8);
        assert!((out[10] - 1.0).abs() < 1e-6 || out[11] >= out[10]);
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn decay_settles_on_sustain() {
        let midi = MidiState::new();
        let mut adsr = Adsr::new();
        adsr.trigger(&simple_desc(), 1000.0, 1.0, &midi, true);
        let out = run(&mut adsr, 200);
        let tail = out[150];
        assert!((tail - 0.5).abs() < 0.05, "sustain level wrong: {tail}");
    }

    #[test]
    fn delay_emits_silence_first() {
        let midi = MidiState::new();
        let desc = EgDescription { delay: 0.005, ..simple_desc() };
        let mut adsr = Adsr::new();
        adsr.trigger(&desc, 1000.0, 1.0, &midi, true);
        let out = run(&mut adsr, 10);
        assert!(out[..5].iter().all(|&v| v == 0.0));
        assert!(out[6] > 0.0);
    }

    #[test]
    fn release_decays_to_idle() {
        let midi = MidiState::new();
        let mut adsr = Adsr::new();
        adsr.trigger(&simple_desc(), 1000.0, 1.0, &midi, true);
        run(&mut adsr, 100);
        adsr.start_release(0);
        // release = 20 ms at 1 kHz = 20 samples to cross the threshold
        let out = run(&mut adsr, 64);
        assert!(out[0] > out[10]);
        assert!(adsr.is_idle());
        assert!(adsr.value() == 0.0);
    }

    #[test]
    fn release_offset_is_sample_accurate() {
        let midi = MidiState::new();
        let desc = EgDescription { sustain: 1.0, release: 0.050, ..EgDescription::default() };
        let mut adsr = Adsr::new();
        adsr.trigger(&desc, 1000.0, 1.0, &midi, true);
        run(&mut adsr, 10);
        adsr.start_release(16);
        let out = run(&mut adsr, 32);
        // Full level up to the offset, decaying after.
        assert!(out[..16].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(out[20] < 1.0);
    }

    #[test]
    fn instant_envelope_is_full_scale() {
        let midi = MidiState::new();
        let mut adsr = Adsr::new();
        adsr.trigger(&EgDescription::default(), 48_000.0, 1.0, &midi, true);
        let out = run(&mut adsr, 8);
        assert!(out.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn quick_release_is_shorter_than_configured() {
        let midi = MidiState::new();
        let desc = EgDescription { release: 1.0, ..simple_desc() };
        let mut adsr = Adsr::new();
        adsr.trigger(&desc, 48_000.0, 1.0, &midi, true);
        run(&mut adsr, 64);
        adsr.quick_release(48_000.0, 0.010);
        // 10 ms at 48 kHz = 480 samples; well under the 1 s configured.
        let mut frames = 0;
        while !adsr.is_idle() && frames < 48_000 {
            run(&mut adsr, 64);
            frames += 64;
        }
        assert!(frames <= 640, "quick release took {frames} frames");
    }

    #[test]
    fn cc_modulation_stretches_attack() {
        let mut midi = MidiState::new();
        let mut desc = simple_desc();
        desc.attack_cc.push((73, 0.1));
        assert!((desc.attack_for(1.0, &midi) - 0.010).abs() < 1e-6);
        midi.cc(0, 73, 127);
        assert!((desc.attack_for(1.0, &midi) - 0.110).abs() < 1e-6);
    }
}
