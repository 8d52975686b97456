//! Key-to-frequency mapping and stretched tuning.
//!
//! The default table is 12-tone equal temperament around A4 = 440 Hz. Hosts
//! that read scala files feed the resulting table in through
//! [`Tuning::set_key_frequencies`]; the engine itself never parses tuning
//! files.

use forzando_dsp::math;

/// Frequency table for the 128 MIDI keys.
pub struct Tuning {
    frequencies: [f32; 128],
}

impl Tuning {
    /// Equal-tempered table, A4 = 440 Hz.
    pub fn equal_temperament() -> Self {
        let mut frequencies = [0.0f32; 128];
        for (key, f) in frequencies.iter_mut().enumerate() {
            *f = math::midi_note_frequency(key as f32);
        }
        Self { frequencies }
    }

    /// Install an externally computed table (scala-derived or otherwise).
    pub fn set_key_frequencies(&mut self, frequencies: [f32; 128]) {
        self.frequencies = frequencies;
    }

    /// Frequency of an integral key.
    #[inline]
    pub fn key_frequency(&self, key: u8) -> f32 {
        self.frequencies[key.min(127) as usize]
    }

    /// Frequency of a fractional key, geometric interpolation between the
    /// neighboring table entries.
    pub fn fractional_key_frequency(&self, key: f32) -> f32 {
        let key = key.clamp(0.0, 127.0);
        let index = key.floor() as usize;
        let t = key - index as f32;
        if t == 0.0 || index >= 127 {
            return self.frequencies[index.min(127)];
        }
        let low = self.frequencies[index];
        let high = self.frequencies[index + 1];
        low * (high / low).powf(t)
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::equal_temperament()
    }
}

/// Railsback-style stretch: a per-key frequency ratio that flattens low
/// keys and sharpens high ones the way tuned pianos measure.
///
/// The deviation curve is a cubic through zero at the temperament center,
/// reaching about -25 cents at the bottom and +35 cents at the top of the
/// keyboard at full stretch; `ratio` scales it linearly, with 0 yielding
/// the identity.
pub struct StretchTuning {
    ratios: [f32; 128],
}

/// Key where the stretch curve crosses unity.
const STRETCH_CENTER: f32 = 60.0;

impl StretchTuning {
    pub fn railsback_from_ratio(ratio: f32) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        let mut ratios = [1.0f32; 128];
        if ratio > 0.0 {
            for (key, r) in ratios.iter_mut().enumerate() {
                let x = (key as f32 - STRETCH_CENTER) / 67.0;
                let cents = 30.0 * x * x * x * ratio;
                *r = math::cents_to_ratio(cents);
            }
        }
        Self { ratios }
    }

    #[inline]
    pub fn ratio_for_key(&self, key: u8) -> f32 {
        self.ratios[key.min(127) as usize]
    }

    /// Ratio at a fractional key; equals [`Self::ratio_for_key`] at
    /// integers.
    pub fn ratio_for_fractional_key(&self, key: f32) -> f32 {
        let key = key.clamp(0.0, 127.0);
        let index = key.floor() as usize;
        let t = key - index as f32;
        if t == 0.0 || index >= 127 {
            return self.ratios[index.min(127)];
        }
        let low = self.ratios[index];
        let high = self.ratios[index + 1];
        low + (high - low) * t
    }
}
