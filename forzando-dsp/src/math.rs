//! Decibel, pitch, and interpolation helpers shared across the engine.

/// 2^(i/768) for i in 0..=768.
///
/// 768 = 12 notes x 64 subdivisions, giving 1.5625-cent resolution for the
/// fractional octave part. Entry 768 is included so interpolation at the
/// boundary needs no wraparound. Built at compile time from the Taylor
/// series of e^x, which is exact to f32 precision over [0, ln 2].
pub const EXP2_TABLE: [f32; 769] = {
    let mut table = [0.0f32; 769];
    let ln2 = core::f64::consts::LN_2;
    let mut i = 0;
    while i < 769 {
        let t = (i as f64 / 768.0) * ln2;
        let mut term = 1.0f64;
        let mut sum = 0.0f64;
        let mut k = 0u32;
        while k < 12 {
            sum += term;
            term *= t / ((k + 1) as f64);
            k += 1;
        }
        table[i] = sum as f32;
        i += 1;
    }
    table
};

/// Decibels to linear amplitude.
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db * 0.05)
}

/// Linear amplitude to decibels; silence floors at -160 dB.
#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    if gain <= 1e-8 { -160.0 } else { 20.0 * gain.log10() }
}

/// 2^x through [`EXP2_TABLE`] with linear interpolation of the fraction.
///
/// Accurate to about 1e-6 relative over the audio pitch range; used on the
/// per-sample pitch path where `exp2` proper is too slow. The input is
/// clamped to +-32 octaves, so zero or denormal arguments cannot reach the
/// table index math.
#[inline]
pub fn fast_exp2(x: f32) -> f32 {
    let x = x.clamp(-32.0, 32.0);
    let floor = x.floor();
    let frac = x - floor;
    let scaled = frac * 768.0;
    let index = scaled as usize;
    let t = scaled - index as f32;
    let index = index.min(767);
    let mantissa = EXP2_TABLE[index] * (1.0 - t) + EXP2_TABLE[index + 1] * t;
    let octave = floor as i32;
    // Scale by 2^octave through exponent arithmetic.
    mantissa * f32::from_bits(((127 + octave) as u32) << 23)
}

/// Cents to frequency ratio: 2^(cents/1200).
#[inline]
pub fn cents_to_ratio(cents: f32) -> f32 {
    fast_exp2(cents * (1.0 / 1200.0))
}

/// Equal-tempered frequency of a MIDI key (A4 = key 69 = 440 Hz).
#[inline]
pub fn midi_note_frequency(key: f32) -> f32 {
    440.0 * fast_exp2((key - 69.0) / 12.0)
}

/// Linear interpolation.
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        for db in [-60.0f32, -12.0, -6.0, 0.0, 6.0, 12.0] {
            let gain = db_to_gain(db);
            assert!((gain_to_db(gain) - db).abs() < 1e-3);
        }
        assert_eq!(db_to_gain(0.0), 1.0);
        assert!((db_to_gain(-6.0) - 0.501187).abs() < 1e-5);
    }

    #[test]
    fn fast_exp2_tracks_exp2() {
        for i in -200..200 {
            let x = i as f32 * 0.05;
            let approx = fast_exp2(x);
            let exact = x.exp2();
            assert!(
                (approx / exact - 1.0).abs() < 1e-5,
                "fast_exp2({x}) = {approx}, exact {exact}"
            );
        }
    }

    #[test]
    fn note_frequencies() {
        assert!((midi_note_frequency(69.0) - 440.0).abs() < 0.01);
        assert!((midi_note_frequency(57.0) - 220.0).abs() < 0.01);
        assert!((midi_note_frequency(60.0) - 261.6256).abs() < 0.05);
    }

    #[test]
    fn cents_ratio_octave() {
        assert!((cents_to_ratio(1200.0) - 2.0).abs() < 1e-5);
        assert!((cents_to_ratio(-1200.0) - 0.5).abs() < 1e-5);
        assert!((cents_to_ratio(0.0) - 1.0).abs() < 1e-6);
        // 100 cents = one semitone.
        assert!((cents_to_ratio(100.0) - 2f32.powf(1.0 / 12.0)).abs() < 1e-5);
    }
}
