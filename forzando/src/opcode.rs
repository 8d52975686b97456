//! Opcode representation and typed value accessors.
//!
//! The parser hands the engine raw `name=value` pairs. Names carry numeric
//! components (`eq3_freq`, `lfo2_pitch`, `amp_velcurve_64`); those are
//! stripped into `parameters` so dispatch can match on the family name
//! alone. Values stay raw strings until a typed accessor reads them.

use smallvec::SmallVec;

/// One parsed opcode: family name, embedded numeric components, raw value.
#[derive(Clone, Debug, PartialEq)]
pub struct Opcode {
    pub name: String,
    pub parameters: SmallVec<[u8; 2]>,
    pub value: String,
}

impl Opcode {
    /// Split a raw opcode name into its family and numeric components.
    ///
    /// `eq3_freq` becomes `eq_freq` with parameter 3; `v064` becomes `v`
    /// with parameter 64. A trailing underscore left by a stripped suffix is
    /// trimmed (`amp_velcurve_64` -> `amp_velcurve`).
    pub fn new(raw_name: &str, value: &str) -> Self {
        let mut name = String::with_capacity(raw_name.len());
        let mut parameters = SmallVec::new();
        let mut digits = String::new();

        for c in raw_name.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
            } else {
                if !digits.is_empty() {
                    parameters.push(digits.parse::<u32>().unwrap_or(0).min(255) as u8);
                    digits.clear();
                }
                name.push(c);
            }
        }
        if !digits.is_empty() {
            parameters.push(digits.parse::<u32>().unwrap_or(0).min(255) as u8);
        }
        if name.ends_with('_') {
            name.pop();
        }

        Self { name, parameters, value: value.to_string() }
    }

    /// First numeric component, when present.
    #[inline]
    pub fn parameter(&self) -> Option<u8> {
        self.parameters.first().copied()
    }

    /// Second numeric component (`eq2_freq_oncc3` style opcodes).
    #[inline]
    pub fn second_parameter(&self) -> Option<u8> {
        self.parameters.get(1).copied()
    }

    // -- typed accessors ----------------------------------------------------

    pub fn f32_value(&self) -> Option<f32> {
        self.value.trim().parse::<f32>().ok().filter(|v| v.is_finite())
    }

    pub fn f32_in(&self, lo: f32, hi: f32) -> Option<f32> {
        self.f32_value().map(|v| v.clamp(lo, hi))
    }

    pub fn i32_value(&self) -> Option<i32> {
        self.value.trim().parse::<i32>().ok()
    }

    pub fn u8_in(&self, lo: u8, hi: u8) -> Option<u8> {
        self.i32_value().map(|v| v.clamp(lo as i32, hi as i32) as u8)
    }

    pub fn u32_value(&self) -> Option<u32> {
        self.value.trim().parse::<u32>().ok()
    }

    pub fn u64_value(&self) -> Option<u64> {
        self.value.trim().parse::<u64>().ok()
    }

    /// MIDI note number, either numeric (`64`) or a note name (`c4`, `f#3`,
    /// `eb2`). Octave -1 maps note 0 (`c-1`).
    pub fn note_value(&self) -> Option<u8> {
        let text = self.value.trim();
        if let Ok(number) = text.parse::<i32>() {
            return Some(number.clamp(0, 127) as u8);
        }
        parse_note_name(text)
    }

    /// Percent value mapped to a normalized factor (`100` -> `1.0`).
    pub fn percent_value(&self, lo: f32, hi: f32) -> Option<f32> {
        self.f32_in(lo, hi).map(|v| v / 100.0)
    }
}

fn parse_note_name(text: &str) -> Option<u8> {
    let mut chars = text.chars();
    let letter = chars.next()?.to_ascii_lowercase();
    let base: i32 = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => return None,
    };
    let rest: String = chars.collect();
    let (accidental, octave_text) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };
    let octave: i32 = octave_text.parse().ok()?;
    let note = (octave + 1) * 12 + base + accidental;
    if (0..=127).contains(&note) { Some(note as u8) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_splitting() {
        let op = Opcode::new("eq3_freq", "1200");
        assert_eq!(op.name, "eq_freq");
        assert_eq!(op.parameter(), Some(3));

        let op = Opcode::new("ampeg_attack", "0.1");
        assert_eq!(op.name, "ampeg_attack");
        assert_eq!(op.parameter(), None);

        let op = Opcode::new("amp_velcurve_64", "0.5");
        assert_eq!(op.name, "amp_velcurve");
        assert_eq!(op.parameter(), Some(64));

        let op = Opcode::new("v127", "1.0");
        assert_eq!(op.name, "v");
        assert_eq!(op.parameter(), Some(127));

        let op = Opcode::new("eq2_freq_oncc3", "250");
        assert_eq!(op.name, "eq_freq_oncc");
        assert_eq!(op.parameters.as_slice(), &[2, 3]);
    }

    #[test]
    fn typed_accessors_clamp() {
        let op = Opcode::new("lovel", "300");
        assert_eq!(op.u8_in(0, 127), Some(127));

        let op = Opcode::new("volume", "-200");
        assert_eq!(op.f32_in(-144.0, 6.0), Some(-144.0));

        let op = Opcode::new("volume", "banana");
        assert_eq!(op.f32_value(), None);
    }

    #[test]
    fn note_names() {
        assert_eq!(Opcode::new("lokey", "c4").note_value(), Some(60));
        assert_eq!(Opcode::new("lokey", "a4").note_value(), Some(69));
        assert_eq!(Opcode::new("lokey", "c#4").note_value(), Some(61));
        assert_eq!(Opcode::new("lokey", "eb2").note_value(), Some(39));
        assert_eq!(Opcode::new("lokey", "c-1").note_value(), Some(0));
        assert_eq!(Opcode::new("lokey", "60").note_value(), Some(60));
        assert_eq!(Opcode::new("lokey", "h2").note_value(), None);
    }
}
