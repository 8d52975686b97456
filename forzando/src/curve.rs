//! Controller mapping curves.
//!
//! A curve maps the 128 MIDI controller steps to values in [-1, 1] through
//! 128 control points with linear interpolation between them. Seven
//! predefined shapes occupy indices 0..=6; instrument-defined curves from
//! `<curve>` headers follow.

use crate::opcode::Opcode;

/// Number of always-available predefined curves.
pub const NUM_PREDEFINED: usize = 7;

/// A 128-point controller mapping.
#[derive(Clone, Debug)]
pub struct Curve {
    points: [f32; 128],
}

impl Curve {
    /// Predefined curve by index:
    /// 0 linear 0..1, 1 bipolar -1..1, 2 inverse 1..0, 3 inverse bipolar
    /// 1..-1, 4 x^2, 5 sqrt(x), 6 sqrt(1-x). Out-of-range indices fall back
    /// to linear.
    pub fn predefined(index: usize) -> Self {
        let mut points = [0.0f32; 128];
        for (i, point) in points.iter_mut().enumerate() {
            let x = i as f32 / 127.0;
            *point = match index {
                0 => x,
                1 => 2.0 * x - 1.0,
                2 => 1.0 - x,
                3 => 1.0 - 2.0 * x,
                4 => x * x,
                5 => x.sqrt(),
                6 => (1.0 - x).sqrt(),
                _ => x,
            };
        }
        Self { points }
    }

    /// Build from sparse `(index, value)` points. Gaps interpolate linearly
    /// between the nearest defined neighbors; the ends are anchored to the
    /// nearest supplied value.
    pub fn from_points(sparse: &[(u8, f32)]) -> Self {
        let mut sorted: Vec<(usize, f32)> = sparse
            .iter()
            .map(|&(i, v)| (i.min(127) as usize, v.clamp(-1.0, 1.0)))
            .collect();
        sorted.sort_by_key(|&(i, _)| i);
        sorted.dedup_by_key(|&mut (i, _)| i);

        let mut points = [0.0f32; 128];
        if sorted.is_empty() {
            return Self::predefined(0);
        }

        let (first_index, first_value) = sorted[0];
        for point in points.iter_mut().take(first_index) {
            *point = first_value;
        }
        let (last_index, last_value) = *sorted.last().expect("non-empty");
        for point in points.iter_mut().skip(last_index) {
            *point = last_value;
        }
        for window in sorted.windows(2) {
            let (i0, v0) = window[0];
            let (i1, v1) = window[1];
            points[i0] = v0;
            let span = (i1 - i0) as f32;
            for i in i0 + 1..i1 {
                let t = (i - i0) as f32 / span;
                points[i] = v0 + (v1 - v0) * t;
            }
        }

        Self { points }
    }

    /// Build from the opcodes of a `<curve>` header (`v000=..`, `v127=..`).
    pub fn from_header_opcodes<'a>(opcodes: impl Iterator<Item = &'a Opcode>) -> Self {
        let mut sparse = Vec::new();
        for op in opcodes {
            if op.name == "v" {
                if let (Some(index), Some(value)) = (op.parameter(), op.f32_value()) {
                    sparse.push((index, value));
                }
            }
        }
        Self::from_points(&sparse)
    }

    /// Evaluate at a 7-bit controller value.
    #[inline]
    pub fn eval_cc7(&self, value: u8) -> f32 {
        self.points[value.min(127) as usize]
    }

    /// Evaluate at a normalized position in [0, 1], interpolating between
    /// table steps.
    pub fn eval_normalized(&self, x: f32) -> f32 {
        let position = x.clamp(0.0, 1.0) * 127.0;
        let index = (position as usize).min(126);
        let t = position - index as f32;
        self.points[index] * (1.0 - t) + self.points[index + 1] * t
    }
}

/// The curve table of a loaded instrument: predefined curves at 0..=6,
/// instrument curves appended by `<curve>` headers in file order.
pub struct CurveSet {
    curves: Vec<Curve>,
}

impl CurveSet {
    /// A set containing only the predefined curves.
    pub fn with_predefined() -> Self {
        Self { curves: (0..NUM_PREDEFINED).map(Curve::predefined).collect() }
    }

    /// Curves defined beyond the predefined block.
    pub fn num_user_curves(&self) -> usize {
        self.curves.len() - NUM_PREDEFINED
    }

    /// Fetch a curve; unknown indices fall back to linear.
    pub fn get(&self, index: usize) -> &Curve {
        self.curves.get(index).unwrap_or(&self.curves[0])
    }

    /// Append a user curve, returning its index.
    pub fn add(&mut self, curve: Curve) -> usize {
        self.curves.push(curve);
        self.curves.len() - 1
    }

    /// Overwrite a specific slot (used by `curve_index` headers); grows the
    /// table with linear curves when the index is past the end.
    pub fn set(&mut self, index: usize, curve: Curve) {
        while self.curves.len() <= index {
            self.curves.push(Curve::predefined(0));
        }
        self.curves[index] = curve;
    }
}

impl Default for CurveSet {
    fn default() -> Self {
        Self::with_predefined()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_curve_endpoints() {
        let curve = Curve::predefined(0);
        assert_eq!(curve.eval_cc7(0), 0.0);
        assert_eq!(curve.eval_cc7(127), 1.0);
        assert!((curve.eval_cc7(64) - 64.0 / 127.0).abs() < 1e-6);
        assert_eq!(curve.eval_normalized(0.0), 0.0);
        assert_eq!(curve.eval_normalized(1.0), 1.0);
        assert!((curve.eval_normalized(0.5) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn bipolar_curves() {
        let curve = Curve::predefined(1);
        assert_eq!(curve.eval_cc7(0), -1.0);
        assert_eq!(curve.eval_cc7(127), 1.0);
        assert!(curve.eval_cc7(64).abs() < 0.01);

        let inverse = Curve::predefined(3);
        assert_eq!(inverse.eval_cc7(0), 1.0);
        assert_eq!(inverse.eval_cc7(127), -1.0);
    }

    #[test]
    fn power_curves() {
        let squared = Curve::predefined(4);
        assert!((squared.eval_cc7(64) - (64.0f32 / 127.0).powi(2)).abs() < 1e-5);

        let root = Curve::predefined(5);
        assert!((root.eval_cc7(64) - (64.0f32 / 127.0).sqrt()).abs() < 1e-5);

        let inverse_root = Curve::predefined(6);
        assert_eq!(inverse_root.eval_cc7(0), 1.0);
        assert_eq!(inverse_root.eval_cc7(127), 0.0);
    }

    #[test]
    fn sparse_points_interpolate_and_anchor() {
        let curve = Curve::from_points(&[(63, 1.0), (127, 0.0)]);
        // Leading edge anchors to the first supplied value.
        assert_eq!(curve.eval_cc7(0), 1.0);
        assert_eq!(curve.eval_cc7(63), 1.0);
        // Linear down to the final point.
        assert!((curve.eval_cc7(95) - 0.5).abs() < 0.01);
        assert_eq!(curve.eval_cc7(127), 0.0);
    }

    #[test]
    fn header_opcodes_build_curves() {
        let opcodes = [
            Opcode::new("v000", "0"),
            Opcode::new("v063", "1"),
            Opcode::new("v127", "0"),
        ];
        let curve = Curve::from_header_opcodes(opcodes.iter());
        assert_eq!(curve.eval_cc7(0), 0.0);
        assert_eq!(curve.eval_cc7(63), 1.0);
        assert_eq!(curve.eval_cc7(127), 0.0);
        assert!((curve.eval_cc7(32) - 32.0 / 63.0).abs() < 0.01);
    }

    #[test]
    fn curve_set_fallback() {
        let mut set = CurveSet::with_predefined();
        assert_eq!(set.num_user_curves(), 0);
        let index = set.add(Curve::from_points(&[(0, 0.0), (127, -1.0)]));
        assert_eq!(index, NUM_PREDEFINED);
        // Unknown index falls back to linear.
        assert_eq!(set.get(99).eval_cc7(127), 1.0);
    }
}
