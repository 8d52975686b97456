//! Multi-mode stereo filters and EQ bands.
//!
//! Every mode is a cascade of at most three biquad sections (direct form 2
//! transposed) selected by [`FilterKind`]. Coefficients come from the usual
//! audio-EQ cookbook forms; the one-pole modes degenerate the section to a
//! first-order transfer.
//!
//! Cutoff, resonance and gain targets are smoothed with a 1 ms one-pole per
//! block. When a parameter is modulated at sample rate, callers use
//! [`Filter::process_modulated`], which recomputes coefficients per sample
//! and bypasses the smoothers.

use std::f32::consts::{FRAC_1_SQRT_2, PI};

use tracing::warn;

/// Filter modes. The pole count is part of the mode: `Lpf4p`/`Lpf6p` cascade
/// two and three identical 2-pole sections.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FilterKind {
    Lpf1p,
    #[default]
    Lpf2p,
    Lpf4p,
    Lpf6p,
    Hpf1p,
    Hpf2p,
    Bpf1p,
    Bpf2p,
    Brf2p,
    Apf2p,
    Peak,
    LowShelf,
    HighShelf,
}

impl FilterKind {
    /// Number of cascaded biquad sections for this mode.
    pub fn sections(self) -> usize {
        match self {
            FilterKind::Lpf4p => 2,
            FilterKind::Lpf6p => 3,
            _ => 1,
        }
    }

    /// True when the gain parameter shapes the response (EQ-style modes).
    pub fn uses_gain(self) -> bool {
        matches!(self, FilterKind::Peak | FilterKind::LowShelf | FilterKind::HighShelf)
    }
}

#[derive(Clone, Copy, Default)]
struct Coeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

#[derive(Clone, Copy, Default)]
struct SectionState {
    s1: f32,
    s2: f32,
}

impl SectionState {
    #[inline]
    fn tick(&mut self, c: &Coeffs, x: f32) -> f32 {
        let y = c.b0 * x + self.s1;
        self.s1 = c.b1 * x - c.a1 * y + self.s2;
        self.s2 = c.b2 * x - c.a2 * y;
        y
    }
}

/// One-pole parameter smoother with a 1 ms time constant.
#[derive(Clone, Copy)]
struct Smoother {
    pole: f32,
    value: f32,
    primed: bool,
}

impl Smoother {
    fn new(sample_rate: f32) -> Self {
        Self { pole: (-1.0 / (0.001 * sample_rate)).exp(), value: 0.0, primed: false }
    }

    /// Advance by `frames` samples toward `target` and return the smoothed
    /// value used for this block.
    fn advance(&mut self, target: f32, frames: usize) -> f32 {
        if !self.primed {
            self.value = target;
            self.primed = true;
            return target;
        }
        let decay = self.pole.powi(frames as i32);
        self.value = target + (self.value - target) * decay;
        self.value
    }

    fn snap(&mut self, value: f32) {
        self.value = value;
        self.primed = true;
    }
}

const MAX_SECTIONS: usize = 3;
const MIN_CUTOFF: f32 = 5.0;

/// A stereo multi-mode filter.
pub struct Filter {
    kind: FilterKind,
    sample_rate: f32,
    coeffs: [Coeffs; MAX_SECTIONS],
    state: [[SectionState; MAX_SECTIONS]; 2],
    cutoff: Smoother,
    resonance: Smoother,
    gain: Smoother,
}

impl Filter {
    pub fn new(kind: FilterKind, sample_rate: f32) -> Self {
        Self {
            kind,
            sample_rate,
            coeffs: [Coeffs::default(); MAX_SECTIONS],
            state: [[SectionState::default(); MAX_SECTIONS]; 2],
            cutoff: Smoother::new(sample_rate),
            resonance: Smoother::new(sample_rate),
            gain: Smoother::new(sample_rate),
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FilterKind) {
        self.kind = kind;
        self.reset();
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.cutoff = Smoother::new(sample_rate);
        self.resonance = Smoother::new(sample_rate);
        self.gain = Smoother::new(sample_rate);
        self.reset();
    }

    /// Clear the delay lines; parameter smoothers snap to their next target.
    pub fn reset(&mut self) {
        self.state = [[SectionState::default(); MAX_SECTIONS]; 2];
        self.cutoff.primed = false;
        self.resonance.primed = false;
        self.gain.primed = false;
    }

    /// Snap the smoothers to the given values without filtering anything.
    pub fn prime(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32) {
        self.cutoff.snap(cutoff);
        self.resonance.snap(resonance_db);
        self.gain.snap(gain_db);
    }

    /// Filter one stereo block with per-block coefficients.
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        cutoff: f32,
        resonance_db: f32,
        gain_db: f32,
    ) {
        let frames = left.len().min(right.len());
        if frames == 0 {
            return;
        }
        let cutoff = self.cutoff.advance(cutoff, frames);
        let resonance = self.resonance.advance(resonance_db, frames);
        let gain = self.gain.advance(gain_db, frames);
        self.update_coeffs(cutoff, resonance, gain);

        let sections = self.kind.sections();
        for section in 0..sections {
            let c = self.coeffs[section];
            let state_l = &mut self.state[0][section];
            for x in left[..frames].iter_mut() {
                *x = state_l.tick(&c, *x);
            }
            let state_r = &mut self.state[1][section];
            for x in right[..frames].iter_mut() {
                *x = state_r.tick(&c, *x);
            }
        }
    }

    /// Filter one stereo block with sample-rate parameter trajectories.
    ///
    /// Coefficients are recomputed every sample; the block smoothers are
    /// bypassed (the trajectories are assumed already smooth). A parameter
    /// span shorter than the block is extended with its last value, so a
    /// one-element slice acts as a constant.
    pub fn process_modulated(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        cutoff: &[f32],
        resonance_db: &[f32],
        gain_db: &[f32],
    ) {
        if cutoff.is_empty() {
            return;
        }
        let frames = left.len().min(right.len());
        let sections = self.kind.sections();
        let last_cutoff = *cutoff.last().expect("non-empty");
        let last_res = resonance_db.last().copied().unwrap_or(0.0);
        let last_gain = gain_db.last().copied().unwrap_or(0.0);
        for i in 0..frames {
            let cut = cutoff.get(i).copied().unwrap_or(last_cutoff);
            let res = resonance_db.get(i).copied().unwrap_or(last_res);
            let gain = gain_db.get(i).copied().unwrap_or(last_gain);
            self.update_coeffs(cut, res, gain);
            let mut l = left[i];
            let mut r = right[i];
            for section in 0..sections {
                let c = self.coeffs[section];
                l = self.state[0][section].tick(&c, l);
                r = self.state[1][section].tick(&c, r);
            }
            left[i] = l;
            right[i] = r;
        }
        self.cutoff.snap(last_cutoff);
        self.resonance.snap(last_res);
        self.gain.snap(last_gain);
    }

    fn update_coeffs(&mut self, cutoff: f32, resonance_db: f32, gain_db: f32) {
        let nyquist = self.sample_rate * 0.495;
        let cutoff = cutoff.clamp(MIN_CUTOFF, nyquist);
        let w = 2.0 * PI * cutoff / self.sample_rate;
        // Resonance is in dB above the Butterworth baseline.
        let q = FRAC_1_SQRT_2 * 10f32.powf(resonance_db / 20.0);
        let q = q.max(1e-3);

        let c = match self.kind {
            FilterKind::Lpf1p => one_pole_lp(w),
            FilterKind::Hpf1p => one_pole_hp(w),
            FilterKind::Bpf1p => one_pole_bp(w),
            FilterKind::Lpf2p | FilterKind::Lpf4p | FilterKind::Lpf6p => lpf2(w, q),
            FilterKind::Hpf2p => hpf2(w, q),
            FilterKind::Bpf2p => bpf2(w, q),
            FilterKind::Brf2p => brf2(w, q),
            FilterKind::Apf2p => apf2(w, q),
            FilterKind::Peak => peak(w, q, gain_db),
            FilterKind::LowShelf => shelf(w, q, gain_db, false),
            FilterKind::HighShelf => shelf(w, q, gain_db, true),
        };
        for section in 0..self.kind.sections() {
            self.coeffs[section] = c;
        }
    }
}

/// A parametric EQ band: peak or shelf, parameterized by bandwidth in
/// octaves rather than resonance.
pub struct EqBand {
    filter: Filter,
}

impl EqBand {
    pub fn new(kind: FilterKind, sample_rate: f32) -> Self {
        if !kind.uses_gain() {
            warn!("EQ band built with non-EQ filter kind {kind:?}");
        }
        Self { filter: Filter::new(kind, sample_rate) }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.filter.set_sample_rate(sample_rate);
    }

    pub fn reset(&mut self) {
        self.filter.reset();
    }

    /// `bandwidth` is in octaves; converted to the equivalent Q.
    pub fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        frequency: f32,
        bandwidth: f32,
        gain_db: f32,
    ) {
        let resonance = q_to_resonance_db(bandwidth_to_q(bandwidth));
        self.filter.process(left, right, frequency, resonance, gain_db);
    }
}

fn bandwidth_to_q(bandwidth_octaves: f32) -> f32 {
    let bw = bandwidth_octaves.clamp(0.05, 8.0);
    let half = (std::f32::consts::LN_2 / 2.0) * bw;
    1.0 / (2.0 * half.sinh())
}

fn q_to_resonance_db(q: f32) -> f32 {
    20.0 * (q / FRAC_1_SQRT_2).log10()
}

// ---------------------------------------------------------------------------
// Coefficient forms
// ---------------------------------------------------------------------------

fn one_pole_lp(w: f32) -> Coeffs {
    let g = 1.0 - (-w).exp();
    Coeffs { b0: g, b1: 0.0, b2: 0.0, a1: -(1.0 - g), a2: 0.0 }
}

fn one_pole_hp(w: f32) -> Coeffs {
    let p = (-w).exp();
    let k = (1.0 + p) * 0.5;
    Coeffs { b0: k, b1: -k, b2: 0.0, a1: -p, a2: 0.0 }
}

fn one_pole_bp(w: f32) -> Coeffs {
    // Product of the one-pole low- and high-pass at the same corner.
    let lp = one_pole_lp(w);
    let hp = one_pole_hp(w);
    Coeffs {
        b0: lp.b0 * hp.b0,
        b1: lp.b0 * hp.b1,
        b2: 0.0,
        a1: lp.a1 + hp.a1,
        a2: lp.a1 * hp.a1,
    }
}

fn lpf2(w: f32, q: f32) -> Coeffs {
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha;
    Coeffs {
        b0: (1.0 - cos) / 2.0 / a0,
        b1: (1.0 - cos) / a0,
        b2: (1.0 - cos) / 2.0 / a0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn hpf2(w: f32, q: f32) -> Coeffs {
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha;
    Coeffs {
        b0: (1.0 + cos) / 2.0 / a0,
        b1: -(1.0 + cos) / a0,
        b2: (1.0 + cos) / 2.0 / a0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn bpf2(w: f32, q: f32) -> Coeffs {
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha;
    Coeffs {
        b0: alpha / a0,
        b1: 0.0,
        b2: -alpha / a0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn brf2(w: f32, q: f32) -> Coeffs {
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha;
    Coeffs {
        b0: 1.0 / a0,
        b1: -2.0 * cos / a0,
        b2: 1.0 / a0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn apf2(w: f32, q: f32) -> Coeffs {
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha;
    Coeffs {
        b0: (1.0 - alpha) / a0,
        b1: -2.0 * cos / a0,
        b2: 1.0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha) / a0,
    }
}

fn peak(w: f32, q: f32, gain_db: f32) -> Coeffs {
    let a = 10f32.powf(gain_db / 40.0);
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let a0 = 1.0 + alpha / a;
    Coeffs {
        b0: (1.0 + alpha * a) / a0,
        b1: -2.0 * cos / a0,
        b2: (1.0 - alpha * a) / a0,
        a1: -2.0 * cos / a0,
        a2: (1.0 - alpha / a) / a0,
    }
}

fn shelf(w: f32, q: f32, gain_db: f32, high: bool) -> Coeffs {
    let a = 10f32.powf(gain_db / 40.0);
    let (sin, cos) = w.sin_cos();
    let alpha = sin / (2.0 * q);
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
    let (ap, am) = (a + 1.0, a - 1.0);
    let sign = if high { -1.0 } else { 1.0 };

    let a0 = ap + sign * am * cos + two_sqrt_a_alpha;
    Coeffs {
        b0: a * (ap - sign * am * cos + two_sqrt_a_alpha) / a0,
        b1: sign * 2.0 * a * (am - sign * ap * cos) / a0,
        b2: a * (ap - sign * am * cos - two_sqrt_a_alpha) / a0,
        a1: -sign * 2.0 * (am + sign * ap * cos) / a0,
        a2: (ap + sign * am * cos - two_sqrt_a_alpha) / a0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32).sqrt()
    }

    fn run_filter(kind: FilterKind, cutoff: f32, input_freq: f32, gain_db: f32) -> f32 {
        let rate = 48_000.0;
        let mut filter = Filter::new(kind, rate);
        let mut left = sine(16_384, input_freq, rate);
        let mut right = left.clone();
        filter.process(&mut left, &mut right, cutoff, 0.0, gain_db);
        // Skip the transient.
        rms(&left[4096..]) / (std::f32::consts::FRAC_1_SQRT_2)
    }

    #[test]
    fn lowpass_passes_low_and_cuts_high() {
        let passed = run_filter(FilterKind::Lpf2p, 2000.0, 100.0, 0.0);
        assert!((passed - 1.0).abs() < 0.05, "passband level {passed}");

        let cut = run_filter(FilterKind::Lpf2p, 500.0, 8000.0, 0.0);
        assert!(cut < 0.05, "stopband level {cut}");

        // Higher-order modes cut harder.
        let cut4 = run_filter(FilterKind::Lpf4p, 500.0, 8000.0, 0.0);
        assert!(cut4 < cut, "4-pole ({cut4}) should cut more than 2-pole ({cut})");
    }

    #[test]
    fn highpass_mirrors_lowpass() {
        let passed = run_filter(FilterKind::Hpf2p, 200.0, 4000.0, 0.0);
        assert!((passed - 1.0).abs() < 0.05, "passband level {passed}");

        let cut = run_filter(FilterKind::Hpf2p, 4000.0, 100.0, 0.0);
        assert!(cut < 0.05, "stopband level {cut}");
    }

    #[test]
    fn notch_rejects_center() {
        let rejected = run_filter(FilterKind::Brf2p, 1000.0, 1000.0, 0.0);
        assert!(rejected < 0.1, "notch center level {rejected}");

        let passed = run_filter(FilterKind::Brf2p, 1000.0, 100.0, 0.0);
        assert!((passed - 1.0).abs() < 0.05);
    }

    #[test]
    fn allpass_preserves_level() {
        let level = run_filter(FilterKind::Apf2p, 1000.0, 440.0, 0.0);
        assert!((level - 1.0).abs() < 0.02, "allpass level {level}");
    }

    #[test]
    fn peak_boosts_center() {
        let boosted = run_filter(FilterKind::Peak, 1000.0, 1000.0, 12.0);
        let expected = 10f32.powf(12.0 / 20.0);
        assert!(
            (boosted / expected - 1.0).abs() < 0.05,
            "peak level {boosted}, expected {expected}"
        );

        // Far away from the peak the response is flat.
        let far = run_filter(FilterKind::Peak, 8000.0, 100.0, 12.0);
        assert!((far - 1.0).abs() < 0.05);
    }

    #[test]
    fn shelves_shape_band_edges() {
        let low_boost = run_filter(FilterKind::LowShelf, 2000.0, 100.0, 6.0);
        let expected = 10f32.powf(6.0 / 20.0);
        assert!((low_boost / expected - 1.0).abs() < 0.06, "low shelf {low_boost}");

        let high_flat = run_filter(FilterKind::LowShelf, 200.0, 8000.0, 6.0);
        assert!((high_flat - 1.0).abs() < 0.06);

        let high_boost = run_filter(FilterKind::HighShelf, 500.0, 8000.0, 6.0);
        assert!((high_boost / expected - 1.0).abs() < 0.06, "high shelf {high_boost}");
    }

    #[test]
    fn one_pole_modes_are_gentler() {
        let cut1 = run_filter(FilterKind::Lpf1p, 500.0, 8000.0, 0.0);
        let cut2 = run_filter(FilterKind::Lpf2p, 500.0, 8000.0, 0.0);
        assert!(cut1 > cut2, "1-pole ({cut1}) must roll off slower than 2-pole ({cut2})");

        let bp_center = run_filter(FilterKind::Bpf1p, 1000.0, 1000.0, 0.0);
        let bp_low = run_filter(FilterKind::Bpf1p, 1000.0, 30.0, 0.0);
        let bp_high = run_filter(FilterKind::Bpf1p, 1000.0, 16_000.0, 0.0);
        assert!(bp_center > bp_low && bp_center > bp_high);
    }

    #[test]
    fn modulated_sweep_stays_finite() {
        let rate = 48_000.0;
        let mut filter = Filter::new(FilterKind::Lpf2p, rate);
        let mut left = sine(512, 440.0, rate);
        let mut right = left.clone();
        let cutoff: Vec<f32> = (0..512).map(|i| 200.0 + 30.0 * i as f32).collect();
        let resonance = vec![3.0; 512];
        let gain = vec![0.0; 512];
        filter.process_modulated(&mut left, &mut right, &cutoff, &resonance, &gain);
        assert!(left.iter().all(|x| x.is_finite()));
        assert!(right.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn eq_band_bandwidth_narrows_with_q() {
        // A narrow band should leave signal an octave away almost untouched;
        // a wide one should not.
        let rate = 48_000.0;
        let mut narrow = EqBand::new(FilterKind::Peak, rate);
        let mut wide = EqBand::new(FilterKind::Peak, rate);

        let mut narrow_l = sine(16_384, 2000.0, rate);
        let mut narrow_r = narrow_l.clone();
        narrow.process(&mut narrow_l, &mut narrow_r, 1000.0, 0.3, 12.0);

        let mut wide_l = sine(16_384, 2000.0, rate);
        let mut wide_r = wide_l.clone();
        wide.process(&mut wide_l, &mut wide_r, 1000.0, 4.0, 12.0);

        let narrow_level = rms(&narrow_l[4096..]);
        let wide_level = rms(&wide_l[4096..]);
        assert!(narrow_level < wide_level, "narrow {narrow_level} vs wide {wide_level}");
    }
}
