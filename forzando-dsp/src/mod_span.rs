//! Lazy modulation block output.

/// The result of a modulation generator for one block.
///
/// Generators hand consumers a borrowed span plus an invariance hint: when
/// the values are constant over the whole block, consumers can fall back to
/// cheaper constant-gain paths instead of per-sample evaluation.
#[derive(Clone, Copy)]
pub struct ModulationSpan<'a> {
    data: &'a [f32],
    invariant: bool,
}

impl<'a> ModulationSpan<'a> {
    pub fn new(data: &'a [f32]) -> Self {
        Self { data, invariant: false }
    }

    /// A span whose values are all equal; consumers may read only the first.
    pub fn invariant(data: &'a [f32]) -> Self {
        Self { data, invariant: true }
    }

    #[inline]
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn is_invariant(&self) -> bool {
        self.invariant
    }

    /// First value of the span, or `default` when empty. The interesting
    /// case is invariant spans, where this is the whole story.
    #[inline]
    pub fn first_or(&self, default: f32) -> f32 {
        self.data.first().copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariance_flag_round_trips() {
        let values = [0.5f32; 16];
        let varying = ModulationSpan::new(&values);
        assert!(!varying.is_invariant());
        let constant = ModulationSpan::invariant(&values[..1]);
        assert!(constant.is_invariant());
        assert_eq!(constant.first_or(0.0), 0.5);
    }
}
