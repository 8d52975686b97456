//! Scoped flush-to-zero / denormals-are-zero control.

/// RAII guard that enables FTZ and DAZ for the current thread and restores
/// the previous state on drop. Installed at audio-callback entry so the
/// whole render path runs without denormal stalls.
///
/// On targets without the MXCSR register this is a no-op.
pub struct ScopedFtz {
    #[cfg(target_arch = "x86_64")]
    saved: u32,
    _not_send: std::marker::PhantomData<*const ()>,
}

#[cfg(target_arch = "x86_64")]
const MXCSR_FTZ: u32 = 1 << 15;
#[cfg(target_arch = "x86_64")]
const MXCSR_DAZ: u32 = 1 << 6;

impl ScopedFtz {
    pub fn enable() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let saved = unsafe { std::arch::x86_64::_mm_getcsr() };
            unsafe { std::arch::x86_64::_mm_setcsr(saved | MXCSR_FTZ | MXCSR_DAZ) };
            Self { saved, _not_send: std::marker::PhantomData }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self { _not_send: std::marker::PhantomData }
        }
    }
}

impl Drop for ScopedFtz {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_setcsr(self.saved)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn guard_restores_previous_state() {
        let before = unsafe { std::arch::x86_64::_mm_getcsr() };
        {
            let _guard = ScopedFtz::enable();
            let inside = unsafe { std::arch::x86_64::_mm_getcsr() };
            assert_ne!(inside & MXCSR_FTZ, 0);
            assert_ne!(inside & MXCSR_DAZ, 0);
        }
        let after = unsafe { std::arch::x86_64::_mm_getcsr() };
        assert_eq!(before, after);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn denormals_flush_inside_guard() {
        let _guard = ScopedFtz::enable();
        let tiny = f32::MIN_POSITIVE / 4.0;
        // With FTZ active, multiplying a subnormal flushes to zero.
        let result = std::hint::black_box(tiny) * std::hint::black_box(0.5f32);
        assert_eq!(result, 0.0);
    }
}
