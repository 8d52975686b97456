//! DSP primitives for the Forzando sampler engine.
//!
//! This crate holds the allocation-aware audio buffer types and the hot-path
//! numeric kernels the engine is built on:
//!
//! - [`Buffer`]: aligned owning storage with process-wide leak accounting
//! - [`AudioSpan`] / [`AudioSpanRef`]: non-owning multi-channel views
//! - [`simd`]: scalar + vector kernels with per-operation dispatch switches
//! - [`oversampler`]: polyphase half-band up/down conversion (2x..128x)
//! - [`filter`]: multi-mode stereo biquads with smoothed parameters
//! - [`panning`]: equal-power pan, mid/side width
//! - [`power`]: mean-square power follower for voice-stealing decisions
//!
//! Everything here is real-time safe once constructed: no allocation, no
//! locking, no I/O inside any `process` call.

mod buffer;
mod ftz;
mod mod_span;
mod span;

pub mod filter;
pub mod math;
pub mod oversampler;
pub mod panning;
pub mod power;
pub mod simd;

pub use buffer::{buffer_bytes, buffer_count, Buffer};
pub use ftz::ScopedFtz;
pub use mod_span::ModulationSpan;
pub use span::{AudioSpan, AudioSpanRef};

/// Lane width of the vector kernels, in `f32` elements.
pub const SIMD_WIDTH: usize = 4;

/// Alignment of [`Buffer`] allocations: one cache line, which is also a
/// multiple of the 16-byte vector width.
pub const BUFFER_ALIGN: usize = 64;
