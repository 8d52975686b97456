//! Engine-wide defaults and hard limits.

/// Default output sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: f32 = 48_000.0;

/// Default maximum frames per render block.
pub const DEFAULT_SAMPLES_PER_BLOCK: usize = 1024;

/// Upper bound accepted by `set_samples_per_block`.
pub const MAX_SAMPLES_PER_BLOCK: usize = 8192;

/// Default voice-pool size.
pub const DEFAULT_NUM_VOICES: usize = 64;

/// Upper bound accepted by `set_num_voices`.
pub const MAX_NUM_VOICES: usize = 256;

/// Default preloaded head length per sample file, in frames.
pub const DEFAULT_PRELOAD_SIZE: usize = 8192;

/// Accepted preload range, in frames.
pub const MIN_PRELOAD_SIZE: usize = 1024;
pub const MAX_PRELOAD_SIZE: usize = 65_536;

/// Preload-cache entry target before unreferenced entries are evicted.
pub const DEFAULT_CACHE_TARGET: usize = 256;

/// Per-voice streaming ring capacity, in frames. Sized to absorb loader
/// latency of several blocks at the largest block size.
pub const STREAM_RING_FRAMES: usize = 65_536;

/// Frames decoded per streaming chunk between staleness checks.
pub const STREAM_CHUNK_FRAMES: usize = 4096;

/// Loader ticket queue depth.
pub const LOADER_QUEUE_DEPTH: usize = 128;

/// Filter slots per region.
pub const MAX_FILTERS_PER_REGION: usize = 2;

/// EQ bands per region.
pub const MAX_EQS_PER_REGION: usize = 3;

/// Level treated as silence by envelopes (-100 dB).
pub const VIRTUALLY_ZERO: f32 = 1e-5;

/// Mean-square power below which a voice may be stolen (-80 dBFS).
pub const STEAL_POWER_THRESHOLD: f32 = 1e-8;

/// Length of the forced release ramp applied on steal/choke, in seconds.
pub const QUICK_RELEASE_SECONDS: f32 = 0.010;

/// Largest pitch ratio a voice will resample at.
pub const MAX_PITCH_RATIO: f64 = 8.0;

/// Default MIDI CC driving the sustain pedal.
pub const SUSTAIN_CC: u8 = 64;

/// Default tempo, seconds per quarter note (120 BPM).
pub const DEFAULT_TEMPO: f32 = 0.5;
