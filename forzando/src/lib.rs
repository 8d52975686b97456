//! Forzando - a real-time SFZ sampler engine.
//!
//! The engine renders polyphonic audio from an SFZ instrument description:
//! MIDI-like events arrive with sub-block sample-accurate timestamps, and
//! each render call mixes a bounded pool of sample-playback voices into a
//! stereo block. Samples play from a content-addressed preload cache with
//! tails streamed by a background loader, so the audio thread never touches
//! the filesystem and never allocates.
//!
//! # Quick start
//!
//! ```no_run
//! use forzando::Synth;
//!
//! let mut synth = Synth::new();
//! synth.set_sample_rate(48_000.0).unwrap();
//! synth.set_samples_per_block(1024).unwrap();
//! synth.load_sfz_file(std::path::Path::new("piano.sfz")).unwrap();
//!
//! let mut left = vec![0.0f32; 1024];
//! let mut right = vec![0.0f32; 1024];
//! synth.note_on(0, 1, 60, 100);
//! synth.render_block(&mut left, &mut right);
//! ```
//!
//! # Threads
//!
//! - the **audio thread** calls the event methods and `render_block`;
//! - the **control thread** calls `load_sfz_file` and the `set_*`
//!   reconfiguration methods, which serialize through a lock-free
//!   enter/disable handshake (a denied render returns silence);
//! - the **loader thread** owns all sample file I/O and feeds per-voice
//!   SPSC rings.

pub mod config;
pub mod curve;
pub mod envelope;
pub mod error;
pub mod file_pool;
pub mod guard;
pub mod lfo;
pub mod logger;
pub mod midi_state;
pub mod opcode;
pub mod parser;
pub mod range;
pub mod reader;
pub mod region;
pub mod synth;
pub mod tuning;
pub mod voice;

pub use error::{ConfigError, LoadError, ReaderError};
pub use synth::Synth;
