//! Error taxonomy for the control surface.
//!
//! The audio thread never returns errors; it degrades to silence, drops the
//! note, or stops the voice. Everything here is reported synchronously from
//! control-thread calls.

use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration change. No state is modified when one of these is
/// returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid sample rate {0} (must be positive and finite)")]
    InvalidSampleRate(f32),
    #[error("invalid block size {0} (must be in 1..={max})", max = crate::config::MAX_SAMPLES_PER_BLOCK)]
    InvalidBlockSize(usize),
    #[error("invalid voice count {0} (must be in 1..={max})", max = crate::config::MAX_NUM_VOICES)]
    InvalidVoiceCount(usize),
    #[error("invalid oversampling factor {0} (must be a power of two in 1..=128)")]
    InvalidOversampling(usize),
    #[error("invalid preload size {0} (must be in {min}..={max})",
        min = crate::config::MIN_PRELOAD_SIZE, max = crate::config::MAX_PRELOAD_SIZE)]
    InvalidPreloadSize(usize),
}

/// Outcome of `load_sfz_file`.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("instrument file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("instrument defines no playable region")]
    EmptyInstrument,
}

/// Why a sample file could not be opened or decoded. Carried out-of-band by
/// the dummy reader and logged by the pool; never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReaderError {
    #[error("sample file not found: {0}")]
    NotFound(PathBuf),
    #[error("undecodable sample file {path}: {detail}")]
    Undecodable { path: PathBuf, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_value() {
        assert_eq!(
            ConfigError::InvalidVoiceCount(0).to_string(),
            "invalid voice count 0 (must be in 1..=256)"
        );
        assert_eq!(
            ConfigError::InvalidOversampling(3).to_string(),
            "invalid oversampling factor 3 (must be a power of two in 1..=128)"
        );
        let err = LoadError::EmptyInstrument;
        assert_eq!(err.to_string(), "instrument defines no playable region");
    }
}
