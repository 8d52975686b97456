//! Uniform audio-file reader over forward, reverse, and no-seek-reverse
//! decode orders.
//!
//! WAV decoding sits on `hound`; other containers plug in behind the same
//! enum. On open failure the caller receives a [`AudioReader::Dummy`] that
//! reads zero frames, with the error carried out-of-band via
//! [`AudioReader::error`] so the audio path never sees a `Result`.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::warn;

use crate::error::ReaderError;

/// Decode order of a reader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReaderKind {
    Forward,
    Reverse,
    NoSeekReverse,
    Dummy,
}

/// Container-level facts about an opened file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileMetadata {
    pub channels: u16,
    pub sample_rate: u32,
    pub frames: u64,
    /// Loop points embedded in the container (`smpl` chunk), when present.
    pub loop_points: Option<(u64, u64)>,
}

impl FileMetadata {
    fn empty() -> Self {
        Self { channels: 1, sample_rate: 44_100, frames: 0, loop_points: None }
    }
}

type WavHandle = hound::WavReader<BufReader<File>>;

/// Sample-accurate scaling for integer WAV data.
fn int_scale(bits: u16) -> f32 {
    1.0 / (1i64 << (bits.clamp(8, 32) - 1)) as f32
}

pub enum AudioReader {
    Forward {
        handle: WavHandle,
        meta: FileMetadata,
    },
    Reverse {
        handle: WavHandle,
        meta: FileMetadata,
        /// Frames not yet returned, counted from the file end.
        remaining: u64,
    },
    NoSeekReverse {
        handle: Option<WavHandle>,
        meta: FileMetadata,
        /// Whole file, decoded lazily on the first read.
        decoded: Vec<f32>,
        remaining: u64,
    },
    Dummy {
        meta: FileMetadata,
        error: Option<ReaderError>,
    },
}

impl AudioReader {
    /// Open for forward streaming. Returns a dummy reader carrying the
    /// error when the file cannot be opened.
    pub fn open(path: &Path) -> Self {
        match open_wav(path) {
            Ok((handle, meta)) => AudioReader::Forward { handle, meta },
            Err(error) => Self::dummy(error),
        }
    }

    /// Open for reverse playback using random access; appropriate for
    /// containers with fast seeking (PCM WAV).
    pub fn open_reverse(path: &Path) -> Self {
        match open_wav(path) {
            Ok((handle, meta)) => {
                AudioReader::Reverse { handle, meta, remaining: meta.frames }
            }
            Err(error) => Self::dummy(error),
        }
    }

    /// Open for reverse playback without seeking: the whole file is decoded
    /// on the first read and streamed from the tail backward. Used for
    /// containers whose seek is prohibitively slow.
    pub fn open_no_seek_reverse(path: &Path) -> Self {
        match open_wav(path) {
            Ok((handle, meta)) => AudioReader::NoSeekReverse {
                handle: Some(handle),
                meta,
                decoded: Vec::new(),
                remaining: meta.frames,
            },
            Err(error) => Self::dummy(error),
        }
    }

    fn dummy(error: ReaderError) -> Self {
        AudioReader::Dummy { meta: FileMetadata::empty(), error: Some(error) }
    }

    pub fn kind(&self) -> ReaderKind {
        match self {
            AudioReader::Forward { .. } => ReaderKind::Forward,
            AudioReader::Reverse { .. } => ReaderKind::Reverse,
            AudioReader::NoSeekReverse { .. } => ReaderKind::NoSeekReverse,
            AudioReader::Dummy { .. } => ReaderKind::Dummy,
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        match self {
            AudioReader::Forward { meta, .. }
            | AudioReader::Reverse { meta, .. }
            | AudioReader::NoSeekReverse { meta, .. }
            | AudioReader::Dummy { meta, .. } => meta,
        }
    }

    pub fn frames(&self) -> u64 {
        self.metadata().frames
    }

    pub fn channels(&self) -> u16 {
        self.metadata().channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.metadata().sample_rate
    }

    /// The open error, if this reader was substituted for a failed open.
    pub fn error(&self) -> Option<&ReaderError> {
        match self {
            AudioReader::Dummy { error, .. } => error.as_ref(),
            _ => None,
        }
    }

    /// Loop metadata embedded in the file, when the container carries it.
    pub fn instrument_metadata(&self) -> Option<(u64, u64)> {
        self.metadata().loop_points
    }

    /// Skip `frames` frames of input (forward readers only).
    pub fn seek_to(&mut self, frame: u64) -> bool {
        match self {
            AudioReader::Forward { handle, meta } => {
                let frame = frame.min(meta.frames);
                handle.seek(frame as u32).is_ok()
            }
            _ => false,
        }
    }

    /// Decode up to `frames` frames into `buffer` (interleaved f32).
    /// Returns the number of frames produced; 0 signals the end.
    pub fn read_next_block(&mut self, buffer: &mut [f32], frames: usize) -> usize {
        match self {
            AudioReader::Forward { handle, meta } => {
                let wanted = frames.min(buffer.len() / meta.channels.max(1) as usize);
                decode_frames(handle, &mut buffer[..wanted * meta.channels as usize])
            }
            AudioReader::Reverse { handle, meta, remaining } => {
                let channels = meta.channels.max(1) as usize;
                let wanted =
                    (frames as u64).min(*remaining).min((buffer.len() / channels) as u64) as usize;
                if wanted == 0 {
                    return 0;
                }
                let start = *remaining - wanted as u64;
                if handle.seek(start as u32).is_err() {
                    *remaining = 0;
                    return 0;
                }
                let read = decode_frames(handle, &mut buffer[..wanted * channels]);
                reverse_frames(&mut buffer[..read * channels], channels);
                *remaining = start;
                read
            }
            AudioReader::NoSeekReverse { handle, meta, decoded, remaining } => {
                let channels = meta.channels.max(1) as usize;
                if let Some(mut wav) = handle.take() {
                    // First call: decode everything.
                    decoded.resize(meta.frames as usize * channels, 0.0);
                    let read = decode_frames(&mut wav, decoded);
                    decoded.truncate(read * channels);
                    *remaining = read as u64;
                }
                let wanted =
                    (frames as u64).min(*remaining).min((buffer.len() / channels) as u64) as usize;
                if wanted == 0 {
                    return 0;
                }
                let start = (*remaining as usize - wanted) * channels;
                buffer[..wanted * channels].copy_from_slice(&decoded[start..start + wanted * channels]);
                reverse_frames(&mut buffer[..wanted * channels], channels);
                *remaining -= wanted as u64;
                wanted
            }
            AudioReader::Dummy { .. } => 0,
        }
    }
}

fn open_wav(path: &Path) -> Result<(WavHandle, FileMetadata), ReaderError> {
    if !path.exists() {
        return Err(ReaderError::NotFound(path.to_path_buf()));
    }
    let handle = hound::WavReader::open(path).map_err(|e| ReaderError::Undecodable {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let spec = handle.spec();
    let meta = FileMetadata {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        frames: handle.duration() as u64,
        loop_points: read_smpl_loop(path),
    };
    Ok((handle, meta))
}

/// Decode into `out` (interleaved), returning full frames read.
fn decode_frames(handle: &mut WavHandle, out: &mut [f32]) -> usize {
    let spec = handle.spec();
    let channels = spec.channels.max(1) as usize;
    let mut written = 0usize;
    match spec.sample_format {
        hound::SampleFormat::Float => {
            for sample in handle.samples::<f32>() {
                match sample {
                    Ok(value) => {
                        out[written] = value;
                        written += 1;
                    }
                    Err(e) => {
                        warn!("wav decode error: {e}");
                        break;
                    }
                }
                if written == out.len() {
                    break;
                }
            }
        }
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample);
            for sample in handle.samples::<i32>() {
                match sample {
                    Ok(value) => {
                        out[written] = value as f32 * scale;
                        written += 1;
                    }
                    Err(e) => {
                        warn!("wav decode error: {e}");
                        break;
                    }
                }
                if written == out.len() {
                    break;
                }
            }
        }
    }
    written / channels
}

/// Reverse whole frames in place.
fn reverse_frames(data: &mut [f32], channels: usize) {
    if channels == 0 {
        return;
    }
    let frames = data.len() / channels;
    for i in 0..frames / 2 {
        let j = frames - 1 - i;
        for c in 0..channels {
            data.swap(i * channels + c, j * channels + c);
        }
    }
}

/// Scan the RIFF chunk list for a `smpl` chunk and return its first loop's
/// (start, end) frames. `hound` does not surface this chunk, so the scan is
/// done directly on the container.
fn read_smpl_loop(path: &Path) -> Option<(u64, u64)> {
    let mut file = File::open(path).ok()?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header).ok()?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return None;
    }
    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).is_err() {
            return None;
        }
        let chunk_id = &chunk_header[0..4];
        let chunk_size = u32::from_le_bytes(chunk_header[4..8].try_into().ok()?) as u64;
        if chunk_id == b"smpl" {
            // Fixed header: 9 u32 fields, then loop records of 6 u32s.
            let mut body = vec![0u8; chunk_size as usize];
            file.read_exact(&mut body).ok()?;
            if body.len() < 36 + 24 {
                return None;
            }
            let num_loops = u32::from_le_bytes(body[28..32].try_into().ok()?);
            if num_loops == 0 {
                return None;
            }
            let start = u32::from_le_bytes(body[44..48].try_into().ok()?) as u64;
            let end = u32::from_le_bytes(body[48..52].try_into().ok()?) as u64;
            return Some((start, end));
        }
        // Chunks are word-aligned.
        let skip = chunk_size + (chunk_size & 1);
        file.seek(SeekFrom::Current(skip as i64)).ok()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_test_wav(dir: &Path, name: &str, frames: u32, channels: u16) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for frame in 0..frames {
            for channel in 0..channels {
                // Encode the frame index so order is testable.
                let value = (frame as i32 % 1000) * 10 + channel as i32;
                writer.write_sample(value as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn forward_reader_reports_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "meta.wav", 500, 2);
        let reader = AudioReader::open(&path);
        assert_eq!(reader.kind(), ReaderKind::Forward);
        assert_eq!(reader.frames(), 500);
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.sample_rate(), 44_100);
        assert!(reader.error().is_none());
    }

    #[test]
    fn forward_reads_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "seq.wav", 100, 1);
        let mut reader = AudioReader::open(&path);
        let mut buffer = vec![0.0f32; 60];
        assert_eq!(reader.read_next_block(&mut buffer, 60), 60);
        assert_eq!(reader.read_next_block(&mut buffer, 60), 40);
        assert_eq!(reader.read_next_block(&mut buffer, 60), 0);
    }

    #[test]
    fn reverse_matches_forward_reversed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "rev.wav", 64, 2);

        let mut forward = AudioReader::open(&path);
        let mut forward_data = vec![0.0f32; 64 * 2];
        assert_eq!(forward.read_next_block(&mut forward_data, 64), 64);

        let mut reverse = AudioReader::open_reverse(&path);
        let mut reverse_data = Vec::new();
        let mut chunk = vec![0.0f32; 20 * 2];
        loop {
            let read = reverse.read_next_block(&mut chunk, 20);
            if read == 0 {
                break;
            }
            reverse_data.extend_from_slice(&chunk[..read * 2]);
        }
        assert_eq!(reverse_data.len(), forward_data.len());
        // Frame k of the reverse stream is frame (n-1-k) of the forward one.
        for frame in 0..64 {
            let source = 63 - frame;
            assert_eq!(reverse_data[frame * 2], forward_data[source * 2]);
            assert_eq!(reverse_data[frame * 2 + 1], forward_data[source * 2 + 1]);
        }
    }

    #[test]
    fn no_seek_reverse_equals_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_wav(dir.path(), "nsr.wav", 48, 1);

        let mut a = AudioReader::open_reverse(&path);
        let mut b = AudioReader::open_no_seek_reverse(&path);
        let mut buf_a = vec![0.0f32; 48];
        let mut buf_b = vec![0.0f32; 48];
        assert_eq!(a.read_next_block(&mut buf_a, 48), 48);
        assert_eq!(b.read_next_block(&mut buf_b, 48), 48);
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn missing_file_yields_dummy_with_error() {
        let mut reader = AudioReader::open(Path::new("/nonexistent/sample.wav"));
        assert_eq!(reader.kind(), ReaderKind::Dummy);
        assert!(matches!(reader.error(), Some(ReaderError::NotFound(_))));
        let mut buffer = vec![0.0f32; 16];
        assert_eq!(reader.read_next_block(&mut buffer, 16), 0);
    }

    #[test]
    fn int_scaling_normalizes_to_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(i16::MAX).unwrap();
        writer.write_sample(i16::MIN).unwrap();
        writer.finalize().unwrap();

        let mut reader = AudioReader::open(&path);
        let mut buffer = vec![0.0f32; 2];
        assert_eq!(reader.read_next_block(&mut buffer, 2), 2);
        assert!((buffer[0] - (i16::MAX as f32 / 32_768.0)).abs() < 1e-6);
        assert_eq!(buffer[1], -1.0);
    }
}
