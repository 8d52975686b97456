//! Sample cache and background streamer.
//!
//! Two jobs live here:
//!
//! 1. **Preload cache** - the decoded head of every referenced sample file,
//!    keyed by `(path, offset)` and shared with voices through `Arc`.
//!    Eviction is LRU and only touches entries no voice references.
//! 2. **Streaming** - plays longer than the preloaded head pull the tail
//!    from disk on a background worker thread. The audio thread enqueues a
//!    ticket at note start; the worker decodes into a per-voice SPSC ring
//!    and publishes the consumer end. Stale tickets (the voice was freed or
//!    re-used) are discarded at the next chunk boundary.
//!
//! The worker thread owns all file I/O; the audio thread only ever touches
//! atomics, `try_lock`, and the ring consumer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use tracing::{debug, warn};

use forzando_dsp::math;
use forzando_dsp::oversampler::Upsampler;

use crate::config;
use crate::reader::AudioReader;
use crate::region::SampleRef;

/// Wavetable length for the built-in generators.
const GENERATOR_FRAMES: usize = 2048;

/// Generator headroom: -3 dBFS. The equal-power center pan takes another
/// 3 dB, landing generator regions at -6 dBFS on the output.
const GENERATOR_AMPLITUDE: f32 = 0.707_945_8;

/// Immutable decoded sample head shared between the pool and voices.
///
/// When the pool runs with an oversampling factor, every frame quantity in
/// here (including `sample_rate`, `total_frames` and loop points) is
/// expressed in oversampled frames; the recorded `oversampling` factor lets
/// voices scale region opcodes, which stay in file frames.
pub struct FileData {
    pub channels: u16,
    pub sample_rate: u32,
    /// Full length of the underlying file in frames.
    pub total_frames: u64,
    /// Loop points from the container, when any.
    pub loop_points: Option<(u64, u64)>,
    /// Interleaved frames covering `[0, preload_frames)`.
    pub frames: Vec<f32>,
    pub preload_frames: u64,
    /// True when `frames` covers the entire file and no streaming is ever
    /// needed.
    pub complete: bool,
    pub oversampling: u32,
}

impl FileData {
    /// Sample at `(frame, channel)` from the preloaded head; zero outside.
    #[inline]
    pub fn preloaded_sample(&self, frame: u64, channel: usize) -> f32 {
        if frame < self.preload_frames {
            self.frames[frame as usize * self.channels as usize + channel]
        } else {
            0.0
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct FileKey {
    path: String,
    offset: u64,
}

struct CacheEntry {
    data: Arc<FileData>,
    last_used: u64,
}

/// The consumer half of one streaming assignment, published by the worker.
pub struct StreamHandle {
    pub ticket_id: u64,
    pub channels: u16,
    pub consumer: HeapCons<f32>,
}

/// Per-voice-slot exchange point between worker and audio thread.
pub struct StreamSlot {
    /// Ticket the owning voice currently expects; 0 when none.
    pub active_ticket: AtomicU64,
    /// Handle published by the worker, taken by the voice with `try_lock`.
    ready: Mutex<Option<StreamHandle>>,
}

impl StreamSlot {
    fn new() -> Self {
        Self { active_ticket: AtomicU64::new(0), ready: Mutex::new(None) }
    }

    /// Take the published handle if it matches `ticket_id`. Non-blocking;
    /// contention or a missing handle reads as "not ready yet".
    pub fn take_ready(&self, ticket_id: u64) -> Option<StreamHandle> {
        let mut slot = self.ready.try_lock().ok()?;
        match &*slot {
            Some(handle) if handle.ticket_id == ticket_id => slot.take(),
            // A stale handle from an earlier ticket is dropped on the spot.
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }
}

/// A streaming job enqueued by the audio thread on note start. All frame
/// fields are in oversampled units, matching the preloaded head.
pub struct LoaderTicket {
    pub voice_slot: usize,
    pub ticket_id: u64,
    /// Shared so the audio thread never allocates to build a ticket.
    pub path: Arc<PathBuf>,
    /// First frame the worker decodes (end of the preloaded head).
    pub start_frame: u64,
    /// Exclusive stop frame for non-looping plays.
    pub true_end: u64,
    /// When set, the worker unrolls this loop into the ring until the
    /// ticket goes stale.
    pub loop_range: Option<(u64, u64)>,
    pub oversampling: u32,
    pub enqueued_at: Instant,
}

/// Sample cache plus background loader.
pub struct FilePool {
    root: PathBuf,
    preload_size: usize,
    oversampling: usize,
    cache_target: usize,
    cache: HashMap<FileKey, CacheEntry>,
    use_counter: u64,
    slots: Arc<Vec<StreamSlot>>,
    ticket_tx: Option<SyncSender<LoaderTicket>>,
    worker: Option<JoinHandle<()>>,
    /// Worst observed delay between ticket enqueue and handle publication,
    /// in microseconds; reset on every logging read.
    wait_us: Arc<AtomicU64>,
}

impl FilePool {
    pub fn new(num_voices: usize) -> Self {
        let mut pool = Self {
            root: PathBuf::new(),
            preload_size: config::DEFAULT_PRELOAD_SIZE,
            oversampling: 1,
            cache_target: config::DEFAULT_CACHE_TARGET,
            cache: HashMap::new(),
            use_counter: 0,
            slots: Arc::new(Vec::new()),
            ticket_tx: None,
            worker: None,
            wait_us: Arc::new(AtomicU64::new(0)),
        };
        pool.set_num_voices(num_voices);
        pool
    }

    /// Directory sample paths resolve against (the .sfz location).
    pub fn set_root(&mut self, root: &Path) {
        self.root = root.to_path_buf();
    }

    pub fn preload_size(&self) -> usize {
        self.preload_size
    }

    /// Change the preload length. Drops the cache; callers re-preload while
    /// holding the disable guard.
    pub fn set_preload_size(&mut self, frames: usize) {
        self.preload_size = frames.clamp(config::MIN_PRELOAD_SIZE, config::MAX_PRELOAD_SIZE);
        self.cache.clear();
    }

    pub fn oversampling(&self) -> usize {
        self.oversampling
    }

    /// Change the oversampling factor applied to decoded sample data.
    /// Drops the cache; callers re-preload while holding the disable guard.
    pub fn set_oversampling(&mut self, factor: usize) {
        self.oversampling = factor.max(1);
        self.cache.clear();
    }

    /// Rebuild the per-voice stream slots and restart the worker. Control
    /// thread only, behind the disable guard.
    pub fn set_num_voices(&mut self, num_voices: usize) {
        self.shutdown_worker();
        let slots: Vec<StreamSlot> = (0..num_voices).map(|_| StreamSlot::new()).collect();
        self.slots = Arc::new(slots);

        let (tx, rx) = mpsc::sync_channel::<LoaderTicket>(config::LOADER_QUEUE_DEPTH);
        let worker_slots = Arc::clone(&self.slots);
        let wait_us = Arc::clone(&self.wait_us);
        let handle = std::thread::Builder::new()
            .name("sample-loader".into())
            .spawn(move || loader_main(rx, worker_slots, wait_us))
            .expect("failed to spawn sample loader thread");
        self.ticket_tx = Some(tx);
        self.worker = Some(handle);
    }

    fn shutdown_worker(&mut self) {
        self.ticket_tx = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Number of cached preloaded samples.
    pub fn num_preloaded(&self) -> usize {
        self.cache.len()
    }

    /// Worst ticket-to-publication delay since the last call, microseconds.
    pub fn take_wait_us(&self) -> u64 {
        self.wait_us.swap(0, Ordering::Relaxed)
    }

    /// Clear everything (instrument unload).
    pub fn clear(&mut self) {
        self.cache.clear();
        for slot in self.slots.iter() {
            slot.active_ticket.store(0, Ordering::SeqCst);
            if let Ok(mut ready) = slot.ready.lock() {
                *ready = None;
            }
        }
    }

    /// Fetch or build the preloaded head for a sample reference. Returns
    /// `None` when the file is missing or undecodable; the caller drops the
    /// owning region with a warning.
    pub fn preload(
        &mut self,
        sample: &SampleRef,
        max_offset: u64,
        engine_sample_rate: f32,
    ) -> Option<Arc<FileData>> {
        let key = match sample {
            SampleRef::None => return None,
            SampleRef::SineGenerator => FileKey { path: "*sine".into(), offset: 0 },
            SampleRef::NoiseGenerator => FileKey { path: "*noise".into(), offset: 0 },
            SampleRef::File(name) => FileKey { path: name.clone(), offset: max_offset },
        };

        self.use_counter += 1;
        let use_counter = self.use_counter;
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.last_used = use_counter;
            return Some(Arc::clone(&entry.data));
        }

        let data = match sample {
            SampleRef::SineGenerator => Arc::new(build_sine_table()),
            SampleRef::NoiseGenerator => Arc::new(build_noise_table(engine_sample_rate)),
            SampleRef::File(name) => {
                let path = self.resolve(name);
                Arc::new(self.decode_head(&path, max_offset)?)
            }
            SampleRef::None => unreachable!(),
        };

        self.cache.insert(key, CacheEntry { data: Arc::clone(&data), last_used: use_counter });
        self.evict_lru();
        Some(data)
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() { candidate.to_path_buf() } else { self.root.join(candidate) }
    }

    /// Absolute path for a region sample, for ticket construction.
    pub fn resolve_sample_path(&self, sample: &SampleRef) -> Option<PathBuf> {
        match sample {
            SampleRef::File(name) => Some(self.resolve(name)),
            _ => None,
        }
    }

    fn decode_head(&self, path: &Path, max_offset: u64) -> Option<FileData> {
        let mut reader = AudioReader::open(path);
        if let Some(error) = reader.error() {
            warn!("dropping region sample: {error}");
            return None;
        }
        let channels = reader.channels().max(1);
        if channels > 2 {
            warn!("dropping region sample {path:?}: {channels} channels (mono/stereo only)");
            return None;
        }
        let total_frames = reader.frames();
        let head_frames =
            (max_offset + self.preload_size as u64).min(total_frames) as usize;
        let mut frames = vec![0.0f32; head_frames * channels as usize];
        let read = reader.read_next_block(&mut frames, head_frames);
        frames.truncate(read * channels as usize);

        let factor = self.oversampling.max(1);
        if factor > 1 {
            frames = upsample_interleaved(factor, channels as usize, &frames, None);
        }
        let scale = factor as u64;

        Some(FileData {
            channels,
            sample_rate: reader.sample_rate() * factor as u32,
            total_frames: total_frames * scale,
            loop_points: reader.instrument_metadata().map(|(s, e)| (s * scale, e * scale)),
            preload_frames: read as u64 * scale,
            complete: read as u64 >= total_frames,
            frames,
            oversampling: factor as u32,
        })
    }

    fn evict_lru(&mut self) {
        while self.cache.len() > self.cache_target {
            // Only entries nobody references are candidates.
            let victim = self
                .cache
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.data) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    debug!("evicting preloaded sample {:?}", key.path);
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Per-voice exchange slot.
    pub fn slot(&self, index: usize) -> Option<&StreamSlot> {
        self.slots.get(index)
    }

    /// Enqueue a streaming ticket from the audio thread. Never blocks; a
    /// full queue drops the ticket (the voice plays its preloaded head and
    /// then silences).
    pub fn enqueue_stream(&self, ticket: LoaderTicket) -> bool {
        let Some(tx) = &self.ticket_tx else { return false };
        match tx.try_send(ticket) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("loader queue full, dropping streaming ticket");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("sample loader thread is gone");
                false
            }
        }
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

// ============================================================================
// Worker thread
// ============================================================================

fn loader_main(
    rx: mpsc::Receiver<LoaderTicket>,
    slots: Arc<Vec<StreamSlot>>,
    wait_us: Arc<AtomicU64>,
) {
    debug!("sample loader thread started");
    while let Ok(ticket) = rx.recv() {
        let Some(slot) = slots.get(ticket.voice_slot) else { continue };
        if slot.active_ticket.load(Ordering::SeqCst) != ticket.ticket_id {
            // Voice released or was re-used before we got here.
            continue;
        }
        serve_ticket(&ticket, slot, &wait_us);
    }
    debug!("sample loader thread exiting");
}

fn serve_ticket(ticket: &LoaderTicket, slot: &StreamSlot, wait_us: &AtomicU64) {
    let factor = ticket.oversampling.max(1) as u64;
    let mut reader = AudioReader::open(&ticket.path);
    if let Some(error) = reader.error() {
        warn!("streaming open failed: {error}");
        return;
    }
    let channels = reader.channels().max(1) as usize;
    if !reader.seek_to(ticket.start_frame / factor) {
        warn!("streaming seek to frame {} failed for {:?}", ticket.start_frame, ticket.path);
        return;
    }

    let ring = HeapRb::<f32>::new(config::STREAM_RING_FRAMES * channels);
    let (mut producer, consumer) = ring.split();
    {
        let Ok(mut ready) = slot.ready.lock() else { return };
        *ready = Some(StreamHandle {
            ticket_id: ticket.ticket_id,
            channels: channels as u16,
            consumer,
        });
    }
    let waited = ticket.enqueued_at.elapsed().as_micros().min(u64::MAX as u128) as u64;
    wait_us.fetch_max(waited, Ordering::Relaxed);

    let mut chunk = vec![0.0f32; config::STREAM_CHUNK_FRAMES * channels];
    // Filter state persists across chunks so the upsampled stream is
    // continuous.
    let mut upsamplers = if factor > 1 { Some([Upsampler::new(), Upsampler::new()]) } else { None };
    // Position in oversampled units, matching the ticket's frame fields.
    let mut position = ticket.start_frame;

    loop {
        // Staleness checkpoint between chunks.
        if slot.active_ticket.load(Ordering::SeqCst) != ticket.ticket_id {
            debug!("ticket {} went stale, dropping job", ticket.ticket_id);
            return;
        }

        let boundary = match ticket.loop_range {
            Some((_, loop_end)) => loop_end.min(ticket.true_end).max(position),
            None => ticket.true_end,
        };
        let want =
            ((boundary.saturating_sub(position) / factor) as usize).min(config::STREAM_CHUNK_FRAMES);
        if want == 0 {
            match ticket.loop_range {
                Some((loop_start, _)) => {
                    // Unroll the loop: jump back and keep decoding.
                    let mut rewound = AudioReader::open(&ticket.path);
                    if !rewound.seek_to(loop_start / factor) {
                        return;
                    }
                    reader = rewound;
                    position = loop_start;
                    continue;
                }
                None => return,
            }
        }

        let read = reader.read_next_block(&mut chunk[..want * channels], want);
        if read == 0 {
            // Truncated file: the voice underruns and silences itself.
            warn!("sample {:?} ended {} frames early", ticket.path, ticket.true_end - position);
            return;
        }
        position += read as u64 * factor;

        let upsampled;
        let mut pending: &[f32] = if let Some(ups) = upsamplers.as_mut() {
            upsampled =
                upsample_interleaved(factor as usize, channels, &chunk[..read * channels], Some(ups));
            &upsampled
        } else {
            &chunk[..read * channels]
        };
        while !pending.is_empty() {
            let pushed = producer.push_slice(pending);
            pending = &pending[pushed..];
            if !pending.is_empty() {
                if slot.active_ticket.load(Ordering::SeqCst) != ticket.ticket_id {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Upsample interleaved data by `factor`, channel by channel. When `state`
/// is provided its filter memories carry across calls (streaming); `None`
/// starts from silence (preload).
fn upsample_interleaved(
    factor: usize,
    channels: usize,
    input: &[f32],
    state: Option<&mut [Upsampler; 2]>,
) -> Vec<f32> {
    let frames = input.len() / channels.max(1);
    let mut output = vec![0.0f32; frames * factor * channels];
    if frames == 0 {
        return output;
    }
    let mut fresh = [Upsampler::new(), Upsampler::new()];
    let upsamplers = match state {
        Some(existing) => existing,
        None => &mut fresh,
    };
    let mut channel_in = vec![0.0f32; frames];
    let mut channel_out = vec![0.0f32; frames * factor];
    let mut scratch = vec![0.0f32; frames * factor];
    for channel in 0..channels.min(2) {
        for (i, value) in channel_in.iter_mut().enumerate() {
            *value = input[i * channels + channel];
        }
        upsamplers[channel].process(factor, &channel_in, &mut channel_out, &mut scratch);
        for (i, &value) in channel_out.iter().enumerate() {
            output[i * channels + channel] = value;
        }
    }
    output
}

// ============================================================================
// Built-in generators
// ============================================================================

/// One sine cycle with a virtual sample rate chosen so the generic pitch
/// path reproduces the note frequency exactly: played at the keycenter the
/// table spins at `frequency(keycenter)`.
fn build_sine_table() -> FileData {
    let mut frames = vec![0.0f32; GENERATOR_FRAMES];
    for (i, frame) in frames.iter_mut().enumerate() {
        let phase = i as f32 / GENERATOR_FRAMES as f32;
        *frame = (2.0 * std::f32::consts::PI * phase).sin() * GENERATOR_AMPLITUDE;
    }
    let virtual_rate = GENERATOR_FRAMES as f32 * math::midi_note_frequency(60.0);
    FileData {
        channels: 1,
        sample_rate: virtual_rate.round() as u32,
        total_frames: GENERATOR_FRAMES as u64,
        loop_points: Some((0, GENERATOR_FRAMES as u64)),
        preload_frames: GENERATOR_FRAMES as u64,
        complete: true,
        frames,
        oversampling: 1,
    }
}

/// One second of uniform white noise at the engine rate.
fn build_noise_table(engine_sample_rate: f32) -> FileData {
    use rand::{Rng, SeedableRng};
    let rate = engine_sample_rate.max(8000.0) as usize;
    let mut rng = rand_pcg::Pcg32::seed_from_u64(0x6e6f_6973);
    let mut frames = vec![0.0f32; rate];
    for frame in frames.iter_mut() {
        *frame = rng.random_range(-1.0f32..1.0) * GENERATOR_AMPLITUDE;
    }
    FileData {
        channels: 1,
        sample_rate: engine_sample_rate as u32,
        total_frames: rate as u64,
        loop_points: Some((0, rate as u64)),
        preload_frames: rate as u64,
        complete: true,
        frames,
        oversampling: 1,
    }
}
