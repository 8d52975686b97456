//! The synth: instrument loading, event dispatch, voice pool, mix-down.
//!
//! Threading contract (see also `guard`):
//! - event methods and `render_block` run on the audio thread;
//! - `load_sfz_file` and the `set_*` reconfiguration calls run on the
//!   control thread and serialize against the audio thread through the
//!   enter/disable handshake;
//! - file I/O lives on the pool's loader thread.
//!
//! The audio path never allocates: regions, files and tickets are shared
//! through `Arc`s prepared at load time, and every per-block buffer is
//! sized up front.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashSet;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use forzando_dsp::oversampler;
use forzando_dsp::{buffer_bytes, buffer_count, math, simd, AudioSpan, ScopedFtz};

use crate::config;
use crate::curve::{Curve, CurveSet};
use crate::error::{ConfigError, LoadError};
use crate::file_pool::{FileData, FilePool, LoaderTicket};
use crate::guard::GuardPoint;
use crate::logger::{CsvLogger, LogRow};
use crate::midi_state::MidiState;
use crate::opcode::Opcode;
use crate::parser::{self, Header, ParserListener};
use crate::region::{LoopMode, Region, SampleRef};
use crate::tuning::{StretchTuning, Tuning};
use crate::voice::{RenderContext, TriggerParams, Voice};

/// A region reference inside the activation tables.
type RegionIndex = u16;

/// The sampler engine.
pub struct Synth {
    sample_rate: f32,
    samples_per_block: usize,
    oversampling: usize,
    master_gain: f32,

    guard: Arc<GuardPoint>,
    midi: MidiState,
    curves: CurveSet,
    tuning: Tuning,
    stretch: Option<StretchTuning>,
    pool: FilePool,

    regions: Vec<Arc<Region>>,
    region_files: Vec<Arc<FileData>>,
    region_paths: Vec<Option<Arc<std::path::PathBuf>>>,
    note_activation: Vec<SmallVec<[RegionIndex; 8]>>,
    cc_activation: Vec<SmallVec<[RegionIndex; 4]>>,
    seq_counters: Vec<u16>,

    voices: Vec<Voice>,
    current_keyswitch: Option<u8>,
    clock: u64,
    next_ticket: u64,
    rng: Pcg32,

    unknown_opcodes: HashSet<String>,
    last_error: Option<String>,
    logger: Option<CsvLogger>,
}

impl Synth {
    pub fn new() -> Self {
        let mut synth = Self {
            sample_rate: config::DEFAULT_SAMPLE_RATE,
            samples_per_block: config::DEFAULT_SAMPLES_PER_BLOCK,
            oversampling: 1,
            master_gain: 1.0,
            guard: Arc::new(GuardPoint::new()),
            midi: MidiState::new(),
            curves: CurveSet::with_predefined(),
            tuning: Tuning::equal_temperament(),
            stretch: None,
            pool: FilePool::new(config::DEFAULT_NUM_VOICES),
            regions: Vec::new(),
            region_files: Vec::new(),
            region_paths: Vec::new(),
            note_activation: vec![SmallVec::new(); 128],
            cc_activation: vec![SmallVec::new(); 128],
            seq_counters: Vec::new(),
            voices: Vec::new(),
            current_keyswitch: None,
            clock: 0,
            next_ticket: 1,
            rng: Pcg32::seed_from_u64(0x5f0a_7a11),
            unknown_opcodes: HashSet::new(),
            last_error: None,
            logger: None,
        };
        synth.rebuild_voices(config::DEFAULT_NUM_VOICES);
        synth
    }

    /// The handshake point, shared with hosts that drive the callback.
    pub fn guard(&self) -> Arc<GuardPoint> {
        Arc::clone(&self.guard)
    }

    // ========================================================================
    // Control surface (control thread)
    // ========================================================================

    /// Load an instrument file. Serializes against the audio thread and
    /// replaces all engine state.
    pub fn load_sfz_file(&mut self, path: &Path) -> Result<(), LoadError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            let error = if e.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(path.to_path_buf())
            } else {
                LoadError::Io { path: path.to_path_buf(), source: e }
            };
            self.last_error = Some(error.to_string());
            error
        })?;
        let root = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        self.load_sfz_string(&text, &root)
    }

    /// Load instrument text directly; `root` anchors relative sample paths.
    pub fn load_sfz_string(&mut self, text: &str, root: &Path) -> Result<(), LoadError> {
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();

        for voice in &mut self.voices {
            voice.reset_hard();
        }
        self.release_all_tickets();
        self.midi.reset();
        self.pool.clear();
        self.pool.set_root(root);
        self.regions.clear();
        self.region_files.clear();
        self.region_paths.clear();
        self.curves = CurveSet::with_predefined();
        self.unknown_opcodes.clear();
        self.current_keyswitch = None;
        self.rng = Pcg32::seed_from_u64(0x5f0a_7a11);

        let mut listener = LoadListener::new();
        parser::parse_document(text, &mut listener);
        listener.finish();

        if let Some(default_path) = listener.default_path {
            self.pool.set_root(&root.join(default_path));
        }
        for (index, curve) in listener.curves {
            match index {
                Some(index) => self.curves.set(index as usize, curve),
                None => {
                    self.curves.add(curve);
                }
            }
        }
        self.unknown_opcodes.extend(listener.unknown.drain());

        for mut region in listener.regions {
            region.finalize();
            let max_offset = region.offset + region.offset_random;
            let Some(file) =
                self.pool.preload(&region.sample, max_offset, self.sample_rate)
            else {
                if region.sample != SampleRef::None {
                    warn!("dropping region with unloadable sample {:?}", region.sample);
                }
                continue;
            };
            let path = self.pool.resolve_sample_path(&region.sample).map(Arc::new);
            self.regions.push(Arc::new(region));
            self.region_files.push(file);
            self.region_paths.push(path);
        }

        self.rebuild_activation_tables();
        self.seq_counters = vec![0; self.regions.len()];

        if self.regions.is_empty() {
            let error = LoadError::EmptyInstrument;
            self.last_error = Some(error.to_string());
            return Err(error);
        }
        info!("loaded {} regions", self.regions.len());
        self.last_error = None;
        Ok(())
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) -> Result<(), ConfigError> {
        if !(8000.0..=384_000.0).contains(&sample_rate) {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();
        self.sample_rate = sample_rate;
        let (block, factor) = (self.samples_per_block, self.oversampling);
        for voice in &mut self.voices {
            voice.reset_hard();
            voice.configure(sample_rate, block, factor);
        }
        self.release_all_tickets();
        self.repreload_regions();
        Ok(())
    }

    pub fn set_samples_per_block(&mut self, samples: usize) -> Result<(), ConfigError> {
        if samples == 0 || samples > config::MAX_SAMPLES_PER_BLOCK {
            return Err(ConfigError::InvalidBlockSize(samples));
        }
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();
        self.samples_per_block = samples;
        let (rate, factor) = (self.sample_rate, self.oversampling);
        for voice in &mut self.voices {
            voice.reset_hard();
            voice.configure(rate, samples, factor);
        }
        self.release_all_tickets();
        Ok(())
    }

    pub fn set_num_voices(&mut self, num_voices: usize) -> Result<(), ConfigError> {
        if num_voices == 0 || num_voices > config::MAX_NUM_VOICES {
            return Err(ConfigError::InvalidVoiceCount(num_voices));
        }
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();
        self.rebuild_voices(num_voices);
        // Stale every ticket before the worker restarts, or a producer
        // stuck on a full ring would block the restart.
        self.release_all_tickets();
        self.pool.set_num_voices(num_voices);
        Ok(())
    }

    /// Oversampling factors follow the playback engine's support: the data
    /// path pre-upsamples sample heads and streams.
    pub fn set_oversampling(&mut self, factor: usize) -> Result<(), ConfigError> {
        if !matches!(factor, 1 | 2 | 4 | 8) || !oversampler::Upsampler::can_process(factor) {
            return Err(ConfigError::InvalidOversampling(factor));
        }
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();
        self.oversampling = factor;
        for voice in &mut self.voices {
            voice.reset_hard();
            voice.configure(self.sample_rate, self.samples_per_block, factor);
        }
        self.release_all_tickets();
        self.pool.set_oversampling(factor);
        self.repreload_regions();
        Ok(())
    }

    pub fn set_preload_size(&mut self, frames: usize) -> Result<(), ConfigError> {
        if !(config::MIN_PRELOAD_SIZE..=config::MAX_PRELOAD_SIZE).contains(&frames) {
            return Err(ConfigError::InvalidPreloadSize(frames));
        }
        let guard_point = self.guard.clone();
        let _disabler = guard_point.disable();
        for voice in &mut self.voices {
            voice.reset_hard();
        }
        self.release_all_tickets();
        self.pool.set_preload_size(frames);
        self.repreload_regions();
        Ok(())
    }

    /// Master output volume in dB.
    pub fn set_volume(&mut self, volume_db: f32) {
        self.master_gain = math::db_to_gain(volume_db.clamp(-80.0, 12.0));
    }

    /// Install a stretch tuning curve; ratio 0 disables it.
    pub fn set_stretch_tuning(&mut self, ratio: f32) {
        self.stretch =
            if ratio > 0.0 { Some(StretchTuning::railsback_from_ratio(ratio)) } else { None };
    }

    /// Replace the key-frequency table (scala-derived tables come from the
    /// host; the engine does not read tuning files).
    pub fn set_key_frequencies(&mut self, frequencies: [f32; 128]) {
        self.tuning.set_key_frequencies(frequencies);
    }

    /// Start the per-block CSV log with the given file prefix.
    pub fn enable_logging(&mut self, prefix: &str) -> std::io::Result<()> {
        self.logger = Some(CsvLogger::create(prefix)?);
        Ok(())
    }

    pub fn disable_logging(&mut self) {
        self.logger = None;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn get_num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn get_region(&self, index: usize) -> Option<&Arc<Region>> {
        self.regions.get(index)
    }

    pub fn get_num_active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    pub fn get_num_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn get_num_preloaded_samples(&self) -> usize {
        self.pool.num_preloaded()
    }

    pub fn get_num_buffers(&self) -> usize {
        buffer_count()
    }

    pub fn get_num_bytes(&self) -> usize {
        buffer_bytes()
    }

    pub fn get_unknown_opcodes(&self) -> &HashSet<String> {
        &self.unknown_opcodes
    }

    pub fn get_last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn samples_per_block(&self) -> usize {
        self.samples_per_block
    }

    /// Voice accessor for tests and diagnostics.
    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    /// Pool accessor for tests and diagnostics.
    pub fn file_pool(&self) -> &FilePool {
        &self.pool
    }

    // ========================================================================
    // Events (audio thread; `delay` is the frame offset within the next
    // rendered block, monotonic per block)
    // ========================================================================

    pub fn note_on(&mut self, delay: usize, channel: u8, key: u8, velocity: u8) {
        // A zero-velocity note-on is a note-off in disguise.
        if velocity == 0 {
            self.note_off(delay, channel, key, 0);
            return;
        }
        let time = self.clock + delay as u64;
        let key = key.min(127);
        let velocity = velocity.min(127);
        self.midi.note_on(time, key, velocity);

        // Keyswitch zones update the selector and do not sound.
        let mut is_keyswitch = false;
        for region in &self.regions {
            if region.key_is_keyswitch(key) {
                self.current_keyswitch = Some(key);
                is_keyswitch = true;
            }
        }
        if is_keyswitch {
            return;
        }

        let draw = self.rng.random_range(0.0f32..1.0);
        for slot in 0..self.note_activation[key as usize].len() {
            let region_index = self.note_activation[key as usize][slot];
            let region = &self.regions[region_index as usize];
            if !region.matches_note_on(
                channel,
                key,
                velocity,
                draw,
                &self.midi,
                self.current_keyswitch,
            ) {
                continue;
            }
            if !self.sequence_allows(region_index) {
                continue;
            }
            self.start_region_voice(region_index, channel, key, velocity, delay, time);
        }
    }

    pub fn note_off(&mut self, delay: usize, channel: u8, key: u8, _velocity: u8) {
        let time = self.clock + delay as u64;
        let key = key.min(127);
        self.midi.note_off(time, key);

        let sustain_down = self.midi.cc_value(config::SUSTAIN_CC) >= 64;
        for voice in &mut self.voices {
            if voice.matches_note(channel, key) {
                voice.release(delay, sustain_down);
            }
        }

        // Release-triggered regions play with the remembered on-velocity.
        let on_velocity = self.midi.note_velocity(key);
        let draw = self.rng.random_range(0.0f32..1.0);
        for slot in 0..self.note_activation[key as usize].len() {
            let region_index = self.note_activation[key as usize][slot];
            let region = &self.regions[region_index as usize];
            if !region.matches_note_off(
                channel,
                key,
                on_velocity,
                draw,
                &self.midi,
                self.current_keyswitch,
            ) {
                continue;
            }
            if !self.sequence_allows(region_index) {
                continue;
            }
            self.start_region_voice(region_index, channel, key, on_velocity, delay, time);
        }
    }

    pub fn cc(&mut self, delay: usize, channel: u8, number: u8, value: u8) {
        let time = self.clock + delay as u64;
        let number = number.min(127);
        let value = value.min(127);
        let previous = self.midi.cc_value(number);
        self.midi.cc(time, number, value);

        // Sustain pedal up fires any deferred releases.
        if number == config::SUSTAIN_CC && value < 64 {
            for voice in &mut self.voices {
                voice.sustain_lifted(delay);
            }
        }

        for slot in 0..self.cc_activation[number as usize].len() {
            let region_index = self.cc_activation[number as usize][slot];
            let region = &self.regions[region_index as usize];
            if !region.matches_cc(number, value, previous) {
                continue;
            }
            let key = region.key_range.lo();
            if !self.sequence_allows(region_index) {
                continue;
            }
            // CC triggers reuse the controller value as velocity.
            self.start_region_voice(region_index, channel, key, value, delay, time);
        }
    }

    pub fn pitch_wheel(&mut self, delay: usize, value: i16) {
        self.midi.pitch_bend(self.clock + delay as u64, value);
    }

    pub fn channel_aftertouch(&mut self, delay: usize, value: u8) {
        self.midi.channel_aftertouch(self.clock + delay as u64, value);
    }

    pub fn poly_aftertouch(&mut self, delay: usize, key: u8, value: u8) {
        self.midi.poly_aftertouch(self.clock + delay as u64, key, value);
    }

    pub fn tempo(&mut self, delay: usize, seconds_per_quarter: f32) {
        self.midi.tempo(self.clock + delay as u64, seconds_per_quarter);
    }

    /// Release every sounding voice (MIDI all-notes-off).
    pub fn all_notes_off(&mut self, delay: usize) {
        for voice in &mut self.voices {
            if voice.is_active() {
                voice.release(delay, false);
            }
        }
    }

    // ========================================================================
    // Rendering (audio thread)
    // ========================================================================

    /// Render one block into the stereo output slices. On re-entry denial
    /// (a reconfiguration is running) the output is silence.
    pub fn render_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len()).min(self.samples_per_block);
        simd::fill(left, 0.0);
        simd::fill(right, 0.0);
        if frames == 0 {
            return;
        }

        let Some(_enter) = self.guard.try_enter() else {
            return;
        };
        let _ftz = ScopedFtz::enable();
        let started = Instant::now();

        let mut output = AudioSpan::new([&mut left[..frames], &mut right[..frames]]);
        let ctx = RenderContext {
            midi: &self.midi,
            curves: &self.curves,
            tuning: &self.tuning,
            stretch: self.stretch.as_ref(),
            pool: &self.pool,
        };
        {
            let (mix_l, mix_r) = output.stereo_mut();
            for voice in &mut self.voices {
                voice.poll_stream(&ctx);
                voice.render_block(&ctx, mix_l, mix_r);
            }
        }
        drop(ctx);

        if (self.master_gain - 1.0).abs() > f32::EPSILON {
            output.apply_gain(self.master_gain);
        }

        // Free the loader assignments of voices that went idle this block.
        for index in 0..self.voices.len() {
            if self.voices[index].is_idle() {
                if let Some(slot) = self.pool.slot(index) {
                    slot.active_ticket.store(0, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }

        self.midi.advance_block();
        self.clock += frames as u64;

        if let Some(logger) = &self.logger {
            logger.log(LogRow {
                time_samples: self.clock,
                num_active_voices: self.voices.iter().filter(|v| v.is_active()).count(),
                callback_duration_us: started.elapsed().as_micros().min(u64::MAX as u128) as u64,
                file_wait_time_us: self.pool.take_wait_us(),
            });
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn rebuild_voices(&mut self, num_voices: usize) {
        self.voices = (0..num_voices).map(|i| Voice::new(i, self.sample_rate)).collect();
        let (rate, block, factor) = (self.sample_rate, self.samples_per_block, self.oversampling);
        for voice in &mut self.voices {
            voice.configure(rate, block, factor);
        }
    }

    fn release_all_tickets(&self) {
        for index in 0..self.voices.len() {
            if let Some(slot) = self.pool.slot(index) {
                slot.active_ticket.store(0, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    /// Re-preload all region samples after a pool-level cache flush.
    fn repreload_regions(&mut self) {
        for (index, region) in self.regions.iter().enumerate() {
            let max_offset = region.offset + region.offset_random;
            if let Some(file) = self.pool.preload(&region.sample, max_offset, self.sample_rate) {
                self.region_files[index] = file;
            }
        }
    }

    fn rebuild_activation_tables(&mut self) {
        for bucket in self.note_activation.iter_mut() {
            bucket.clear();
        }
        for bucket in self.cc_activation.iter_mut() {
            bucket.clear();
        }
        for (index, region) in self.regions.iter().enumerate() {
            let index = index as RegionIndex;
            for key in region.key_range.lo()..=region.key_range.hi() {
                self.note_activation[key as usize].push(index);
            }
            for &(cc, _) in &region.cc_conditions {
                self.cc_activation[cc as usize].push(index);
            }
            if let Some((cc, _)) = region.on_cc {
                self.cc_activation[cc as usize].push(index);
            }
        }
    }

    /// Round-robin gate: increments the region's sequence counter and
    /// reports whether this trigger is the region's turn.
    fn sequence_allows(&mut self, region_index: RegionIndex) -> bool {
        let region = &self.regions[region_index as usize];
        if region.seq_length <= 1 {
            return true;
        }
        let counter = self.seq_counters[region_index as usize];
        self.seq_counters[region_index as usize] = counter.wrapping_add(1);
        (counter % region.seq_length) + 1 == region.seq_position
    }

    fn start_region_voice(
        &mut self,
        region_index: RegionIndex,
        channel: u8,
        key: u8,
        velocity: u8,
        delay: usize,
        time: u64,
    ) {
        let region = Arc::clone(&self.regions[region_index as usize]);
        let file = Arc::clone(&self.region_files[region_index as usize]);

        // Group chokes happen before the new voice starts.
        if region.group != 0 || region.off_by != 0 {
            for voice in &mut self.voices {
                let chokes = voice
                    .region()
                    .is_some_and(|r| r.group != 0 && r.group == region.off_by);
                if chokes {
                    voice.choke(delay);
                }
            }
        }

        let Some(slot) = self.find_free_voice(time) else {
            debug!("voice pool exhausted, dropping note {key}");
            return;
        };

        let random = self.rng.random_range(0.0f32..1.0);
        let extra_offset =
            if region.offset_random > 0 { self.rng.random_range(0..=region.offset_random) } else { 0 };
        let start_offset = region.offset + extra_offset;
        let delay_seconds = region.delay
            + if region.delay_random > 0.0 {
                self.rng.random_range(0.0..region.delay_random)
            } else {
                0.0
            };
        let delay_frames = delay as u64 + (delay_seconds * self.sample_rate) as u64;

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        // Streaming plan: anything past the preloaded head needs the loader.
        let factor = file.oversampling.max(1) as u64;
        let sample_end = region.end.map_or(file.total_frames, |e| (e * factor).min(file.total_frames));
        let loop_range = region
            .loop_range
            .map(|(s, e)| (s * factor, e * factor))
            .or(file.loop_points)
            .map(|(s, e)| (s.min(sample_end), e.min(sample_end)));
        let loop_mode = region.loop_mode.unwrap_or({
            if file.loop_points.is_some() { LoopMode::LoopContinuous } else { LoopMode::NoLoop }
        });
        let loops = matches!(loop_mode, LoopMode::LoopContinuous | LoopMode::LoopSustain);
        let stream_end = match (loops, loop_range) {
            (true, Some((_, end))) => end.max(sample_end.min(file.total_frames)),
            _ => sample_end,
        };
        let streaming = !file.complete && stream_end > file.preload_frames;

        if streaming {
            if let Some(slot_state) = self.pool.slot(slot) {
                slot_state.active_ticket.store(ticket, std::sync::atomic::Ordering::SeqCst);
            }
            if let Some(path) = &self.region_paths[region_index as usize] {
                let unroll = match (loops, loop_range) {
                    (true, Some((start, end))) if end > file.preload_frames => Some((start, end)),
                    _ => None,
                };
                self.pool.enqueue_stream(LoaderTicket {
                    voice_slot: slot,
                    ticket_id: ticket,
                    path: Arc::clone(path),
                    start_frame: file.preload_frames,
                    true_end: sample_end,
                    loop_range: unroll,
                    oversampling: file.oversampling,
                    enqueued_at: Instant::now(),
                });
            }
        }

        let ctx = RenderContext {
            midi: &self.midi,
            curves: &self.curves,
            tuning: &self.tuning,
            stretch: self.stretch.as_ref(),
            pool: &self.pool,
        };
        self.voices[slot].trigger(
            region,
            file,
            TriggerParams {
                channel,
                key,
                velocity,
                delay_frames,
                random,
                start_offset,
                ticket,
                trigger_time: time,
                streaming,
            },
            &ctx,
        );
    }

    /// Free-slot search with the two-key stealing policy: idle first, then
    /// the quietest stealable voice (ties broken by the larger source
    /// position), stolen only below the silence threshold.
    fn find_free_voice(&mut self, event_time: u64) -> Option<usize> {
        if let Some(index) = self.voices.iter().position(|v| v.is_idle()) {
            return Some(index);
        }

        let mut candidate: Option<usize> = None;
        for (index, voice) in self.voices.iter().enumerate() {
            if !voice.can_be_stolen(event_time) {
                continue;
            }
            candidate = match candidate {
                None => Some(index),
                Some(best) => {
                    let best_voice = &self.voices[best];
                    // Powers within 10% of each other count as comparable
                    // and fall through to the position tie-break.
                    let quieter = voice.power() < best_voice.power() * 0.9;
                    let comparable =
                        !quieter && voice.power() <= best_voice.power() * 1.1;
                    if quieter
                        || (comparable && voice.source_position() > best_voice.source_position())
                    {
                        Some(index)
                    } else {
                        Some(best)
                    }
                }
            };
        }

        let index = candidate?;
        if self.voices[index].power() < config::STEAL_POWER_THRESHOLD {
            if let Some(slot) = self.pool.slot(index) {
                slot.active_ticket.store(0, std::sync::atomic::Ordering::SeqCst);
            }
            self.voices[index].reset_hard();
            Some(index)
        } else {
            None
        }
    }
}

impl Default for Synth {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Synth {
    fn drop(&mut self) {
        // The loader worker only abandons a job when its ticket goes
        // stale; clear them all so the pool can join the thread.
        self.release_all_tickets();
    }
}

// ============================================================================
// Load-time parser listener
// ============================================================================

/// Accumulates scope opcodes and builds regions as headers stream past.
struct LoadListener {
    scope: Header,
    global_opcodes: Vec<Opcode>,
    master_opcodes: Vec<Opcode>,
    group_opcodes: Vec<Opcode>,
    current_region: Option<Region>,
    curve_opcodes: Vec<Opcode>,
    in_curve: bool,
    regions: Vec<Region>,
    curves: Vec<(Option<u8>, Curve)>,
    default_path: Option<String>,
    unknown: HashSet<String>,
}

impl LoadListener {
    fn new() -> Self {
        Self {
            scope: Header::Global,
            global_opcodes: Vec::new(),
            master_opcodes: Vec::new(),
            group_opcodes: Vec::new(),
            current_region: None,
            curve_opcodes: Vec::new(),
            in_curve: false,
            regions: Vec::new(),
            curves: Vec::new(),
            default_path: None,
            unknown: HashSet::new(),
        }
    }

    fn finish(&mut self) {
        self.close_region();
        self.close_curve();
    }

    fn close_region(&mut self) {
        if let Some(region) = self.current_region.take() {
            self.regions.push(region);
        }
    }

    fn close_curve(&mut self) {
        if !self.in_curve {
            return;
        }
        self.in_curve = false;
        let opcodes = std::mem::take(&mut self.curve_opcodes);
        let index = opcodes
            .iter()
            .find(|op| op.name == "curve_index")
            .and_then(|op| op.u8_in(0, 255));
        let curve = Curve::from_header_opcodes(opcodes.iter());
        self.curves.push((index, curve));
    }

    fn open_region(&mut self) {
        let mut region = Region::default();
        for op in self
            .global_opcodes
            .iter()
            .chain(self.master_opcodes.iter())
            .chain(self.group_opcodes.iter())
        {
            if !region.apply_opcode(op) {
                self.unknown.insert(op.name.clone());
            }
        }
        self.current_region = Some(region);
    }
}

impl ParserListener for LoadListener {
    fn on_header(&mut self, header: Header) {
        self.close_region();
        self.close_curve();
        match header {
            Header::Global => {
                self.global_opcodes.clear();
                self.master_opcodes.clear();
                self.group_opcodes.clear();
            }
            Header::Master => {
                self.master_opcodes.clear();
                self.group_opcodes.clear();
            }
            Header::Group => self.group_opcodes.clear(),
            Header::Region => self.open_region(),
            Header::Curve => self.in_curve = true,
            Header::Control | Header::Effect => {}
        }
        self.scope = header;
    }

    fn on_opcode(&mut self, name: &str, value: &str) {
        let opcode = Opcode::new(name, value);
        match self.scope {
            Header::Region => {
                if let Some(region) = self.current_region.as_mut() {
                    if !region.apply_opcode(&opcode) {
                        self.unknown.insert(opcode.name.clone());
                    }
                }
            }
            Header::Global => self.global_opcodes.push(opcode),
            Header::Master => self.master_opcodes.push(opcode),
            Header::Group => self.group_opcodes.push(opcode),
            Header::Curve => self.curve_opcodes.push(opcode),
            Header::Control => {
                if opcode.name == "default_path" {
                    self.default_path = Some(opcode.value.replace('\\', "/"));
                } else {
                    self.unknown.insert(opcode.name.clone());
                }
            }
            Header::Effect => {
                // Bus effects live outside the engine core.
                self.unknown.insert(opcode.name.clone());
            }
        }
    }
}
