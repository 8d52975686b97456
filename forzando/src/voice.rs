//! One live playback of a region.
//!
//! A voice advances a fractional playhead through the region's sample,
//! resampling by linear interpolation under a per-sample pitch ratio,
//! drives its envelopes and LFOs, runs the region's filter and EQ chain,
//! applies amplitude and the stereo stage, and accumulates into the mix.
//!
//! Source data comes from the preloaded head while the playhead is inside
//! it, then from the per-voice streaming ring. Ring underruns produce
//! silence for the missing samples and resume when data arrives.
//!
//! Everything a voice needs per block is preallocated in `configure`; the
//! render path does not allocate.

use std::sync::Arc;

use tracing::debug;

use forzando_dsp::filter::{EqBand, Filter, FilterKind};
use forzando_dsp::math;
use forzando_dsp::power::PowerFollower;
use forzando_dsp::{panning, simd, Buffer};

use crate::config;
use crate::curve::CurveSet;
use crate::envelope::Adsr;
use crate::file_pool::{FileData, FilePool, StreamHandle};
use crate::lfo::{Lfo, ModDestination};
use crate::midi_state::MidiState;
use crate::region::{LoopMode, OffMode, Region};
use crate::tuning::{StretchTuning, Tuning};

/// Life-cycle of a voice slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum VoiceState {
    #[default]
    Idle,
    Playing,
    Releasing,
    /// Short forced ramp before the slot is reused (steal / fast choke).
    QuickFading,
}

/// Read-only state a voice consults while rendering.
pub struct RenderContext<'a> {
    pub midi: &'a MidiState,
    pub curves: &'a CurveSet,
    pub tuning: &'a Tuning,
    pub stretch: Option<&'a StretchTuning>,
    pub pool: &'a FilePool,
}

/// Everything the synth resolves before starting a voice.
pub struct TriggerParams {
    pub channel: u8,
    pub key: u8,
    pub velocity: u8,
    /// Frames of silence before the first sample (event offset plus region
    /// delay).
    pub delay_frames: u64,
    pub random: f32,
    pub start_offset: u64,
    pub ticket: u64,
    pub trigger_time: u64,
    /// True when a streaming ticket was enqueued for this voice.
    pub streaming: bool,
}

const MAX_VOICE_LFOS: usize = 4;

pub struct Voice {
    slot_index: usize,
    state: VoiceState,
    region: Option<Arc<Region>>,
    file: Option<Arc<FileData>>,
    sample_rate: f32,

    trigger_channel: u8,
    trigger_key: u8,
    trigger_velocity: u8,
    trigger_random: f32,
    trigger_time: u64,
    age: u64,
    ticket: u64,

    // playhead
    source_position: f64,
    unrolled_position: f64,
    base_ratio: f64,
    delay_frames: u64,
    loop_mode: LoopMode,
    loop_start: u64,
    loop_end: u64,
    sample_end: u64,
    loops_done: u32,
    source_ended: bool,
    note_released: bool,
    sustain_latched: bool,

    // streaming
    expects_stream: bool,
    stream: Option<StreamHandle>,
    window: Buffer<f32>,
    window_cap: usize,
    window_next: u64,

    // modulation
    amp_eg: Adsr,
    pitch_eg: Adsr,
    fil_eg: Adsr,
    lfos: [Lfo; MAX_VOICE_LFOS],
    filters: [Filter; config::MAX_FILTERS_PER_REGION],
    eqs: [EqBand; config::MAX_EQS_PER_REGION],
    power: PowerFollower,

    quick_fade_remaining: u32,
    quick_fade_length: u32,

    // per-block scratch
    scratch_l: Buffer<f32>,
    scratch_r: Buffer<f32>,
    eg_buf: Buffer<f32>,
    pitch_buf: Buffer<f32>,
    gain_buf: Buffer<f32>,
    eg_scratch: Buffer<f32>,
    param_buf: Buffer<f32>,
    // Each LFO renders exactly once per block; consumers share the result.
    lfo_out: [Buffer<f32>; MAX_VOICE_LFOS],
    // True when the matching block is flat zero and consumers can skip it.
    lfo_flat: [bool; MAX_VOICE_LFOS],
}

impl Voice {
    pub fn new(slot_index: usize, sample_rate: f32) -> Self {
        Self {
            slot_index,
            state: VoiceState::Idle,
            region: None,
            file: None,
            sample_rate,
            trigger_channel: 0,
            trigger_key: 0,
            trigger_velocity: 0,
            trigger_random: 0.0,
            trigger_time: 0,
            age: 0,
            ticket: 0,
            source_position: 0.0,
            unrolled_position: 0.0,
            base_ratio: 1.0,
            delay_frames: 0,
            loop_mode: LoopMode::NoLoop,
            loop_start: 0,
            loop_end: 0,
            sample_end: 0,
            loops_done: 0,
            source_ended: false,
            note_released: false,
            sustain_latched: false,
            expects_stream: false,
            stream: None,
            window: Buffer::new(),
            window_cap: 0,
            window_next: 0,
            amp_eg: Adsr::new(),
            pitch_eg: Adsr::new(),
            fil_eg: Adsr::new(),
            lfos: std::array::from_fn(|_| Lfo::new(sample_rate)),
            filters: std::array::from_fn(|_| Filter::new(FilterKind::Lpf2p, sample_rate)),
            eqs: std::array::from_fn(|_| EqBand::new(FilterKind::Peak, sample_rate)),
            power: PowerFollower::new(sample_rate),
            quick_fade_remaining: 0,
            quick_fade_length: 0,
            scratch_l: Buffer::new(),
            scratch_r: Buffer::new(),
            eg_buf: Buffer::new(),
            pitch_buf: Buffer::new(),
            gain_buf: Buffer::new(),
            eg_scratch: Buffer::new(),
            param_buf: Buffer::new(),
            lfo_out: std::array::from_fn(|_| Buffer::new()),
            lfo_flat: [true; MAX_VOICE_LFOS],
        }
    }

    /// Size all per-block scratch. Control thread, behind the guard.
    pub fn configure(&mut self, sample_rate: f32, samples_per_block: usize, oversampling: usize) {
        self.sample_rate = sample_rate;
        self.scratch_l.resize(samples_per_block);
        self.scratch_r.resize(samples_per_block);
        self.eg_buf.resize(samples_per_block);
        self.pitch_buf.resize(samples_per_block);
        self.gain_buf.resize(samples_per_block);
        self.eg_scratch.resize(samples_per_block);
        self.param_buf.resize(samples_per_block);
        for out in &mut self.lfo_out {
            out.resize(samples_per_block);
        }
        // Window sized for the worst-case per-block source appetite,
        // including the oversampling factor baked into streamed data.
        self.window_cap = (samples_per_block as f64 * config::MAX_PITCH_RATIO) as usize
            * oversampling.max(1)
            + 8;
        self.window.resize(self.window_cap * 2);
        for lfo in &mut self.lfos {
            lfo.set_sample_rate(sample_rate);
        }
        for filter in &mut self.filters {
            filter.set_sample_rate(sample_rate);
        }
        for eq in &mut self.eqs {
            eq.set_sample_rate(sample_rate);
        }
        self.power.set_sample_rate(sample_rate);
        self.reset_hard();
    }

    // -- state queries -------------------------------------------------------

    #[inline]
    pub fn state(&self) -> VoiceState {
        self.state
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == VoiceState::Idle
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != VoiceState::Idle
    }

    #[inline]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn region(&self) -> Option<&Arc<Region>> {
        self.region.as_ref()
    }

    #[inline]
    pub fn trigger_key(&self) -> u8 {
        self.trigger_key
    }

    #[inline]
    pub fn trigger_channel(&self) -> u8 {
        self.trigger_channel
    }

    #[inline]
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Smoothed mean-square output power, for the stealing policy.
    #[inline]
    pub fn power(&self) -> f32 {
        self.power.power()
    }

    #[inline]
    pub fn source_position(&self) -> f64 {
        self.source_position
    }

    /// Samples rendered since this voice was triggered.
    #[inline]
    pub fn age(&self) -> u64 {
        self.age
    }

    /// The random draw this voice was triggered with.
    #[inline]
    pub fn trigger_random(&self) -> f32 {
        self.trigger_random
    }

    /// A voice may be stolen unless it was triggered at this very event
    /// time (a chord must not steal its own notes).
    pub fn can_be_stolen(&self, event_time: u64) -> bool {
        self.is_active() && self.trigger_time != event_time
    }

    // -- lifecycle -----------------------------------------------------------

    /// Start playing `region` from `file`. Real-time safe.
    pub fn trigger(
        &mut self,
        region: Arc<Region>,
        file: Arc<FileData>,
        params: TriggerParams,
        ctx: &RenderContext,
    ) {
        self.trigger_channel = params.channel;
        self.trigger_key = params.key;
        self.trigger_velocity = params.velocity.min(127);
        self.trigger_random = params.random;
        self.trigger_time = params.trigger_time;
        self.age = 0;
        self.ticket = params.ticket;
        self.delay_frames = params.delay_frames;
        self.note_released = false;
        self.sustain_latched = false;
        self.source_ended = false;
        self.loops_done = 0;
        self.quick_fade_remaining = 0;

        // Region opcodes express frames at the file rate; the preloaded data
        // may be oversampled.
        let factor = file.oversampling.max(1) as u64;
        self.sample_end =
            region.end.map_or(file.total_frames, |e| (e * factor).min(file.total_frames));
        let (loop_start, loop_end) = region
            .loop_range
            .map(|(s, e)| (s * factor, e * factor))
            .or(file.loop_points)
            .map(|(s, e)| (s.min(self.sample_end), e.min(self.sample_end)))
            .unwrap_or((0, self.sample_end));
        self.loop_start = loop_start;
        self.loop_end = loop_end.max(loop_start + 1).min(self.sample_end.max(1));
        self.loop_mode = region.loop_mode.unwrap_or({
            if file.loop_points.is_some() { LoopMode::LoopContinuous } else { LoopMode::NoLoop }
        });
        // A sustain loop whose tail is not streamable in unrolled order
        // degrades to a continuous loop.
        if self.loop_mode == LoopMode::LoopSustain
            && self.loop_end > file.preload_frames
            && !file.complete
        {
            debug!("sustain loop beyond the preloaded head, playing as loop_continuous");
            self.loop_mode = LoopMode::LoopContinuous;
        }

        self.source_position = (params.start_offset * factor).min(self.sample_end) as f64;
        self.unrolled_position = self.source_position;
        self.expects_stream = params.streaming;
        self.stream = None;
        self.window_next = file.preload_frames;

        let velocity_norm = self.trigger_velocity as f32 / 127.0;
        self.base_ratio =
            base_pitch_ratio(&region, &file, params.key, self.trigger_velocity, ctx, self.sample_rate);

        self.amp_eg.trigger(&region.amp_eg, self.sample_rate, velocity_norm, ctx.midi, true);
        if let Some(eg) = &region.pitch_eg {
            self.pitch_eg.trigger(eg, self.sample_rate, velocity_norm, ctx.midi, false);
        }
        if let Some(eg) = &region.fil_eg {
            self.fil_eg.trigger(eg, self.sample_rate, velocity_norm, ctx.midi, false);
        }
        for (index, lfo) in self.lfos.iter_mut().enumerate() {
            if let Some(desc) = region.lfos.get(index) {
                lfo.start(desc, params.ticket ^ ((index as u64) << 32));
            }
        }
        for (index, filter) in self.filters.iter_mut().enumerate() {
            if let Some(desc) = region.filters.get(index) {
                filter.set_kind(desc.kind);
                filter.reset();
            }
        }
        for eq in &mut self.eqs {
            eq.reset();
        }
        self.power.clear();

        self.region = Some(region);
        self.file = Some(file);
        self.state = VoiceState::Playing;
    }

    /// Note-off. `offset` is the frame offset inside the next block;
    /// `sustain_down` defers the release until the pedal lifts.
    pub fn release(&mut self, offset: usize, sustain_down: bool) {
        if !self.is_active() || self.note_released {
            return;
        }
        let one_shot = self.loop_mode == LoopMode::OneShot;
        if one_shot {
            // One-shot regions ignore note-off entirely.
            return;
        }
        if sustain_down {
            self.sustain_latched = true;
            return;
        }
        self.note_released = true;
        self.amp_eg.start_release(offset);
        self.pitch_eg.start_release(offset);
        self.fil_eg.start_release(offset);
        self.state = VoiceState::Releasing;
    }

    /// The sustain pedal lifted; fire any deferred release.
    pub fn sustain_lifted(&mut self, offset: usize) {
        if self.sustain_latched {
            self.sustain_latched = false;
            self.release(offset, false);
        }
    }

    /// Choke from a group `off_by` trigger.
    pub fn choke(&mut self, offset: usize) {
        if !self.is_active() {
            return;
        }
        let mode = self.region.as_ref().map_or(OffMode::Fast, |r| r.off_mode);
        match mode {
            OffMode::Fast => self.begin_quick_fade(),
            OffMode::Normal => {
                self.sustain_latched = false;
                self.note_released = true;
                self.amp_eg.start_release(offset);
                self.state = VoiceState::Releasing;
            }
        }
    }

    /// Start the short forced-release ramp that precedes slot reuse.
    pub fn begin_quick_fade(&mut self) {
        if !self.is_active() || self.state == VoiceState::QuickFading {
            return;
        }
        let quick = (config::QUICK_RELEASE_SECONDS * self.sample_rate) as u32;
        self.quick_fade_length = quick.max(1);
        self.quick_fade_remaining = self.quick_fade_length;
        self.state = VoiceState::QuickFading;
    }

    /// Immediately return the slot to idle. The loader ticket goes stale
    /// via the slot's ticket atomic, which the synth owns.
    pub fn reset_hard(&mut self) {
        self.state = VoiceState::Idle;
        self.region = None;
        self.file = None;
        self.stream = None;
        self.expects_stream = false;
        self.ticket = 0;
        self.age = 0;
        self.power.clear();
    }

    /// True when `key`/`channel` identify the note this voice is playing.
    pub fn matches_note(&self, channel: u8, key: u8) -> bool {
        self.is_active() && self.trigger_channel == channel && self.trigger_key == key
    }

    // -- rendering -----------------------------------------------------------

    /// Render one block and add it into `out_l`/`out_r`.
    pub fn render_block(&mut self, ctx: &RenderContext, out_l: &mut [f32], out_r: &mut [f32]) {
        if self.is_idle() {
            return;
        }
        let frames = out_l.len().min(out_r.len()).min(self.scratch_l.len());
        if frames == 0 {
            return;
        }

        // Whole block inside the start delay: just count it down.
        if self.delay_frames >= frames as u64 {
            self.delay_frames -= frames as u64;
            self.age += frames as u64;
            return;
        }
        let start = self.delay_frames as usize;
        self.delay_frames = 0;

        let Some(region) = self.region.clone() else {
            self.reset_hard();
            return;
        };
        let Some(file) = self.file.clone() else {
            self.reset_hard();
            return;
        };

        simd::fill(&mut self.scratch_l[..frames], 0.0);
        simd::fill(&mut self.scratch_r[..frames], 0.0);

        let produced = frames - start;
        let envelope_alive = {
            let eg = &mut self.eg_buf[..produced];
            self.amp_eg.get_block(eg)
        };

        self.generate_lfo_blocks(&region, ctx, produced);
        self.build_pitch_block(&region, ctx, produced);
        self.resample_into_scratch(&file, start, produced);
        self.apply_amplitude(&region, ctx, start, produced);
        self.apply_filters(&region, ctx, start, produced);
        self.apply_stereo_stage(&region, ctx, start, produced);
        self.apply_quick_fade(start, frames);

        {
            let l = &self.scratch_l[..frames];
            let r = &self.scratch_r[..frames];
            self.power.process(l, r);
        }
        simd::add(&self.scratch_l[..frames], &mut out_l[..frames]);
        simd::add(&self.scratch_r[..frames], &mut out_r[..frames]);
        self.age += frames as u64;

        let envelope_done = !envelope_alive || self.amp_eg.is_idle();
        let faded_out = self.state == VoiceState::QuickFading && self.quick_fade_remaining == 0;
        if envelope_done || faded_out || self.source_ended {
            self.reset_hard();
        }
    }

    /// Run every targeted LFO once for this block.
    fn generate_lfo_blocks(&mut self, region: &Region, ctx: &RenderContext, produced: usize) {
        let tempo = ctx.midi.tempo_sec_per_quarter();
        for (index, desc) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
            if desc.targets.is_empty() {
                self.lfo_flat[index] = true;
                continue;
            }
            let span = self.lfos[index].process(desc, tempo, &mut self.lfo_out[index][..produced]);
            self.lfo_flat[index] = span.is_invariant() && span.first_or(0.0) == 0.0;
        }
    }

    /// Summed depth of an LFO's targets hitting `destination`.
    fn lfo_depth(desc: &crate::lfo::LfoDescription, destination: ModDestination) -> f32 {
        desc.targets.iter().filter(|t| t.destination == destination).map(|t| t.depth).sum()
    }

    /// Fill `pitch_buf[..produced]` with per-sample pitch offsets in cents.
    fn build_pitch_block(&mut self, region: &Region, ctx: &RenderContext, produced: usize) {
        let mut constant = region.bend_cents(ctx.midi.pitch_bend_normalized());
        for m in &region.pitch_cc {
            constant +=
                m.depth * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
        }
        simd::fill(&mut self.pitch_buf[..produced], constant);

        if region.pitch_eg.is_some() {
            self.pitch_eg.get_block(&mut self.eg_scratch[..produced]);
            simd::multiply_add_value(
                region.pitch_eg_depth,
                &self.eg_scratch[..produced],
                &mut self.pitch_buf[..produced],
            );
        }
        for (index, desc) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
            let depth = Self::lfo_depth(desc, ModDestination::Pitch);
            if depth == 0.0 || self.lfo_flat[index] {
                continue;
            }
            simd::multiply_add_value(
                depth,
                &self.lfo_out[index][..produced],
                &mut self.pitch_buf[..produced],
            );
        }
    }

    /// Advance the playhead and write interpolated source frames into the
    /// scratch buffers at `start..start + produced`.
    fn resample_into_scratch(&mut self, file: &FileData, start: usize, produced: usize) {
        let channels = file.channels.max(1) as usize;
        let stereo = channels >= 2;
        let max_ratio = config::MAX_PITCH_RATIO * file.oversampling.max(1) as f64;

        for i in 0..produced {
            if self.source_ended {
                break;
            }
            let ratio = (self.base_ratio
                * math::cents_to_ratio(self.pitch_buf[i]) as f64)
                .clamp(0.0, max_ratio);

            let frame = self.unrolled_position.floor() as u64;
            let fraction = (self.unrolled_position - frame as f64) as f32;

            // The interpolation pair wraps at the loop boundary while the
            // playhead is inside a preloaded loop.
            let next_frame = self.next_source_frame(frame);
            let (Some(s0l), Some(s1l)) = (
                self.fetch_sample(file, frame, 0),
                self.fetch_sample(file, next_frame, 0),
            ) else {
                // Ring underrun: silence for the deficit, do not advance.
                break;
            };
            let left = s0l + (s1l - s0l) * fraction;
            let right = if stereo {
                let (Some(s0r), Some(s1r)) = (
                    self.fetch_sample(file, frame, 1),
                    self.fetch_sample(file, next_frame, 1),
                ) else {
                    break;
                };
                s0r + (s1r - s0r) * fraction
            } else {
                left
            };
            self.scratch_l[start + i] = left;
            self.scratch_r[start + i] = right;

            self.advance_playhead(ratio);
        }
    }

    /// The frame following `frame` in source order, accounting for a
    /// preloaded loop wrap.
    fn next_source_frame(&self, frame: u64) -> u64 {
        let looping = self.looping_now();
        if looping && frame + 1 >= self.loop_end && self.loop_end <= self.window_next_base() {
            // Wrap inside preloaded data; the streamed path already carries
            // unrolled frames so no adjustment is needed there.
            self.loop_start + (frame + 1 - self.loop_end)
        } else {
            frame + 1
        }
    }

    fn window_next_base(&self) -> u64 {
        self.file.as_ref().map_or(0, |f| f.preload_frames)
    }

    fn looping_now(&self) -> bool {
        match self.loop_mode {
            LoopMode::LoopContinuous => true,
            LoopMode::LoopSustain => !self.note_released,
            _ => false,
        }
    }

    /// Move the playhead one output sample forward.
    fn advance_playhead(&mut self, ratio: f64) {
        self.source_position += ratio;
        self.unrolled_position += ratio;

        if self.looping_now() {
            let loop_end = self.loop_end as f64;
            if self.source_position >= loop_end {
                let loop_len = (self.loop_end - self.loop_start) as f64;
                self.source_position -= loop_len;
                self.loops_done += 1;
                if self.loop_end <= self.window_next_base() {
                    // Preloaded loop: the unrolled position mirrors the
                    // virtual one so preload indexing stays valid.
                    self.unrolled_position = self.source_position;
                }
                if let (Some(count), LoopMode::LoopContinuous) =
                    (self.region.as_ref().and_then(|r| r.count), self.loop_mode)
                {
                    if self.loops_done >= count {
                        self.source_ended = true;
                    }
                }
            }
        } else if self.source_position + 1.0 >= self.sample_end as f64 {
            self.source_ended = true;
            // One-shot and plain ends release the envelope so the voice
            // retires instead of hanging on sustain.
            self.amp_eg.start_release(0);
        }
    }

    /// Fetch one source sample, from the preloaded head or the stream
    /// window. `None` reports a ring underrun.
    fn fetch_sample(&mut self, file: &FileData, frame: u64, channel: usize) -> Option<f32> {
        if frame < file.preload_frames {
            return Some(file.preloaded_sample(frame, channel));
        }
        if file.complete {
            return Some(0.0);
        }
        // An unrolled streamed loop legitimately reads frame indices past
        // the file end; only non-looping plays stop at `sample_end`.
        let unrolled_loop = self.looping_now() && self.loop_end > file.preload_frames;
        if !unrolled_loop && frame >= self.sample_end {
            return Some(0.0);
        }
        self.stream_sample(file, frame, channel)
    }

    fn stream_sample(&mut self, file: &FileData, frame: u64, channel: usize) -> Option<f32> {
        use ringbuf::traits::{Consumer, Observer};

        if !self.expects_stream {
            return Some(0.0);
        }
        // The worker publishes the handle some time after note start; until
        // then every streamed read is an underrun.
        self.stream.as_ref()?;
        let channels = file.channels.max(1) as usize;
        let cap = self.window_cap as u64;

        // Fill the circular window up to and including `frame`.
        while self.window_next <= frame {
            let handle = self.stream.as_mut()?;
            let available = handle.consumer.occupied_len() / channels;
            if available == 0 {
                return None;
            }
            let needed = (frame - self.window_next + 1) as usize;
            let index = (self.window_next % cap) as usize;
            let run = needed.min(available).min(self.window_cap - index);
            let dst = &mut self.window[index * channels..(index + run) * channels];
            let popped = handle.consumer.pop_slice(dst);
            debug_assert_eq!(popped, run * channels);
            self.window_next += run as u64;
        }
        if frame + cap < self.window_next {
            // Fell out of the window (should not happen with the sizing
            // guarantee); treat as silence.
            return Some(0.0);
        }
        let index = (frame % cap) as usize;
        Some(self.window[index * channels + channel])
    }

    /// Try to adopt the stream handle published by the loader.
    pub fn poll_stream(&mut self, ctx: &RenderContext) {
        if self.expects_stream && self.stream.is_none() && self.is_active() {
            if let Some(slot) = ctx.pool.slot(self.slot_index) {
                if let Some(handle) = slot.take_ready(self.ticket) {
                    self.stream = Some(handle);
                }
            }
        }
    }

    /// Amplitude: envelope x velocity x static gains x CC x LFO.
    fn apply_amplitude(&mut self, region: &Region, ctx: &RenderContext, start: usize, produced: usize) {
        let mut gain_db = region.volume_db
            + region.amp_keytrack * (self.trigger_key as f32 - region.amp_keycenter as f32);
        for m in &region.volume_cc {
            gain_db += m.depth
                * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
        }
        let mut amplitude = region.amplitude * region.velocity_gain(self.trigger_velocity);
        for m in &region.amplitude_cc {
            amplitude *= (m.depth
                * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc)))
            .clamp(0.0, 1.0);
        }
        let constant = math::db_to_gain(gain_db) * amplitude;

        simd::apply_gain_value(constant, &self.eg_buf[..produced], &mut self.gain_buf[..produced]);

        // LFO amplitude/volume contributions, per sample.
        for (index, desc) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
            let amp_depth = Self::lfo_depth(desc, ModDestination::Amplitude);
            let vol_depth = Self::lfo_depth(desc, ModDestination::Volume);
            if (amp_depth == 0.0 && vol_depth == 0.0) || self.lfo_flat[index] {
                continue;
            }
            for i in 0..produced {
                let v = self.lfo_out[index][i];
                let mut factor = 1.0;
                if amp_depth != 0.0 {
                    factor *= (1.0 + amp_depth * v).max(0.0);
                }
                if vol_depth != 0.0 {
                    // dB wobble: 2^(x/6.02) == 10^(x/20)
                    factor *= math::fast_exp2(vol_depth * v * 0.166_096_4);
                }
                self.gain_buf[i] *= factor;
            }
        }

        simd::multiply(&self.gain_buf[..produced], &mut self.scratch_l[start..start + produced]);
        simd::multiply(&self.gain_buf[..produced], &mut self.scratch_r[start..start + produced]);
    }

    fn apply_filters(&mut self, region: &Region, ctx: &RenderContext, start: usize, produced: usize) {
        let velocity_norm = self.trigger_velocity as f32 / 127.0;

        for (index, desc) in region.filters.iter().enumerate() {
            let mut base_cents = desc.keytrack * (self.trigger_key as f32 - desc.keycenter as f32)
                + desc.veltrack * velocity_norm;
            for m in &desc.cutoff_cc {
                base_cents += m.depth
                    * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
            }
            let mut resonance = desc.resonance;
            for m in &desc.resonance_cc {
                resonance += m.depth
                    * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
            }
            // Resonance LFOs contribute at block rate.
            for (lfo_index, desc_lfo) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
                let depth = Self::lfo_depth(desc_lfo, ModDestination::Resonance(index as u8 + 1));
                if depth != 0.0 && !self.lfo_flat[lfo_index] {
                    resonance += depth * self.lfo_out[lfo_index].first().copied().unwrap_or(0.0);
                }
            }
            let base_cutoff = desc.cutoff * math::cents_to_ratio(base_cents);

            // Per-sample sources: filter EG and cutoff LFOs.
            let has_eg = region.fil_eg.is_some() && region.fil_eg_depth != 0.0 && index == 0;
            let lfo_depth: f32 = region
                .lfos
                .iter()
                .take(MAX_VOICE_LFOS)
                .map(|d| Self::lfo_depth(d, ModDestination::Cutoff(index as u8 + 1)))
                .sum();

            let left = &mut self.scratch_l[start..start + produced];
            let right = &mut self.scratch_r[start..start + produced];

            if has_eg || lfo_depth != 0.0 {
                simd::fill(&mut self.param_buf[..produced], 0.0);
                if has_eg {
                    self.fil_eg.get_block(&mut self.eg_scratch[..produced]);
                    simd::multiply_add_value(
                        region.fil_eg_depth,
                        &self.eg_scratch[..produced],
                        &mut self.param_buf[..produced],
                    );
                }
                if lfo_depth != 0.0 {
                    for (lfo_index, desc_lfo) in
                        region.lfos.iter().enumerate().take(MAX_VOICE_LFOS)
                    {
                        let depth =
                            Self::lfo_depth(desc_lfo, ModDestination::Cutoff(index as u8 + 1));
                        if depth == 0.0 || self.lfo_flat[lfo_index] {
                            continue;
                        }
                        simd::multiply_add_value(
                            depth,
                            &self.lfo_out[lfo_index][..produced],
                            &mut self.param_buf[..produced],
                        );
                    }
                }
                // cents -> Hz trajectory, in place.
                for i in 0..produced {
                    self.param_buf[i] = base_cutoff * math::cents_to_ratio(self.param_buf[i]);
                }
                let resonance_span = [resonance];
                let gain_span = [desc.gain];
                self.filters[index].process_modulated(
                    left,
                    right,
                    &self.param_buf[..produced],
                    &resonance_span,
                    &gain_span,
                );
            } else {
                self.filters[index].process(left, right, base_cutoff, resonance, desc.gain);
            }
        }

        for (index, desc) in region.eqs.iter().enumerate().take(config::MAX_EQS_PER_REGION) {
            let mut frequency = desc.frequency;
            for m in &desc.frequency_cc {
                frequency += m.depth
                    * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
            }
            let mut gain = desc.gain;
            for m in &desc.gain_cc {
                gain += m.depth
                    * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
            }
            if gain == 0.0 && desc.gain_cc.is_empty() {
                continue;
            }
            let left = &mut self.scratch_l[start..start + produced];
            let right = &mut self.scratch_r[start..start + produced];
            self.eqs[index].process(left, right, frequency, desc.bandwidth, gain);
        }
    }

    fn apply_stereo_stage(&mut self, region: &Region, ctx: &RenderContext, start: usize, produced: usize) {
        let mut pan = region.pan;
        for m in &region.pan_cc {
            pan += m.depth
                * ctx.curves.get(m.curve as usize).eval_normalized(ctx.midi.cc_normalized(m.cc));
        }
        let pan_lfo_depth: f32 = region
            .lfos
            .iter()
            .take(MAX_VOICE_LFOS)
            .map(|d| Self::lfo_depth(d, ModDestination::Pan))
            .sum();

        let left = &mut self.scratch_l[start..start + produced];
        let right = &mut self.scratch_r[start..start + produced];

        if pan_lfo_depth != 0.0 {
            simd::fill(&mut self.param_buf[..produced], pan);
            for (index, desc) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
                let depth = Self::lfo_depth(desc, ModDestination::Pan);
                if depth == 0.0 || self.lfo_flat[index] {
                    continue;
                }
                simd::multiply_add_value(
                    depth,
                    &self.lfo_out[index][..produced],
                    &mut self.param_buf[..produced],
                );
            }
            panning::pan(&self.param_buf[..produced], left, right);
        } else if pan != 0.0 {
            panning::pan_constant(pan, left, right);
        } else {
            // Center: equal-power split of the mono/stereo source.
            let center = panning::pan_gains(0.0).0;
            simd::apply_gain_in_place(center, left);
            simd::apply_gain_in_place(center, right);
        }

        // Width LFOs contribute at block rate.
        let mut width = region.width;
        for (index, desc) in region.lfos.iter().enumerate().take(MAX_VOICE_LFOS) {
            let depth = Self::lfo_depth(desc, ModDestination::Width);
            if depth != 0.0 && !self.lfo_flat[index] {
                width += depth * self.lfo_out[index].first().copied().unwrap_or(0.0);
            }
        }
        if width != 1.0 {
            panning::width_constant(width, left, right);
        }
        if region.position != 0.0 {
            panning::pan_constant(region.position, left, right);
        }
    }

    fn apply_quick_fade(&mut self, start: usize, frames: usize) {
        if self.state != VoiceState::QuickFading {
            return;
        }
        let length = self.quick_fade_length.max(1) as f32;
        for i in start..frames {
            let gain = self.quick_fade_remaining as f32 / length;
            self.scratch_l[i] *= gain;
            self.scratch_r[i] *= gain;
            if self.quick_fade_remaining > 0 {
                self.quick_fade_remaining -= 1;
            }
        }
    }
}

/// Static pitch ratio for a note: keytrack/tune/transpose, the tuning
/// table, the stretch curve, and the file/engine rate conversion.
fn base_pitch_ratio(
    region: &Region,
    file: &FileData,
    key: u8,
    velocity: u8,
    ctx: &RenderContext,
    engine_rate: f32,
) -> f64 {
    let cents = region.base_pitch_cents(key, velocity);
    let mut ratio = math::cents_to_ratio(cents) as f64;
    // A custom tuning table expresses itself as a deviation from equal
    // temperament, which the cents math above already covers.
    let custom = ctx.tuning.key_frequency(key) / math::midi_note_frequency(key as f32);
    ratio *= custom as f64;
    if let Some(stretch) = ctx.stretch {
        ratio *= stretch.ratio_for_key(key) as f64;
    }
    ratio * (file.sample_rate as f64 / engine_rate as f64)
}
