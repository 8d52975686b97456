//! Region descriptor: one triggerable sample with its modulation graph.
//!
//! A region is built by replaying the opcodes of its scope (global, master,
//! group, then the region's own) through [`Region::apply_opcode`], then
//! sealed with [`Region::finalize`]. After loading it is immutable; voices
//! share it behind an `Arc`.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use forzando_dsp::filter::FilterKind;

use crate::config;
use crate::envelope::EgDescription;
use crate::lfo::{LfoDescription, LfoTarget, LfoWave, ModDestination};
use crate::midi_state::MidiState;
use crate::opcode::Opcode;
use crate::range::{full_byte_range, full_channel_range, full_random_range, Range};

/// How a region is triggered.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Trigger {
    #[default]
    Attack,
    Release,
    First,
    Legato,
}

/// Loop behavior of the sample.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LoopMode {
    #[default]
    NoLoop,
    OneShot,
    LoopContinuous,
    LoopSustain,
}

/// How `off_by` chokes terminate a voice.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OffMode {
    #[default]
    Fast,
    Normal,
}

/// What the region plays.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum SampleRef {
    #[default]
    None,
    File(String),
    SineGenerator,
    NoiseGenerator,
}

/// A CC-driven modulation: value = depth * curve(cc).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CcModulation {
    pub cc: u8,
    pub depth: f32,
    pub curve: u8,
}

/// One filter slot of a region.
#[derive(Clone, Debug)]
pub struct FilterDescription {
    pub kind: FilterKind,
    pub cutoff: f32,
    pub resonance: f32,
    pub gain: f32,
    pub keytrack: f32,
    pub keycenter: u8,
    pub veltrack: f32,
    pub cutoff_cc: SmallVec<[CcModulation; 2]>,
    pub resonance_cc: SmallVec<[CcModulation; 2]>,
}

impl Default for FilterDescription {
    fn default() -> Self {
        Self {
            kind: FilterKind::Lpf2p,
            cutoff: 20_000.0,
            resonance: 0.0,
            gain: 0.0,
            keytrack: 0.0,
            keycenter: 60,
            veltrack: 0.0,
            cutoff_cc: SmallVec::new(),
            resonance_cc: SmallVec::new(),
        }
    }
}

/// One EQ band of a region.
#[derive(Clone, Debug)]
pub struct EqDescription {
    pub kind: FilterKind,
    pub frequency: f32,
    pub bandwidth: f32,
    pub gain: f32,
    pub frequency_cc: SmallVec<[CcModulation; 2]>,
    pub gain_cc: SmallVec<[CcModulation; 2]>,
}

impl EqDescription {
    fn with_default_frequency(band: usize) -> Self {
        // The classic three-band defaults.
        let frequency = match band {
            0 => 50.0,
            1 => 500.0,
            _ => 5000.0,
        };
        Self {
            kind: FilterKind::Peak,
            frequency,
            bandwidth: 1.0,
            gain: 0.0,
            frequency_cc: SmallVec::new(),
            gain_cc: SmallVec::new(),
        }
    }
}

/// The region descriptor. Field meanings follow the SFZ opcode they are
/// parsed from.
#[derive(Clone, Debug)]
pub struct Region {
    // -- trigger predicates -------------------------------------------------
    pub key_range: Range<u8>,
    pub vel_range: Range<u8>,
    pub channel_range: Range<u8>,
    pub cc_conditions: SmallVec<[(u8, Range<u8>); 2]>,
    pub keyswitch_range: Option<Range<u8>>,
    pub keyswitch: Option<u8>,
    pub trigger: Trigger,
    pub random_range: Range<f32>,
    pub group: u32,
    pub off_by: u32,
    pub off_mode: OffMode,
    pub seq_length: u16,
    pub seq_position: u16,
    pub on_cc: Option<(u8, Range<u8>)>,

    // -- sample reference ---------------------------------------------------
    pub sample: SampleRef,
    pub offset: u64,
    pub offset_random: u64,
    pub end: Option<u64>,
    pub loop_mode: Option<LoopMode>,
    pub loop_range: Option<(u64, u64)>,
    pub count: Option<u32>,
    pub delay: f32,
    pub delay_random: f32,

    // -- amplitude ----------------------------------------------------------
    pub volume_db: f32,
    pub amplitude: f32,
    pub pan: f32,
    pub width: f32,
    pub position: f32,
    pub amp_veltrack: f32,
    pub amp_velcurve: SmallVec<[(u8, f32); 4]>,
    pub amp_keytrack: f32,
    pub amp_keycenter: u8,
    pub volume_cc: SmallVec<[CcModulation; 2]>,
    pub amplitude_cc: SmallVec<[CcModulation; 2]>,
    pub pan_cc: SmallVec<[CcModulation; 2]>,
    pub amp_eg: EgDescription,

    // -- pitch --------------------------------------------------------------
    pub pitch_keycenter: u8,
    pub pitch_keytrack: f32,
    pub pitch_veltrack: f32,
    pub transpose: i32,
    pub tune: f32,
    pub bend_up: f32,
    pub bend_down: f32,
    pub bend_step: f32,
    pub pitch_cc: SmallVec<[CcModulation; 2]>,
    pub pitch_eg: Option<EgDescription>,
    pub pitch_eg_depth: f32,

    // -- filters and EQ -----------------------------------------------------
    pub filters: SmallVec<[FilterDescription; 2]>,
    pub eqs: SmallVec<[EqDescription; 3]>,
    pub fil_eg: Option<EgDescription>,
    pub fil_eg_depth: f32,

    // -- LFOs ---------------------------------------------------------------
    pub lfos: SmallVec<[LfoDescription; 2]>,

    // -- derived ------------------------------------------------------------
    velocity_table: Arc<[f32; 128]>,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            key_range: full_byte_range(),
            vel_range: full_byte_range(),
            channel_range: full_channel_range(),
            cc_conditions: SmallVec::new(),
            keyswitch_range: None,
            keyswitch: None,
            trigger: Trigger::Attack,
            random_range: full_random_range(),
            group: 0,
            off_by: 0,
            off_mode: OffMode::Fast,
            seq_length: 1,
            seq_position: 1,
            on_cc: None,
            sample: SampleRef::None,
            offset: 0,
            offset_random: 0,
            end: None,
            loop_mode: None,
            loop_range: None,
            count: None,
            delay: 0.0,
            delay_random: 0.0,
            volume_db: 0.0,
            amplitude: 1.0,
            pan: 0.0,
            width: 1.0,
            position: 0.0,
            amp_veltrack: 1.0,
            amp_velcurve: SmallVec::new(),
            amp_keytrack: 0.0,
            amp_keycenter: 60,
            volume_cc: SmallVec::new(),
            amplitude_cc: SmallVec::new(),
            pan_cc: SmallVec::new(),
            amp_eg: EgDescription::default(),
            pitch_keycenter: 60,
            pitch_keytrack: 100.0,
            pitch_veltrack: 0.0,
            transpose: 0,
            tune: 0.0,
            bend_up: 200.0,
            bend_down: -200.0,
            bend_step: 1.0,
            pitch_cc: SmallVec::new(),
            pitch_eg: None,
            pitch_eg_depth: 0.0,
            filters: SmallVec::new(),
            eqs: SmallVec::new(),
            fil_eg: None,
            fil_eg_depth: 0.0,
            lfos: SmallVec::new(),
            velocity_table: Arc::new([0.0; 128]),
        }
    }
}

impl Region {
    /// Apply one opcode. Returns false when the opcode is unknown so the
    /// caller can collect it for `get_unknown_opcodes`.
    pub fn apply_opcode(&mut self, op: &Opcode) -> bool {
        match op.name.as_str() {
            // -- trigger predicates -----------------------------------------
            "sample" => {
                let value = op.value.trim();
                self.sample = match value {
                    "*sine" => SampleRef::SineGenerator,
                    "*noise" => SampleRef::NoiseGenerator,
                    _ => SampleRef::File(value.replace('\\', "/")),
                };
            }
            "key" => {
                if let Some(key) = op.note_value() {
                    self.key_range = Range::new(key, key);
                    self.pitch_keycenter = key;
                }
            }
            "lokey" => {
                if let Some(key) = op.note_value() {
                    self.key_range.set_lo(key);
                }
            }
            "hikey" => {
                if let Some(key) = op.note_value() {
                    self.key_range.set_hi(key);
                }
            }
            "lovel" => {
                if let Some(vel) = op.u8_in(0, 127) {
                    self.vel_range.set_lo(vel);
                }
            }
            "hivel" => {
                if let Some(vel) = op.u8_in(0, 127) {
                    self.vel_range.set_hi(vel);
                }
            }
            "lochan" => {
                if let Some(channel) = op.u8_in(1, 16) {
                    self.channel_range.set_lo(channel);
                }
            }
            "hichan" => {
                if let Some(channel) = op.u8_in(1, 16) {
                    self.channel_range.set_hi(channel);
                }
            }
            "locc" => {
                if let (Some(cc), Some(value)) = (op.parameter(), op.u8_in(0, 127)) {
                    self.cc_condition_mut(cc).set_lo(value);
                }
            }
            "hicc" => {
                if let (Some(cc), Some(value)) = (op.parameter(), op.u8_in(0, 127)) {
                    self.cc_condition_mut(cc).set_hi(value);
                }
            }
            "on_locc" => {
                if let (Some(cc), Some(value)) = (op.parameter(), op.u8_in(0, 127)) {
                    let range = self.on_cc.get_or_insert((cc, full_byte_range()));
                    range.0 = cc;
                    range.1.set_lo(value);
                }
            }
            "on_hicc" => {
                if let (Some(cc), Some(value)) = (op.parameter(), op.u8_in(0, 127)) {
                    let range = self.on_cc.get_or_insert((cc, full_byte_range()));
                    range.0 = cc;
                    range.1.set_hi(value);
                }
            }
            "sw_lokey" => {
                if let Some(key) = op.note_value() {
                    let range = self.keyswitch_range.get_or_insert(Range::new(key, key));
                    range.set_lo(key);
                }
            }
            "sw_hikey" => {
                if let Some(key) = op.note_value() {
                    let range = self.keyswitch_range.get_or_insert(Range::new(key, key));
                    range.set_hi(key);
                }
            }
            "sw_last" => self.keyswitch = op.note_value(),
            "trigger" => {
                self.trigger = match op.value.trim() {
                    "attack" => Trigger::Attack,
                    "release" => Trigger::Release,
                    "first" => Trigger::First,
                    "legato" => Trigger::Legato,
                    other => {
                        debug!("unknown trigger mode '{other}', keeping attack");
                        Trigger::Attack
                    }
                };
            }
            "lorand" => {
                if let Some(value) = op.f32_in(0.0, 1.0) {
                    self.random_range.set_lo(value);
                }
            }
            "hirand" => {
                if let Some(value) = op.f32_in(0.0, 1.0) {
                    self.random_range.set_hi(value);
                }
            }
            "group" => self.group = op.u32_value().unwrap_or(0),
            "off_by" => self.off_by = op.u32_value().unwrap_or(0),
            "off_mode" => {
                self.off_mode =
                    if op.value.trim() == "normal" { OffMode::Normal } else { OffMode::Fast };
            }
            "seq_length" => self.seq_length = op.u32_value().unwrap_or(1).clamp(1, 100) as u16,
            "seq_position" => self.seq_position = op.u32_value().unwrap_or(1).clamp(1, 100) as u16,

            // -- sample playback --------------------------------------------
            "offset" => self.offset = op.u64_value().unwrap_or(0),
            "offset_random" => self.offset_random = op.u64_value().unwrap_or(0),
            "end" => self.end = op.u64_value(),
            "loop_mode" | "loopmode" => {
                self.loop_mode = match op.value.trim() {
                    "no_loop" => Some(LoopMode::NoLoop),
                    "one_shot" => Some(LoopMode::OneShot),
                    "loop_continuous" => Some(LoopMode::LoopContinuous),
                    "loop_sustain" => Some(LoopMode::LoopSustain),
                    _ => None,
                };
            }
            "loop_start" | "loopstart" => {
                if let Some(start) = op.u64_value() {
                    let (_, end) = self.loop_range.unwrap_or((0, u64::MAX));
                    self.loop_range = Some((start, end));
                }
            }
            "loop_end" | "loopend" => {
                if let Some(end) = op.u64_value() {
                    let (start, _) = self.loop_range.unwrap_or((0, u64::MAX));
                    self.loop_range = Some((start, end));
                }
            }
            "count" => {
                self.count = op.u32_value();
                // A finite play count implies a one-shot style loop.
                if self.count.is_some() && self.loop_mode.is_none() {
                    self.loop_mode = Some(LoopMode::OneShot);
                }
            }
            "delay" => self.delay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "delay_random" => self.delay_random = op.f32_in(0.0, 100.0).unwrap_or(0.0),

            // -- amplitude --------------------------------------------------
            "volume" | "gain" => self.volume_db = op.f32_in(-144.0, 48.0).unwrap_or(0.0),
            "amplitude" => self.amplitude = op.percent_value(0.0, 100.0).unwrap_or(1.0),
            "pan" => self.pan = op.percent_value(-100.0, 100.0).unwrap_or(0.0),
            "width" => self.width = op.percent_value(-100.0, 100.0).unwrap_or(1.0),
            "position" => self.position = op.percent_value(-100.0, 100.0).unwrap_or(0.0),
            "amp_veltrack" => {
                self.amp_veltrack = op.percent_value(-100.0, 100.0).unwrap_or(1.0);
            }
            "amp_velcurve" => {
                if let (Some(vel), Some(value)) = (op.parameter(), op.f32_in(0.0, 1.0)) {
                    self.amp_velcurve.push((vel, value));
                }
            }
            "amp_keytrack" => self.amp_keytrack = op.f32_in(-96.0, 12.0).unwrap_or(0.0),
            "amp_keycenter" => self.amp_keycenter = op.note_value().unwrap_or(60),
            "volume_oncc" | "gain_oncc" => self.push_cc_mod(op, CcTarget::Volume),
            "amplitude_oncc" => self.push_cc_mod(op, CcTarget::Amplitude),
            "pan_oncc" => self.push_cc_mod(op, CcTarget::Pan),

            // -- amp envelope -----------------------------------------------
            "ampeg_delay" => self.amp_eg.delay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "ampeg_start" => self.amp_eg.start = op.percent_value(0.0, 100.0).unwrap_or(0.0),
            "ampeg_attack" => self.amp_eg.attack = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "ampeg_hold" => self.amp_eg.hold = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "ampeg_decay" => self.amp_eg.decay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "ampeg_sustain" => self.amp_eg.sustain = op.percent_value(0.0, 100.0).unwrap_or(1.0),
            "ampeg_release" => self.amp_eg.release = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            // vel2 opcodes normalize to "vel" + parameter 2.
            "ampeg_velattack" => self.amp_eg.vel_to_attack = op.f32_in(-100.0, 100.0).unwrap_or(0.0),
            "ampeg_veldecay" => self.amp_eg.vel_to_decay = op.f32_in(-100.0, 100.0).unwrap_or(0.0),
            "ampeg_velrelease" => {
                self.amp_eg.vel_to_release = op.f32_in(-100.0, 100.0).unwrap_or(0.0)
            }
            "ampeg_velsustain" => {
                self.amp_eg.vel_to_sustain = op.percent_value(-100.0, 100.0).unwrap_or(0.0)
            }
            "ampeg_attack_oncc" => push_eg_cc(&mut self.amp_eg.attack_cc, op),
            "ampeg_decay_oncc" => push_eg_cc(&mut self.amp_eg.decay_cc, op),
            "ampeg_release_oncc" => push_eg_cc(&mut self.amp_eg.release_cc, op),
            "ampeg_sustain_oncc" => push_eg_cc(&mut self.amp_eg.sustain_cc, op),

            // -- pitch ------------------------------------------------------
            "pitch_keycenter" => self.pitch_keycenter = op.note_value().unwrap_or(60),
            "pitch_keytrack" => self.pitch_keytrack = op.f32_in(-1200.0, 1200.0).unwrap_or(100.0),
            "pitch_veltrack" => self.pitch_veltrack = op.f32_in(-9600.0, 9600.0).unwrap_or(0.0),
            "transpose" => self.transpose = op.i32_value().unwrap_or(0).clamp(-127, 127),
            "tune" | "pitch" => self.tune = op.f32_in(-9600.0, 9600.0).unwrap_or(0.0),
            "bend_up" | "bendup" => self.bend_up = op.f32_in(-9600.0, 9600.0).unwrap_or(200.0),
            "bend_down" | "benddown" => {
                self.bend_down = op.f32_in(-9600.0, 9600.0).unwrap_or(-200.0)
            }
            "bend_step" | "bendstep" => self.bend_step = op.f32_in(1.0, 1200.0).unwrap_or(1.0),
            "pitch_oncc" | "tune_oncc" => self.push_cc_mod(op, CcTarget::Pitch),

            // -- pitch envelope ---------------------------------------------
            "pitcheg_delay" => self.pitch_eg_mut().delay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "pitcheg_attack" => self.pitch_eg_mut().attack = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "pitcheg_hold" => self.pitch_eg_mut().hold = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "pitcheg_decay" => self.pitch_eg_mut().decay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "pitcheg_sustain" => {
                self.pitch_eg_mut().sustain = op.percent_value(0.0, 100.0).unwrap_or(1.0)
            }
            "pitcheg_release" => self.pitch_eg_mut().release = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "pitcheg_depth" => self.pitch_eg_depth = op.f32_in(-12_000.0, 12_000.0).unwrap_or(0.0),

            // -- filters ----------------------------------------------------
            "fil_type" => {
                let index = op.parameter().unwrap_or(1);
                if let Some(kind) = parse_filter_type(op.value.trim()) {
                    self.filter_mut(index).kind = kind;
                }
            }
            "cutoff" => {
                let index = op.parameter().unwrap_or(1);
                if let Some(cutoff) = op.f32_in(0.0, 100_000.0) {
                    self.filter_mut(index).cutoff = cutoff;
                }
            }
            "resonance" => {
                let index = op.parameter().unwrap_or(1);
                self.filter_mut(index).resonance = op.f32_in(0.0, 96.0).unwrap_or(0.0);
            }
            "fil_gain" => {
                let index = op.parameter().unwrap_or(1);
                self.filter_mut(index).gain = op.f32_in(-96.0, 96.0).unwrap_or(0.0);
            }
            "fil_keytrack" => {
                let index = op.parameter().unwrap_or(1);
                self.filter_mut(index).keytrack = op.f32_in(0.0, 1200.0).unwrap_or(0.0);
            }
            "fil_keycenter" => {
                let index = op.parameter().unwrap_or(1);
                self.filter_mut(index).keycenter = op.note_value().unwrap_or(60);
            }
            "fil_veltrack" => {
                let index = op.parameter().unwrap_or(1);
                self.filter_mut(index).veltrack = op.f32_in(-9600.0, 9600.0).unwrap_or(0.0);
            }
            "cutoff_oncc" | "cutoff_cc" => {
                let (index, cc) = indexed_cc(op);
                if let (Some(cc), Some(depth)) = (cc, op.f32_in(-9600.0, 9600.0)) {
                    self.filter_mut(index).cutoff_cc.push(CcModulation { cc, depth, curve: 0 });
                }
            }
            "resonance_oncc" => {
                let (index, cc) = indexed_cc(op);
                if let (Some(cc), Some(depth)) = (cc, op.f32_in(-96.0, 96.0)) {
                    self.filter_mut(index).resonance_cc.push(CcModulation { cc, depth, curve: 0 });
                }
            }

            // -- filter envelope --------------------------------------------
            "fileg_delay" => self.fil_eg_mut().delay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "fileg_attack" => self.fil_eg_mut().attack = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "fileg_hold" => self.fil_eg_mut().hold = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "fileg_decay" => self.fil_eg_mut().decay = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "fileg_sustain" => {
                self.fil_eg_mut().sustain = op.percent_value(0.0, 100.0).unwrap_or(1.0)
            }
            "fileg_release" => self.fil_eg_mut().release = op.f32_in(0.0, 100.0).unwrap_or(0.0),
            "fileg_depth" => self.fil_eg_depth = op.f32_in(-12_000.0, 12_000.0).unwrap_or(0.0),

            // -- EQ ---------------------------------------------------------
            "eq_freq" => {
                if let (Some(band), Some(freq)) = (op.parameter(), op.f32_in(0.0, 30_000.0)) {
                    self.eq_mut(band).frequency = freq;
                }
            }
            "eq_bw" => {
                if let (Some(band), Some(bw)) = (op.parameter(), op.f32_in(0.001, 4.0)) {
                    self.eq_mut(band).bandwidth = bw;
                }
            }
            "eq_gain" => {
                if let (Some(band), Some(gain)) = (op.parameter(), op.f32_in(-96.0, 48.0)) {
                    self.eq_mut(band).gain = gain;
                }
            }
            "eq_type" => {
                if let Some(band) = op.parameter() {
                    let kind = match op.value.trim() {
                        "lshelf" => FilterKind::LowShelf,
                        "hshelf" => FilterKind::HighShelf,
                        _ => FilterKind::Peak,
                    };
                    self.eq_mut(band).kind = kind;
                }
            }
            "eq_freq_oncc" => {
                if let (Some(band), Some(cc)) = (op.parameter(), op.second_parameter()) {
                    if let Some(depth) = op.f32_in(-30_000.0, 30_000.0) {
                        self.eq_mut(band).frequency_cc.push(CcModulation { cc, depth, curve: 0 });
                    }
                }
            }
            "eq_gain_oncc" => {
                if let (Some(band), Some(cc)) = (op.parameter(), op.second_parameter()) {
                    if let Some(depth) = op.f32_in(-96.0, 48.0) {
                        self.eq_mut(band).gain_cc.push(CcModulation { cc, depth, curve: 0 });
                    }
                }
            }

            // -- LFOs -------------------------------------------------------
            "lfo_freq" => {
                if let (Some(n), Some(freq)) = (op.parameter(), op.f32_in(0.0, 100.0)) {
                    self.lfo_mut(n).freq = freq;
                }
            }
            "lfo_beats" => {
                if let (Some(n), Some(beats)) = (op.parameter(), op.f32_in(0.0, 32.0)) {
                    self.lfo_mut(n).beats = beats;
                }
            }
            "lfo_delay" => {
                if let (Some(n), Some(delay)) = (op.parameter(), op.f32_in(0.0, 30.0)) {
                    self.lfo_mut(n).delay = delay;
                }
            }
            "lfo_fade" => {
                if let (Some(n), Some(fade)) = (op.parameter(), op.f32_in(0.0, 30.0)) {
                    self.lfo_mut(n).fade = fade;
                }
            }
            "lfo_phase" => {
                if let (Some(n), Some(phase)) = (op.parameter(), op.f32_in(0.0, 1.0)) {
                    self.lfo_mut(n).phase = phase;
                }
            }
            "lfo_wave" => {
                if let (Some(n), Some(value)) = (op.parameter(), op.i32_value()) {
                    let sub = op.second_parameter().unwrap_or(1) as usize;
                    self.lfo_mut(n).sub_mut(sub).wave = LfoWave::from_opcode(value);
                }
            }
            "lfo_ratio" => {
                if let (Some(n), Some(ratio)) = (op.parameter(), op.f32_in(0.0, 100.0)) {
                    let sub = op.second_parameter().unwrap_or(1) as usize;
                    self.lfo_mut(n).sub_mut(sub).ratio = ratio;
                }
            }
            "lfo_scale" => {
                if let (Some(n), Some(scale)) = (op.parameter(), op.f32_in(-10.0, 10.0)) {
                    let sub = op.second_parameter().unwrap_or(1) as usize;
                    self.lfo_mut(n).sub_mut(sub).scale = scale;
                }
            }
            "lfo_offset" => {
                if let (Some(n), Some(offset)) = (op.parameter(), op.f32_in(-10.0, 10.0)) {
                    let sub = op.second_parameter().unwrap_or(1) as usize;
                    self.lfo_mut(n).sub_mut(sub).offset = offset;
                }
            }
            "lfo_smooth" => {
                if let (Some(n), Some(smooth)) = (op.parameter(), op.f32_in(0.0, 10.0)) {
                    let sub = op.second_parameter().unwrap_or(1) as usize;
                    self.lfo_mut(n).sub_mut(sub).smooth = smooth;
                }
            }
            "lfo_pitch" => self.push_lfo_target(op, ModDestination::Pitch, -9600.0, 9600.0),
            "lfo_volume" => self.push_lfo_target(op, ModDestination::Volume, -48.0, 48.0),
            "lfo_amplitude" => self.push_lfo_target(op, ModDestination::Amplitude, -100.0, 100.0),
            "lfo_pan" => self.push_lfo_target(op, ModDestination::Pan, -100.0, 100.0),
            "lfo_width" => self.push_lfo_target(op, ModDestination::Width, -100.0, 100.0),
            "lfo_cutoff" => {
                let index = op.second_parameter().unwrap_or(1);
                self.push_lfo_target(op, ModDestination::Cutoff(index), -9600.0, 9600.0);
            }
            "lfo_resonance" => {
                let index = op.second_parameter().unwrap_or(1);
                self.push_lfo_target(op, ModDestination::Resonance(index), -96.0, 96.0);
            }

            _ => return false,
        }
        true
    }

    /// Seal the region: derive lookup tables and normalize invariants.
    pub fn finalize(&mut self) {
        let mut table = [0.0f32; 128];
        for (vel, entry) in table.iter_mut().enumerate() {
            *entry = self.compute_velocity_gain(vel as u8);
        }
        self.velocity_table = Arc::new(table);
    }

    // -- trigger predicates -------------------------------------------------

    /// True when this region wants a voice for the given note-on. The
    /// random draw is in [0, 1).
    pub fn matches_note_on(
        &self,
        channel: u8,
        key: u8,
        velocity: u8,
        random: f32,
        midi: &MidiState,
        current_keyswitch: Option<u8>,
    ) -> bool {
        let trigger_ok = match self.trigger {
            Trigger::Attack => true,
            Trigger::Release => false,
            // The incoming note is already registered when predicates run.
            Trigger::First => midi.active_notes() <= 1,
            Trigger::Legato => midi.active_notes() > 1,
        };
        trigger_ok
            && self.key_range.contains(key)
            && self.vel_range.contains(velocity)
            && self.channel_range.contains(channel)
            && self.random_matches(random)
            && self.cc_conditions_hold(midi)
            && self.keyswitch_matches(current_keyswitch)
    }

    /// True when this region wants a voice for the given note-off
    /// (release-triggered regions).
    pub fn matches_note_off(
        &self,
        channel: u8,
        key: u8,
        on_velocity: u8,
        random: f32,
        midi: &MidiState,
        current_keyswitch: Option<u8>,
    ) -> bool {
        self.trigger == Trigger::Release
            && self.key_range.contains(key)
            && self.vel_range.contains(on_velocity)
            && self.channel_range.contains(channel)
            && self.random_matches(random)
            && self.cc_conditions_hold(midi)
            && self.keyswitch_matches(current_keyswitch)
    }

    /// True when a CC change moves into this region's `on_cc` window.
    pub fn matches_cc(&self, cc: u8, value: u8, previous: u8) -> bool {
        match self.on_cc {
            Some((number, range)) => {
                number == cc && range.contains(value) && !range.contains(previous)
            }
            None => false,
        }
    }

    fn random_matches(&self, random: f32) -> bool {
        // lorand/hirand describe a half-open interval so adjacent regions
        // partition the draw; a hi of 1.0 closes the top.
        let lo = self.random_range.lo();
        let hi = self.random_range.hi();
        random >= lo && (random < hi || hi >= 1.0)
    }

    fn cc_conditions_hold(&self, midi: &MidiState) -> bool {
        self.cc_conditions.iter().all(|&(cc, range)| range.contains(midi.cc_value(cc)))
    }

    fn keyswitch_matches(&self, current: Option<u8>) -> bool {
        match self.keyswitch {
            Some(wanted) => current == Some(wanted),
            None => true,
        }
    }

    /// True when `key` falls in the keyswitch selection zone.
    pub fn key_is_keyswitch(&self, key: u8) -> bool {
        self.keyswitch_range.as_ref().is_some_and(|range| range.contains(key))
    }

    // -- derived values -----------------------------------------------------

    /// Velocity-to-gain factor, from the precomputed table.
    #[inline]
    pub fn velocity_gain(&self, velocity: u8) -> f32 {
        self.velocity_table[velocity.min(127) as usize]
    }

    /// Base pitch offset in cents for a note, before continuous modulation.
    pub fn base_pitch_cents(&self, key: u8, velocity: u8) -> f32 {
        let keytrack = (key as f32 - self.pitch_keycenter as f32) * self.pitch_keytrack;
        let veltrack = self.pitch_veltrack * (velocity.min(127) as f32 / 127.0);
        keytrack + veltrack + self.tune + self.transpose as f32 * 100.0
    }

    /// Pitch-bend range in cents for a normalized wheel position.
    pub fn bend_cents(&self, normalized: f32) -> f32 {
        let cents = if normalized >= 0.0 {
            normalized * self.bend_up
        } else {
            -normalized * self.bend_down
        };
        // Quantize to bend_step when it is coarser than a cent.
        if self.bend_step > 1.0 {
            (cents / self.bend_step).round() * self.bend_step
        } else {
            cents
        }
    }

    fn compute_velocity_gain(&self, velocity: u8) -> f32 {
        let norm = velocity.min(127) as f32 / 127.0;
        let curve = if self.amp_velcurve.is_empty() {
            // Default SFZ velocity response: power-2 amplitude law.
            norm * norm
        } else {
            interpolate_velcurve(&self.amp_velcurve, velocity)
        };
        let vt = self.amp_veltrack;
        if vt >= 0.0 {
            1.0 - vt + vt * curve
        } else {
            1.0 + vt * curve
        }
    }

    // -- builder internals --------------------------------------------------

    fn cc_condition_mut(&mut self, cc: u8) -> &mut Range<u8> {
        if let Some(index) = self.cc_conditions.iter().position(|&(number, _)| number == cc) {
            &mut self.cc_conditions[index].1
        } else {
            self.cc_conditions.push((cc, full_byte_range()));
            &mut self.cc_conditions.last_mut().expect("just pushed").1
        }
    }

    fn filter_mut(&mut self, index_1based: u8) -> &mut FilterDescription {
        let index =
            (index_1based.max(1) as usize - 1).min(config::MAX_FILTERS_PER_REGION - 1);
        while self.filters.len() <= index {
            self.filters.push(FilterDescription::default());
        }
        &mut self.filters[index]
    }

    fn eq_mut(&mut self, band_1based: u8) -> &mut EqDescription {
        let index = (band_1based.max(1) as usize - 1).min(config::MAX_EQS_PER_REGION - 1);
        while self.eqs.len() <= index {
            let band = self.eqs.len();
            self.eqs.push(EqDescription::with_default_frequency(band));
        }
        &mut self.eqs[index]
    }

    fn lfo_mut(&mut self, n_1based: u8) -> &mut LfoDescription {
        let index = n_1based.max(1) as usize - 1;
        while self.lfos.len() <= index {
            self.lfos.push(LfoDescription::default());
        }
        &mut self.lfos[index]
    }

    fn pitch_eg_mut(&mut self) -> &mut EgDescription {
        self.pitch_eg.get_or_insert_with(EgDescription::default)
    }

    fn fil_eg_mut(&mut self) -> &mut EgDescription {
        self.fil_eg.get_or_insert_with(EgDescription::default)
    }

    fn push_cc_mod(&mut self, op: &Opcode, target: CcTarget) {
        let Some(cc) = op.parameter() else { return };
        let (depth, list) = match target {
            CcTarget::Volume => (op.f32_in(-144.0, 48.0), &mut self.volume_cc),
            CcTarget::Amplitude => (op.percent_value(-100.0, 100.0), &mut self.amplitude_cc),
            CcTarget::Pan => (op.percent_value(-100.0, 100.0), &mut self.pan_cc),
            CcTarget::Pitch => (op.f32_in(-9600.0, 9600.0), &mut self.pitch_cc),
        };
        if let Some(depth) = depth {
            list.push(CcModulation { cc, depth, curve: 0 });
        }
    }

    fn push_lfo_target(&mut self, op: &Opcode, destination: ModDestination, lo: f32, hi: f32) {
        let Some(n) = op.parameter() else { return };
        let Some(mut depth) = op.f32_in(lo, hi) else { return };
        // Percent-scaled destinations normalize to unit factors.
        if matches!(
            destination,
            ModDestination::Amplitude | ModDestination::Pan | ModDestination::Width
        ) {
            depth /= 100.0;
        }
        self.lfo_mut(n).targets.push(LfoTarget { destination, depth });
    }
}

enum CcTarget {
    Volume,
    Amplitude,
    Pan,
    Pitch,
}

fn push_eg_cc(list: &mut SmallVec<[(u8, f32); 2]>, op: &Opcode) {
    if let (Some(cc), Some(depth)) = (op.parameter(), op.f32_in(-100.0, 100.0)) {
        list.push((cc, depth));
    }
}

fn indexed_cc(op: &Opcode) -> (u8, Option<u8>) {
    match (op.parameter(), op.second_parameter()) {
        (Some(index), Some(cc)) => (index, Some(cc)),
        (Some(cc), None) => (1, Some(cc)),
        _ => (1, None),
    }
}

fn parse_filter_type(text: &str) -> Option<FilterKind> {
    Some(match text {
        "lpf_1p" => FilterKind::Lpf1p,
        "lpf_2p" => FilterKind::Lpf2p,
        "lpf_4p" => FilterKind::Lpf4p,
        "lpf_6p" => FilterKind::Lpf6p,
        "hpf_1p" => FilterKind::Hpf1p,
        "hpf_2p" => FilterKind::Hpf2p,
        "bpf_1p" => FilterKind::Bpf1p,
        "bpf_2p" => FilterKind::Bpf2p,
        "brf_1p" | "brf_2p" => FilterKind::Brf2p,
        "apf_1p" | "apf_2p" => FilterKind::Apf2p,
        "pkf_2p" | "peq" => FilterKind::Peak,
        "lsh" => FilterKind::LowShelf,
        "hsh" => FilterKind::HighShelf,
        _ => return None,
    })
}

/// Piecewise-linear interpolation over user `amp_velcurve_N` points, with
/// implicit anchors at (0, 0) and (127, 1) when not supplied.
fn interpolate_velcurve(points: &[(u8, f32)], velocity: u8) -> f32 {
    let mut sorted: SmallVec<[(u8, f32); 6]> = SmallVec::new();
    sorted.push((0, points.iter().find(|&&(v, _)| v == 0).map_or(0.0, |&(_, g)| g)));
    for &(v, g) in points {
        if v != 0 && v != 127 {
            sorted.push((v, g));
        }
    }
    sorted.push((127, points.iter().find(|&&(v, _)| v == 127).map_or(1.0, |&(_, g)| g)));
    sorted.sort_by_key(|&(v, _)| v);

    let velocity = velocity.min(127);
    for window in sorted.windows(2) {
        let (v0, g0) = window[0];
        let (v1, g1) = window[1];
        if velocity >= v0 && velocity <= v1 {
            if v1 == v0 {
                return g1;
            }
            let t = (velocity - v0) as f32 / (v1 - v0) as f32;
            return g0 + (g1 - g0) * t;
        }
    }
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(opcodes: &[(&str, &str)]) -> Region {
        let mut region = Region::default();
        for (name, value) in opcodes {
            let op = Opcode::new(name, value);
            assert!(region.apply_opcode(&op), "opcode {name} not recognized");
        }
        region.finalize();
        region
    }

    #[test]
    fn key_opcode_sets_range_and_center() {
        let region = region_with(&[("key", "64")]);
        assert!(region.key_range.contains(64));
        assert!(!region.key_range.contains(63));
        assert_eq!(region.pitch_keycenter, 64);
    }

    #[test]
    fn note_on_predicates() {
        let midi = MidiState::new();
        let region = region_with(&[
            ("lokey", "60"),
            ("hikey", "72"),
            ("lovel", "64"),
            ("hivel", "127"),
        ]);
        assert!(region.matches_note_on(1, 60, 100, 0.5, &midi, None));
        assert!(region.matches_note_on(1, 72, 64, 0.0, &midi, None));
        assert!(!region.matches_note_on(1, 59, 100, 0.5, &midi, None));
        assert!(!region.matches_note_on(1, 60, 63, 0.5, &midi, None));
    }

    #[test]
    fn cc_conditions_gate_triggering() {
        let mut midi = MidiState::new();
        let region = region_with(&[("locc64", "64"), ("hicc64", "127")]);
        assert!(!region.matches_note_on(1, 60, 100, 0.5, &midi, None));
        midi.cc(0, 64, 100);
        assert!(region.matches_note_on(1, 60, 100, 0.5, &midi, None));
    }

    #[test]
    fn random_range_partitions() {
        let midi = MidiState::new();
        let low = region_with(&[("lorand", "0"), ("hirand", "0.5")]);
        let high = region_with(&[("lorand", "0.5"), ("hirand", "1")]);
        for draw in [0.0, 0.25, 0.499] {
            assert!(low.matches_note_on(1, 60, 100, draw, &midi, None));
            assert!(!high.matches_note_on(1, 60, 100, draw, &midi, None));
        }
        for draw in [0.5, 0.75, 0.999] {
            assert!(!low.matches_note_on(1, 60, 100, draw, &midi, None));
            assert!(high.matches_note_on(1, 60, 100, draw, &midi, None));
        }
    }

    #[test]
    fn release_trigger_only_fires_on_note_off() {
        let midi = MidiState::new();
        let region = region_with(&[("trigger", "release")]);
        assert!(!region.matches_note_on(1, 60, 100, 0.5, &midi, None));
        assert!(region.matches_note_off(1, 60, 100, 0.5, &midi, None));
    }

    #[test]
    fn keyswitch_gates_regions() {
        let midi = MidiState::new();
        let region = region_with(&[("sw_lokey", "24"), ("sw_hikey", "26"), ("sw_last", "25")]);
        assert!(region.key_is_keyswitch(24));
        assert!(!region.key_is_keyswitch(27));
        assert!(!region.matches_note_on(1, 60, 100, 0.5, &midi, None));
        assert!(!region.matches_note_on(1, 60, 100, 0.5, &midi, Some(24)));
        assert!(region.matches_note_on(1, 60, 100, 0.5, &midi, Some(25)));
    }

    #[test]
    fn velocity_gain_default_power_law() {
        let region = region_with(&[]);
        assert_eq!(region.velocity_gain(127), 1.0);
        let half = region.velocity_gain(64);
        assert!((half - (64.0f32 / 127.0).powi(2)).abs() < 1e-5);
    }

    #[test]
    fn velocity_gain_with_veltrack_zero_is_flat() {
        let region = region_with(&[("amp_veltrack", "0")]);
        for vel in [1u8, 64, 127] {
            assert_eq!(region.velocity_gain(vel), 1.0);
        }
    }

    #[test]
    fn velocity_gain_negative_veltrack_inverts() {
        let region = region_with(&[("amp_veltrack", "-100")]);
        assert!(region.velocity_gain(1) > region.velocity_gain(127));
    }

    #[test]
    fn user_velcurve_points_override() {
        let region = region_with(&[("amp_velcurve_64", "1.0")]);
        assert_eq!(region.velocity_gain(64), 1.0);
        // Linear between the implicit (0,0) anchor and the user point.
        assert!((region.velocity_gain(32) - 0.5).abs() < 0.02);
    }

    #[test]
    fn pitch_opcodes_compose() {
        let region = region_with(&[
            ("pitch_keycenter", "60"),
            ("transpose", "2"),
            ("tune", "15"),
            ("pitch_keytrack", "100"),
        ]);
        // One key above center: 100 + 200 + 15 cents.
        assert!((region.base_pitch_cents(61, 127) - 315.0).abs() < 1e-3);
        assert!((region.base_pitch_cents(60, 127) - 215.0).abs() < 1e-3);
    }

    #[test]
    fn bend_respects_range_and_step() {
        let region = region_with(&[("bend_up", "1200"), ("bend_down", "-100"), ("bend_step", "100")]);
        assert!((region.bend_cents(1.0) - 1200.0).abs() < 1e-3);
        assert!((region.bend_cents(-1.0) - (-100.0)).abs() < 1e-3);
        // Steps quantize.
        let stepped = region.bend_cents(0.5);
        assert_eq!(stepped % 100.0, 0.0);
    }

    #[test]
    fn filter_and_eq_slots_fill_in_order() {
        let region = region_with(&[
            ("fil_type", "lpf_4p"),
            ("cutoff", "800"),
            ("resonance", "6"),
            ("fil2_type", "hpf_2p"),
            ("cutoff2", "200"),
            ("eq1_freq", "100"),
            ("eq1_gain", "-3"),
            ("eq3_freq", "4000"),
            ("cutoff_oncc74", "2400"),
        ]);
        assert_eq!(region.filters.len(), 2);
        assert_eq!(region.filters[0].kind, FilterKind::Lpf4p);
        assert_eq!(region.filters[0].cutoff, 800.0);
        assert_eq!(region.filters[1].kind, FilterKind::Hpf2p);
        assert_eq!(region.filters[0].cutoff_cc[0].cc, 74);
        assert_eq!(region.filters[0].cutoff_cc[0].depth, 2400.0);

        assert_eq!(region.eqs.len(), 3);
        assert_eq!(region.eqs[0].frequency, 100.0);
        assert_eq!(region.eqs[0].gain, -3.0);
        // Band 2 kept its default center.
        assert_eq!(region.eqs[1].frequency, 500.0);
        assert_eq!(region.eqs[2].frequency, 4000.0);
    }

    #[test]
    fn lfo_opcodes_accumulate() {
        let region = region_with(&[
            ("lfo1_freq", "5"),
            ("lfo1_wave", "0"),
            ("lfo1_pitch", "50"),
            ("lfo2_freq", "0.5"),
            ("lfo2_cutoff", "1200"),
        ]);
        assert_eq!(region.lfos.len(), 2);
        assert_eq!(region.lfos[0].freq, 5.0);
        assert_eq!(region.lfos[0].subs[0].wave, LfoWave::Triangle);
        assert_eq!(
            region.lfos[0].targets[0],
            LfoTarget { destination: ModDestination::Pitch, depth: 50.0 }
        );
        assert_eq!(
            region.lfos[1].targets[0],
            LfoTarget { destination: ModDestination::Cutoff(1), depth: 1200.0 }
        );
    }

    #[test]
    fn generators_parse_as_sample_refs() {
        let sine = region_with(&[("sample", "*sine")]);
        assert_eq!(sine.sample, SampleRef::SineGenerator);
        let file = region_with(&[("sample", "kick.wav")]);
        assert_eq!(file.sample, SampleRef::File("kick.wav".into()));
        let nested = region_with(&[("sample", "samples\\piano\\c4.wav")]);
        assert_eq!(nested.sample, SampleRef::File("samples/piano/c4.wav".into()));
    }

    #[test]
    fn unknown_opcode_reports_false() {
        let mut region = Region::default();
        assert!(!region.apply_opcode(&Opcode::new("made_up_opcode", "1")));
    }

    #[test]
    fn loop_opcodes_compose() {
        let region = region_with(&[
            ("loop_mode", "loop_continuous"),
            ("loop_start", "20"),
            ("loop_end", "80"),
        ]);
        assert_eq!(region.loop_mode, Some(LoopMode::LoopContinuous));
        assert_eq!(region.loop_range, Some((20, 80)));
    }
}
