//! End-to-end render checks against known signals.

use std::path::Path;

use forzando::Synth;

fn rms(samples: &[f32]) -> f32 {
    (samples.iter().map(|&x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
}

fn zero_crossings(samples: &[f32]) -> usize {
    samples.windows(2).filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0)).count()
}

fn write_constant_wav(path: &Path, value: f32, frames: u32, sample_rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for _ in 0..frames {
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn sine_generator_level_and_frequency() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.set_sample_rate(48_000.0).unwrap();
    synth.set_samples_per_block(1024).unwrap();
    synth
        .load_sfz_string("<region> sample=*sine amp_veltrack=0", dir.path())
        .unwrap();
    assert_eq!(synth.get_num_regions(), 1);

    let mut left = vec![0.0f32; 1024];
    let mut right = vec![0.0f32; 1024];
    synth.note_on(0, 1, 69, 100);
    synth.render_block(&mut left, &mut right);

    // A 440 Hz sine at -6 dBFS: RMS = 10^(-6/20)/sqrt(2).
    let expected = 10f32.powf(-6.0 / 20.0) / std::f32::consts::SQRT_2;
    let measured = rms(&left);
    assert!(
        (measured / expected - 1.0).abs() < 0.01,
        "sine RMS {measured}, expected {expected}"
    );

    // Zero-crossing rate ~= 2 * 440 / 48000 per sample.
    let crossings = zero_crossings(&left);
    let expected_crossings = (2.0_f64 * 440.0 / 48_000.0 * 1023.0).round() as usize;
    assert!(
        crossings.abs_diff(expected_crossings) <= 2,
        "{crossings} crossings, expected about {expected_crossings}"
    );

    // Both channels carry the centered voice.
    assert!((rms(&right) / measured - 1.0).abs() < 1e-3);
}

#[test]
fn two_regions_mix_additively() {
    let dir = tempfile::tempdir().unwrap();
    write_constant_wav(&dir.path().join("s1.wav"), 0.25, 4000, 48_000);
    write_constant_wav(&dir.path().join("s2.wav"), -0.125, 4000, 48_000);
    let sfz = "<region> key=60 sample=s1.wav\n<region> key=62 sample=s2.wav";

    let render = |notes: &[(usize, u8)]| -> (Vec<f32>, usize) {
        let mut synth = Synth::new();
        synth.set_sample_rate(48_000.0).unwrap();
        synth.set_samples_per_block(1024).unwrap();
        synth.load_sfz_string(sfz, dir.path()).unwrap();
        let mut left = vec![0.0f32; 1024];
        let mut right = vec![0.0f32; 1024];
        for &(delay, key) in notes {
            synth.note_on(delay, 1, key, 100);
        }
        synth.render_block(&mut left, &mut right);
        (left, synth.get_num_active_voices())
    };

    let (both, active) = render(&[(0, 60), (100, 62)]);
    assert_eq!(active, 2, "both voices must be active at block end");

    let (only_first, _) = render(&[(0, 60)]);
    let (only_second, _) = render(&[(100, 62)]);

    for i in 0..1024 {
        let sum = only_first[i] + only_second[i];
        assert!(
            (both[i] - sum).abs() < 1e-6,
            "mix is not additive at frame {i}: {} vs {sum}",
            both[i]
        );
    }
}

#[test]
fn loop_continuous_position_law() {
    let dir = tempfile::tempdir().unwrap();
    write_constant_wav(&dir.path().join("looped.wav"), 0.5, 100, 48_000);
    let sfz = "<region> key=60 pitch_keycenter=60 sample=looped.wav \
               loop_mode=loop_continuous loop_start=20 loop_end=80";

    let mut synth = Synth::new();
    synth.set_sample_rate(48_000.0).unwrap();
    synth.set_samples_per_block(1000).unwrap();
    synth.load_sfz_string(sfz, dir.path()).unwrap();

    let mut left = vec![0.0f32; 1000];
    let mut right = vec![0.0f32; 1000];
    synth.note_on(0, 1, 60, 127);
    synth.render_block(&mut left, &mut right);

    // At pitch ratio 1, position[t] = 20 + (t - 20) mod 60 for t >= 20.
    let t = 1000u64;
    let expected = 20.0 + ((t - 20) % 60) as f64;
    let voice = synth.voice(0).expect("voice slot");
    assert!(voice.is_active(), "looping voice must stay alive");
    assert_eq!(voice.source_position(), expected);

    // And it keeps holding after another block.
    synth.render_block(&mut left, &mut right);
    let t = 2000u64;
    let expected = 20.0 + ((t - 20) % 60) as f64;
    assert_eq!(synth.voice(0).unwrap().source_position(), expected);
}

#[test]
fn zero_length_block_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.load_sfz_string("<region> sample=*sine", dir.path()).unwrap();
    synth.note_on(0, 1, 60, 100);
    let mut empty: [f32; 0] = [];
    let mut empty_r: [f32; 0] = [];
    synth.render_block(&mut empty, &mut empty_r);
    assert_eq!(synth.get_num_active_voices(), 1);
}

#[test]
fn note_on_velocity_zero_acts_as_note_off() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.set_samples_per_block(256).unwrap();
    synth.load_sfz_string("<region> sample=*sine ampeg_release=0.001", dir.path()).unwrap();

    let mut left = vec![0.0f32; 256];
    let mut right = vec![0.0f32; 256];
    synth.note_on(0, 1, 60, 100);
    synth.render_block(&mut left, &mut right);
    assert_eq!(synth.get_num_active_voices(), 1);

    synth.note_on(0, 1, 60, 0);
    synth.render_block(&mut left, &mut right);
    synth.render_block(&mut left, &mut right);
    assert_eq!(synth.get_num_active_voices(), 0, "velocity-0 note-on must release");
}

#[test]
fn master_volume_scales_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.set_samples_per_block(512).unwrap();
    synth.load_sfz_string("<region> sample=*sine amp_veltrack=0", dir.path()).unwrap();

    let mut left = vec![0.0f32; 512];
    let mut right = vec![0.0f32; 512];
    synth.note_on(0, 1, 69, 100);
    synth.render_block(&mut left, &mut right);
    let reference = rms(&left);

    synth.set_volume(-20.0);
    synth.render_block(&mut left, &mut right);
    let attenuated = rms(&left);
    assert!(
        (attenuated / reference - 0.1).abs() < 0.01,
        "-20 dB master must scale by 0.1: {attenuated} vs {reference}"
    );
}
