//! Control-thread reconfiguration against a running audio thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use forzando::{ConfigError, Synth};

#[test]
fn invalid_configurations_are_rejected() {
    let mut synth = Synth::new();
    assert!(matches!(synth.set_sample_rate(-1.0), Err(ConfigError::InvalidSampleRate(_))));
    assert!(matches!(synth.set_samples_per_block(0), Err(ConfigError::InvalidBlockSize(0))));
    assert!(matches!(
        synth.set_samples_per_block(1 << 20),
        Err(ConfigError::InvalidBlockSize(_))
    ));
    assert!(matches!(synth.set_num_voices(0), Err(ConfigError::InvalidVoiceCount(0))));
    assert!(matches!(synth.set_oversampling(3), Err(ConfigError::InvalidOversampling(3))));
    assert!(matches!(synth.set_preload_size(10), Err(ConfigError::InvalidPreloadSize(10))));

    // Rejections leave the engine as it was.
    assert_eq!(synth.get_num_voices(), 64);
    assert_eq!(synth.samples_per_block(), 1024);
}

#[test]
fn shrink_voice_pool_while_audio_thread_runs() {
    let dir = tempfile::tempdir().unwrap();
    let synth = Arc::new(Mutex::new(Synth::new()));
    {
        let mut locked = synth.lock().unwrap();
        locked.set_samples_per_block(512).unwrap();
        locked.set_num_voices(32).unwrap();
        locked.load_sfz_string("<region> sample=*sine volume=-40", dir.path()).unwrap();
        for (i, key) in (36..68).enumerate() {
            locked.note_on(i, 1, key, 100);
        }
        let mut left = vec![0.0f32; 512];
        let mut right = vec![0.0f32; 512];
        locked.render_block(&mut left, &mut right);
        assert_eq!(locked.get_num_active_voices(), 32);
    }

    // Audio thread renders continuously.
    let audio_synth = Arc::clone(&synth);
    let audio = std::thread::spawn(move || {
        let mut left = vec![0.0f32; 512];
        let mut right = vec![0.0f32; 512];
        for _ in 0..200 {
            audio_synth.lock().unwrap().render_block(&mut left, &mut right);
            std::thread::sleep(Duration::from_micros(200));
        }
    });

    // Control thread shrinks the pool mid-flight.
    std::thread::sleep(Duration::from_millis(5));
    synth.lock().unwrap().set_num_voices(8).unwrap();

    audio.join().unwrap();

    let mut locked = synth.lock().unwrap();
    assert_eq!(locked.get_num_voices(), 8);
    assert!(locked.get_num_active_voices() <= 8);

    // The engine keeps working after the reconfiguration.
    for (i, key) in (36..48).enumerate() {
        locked.note_on(i, 1, key, 100);
    }
    let mut left = vec![0.0f32; 512];
    let mut right = vec![0.0f32; 512];
    locked.render_block(&mut left, &mut right);
    assert!(locked.get_num_active_voices() > 0);
    assert!(locked.get_num_active_voices() <= 8);
    assert!(left.iter().any(|&x| x != 0.0), "audio did not resume after reconfiguration");
}

#[test]
fn sample_rate_change_resets_voices() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.load_sfz_string("<region> sample=*sine", dir.path()).unwrap();
    let mut left = vec![0.0f32; 1024];
    let mut right = vec![0.0f32; 1024];
    synth.note_on(0, 1, 60, 100);
    synth.render_block(&mut left, &mut right);
    assert_eq!(synth.get_num_active_voices(), 1);

    synth.set_sample_rate(44_100.0).unwrap();
    assert_eq!(synth.get_num_active_voices(), 0, "rate change must reset voices");

    // And the instrument still plays at the new rate.
    synth.note_on(0, 1, 69, 100);
    synth.render_block(&mut left, &mut right);
    assert!(left.iter().any(|&x| x.abs() > 1e-3));
}

#[test]
fn oversampling_factors_accepted_and_audible() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.set_samples_per_block(512).unwrap();
    synth.load_sfz_string("<region> sample=*sine amp_veltrack=0", dir.path()).unwrap();

    let mut reference = vec![0.0f32; 512];
    let mut right = vec![0.0f32; 512];
    synth.note_on(0, 1, 69, 100);
    synth.render_block(&mut reference, &mut right);
    let reference_rms =
        (reference.iter().map(|&x| x * x).sum::<f32>() / reference.len() as f32).sqrt();

    for factor in [2usize, 4, 8] {
        synth.set_oversampling(factor).unwrap();
        let mut left = vec![0.0f32; 512];
        synth.note_on(0, 1, 69, 100);
        synth.render_block(&mut left, &mut right);
        let rms = (left.iter().map(|&x| x * x).sum::<f32>() / left.len() as f32).sqrt();
        assert!(
            (rms / reference_rms - 1.0).abs() < 0.05,
            "oversampling {factor} changed the level: {rms} vs {reference_rms}"
        );
    }
}

#[test]
fn load_clears_previous_instrument() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.load_sfz_string("<region> sample=*sine\n<region> sample=*noise", dir.path()).unwrap();
    assert_eq!(synth.get_num_regions(), 2);

    let mut left = vec![0.0f32; 256];
    let mut right = vec![0.0f32; 256];
    synth.note_on(0, 1, 60, 100);
    synth.render_block(&mut left, &mut right);
    assert!(synth.get_num_active_voices() > 0);

    synth.load_sfz_string("<region> sample=*sine key=40", dir.path()).unwrap();
    assert_eq!(synth.get_num_regions(), 1);
    assert_eq!(synth.get_num_active_voices(), 0, "load must clear sounding voices");

    // The old key range no longer triggers.
    synth.note_on(0, 1, 60, 100);
    synth.render_block(&mut left, &mut right);
    assert_eq!(synth.get_num_active_voices(), 0);
}
