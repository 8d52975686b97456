//! The render path must not allocate once an instrument is loaded.
//!
//! This lives in its own test binary: the buffer counters are
//! process-global, so concurrently running engine tests would perturb the
//! before/after comparison.

use forzando::Synth;

#[test]
fn render_path_does_not_allocate_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let mut synth = Synth::new();
    synth.set_sample_rate(48_000.0).unwrap();
    synth.set_samples_per_block(512).unwrap();
    synth.load_sfz_string("<region> sample=*sine", dir.path()).unwrap();

    let mut left = vec![0.0f32; 512];
    let mut right = vec![0.0f32; 512];
    synth.note_on(0, 1, 60, 100);
    synth.render_block(&mut left, &mut right);

    let buffers_before = synth.get_num_buffers();
    let bytes_before = synth.get_num_bytes();
    for i in 0..20 {
        synth.note_on(0, 1, 60 + (i % 12) as u8, 100);
        synth.render_block(&mut left, &mut right);
    }
    assert_eq!(synth.get_num_buffers(), buffers_before, "render path allocated buffers");
    assert_eq!(synth.get_num_bytes(), bytes_before);
}
