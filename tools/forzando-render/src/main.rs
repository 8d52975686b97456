//! Offline instrument renderer.
//!
//! Loads an SFZ instrument, fires a set of notes, renders blocks until the
//! requested duration, and writes the mix to a stereo WAV file. Useful for
//! regression-checking instruments without a plugin host.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forzando::Synth;

#[derive(Parser)]
#[command(name = "forzando-render", about = "Render an SFZ instrument to a WAV file")]
struct Args {
    /// Instrument file to load
    sfz: PathBuf,

    /// Output WAV path
    #[arg(short, long, default_value = "render.wav")]
    output: PathBuf,

    /// MIDI keys to play, comma separated (e.g. "60,64,67")
    #[arg(short, long, default_value = "60")]
    keys: String,

    /// Note velocity (1-127)
    #[arg(short, long, default_value_t = 100)]
    velocity: u8,

    /// Seconds each note is held
    #[arg(long, default_value_t = 1.0)]
    hold: f32,

    /// Total seconds to render (includes release tails)
    #[arg(short, long, default_value_t = 2.0)]
    duration: f32,

    /// Output sample rate
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,

    /// Frames per render block
    #[arg(long, default_value_t = 1024)]
    block_size: usize,

    /// Voice pool size
    #[arg(long, default_value_t = 64)]
    voices: usize,

    /// Write a per-block CSV log next to the output
    #[arg(long)]
    log: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let keys: Vec<u8> = args
        .keys
        .split(',')
        .map(|k| k.trim().parse::<u8>().context("keys must be MIDI note numbers"))
        .collect::<Result<_>>()?;
    if keys.is_empty() {
        bail!("no keys to play");
    }

    let mut synth = Synth::new();
    synth.set_sample_rate(args.sample_rate as f32)?;
    synth.set_samples_per_block(args.block_size)?;
    synth.set_num_voices(args.voices)?;
    synth
        .load_sfz_file(&args.sfz)
        .with_context(|| format!("loading {}", args.sfz.display()))?;
    info!(
        "loaded {} regions, {} preloaded samples",
        synth.get_num_regions(),
        synth.get_num_preloaded_samples()
    );
    if !synth.get_unknown_opcodes().is_empty() {
        info!("unknown opcodes: {:?}", synth.get_unknown_opcodes());
    }
    if args.log {
        let prefix = args.output.with_extension("").to_string_lossy().into_owned();
        synth.enable_logging(&prefix)?;
    }

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: args.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer =
        hound::WavWriter::create(&args.output, spec).context("creating output file")?;

    let total_frames = (args.duration * args.sample_rate as f32) as usize;
    let hold_frames = (args.hold * args.sample_rate as f32) as usize;
    let mut left = vec![0.0f32; args.block_size];
    let mut right = vec![0.0f32; args.block_size];

    for &key in &keys {
        synth.note_on(0, 1, key, args.velocity);
    }

    let mut rendered = 0usize;
    let mut notes_released = false;
    while rendered < total_frames {
        let frames = args.block_size.min(total_frames - rendered);
        if !notes_released && rendered + frames > hold_frames {
            let offset = hold_frames.saturating_sub(rendered).min(frames.saturating_sub(1));
            for &key in &keys {
                synth.note_off(offset, 1, key, 0);
            }
            notes_released = true;
        }
        synth.render_block(&mut left[..frames], &mut right[..frames]);
        for i in 0..frames {
            writer.write_sample(left[i])?;
            writer.write_sample(right[i])?;
        }
        rendered += frames;
    }

    writer.finalize()?;
    info!(
        "rendered {:.2}s ({} frames) to {}",
        args.duration,
        total_frames,
        args.output.display()
    );
    Ok(())
}
