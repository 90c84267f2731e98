//! Inspects, builds and plays `.vtt` stimulus containers.

use clap::Parser;
use log::info;

use std::{error::Error, fs, path::Path, process::ExitCode, thread::sleep, time::Duration};

use vibrotrial::{
    args::{BuildCommand, PlayCommand, ShowCommand, VttArgs, VttCommand},
    device::{Device, DeviceProfile},
    protocol::SoundBite,
    signal::{phone_label, read_track, SignalPlayer},
    transport::connect,
    vtt_format::Stimulus,
};

// Example:
// cargo run --bin vttinfo -- build
//                            --phones   bat.phones.csv
//                            --pitch    bat.pitch.csv
//                            --loudness bat.loudness.csv
//                            --written  bat
//                            --out      bat.vtt

fn main() -> ExitCode {
    env_logger::init();
    let args = VttArgs::parse();

    let result = match args.command {
        VttCommand::Show(show) => show_files(&show),
        VttCommand::Build(build) => build_file(&build),
        VttCommand::Play(play) => play_file(&play),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("vttinfo: {error}");
            ExitCode::FAILURE
        }
    }
}

fn show_files(cmd: &ShowCommand) -> Result<(), Box<dyn Error>> {
    let mut failed = 0;
    for path in &cmd.files {
        let stimulus = match Stimulus::from_path(path) {
            Ok(stimulus) => stimulus,
            Err(error) => {
                println!("{}: INVALID ({error})", path.display());
                failed += 1;
                continue;
            }
        };

        println!("{}", path.display());
        println!("  written:   {}", stimulus.written_text());
        println!("  phonetic:  {}", stimulus.phonetic_text());
        println!(
            "  samples:   {} x {} ms = {} ms",
            stimulus.samples().len(),
            stimulus.sample_period(),
            stimulus.duration_ms()
        );
        println!("  preview:   {}", stimulus.phonetic_preview());
        match stimulus.audio_spec()? {
            Some(spec) => println!(
                "  audio:     {} ch, {} Hz, {} bit",
                spec.channels, spec.sample_rate, spec.bits_per_sample
            ),
            None => println!("  audio:     none"),
        }
        if let Err(error) = SoundBite::from_stimulus(&stimulus) {
            println!("  device:    cannot be played ({error})");
        }

        if cmd.samples {
            for (idx, sample) in stimulus.samples().iter().enumerate() {
                println!(
                    "  {idx:>6} {:>4} {:>3} {:>3}",
                    phone_label(sample.phone).unwrap_or("-"),
                    sample.pitch,
                    sample.intensity
                );
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {} files invalid", cmd.files.len()).into());
    }
    Ok(())
}

fn read_f64_track(path: &Path) -> Result<vibrotrial::signal::TimeSeries<f64>, Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    read_track(&text, |v| v.parse::<f64>().ok())
        .map_err(|error| format!("{}: {error}", path.display()).into())
}

fn build_file(cmd: &BuildCommand) -> Result<(), Box<dyn Error>> {
    let phones_text = fs::read_to_string(&cmd.phones)?;
    let phones = read_track(&phones_text, |v| {
        Some((!v.is_empty()).then(|| v.to_owned()))
    })
    .map_err(|error| format!("{}: {error}", cmd.phones.display()))?;
    let pitch = read_f64_track(&cmd.pitch)?;
    let loudness = read_f64_track(&cmd.loudness)?;

    let samples = SignalPlayer::new(phones, pitch, loudness)
        .to_samples(f64::from(cmd.period) / 1000.0)
        .ok_or_else(|| format!("period of {} ms is too short", cmd.period))?;
    let mut builder = Stimulus::builder()
        .set_period(cmd.period)
        .set_written_text(cmd.written.clone())
        .set_phonetic_text(cmd.phonetic.clone())
        .add_samples(samples);
    if let Some(audio) = &cmd.audio {
        builder = builder.embed_audio(fs::read(audio)?);
    }
    let stimulus = builder.build()?;
    stimulus.to_path(&cmd.outfile)?;

    info!("wrote {}", cmd.outfile.display());
    println!(
        "{}: {} samples, {} ms",
        cmd.outfile.display(),
        stimulus.samples().len(),
        stimulus.duration_ms()
    );
    Ok(())
}

fn play_file(cmd: &PlayCommand) -> Result<(), Box<dyn Error>> {
    let stimulus = Stimulus::from_path(&cmd.file)?;
    let bite = SoundBite::from_stimulus(&stimulus)?;

    let profile = DeviceProfile::for_generation(cmd.device_generation).with_baud_rate(cmd.baud);
    let mut device = Device::new(connect(&cmd.device, profile.baud_rate), profile);
    device.ping()?;
    device.load_sound_bite(bite)?;
    device.play_sound_bite(0)?;
    println!("playing {} on {}", cmd.file.display(), cmd.device);

    sleep(Duration::from_millis(stimulus.duration_ms()));
    device.stop()?;
    device.close();
    Ok(())
}
