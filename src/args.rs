// Commandline argument parsers using clap for the two binaries

use clap::{Args, Parser, Subcommand};

use std::path::PathBuf;

use crate::device::{DeviceGeneration, DeviceProfile};
use crate::session::SessionInfo;
use crate::transport::Endpoint;

/// Runs one experiment session.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct EvalArgs {
    /// Who runs the session
    #[arg(short = 'f', long)]
    pub facilitator: String,

    /// Participant id. Odd ids get counterbalanced block order
    #[arg(short = 'p', long)]
    pub pid: String,

    /// Experimental condition label
    #[arg(short = 'c', long)]
    pub condition: String,

    /// Scenario file (RON) describing the experiment
    #[arg(short = 's', long)]
    pub scenario: PathBuf,

    /// Device to use: a serial path, tcp://host:port or null. Asked for
    /// interactively when omitted
    #[arg(short = 'd', long)]
    pub device: Option<Endpoint>,

    /// Answer every trial with a simulated subject, without a device
    #[arg(long)]
    pub simulate: bool,

    /// How often the simulated subject picks the target
    #[arg(long, default_value_t = 0.8)]
    pub accuracy: f64,

    /// Hardware revision, selects the intensity floor
    #[arg(long, value_enum, default_value_t = DeviceGeneration::V2)]
    pub device_generation: DeviceGeneration,

    /// Overrides the generation's intensity floor
    #[arg(long)]
    pub intensity_floor: Option<u8>,

    /// Serial line speed
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,

    /// How long a device command may take, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub reply_timeout_ms: u64,

    /// Where data logs and execution logs go
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Where session checkpoints go
    #[arg(long, default_value = "states")]
    pub state_dir: PathBuf,

    /// Seed for shuffling and the simulated subject
    #[arg(long)]
    pub seed: Option<u64>,
}

impl EvalArgs {
    /// The session these arguments describe, for the given experiment type.
    pub fn session(&self, experiment: &str) -> SessionInfo {
        SessionInfo {
            subject: self.pid.clone(),
            condition: self.condition.clone(),
            facilitator: self.facilitator.clone(),
            experiment: experiment.to_owned(),
        }
    }

    /// Calibration from the generation, floor override, baud rate and
    /// timeout.
    pub fn profile(&self) -> DeviceProfile {
        let profile = DeviceProfile::for_generation(self.device_generation)
            .with_baud_rate(self.baud)
            .with_timeout(std::time::Duration::from_millis(self.reply_timeout_ms));
        match self.intensity_floor {
            Some(floor) => profile.with_floor(floor),
            None => profile,
        }
    }
}

/// Inspects and builds `.vtt` stimulus containers.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct VttArgs {
    #[command(subcommand)]
    /// What to do
    pub command: VttCommand,
}

#[derive(Debug, Subcommand, Clone)]
/// `vttinfo` subcommands.
pub enum VttCommand {
    /// Print the header, a phonetic preview and embedded audio details
    #[command(about)]
    Show(ShowCommand),

    /// Build a container from phone, pitch and loudness tracks
    #[command(about)]
    Build(BuildCommand),

    /// Send a container to a device and play it
    #[command(about)]
    Play(PlayCommand),
}

#[derive(Debug, Args, Clone)]
/// Arguments of `vttinfo show`.
pub struct ShowCommand {
    /// Containers to inspect
    #[clap(num_args = 1..)]
    pub files: Vec<PathBuf>,

    /// Also list every sample
    #[arg(long)]
    pub samples: bool,
}

#[derive(Debug, Args, Clone)]
/// Arguments of `vttinfo build`.
pub struct BuildCommand {
    /// `time,phone` track; an empty phone is silence
    #[arg(long)]
    pub phones: PathBuf,

    /// `time,hz` pitch track
    #[arg(long)]
    pub pitch: PathBuf,

    /// `time,value` loudness track
    #[arg(long)]
    pub loudness: PathBuf,

    /// Sample period in milliseconds
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub period: u32,

    /// Written transcription
    #[arg(long, default_value = "")]
    pub written: String,

    /// Phonetic transcription
    #[arg(long, default_value = "")]
    pub phonetic: String,

    /// WAV file to embed
    #[arg(long)]
    pub audio: Option<PathBuf>,

    /// Filename for the container to be written to
    #[arg(short = 'o', long = "out")]
    pub outfile: PathBuf,
}

#[derive(Debug, Args, Clone)]
/// Arguments of `vttinfo play`.
pub struct PlayCommand {
    /// Container to play
    pub file: PathBuf,

    /// Device to use: a serial path, tcp://host:port or null
    #[arg(short = 'd', long)]
    pub device: Endpoint,

    /// Hardware revision, selects the intensity floor
    #[arg(long, value_enum, default_value_t = DeviceGeneration::V2)]
    pub device_generation: DeviceGeneration,

    /// Serial line speed
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_args_build_profile_and_session() {
        let args = EvalArgs::parse_from([
            "vibrotrial",
            "-f",
            "ann",
            "-p",
            "7",
            "-c",
            "noise",
            "-s",
            "words.ron",
            "--device",
            "tcp://localhost:9000",
            "--device-generation",
            "v1",
        ]);

        assert_eq!(args.device, Some(Endpoint::Tcp("localhost:9000".to_owned())));
        assert_eq!(args.profile().intensity_floor, 200);
        assert_eq!(args.profile().baud_rate, 115200);
        assert_eq!(args.session("words").subject, "7");
        assert_eq!(args.data_dir, PathBuf::from("data"));

        let args = EvalArgs::parse_from([
            "vibrotrial",
            "-f",
            "ann",
            "-p",
            "7",
            "-c",
            "noise",
            "-s",
            "words.ron",
            "--intensity-floor",
            "100",
            "--simulate",
        ]);
        assert_eq!(args.profile().intensity_floor, 100);
        assert!(args.simulate);
        assert_eq!(args.device, None);
    }

    #[test]
    fn vtt_args_parse_subcommands() {
        let args = VttArgs::parse_from(["vttinfo", "play", "a.vtt", "-d", "null"]);
        match args.command {
            VttCommand::Play(play) => assert_eq!(play.device, Endpoint::Null),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn build_period_must_be_positive() {
        let build = |period: &'static str| {
            VttArgs::try_parse_from([
                "vttinfo", "build", "--phones", "p.csv", "--pitch", "f.csv", "--loudness",
                "l.csv", "--period", period, "-o", "out.vtt",
            ])
        };
        assert!(build("0").is_err());
        match build("5").map(|args| args.command) {
            Ok(VttCommand::Build(cmd)) => assert_eq!(cmd.period, 5),
            other => panic!("unexpected {other:?}"),
        }
    }
}
