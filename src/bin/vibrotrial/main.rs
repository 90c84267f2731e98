//! Runs one experiment session in the terminal, or with a simulated subject.

use clap::Parser;
use log::{error, info, warn};
use rand::{rngs::StdRng, SeedableRng};

use std::{error::Error, path::PathBuf, process::ExitCode};

use vibrotrial::{
    args::EvalArgs,
    checkpoint::{CheckpointError, CheckpointStore, Snapshot},
    component::DeviceWorker,
    data_logger::{file_stamp, DataLogger},
    device::{Device, DeviceLink, DeviceProfile},
    engine::{Engine, EngineBuilder, Frontend, RunOutcome, StagePlan},
    execution_log,
    gui::{device_selector, TerminalPresenter},
    library::StimulusLibrary,
    scenario::Scenario,
    simulate::{SimulatedFrontend, SimulatedSubject},
    transport::{available_ports, connect, Endpoint},
};

// Example:
// cargo run --bin vibrotrial --
//                            --facilitator ann
//                            --pid         7
//                            --condition   quiet
//                            --scenario    scenarios/words.ron
//                            --device      /dev/ttyUSB0

fn main() -> ExitCode {
    let args = EvalArgs::parse();
    match run(args) {
        Ok((RunOutcome::Completed, log)) => {
            eprintln!("session complete, data in {}", log.display());
            ExitCode::SUCCESS
        }
        Ok((RunOutcome::Aborted, log)) => {
            eprintln!("session stopped, progress saved, data in {}", log.display());
            ExitCode::from(2)
        }
        Err(error) => {
            error!("{error}");
            eprintln!("vibrotrial: {error}");
            ExitCode::FAILURE
        }
    }
}

fn spawn_device(endpoint: &Endpoint, profile: DeviceProfile) -> Box<dyn DeviceLink> {
    let device = Device::new(connect(endpoint, profile.baud_rate), profile);
    Box::new(DeviceWorker::spawn(device, profile.reply_timeout))
}

/// Everything the engine needs besides the front-end.
struct Session {
    plan: StagePlan,
    snapshot: Option<Snapshot>,
    unusable: Option<CheckpointError>,
    logger: DataLogger,
    store: CheckpointStore,
    library: StimulusLibrary,
    profile: DeviceProfile,
}

fn drive<F: Frontend>(builder: EngineBuilder<F>, session: Session) -> Result<RunOutcome, Box<dyn Error>> {
    let profile = session.profile;
    let mut engine = builder
        .set_logger(session.logger)
        .set_checkpoints(session.store)
        .set_library(session.library)
        .set_connector(move |endpoint: &Endpoint| spawn_device(endpoint, profile))
        .build();

    match &session.unusable {
        Some(error) => engine.start_over(session.plan, error)?,
        None => engine.start(session.plan, session.snapshot)?,
    }
    let outcome = engine.run()?;
    info!(
        "session ended {outcome:?} after {} completed stages",
        engine.completed().len()
    );
    Ok(outcome)
}

fn run(args: EvalArgs) -> Result<(RunOutcome, PathBuf), Box<dyn Error>> {
    let scenario = Scenario::from_path(&args.scenario)?;
    let session = args.session(&scenario.experiment);
    let profile = args.profile();

    let store = CheckpointStore::new(&args.state_dir, session.key());
    let (snapshot, unusable) = match store.load() {
        Ok(snapshot) => (snapshot, None),
        Err(error) => (None, Some(error)),
    };

    let log_path = snapshot
        .as_ref()
        .and_then(|s| s.log_path.clone())
        .unwrap_or_else(|| DataLogger::path_for(&args.data_dir, &session, &file_stamp()));
    let base = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(file_stamp);
    execution_log::init(execution_log::log_path(
        args.data_dir.join("executionLogs"),
        &base,
    ))?;
    info!("{session:?} with {profile:?}");

    if let Some(error) = &unusable {
        warn!("saved state is unusable, starting over: {error}");
        if let Err(error) = store.quarantine() {
            warn!("could not move the saved state aside: {error}");
        }
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    info!("seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);
    let mut library = StimulusLibrary::new();
    let plan = scenario.build(&session.subject, &mut rng, &mut library)?;

    let endpoint = match (&args.device, args.simulate) {
        (Some(endpoint), _) => endpoint.clone(),
        (None, true) => Endpoint::Null,
        (None, false) => match device_selector(available_ports()?)? {
            Some(endpoint) => endpoint,
            None => {
                warn!("no device picked");
                return Ok((RunOutcome::Aborted, log_path));
            }
        },
    };
    info!("using device {endpoint}");

    let logger = DataLogger::open(&log_path, session.clone())?;
    let device = spawn_device(&endpoint, profile);
    let parts = Session {
        plan,
        snapshot,
        unusable,
        logger,
        store,
        library,
        profile,
    };

    let outcome = if args.simulate {
        let subject = SimulatedSubject::new(StdRng::seed_from_u64(seed.wrapping_add(1)), args.accuracy);
        let builder = Engine::builder(session, SimulatedFrontend::new(subject), device).virtual_clock();
        drive(builder, parts)?
    } else {
        let builder = Engine::builder(session, TerminalPresenter::new()?, device);
        drive(builder, parts)?
    };
    Ok((outcome, log_path))
}
