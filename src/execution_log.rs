//! Diagnostic log of a session run, one file per session next to the data
//! log. This crate logs at `debug` by default, other crates are silent
//! unless `RUST_LOG` says otherwise.

use env_logger::{Builder, Env, Target};
use log::{debug, Level};

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "vibrotrial=debug";

/// Where the execution log for a data log named `base` goes.
pub fn log_path(dir: impl AsRef<Path>, base: &str) -> PathBuf {
    dir.as_ref().join(format!("{base}.log"))
}

/// One line of the execution log.
pub fn format_line(
    timestamp: &str,
    level: Level,
    file: Option<&str>,
    line: Option<u32>,
    message: &dyn std::fmt::Display,
) -> String {
    let file = file
        .and_then(|f| Path::new(f).file_name())
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "?".to_owned());
    format!(
        "[{timestamp}][{level}][{file}:{}] {message}",
        line.unwrap_or(0)
    )
}

/// Sends the `log` macros to `path`, appending. Creates the parent
/// directories. If a logger is already installed it stays in place.
pub fn init(path: impl AsRef<Path>) -> Result<PathBuf, io::Error> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let installed = Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER))
        .target(Target::Pipe(Box::new(file)))
        .format(|buf, record| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
            writeln!(
                buf,
                "{}",
                format_line(
                    &timestamp.to_string(),
                    record.level(),
                    record.file(),
                    record.line(),
                    record.args()
                )
            )
        })
        .try_init();

    if installed.is_ok() {
        debug!("execution log at {}", path.display());
    }
    Ok(path.to_path_buf())
}
