//! Logger setup for the station binary.
//!
//! Library code only uses the `log` macros; this installs `env_logger` with
//! the station's line format: `<time> - <thread> [LEVEL] message`.

use chrono::Local;
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Render one log line in the station format.
pub fn format_line(timestamp: &str, thread: &str, level: log::Level, message: &str) -> String {
    format!("{} - {:<10} [{}] {}", timestamp, thread, level, message)
}

/// Log file path for a station inside `log_dir`.
pub fn log_file_path(log_dir: &Path, station_name: &str) -> PathBuf {
    log_dir.join(format!("{}.log", station_name))
}

/// Install the global logger.
///
/// `RUST_LOG`, when set, takes precedence over `level`. With `log_file` set,
/// lines are appended to that file instead of stderr.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> io::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    builder.format(|buf, record| {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let current = std::thread::current();
        let line = format_line(
            &timestamp,
            current.name().unwrap_or("unnamed"),
            record.level(),
            &record.args().to_string(),
        );
        writeln!(buf, "{}", line)
    });

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // A second init (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
    Ok(())
}
