//! Error types for the station engine.
//!
//! One enum per concern; `StationError` wraps them for the sign-in/sign-off
//! surface. Per-file errors are logged at the file boundary and never reach
//! the main loop.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while driving channels and playing sounds.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The audio output device is missing or the backend has shut down.
    #[error("Audio device unavailable: {0}")]
    Device(String),

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Cannot open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot decode '{}': {reason}", path.display())]
    Decode { path: PathBuf, reason: String },

    #[error("No station ID clip available in '{0}'")]
    NoStationId(String),

    #[error("Index {index} out of range (queue has {len} items)")]
    OutOfRange { index: usize, len: usize },

    #[error("Output is paused")]
    Paused,
}

impl PlaybackError {
    /// True for failures of the output itself rather than of a single file.
    pub fn is_device(&self) -> bool {
        matches!(self, PlaybackError::Device(_))
    }
}

/// Errors from the external media tool and the normalization transaction.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid target loudness {0} LUFS (must be <= 0)")]
    InvalidTarget(f64),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission error on '{}': {source}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{}' exited with status {code}", program.display())]
    ToolFailed { program: PathBuf, code: i32 },

    #[error("Unreadable tool report: {0}")]
    Report(String),

    #[error("'{}' did not finish in time and was killed", program.display())]
    TimedOut { program: PathBuf },

    #[error("'{}' was cancelled", program.display())]
    Cancelled { program: PathBuf },
}

impl NormalizeError {
    /// Classify an I/O error on `path`, separating permission problems.
    pub fn from_io(path: &std::path::Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            NormalizeError::Permission {
                path: path.to_path_buf(),
                source,
            }
        } else {
            NormalizeError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Normalization ledger persistence errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt ledger '{}': {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// H:MM:SS conversion errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeError {
    #[error("Duration must be non-negative")]
    Negative,

    #[error("Malformed duration '{0}' (expected H:MM:SS)")]
    Malformed(String),
}

/// Top-level station lifecycle errors.
#[derive(Debug, Error)]
pub enum StationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    /// Startup-fatal: the station may not sign in without an ID clip.
    #[error("No station ID sound available in category '{0}'")]
    NoStationId(String),
}
