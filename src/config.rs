//! Station configuration.
//!
//! Deserialized once from YAML at startup, validated, then handed to the
//! components that need it. Every section carries `#[serde(default)]`, so a
//! partial document only overrides what it names.

use crate::error::ConfigError;
use crate::queue::PlayMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub station: StationSection,
    pub paths: PathsConfig,
    pub channels: ChannelsConfig,
    pub audio: AudioConfig,
    pub loudness: LoudnessConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    pub name: String,
}

impl Default for StationSection {
    fn default() -> Self {
        StationSection {
            name: "WRPI".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Library root; one subdirectory per category.
    pub lib: PathBuf,
    /// Directory holding ffmpeg/ffprobe. Empty means "look on PATH".
    pub bin: PathBuf,
    /// Normalization ledger document.
    pub db: PathBuf,
    /// Log directory. Unset logs to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            lib: PathBuf::from("lib"),
            bin: PathBuf::from("bin"),
            db: PathBuf::from("db.json"),
            log: None,
        }
    }
}

/// Channel names. Each library category plays on the channel of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub station_id: String,
    pub primary: String,
    pub extra: Vec<String>,
    /// User defined show types, one channel each.
    pub user: Vec<String>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        ChannelsConfig {
            station_id: "stationID".to_string(),
            primary: "show".to_string(),
            extra: vec!["fill".to_string(), "PSA".to_string()],
            user: Vec::new(),
        }
    }
}

impl ChannelsConfig {
    /// All channel names in mixer order.
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![self.station_id.clone(), self.primary.clone()];
        names.extend(self.extra.iter().cloned());
        names.extend(self.user.iter().cloned());
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Fade length in milliseconds.
    pub transition_ms: u64,
    /// Interval between volume updates during a fade.
    pub fade_step_ms: u64,
    /// Primary channel volume multiplier while a station ID plays.
    pub suppression_factor: f32,
    /// Station IDs longer than this pause the primary channel outright.
    pub long_id_threshold_secs: f64,
    /// How often the station ID routine checks whether the clip finished.
    pub id_poll_ms: u64,
    /// Playback loop tick.
    pub tick_ms: u64,
    /// Number of upcoming queue entries decoded ahead of time.
    pub lookahead: usize,
    /// Accepted file extensions, without the dot.
    pub formats: Vec<String>,
    /// Initial play mode of the primary queue.
    pub mode: PlayMode,
    /// Volume guard restores unmuted channels found below this level.
    pub volume_floor: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            transition_ms: 1000,
            fade_step_ms: 10,
            suppression_factor: 0.3,
            long_id_threshold_secs: 10.0,
            id_poll_ms: 1000,
            tick_ms: 1000,
            lookahead: 1,
            formats: ["mp3", "wav", "ogg", "m4a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mode: PlayMode::Loop,
            volume_floor: 0.05,
        }
    }
}

impl AudioConfig {
    pub fn transition(&self) -> Duration {
        Duration::from_millis(self.transition_ms)
    }

    pub fn fade_step(&self) -> Duration {
        Duration::from_millis(self.fade_step_ms)
    }

    pub fn long_id_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.long_id_threshold_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn id_poll(&self) -> Duration {
        Duration::from_millis(self.id_poll_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// EBU R128 loudness normalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoudnessConfig {
    /// Integrated loudness target in LUFS.
    pub target_lufs: f64,
    /// Files measured within this many LU of the target are left alone.
    pub tolerance_lufs: f64,
    /// Loudness range target (LRA).
    pub range_lu: f64,
    /// True-peak ceiling in dBTP.
    pub true_peak_db: f64,
    pub bitrate: String,
    pub output_format: String,
    /// Worker pool size; 0 uses the available core count.
    pub workers: usize,
    /// Per-file limit on the external tool before it is killed.
    pub worker_timeout_secs: u64,
    /// Wait for a whole library batch before abandoning it. 0 scales the
    /// per-file limit by the number of rounds the pool needs.
    pub batch_timeout_secs: u64,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        LoudnessConfig {
            target_lufs: -23.0,
            tolerance_lufs: 1.5,
            range_lu: 7.0,
            true_peak_db: -2.0,
            bitrate: "192k".to_string(),
            output_format: "mp3".to_string(),
            workers: 0,
            worker_timeout_secs: 600,
            batch_timeout_secs: 0,
        }
    }
}

impl LoudnessConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_secs > 0).then(|| Duration::from_secs(self.batch_timeout_secs))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: bool,
    pub interval_mins: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            enabled: true,
            interval_mins: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub station_id: JobConfig,
    pub digest: JobConfig,
    pub volume_guard: JobConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            station_id: JobConfig {
                enabled: true,
                interval_mins: 60,
            },
            digest: JobConfig {
                enabled: true,
                interval_mins: 5,
            },
            volume_guard: JobConfig {
                enabled: true,
                interval_mins: 1,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`. `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl StationConfig {
    /// Load and validate a YAML config. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!(
                "Config '{}' not found, using built-in defaults",
                path.display()
            );
            let config = StationConfig::default();
            config.validate()?;
            return Ok(config);
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: StationConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let names = self.channels.names();
        let mut seen = HashSet::new();
        for name in &names {
            if name.trim().is_empty() {
                return invalid("channel names must not be empty".into());
            }
            if !seen.insert(name.as_str()) {
                return invalid(format!("duplicate channel '{}'", name));
            }
        }

        let audio = &self.audio;
        if !(0.0..=1.0).contains(&audio.suppression_factor) {
            return invalid(format!(
                "suppression_factor {} outside [0, 1]",
                audio.suppression_factor
            ));
        }
        if !(0.0..=1.0).contains(&audio.volume_floor) {
            return invalid(format!("volume_floor {} outside [0, 1]", audio.volume_floor));
        }
        if audio.transition_ms > 0 && audio.fade_step_ms == 0 {
            return invalid("fade_step_ms must be positive when transition_ms is set".into());
        }
        if audio.formats.is_empty() {
            return invalid("at least one audio format is required".into());
        }
        if !audio.long_id_threshold_secs.is_finite() || audio.long_id_threshold_secs < 0.0 {
            return invalid("long_id_threshold_secs must be a non-negative number".into());
        }

        let loudness = &self.loudness;
        for (name, value) in [
            ("target_lufs", loudness.target_lufs),
            ("tolerance_lufs", loudness.tolerance_lufs),
            ("range_lu", loudness.range_lu),
            ("true_peak_db", loudness.true_peak_db),
        ] {
            if !value.is_finite() {
                return invalid(format!("{} must be a finite number, got {}", name, value));
            }
        }
        if loudness.target_lufs > 0.0 {
            return invalid(format!(
                "target loudness {} LUFS must be <= 0",
                loudness.target_lufs
            ));
        }
        if loudness.tolerance_lufs < 0.0 {
            return invalid("tolerance_lufs must be non-negative".into());
        }
        if loudness.bitrate.trim().is_empty() || loudness.output_format.trim().is_empty() {
            return invalid("bitrate and output_format are required".into());
        }

        if self.logging.level.parse::<log::LevelFilter>().is_err() {
            return invalid(format!("unknown log level '{}'", self.logging.level));
        }
        Ok(())
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.logging
            .level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}
