use crate::config::{JobConfig, ScheduleConfig};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use std::fmt;

/// Periodic station duties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StationJob {
    /// Insert a station ID into the primary channel.
    StationId,
    /// Log what every busy channel is playing.
    Digest,
    /// Restore channels left at a near-silent volume.
    VolumeGuard,
}

impl fmt::Display for StationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationJob::StationId => write!(f, "station-id"),
            StationJob::Digest => write!(f, "digest"),
            StationJob::VolumeGuard => write!(f, "volume-guard"),
        }
    }
}

impl StationJob {
    /// Parse a job name (case-insensitive, accepts hyphens or underscores).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "station-id" | "stationid" | "id" => Ok(StationJob::StationId),
            "digest" => Ok(StationJob::Digest),
            "volume-guard" | "guard" => Ok(StationJob::VolumeGuard),
            _ => Err(format!(
                "Unknown job '{}'. Expected: station-id, digest, volume-guard",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub job: StationJob,
    /// Interval in minutes; runs land on multiples of it since local midnight.
    pub interval_mins: u32,
    pub next_due: DateTime<Local>,
}

/// First interval boundary strictly after `now`.
pub fn next_boundary(now: DateTime<Local>, interval_mins: u32) -> DateTime<Local> {
    let interval = i64::from(interval_mins.max(1)) * 60;
    let since_midnight = i64::from(now.num_seconds_from_midnight());
    let wait = interval - since_midnight % interval;
    let truncated = now.with_nanosecond(0).unwrap_or(now);
    truncated + ChronoDuration::seconds(wait)
}

/// The table of enabled periodic jobs.
#[derive(Debug, Clone, Default)]
pub struct JobSchedule {
    jobs: Vec<PeriodicJob>,
}

impl JobSchedule {
    pub fn new() -> Self {
        JobSchedule::default()
    }

    /// Arm every enabled job from the config, first run at its next boundary.
    pub fn from_config(config: &ScheduleConfig, now: DateTime<Local>) -> Self {
        let mut schedule = JobSchedule::new();
        let entries: [(StationJob, &JobConfig); 3] = [
            (StationJob::StationId, &config.station_id),
            (StationJob::Digest, &config.digest),
            (StationJob::VolumeGuard, &config.volume_guard),
        ];
        for (job, cfg) in entries {
            if cfg.enabled {
                schedule.add(job, cfg.interval_mins, now);
            }
        }
        schedule
    }

    pub fn add(&mut self, job: StationJob, interval_mins: u32, now: DateTime<Local>) {
        self.jobs.retain(|j| j.job != job);
        self.jobs.push(PeriodicJob {
            job,
            interval_mins,
            next_due: next_boundary(now, interval_mins),
        });
    }

    pub fn jobs(&self) -> &[PeriodicJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs due at `now`, re-armed for their next boundary. A job that missed
    /// several boundaries (e.g. while the station ID held the loop) runs once.
    pub fn due(&mut self, now: DateTime<Local>) -> Vec<StationJob> {
        let mut due = Vec::new();
        for entry in self.jobs.iter_mut() {
            if now >= entry.next_due {
                due.push(entry.job);
                entry.next_due = next_boundary(now, entry.interval_mins);
            }
        }
        due
    }

    /// Earliest upcoming run.
    pub fn next_due(&self) -> Option<DateTime<Local>> {
        self.jobs.iter().map(|j| j.next_due).min()
    }
}
