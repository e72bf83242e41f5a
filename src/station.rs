//! Station lifecycle: sign-in, the scheduler loop, sign-off.

use crate::backend::{OutputBackend, RodioBackend};
use crate::config::StationConfig;
use crate::effect::{CancelToken, Fader};
use crate::error::{PlaybackError, StationError};
use crate::ledger::NormalizationLedger;
use crate::library::Library;
use crate::media_tool::MediaTool;
use crate::mixer::ChannelRegistry;
use crate::normalize::{BatchReport, NormalizationPipeline};
use crate::playback::{PlaybackEngine, PlaybackSettings};
use crate::runtime::{PlaybackEvent, PlaybackHandle, spawn_playback_runtime};
use crate::scheduler::{JobSchedule, StationJob};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often the main loop checks the job table.
const SCHEDULER_POLL: Duration = Duration::from_secs(1);

pub struct Station {
    config: StationConfig,
    library: Library,
    mixer: Arc<ChannelRegistry>,
    ledger: Arc<Mutex<NormalizationLedger>>,
    normalizer: Arc<NormalizationPipeline>,
    engine: Option<PlaybackEngine>,
    runtime: Option<(PlaybackHandle, JoinHandle<()>)>,
    cancel: CancelToken,
    schedule: JobSchedule,
    stop: Arc<AtomicBool>,
    signed_in_at: Option<DateTime<Local>>,
    signed_off: bool,
}

impl Station {
    /// Open the default audio device and build the station on it.
    pub fn open(config: StationConfig) -> Result<Self, StationError> {
        let backend = RodioBackend::open(&config.channels.names())?;
        Station::new(config, Arc::new(backend))
    }

    pub fn new(config: StationConfig, backend: Arc<dyn OutputBackend>) -> Result<Self, StationError> {
        config.validate()?;
        let library = Library::new(&config.paths.lib, &config.audio.formats);
        let mixer = Arc::new(ChannelRegistry::new(
            &config.channels.names(),
            backend,
            Fader::from_config(&config.audio),
        ));
        let ledger = Arc::new(Mutex::new(NormalizationLedger::open(&config.paths.db)?));
        let tool = MediaTool::new(&config.paths.bin, &config.loudness);
        let normalizer = Arc::new(NormalizationPipeline::new(
            tool.clone(),
            ledger.clone(),
            &config.loudness,
        )?);
        let engine = PlaybackEngine::new(
            mixer.clone(),
            library.clone(),
            PlaybackSettings::from_config(&config),
        )
        .with_normalizer(normalizer.clone())
        .with_probe(tool);
        let cancel = engine.cancel_token();

        Ok(Station {
            config,
            library,
            mixer,
            ledger,
            normalizer,
            engine: Some(engine),
            runtime: None,
            cancel,
            schedule: JobSchedule::new(),
            stop: Arc::new(AtomicBool::new(false)),
            signed_in_at: None,
            signed_off: false,
        })
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn mixer(&self) -> &Arc<ChannelRegistry> {
        &self.mixer
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn ledger(&self) -> &Arc<Mutex<NormalizationLedger>> {
        &self.ledger
    }

    /// Control handle for the playback thread, once signed in.
    pub fn handle(&self) -> Option<&PlaybackHandle> {
        self.runtime.as_ref().map(|(handle, _)| handle)
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in_at.is_some() && !self.signed_off
    }

    pub fn signed_in_at(&self) -> Option<DateTime<Local>> {
        self.signed_in_at
    }

    /// Setting this flag ends [`Station::run`] at its next poll.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Bring the station on air: check for an ID clip, repair and normalize
    /// the library, send a station ID and start the playback thread.
    pub fn sign_in(&mut self) -> Result<(), StationError> {
        if self.signed_off {
            return Err(StationError::Playback(PlaybackError::Device(
                "Station has signed off".into(),
            )));
        }
        let Some(mut engine) = self.engine.take() else {
            return Ok(());
        };
        let name = self.config.station.name.clone();
        log::warn!("{} signing on.", name);

        let id_channel = self.config.channels.station_id.clone();
        if !self.library.has_sounds(&id_channel) {
            log::error!("critical: No station ID sounds in '{}'; refusing to sign on.", id_channel);
            self.engine = Some(engine);
            return Err(StationError::NoStationId(id_channel));
        }

        let restored = self.library.recover_staged();
        if !restored.is_empty() {
            log::warn!("Recovered {} files from interrupted normalization", restored.len());
        }
        let report = self.normalizer.run_batch(&self.library);
        if report.aborted {
            log::warn!("Signing on with a partially normalized library");
        }

        if let Err(e) = engine.station_id() {
            log::error!("critical: Station ID failed: {}", e);
            self.mixer.pause();
        }

        let mixer = self.mixer.clone();
        let runtime = spawn_playback_runtime(engine, self.config.audio.tick(), move |evt| {
            match evt {
                PlaybackEvent::StationIdFailed(e) => {
                    log::error!("critical: Station ID failed: {}", e);
                    mixer.pause();
                }
                PlaybackEvent::PassComplete(category) => {
                    log::warn!("Playlist '{}' complete.", category)
                }
                PlaybackEvent::Advanced { .. } | PlaybackEvent::StationIdSent => {}
                PlaybackEvent::Error(e) => log::debug!("Playback error: {}", e),
            }
        });
        self.runtime = Some(runtime);

        let now = Local::now();
        self.schedule = JobSchedule::from_config(&self.config.schedule, now);
        self.signed_in_at = Some(now);
        log::warn!("{} signed on at {}.", name, now.format("%H:%M:%S"));
        Ok(())
    }

    /// Insert a station ID now. Failures are logged and pause the mixer.
    pub fn station_id(&mut self) {
        if let Some(handle) = self.handle() {
            handle.station_id();
        } else if let Some(engine) = self.engine.as_mut() {
            match engine.station_id() {
                Ok(()) => {}
                Err(PlaybackError::Paused) => log::warn!("Station ID skipped: output is paused"),
                Err(e) => {
                    log::error!("critical: Station ID failed: {}", e);
                    self.mixer.pause();
                }
            }
        }
    }

    fn dispatch(&mut self, job: StationJob) {
        log::debug!("Running job {}", job);
        match job {
            StationJob::StationId => self.station_id(),
            StationJob::Digest => {
                self.mixer.digest();
            }
            StationJob::VolumeGuard => {
                self.mixer.volume_guard(self.config.audio.volume_floor);
            }
        }
    }

    /// Sign in if needed, then run scheduled jobs until `until` elapses or
    /// the stop flag is set. Playback itself runs on its own thread.
    pub fn run(&mut self, until: Option<Duration>) -> Result<(), StationError> {
        if !self.is_signed_in() {
            self.sign_in()?;
        }
        let started = Instant::now();
        while !self.stop.load(Ordering::SeqCst) {
            let remaining = match until {
                Some(limit) => match limit.checked_sub(started.elapsed()) {
                    Some(r) if !r.is_zero() => r,
                    _ => break,
                },
                None => SCHEDULER_POLL,
            };
            for job in self.schedule.due(Local::now()) {
                self.dispatch(job);
            }
            std::thread::sleep(remaining.min(SCHEDULER_POLL));
        }
        Ok(())
    }

    /// Stop playback, release the audio device and persist the ledger.
    /// Safe to call more than once.
    pub fn sign_off(&mut self) -> Result<(), StationError> {
        if self.signed_off {
            return Ok(());
        }
        self.signed_off = true;
        log::warn!("{} signing off.", self.config.station.name);

        self.cancel.cancel();
        if let Some((handle, join)) = self.runtime.take() {
            handle.shutdown();
            if join.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
        self.mixer.destroy();
        self.normalizer.shutdown();
        self.ledger.lock().flush()?;
        log::warn!("{} signed off.", self.config.station.name);
        Ok(())
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        if self.signed_in_at.is_some() && !self.signed_off {
            if let Err(e) = self.sign_off() {
                log::error!("Sign off failed: {}", e);
            }
        }
    }
}

/// Repair and normalize the library without going on air.
pub fn normalize_library(config: &StationConfig) -> Result<BatchReport, StationError> {
    config.validate()?;
    let library = Library::new(&config.paths.lib, &config.audio.formats);
    let ledger = Arc::new(Mutex::new(NormalizationLedger::open(&config.paths.db)?));
    let tool = MediaTool::new(&config.paths.bin, &config.loudness);
    let pipeline = NormalizationPipeline::new(tool, ledger.clone(), &config.loudness)?;

    library.recover_staged();
    let report = pipeline.run_batch(&library);
    pipeline.shutdown();
    ledger.lock().flush()?;
    Ok(report)
}
