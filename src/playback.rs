//! Per-channel playback: queue advance, preloading, playlist edits and the
//! station ID routine.
//!
//! `PlaybackEngine` is not shared between threads. It is owned by the
//! playback runtime thread (see `runtime`), which is the only place queue
//! state is mutated.

use crate::config::StationConfig;
use crate::effect::{CancelToken, FadeOutcome};
use crate::error::PlaybackError;
use crate::library::Library;
use crate::media_tool::{MediaTool, PROBE_TIMEOUT, RunLimit};
use crate::mixer::{Bus, ChannelRegistry};
use crate::normalize::NormalizationPipeline;
use crate::queue::{Advance, PlayMode, PlaybackQueue, QueueSnapshot};
use crate::sound::Sound;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Timing and naming knobs the engine reads from the station config.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub primary: String,
    pub station_id_channel: String,
    pub suppression_factor: f32,
    pub long_id_threshold: Duration,
    pub id_poll: Duration,
    pub lookahead: usize,
    pub mode: PlayMode,
}

impl PlaybackSettings {
    pub fn from_config(config: &StationConfig) -> Self {
        PlaybackSettings {
            primary: config.channels.primary.clone(),
            station_id_channel: config.channels.station_id.clone(),
            suppression_factor: config.audio.suppression_factor,
            long_id_threshold: config.audio.long_id_threshold(),
            id_poll: config.audio.id_poll(),
            lookahead: config.audio.lookahead,
            mode: config.audio.mode,
        }
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        PlaybackSettings::from_config(&StationConfig::default())
    }
}

/// What one call to [`PlaybackEngine::play`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    /// The channel is still playing; nothing changed.
    Busy,
    /// The category has no files.
    Empty,
    Started { index: usize, path: PathBuf },
    /// The item could not be played; the next call moves past it.
    Failed { index: Option<usize>, error: String },
    /// A `once` queue wrapped; the master output was faded and stopped.
    PassComplete,
    /// A completed `once` queue that has not been reset.
    Finished,
}

pub struct PlaybackEngine {
    mixer: Arc<ChannelRegistry>,
    library: Library,
    queues: HashMap<String, PlaybackQueue>,
    normalizer: Option<Arc<NormalizationPipeline>>,
    probe: Option<MediaTool>,
    settings: PlaybackSettings,
    cancel: CancelToken,
    rng: fastrand::Rng,
}

impl PlaybackEngine {
    pub fn new(mixer: Arc<ChannelRegistry>, library: Library, settings: PlaybackSettings) -> Self {
        PlaybackEngine {
            mixer,
            library,
            queues: HashMap::new(),
            normalizer: None,
            probe: None,
            settings,
            cancel: CancelToken::new(),
            rng: fastrand::Rng::new(),
        }
    }

    /// Newly appended files are handed to this pipeline.
    pub fn with_normalizer(mut self, normalizer: Arc<NormalizationPipeline>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Fall back to ffprobe when container metadata has no duration.
    pub fn with_probe(mut self, tool: MediaTool) -> Self {
        self.probe = Some(tool);
        self
    }

    /// Deterministic random picks (shuffle order and station ID choice).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn mixer(&self) -> &Arc<ChannelRegistry> {
        &self.mixer
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    /// Cancelling this token cuts short any fade or station ID wait in progress.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn queue_mut(&mut self, category: &str) -> &mut PlaybackQueue {
        queue_entry(&mut self.queues, &mut self.rng, self.settings.mode, category)
    }

    // ── Playing ─────────────────────────────────────────────────────────────

    /// Advance the category's queue and start the next item, unless the
    /// channel is still busy.
    pub fn play(&mut self, category: &str) -> PlayOutcome {
        if !self.mixer.has_channel(category) {
            let error = PlaybackError::UnknownChannel(category.to_string());
            log::error!("{}", error);
            return PlayOutcome::Failed {
                index: None,
                error: error.to_string(),
            };
        }
        if self.mixer.is_busy(category) {
            return PlayOutcome::Busy;
        }

        if self.queue_mut(category).is_empty() {
            let sounds = self.library.discover(category);
            self.queue_mut(category).rebuild(sounds);
        }
        let lookahead = self.settings.lookahead;
        let queue = queue_entry(&mut self.queues, &mut self.rng, self.settings.mode, category);
        let previous = queue.index();

        let index = match queue.advance() {
            Advance::Empty => {
                log::warn!("No sounds in category '{}'", category);
                return PlayOutcome::Empty;
            }
            Advance::Finished => return PlayOutcome::Finished,
            Advance::PassComplete => {
                if let Some(sound) = previous.and_then(|p| queue.get_mut(p)) {
                    sound.unload();
                }
                log::info!("Finished one pass of '{}'", category);
                self.mixer.stop(category);
                if let Err(e) = self.mixer.fade_out_master() {
                    log::error!("Fade out failed: {}", e);
                }
                return PlayOutcome::PassComplete;
            }
            Advance::Next(i) => i,
        };

        if let Some(p) = previous.filter(|p| *p != index) {
            if let Some(sound) = queue.get_mut(p) {
                sound.unload();
            }
        }

        let Some(sound) = queue.get_mut(index) else {
            return PlayOutcome::Empty;
        };
        ensure_duration(sound, self.probe.as_ref(), &self.cancel);
        log::info!(
            "Playing \"{}\" Length {}",
            sound.path().display(),
            sound.duration_display()
        );
        let path = sound.path().to_path_buf();

        if let Err(e) = self.mixer.play(category, sound) {
            if e.is_device() {
                log::error!("critical: {}", e);
            } else {
                log::error!("{}", e);
            }
            return PlayOutcome::Failed {
                index: Some(index),
                error: e.to_string(),
            };
        }

        if queue.mode().is_sequential() && lookahead > 0 {
            for next in queue.upcoming(lookahead) {
                if next == index {
                    continue;
                }
                if let Some(upcoming) = queue.get_mut(next) {
                    if let Err(e) = upcoming.load() {
                        log::warn!("Preload failed: {}", e);
                    }
                }
            }
        }

        PlayOutcome::Started { index, path }
    }

    /// Play a uniformly chosen file of the category on its channel, outside
    /// the queue. Returns the sound played, or `None` for an empty category.
    pub fn play_random(&mut self, category: &str) -> Result<Option<Sound>, PlaybackError> {
        let Some(sound) = self.pick_random(category)? else {
            return Ok(None);
        };
        self.start_clip(category, &sound)?;
        Ok(Some(sound))
    }

    /// Choose a file of the category and decode it, without playing it.
    fn pick_random(&mut self, category: &str) -> Result<Option<Sound>, PlaybackError> {
        let files = self.library.list(category);
        if files.is_empty() {
            log::warn!("No sounds in category '{}'", category);
            return Ok(None);
        }
        let pick = files[self.rng.usize(..files.len())].clone();
        let mut sound = Sound::new(pick);
        ensure_duration(&mut sound, self.probe.as_ref(), &self.cancel);
        sound.load()?;
        Ok(Some(sound))
    }

    fn start_clip(&self, category: &str, sound: &Sound) -> Result<(), PlaybackError> {
        log::info!(
            "Playing \"{}\" Length {}",
            sound.path().display(),
            sound.duration_display()
        );
        self.mixer.play(category, sound)
    }

    /// Duck the primary channel, play a station ID and bring the primary
    /// back. IDs longer than the threshold also silence and pause the
    /// primary until they end. The clip is chosen and decoded first; from
    /// the duck on everything runs under the mixer lock.
    pub fn station_id(&mut self) -> Result<(), PlaybackError> {
        let id_channel = self.settings.station_id_channel.clone();
        if !self.mixer.has_channel(&id_channel) {
            return Err(PlaybackError::UnknownChannel(id_channel));
        }
        let clip = self
            .pick_random(&id_channel)?
            .ok_or_else(|| PlaybackError::NoStationId(id_channel.clone()))?;

        let mixer = self.mixer.clone();
        let _lock = mixer.lock();
        // A paused mixer would hold the ID channel busy forever.
        if mixer.is_paused() {
            return Err(PlaybackError::Paused);
        }
        let fader = mixer.fader();
        let primary = self.settings.primary.clone();
        let cancel = self.cancel.clone();

        let restore_to = mixer.volume_of(Bus::Channel(&primary))?;
        let ducked = restore_to * self.settings.suppression_factor;
        fader.fade(&mixer, Bus::Channel(&primary), ducked, Some(&cancel))?;

        if let Err(e) = self.start_clip(&id_channel, &clip) {
            mixer.set_volume_of(Bus::Channel(&primary), restore_to)?;
            return Err(e);
        }

        let long = clip
            .cached_duration()
            .is_some_and(|d| d > self.settings.long_id_threshold);
        if long {
            fader.fade(&mixer, Bus::Channel(&primary), 0.0, Some(&cancel))?;
            mixer.pause_channel(&primary)?;
        }

        while mixer.is_busy(&id_channel) && !cancel.is_cancelled() {
            thread::sleep(self.settings.id_poll);
        }

        if long {
            mixer.resume_channel(&primary)?;
        }
        let outcome = fader.fade(&mixer, Bus::Channel(&primary), restore_to, Some(&cancel))?;
        if outcome == FadeOutcome::Cancelled {
            mixer.set_volume_of(Bus::Channel(&primary), restore_to)?;
        }
        log::info!("Station ID \"{}\" sent", clip.name());
        Ok(())
    }

    // ── Playlist edits ──────────────────────────────────────────────────────

    /// Append files of the category that are not queued yet and hand each
    /// new one to the normalizer. Returns how many were added.
    pub fn append_playlist(&mut self, category: &str) -> usize {
        let discovered = self.library.discover(category);
        let queue = self.queue_mut(category);
        let fresh: Vec<Sound> = discovered
            .into_iter()
            .filter(|s| !queue.items().iter().any(|q| q.path() == s.path()))
            .collect();
        let paths: Vec<PathBuf> = fresh.iter().map(|s| s.path().to_path_buf()).collect();
        let added = queue.append(fresh);

        if let Some(normalizer) = &self.normalizer {
            for path in &paths {
                if let Err(e) = normalizer.submit_detached(path) {
                    log::error!("{}", e);
                }
            }
        }
        if added > 0 {
            log::info!("Added {} sounds to '{}'", added, category);
        }
        added
    }

    pub fn shift_playlist(
        &mut self,
        category: &str,
        index: usize,
        offset: isize,
    ) -> Result<usize, PlaybackError> {
        self.queue_mut(category).shift(index, offset)
    }

    pub fn remove_from_playlist(
        &mut self,
        category: &str,
        index: usize,
    ) -> Result<Sound, PlaybackError> {
        let mut removed = self.queue_mut(category).remove(index)?;
        removed.unload();
        Ok(removed)
    }

    pub fn set_mode(&mut self, category: &str, mode: PlayMode) {
        self.queue_mut(category).set_mode(mode);
        log::warn!("'{}' mode set to {}", category, mode);
    }

    /// Stop the current item and start the next one.
    pub fn skip(&mut self, category: &str) -> PlayOutcome {
        self.mixer.stop(category);
        self.play(category)
    }

    pub fn snapshot(&self, category: &str) -> Option<QueueSnapshot> {
        self.queues.get(category).map(PlaybackQueue::snapshot)
    }
}

fn queue_entry<'a>(
    queues: &'a mut HashMap<String, PlaybackQueue>,
    rng: &mut fastrand::Rng,
    mode: PlayMode,
    category: &str,
) -> &'a mut PlaybackQueue {
    queues
        .entry(category.to_string())
        .or_insert_with(|| PlaybackQueue::with_seed(mode, rng.u64(..)))
}

/// Fill in a sound's duration from its metadata, or from ffprobe if that fails.
fn ensure_duration(sound: &mut Sound, probe: Option<&MediaTool>, cancel: &CancelToken) {
    if sound.cached_duration().is_some() {
        return;
    }
    if let Err(e) = sound.duration() {
        let limit = RunLimit::new(PROBE_TIMEOUT).cancelled_by(cancel);
        let probed = probe
            .map(|tool| tool.probe_duration(sound.path(), &limit))
            .and_then(Result::ok)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        match probed {
            Some(d) => sound.set_duration(d),
            None => log::debug!("No duration for '{}': {}", sound.path().display(), e),
        }
    }
}
