//! The virtual mixer: a fixed set of named channels over one output backend.
//!
//! All channel state lives behind a single re-entrant lock. A caller that
//! needs several operations to appear atomic (a fade, the station ID
//! sequence) takes [`ChannelRegistry::lock`] once and keeps calling the
//! registry from the same thread; other threads wait until it is released.

use crate::backend::OutputBackend;
use crate::effect::Fader;
use crate::error::PlaybackError;
use crate::sound::Sound;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;

const VOLUME_STEP: f32 = 0.1;

/// A volume control: the master gain or one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus<'a> {
    Master,
    Channel(&'a str),
}

#[derive(Debug, Clone)]
struct Channel {
    name: String,
    volume: f32,
    muted: bool,
    paused: bool,
    last_played: Option<PathBuf>,
}

#[derive(Debug)]
struct MixerState {
    channels: Vec<Channel>,
    master: f32,
    muted: bool,
    paused: bool,
    initialized: bool,
}

impl MixerState {
    fn position(&self, name: &str) -> Result<usize, PlaybackError> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PlaybackError::UnknownChannel(name.to_string()))
    }
}

/// One busy channel as reported by [`ChannelRegistry::digest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelDigest {
    pub name: String,
    pub volume_percent: u32,
    pub last_played: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub volume: f32,
    pub muted: bool,
    pub paused: bool,
    pub busy: bool,
    pub last_played: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixerSnapshot {
    pub master: f32,
    pub muted: bool,
    pub paused: bool,
    pub initialized: bool,
    pub channels: Vec<ChannelStatus>,
}

/// Holds the registry lock; other threads block on mixer calls until dropped.
pub struct MixerLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<MixerState>>,
}

pub struct ChannelRegistry {
    state: ReentrantMutex<RefCell<MixerState>>,
    backend: Arc<dyn OutputBackend>,
    fader: Fader,
}

impl ChannelRegistry {
    pub fn new(names: &[String], backend: Arc<dyn OutputBackend>, fader: Fader) -> Self {
        let channels = names
            .iter()
            .map(|name| Channel {
                name: name.clone(),
                volume: 1.0,
                muted: false,
                paused: false,
                last_played: None,
            })
            .collect::<Vec<_>>();
        for ch in &channels {
            backend.set_volume(&ch.name, 1.0);
        }
        ChannelRegistry {
            state: ReentrantMutex::new(RefCell::new(MixerState {
                channels,
                master: 1.0,
                muted: false,
                paused: false,
                initialized: true,
            })),
            backend,
            fader,
        }
    }

    /// Take the registry lock for a multi-step sequence.
    pub fn lock(&self) -> MixerLock<'_> {
        MixerLock {
            _guard: self.state.lock(),
        }
    }

    pub fn fader(&self) -> Fader {
        self.fader
    }

    pub fn channel_names(&self) -> Vec<String> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.position(name).is_ok()
    }

    fn apply_volume(&self, st: &MixerState, idx: usize) {
        let ch = &st.channels[idx];
        self.backend.set_volume(&ch.name, ch.volume * st.master);
    }

    // ── Volume ──────────────────────────────────────────────────────────────

    pub fn volume_of(&self, bus: Bus<'_>) -> Result<f32, PlaybackError> {
        let guard = self.state.lock();
        let st = guard.borrow();
        match bus {
            Bus::Master => Ok(st.master),
            Bus::Channel(name) => Ok(st.channels[st.position(name)?].volume),
        }
    }

    /// Set a bus volume, clamped to [0, 1], and push it to the output.
    pub fn set_volume_of(&self, bus: Bus<'_>, volume: f32) -> Result<(), PlaybackError> {
        let volume = volume.clamp(0.0, 1.0);
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        match bus {
            Bus::Master => {
                st.master = volume;
                for idx in 0..st.channels.len() {
                    self.apply_volume(&st, idx);
                }
            }
            Bus::Channel(name) => {
                let idx = st.position(name)?;
                st.channels[idx].volume = volume;
                self.apply_volume(&st, idx);
            }
        }
        Ok(())
    }

    pub fn volume_up(&self) {
        self.shift_all_volumes(VOLUME_STEP);
        log::warn!("Volume up.");
    }

    pub fn volume_down(&self) {
        self.shift_all_volumes(-VOLUME_STEP);
        log::warn!("Volume down.");
    }

    fn shift_all_volumes(&self, delta: f32) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        for idx in 0..st.channels.len() {
            let ch = &mut st.channels[idx];
            ch.volume = (ch.volume + delta).clamp(0.0, 1.0);
            self.apply_volume(&st, idx);
        }
    }

    // ── Channel playback ────────────────────────────────────────────────────

    /// Start `sound` on a channel and record it as the channel's last played.
    ///
    /// Decoding happens before the mixer lock is taken. While the whole
    /// mixer is paused the new sound is loaded but held paused.
    pub fn play(&self, name: &str, sound: &Sound) -> Result<(), PlaybackError> {
        let audio = sound.decoded()?;
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.initialized {
            return Err(PlaybackError::Device("Mixer has been destroyed".into()));
        }
        let idx = st.position(name)?;
        self.apply_volume(&st, idx);
        self.backend.play(name, sound, audio)?;
        let held = st.paused;
        if held {
            self.backend.pause(name);
        }
        let ch = &mut st.channels[idx];
        ch.last_played = Some(sound.path().to_path_buf());
        ch.paused = held;
        Ok(())
    }

    pub fn stop(&self, name: &str) {
        self.backend.stop(name);
    }

    pub fn stop_all(&self) {
        let guard = self.state.lock();
        let st = guard.borrow();
        for ch in &st.channels {
            self.backend.stop(&ch.name);
        }
    }

    pub fn pause_channel(&self, name: &str) -> Result<(), PlaybackError> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let idx = st.position(name)?;
        self.backend.pause(name);
        st.channels[idx].paused = true;
        Ok(())
    }

    pub fn resume_channel(&self, name: &str) -> Result<(), PlaybackError> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let idx = st.position(name)?;
        self.backend.resume(name);
        st.channels[idx].paused = false;
        Ok(())
    }

    /// True while the channel holds audio. Unknown channels are never busy.
    pub fn is_busy(&self, name: &str) -> bool {
        let _guard = self.state.lock();
        self.backend.is_busy(name)
    }

    pub fn last_played(&self, name: &str) -> Option<PathBuf> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.position(name)
            .ok()
            .and_then(|idx| st.channels[idx].last_played.clone())
    }

    // ── Whole-mixer controls ────────────────────────────────────────────────

    pub fn is_muted(&self) -> bool {
        self.state.lock().borrow().muted
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().borrow().paused
    }

    pub fn mute(&self) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.muted {
            return;
        }
        st.muted = true;
        for idx in 0..st.channels.len() {
            st.channels[idx].volume = 0.0;
            st.channels[idx].muted = true;
            self.apply_volume(&st, idx);
        }
        log::warn!("All channels muted.");
    }

    pub fn unmute(&self) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.muted {
            return;
        }
        st.muted = false;
        for idx in 0..st.channels.len() {
            st.channels[idx].volume = 1.0;
            st.channels[idx].muted = false;
            self.apply_volume(&st, idx);
        }
        log::warn!("All channels unmuted.");
    }

    pub fn pause(&self) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.paused {
            return;
        }
        st.paused = true;
        for ch in st.channels.iter_mut() {
            self.backend.pause(&ch.name);
            ch.paused = true;
        }
        log::warn!("All channels paused.");
    }

    pub fn resume(&self) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.paused {
            return;
        }
        st.paused = false;
        for ch in st.channels.iter_mut() {
            self.backend.resume(&ch.name);
            ch.paused = false;
        }
        log::warn!("All channels resumed.");
    }

    /// Restore unmuted channels left below `floor` (e.g. by an interrupted
    /// fade). Returns the names of the restored channels.
    pub fn volume_guard(&self, floor: f32) -> Vec<String> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.muted {
            return Vec::new();
        }
        let mut restored = Vec::new();
        for idx in 0..st.channels.len() {
            if st.channels[idx].volume < floor {
                st.channels[idx].volume = 1.0;
                self.apply_volume(&st, idx);
                log::warn!("Channel '{}' was below {:.2}, restored.", st.channels[idx].name, floor);
                restored.push(st.channels[idx].name.clone());
            }
        }
        if st.master < floor {
            st.master = 1.0;
            for idx in 0..st.channels.len() {
                self.apply_volume(&st, idx);
            }
            log::warn!("Master output was below {:.2}, restored.", floor);
        }
        restored
    }

    /// Log and return every busy channel with its volume and last played file.
    pub fn digest(&self) -> Vec<ChannelDigest> {
        let guard = self.state.lock();
        let st = guard.borrow();
        let busy: Vec<ChannelDigest> = st
            .channels
            .iter()
            .filter(|ch| self.backend.is_busy(&ch.name))
            .map(|ch| ChannelDigest {
                name: ch.name.clone(),
                volume_percent: (ch.volume * 100.0).round() as u32,
                last_played: ch.last_played.clone(),
            })
            .collect();

        for entry in &busy {
            let last = entry
                .last_played
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string());
            log::info!("{} ({}%): {}", entry.name, entry.volume_percent, last);
        }
        if busy.is_empty() {
            log::info!("No channels busy.");
        }
        busy
    }

    pub fn snapshot(&self) -> MixerSnapshot {
        let guard = self.state.lock();
        let st = guard.borrow();
        MixerSnapshot {
            master: st.master,
            muted: st.muted,
            paused: st.paused,
            initialized: st.initialized,
            channels: st
                .channels
                .iter()
                .map(|ch| ChannelStatus {
                    name: ch.name.clone(),
                    volume: ch.volume,
                    muted: ch.muted,
                    paused: ch.paused,
                    busy: self.backend.is_busy(&ch.name),
                    last_played: ch.last_played.clone(),
                })
                .collect(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Fade the master output to silence, stop every channel, then reset the
    /// master gain so the next play is audible.
    pub fn fade_out_master(&self) -> Result<(), PlaybackError> {
        let _lock = self.lock();
        self.fader.fade_out(self, Bus::Master, 0.0)?;
        self.stop_all();
        self.set_volume_of(Bus::Master, 1.0)
    }

    /// Fade out, stop everything and release the backend. Runs at most once;
    /// later calls return false.
    pub fn destroy(&self) -> bool {
        let _lock = self.lock();
        {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            if !st.initialized {
                return false;
            }
            st.initialized = false;
        }
        if let Err(e) = self.fader.fade_out(self, Bus::Master, 0.0) {
            log::error!("Fade on shutdown failed: {}", e);
        }
        self.stop_all();
        self.backend.shutdown();
        log::info!("Mixer destroyed.");
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().borrow().initialized
    }
}
