//! Audio output backends.
//!
//! The mixer talks to the platform through [`OutputBackend`]. `RodioBackend`
//! keeps the rodio output stream alive on a dedicated thread (the stream is
//! not `Send`) and drives one `Sink` per channel; the sinks themselves are
//! thread-safe. `MemoryBackend` plays nothing and tracks channel state in
//! memory, for headless runs and tests.

use crate::error::PlaybackError;
use crate::sound::{DecodedAudio, Sound};
use parking_lot::Mutex;
use rodio::{OutputStream, Sink};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Per-channel audio output.
pub trait OutputBackend: Send + Sync {
    /// Replace whatever the channel is playing with `audio`, the decoded
    /// content of `sound`, and start it.
    fn play(&self, channel: &str, sound: &Sound, audio: DecodedAudio) -> Result<(), PlaybackError>;
    fn stop(&self, channel: &str);
    fn pause(&self, channel: &str);
    fn resume(&self, channel: &str);
    /// True while the channel holds audio, paused or not.
    fn is_busy(&self, channel: &str) -> bool;
    fn set_volume(&self, channel: &str, volume: f32);
    /// Stop everything and release the device.
    fn shutdown(&self);
}

// ── Rodio ────────────────────────────────────────────────────────────────────

pub struct RodioBackend {
    sinks: HashMap<String, Sink>,
    keepalive: Mutex<Option<mpsc::Sender<()>>>,
}

impl RodioBackend {
    /// Open the default output device and create one sink per channel.
    pub fn open(channels: &[String]) -> Result<Self, PlaybackError> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Park until shutdown; dropping the stream closes the device.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(format!("Failed to open audio output: {}", e)));
                }
            })
            .map_err(|e| PlaybackError::Device(format!("Failed to spawn output thread: {}", e)))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| PlaybackError::Device("Output thread exited".into()))?
            .map_err(PlaybackError::Device)?;

        let mut sinks = HashMap::new();
        for name in channels {
            let sink = Sink::try_new(&handle)
                .map_err(|e| PlaybackError::Device(format!("Failed to create sink: {}", e)))?;
            sinks.insert(name.clone(), sink);
        }

        Ok(RodioBackend {
            sinks,
            keepalive: Mutex::new(Some(stop_tx)),
        })
    }

    fn sink(&self, channel: &str) -> Option<&Sink> {
        self.sinks.get(channel)
    }
}

impl OutputBackend for RodioBackend {
    fn play(&self, channel: &str, _sound: &Sound, audio: DecodedAudio) -> Result<(), PlaybackError> {
        if self.keepalive.lock().is_none() {
            return Err(PlaybackError::Device("Audio output has been shut down".into()));
        }
        let sink = self
            .sink(channel)
            .ok_or_else(|| PlaybackError::UnknownChannel(channel.to_string()))?;
        if !sink.empty() {
            sink.stop();
        }
        sink.append(audio.to_source());
        sink.play();
        Ok(())
    }

    fn stop(&self, channel: &str) {
        if let Some(sink) = self.sink(channel) {
            sink.stop();
        }
    }

    fn pause(&self, channel: &str) {
        if let Some(sink) = self.sink(channel) {
            sink.pause();
        }
    }

    fn resume(&self, channel: &str) {
        if let Some(sink) = self.sink(channel) {
            sink.play();
        }
    }

    fn is_busy(&self, channel: &str) -> bool {
        self.sink(channel).is_some_and(|sink| !sink.empty())
    }

    fn set_volume(&self, channel: &str, volume: f32) {
        if let Some(sink) = self.sink(channel) {
            sink.set_volume(volume);
        }
    }

    fn shutdown(&self) {
        for sink in self.sinks.values() {
            sink.stop();
        }
        // Dropping the sender wakes the output thread, which drops the stream.
        self.keepalive.lock().take();
    }
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Backend calls recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Play { channel: String, path: PathBuf },
    Stop(String),
    Pause(String),
    Resume(String),
    Volume { channel: String, volume: f32 },
    Shutdown,
}

#[derive(Debug, Default)]
struct MemoryChannel {
    playing: Option<PathBuf>,
    ends_at: Option<Instant>,
    paused_remaining: Option<Duration>,
    volume: f32,
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: HashMap<String, MemoryChannel>,
    calls: Vec<BackendCall>,
    shut_down: bool,
}

/// A silent backend. A playing channel stays busy for the sound's cached
/// duration (or `default_length` when unknown); pausing freezes that clock.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    default_length: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    /// Play sounds of unknown duration for `length`.
    pub fn with_default_length(length: Duration) -> Self {
        MemoryBackend {
            state: Mutex::new(MemoryState::default()),
            default_length: length,
        }
    }

    /// End whatever the channel is playing, as if the clip ran out.
    pub fn finish(&self, channel: &str) {
        let mut state = self.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.playing = None;
            ch.ends_at = None;
            ch.paused_remaining = None;
        }
    }

    /// Volume last set on the channel.
    pub fn volume(&self, channel: &str) -> Option<f32> {
        self.state.lock().channels.get(channel).map(|c| c.volume)
    }

    pub fn is_paused(&self, channel: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(channel)
            .is_some_and(|c| c.paused_remaining.is_some())
    }

    /// Path currently loaded on the channel.
    pub fn now_playing(&self, channel: &str) -> Option<PathBuf> {
        let mut state = self.state.lock();
        let ch = state.channels.get_mut(channel)?;
        expire(ch);
        ch.playing.clone()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Paths played on one channel, in order.
    pub fn played(&self, channel: &str) -> Vec<PathBuf> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Play { channel: c, path } if c == channel => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every volume pushed to one channel, in order.
    pub fn volume_history(&self, channel: &str) -> Vec<f32> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Volume { channel: c, volume } if c == channel => Some(*volume),
                _ => None,
            })
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

fn expire(ch: &mut MemoryChannel) {
    if ch.paused_remaining.is_none() && ch.ends_at.is_some_and(|end| Instant::now() >= end) {
        ch.playing = None;
        ch.ends_at = None;
    }
}

impl OutputBackend for MemoryBackend {
    fn play(&self, channel: &str, sound: &Sound, _audio: DecodedAudio) -> Result<(), PlaybackError> {
        let length = sound.cached_duration().unwrap_or(self.default_length);
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(PlaybackError::Device("Audio output has been shut down".into()));
        }
        let ch = state.channels.entry(channel.to_string()).or_insert_with(|| MemoryChannel {
            volume: 1.0,
            ..Default::default()
        });
        ch.playing = Some(sound.path().to_path_buf());
        ch.ends_at = Some(Instant::now() + length);
        ch.paused_remaining = None;
        state.calls.push(BackendCall::Play {
            channel: channel.to_string(),
            path: sound.path().to_path_buf(),
        });
        Ok(())
    }

    fn stop(&self, channel: &str) {
        let mut state = self.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.playing = None;
            ch.ends_at = None;
            ch.paused_remaining = None;
        }
        state.calls.push(BackendCall::Stop(channel.to_string()));
    }

    fn pause(&self, channel: &str) {
        let mut state = self.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            expire(ch);
            if ch.paused_remaining.is_none() {
                if let Some(end) = ch.ends_at {
                    ch.paused_remaining = Some(end.saturating_duration_since(Instant::now()));
                }
            }
        }
        state.calls.push(BackendCall::Pause(channel.to_string()));
    }

    fn resume(&self, channel: &str) {
        let mut state = self.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            if let Some(remaining) = ch.paused_remaining.take() {
                ch.ends_at = Some(Instant::now() + remaining);
            }
        }
        state.calls.push(BackendCall::Resume(channel.to_string()));
    }

    fn is_busy(&self, channel: &str) -> bool {
        let mut state = self.state.lock();
        match state.channels.get_mut(channel) {
            Some(ch) => {
                expire(ch);
                ch.playing.is_some()
            }
            None => false,
        }
    }

    fn set_volume(&self, channel: &str, volume: f32) {
        let mut state = self.state.lock();
        state.channels.entry(channel.to_string()).or_default().volume = volume;
        state.calls.push(BackendCall::Volume {
            channel: channel.to_string(),
            volume,
        });
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        for ch in state.channels.values_mut() {
            ch.playing = None;
            ch.ends_at = None;
            ch.paused_remaining = None;
        }
        state.shut_down = true;
        state.calls.push(BackendCall::Shutdown);
    }
}
