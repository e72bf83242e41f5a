use crate::error::PlaybackError;
use crate::timecode::format_hms;
use lofty::file::AudioFile;
use rodio::{Decoder, Source};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Fully decoded PCM for one file, shared cheaply between the queue and the output.
#[derive(Clone)]
pub struct DecodedAudio {
    channels: u16,
    sample_rate: u32,
    samples: Arc<Vec<f32>>,
}

impl DecodedAudio {
    /// Decode an entire file into memory.
    pub fn decode(path: &Path) -> Result<Self, PlaybackError> {
        let file = File::open(path).map_err(|source| PlaybackError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let decoder = Decoder::new(BufReader::new(file)).map_err(|e| PlaybackError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let channels = decoder.channels();
        let sample_rate = decoder.sample_rate();
        let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
        Ok(DecodedAudio {
            channels,
            sample_rate,
            samples: Arc::new(samples),
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length of the decoded audio.
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as f64 / self.channels.max(1) as f64;
        Duration::from_secs_f64(frames / self.sample_rate.max(1) as f64)
    }

    /// A playable source reading the shared samples in place.
    pub fn to_source(&self) -> SharedSource {
        SharedSource {
            samples: Arc::clone(&self.samples),
            pos: 0,
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }
}

/// Source over decoded samples shared with the [`DecodedAudio`] it came from.
pub struct SharedSource {
    samples: Arc<Vec<f32>>,
    pos: usize,
    channels: u16,
    sample_rate: u32,
}

impl Iterator for SharedSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = self.samples.get(self.pos).copied()?;
        self.pos += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.samples.len().saturating_sub(self.pos);
        (left, Some(left))
    }
}

impl Source for SharedSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.samples.len().saturating_sub(self.pos))
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        let frames = self.samples.len() as f64 / self.channels.max(1) as f64;
        Duration::try_from_secs_f64(frames / self.sample_rate.max(1) as f64).ok()
    }
}

impl fmt::Debug for DecodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedAudio")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("samples", &self.samples.len())
            .finish()
    }
}

/// A lazily loaded handle to one library file. Identity is the path.
///
/// Duration and decoded audio are filled in on first use and the decoded
/// buffer can be dropped again with [`Sound::unload`].
#[derive(Debug, Clone)]
pub struct Sound {
    path: PathBuf,
    duration: Option<Duration>,
    decoded: Option<DecodedAudio>,
}

impl Sound {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Sound {
            path: path.into(),
            duration: None,
            decoded: None,
        }
    }

    /// A sound whose duration is already known (e.g. from a probe).
    pub fn with_duration(path: impl Into<PathBuf>, duration: Duration) -> Self {
        Sound {
            path: path.into(),
            duration: Some(duration),
            decoded: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name for display.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Duration from the file's container metadata, cached after the first read.
    pub fn duration(&mut self) -> Result<Duration, PlaybackError> {
        if let Some(d) = self.duration {
            return Ok(d);
        }
        let tagged = lofty::read_from_path(&self.path).map_err(|e| PlaybackError::Decode {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let duration = tagged.properties().duration();
        self.duration = Some(duration);
        Ok(duration)
    }

    pub fn cached_duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    /// Format the cached duration as H:MM:SS.
    pub fn duration_display(&self) -> String {
        self.duration
            .and_then(|d| format_hms(d.as_secs_f64()).ok())
            .unwrap_or_else(|| "?:??:??".to_string())
    }

    /// Decode the file now so a later play starts without decode latency.
    pub fn load(&mut self) -> Result<(), PlaybackError> {
        if self.decoded.is_none() {
            let decoded = DecodedAudio::decode(&self.path)?;
            if self.duration.is_none() {
                self.duration = Some(decoded.duration());
            }
            self.decoded = Some(decoded);
        }
        Ok(())
    }

    /// Release the decoded buffer. Returns whether anything was held.
    pub fn unload(&mut self) -> bool {
        self.decoded.take().is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.decoded.is_some()
    }

    /// Decoded audio for playback: the preloaded buffer, or a fresh decode.
    pub fn decoded(&self) -> Result<DecodedAudio, PlaybackError> {
        match &self.decoded {
            Some(d) => Ok(d.clone()),
            None => DecodedAudio::decode(&self.path),
        }
    }
}

impl PartialEq for Sound {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Sound {}
