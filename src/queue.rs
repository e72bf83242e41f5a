use crate::error::PlaybackError;
use crate::sound::Sound;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the queue position moves after each item finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    /// Advance by one, wrapping to the start.
    #[default]
    Loop,
    /// Pick a uniformly random position each time (repeats allowed).
    Shuffle,
    /// Replay the current item.
    Single,
    /// Like loop, but the wrap back to the start ends the run.
    Once,
}

impl PlayMode {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "loop" | "repeat" => Some(PlayMode::Loop),
            "shuffle" | "random" => Some(PlayMode::Shuffle),
            "single" | "repeat-one" | "one" => Some(PlayMode::Single),
            "once" => Some(PlayMode::Once),
            _ => None,
        }
    }

    /// Modes that move forward through the queue, and so benefit from preloading.
    pub fn is_sequential(self) -> bool {
        matches!(self, PlayMode::Loop | PlayMode::Once)
    }
}

impl fmt::Display for PlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayMode::Loop => write!(f, "loop"),
            PlayMode::Shuffle => write!(f, "shuffle"),
            PlayMode::Single => write!(f, "single"),
            PlayMode::Once => write!(f, "once"),
        }
    }
}

/// Result of one advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Play the item at this index.
    Next(usize),
    /// `Once` mode wrapped back to the start: the pass is over.
    PassComplete,
    /// Nothing to play.
    Empty,
    /// A completed `Once` run; waits for a mode change or rebuild.
    Finished,
}

/// Read-only view of a queue for display and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub mode: PlayMode,
    pub index: Option<usize>,
    pub finished: bool,
    pub items: Vec<String>,
}

/// An ordered, path-unique list of sounds with a play-mode cursor.
///
/// Pure state: no I/O and no locking. The playback engine owns one per
/// channel and confines it to the playback thread.
#[derive(Debug)]
pub struct PlaybackQueue {
    items: Vec<Sound>,
    mode: PlayMode,
    index: Option<usize>,
    finished: bool,
    rng: fastrand::Rng,
}

impl PlaybackQueue {
    pub fn new(mode: PlayMode) -> Self {
        PlaybackQueue {
            items: Vec::new(),
            mode,
            index: None,
            finished: false,
            rng: fastrand::Rng::new(),
        }
    }

    /// A queue with a deterministic shuffle sequence.
    pub fn with_seed(mode: PlayMode, seed: u64) -> Self {
        PlaybackQueue {
            rng: fastrand::Rng::with_seed(seed),
            ..PlaybackQueue::new(mode)
        }
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn items(&self) -> &[Sound] {
        &self.items
    }

    pub fn current(&self) -> Option<&Sound> {
        self.index.and_then(|i| self.items.get(i))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Sound> {
        self.items.get_mut(index)
    }

    /// Change mode. Clears a finished `Once` run.
    pub fn set_mode(&mut self, mode: PlayMode) {
        self.mode = mode;
        self.finished = false;
    }

    /// Move the cursor according to the mode.
    pub fn advance(&mut self) -> Advance {
        if self.items.is_empty() {
            return Advance::Empty;
        }
        if self.finished {
            return Advance::Finished;
        }
        let len = self.items.len();

        if self.mode == PlayMode::Shuffle {
            let next = self.rng.usize(..len);
            self.index = Some(next);
            return Advance::Next(next);
        }

        let next = match self.index {
            None => 0,
            Some(i) if self.mode == PlayMode::Single => i.min(len - 1),
            Some(i) if i + 1 >= len => {
                self.index = Some(0);
                if self.mode == PlayMode::Once {
                    self.finished = true;
                    return Advance::PassComplete;
                }
                return Advance::Next(0);
            }
            Some(i) => i + 1,
        };
        self.index = Some(next);
        Advance::Next(next)
    }

    /// Append sounds not already queued (by path). Returns how many were added.
    pub fn append(&mut self, sounds: Vec<Sound>) -> usize {
        let mut added = 0;
        for sound in sounds {
            if !self.items.iter().any(|s| s.path() == sound.path()) {
                self.items.push(sound);
                added += 1;
            }
        }
        added
    }

    /// Replace the contents and restart from the top.
    pub fn rebuild(&mut self, sounds: Vec<Sound>) {
        self.items.clear();
        self.index = None;
        self.finished = false;
        self.append(sounds);
    }

    /// Swap the item at `index` with the one `offset` places away, clamping
    /// the destination into the queue. Returns the destination index.
    pub fn shift(&mut self, index: usize, offset: isize) -> Result<usize, PlaybackError> {
        let len = self.items.len();
        if index >= len {
            return Err(PlaybackError::OutOfRange { index, len });
        }
        let target = (index as isize)
            .saturating_add(offset)
            .clamp(0, len as isize - 1) as usize;
        self.items.swap(index, target);
        Ok(target)
    }

    /// Remove the item at `index`, keeping the cursor on the same neighbour.
    pub fn remove(&mut self, index: usize) -> Result<Sound, PlaybackError> {
        let len = self.items.len();
        if index >= len {
            return Err(PlaybackError::OutOfRange { index, len });
        }
        let removed = self.items.remove(index);
        self.index = match self.index {
            _ if self.items.is_empty() => None,
            Some(i) if index < i => Some(i - 1),
            // The current item went away; the next advance picks up its successor.
            Some(i) if index == i => i.checked_sub(1),
            other => other,
        };
        Ok(removed)
    }

    /// Indices of the next `n` items in play order, wrapping.
    pub fn upcoming(&self, n: usize) -> Vec<usize> {
        let len = self.items.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.index.map_or(0, |i| i + 1);
        (0..n.min(len)).map(|k| (start + k) % len).collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            mode: self.mode,
            index: self.index,
            finished: self.finished,
            items: self
                .items
                .iter()
                .map(|s| s.path().display().to_string())
                .collect(),
        }
    }
}
