//! PlaybackRuntime: dedicated playback thread with channel-based command dispatch.
//!
//! Owns the `PlaybackEngine` on a single thread, so queue state is never
//! shared. Other threads talk to it through `PlaybackHandle` (wraps an
//! `mpsc::Sender<PlaybackCmd>`). Between commands the thread keeps the
//! primary channel fed by calling `play` once per tick.

use crate::playback::{PlayOutcome, PlaybackEngine};
use crate::queue::{PlayMode, QueueSnapshot};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ── Commands & Events ────────────────────────────────────────────────────────

/// Commands sent to the playback thread.
pub enum PlaybackCmd {
    /// Queue files of a category that are not queued yet.
    Append(String),
    Shift {
        category: String,
        index: usize,
        offset: isize,
    },
    Remove {
        category: String,
        index: usize,
    },
    SetMode {
        category: String,
        mode: PlayMode,
    },
    Skip(String),
    StationId,
    Snapshot {
        category: String,
        reply: mpsc::Sender<Option<QueueSnapshot>>,
    },
    Shutdown,
}

/// Events emitted by the playback thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Advanced {
        category: String,
        index: usize,
        path: PathBuf,
    },
    PassComplete(String),
    StationIdSent,
    StationIdFailed(String),
    Error(String),
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe handle for sending commands to the playback runtime.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<PlaybackCmd>,
}

impl PlaybackHandle {
    pub fn append(&self, category: &str) {
        let _ = self.tx.send(PlaybackCmd::Append(category.to_string()));
    }

    pub fn shift(&self, category: &str, index: usize, offset: isize) {
        let _ = self.tx.send(PlaybackCmd::Shift {
            category: category.to_string(),
            index,
            offset,
        });
    }

    pub fn remove(&self, category: &str, index: usize) {
        let _ = self.tx.send(PlaybackCmd::Remove {
            category: category.to_string(),
            index,
        });
    }

    pub fn set_mode(&self, category: &str, mode: PlayMode) {
        let _ = self.tx.send(PlaybackCmd::SetMode {
            category: category.to_string(),
            mode,
        });
    }

    pub fn skip(&self, category: &str) {
        let _ = self.tx.send(PlaybackCmd::Skip(category.to_string()));
    }

    pub fn station_id(&self) {
        let _ = self.tx.send(PlaybackCmd::StationId);
    }

    /// Ask for a queue snapshot and wait for the reply. `None` when the
    /// category has no queue yet or the runtime is gone.
    pub fn snapshot(&self, category: &str) -> Option<QueueSnapshot> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(PlaybackCmd::Snapshot {
                category: category.to_string(),
                reply,
            })
            .ok()?;
        rx.recv().ok().flatten()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(PlaybackCmd::Shutdown);
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Spawn the playback runtime on a dedicated thread.
///
/// `on_event` is called from the playback thread. The primary channel is
/// the one named in the engine's settings.
pub fn spawn_playback_runtime<F>(
    engine: PlaybackEngine,
    tick: Duration,
    on_event: F,
) -> (PlaybackHandle, JoinHandle<()>)
where
    F: Fn(PlaybackEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<PlaybackCmd>();

    let join = std::thread::Builder::new()
        .name("playback".into())
        .spawn(move || {
            playback_thread_loop(rx, engine, tick, on_event);
        })
        .expect("failed to spawn playback thread");

    (PlaybackHandle { tx }, join)
}

fn playback_thread_loop<F>(
    rx: mpsc::Receiver<PlaybackCmd>,
    mut engine: PlaybackEngine,
    tick: Duration,
    on_event: F,
) where
    F: Fn(PlaybackEvent),
{
    let primary = engine.settings().primary.clone();
    let mut last_tick = Instant::now();

    loop {
        let wait = tick.saturating_sub(last_tick.elapsed());
        match rx.recv_timeout(wait) {
            Ok(cmd) => match cmd {
                PlaybackCmd::Append(category) => {
                    engine.append_playlist(&category);
                }

                PlaybackCmd::Shift {
                    category,
                    index,
                    offset,
                } => {
                    if let Err(e) = engine.shift_playlist(&category, index, offset) {
                        on_event(PlaybackEvent::Error(e.to_string()));
                    }
                }

                PlaybackCmd::Remove { category, index } => {
                    if let Err(e) = engine.remove_from_playlist(&category, index) {
                        on_event(PlaybackEvent::Error(e.to_string()));
                    }
                }

                PlaybackCmd::SetMode { category, mode } => {
                    engine.set_mode(&category, mode);
                }

                PlaybackCmd::Skip(category) => {
                    let outcome = engine.skip(&category);
                    report(&category, outcome, &on_event);
                }

                PlaybackCmd::StationId => match engine.station_id() {
                    Ok(()) => on_event(PlaybackEvent::StationIdSent),
                    Err(e) => on_event(PlaybackEvent::StationIdFailed(e.to_string())),
                },

                PlaybackCmd::Snapshot { category, reply } => {
                    let _ = reply.send(engine.snapshot(&category));
                }

                PlaybackCmd::Shutdown => break,
            },

            Err(mpsc::RecvTimeoutError::Timeout) => {}

            // All handles dropped
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        // Due ticks run even while commands keep arriving.
        if last_tick.elapsed() >= tick {
            last_tick = Instant::now();
            let outcome = engine.play(&primary);
            report(&primary, outcome, &on_event);
        }
    }
    log::debug!("Playback runtime stopped");
}

fn report<F>(category: &str, outcome: PlayOutcome, on_event: &F)
where
    F: Fn(PlaybackEvent),
{
    match outcome {
        PlayOutcome::Started { index, path } => on_event(PlaybackEvent::Advanced {
            category: category.to_string(),
            index,
            path,
        }),
        PlayOutcome::PassComplete => on_event(PlaybackEvent::PassComplete(category.to_string())),
        PlayOutcome::Failed { error, .. } => on_event(PlaybackEvent::Error(error)),
        PlayOutcome::Busy | PlayOutcome::Empty | PlayOutcome::Finished => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
