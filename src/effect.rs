//! Linear volume fades over the mixer's buses.

use crate::config::AudioConfig;
use crate::error::PlaybackError;
use crate::mixer::{Bus, ChannelRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How a fade ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    Completed,
    /// Stopped early; the volume stays wherever the ramp had reached.
    Cancelled,
}

/// Shared flag that stops in-flight fades and waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fader {
    length: Duration,
    step: Duration,
}

impl Fader {
    pub fn new(length: Duration, step: Duration) -> Self {
        Fader { length, step }
    }

    pub fn from_config(audio: &AudioConfig) -> Self {
        Fader::new(audio.transition(), audio.fade_step())
    }

    /// A fader that jumps straight to the target.
    pub fn instant() -> Self {
        Fader::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Number of ramp intervals in one fade.
    pub fn steps(&self) -> u32 {
        if self.length.is_zero() || self.step.is_zero() {
            return 0;
        }
        (self.length.as_nanos() / self.step.as_nanos()).clamp(1, u32::MAX as u128) as u32
    }

    /// Ramp `bus` from its current volume to `target`, then set `target`
    /// exactly. Holds the mixer lock throughout, so concurrent volume changes
    /// from other threads wait for the fade to finish.
    pub fn fade(
        &self,
        mixer: &ChannelRegistry,
        bus: Bus<'_>,
        target: f32,
        cancel: Option<&CancelToken>,
    ) -> Result<FadeOutcome, PlaybackError> {
        let _lock = mixer.lock();
        let start = mixer.volume_of(bus)?;
        let target = target.clamp(0.0, 1.0);
        let steps = self.steps();

        for i in 1..steps {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                log::debug!("Fade on {:?} cancelled at step {}/{}", bus, i, steps);
                return Ok(FadeOutcome::Cancelled);
            }
            thread::sleep(self.step);
            let volume = start + (target - start) * (i as f32 / steps as f32);
            mixer.set_volume_of(bus, volume)?;
        }

        mixer.set_volume_of(bus, target)?;
        Ok(FadeOutcome::Completed)
    }

    pub fn fade_out(
        &self,
        mixer: &ChannelRegistry,
        bus: Bus<'_>,
        target: f32,
    ) -> Result<FadeOutcome, PlaybackError> {
        self.fade(mixer, bus, target, None)
    }

    pub fn fade_in(
        &self,
        mixer: &ChannelRegistry,
        bus: Bus<'_>,
        target: f32,
    ) -> Result<FadeOutcome, PlaybackError> {
        self.fade(mixer, bus, target, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::time::Instant;

    fn mixer(fader: Fader) -> ChannelRegistry {
        let names = vec!["show".to_string(), "fill".to_string()];
        ChannelRegistry::new(&names, Arc::new(MemoryBackend::new()), fader)
    }

    #[test]
    fn steps_from_length_and_interval() {
        assert_eq!(Fader::new(Duration::from_millis(1000), Duration::from_millis(10)).steps(), 100);
        assert_eq!(Fader::new(Duration::from_millis(5), Duration::from_millis(10)).steps(), 1);
        assert_eq!(Fader::instant().steps(), 0);
    }

    #[test]
    fn fade_lands_exactly_on_target() {
        let fader = Fader::new(Duration::from_millis(30), Duration::from_millis(3));
        let m = mixer(fader);
        let outcome = fader.fade_out(&m, Bus::Channel("show"), 0.3).unwrap();
        assert_eq!(outcome, FadeOutcome::Completed);
        assert_eq!(m.volume_of(Bus::Channel("show")).unwrap(), 0.3);

        fader.fade_in(&m, Bus::Channel("show"), 1.0).unwrap();
        assert_eq!(m.volume_of(Bus::Channel("show")).unwrap(), 1.0);
        assert_eq!(m.volume_of(Bus::Channel("fill")).unwrap(), 1.0);
    }

    #[test]
    fn fade_takes_roughly_its_length() {
        let fader = Fader::new(Duration::from_millis(50), Duration::from_millis(5));
        let m = mixer(fader);
        let start = Instant::now();
        fader.fade_out(&m, Bus::Master, 0.0).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(m.volume_of(Bus::Master).unwrap(), 0.0);
    }

    #[test]
    fn instant_fade_sets_target() {
        let m = mixer(Fader::instant());
        Fader::instant().fade_out(&m, Bus::Channel("fill"), 0.0).unwrap();
        assert_eq!(m.volume_of(Bus::Channel("fill")).unwrap(), 0.0);
    }

    #[test]
    fn target_is_clamped() {
        let m = mixer(Fader::instant());
        Fader::instant().fade_in(&m, Bus::Channel("show"), 4.0).unwrap();
        assert_eq!(m.volume_of(Bus::Channel("show")).unwrap(), 1.0);
    }

    #[test]
    fn cancelled_fade_stops_early() {
        let fader = Fader::new(Duration::from_secs(10), Duration::from_millis(10));
        let m = mixer(fader);
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        let outcome = fader.fade(&m, Bus::Channel("show"), 0.0, Some(&token)).unwrap();
        assert_eq!(outcome, FadeOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(m.volume_of(Bus::Channel("show")).unwrap(), 1.0);
    }

    #[test]
    fn unknown_bus_is_error() {
        let m = mixer(Fader::instant());
        assert!(Fader::instant().fade_out(&m, Bus::Channel("jazz"), 0.0).is_err());
    }
}
