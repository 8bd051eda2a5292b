use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::sync::SaveTrigger;

/// Position movement that counts as the player having caught up after a seek.
const SETTLE_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Empty,
    Loaded,
    Playing,
    Paused,
    Stopped,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Loaded => "loaded",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Notifications raised by the platform player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaEvent {
    Opened,
    StateChanged(PlayerState),
    SeekCompleted,
    Ended,
}

/// The platform audio element. Decoding and output live behind it; every call
/// returns immediately and completion is reported as a [`MediaEvent`].
pub trait MediaSurface: Send + Sync {
    fn load(&mut self, path: &Path);
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, position: f64);
    /// Seconds
    fn position(&self) -> f64;
    /// Seconds, zero while unknown
    fn duration(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEffect {
    StartTicker,
    StopTicker,
    RequestSave(SaveTrigger),
    AdvanceEpisode,
}

/// Flags the controller consults but does not own.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    pub loading: bool,
    pub restoring: bool,
    pub position: f64,
}

/// Tracks the player state and maps each transition to its side effects.
#[derive(Debug, Default)]
pub struct PlayerController {
    state: PlayerState,
}

impl PlayerController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn on_state_changed(&mut self, next: PlayerState, ctx: TransitionContext) -> Vec<PlayerEffect> {
        let previous = std::mem::replace(&mut self.state, next);
        debug!(from = %previous, to = %next, "player state changed");

        match next {
            PlayerState::Playing => vec![
                PlayerEffect::StartTicker,
                PlayerEffect::RequestSave(SaveTrigger::PlaybackStarted),
            ],
            PlayerState::Paused if previous == PlayerState::Playing => vec![
                PlayerEffect::RequestSave(SaveTrigger::PlaybackPaused),
                PlayerEffect::StopTicker,
            ],
            PlayerState::Stopped
                if matches!(previous, PlayerState::Playing | PlayerState::Paused) =>
            {
                let mut effects = Vec::with_capacity(2);
                if !ctx.loading && !ctx.restoring && ctx.position > 0.0 {
                    effects.push(PlayerEffect::RequestSave(SaveTrigger::PlaybackStopped));
                } else {
                    debug!(
                        loading = ctx.loading,
                        restoring = ctx.restoring,
                        position = ctx.position,
                        "stop not saved"
                    );
                }
                effects.push(PlayerEffect::StopTicker);
                effects
            }
            PlayerState::Paused | PlayerState::Stopped => vec![PlayerEffect::StopTicker],
            PlayerState::Empty | PlayerState::Loaded => Vec::new(),
        }
    }

    /// The episode finished on its own: move on to the next one.
    pub fn on_media_ended(&mut self) -> Vec<PlayerEffect> {
        self.state = PlayerState::Empty;
        vec![PlayerEffect::StopTicker, PlayerEffect::AdvanceEpisode]
    }

    /// A new source replaced whatever was loaded.
    pub fn on_unloaded(&mut self) {
        self.state = PlayerState::Empty;
    }
}

/// Bounded wait for the reported position to move after a seek. The owner
/// awaits [`SeekSettle::tick`] and feeds each reading to [`SeekSettle::observe`].
#[derive(Debug)]
pub struct SeekSettle {
    initial: f64,
    deadline: Instant,
    poll: Interval,
}

impl SeekSettle {
    pub fn new(initial: f64, interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let now = Instant::now();
        let mut poll = tokio::time::interval_at(now + interval, interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            initial,
            deadline: now + timeout,
            poll,
        }
    }

    pub async fn tick(&mut self) {
        self.poll.tick().await;
    }

    /// `true` once `current` has moved away from the first reading or the
    /// timeout has passed.
    pub fn observe(&self, current: f64) -> bool {
        let moved = (current - self.initial).abs() > SETTLE_EPSILON;
        if moved || Instant::now() >= self.deadline {
            debug!(initial = self.initial, settled = current, moved, "seek position settled");
            return true;
        }
        false
    }
}
