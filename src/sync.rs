use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::MirrorError;
use crate::config::PlaybackConfig;
use crate::state::{DeviceIdentity, LocalStateFile, PlaybackState};

/// Remote home of the shared playback-state document.
pub trait StateStore: Send + Sync {
    fn is_authenticated(&self) -> BoxFuture<'_, bool>;
    fn load_state(&self) -> BoxFuture<'_, Result<Option<PlaybackState>, MirrorError>>;
    fn save_state<'a>(&'a self, state: &'a PlaybackState) -> BoxFuture<'a, Result<(), MirrorError>>;
}

pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by whoever watches the platform network state.
#[derive(Debug, Clone)]
pub struct SharedConnectivity(Arc<AtomicBool>);

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Default for SharedConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for SharedConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    PlaybackStarted,
    PlaybackPaused,
    PlaybackStopped,
    SeekCompleted,
    PeriodicTick,
    AppBackgrounded,
    NewEpisodeAutoPlay,
    ConnectivityRestored,
}

impl SaveTrigger {
    /// Triggers a programmatic seek-to-restore can produce on its own.
    pub fn suppressed_while_restoring(self) -> bool {
        matches!(self, Self::PlaybackPaused | Self::SeekCompleted)
    }
}

impl fmt::Display for SaveTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::PlaybackStarted => "playback started",
            Self::PlaybackPaused => "playback paused",
            Self::PlaybackStopped => "playback stopped",
            Self::SeekCompleted => "seek completed",
            Self::PeriodicTick => "periodic save",
            Self::AppBackgrounded => "app backgrounded",
            Self::NewEpisodeAutoPlay => "new episode auto play",
            Self::ConnectivityRestored => "connectivity restored",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Initializing,
    Restoring,
    TooSoon,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Skipped(SkipReason),
    /// Written locally; `pending` means a cloud write is still owed
    LocalOnly { pending: bool },
    Synced,
    Failed,
}

impl SaveOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, Self::LocalOnly { .. } | Self::Synced)
    }
}

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub debounce: Duration,
    pub periodic: Duration,
    pub min_interval: Duration,
    pub min_position_delta: f64,
}

impl From<&PlaybackConfig> for SyncPolicy {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            periodic: Duration::from_secs(config.periodic_secs),
            min_interval: Duration::from_secs(config.min_save_interval_secs),
            min_position_delta: config.min_position_delta_secs,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

/// Persists playback state locally on every save and to the cloud when it can.
pub struct PlaybackSync {
    local: LocalStateFile,
    remote: Option<Arc<dyn StateStore>>,
    network: Arc<dyn NetworkMonitor>,
    device: DeviceIdentity,
    policy: SyncPolicy,
    last_saved: Option<PlaybackState>,
    last_saved_at: Option<Instant>,
    pending_cloud_save: bool,
    initializing: bool,
    restoring: bool,
}

impl PlaybackSync {
    pub fn new(
        local: LocalStateFile,
        network: Arc<dyn NetworkMonitor>,
        device: DeviceIdentity,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            local,
            remote: None,
            network,
            device,
            policy,
            last_saved: None,
            last_saved_at: None,
            pending_cloud_save: false,
            initializing: false,
            restoring: false,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn StateStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn has_pending_save(&self) -> bool {
        self.pending_cloud_save
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring
    }

    pub fn set_restoring(&mut self, restoring: bool) {
        if self.restoring != restoring {
            debug!(restoring, "restoring flag changed");
        }
        self.restoring = restoring;
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    /// While set, every save is refused. The session holds it from startup
    /// until the restored episode has opened in the player.
    pub fn set_initializing(&mut self, initializing: bool) {
        if self.initializing != initializing {
            debug!(initializing, "initializing flag changed");
        }
        self.initializing = initializing;
    }

    pub fn last_saved(&self) -> Option<&PlaybackState> {
        self.last_saved.as_ref()
    }

    async fn remote_available(&self) -> Option<&dyn StateStore> {
        let remote = self.remote.as_deref()?;
        if !self.network.is_online() {
            debug!("offline, cloud state skipped");
            return None;
        }
        if !remote.is_authenticated().await {
            debug!("not signed in, cloud state skipped");
            return None;
        }
        Some(remote)
    }

    /// Startup load: cloud copy when reachable, else the local file.
    pub async fn load(&mut self) -> Option<PlaybackState> {
        let state = self.load_inner().await;
        if let Some(state) = &state {
            info!(
                episode = state.episode_number,
                position = state.position,
                device = state.device_name.as_deref().unwrap_or("unknown"),
                "playback state loaded"
            );
        }
        self.last_saved = state.clone();
        state
    }

    async fn load_inner(&self) -> Option<PlaybackState> {
        if let Some(remote) = self.remote_available().await {
            match remote.load_state().await {
                Ok(Some(state)) => {
                    if let Err(e) = self.local.save(&state) {
                        warn!(error = %e, "failed to mirror cloud state locally");
                    }
                    return Some(state);
                }
                Ok(None) => debug!("no cloud playback state"),
                Err(e) if e.is_auth_failure() => {
                    warn!(error = %e, "cloud auth failed, using local state")
                }
                Err(e) => warn!(error = %e, "cloud state unavailable, using local state"),
            }
        }
        self.local.load()
    }

    /// Apply the save guards, then write locally and (when possible) to the cloud.
    pub async fn save(
        &mut self,
        mut state: PlaybackState,
        force: bool,
        trigger: SaveTrigger,
    ) -> SaveOutcome {
        if self.initializing {
            debug!(reason = %trigger, "save skipped while initializing");
            return SaveOutcome::Skipped(SkipReason::Initializing);
        }

        if self.restoring && trigger.suppressed_while_restoring() {
            debug!(reason = %trigger, "save skipped while restoring position");
            return SaveOutcome::Skipped(SkipReason::Restoring);
        }

        if !force {
            if let Some(at) = self.last_saved_at
                && at.elapsed() < self.policy.min_interval
            {
                debug!(reason = %trigger, "save skipped, too soon");
                return SaveOutcome::Skipped(SkipReason::TooSoon);
            }

            if let Some(last) = &self.last_saved
                && last.episode_number == state.episode_number
                && (last.position - state.position).abs() < self.policy.min_position_delta
            {
                debug!(reason = %trigger, "save skipped, position unchanged");
                return SaveOutcome::Skipped(SkipReason::Unchanged);
            }
        }

        state.last_updated = chrono::Utc::now();
        state.device_id = Some(self.device.id.clone());
        state.device_name = Some(self.device.name.clone());

        let local_ok = match self.local.save(&state) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to write local playback state");
                false
            }
        };

        let outcome = self.save_remote(&state, local_ok).await;
        if outcome.wrote() {
            info!(
                reason = %trigger,
                episode = state.episode_number,
                position = state.position,
                ?outcome,
                "playback state saved"
            );
            self.last_saved = Some(state);
            self.last_saved_at = Some(Instant::now());
        }
        outcome
    }

    async fn save_remote(&mut self, state: &PlaybackState, local_ok: bool) -> SaveOutcome {
        let local_only = |pending| {
            if local_ok {
                SaveOutcome::LocalOnly { pending }
            } else {
                SaveOutcome::Failed
            }
        };

        if self.remote.is_none() {
            return local_only(false);
        }

        let Some(remote) = self.remote_available().await else {
            self.pending_cloud_save = true;
            return local_only(true);
        };

        match remote.save_state(state).await {
            Ok(()) => {
                self.pending_cloud_save = false;
                SaveOutcome::Synced
            }
            Err(e) => {
                if e.is_auth_failure() {
                    warn!(error = %e, "cloud auth failed, state kept locally");
                } else {
                    warn!(error = %e, "cloud save failed, state kept locally");
                }
                self.pending_cloud_save = true;
                local_only(true)
            }
        }
    }

    /// Retry an owed cloud write once the network is back.
    pub async fn on_connectivity_restored(&mut self, current: PlaybackState) -> Option<SaveOutcome> {
        if !self.pending_cloud_save {
            return None;
        }
        info!("connectivity restored, retrying pending save");
        Some(self.save(current, true, SaveTrigger::ConnectivityRestored).await)
    }
}

/// Single re-armable deadline: a new trigger inside the window replaces the
/// previous one instead of stacking.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
    trigger: Option<SaveTrigger>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            trigger: None,
        }
    }

    pub fn trigger(&mut self, trigger: SaveTrigger) {
        self.deadline = Some(Instant::now() + self.delay);
        self.trigger = Some(trigger);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.trigger = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves at the deadline; never while disarmed.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures::future::pending().await,
        }
    }

    /// Disarm and hand back the most recent trigger.
    pub fn take(&mut self) -> Option<SaveTrigger> {
        self.deadline = None;
        self.trigger.take()
    }
}
