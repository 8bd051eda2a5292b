use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PlaybackConfig;
use crate::library::{EpisodeLibrary, LibraryError};
use crate::player::{
    MediaEvent, MediaSurface, PlayerController, PlayerEffect, PlayerState, SeekSettle,
    TransitionContext,
};
use crate::state::{PlaybackState, format_time};
use crate::sync::{Debouncer, PlaybackSync, SaveOutcome, SaveTrigger};

/// Requests from the UI and notifications from the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SelectEpisode(u32),
    Play,
    Pause,
    Stop,
    Seek(f64),
    /// Download the selected episode in the background
    Download,
    /// Leaving the player screen: pause and abort any download
    NavigateAway,
    AppBackgrounded,
    /// Sent after the network monitor has flipped
    ConnectivityChanged(bool),
    Media(MediaEvent),
    Shutdown,
}

/// What the UI should show.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    EpisodeChanged { episode: u32, cached: bool },
    PlayerState(PlayerState),
    Status(String),
    Alert { title: String, message: String },
    DownloadProgress { episode: u32, fraction: f64 },
    Saved { trigger: SaveTrigger, outcome: SaveOutcome },
}

enum Message {
    Command(SessionCommand),
    DownloadFinished {
        episode: u32,
        autoplay: bool,
        result: Result<PathBuf, LibraryError>,
    },
}

enum Wake {
    Message(Message),
    Debounce,
    Tick,
    SeekPoll,
    Closed,
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Message>,
}

impl SessionHandle {
    /// `false` once the session has stopped.
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(Message::Command(command)).await.is_ok()
    }
}

/// Single owner of the player, the synchronizer and the session flags.
/// Background work reports back through the same queue as UI commands.
pub struct Session {
    surface: Box<dyn MediaSurface>,
    library: Arc<EpisodeLibrary>,
    sync: PlaybackSync,
    controller: PlayerController,
    debounce: Debouncer,
    ticker: Option<Interval>,
    periodic: Duration,
    seek_poll: Duration,
    seek_settle: Duration,
    seek_watch: Option<SeekSettle>,

    episode: u32,
    title: Option<String>,
    loading: bool,
    auto_advancing: bool,
    autoplay_on_open: bool,
    restore_target: Option<PlaybackState>,
    download: Option<CancellationToken>,

    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl Session {
    pub fn new(
        surface: Box<dyn MediaSurface>,
        library: Arc<EpisodeLibrary>,
        sync: PlaybackSync,
        playback: &PlaybackConfig,
        default_episode: u32,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::channel(32);
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let policy = sync.policy().clone();

        let session = Self {
            surface,
            library,
            sync,
            controller: PlayerController::new(),
            debounce: Debouncer::new(policy.debounce),
            ticker: None,
            periodic: policy.periodic,
            seek_poll: Duration::from_millis(playback.seek_poll_ms),
            seek_settle: Duration::from_millis(playback.seek_settle_ms),
            seek_watch: None,
            episode: default_episode,
            title: None,
            loading: false,
            auto_advancing: false,
            autoplay_on_open: false,
            restore_target: None,
            download: None,
            tx: tx.clone(),
            rx,
            updates,
        };
        (session, SessionHandle { tx }, updates_rx)
    }

    pub async fn run(mut self) {
        self.startup().await;

        loop {
            let wake = tokio::select! {
                msg = self.rx.recv() => msg.map_or(Wake::Closed, Wake::Message),
                _ = self.debounce.wait() => Wake::Debounce,
                _ = next_tick(&mut self.ticker) => Wake::Tick,
                _ = next_seek_poll(&mut self.seek_watch) => Wake::SeekPoll,
            };

            match wake {
                Wake::Message(Message::Command(SessionCommand::Shutdown)) | Wake::Closed => break,
                Wake::Message(Message::Command(command)) => self.handle_command(command).await,
                Wake::Message(Message::DownloadFinished {
                    episode,
                    autoplay,
                    result,
                }) => self.on_download_finished(episode, autoplay, result),
                Wake::Debounce => {
                    if let Some(trigger) = self.debounce.take() {
                        self.save(true, trigger).await;
                    }
                }
                Wake::Tick => self.save(false, SaveTrigger::PeriodicTick).await,
                Wake::SeekPoll => self.on_seek_poll(),
            }
        }

        if let Some(trigger) = self.debounce.take() {
            self.save(true, trigger).await;
        }
        if let Some(token) = self.download.take() {
            token.cancel();
        }
        info!("session stopped");
    }

    async fn startup(&mut self) {
        self.sync.set_initializing(true);
        let Some(state) = self.sync.load().await else {
            self.set_episode(self.episode);
            self.finish_startup_if_idle();
            return;
        };

        self.title = state.episode_title.clone();
        if state.position > 0.0 {
            self.sync.set_restoring(true);
            self.status(format!(
                "Found previous playback at {}",
                format_time(state.position)
            ));
            self.restore_target = Some(state.clone());
        } else {
            self.status(format!("Loaded episode {}", state.episode_number));
        }

        self.set_episode(state.episode_number);
        self.finish_startup_if_idle();
    }

    /// Nothing was loaded into the player, so no open event will end startup.
    fn finish_startup_if_idle(&mut self) {
        if !self.loading {
            self.sync.set_initializing(false);
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        debug!(?command, "session command");
        match command {
            SessionCommand::SelectEpisode(0) => {}
            SessionCommand::SelectEpisode(episode) => {
                self.auto_advancing = false;
                self.title = None;
                self.set_episode(episode);
            }
            SessionCommand::Play => {
                if self.controller.state() == PlayerState::Empty {
                    match self.library.cached_path(self.episode) {
                        Some(path) => self.load_episode(path, true),
                        None => self.status(format!("Episode {} is not downloaded", self.episode)),
                    }
                } else {
                    self.surface.play();
                }
            }
            SessionCommand::Pause => self.surface.pause(),
            SessionCommand::Stop => self.surface.stop(),
            SessionCommand::Seek(position) => self.surface.seek(position.max(0.0)),
            SessionCommand::Download => self.start_download(self.episode, false),
            SessionCommand::NavigateAway => {
                if self.controller.is_playing() {
                    info!("pausing playback on navigate away");
                    self.surface.pause();
                }
                if let Some(token) = self.download.take() {
                    token.cancel();
                }
            }
            SessionCommand::AppBackgrounded => {
                self.save(true, SaveTrigger::AppBackgrounded).await;
                if !self.controller.is_playing() {
                    self.ticker = None;
                }
            }
            SessionCommand::ConnectivityChanged(online) => {
                info!(online, "connectivity changed");
                if online {
                    let current = self.snapshot();
                    if let Some(outcome) = self.sync.on_connectivity_restored(current).await {
                        self.publish(SessionUpdate::Saved {
                            trigger: SaveTrigger::ConnectivityRestored,
                            outcome,
                        });
                    }
                }
            }
            SessionCommand::Media(event) => self.on_media_event(event).await,
            SessionCommand::Shutdown => {}
        }
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Opened => self.on_opened().await,
            MediaEvent::StateChanged(next) => {
                let ctx = TransitionContext {
                    loading: self.loading,
                    restoring: self.sync.is_restoring(),
                    position: self.surface.position(),
                };
                let effects = self.controller.on_state_changed(next, ctx);
                self.publish(SessionUpdate::PlayerState(next));
                self.apply(effects);
            }
            MediaEvent::SeekCompleted => self.on_seek_completed(),
            MediaEvent::Ended => {
                let effects = self.controller.on_media_ended();
                self.apply(effects);
            }
        }
    }

    fn apply(&mut self, effects: Vec<PlayerEffect>) {
        for effect in effects {
            match effect {
                PlayerEffect::StartTicker => {
                    let mut ticker =
                        tokio::time::interval_at(Instant::now() + self.periodic, self.periodic);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.ticker = Some(ticker);
                }
                PlayerEffect::StopTicker => self.ticker = None,
                PlayerEffect::RequestSave(trigger) => self.request_save(trigger),
                PlayerEffect::AdvanceEpisode => {
                    info!(finished = self.episode, "episode ended, advancing");
                    self.auto_advancing = true;
                    self.title = None;
                    self.set_episode(self.episode.saturating_add(1));
                }
            }
        }
    }

    fn request_save(&mut self, trigger: SaveTrigger) {
        if self.sync.is_initializing() {
            debug!(reason = %trigger, "save request ignored while initializing");
            return;
        }
        self.debounce.trigger(trigger);
    }

    async fn on_opened(&mut self) {
        self.sync.set_initializing(false);
        self.controller
            .on_state_changed(PlayerState::Loaded, TransitionContext::default());
        self.publish(SessionUpdate::PlayerState(PlayerState::Loaded));

        let restore = self
            .restore_target
            .take()
            .filter(|target| target.episode_number == self.episode && self.sync.is_restoring());

        if let Some(target) = restore {
            info!(
                episode = self.episode,
                position = target.position,
                "restoring saved position"
            );
            self.surface.seek(target.position);
            if target.is_playing {
                self.surface.play();
            }
            self.status(format!(
                "Episode {} restored to {}",
                self.episode,
                format_time(target.position)
            ));
            // restoring clears on the seek-completed event
        } else if self.autoplay_on_open {
            let mut state = self.snapshot();
            state.position = 0.0;
            state.is_playing = true;
            let outcome = self.sync.save(state, true, SaveTrigger::NewEpisodeAutoPlay).await;
            self.publish(SessionUpdate::Saved {
                trigger: SaveTrigger::NewEpisodeAutoPlay,
                outcome,
            });
            self.surface.play();
        }

        self.autoplay_on_open = false;
        self.loading = false;
    }

    fn on_seek_completed(&mut self) {
        if self.sync.is_restoring() {
            self.sync.set_restoring(false);
            debug!("restore seek completed");
            return;
        }
        if self.loading {
            return;
        }

        // a newer seek restarts the wait
        self.seek_watch = Some(SeekSettle::new(
            self.surface.position(),
            self.seek_poll,
            self.seek_settle,
        ));
    }

    fn on_seek_poll(&mut self) {
        let position = self.surface.position();
        if !self.seek_watch.as_ref().is_some_and(|watch| watch.observe(position)) {
            return;
        }
        self.seek_watch = None;
        if !self.loading {
            self.request_save(SaveTrigger::SeekCompleted);
        }
    }

    /// Switch the selected episode: load it when cached, otherwise fetch it
    /// first if we got here by auto-advance.
    fn set_episode(&mut self, episode: u32) {
        self.debounce.cancel();
        self.episode = episode;

        let cached = self.library.cached_path(episode);
        self.publish(SessionUpdate::EpisodeChanged {
            episode,
            cached: cached.is_some(),
        });

        let autoplay = std::mem::take(&mut self.auto_advancing);
        match cached {
            Some(path) => self.load_episode(path, autoplay),
            None => {
                if self.sync.is_restoring() {
                    debug!(episode, "saved episode not cached, nothing to restore into");
                    self.sync.set_restoring(false);
                    self.restore_target = None;
                }
                if autoplay {
                    self.start_download(episode, true);
                }
            }
        }
    }

    fn load_episode(&mut self, path: PathBuf, autoplay: bool) {
        info!(episode = self.episode, path = %path.display(), autoplay, "loading episode");
        self.loading = true;
        self.seek_watch = None;
        self.autoplay_on_open = autoplay;
        self.surface.stop();
        self.surface.load(&path);
        self.controller.on_unloaded();
        self.status(format!("Episode {} loaded in player", self.episode));
    }

    fn start_download(&mut self, episode: u32, autoplay: bool) {
        if self.download.as_ref().is_some_and(|t| !t.is_cancelled()) {
            self.status("A download is already in progress".to_string());
            return;
        }

        let token = CancellationToken::new();
        self.download = Some(token.clone());
        self.status(format!("Downloading episode {}", episode));

        let library = self.library.clone();
        let tx = self.tx.clone();
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let progress = move |fraction: f64| {
                let _ = updates.send(SessionUpdate::DownloadProgress { episode, fraction });
            };
            let result = library
                .download(episode, &progress, &token)
                .await
                .map(|fetched| fetched.path);

            if tx
                .send(Message::DownloadFinished {
                    episode,
                    autoplay,
                    result,
                })
                .await
                .is_err()
            {
                debug!(episode, "session gone before download finished");
            }
        });
    }

    fn on_download_finished(
        &mut self,
        episode: u32,
        autoplay: bool,
        result: Result<PathBuf, LibraryError>,
    ) {
        self.download = None;
        match result {
            Ok(path) => {
                self.status(format!("Episode {} downloaded", episode));
                if episode == self.episode {
                    self.publish(SessionUpdate::EpisodeChanged {
                        episode,
                        cached: true,
                    });
                    self.load_episode(path, autoplay);
                }
            }
            Err(LibraryError::Cancelled) => {
                info!(episode, "download cancelled");
                self.status("Download cancelled".to_string());
            }
            Err(e) => {
                error!(episode, error = %e, "download failed");
                self.status(format!("Download failed: {}", e));
                self.publish(SessionUpdate::Alert {
                    title: "Download Failed".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn snapshot(&self) -> PlaybackState {
        let mut state = PlaybackState::new(
            self.episode,
            self.surface.position(),
            self.surface.duration(),
            self.controller.is_playing(),
        );
        state.episode_title = self.title.clone();
        state
    }

    async fn save(&mut self, force: bool, trigger: SaveTrigger) {
        let state = self.snapshot();
        let outcome = self.sync.save(state, force, trigger).await;
        if outcome == SaveOutcome::Failed {
            warn!(reason = %trigger, "playback state could not be saved");
            self.status("Failed to save playback state".to_string());
        }
        self.publish(SessionUpdate::Saved { trigger, outcome });
    }

    fn status(&self, message: String) {
        debug!(status = %message);
        self.publish(SessionUpdate::Status(message));
    }

    fn publish(&self, update: SessionUpdate) {
        // The UI may have gone away; the session keeps running regardless.
        let _ = self.updates.send(update);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => futures::future::pending().await,
    }
}

async fn next_seek_poll(watch: &mut Option<SeekSettle>) {
    match watch {
        Some(watch) => watch.tick().await,
        None => futures::future::pending().await,
    }
}
