pub mod auth;
pub mod drive;
pub mod query;

pub use auth::{AccessTokenProvider, AuthError, GoogleAuth, OAuthToken};
pub use drive::{DriveClient, DriveError, DriveFile};
pub use query::Query;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CloudConfig, ShowConfig};
use crate::download::{NoProgress, ProgressSink};
use crate::episode::{Episode, EpisodeRecord, GroupRange, MergeReport, MetadataGroup};
use crate::resolver::EpisodeMirror;
use crate::state::PlaybackState;
use crate::sync::StateStore;

const EPISODES_FOLDER: &str = "episodes";
const AUDIO_MIME: &str = "audio/mpeg";
const JSON_MIME: &str = "application/json";
const INDEX_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("invalid document {name}: {source}")]
    InvalidDocument {
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MirrorError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Drive(e) if e.is_auth_failure())
    }
}

/// `{lastUpdated, groups: {"0001_0100": {...}}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataIndex {
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub groups: BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub file_id: String,
    pub start_episode: u32,
    pub end_episode: u32,
    pub last_updated: String,
}

impl MetadataIndex {
    pub fn record(&mut self, group: GroupRange, file_id: &str) {
        let now = Utc::now().format(INDEX_TIME_FORMAT).to_string();
        self.groups.insert(
            group.key(),
            IndexEntry {
                file_id: file_id.to_string(),
                start_episode: group.start,
                end_episode: group.end,
                last_updated: now.clone(),
            },
        );
        self.last_updated = now;
    }
}

/// File names inside the cloud folder for one show.
#[derive(Debug, Clone)]
pub struct MirrorLayout {
    pub root_folder: String,
    pub prefix: String,
    pub group_size: u32,
}

impl MirrorLayout {
    pub fn new(cloud: &CloudConfig, show: &ShowConfig) -> Self {
        Self {
            root_folder: cloud.root_folder.clone(),
            prefix: show.file_prefix.clone(),
            group_size: cloud.group_size,
        }
    }

    pub fn audio_name(&self, episode: u32) -> String {
        format!("{}_{}.mp3", self.prefix, episode)
    }

    pub fn group_name(&self, group: GroupRange) -> String {
        group.document_name(&self.prefix)
    }

    pub fn index_name(&self) -> String {
        format!("{}_metadata_index.json", self.prefix)
    }

    pub fn state_name(&self) -> String {
        format!("{}_playback_state.json", self.prefix)
    }

    pub fn group_for(&self, episode: u32) -> GroupRange {
        GroupRange::for_episode(episode, self.group_size)
    }
}

/// Cache mirror in the user's Drive. Everything is found by name and
/// parent, never by stored path or id.
pub struct CloudMirror {
    drive: DriveClient,
    layout: MirrorLayout,
    show: ShowConfig,
    folders: tokio::sync::Mutex<FolderIds>,
}

#[derive(Default)]
struct FolderIds {
    root: Option<String>,
    episodes: Option<String>,
}

impl CloudMirror {
    pub fn new(drive: DriveClient, layout: MirrorLayout, show: ShowConfig) -> Self {
        Self {
            drive,
            layout,
            show,
            folders: tokio::sync::Mutex::new(FolderIds::default()),
        }
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    pub async fn is_authenticated(&self) -> bool {
        self.drive.tokens().is_authenticated().await
    }

    /// Root folder id; created on demand when `create` is set.
    async fn root_folder(&self, create: bool) -> Result<Option<String>, MirrorError> {
        let mut folders = self.folders.lock().await;
        if let Some(id) = &folders.root {
            return Ok(Some(id.clone()));
        }

        let query = Query::folder(&self.layout.root_folder, None);
        let id = match self.drive.find_first(&query).await? {
            Some(folder) => Some(folder.id),
            None if create => {
                info!(folder = %self.layout.root_folder, "creating cloud folder");
                Some(self.drive.create_folder(&self.layout.root_folder, None).await?.id)
            }
            None => None,
        };

        folders.root = id.clone();
        Ok(id)
    }

    async fn episodes_folder(&self, create: bool) -> Result<Option<String>, MirrorError> {
        if let Some(id) = &self.folders.lock().await.episodes {
            return Ok(Some(id.clone()));
        }

        let Some(root) = self.root_folder(create).await? else {
            return Ok(None);
        };

        let query = Query::folder(EPISODES_FOLDER, Some(&root));
        let id = match self.drive.find_first(&query).await? {
            Some(folder) => Some(folder.id),
            None if create => {
                info!("creating cloud episodes folder");
                Some(self.drive.create_folder(EPISODES_FOLDER, Some(&root)).await?.id)
            }
            None => None,
        };

        self.folders.lock().await.episodes = id.clone();
        Ok(id)
    }

    async fn find_in_root(&self, name: &str) -> Result<Option<DriveFile>, MirrorError> {
        let Some(root) = self.root_folder(false).await? else {
            return Ok(None);
        };
        Ok(self.drive.find_first(&Query::file(name, &root)).await?)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        name: &str,
    ) -> Result<Option<(String, T)>, MirrorError> {
        let Some(file) = self.find_in_root(name).await? else {
            return Ok(None);
        };

        let bytes = self.drive.download_bytes(&file.id).await?;
        let value = serde_json::from_slice(&bytes).map_err(|source| MirrorError::InvalidDocument {
            name: name.to_string(),
            source,
        })?;
        Ok(Some((file.id, value)))
    }

    /// Update the named document in place, or create it.
    async fn write_json<T: Serialize>(
        &self,
        name: &str,
        existing_id: Option<&str>,
        value: &T,
    ) -> Result<String, MirrorError> {
        let body = serde_json::to_vec_pretty(value)?;

        if let Some(id) = existing_id {
            return Ok(self.drive.update_bytes(id, JSON_MIME, body).await?.id);
        }

        let root = self.root_folder(true).await?;
        let file = self
            .drive
            .upload_bytes(name, root.as_deref(), JSON_MIME, body)
            .await?;
        Ok(file.id)
    }

    pub async fn find_episode_audio(&self, episode: u32) -> Result<Option<DriveFile>, MirrorError> {
        let Some(folder) = self.episodes_folder(false).await? else {
            return Ok(None);
        };
        let name = self.layout.audio_name(episode);
        Ok(self.drive.find_first(&Query::file(&name, &folder)).await?)
    }

    /// Copy the mirrored audio to `dest`. `false` when the cloud has none.
    pub async fn download_episode_audio(
        &self,
        episode: u32,
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<bool, MirrorError> {
        let Some(file) = self.find_episode_audio(episode).await? else {
            debug!(episode, "no cloud copy of episode audio");
            return Ok(false);
        };

        let bytes = self
            .drive
            .download_to_file(&file.id, dest, progress, cancel)
            .await?;
        info!(episode, bytes, "downloaded episode audio from cloud");
        Ok(true)
    }

    /// Upload a local episode file unless the cloud already has one.
    pub async fn upload_episode_audio(
        &self,
        episode: u32,
        path: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Option<DriveFile>, MirrorError> {
        let folder = self.episodes_folder(true).await?;
        let name = self.layout.audio_name(episode);

        if let Some(folder) = &folder
            && self.drive.find_first(&Query::file(&name, folder)).await?.is_some()
        {
            debug!(episode, "episode already mirrored");
            return Ok(None);
        }

        let file = self
            .drive
            .upload_file(&name, folder.as_deref(), AUDIO_MIME, path, progress)
            .await?;
        info!(episode, id = %file.id, "episode audio uploaded");
        Ok(Some(file))
    }

    pub async fn read_group(&self, group: GroupRange) -> Result<Option<(String, MetadataGroup)>, MirrorError> {
        self.read_json(&self.layout.group_name(group)).await
    }

    /// Read-merge-write of one group document, then record it in the index.
    /// Concurrent writers to the same group can lose each other's updates.
    pub async fn merge_group(
        &self,
        group: GroupRange,
        records: Vec<EpisodeRecord>,
    ) -> Result<MergeReport, MirrorError> {
        let name = self.layout.group_name(group);
        let (existing_id, mut document) = match self.read_group(group).await? {
            Some((id, document)) => (Some(id), document),
            None => (None, MetadataGroup::default()),
        };

        let report = document.merge(records);
        let file_id = self
            .write_json(&name, existing_id.as_deref(), &document)
            .await?;
        info!(
            group = %group.key(),
            added = report.added,
            updated = report.updated,
            "metadata group saved"
        );

        if let Err(e) = self.update_index(group, &file_id).await {
            warn!(error = %e, "failed to update metadata index");
        }
        Ok(report)
    }

    pub async fn read_index(&self) -> Result<Option<MetadataIndex>, MirrorError> {
        Ok(self
            .read_json(&self.layout.index_name())
            .await?
            .map(|(_, index)| index))
    }

    async fn update_index(&self, group: GroupRange, file_id: &str) -> Result<(), MirrorError> {
        let name = self.layout.index_name();
        let (existing_id, mut index) = match self.read_json::<MetadataIndex>(&name).await? {
            Some((id, index)) => (Some(id), index),
            None => (None, MetadataIndex::default()),
        };

        index.record(group, file_id);
        self.write_json(&name, existing_id.as_deref(), &index).await?;
        Ok(())
    }

    pub async fn load_metadata(&self, episode: u32) -> Result<Option<Episode>, MirrorError> {
        let group = self.layout.group_for(episode);
        let Some((_, document)) = self.read_group(group).await? else {
            return Ok(None);
        };
        Ok(document
            .get(episode)
            .cloned()
            .map(|record| record.into_episode(&self.show)))
    }

    pub async fn load_playback_state(&self) -> Result<Option<PlaybackState>, MirrorError> {
        Ok(self
            .read_json(&self.layout.state_name())
            .await?
            .map(|(_, state)| state))
    }

    /// Overwrite the shared state document. Last writer wins across devices.
    pub async fn save_playback_state(&self, state: &PlaybackState) -> Result<(), MirrorError> {
        let name = self.layout.state_name();
        let existing = self.find_in_root(&name).await?;
        self.write_json(&name, existing.as_ref().map(|f| f.id.as_str()), state)
            .await?;
        debug!(episode = state.episode_number, position = state.position, "playback state saved to cloud");
        Ok(())
    }
}

impl EpisodeMirror for CloudMirror {
    fn is_authenticated(&self) -> BoxFuture<'_, bool> {
        Box::pin(CloudMirror::is_authenticated(self))
    }

    fn fetch_audio<'a>(
        &'a self,
        episode: u32,
        dest: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self
                .download_episode_audio(episode, dest, &NoProgress, cancel)
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    warn!(episode, error = %e, "cloud audio lookup failed");
                    false
                }
            }
        })
    }

    fn lookup_metadata(&self, episode: u32) -> BoxFuture<'_, Option<Episode>> {
        Box::pin(async move {
            self.load_metadata(episode).await.unwrap_or_else(|e| {
                warn!(episode, error = %e, "cloud metadata lookup failed");
                None
            })
        })
    }

    fn store_metadata<'a>(&'a self, episode: &'a Episode) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let group = self.layout.group_for(episode.number);
            if let Err(e) = self.merge_group(group, vec![EpisodeRecord::from(episode)]).await {
                warn!(episode = episode.number, error = %e, "failed to store metadata in cloud");
            }
        })
    }
}

impl StateStore for CloudMirror {
    fn is_authenticated(&self) -> BoxFuture<'_, bool> {
        Box::pin(CloudMirror::is_authenticated(self))
    }

    fn load_state(&self) -> BoxFuture<'_, Result<Option<PlaybackState>, MirrorError>> {
        Box::pin(self.load_playback_state())
    }

    fn save_state<'a>(&'a self, state: &'a PlaybackState) -> BoxFuture<'a, Result<(), MirrorError>> {
        Box::pin(self.save_playback_state(state))
    }
}
