use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::ShowConfig;

/// A single show episode, keyed by its number.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub number: u32,
    pub title: String,
    pub description: String,
    /// `None` until some source produced a URL
    pub audio_url: Option<String>,
    pub page_url: String,
    pub publish_date: Option<NaiveDate>,
}

impl Episode {
    /// Metadata used when no source knows anything about the episode yet.
    pub fn placeholder(number: u32, show: &ShowConfig) -> Self {
        Self {
            number,
            title: format!("{} Episode {}", show.name, number),
            description: format!("Episode {} of {} podcast", number, show.name),
            audio_url: None,
            page_url: show.page_url(number),
            publish_date: None,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Copy every field the other record actually knows about.
    pub fn merge_from(&mut self, other: Episode) {
        if other.has_audio() {
            self.audio_url = other.audio_url;
        }
        if !other.title.is_empty() {
            self.title = other.title;
        }
        if !other.description.is_empty() {
            self.description = other.description;
        }
        if other.publish_date.is_some() {
            self.publish_date = other.publish_date;
        }
    }
}

/// Session-scoped map of episode number to resolved audio URL.
///
/// Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct EpisodeUrlCache {
    inner: Arc<Mutex<HashMap<u32, String>>>,
}

impl EpisodeUrlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, episode: u32) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(&episode).cloned())
    }

    pub fn insert(&self, episode: u32, url: impl Into<String>) {
        let url = url.into();
        if url.is_empty() {
            return;
        }
        if let Ok(mut map) = self.inner.lock() {
            map.insert(episode, url);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size contiguous range of episode numbers stored in one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupRange {
    pub start: u32,
    pub end: u32,
}

impl GroupRange {
    pub fn for_episode(episode: u32, group_size: u32) -> Self {
        let size = group_size.max(1);
        let start = (episode.saturating_sub(1) / size) * size + 1;
        Self {
            start,
            end: start.saturating_add(size - 1),
        }
    }

    /// Every group touched by `first..=last`, in order.
    pub fn covering(first: u32, last: u32, group_size: u32) -> Vec<Self> {
        if first > last {
            return Vec::new();
        }

        let mut groups = Vec::new();
        let mut group = Self::for_episode(first, group_size);
        loop {
            groups.push(group);
            if group.end >= last {
                break;
            }
            group = Self::for_episode(group.end + 1, group_size);
        }
        groups
    }

    pub fn contains(&self, episode: u32) -> bool {
        (self.start..=self.end).contains(&episode)
    }

    /// Zero-padded key, e.g. `0001_0100`.
    pub fn key(&self) -> String {
        format!("{:04}_{:04}", self.start, self.end)
    }

    pub fn document_name(&self, prefix: &str) -> String {
        format!("{}_metadata_{}.json", prefix, self.key())
    }
}

/// Serialized form of an episode inside a metadata group document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRecord {
    pub episode_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub audio_url: String,
    #[serde(default, with = "publish_date")]
    pub publish_date: Option<NaiveDate>,
}

impl From<&Episode> for EpisodeRecord {
    fn from(episode: &Episode) -> Self {
        Self {
            episode_number: episode.number,
            title: episode.title.clone(),
            description: episode.description.clone(),
            audio_url: episode.audio_url.clone().unwrap_or_default(),
            publish_date: episode.publish_date,
        }
    }
}

impl EpisodeRecord {
    pub fn into_episode(self, show: &ShowConfig) -> Episode {
        Episode {
            number: self.episode_number,
            page_url: show.page_url(self.episode_number),
            title: self.title,
            description: self.description,
            audio_url: (!self.audio_url.is_empty()).then_some(self.audio_url),
            publish_date: self.publish_date,
        }
    }
}

mod publish_date {
    use super::*;

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(d) => s.serialize_str(&d.format(FORMAT).to_string()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.and_then(|s| {
            let date = s.get(..10).unwrap_or(&s);
            NaiveDate::parse_from_str(date, FORMAT).ok()
        }))
    }
}

/// Outcome of merging records into a group document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub updated: usize,
}

/// Group document body: episode-number-as-string to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataGroup {
    records: BTreeMap<String, EpisodeRecord>,
}

impl MetadataGroup {
    pub fn get(&self, episode: u32) -> Option<&EpisodeRecord> {
        self.records.get(&episode.to_string())
    }

    /// Insert or overwrite by episode number.
    pub fn merge(&mut self, records: impl IntoIterator<Item = EpisodeRecord>) -> MergeReport {
        let mut report = MergeReport::default();
        for record in records {
            match self.records.insert(record.episode_number.to_string(), record) {
                Some(_) => report.updated += 1,
                None => report.added += 1,
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
