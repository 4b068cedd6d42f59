use std::{
    collections::HashMap,
    fmt::Display,
    hash::{Hash, Hasher},
};

use chrono::DateTime;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::now_millis;

/// Milliseconds since the unix epoch.
///
/// The server is not consistent about this, so both numbers and RFC 3339 strings are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(now_millis())
    }

    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Millis(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Millis(millis) => Ok(Self(millis as i64)),
            Repr::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|date| Self(date.timestamp_millis()))
                .map_err(D::Error::custom),
        }
    }
}

/// A participant of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub joined_at: Timestamp,
}

/// The identity announced to the server when joining a room over the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
}

impl UserIdentity {
    /// A throwaway identity for joining without an account.
    pub fn guest() -> Self {
        Self {
            id: format!("guest-{}", now_millis()),
            name: "Guest".to_string(),
        }
    }
}

impl From<&User> for UserIdentity {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
        }
    }
}

/// A shared listening session, as cached by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub code: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub members: Vec<User>,
    /// Server playback state, not interpreted by the client
    #[serde(default)]
    pub playback: Value,
    #[serde(default)]
    pub is_working: bool,
    #[serde(default)]
    pub working_message: String,
    #[serde(default)]
    pub created_at: Timestamp,
}

impl Room {
    /// Returns the member marked as host, if any
    pub fn host(&self) -> Option<&User> {
        self.members.iter().find(|m| m.is_host)
    }

    pub fn member(&self, user_id: &str) -> Option<&User> {
        self.members.iter().find(|m| m.id == user_id)
    }

    /// Replaces the member list with a fresh, authoritative one.
    pub fn replace_members(&mut self, members: Vec<User>) {
        self.members = dedupe_members(members);
    }
}

/// Collapses members sharing an id.
/// The last occurrence wins, while the position of the first one is kept.
pub fn dedupe_members(members: Vec<User>) -> Vec<User> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(members.len());
    let mut unique: Vec<User> = Vec::with_capacity(members.len());

    for member in members {
        match positions.get(&member.id) {
            Some(&index) => unique[index] = member,
            None => {
                positions.insert(member.id.clone(), unique.len());
                unique.push(member);
            }
        }
    }

    unique
}

/// The id of a queue item.
///
/// Items that have not been resolved yet may carry string ids, so ids are compared by their textual form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueItemId {
    Number(i64),
    Text(String),
}

impl Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl PartialEq for QueueItemId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (a, b) => a.to_string() == b.to_string(),
        }
    }
}

impl Eq for QueueItemId {}

impl Hash for QueueItemId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state)
    }
}

impl From<&str> for QueueItemId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for QueueItemId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Youtube,
    Spotify,
}

/// Where a queue item is in the download pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Whether the item will not change status anymore
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A track in a room's queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueItemId,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub added_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Length in seconds, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub download_status: DownloadStatus,
    /// 0 to 100
    #[serde(default)]
    pub download_progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp3_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<Timestamp>,
}

impl QueueItem {
    /// Whether the item can be played
    pub fn is_playable(&self) -> bool {
        self.download_status == DownloadStatus::Completed
    }
}

/// The play pointer as sent by the server.
///
/// Servers send `-1` both for "nothing is playing" and for "this update says nothing about the pointer",
/// so a negative value is kept apart from an absent one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<i64>")]
pub enum TrackPointer {
    /// No pointer was sent
    #[default]
    Unknown,
    /// A negative pointer was sent
    Stopped,
    /// The track at this position is playing
    At(usize),
}

/// Javascript servers may send `0.0` for `0`, so any number is accepted and truncated.
impl From<Option<f64>> for TrackPointer {
    fn from(value: Option<f64>) -> Self {
        match value {
            None => Self::Unknown,
            Some(n) if n < 0.0 => Self::Stopped,
            Some(n) => Self::At(n as usize),
        }
    }
}

impl From<TrackPointer> for Option<i64> {
    fn from(value: TrackPointer) -> Self {
        match value {
            TrackPointer::Unknown => None,
            TrackPointer::Stopped => Some(-1),
            TrackPointer::At(n) => Some(n as i64),
        }
    }
}

/// A full queue, as returned by the api and the `queueUpdated` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue: Vec<QueueItem>,
    #[serde(default)]
    pub current_track_index: TrackPointer,
}

/// A full sync snapshot from the `music-state` event.
///
/// Items in it are sparse, defaults are filled in by [MusicState::into_snapshot].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicState {
    #[serde(default)]
    pub queue: Option<Vec<MusicStateItem>>,
    #[serde(default)]
    pub current_track_index: TrackPointer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicStateItem {
    pub id: QueueItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    pub duration: Option<f64>,
    #[serde(default)]
    pub added_by: String,
    pub added_at: Option<Timestamp>,
    pub cover_url: Option<String>,
    pub thumbnail: Option<String>,
    pub mp3_url: Option<String>,
    pub youtube_url: Option<String>,
    pub video_id: Option<String>,
    pub source: Option<Source>,
    pub download_status: Option<DownloadStatus>,
    pub download_progress: Option<f32>,
}

impl MusicState {
    /// Normalizes the snapshot, returning None when it carries no queue.
    ///
    /// Items sent here are assumed ready unless they say otherwise.
    pub fn into_snapshot(self) -> Option<QueueSnapshot> {
        let queue = self.queue?;

        Some(QueueSnapshot {
            queue: queue.into_iter().map(MusicStateItem::into_item).collect(),
            current_track_index: self.current_track_index,
        })
    }
}

impl MusicStateItem {
    fn into_item(self) -> QueueItem {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());

        let cover_url = non_empty(self.cover_url);
        let thumbnail = non_empty(self.thumbnail).or_else(|| cover_url.clone());

        QueueItem {
            id: self.id,
            title: self.title,
            artist: self.artist,
            added_by: self.added_by,
            thumbnail,
            duration: self.duration,
            source: self.source.unwrap_or_default(),
            download_status: self.download_status.unwrap_or(DownloadStatus::Completed),
            download_progress: self.download_progress.unwrap_or(100.),
            mp3_url: non_empty(self.mp3_url),
            youtube_url: non_empty(self.youtube_url),
            video_id: non_empty(self.video_id),
            cover_url,
            added_at: self.added_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemProgress {
    pub queue_item_id: QueueItemId,
    pub progress: f32,
    #[serde(default = "downloading")]
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemComplete {
    pub queue_item_id: QueueItemId,
    pub mp3_url: String,
    #[serde(default = "completed")]
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemError {
    pub queue_item_id: QueueItemId,
    #[serde(default)]
    pub error: String,
    #[serde(default = "failed")]
    pub status: DownloadStatus,
}

fn downloading() -> DownloadStatus {
    DownloadStatus::Downloading
}

fn completed() -> DownloadStatus {
    DownloadStatus::Completed
}

fn failed() -> DownloadStatus {
    DownloadStatus::Failed
}

/// A track found through the search api
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Human readable, e.g. "3:45"
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub thumbnail: String,
    pub youtube_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

/// A link that can be added to a queue directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SongLink {
    #[serde(rename = "youtubeUrl")]
    YouTube(String),
    #[serde(rename = "spotifyUrl")]
    Spotify(String),
}

impl SongLink {
    /// Guesses the kind of link from its host.
    pub fn parse(link: &str) -> Option<Self> {
        let url = url::Url::parse(link.trim()).ok()?;
        let host = url.host_str()?;

        if host.ends_with("youtube.com") || host == "youtu.be" {
            Some(Self::YouTube(url.to_string()))
        } else if host.ends_with("spotify.com") {
            Some(Self::Spotify(url.to_string()))
        } else {
            None
        }
    }
}
