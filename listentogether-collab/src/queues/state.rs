use listentogether_core::{QueueItem, QueueItemId, QueueSnapshot, TrackPointer};
use log::warn;

/// What the queue store thinks is playing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CurrentTrack {
    #[default]
    None,
    Index(usize),
}

impl CurrentTrack {
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Index(index) => Some(*index),
        }
    }
}

/// The local copy of a room's queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueState {
    pub queue: Vec<QueueItem>,
    pub current: CurrentTrack,
}

/// A summary of the playing track
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub index: usize,
    pub id: QueueItemId,
    pub title: String,
    pub artist: String,
    pub added_by: String,
    pub thumbnail: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
    pub mp3_url: Option<String>,
    /// Whether the audio is ready to be played
    pub playable: bool,
}

impl QueueState {
    pub fn current_item(&self) -> Option<&QueueItem> {
        self.current.index().and_then(|i| self.queue.get(i))
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let index = self.current.index()?;
        let item = self.queue.get(index)?;

        Some(NowPlaying {
            index,
            id: item.id.clone(),
            title: item.title.clone(),
            artist: item.artist.clone(),
            added_by: item.added_by.clone(),
            thumbnail: item.thumbnail.clone().or_else(|| item.cover_url.clone()),
            duration: item.duration,
            mp3_url: item.mp3_url.clone(),
            playable: item.is_playable(),
        })
    }

    pub fn position_of(&self, id: &QueueItemId) -> Option<usize> {
        self.queue.iter().position(|item| item.id == *id)
    }

    /// Merges a full snapshot from the server into the local state.
    ///
    /// The queue is always taken as is. The pointer is taken when it points inside the new queue.
    /// Without a pointer, or with a negative one, the previous pointer is kept if it still fits.
    pub fn reconcile(&self, snapshot: QueueSnapshot) -> QueueState {
        let QueueSnapshot {
            queue,
            current_track_index,
        } = snapshot;

        let len = queue.len();

        let keep_previous = || match self.current {
            CurrentTrack::Index(i) if i < len => CurrentTrack::Index(i),
            _ => CurrentTrack::None,
        };

        let current = match current_track_index {
            TrackPointer::At(i) if i < len => CurrentTrack::Index(i),
            TrackPointer::At(i) => {
                warn!("Track pointer {i} is outside a queue of {len} items, clearing it");
                CurrentTrack::None
            }
            // `-1` carries no information, the server sends it on every rebroadcast
            TrackPointer::Stopped | TrackPointer::Unknown => keep_previous(),
        };

        QueueState { queue, current }
    }
}
