//! In-memory stand-ins for the server, shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use listentogether_core::{
    Config, Connector, DownloadStatus, EventMessage, Link, LinkEnd, QueueItem, QueueItemId,
    QueueSnapshot, Room, SearchResult, SongLink, Source, Timestamp, TrackPointer, TransportError,
    User,
};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

use crate::{Api, ApiError, ApiResult, CollabContext, MemoryStorage, RoomSession};

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub connector: Arc<MemoryConnector>,
    pub context: CollabContext,
}

impl Harness {
    pub fn new() -> Self {
        let api = Arc::new(FakeApi::default());
        let connector = Arc::new(MemoryConnector::default());

        let config = Config {
            connect_timeout: Duration::from_millis(500),
            reconnection_attempts: 3,
            reconnection_delay: Duration::from_millis(10),
            ..Default::default()
        };

        let context = CollabContext::new(
            config,
            api.clone(),
            connector.clone(),
            MemoryStorage::default(),
        );

        Self {
            api,
            connector,
            context,
        }
    }
}

pub fn member(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        name: name.to_string(),
        is_host: false,
        is_connected: true,
        joined_at: Timestamp(1),
    }
}

pub fn item(id: i64, title: &str) -> QueueItem {
    QueueItem {
        id: QueueItemId::Number(id),
        title: title.to_string(),
        artist: "Artist".to_string(),
        added_by: "Alice".to_string(),
        thumbnail: None,
        duration: Some(180.),
        source: Source::Youtube,
        download_status: DownloadStatus::Pending,
        download_progress: 0.,
        mp3_url: None,
        youtube_url: None,
        video_id: None,
        cover_url: None,
        added_at: None,
    }
}

pub fn snapshot(ids: &[i64], pointer: TrackPointer) -> QueueSnapshot {
    QueueSnapshot {
        queue: ids.iter().map(|&id| item(id, &format!("Song {id}"))).collect(),
        current_track_index: pointer,
    }
}

/// Polls until the closure produces a value.
pub async fn eventually<T, F>(f: F) -> T
where
    F: Fn() -> Option<T>,
{
    for _ in 0..200 {
        if let Some(value) = f() {
            return value;
        }

        sleep(Duration::from_millis(10)).await;
    }

    panic!("condition was not met in time")
}

pub async fn next_message(end: &mut LinkEnd) -> EventMessage {
    timeout(Duration::from_secs(2), end.receiver.recv())
        .await
        .expect("message arrives in time")
        .expect("link is open")
}

/// A scripted REST api holding rooms and queues in memory.
#[derive(Default)]
pub struct FakeApi {
    rooms: Mutex<HashMap<String, Room>>,
    queues: Mutex<HashMap<String, QueueSnapshot>>,
    delays: Mutex<HashMap<String, Duration>>,
    next_error: Mutex<Option<ApiError>>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    /// Adds a room, the first member is the host.
    pub fn add_room(&self, code: &str, members: &[&str]) {
        let members: Vec<User> = members
            .iter()
            .enumerate()
            .map(|(i, name)| User {
                is_host: i == 0,
                ..member(&user_id(name), name)
            })
            .collect();

        let room = Room {
            code: code.to_string(),
            host_id: members.first().map(|m| m.id.clone()).unwrap_or_default(),
            members,
            playback: Default::default(),
            is_working: false,
            working_message: String::new(),
            created_at: Timestamp(1),
        };

        self.rooms.lock().insert(code.to_string(), room);
    }

    pub fn room(&self, code: &str) -> Room {
        self.rooms.lock()[code].clone()
    }

    pub fn set_queue(&self, code: &str, snapshot: QueueSnapshot) {
        self.queues.lock().insert(code.to_string(), snapshot);
    }

    /// Delays every request for a room code.
    pub fn delay_room(&self, code: &str, delay: Duration) {
        self.delays.lock().insert(code.to_string(), delay);
    }

    /// Makes the next request fail.
    pub fn fail_next(&self, error: ApiError) {
        *self.next_error.lock() = Some(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    async fn request(&self, call: String, code: Option<&str>) -> ApiResult<()> {
        self.calls.lock().push(call);

        let delay = code.and_then(|c| self.delays.lock().get(c).copied());

        if let Some(delay) = delay {
            sleep(delay).await;
        }

        match self.next_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn room_not_found() -> ApiError {
        ApiError::new("Room not found", Some(404))
    }
}

fn user_id(name: &str) -> String {
    format!("u-{}", name.to_lowercase())
}

#[async_trait]
impl Api for FakeApi {
    async fn create_room(&self, _room_name: &str, user_name: &str) -> ApiResult<RoomSession> {
        self.request(format!("create {user_name}"), None).await?;

        let code = format!("ROOM{}", self.rooms.lock().len() + 1);
        self.add_room(&code, &[user_name]);

        let room = self.room(&code);
        let user = room.members[0].clone();

        Ok(RoomSession { room, user })
    }

    async fn join_room(&self, room_code: &str, user_name: &str) -> ApiResult<RoomSession> {
        self.request(format!("join {room_code} {user_name}"), Some(room_code))
            .await?;

        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(room_code).ok_or_else(Self::room_not_found)?;

        let id = user_id(user_name);

        if room.member(&id).is_none() {
            room.members.push(member(&id, user_name));
        }

        Ok(RoomSession {
            user: room.member(&id).cloned().unwrap_or_else(|| member(&id, user_name)),
            room: room.clone(),
        })
    }

    async fn search(&self, query: &str, limit: usize) -> ApiResult<Vec<SearchResult>> {
        self.request(format!("search {query} {limit}"), None).await?;

        let results = (0..3)
            .map(|i| SearchResult {
                id: format!("r{i}"),
                title: format!("{query} {i}"),
                artist: "Artist".to_string(),
                album: String::new(),
                duration: "3:00".to_string(),
                thumbnail: String::new(),
                youtube_url: format!("https://www.youtube.com/watch?v=r{i}"),
                view_count: None,
                upload_date: None,
            })
            .take(limit)
            .collect();

        Ok(results)
    }

    async fn suggestions(&self) -> ApiResult<Vec<String>> {
        self.request("suggestions".to_string(), None).await?;
        Ok(vec!["lofi".to_string()])
    }

    async fn add_search_result(
        &self,
        room_code: &str,
        result: &SearchResult,
        added_by: &str,
    ) -> ApiResult<()> {
        self.request(
            format!("add-search-result {room_code} {} {added_by}", result.id),
            Some(room_code),
        )
        .await
    }

    async fn add_to_queue(
        &self,
        room_code: &str,
        link: &SongLink,
        added_by: &str,
    ) -> ApiResult<()> {
        let url = match link {
            SongLink::YouTube(url) | SongLink::Spotify(url) => url,
        };

        self.request(format!("add {room_code} {url} {added_by}"), Some(room_code))
            .await
    }

    async fn queue(&self, room_code: &str) -> ApiResult<QueueSnapshot> {
        self.request(format!("queue {room_code}"), Some(room_code))
            .await?;

        self.queues
            .lock()
            .get(room_code)
            .cloned()
            .ok_or_else(Self::room_not_found)
    }

    async fn remove_from_queue(&self, room_code: &str, index: usize) -> ApiResult<()> {
        self.request(format!("remove {room_code} {index}"), Some(room_code))
            .await
    }
}

/// Opens in-memory links and keeps their server ends for the test to drive.
#[derive(Default)]
pub struct MemoryConnector {
    opened: AtomicUsize,
    ends: Mutex<Vec<Option<LinkEnd>>>,
}

impl MemoryConnector {
    pub fn attempts(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Takes the server end of the most recent link.
    pub fn last_end(&self) -> LinkEnd {
        self.ends
            .lock()
            .iter_mut()
            .rev()
            .find_map(Option::take)
            .expect("a link was opened")
    }

    /// Waits for the nth link to be opened and takes its server end.
    pub async fn wait_for_link(&self, n: usize) -> LinkEnd {
        eventually(|| self.ends.lock().get_mut(n - 1).and_then(Option::take)).await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let attempt = self.opened.fetch_add(1, Ordering::SeqCst);
        let (link, end) = Link::in_memory(format!("sid-{attempt}"));

        self.ends.lock().push(Some(end));
        Ok(link)
    }
}
