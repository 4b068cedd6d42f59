use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use listentogether_core::now_millis;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The key the session is stored under
pub const SESSION_KEY: &str = "listentogether_session";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A persistent key-value store for small strings
pub trait SessionStorage
where
    Self: Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Stores every key as a JSON file in a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(key), value)?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Keeps everything in memory, nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Who the user was and which room they were in, so a restart can rejoin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub user_name: String,
    pub room_code: String,
    /// Milliseconds since the unix epoch, when the session was stored
    pub timestamp: i64,
}

/// The stored shape, every field is checked before trusting it
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    user_id: Option<String>,
    user_name: Option<String>,
    room_code: Option<String>,
    timestamp: Option<i64>,
}

impl StoredSession {
    fn into_session(self) -> Option<Session> {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());

        Some(Session {
            user_id: non_empty(self.user_id)?,
            user_name: non_empty(self.user_name)?,
            room_code: non_empty(self.room_code)?,
            timestamp: self.timestamp.filter(|t| *t > 0)?,
        })
    }
}

/// Persists the current session, expiring it after a fixed time.
///
/// Storage failures are logged and never surface, a broken storage behaves like an empty one.
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new<S>(storage: S, ttl: Duration) -> Self
    where
        S: SessionStorage,
    {
        Self {
            storage: Arc::new(storage),
            ttl,
        }
    }

    pub fn store_session(&self, user_id: &str, user_name: &str, room_code: &str) {
        let session = Session {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            room_code: room_code.to_string(),
            timestamp: now_millis(),
        };

        self.write(&session);
        debug!("Stored session for {user_name} in room {room_code}");
    }

    /// Returns the stored session if it is complete and has not expired.
    /// Anything else is removed.
    pub fn session(&self) -> Option<Session> {
        let raw = match self.storage.get(SESSION_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                error!("Failed to read session: {e}");
                return None;
            }
        };

        let session = serde_json::from_str::<StoredSession>(&raw)
            .ok()
            .and_then(StoredSession::into_session);

        let Some(session) = session else {
            warn!("Stored session is invalid, clearing it");
            self.clear_session();
            return None;
        };

        let age = now_millis().saturating_sub(session.timestamp);

        if age > self.ttl.as_millis() as i64 {
            info!("Stored session expired");
            self.clear_session();
            return None;
        }

        Some(session)
    }

    pub fn clear_session(&self) {
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            error!("Failed to clear session: {e}");
        }
    }

    /// Points the stored session at another room, keeping the user.
    /// Returns false if there is no valid session.
    pub fn update_room_code(&self, room_code: &str) -> bool {
        let Some(session) = self.session() else {
            return false;
        };

        self.write(&Session {
            room_code: room_code.to_string(),
            timestamp: now_millis(),
            ..session
        });

        true
    }

    /// Whether there is an unexpired session for this room.
    pub fn has_valid_session(&self, room_code: &str) -> bool {
        self.session()
            .is_some_and(|session| session.room_code == room_code)
    }

    fn write(&self, session: &Session) {
        let result = serde_json::to_string(session)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                self.storage
                    .set(SESSION_KEY, &value)
                    .map_err(|e| e.to_string())
            });

        if let Err(e) = result {
            error!("Failed to store session: {e}");
        }
    }
}
