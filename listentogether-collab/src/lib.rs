mod api;
mod queues;
mod rooms;
mod session;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use api::*;
pub use queues::*;
pub use rooms::*;
pub use session::*;

use listentogether_core::{
    BoxedConnector, Config, SearchResult, SocketIoConnector, Transport, TransportError,
};
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// There is no stored session to act on behalf of
    #[error("No active session")]
    NoSession,
    /// A newer room operation started while this one was waiting on the server
    #[error("Superseded by a newer room operation")]
    Superseded,
}

/// The listentogether client, keeping room membership and the queue in sync with the server.
pub struct Collab {
    context: CollabContext,

    pub rooms: Arc<RoomStore>,
    pub queue: Arc<QueueStore>,
}

/// The services shared by the stores. Every store receives these explicitly.
#[derive(Clone)]
pub struct CollabContext {
    pub config: Config,
    pub api: BoxedApi,
    pub transport: Transport,
    pub sessions: Arc<SessionStore>,
}

impl CollabContext {
    pub fn new<S>(config: Config, api: BoxedApi, connector: BoxedConnector, storage: S) -> Self
    where
        S: SessionStorage,
    {
        Self {
            transport: Transport::with_connector(&config, connector),
            sessions: Arc::new(SessionStore::new(storage, config.session_ttl)),
            api,
            config,
        }
    }
}

impl Collab {
    /// Creates a client talking to the configured server, storing its session on disk.
    pub fn new(config: Config) -> Result<Self, CollabError> {
        let api = Arc::new(HttpApi::new(&config));
        let connector = Arc::new(SocketIoConnector::new(&config)?);
        let storage = FileStorage::new(&config.storage_dir);

        info!(
            "Using server {} with api {}",
            connector.url(),
            config.api_url
        );

        Ok(Self::with_context(CollabContext::new(
            config, api, connector, storage,
        )))
    }

    pub fn with_context(context: CollabContext) -> Self {
        Self {
            rooms: RoomStore::new(&context),
            queue: QueueStore::new(&context),
            context,
        }
    }

    pub fn context(&self) -> &CollabContext {
        &self.context
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, CollabError> {
        Ok(self.context.api.search(query, limit).await?)
    }

    pub async fn suggestions(&self) -> Result<Vec<String>, CollabError> {
        Ok(self.context.api.suggestions().await?)
    }

    /// Leaves the current room and drops every subscription.
    pub fn exit(&self) {
        self.queue.cleanup();
        self.rooms.leave_room();
    }
}
