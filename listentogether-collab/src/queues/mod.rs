mod state;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

pub use state::*;

use listentogether_core::{
    events, ListenerId, Listeners, MusicState, QueueItem, QueueItemComplete, QueueItemError,
    QueueItemId, QueueItemProgress, QueueSnapshot, SearchResult, SongLink, SubscriptionId, User,
};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{CollabContext, CollabError};

/// Keeps a local copy of the room's queue, updated from server events.
///
/// Mutations go through the api and are not applied locally, the result arrives as a queue event.
pub struct QueueStore {
    context: CollabContext,
    state: Mutex<QueueState>,
    listeners: Listeners<QueueState>,
    /// Bumped, under the state lock, whenever an update from the server is applied
    revision: AtomicU64,
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl QueueStore {
    pub fn new(context: &CollabContext) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            state: Default::default(),
            listeners: Default::default(),
            revision: Default::default(),
            subscriptions: Default::default(),
        })
    }

    pub fn state(&self) -> QueueState {
        self.state.lock().clone()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.state.lock().now_playing()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Fetches the queue and applies it.
    ///
    /// If an update from the transport lands while the request is in flight, the fetched
    /// snapshot is older than what is held and gets dropped.
    pub async fn get_queue(&self, room_code: &str) -> Result<QueueState, CollabError> {
        let revision = self.revision.load(Ordering::SeqCst);
        let snapshot = self.context.api.queue(room_code).await?;

        match self.apply(snapshot, Some(revision)) {
            Some(state) => Ok(state),
            None => {
                debug!("Dropping fetched queue of room {room_code}, a newer update arrived");
                Ok(self.state())
            }
        }
    }

    pub async fn add_search_result_to_queue(
        &self,
        room_code: &str,
        result: &SearchResult,
        user: &User,
    ) -> Result<(), CollabError> {
        info!("Adding {} to the queue of room {room_code}", result.title);

        self.context
            .api
            .add_search_result(room_code, result, &user.name)
            .await?;

        Ok(())
    }

    pub async fn add_to_queue(
        &self,
        room_code: &str,
        link: &SongLink,
        user: &User,
    ) -> Result<(), CollabError> {
        info!("Adding {link:?} to the queue of room {room_code}");

        self.context
            .api
            .add_to_queue(room_code, link, &user.name)
            .await?;

        Ok(())
    }

    pub async fn remove_from_queue(&self, room_code: &str, index: usize) -> Result<(), CollabError> {
        info!("Removing item {index} from the queue of room {room_code}");

        self.context
            .api
            .remove_from_queue(room_code, index)
            .await?;

        Ok(())
    }

    /// Applies a full snapshot from the server.
    pub fn apply_snapshot(&self, snapshot: QueueSnapshot) -> QueueState {
        // Only a stale revision can make this fail, and none is given
        self.apply(snapshot, None).unwrap_or_else(|| self.state())
    }

    pub fn apply_progress(&self, update: QueueItemProgress) -> bool {
        self.update_item(&update.queue_item_id, |item| {
            item.download_status = update.status;
            item.download_progress = update.progress;
        })
    }

    pub fn apply_complete(&self, update: QueueItemComplete) -> bool {
        self.update_item(&update.queue_item_id, |item| {
            debug!("{} is ready", item.title);

            item.download_status = update.status;
            item.download_progress = 100.;
            item.mp3_url = Some(update.mp3_url);
        })
    }

    pub fn apply_error(&self, update: QueueItemError) -> bool {
        self.update_item(&update.queue_item_id, |item| {
            warn!("Download of {} failed: {}", item.title, update.error);

            item.download_status = update.status;
            item.download_progress = 0.;
        })
    }

    /// Subscribes to the queue events of the transport.
    ///
    /// Does nothing while the handlers from an earlier call are in place. Handlers dropped by a
    /// transport disconnect, such as when leaving a room, are installed again.
    pub fn setup_listeners(self: &Arc<Self>) {
        let transport = &self.context.transport;
        let mut subscriptions = self.subscriptions.lock();

        let installed = subscriptions
            .iter()
            .all(|(event, id)| transport.is_subscribed(event, *id));

        if !subscriptions.is_empty() && installed {
            return;
        }

        for (event, id) in subscriptions.drain(..) {
            transport.off(event, Some(id));
        }

        let store = Arc::downgrade(self);

        subscriptions.extend([
            (
                events::QUEUE_UPDATED,
                transport.on_queue_updated(with_store(&store, |s, snapshot: QueueSnapshot| {
                    s.apply_snapshot(snapshot);
                })),
            ),
            (
                events::MUSIC_STATE,
                transport.on_music_state(with_store(&store, |s, state: MusicState| {
                    match state.into_snapshot() {
                        Some(snapshot) => {
                            s.apply_snapshot(snapshot);
                        }
                        None => debug!("Ignoring music state without a queue"),
                    }
                })),
            ),
            (
                events::QUEUE_ITEM_PROGRESS,
                transport.on_queue_item_progress(with_store(&store, |s, update: QueueItemProgress| {
                    s.apply_progress(update);
                })),
            ),
            (
                events::QUEUE_ITEM_COMPLETE,
                transport.on_queue_item_complete(with_store(&store, |s, update: QueueItemComplete| {
                    s.apply_complete(update);
                })),
            ),
            (
                events::QUEUE_ITEM_ERROR,
                transport.on_queue_item_error(with_store(&store, |s, update: QueueItemError| {
                    s.apply_error(update);
                })),
            ),
        ]);

        debug!("Installed {} queue handlers", subscriptions.len());
    }

    /// Removes the transport subscriptions and every local listener.
    pub fn cleanup(&self) {
        for (event, id) in self.subscriptions.lock().drain(..) {
            self.context.transport.off(event, Some(id));
        }

        self.listeners.clear();
    }

    /// Reconciles a snapshot into the state.
    /// Returns None without touching anything if the state moved past the expected revision.
    fn apply(&self, snapshot: QueueSnapshot, expected: Option<u64>) -> Option<QueueState> {
        let next = {
            let mut state = self.state.lock();

            if let Some(expected) = expected {
                if self.revision.load(Ordering::SeqCst) != expected {
                    return None;
                }
            }

            let next = state.reconcile(snapshot);
            *state = next;
            self.revision.fetch_add(1, Ordering::SeqCst);

            state.clone()
        };

        debug!(
            "Queue has {} items, playing {:?}",
            next.queue.len(),
            next.current.index()
        );

        self.listeners.notify(&next);
        Some(next)
    }

    /// Changes a single item, returning false if no item has this id.
    fn update_item<F>(&self, id: &QueueItemId, f: F) -> bool
    where
        F: FnOnce(&mut QueueItem),
    {
        let next = {
            let mut state = self.state.lock();

            let Some(item) = state.queue.iter_mut().find(|item| item.id == *id) else {
                debug!("Dropping update for unknown queue item {id}");
                return false;
            };

            f(item);
            self.revision.fetch_add(1, Ordering::SeqCst);

            state.clone()
        };

        self.listeners.notify(&next);
        true
    }
}

/// Wraps a handler so it only runs while the store is alive.
fn with_store<T, F>(store: &Weak<QueueStore>, f: F) -> impl Fn(T) + Send + Sync + 'static
where
    T: 'static,
    F: Fn(&QueueStore, T) + Send + Sync + 'static,
{
    let store = store.clone();

    move |value| {
        if let Some(store) = store.upgrade() {
            f(&store, value)
        }
    }
}
