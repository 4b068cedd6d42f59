mod state;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub use state::*;

use listentogether_core::{
    events, ClientEvent, ListenerId, Listeners, RoomPayload, SubscriptionId, User, UserIdentity,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;

use crate::{CollabContext, CollabError, RoomSession};

type EventHandler = fn(&RoomStore, &Value);

/// Keeps track of the room the user is in, and keeps it current with server events.
pub struct RoomStore {
    context: CollabContext,
    state: Mutex<RoomState>,
    listeners: Listeners<RoomState>,
    /// Bumped by every operation that changes which room the user is in.
    /// Results of older operations are discarded.
    epoch: AtomicU64,
    /// The transport handlers installed by this store
    subscriptions: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

impl RoomStore {
    pub fn new(context: &CollabContext) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            state: Default::default(),
            listeners: Default::default(),
            epoch: Default::default(),
            subscriptions: Default::default(),
        })
    }

    pub fn state(&self) -> RoomState {
        self.state.lock().clone()
    }

    /// Calls the listener with the new state after every change.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RoomState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn clear_error(&self) {
        self.update(|s| s.error = None);
    }

    /// Creates a room with the user as host. Does not connect, the room is entered by restoring the session.
    pub async fn create_room(
        &self,
        room_name: &str,
        user_name: &str,
    ) -> Result<RoomSession, CollabError> {
        let epoch = self.begin();
        self.update(|s| s.error = None);

        let session = self
            .context
            .api
            .create_room(room_name, user_name)
            .await
            .map_err(|e| self.fail(epoch, e))?;

        self.ensure_current(epoch)?;

        let RoomSession { room, user } = &session;
        info!("Created room {} as {}", room.code, user.name);

        self.update(|s| {
            s.room = Some(room.clone());
            s.current_user = Some(user.clone());
        });

        self.context
            .sessions
            .store_session(&user.id, &user.name, &room.code);

        Ok(session)
    }

    /// Joins a room and announces presence over the transport.
    pub async fn join_room(
        self: &Arc<Self>,
        room_code: &str,
        user_name: &str,
    ) -> Result<RoomSession, CollabError> {
        let epoch = self.begin();
        self.update(|s| s.error = None);

        let session = self
            .context
            .api
            .join_room(room_code, user_name)
            .await
            .map_err(|e| self.fail(epoch, e))?;

        self.ensure_current(epoch)?;
        info!("Joined room {} as {}", session.room.code, session.user.name);

        self.enter(epoch, &session)
            .await
            .map_err(|e| self.fail(epoch, e))?;

        Ok(session)
    }

    /// Rejoins a room with the stored session.
    ///
    /// If the session belongs to another room, it is moved to this one first.
    /// When the server refuses, the stored session is cleared.
    pub async fn restore_session(self: &Arc<Self>, room_code: &str) -> RestoreOutcome {
        let Some(stored) = self.context.sessions.session() else {
            debug!("No session to restore");
            return RestoreOutcome::NoSession;
        };

        if stored.room_code != room_code {
            info!(
                "Switching stored session from room {} to {room_code}",
                stored.room_code
            );

            self.context.sessions.update_room_code(room_code);
        }

        let epoch = self.begin();
        self.update(|s| s.error = None);

        let session = match self
            .context
            .api
            .join_room(room_code, &stored.user_name)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to restore session in room {room_code}: {e}");
                self.context.sessions.clear_session();

                return if e.is_room_not_found() {
                    RestoreOutcome::RoomNotFound
                } else {
                    RestoreOutcome::Failed
                };
            }
        };

        if !self.is_current(epoch) {
            return RestoreOutcome::Failed;
        }

        match self.enter(epoch, &session).await {
            Err(CollabError::Superseded) => RestoreOutcome::Failed,
            result => {
                if let Err(e) = result {
                    self.fail(epoch, e);
                }

                info!("Restored session in room {}", session.room.code);
                RestoreOutcome::Restored
            }
        }
    }

    /// Moves to another room with the same user name, leaving the current one.
    pub async fn switch_room(self: &Arc<Self>, room_code: &str) -> bool {
        if let Some(previous) = self.state().room_code() {
            if let Err(e) = self.context.transport.leave_room(previous) {
                warn!("Could not announce leaving room {previous}: {e}");
            }
        }

        let Some(stored) = self.context.sessions.session() else {
            warn!("Cannot switch rooms without a session");
            return false;
        };

        let epoch = self.begin();

        let session = match self
            .context
            .api
            .join_room(room_code, &stored.user_name)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to switch to room {room_code}: {e}");
                return false;
            }
        };

        if !self.is_current(epoch) {
            return false;
        }

        match self.enter(epoch, &session).await {
            Err(CollabError::Superseded) => false,
            result => {
                if let Err(e) = result {
                    self.fail(epoch, e);
                }

                info!("Switched to room {}", session.room.code);
                true
            }
        }
    }

    /// Leaves the room, closes the connection and forgets the session.
    pub fn leave_room(&self) {
        self.begin();

        if let Some(code) = self.state().room_code() {
            if let Err(e) = self.context.transport.leave_room(code) {
                warn!("Could not announce leaving room {code}: {e}");
            }

            info!("Left room {code}");
        }

        // Disconnecting drops every transport handler, ours included
        self.context.transport.disconnect();
        self.subscriptions.lock().clear();

        self.context.sessions.clear_session();
        self.update(|s| *s = RoomState::default());
    }

    /// Makes a joined room the current one and announces presence over the transport.
    async fn enter(self: &Arc<Self>, epoch: u64, session: &RoomSession) -> Result<(), CollabError> {
        let RoomSession { room, user } = session;

        self.update(|s| {
            s.room = Some(room.clone());
            s.current_user = Some(user.clone());
            s.connection = ConnectionStatus::Connecting;
        });

        self.context
            .sessions
            .store_session(&user.id, &user.name, &room.code);

        self.install_listeners();

        let result = self
            .context
            .transport
            .join_room(&room.code, Some(UserIdentity::from(user)))
            .await;

        self.ensure_current(epoch)?;

        match result {
            Ok(()) => {
                self.update(|s| s.connection = ConnectionStatus::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Could not announce joining room {}: {e}", room.code);
                self.update(|s| s.connection = ConnectionStatus::Disconnected);

                Err(e.into())
            }
        }
    }

    /// Registers the transport handlers, once.
    fn install_listeners(self: &Arc<Self>) {
        let transport = &self.context.transport;
        let mut subscriptions = self.subscriptions.lock();

        let installed = subscriptions
            .iter()
            .all(|(event, id)| transport.is_subscribed(event, *id));

        if !subscriptions.is_empty() && installed {
            return;
        }

        subscriptions.clear();

        let handlers: [(&'static str, EventHandler); 10] = [
            (events::ROOM_UPDATED, Self::handle_room),
            (events::USER_JOINED, Self::handle_room),
            (events::USER_LEFT, Self::handle_room),
            (events::HOST_CHANGED, Self::handle_room),
            (events::PARTICIPANT_LIST, Self::handle_participants),
            (events::ROOM_DELETED, Self::handle_room_deleted),
            (events::CONNECT, Self::handle_connect),
            (events::RECONNECT, Self::handle_reconnect),
            (events::DISCONNECT, Self::handle_disconnect),
            (events::RECONNECT_FAILED, Self::handle_reconnect_failed),
        ];

        for (event, handler) in handlers {
            let store = Arc::downgrade(self);

            let id = transport.on(event, move |payload| {
                if let Some(store) = store.upgrade() {
                    handler(&store, payload)
                }
            });

            subscriptions.push((event, id));
        }

        debug!("Installed {} room handlers", subscriptions.len());
    }

    fn handle_room(&self, payload: &Value) {
        match RoomPayload::deserialize(payload) {
            Ok(payload) => {
                let mut room = payload.into_room();
                let members = std::mem::take(&mut room.members);
                room.replace_members(members);

                debug!("Room {} updated ({} members)", room.code, room.members.len());
                self.update(|s| s.set_room(room));
            }
            Err(e) => warn!("Dropping malformed room payload: {e}"),
        }
    }

    fn handle_participants(&self, payload: &Value) {
        let participants = match Vec::<User>::deserialize(payload) {
            Ok(participants) => participants,
            Err(e) => {
                warn!("Dropping malformed participant list: {e}");
                return;
            }
        };

        self.update(|s| {
            if let Some(mut room) = s.room.take() {
                room.replace_members(participants);
                s.set_room(room);
            }
        });
    }

    fn handle_room_deleted(&self, _: &Value) {
        warn!("Room was deleted");

        self.update(|s| {
            *s = RoomState {
                error: Some("Room was deleted".to_string()),
                ..Default::default()
            }
        });
    }

    fn handle_connect(&self, _: &Value) {
        self.update(|s| s.connection = ConnectionStatus::Connected);

        if let Some(code) = self.state().room_code() {
            let request = ClientEvent::GetParticipants {
                room_code: code.to_string(),
            };

            if let Err(e) = self.context.transport.try_emit(request) {
                warn!("Could not request participants: {e}");
            }
        }
    }

    /// The server forgot about this connection, so presence is announced again.
    fn handle_reconnect(&self, _: &Value) {
        let state = self.state();

        if let (Some(room), Some(user)) = (&state.room, &state.current_user) {
            info!("Rejoining room {} after reconnecting", room.code);

            let request = ClientEvent::JoinRoom {
                room_code: room.code.clone(),
                user: UserIdentity::from(user),
            };

            if let Err(e) = self.context.transport.try_emit(request) {
                warn!("Could not rejoin room {}: {e}", room.code);
            }
        }
    }

    fn handle_disconnect(&self, _: &Value) {
        self.update(|s| s.connection = ConnectionStatus::Reconnecting);
    }

    fn handle_reconnect_failed(&self, _: &Value) {
        self.update(|s| s.connection = ConnectionStatus::Disconnected);
    }

    /// Starts a new operation, superseding the ones in flight.
    fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), CollabError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            debug!("Discarding result of a superseded room operation");
            Err(CollabError::Superseded)
        }
    }

    /// Records an error, unless the operation it belongs to was superseded.
    fn fail(&self, epoch: u64, error: impl Into<CollabError>) -> CollabError {
        let error = error.into();

        if self.is_current(epoch) && !matches!(error, CollabError::Superseded) {
            self.update(|s| s.error = Some(error.to_string()));
        }

        error
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut RoomState),
    {
        let snapshot = {
            let mut state = self.state.lock();
            f(&mut state);

            state.clone()
        };

        self.listeners.notify(&snapshot);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use listentogether_core::{EventMessage, LinkEnd};
    use serde_json::json;

    use super::*;
    use crate::{testing::*, ApiError};

    fn setup() -> (Arc<RoomStore>, Harness) {
        let harness = Harness::new();
        let store = RoomStore::new(&harness.context);

        (store, harness)
    }

    async fn wait_for<F>(store: &RoomStore, predicate: F) -> RoomState
    where
        F: Fn(&RoomState) -> bool,
    {
        eventually(|| Some(store.state()).filter(|s| predicate(s))).await
    }

    async fn joined(store: &Arc<RoomStore>, harness: &Harness) -> LinkEnd {
        harness.api.add_room("ROOM1", &["Alice"]);
        store.join_room("ROOM1", "Bob").await.unwrap();

        let mut end = harness.connector.last_end();
        let join = next_message(&mut end).await;
        assert_eq!(join.name, events::JOIN_ROOM);

        end
    }

    #[tokio::test]
    async fn create_room_stores_state_and_session() {
        let (store, harness) = setup();

        let session = store.create_room("Room", "Alice").await.unwrap();
        let state = store.state();

        assert_eq!(state.room_code(), Some(session.room.code.as_str()));
        assert_eq!(state.current_user.as_ref().unwrap().id, session.user.id);
        assert!(state.is_host());

        let stored = harness.context.sessions.session().unwrap();
        assert_eq!(stored.user_name, "Alice");
        assert_eq!(stored.room_code, session.room.code);

        // Creating does not connect
        assert_eq!(harness.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn failed_create_records_the_error() {
        let (store, harness) = setup();
        harness
            .api
            .fail_next(ApiError::new("Server is full", Some(503)));

        let error = store.create_room("Room", "Alice").await.unwrap_err();

        assert_eq!(error.to_string(), "Server is full");
        assert_eq!(store.state().error.as_deref(), Some("Server is full"));

        store.clear_error();
        assert_eq!(store.state().error, None);
    }

    #[tokio::test]
    async fn join_room_announces_presence() {
        let (store, harness) = setup();
        harness.api.add_room("ROOM1", &["Alice"]);

        store.join_room("ROOM1", "Bob").await.unwrap();

        let mut end = harness.connector.last_end();
        let join = next_message(&mut end).await;

        assert_eq!(join.name, events::JOIN_ROOM);
        assert_eq!(join.payload["roomCode"], "ROOM1");
        assert_eq!(join.payload["user"]["name"], "Bob");

        let state = store.state();
        assert_eq!(state.connection, ConnectionStatus::Connected);
        assert_eq!(state.room.unwrap().members.len(), 2);
    }

    #[tokio::test]
    async fn joining_twice_installs_handlers_once() {
        let (store, harness) = setup();
        harness.api.add_room("ROOM1", &["Alice"]);

        store.join_room("ROOM1", "Bob").await.unwrap();
        store.join_room("ROOM1", "Bob").await.unwrap();

        assert_eq!(harness.context.transport.handler_count(events::ROOM_UPDATED), 1);
    }

    #[tokio::test]
    async fn room_events_replace_the_room() {
        let (store, harness) = setup();
        let end = joined(&store, &harness).await;

        let mut room = harness.api.room("ROOM1");
        room.members.push(member("u9", "Carol"));
        room.members.push(member("u9", "Carol"));

        end.emit(EventMessage::new(
            events::USER_JOINED,
            json!({ "room": room, "user": member("u9", "Carol") }),
        ));

        let state = wait_for(&store, |s| s.room.as_ref().unwrap().members.len() == 3).await;
        assert_eq!(state.room.unwrap().members[2].name, "Carol");
    }

    #[tokio::test]
    async fn participant_list_replaces_members() {
        let (store, harness) = setup();
        let end = joined(&store, &harness).await;

        end.emit(EventMessage::new(
            events::PARTICIPANT_LIST,
            json!([member("u1", "Alice")]),
        ));

        let state = wait_for(&store, |s| s.room.as_ref().unwrap().members.len() == 1).await;
        assert_eq!(state.room.unwrap().members[0].name, "Alice");
    }

    #[tokio::test]
    async fn deleted_room_resets_state() {
        let (store, harness) = setup();
        let end = joined(&store, &harness).await;

        end.emit(EventMessage::new(events::ROOM_DELETED, Value::Null));

        let state = wait_for(&store, |s| s.room.is_none()).await;
        assert_eq!(state.error.as_deref(), Some("Room was deleted"));
        assert_eq!(state.current_user, None);
        assert_eq!(state.connection, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn reconnecting_rejoins_the_room() {
        let (store, harness) = setup();
        let end = joined(&store, &harness).await;

        end.close("transport close");

        let mut end = harness.connector.wait_for_link(2).await;
        let mut names = Vec::new();

        for _ in 0..2 {
            names.push(next_message(&mut end).await.name);
        }

        assert!(names.contains(&events::JOIN_ROOM.to_string()));
        assert!(names.contains(&events::GET_PARTICIPANTS.to_string()));
        wait_for(&store, |s| s.connection == ConnectionStatus::Connected).await;
    }

    #[tokio::test]
    async fn restore_without_session_does_nothing() {
        let (store, harness) = setup();

        assert_eq!(
            store.restore_session("ROOM1").await,
            RestoreOutcome::NoSession
        );
        assert_eq!(harness.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn restore_with_another_room_moves_the_session() {
        let (store, harness) = setup();
        harness.api.add_room("ROOM2", &["Alice"]);
        harness.context.sessions.store_session("u5", "Bob", "ROOM1");

        let outcome = store.restore_session("ROOM2").await;

        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(store.state().room_code(), Some("ROOM2"));
        assert_eq!(
            harness.context.sessions.session().unwrap().room_code,
            "ROOM2"
        );
    }

    #[tokio::test]
    async fn restore_of_a_missing_room_clears_the_session() {
        let (store, harness) = setup();
        harness.context.sessions.store_session("u5", "Bob", "GONE");

        let outcome = store.restore_session("GONE").await;

        assert_eq!(outcome, RestoreOutcome::RoomNotFound);
        assert!(harness.context.sessions.session().is_none());
    }

    #[tokio::test]
    async fn restore_failure_for_other_reasons() {
        let (store, harness) = setup();
        harness.context.sessions.store_session("u5", "Bob", "ROOM1");
        harness
            .api
            .fail_next(ApiError::new("HTTP error! status: 500", Some(500)));

        assert_eq!(store.restore_session("ROOM1").await, RestoreOutcome::Failed);
        assert!(harness.context.sessions.session().is_none());
    }

    #[tokio::test]
    async fn switch_room_leaves_the_previous_one() {
        let (store, harness) = setup();
        let mut end = joined(&store, &harness).await;
        harness.api.add_room("ROOM2", &["Carol"]);

        assert!(store.switch_room("ROOM2").await);

        let mut names = Vec::new();
        while names.len() < 2 {
            let message = next_message(&mut end).await;

            if message.name != events::GET_PARTICIPANTS {
                names.push((message.name, message.payload["roomCode"].clone()));
            }
        }

        assert_eq!(names[0], (events::LEAVE_ROOM.to_string(), json!("ROOM1")));
        assert_eq!(names[1], (events::JOIN_ROOM.to_string(), json!("ROOM2")));
        assert_eq!(store.state().room_code(), Some("ROOM2"));
    }

    #[tokio::test]
    async fn switch_room_fails_without_a_session() {
        let (store, harness) = setup();
        harness.api.add_room("ROOM2", &["Carol"]);

        assert!(!store.switch_room("ROOM2").await);
    }

    #[tokio::test]
    async fn leave_room_resets_everything() {
        let (store, harness) = setup();
        let mut end = joined(&store, &harness).await;

        store.leave_room();

        loop {
            let message = next_message(&mut end).await;

            if message.name == events::LEAVE_ROOM {
                break;
            }
        }

        assert_eq!(store.state(), RoomState::default());
        assert!(harness.context.sessions.session().is_none());
        assert_eq!(harness.context.transport.handler_count(events::ROOM_UPDATED), 0);

        // Safe without a room too
        store.leave_room();
    }

    #[tokio::test]
    async fn superseded_results_are_discarded() {
        let (store, harness) = setup();
        harness.api.add_room("SLOW", &["Alice"]);
        harness.api.add_room("FAST", &["Carol"]);
        harness.api.delay_room("SLOW", Duration::from_millis(200));

        let (slow, fast) = tokio::join!(
            store.join_room("SLOW", "Bob"),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.join_room("FAST", "Bob").await
            }
        );

        assert!(matches!(slow, Err(CollabError::Superseded)));
        assert!(fast.is_ok());
        assert_eq!(store.state().room_code(), Some("FAST"));
        assert_eq!(store.state().error, None);
    }

    #[tokio::test]
    async fn listeners_see_every_change() {
        let (store, harness) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = store.subscribe(move |state| sink.lock().push(state.connection));

        harness.api.add_room("ROOM1", &["Alice"]);
        store.join_room("ROOM1", "Bob").await.unwrap();

        assert!(seen.lock().contains(&ConnectionStatus::Connecting));
        assert!(seen.lock().contains(&ConnectionStatus::Connected));

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
    }
}
