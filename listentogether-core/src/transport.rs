use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    events, BoxedConnector, ClientEvent, Config, Connector, EventMessage, Id, Link, LinkEvent,
    LinkReceiver, LinkSender, MusicState, QueueItemComplete, QueueItemError, QueueItemProgress,
    QueueSnapshot, User, UserIdentity,
};

/// Marker for [SubscriptionId].
pub struct Subscription;

pub type SubscriptionId = Id<Subscription>;
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

type PendingConnect = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("Server rejected the connection: {0}")]
    Rejected(String),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid server url: {0}")]
    InvalidUrl(String),
}

/// The observable state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection dropped and the retry policy is running
    Reconnecting { attempt: u32 },
}

enum Slot {
    Idle,
    Connecting(PendingConnect),
    Connected(LinkSender),
    Reconnecting { attempt: u32 },
}

/// The slot plus an epoch, bumped whenever a new connection lifecycle starts.
/// Work belonging to an older epoch is discarded.
struct Status {
    epoch: u64,
    slot: Slot,
}

struct Inner {
    config: Config,
    connector: BoxedConnector,
    status: Mutex<Status>,
    handlers: DashMap<String, Vec<(SubscriptionId, Handler)>>,
}

/// A single persistent connection to the server, multiplexing every real-time event.
///
/// Cloning is cheap and every clone refers to the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new<C>(config: &Config, connector: C) -> Self
    where
        C: Connector,
    {
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: &Config, connector: BoxedConnector) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                connector,
                status: Mutex::new(Status {
                    epoch: 0,
                    slot: Slot::Idle,
                }),
                handlers: Default::default(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &self.inner.status.lock().slot {
            Slot::Idle => ConnectionState::Disconnected,
            Slot::Connecting(_) => ConnectionState::Connecting,
            Slot::Connected(_) => ConnectionState::Connected,
            Slot::Reconnecting { attempt } => ConnectionState::Reconnecting { attempt: *attempt },
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.inner.status.lock().slot, Slot::Connected(_))
    }

    /// Ensures the connection is established.
    ///
    /// Returns immediately if connected. If an attempt is already in flight, every caller waits on that
    /// same attempt instead of starting another one.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let pending = {
            let mut status = self.inner.status.lock();

            match &status.slot {
                Slot::Connected(_) => return Ok(()),
                Slot::Connecting(pending) => pending.clone(),
                Slot::Idle | Slot::Reconnecting { .. } => {
                    status.epoch += 1;

                    let pending = self.clone().establish(status.epoch).boxed().shared();
                    status.slot = Slot::Connecting(pending.clone());

                    pending
                }
            }
        };

        pending.await
    }

    /// Tears down the connection and every handler. Safe to call at any time.
    pub fn disconnect(&self) {
        let previous = {
            let mut status = self.inner.status.lock();
            status.epoch += 1;

            std::mem::replace(&mut status.slot, Slot::Idle)
        };

        if matches!(previous, Slot::Connected(_)) {
            info!("Manually disconnecting");
        }

        self.inner.handlers.clear();
    }

    /// Connects if needed, then emits an event.
    pub async fn emit(&self, message: impl Into<EventMessage>) -> Result<(), TransportError> {
        self.connect().await?;
        self.try_emit(message)
    }

    /// Emits an event on the current connection, failing if there is none.
    pub fn try_emit(&self, message: impl Into<EventMessage>) -> Result<(), TransportError> {
        let message = message.into();
        let status = self.inner.status.lock();

        match &status.slot {
            Slot::Connected(sender) => {
                debug!("Emitting {}", message.name);

                sender
                    .send(message)
                    .map_err(|_| TransportError::Closed("link is gone".to_string()))
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Connects if needed and announces presence in a room.
    /// Without a user, a guest identity is announced.
    pub async fn join_room(
        &self,
        room_code: &str,
        user: Option<UserIdentity>,
    ) -> Result<(), TransportError> {
        let user = user.unwrap_or_else(UserIdentity::guest);

        self.emit(ClientEvent::JoinRoom {
            room_code: room_code.to_string(),
            user,
        })
        .await
    }

    /// Announces leaving a room. Does nothing when not connected.
    pub fn leave_room(&self, room_code: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.try_emit(ClientEvent::LeaveRoom {
            room_code: room_code.to_string(),
        })
    }

    /// Requests the member list of a room, delivered later as a participant-list event.
    pub async fn get_participants(&self, room_code: &str) -> Result<(), TransportError> {
        debug!("Requesting participants for room {room_code}");

        self.emit(ClientEvent::GetParticipants {
            room_code: room_code.to_string(),
        })
        .await
    }

    /// Registers a handler for a named event.
    pub fn on<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();

        self.inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        id
    }

    /// Removes one handler of an event, or all of them when no id is given.
    pub fn off(&self, event: &str, subscription: Option<SubscriptionId>) {
        let Some(id) = subscription else {
            self.inner.handlers.remove(event);
            return;
        };

        if let Some(mut handlers) = self.inner.handlers.get_mut(event) {
            handlers.retain(|(i, _)| *i != id);
            debug!("Removed handler {id:?} of {event}");
        }

        self.inner.handlers.remove_if(event, |_, h| h.is_empty());
    }

    /// Whether a handler is still registered. Disconnecting removes every handler.
    pub fn is_subscribed(&self, event: &str, subscription: SubscriptionId) -> bool {
        self.inner
            .handlers
            .get(event)
            .is_some_and(|handlers| handlers.iter().any(|(id, _)| *id == subscription))
    }

    /// Number of handlers registered for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner.handlers.get(event).map(|h| h.len()).unwrap_or(0)
    }

    /// Registers a handler that receives the payload deserialized.
    /// Payloads that don't match are logged and dropped.
    pub fn on_typed<T, F>(&self, event: &'static str, handler: F) -> SubscriptionId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on(event, move |payload| match T::deserialize(payload) {
            Ok(value) => handler(value),
            Err(e) => warn!("Dropping malformed {event} payload: {e}"),
        })
    }

    pub fn on_queue_updated<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(QueueSnapshot) + Send + Sync + 'static,
    {
        self.on_typed(events::QUEUE_UPDATED, handler)
    }

    pub fn on_music_state<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(MusicState) + Send + Sync + 'static,
    {
        self.on_typed(events::MUSIC_STATE, handler)
    }

    pub fn on_queue_item_progress<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(QueueItemProgress) + Send + Sync + 'static,
    {
        self.on_typed(events::QUEUE_ITEM_PROGRESS, handler)
    }

    pub fn on_queue_item_complete<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(QueueItemComplete) + Send + Sync + 'static,
    {
        self.on_typed(events::QUEUE_ITEM_COMPLETE, handler)
    }

    pub fn on_queue_item_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(QueueItemError) + Send + Sync + 'static,
    {
        self.on_typed(events::QUEUE_ITEM_ERROR, handler)
    }

    pub fn on_participant_list<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Vec<User>) + Send + Sync + 'static,
    {
        self.on_typed(events::PARTICIPANT_LIST, move |participants: Vec<User>| {
            debug!("Participant list received ({} members)", participants.len());
            handler(participants)
        })
    }

    pub fn off_queue_updated(&self) {
        self.off(events::QUEUE_UPDATED, None)
    }

    pub fn off_music_state(&self) {
        self.off(events::MUSIC_STATE, None)
    }

    pub fn off_queue_item_progress(&self) {
        self.off(events::QUEUE_ITEM_PROGRESS, None)
    }

    pub fn off_queue_item_complete(&self) {
        self.off(events::QUEUE_ITEM_COMPLETE, None)
    }

    pub fn off_queue_item_error(&self) {
        self.off(events::QUEUE_ITEM_ERROR, None)
    }

    pub fn off_participant_list(&self) {
        self.off(events::PARTICIPANT_LIST, None)
    }

    /// Calls the handlers of an event in registration order.
    fn dispatch(&self, event: &str, payload: &Value) {
        // Copy the handlers out, so they can subscribe and unsubscribe while running
        let handlers: Vec<Handler> = match self.inner.handlers.get(event) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => {
                debug!("No handlers for {event}");
                return;
            }
        };

        for handler in handlers {
            handler(payload)
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.status.lock().epoch == epoch
    }

    async fn open_link(&self) -> Result<Link, TransportError> {
        let limit = self.inner.config.connect_timeout;

        tokio::time::timeout(limit, self.inner.connector.open())
            .await
            .map_err(|_| TransportError::Timeout(limit))?
    }

    async fn establish(self, epoch: u64) -> Result<(), TransportError> {
        info!("Connecting to server...");

        match self.open_link().await {
            Ok(link) => {
                if !self.attach(link, epoch, None) {
                    return Err(TransportError::Closed(
                        "disconnected while connecting".to_string(),
                    ));
                }

                Ok(())
            }
            Err(error) => {
                error!("Connection error: {error}");

                {
                    let mut status = self.inner.status.lock();

                    if status.epoch == epoch {
                        status.slot = Slot::Idle;
                    }
                }

                self.dispatch(events::CONNECT_ERROR, &Value::String(error.to_string()));
                Err(error)
            }
        }
    }

    /// Makes a freshly opened link the current one, unless its epoch has passed.
    fn attach(&self, link: Link, epoch: u64, reconnect_attempt: Option<u32>) -> bool {
        let Link {
            sid,
            sender,
            receiver,
        } = link;

        {
            let mut status = self.inner.status.lock();

            // Dropping the link here closes it
            if status.epoch != epoch {
                return false;
            }

            status.slot = Slot::Connected(sender);
        }

        info!(
            "Connected to server with id {}",
            sid.as_deref().unwrap_or("unknown")
        );

        tokio::spawn(self.clone().pump(epoch, receiver, reconnect_attempt));
        true
    }

    /// Dispatches the events of one link, in arrival order, until it closes.
    async fn pump(self, epoch: u64, mut receiver: LinkReceiver, reconnect_attempt: Option<u32>) {
        if let Some(attempt) = reconnect_attempt {
            info!("Reconnected after {attempt} attempts");
            self.dispatch(events::RECONNECT, &json!(attempt));
        }

        self.dispatch(events::CONNECT, &Value::Null);

        let reason = loop {
            match receiver.recv().await {
                Some(LinkEvent::Message(message)) => {
                    if !self.is_current(epoch) {
                        return;
                    }

                    self.dispatch(&message.name, &message.payload)
                }
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break "transport close".to_string(),
            }
        };

        {
            let mut status = self.inner.status.lock();

            // A manual disconnect already moved on
            if status.epoch != epoch {
                return;
            }

            status.slot = Slot::Reconnecting { attempt: 0 };
        }

        warn!("Disconnected from server: {reason}");
        self.dispatch(events::DISCONNECT, &Value::String(reason));

        self.reconnect(epoch).await
    }

    async fn reconnect(&self, epoch: u64) {
        let attempts = self.inner.config.reconnection_attempts;
        let delay = self.inner.config.reconnection_delay;

        for attempt in 1..=attempts {
            tokio::time::sleep(delay).await;

            {
                let mut status = self.inner.status.lock();

                if status.epoch != epoch {
                    return;
                }

                status.slot = Slot::Reconnecting { attempt };
            }

            debug!("Reconnection attempt {attempt}/{attempts}");
            self.dispatch(events::RECONNECT_ATTEMPT, &json!(attempt));

            match self.open_link().await {
                Ok(link) => {
                    self.attach(link, epoch, Some(attempt));
                    return;
                }
                Err(error) => {
                    warn!("Reconnection error: {error}");
                    self.dispatch(events::RECONNECT_ERROR, &Value::String(error.to_string()));
                }
            }
        }

        {
            let mut status = self.inner.status.lock();

            if status.epoch != epoch {
                return;
            }

            status.slot = Slot::Idle;
        }

        error!("Could not reconnect after {attempts} attempts");
        self.dispatch(events::RECONNECT_FAILED, &Value::Null);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::{
        sync::mpsc::{unbounded_channel, UnboundedReceiver},
        time::timeout,
    };

    use super::*;
    use crate::LinkEnd;

    /// Hands out in-memory links and keeps the server ends around for the test.
    #[derive(Default)]
    struct FakeConnector {
        attempts: AtomicUsize,
        delay: Duration,
        failures_left: AtomicUsize,
        ends: Mutex<Vec<LinkEnd>>,
    }

    #[async_trait]
    impl Connector for Arc<FakeConnector> {
        async fn open(&self) -> Result<Link, TransportError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Connect("refused".to_string()));
            }

            let (link, end) = Link::in_memory(format!("sid-{attempt}"));
            self.ends.lock().push(end);

            Ok(link)
        }
    }

    impl FakeConnector {
        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn last_end(&self) -> LinkEnd {
            self.ends.lock().pop().expect("a link was opened")
        }
    }

    fn test_config() -> Config {
        Config {
            connect_timeout: Duration::from_millis(200),
            reconnection_attempts: 3,
            reconnection_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn setup(connector: FakeConnector) -> (Transport, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        let transport = Transport::new(&test_config(), connector.clone());

        (transport, connector)
    }

    /// Forwards every payload of an event into a channel.
    fn record(transport: &Transport, event: &str) -> UnboundedReceiver<Value> {
        let (sender, receiver) = unbounded_channel();
        transport.on(event, move |payload| {
            let _ = sender.send(payload.clone());
        });

        receiver
    }

    async fn next<T>(receiver: &mut UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("value arrives in time")
            .expect("channel is open")
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let (transport, connector) = setup(FakeConnector {
            delay: Duration::from_millis(50),
            ..Default::default()
        });

        let (first, second) = tokio::join!(transport.connect(), transport.connect());

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(connector.attempts(), 1);
        assert!(transport.is_connected());

        transport.connect().await.unwrap();
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn failed_connect_can_be_retried() {
        let (transport, connector) = setup(FakeConnector {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });

        let error = transport.connect().await.unwrap_err();

        assert_eq!(error, TransportError::Connect("refused".to_string()));
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        transport.connect().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn connect_times_out() {
        let (transport, _) = setup(FakeConnector {
            delay: Duration::from_secs(5),
            ..Default::default()
        });

        let error = transport.connect().await.unwrap_err();

        assert_eq!(error, TransportError::Timeout(Duration::from_millis(200)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn join_room_announces_a_guest_when_no_user_is_given() {
        let (transport, connector) = setup(FakeConnector::default());

        transport.join_room("ROOM1", None).await.unwrap();

        let mut end = connector.last_end();
        let message = next(&mut end.receiver).await;

        assert_eq!(message.name, events::JOIN_ROOM);
        assert_eq!(message.payload["roomCode"], "ROOM1");
        assert_eq!(message.payload["user"]["name"], "Guest");
        assert!(message.payload["user"]["id"]
            .as_str()
            .unwrap()
            .starts_with("guest-"));
    }

    #[tokio::test]
    async fn leave_room_is_a_noop_when_disconnected() {
        let (transport, connector) = setup(FakeConnector::default());

        transport.leave_room("ROOM1").unwrap();

        assert_eq!(connector.attempts(), 0);
        assert_eq!(
            transport.try_emit(EventMessage::new("x", Value::Null)),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn events_reach_handlers_until_removed() {
        let (transport, connector) = setup(FakeConnector::default());
        let mut updates = record(&transport, "room-updated");
        let mut other = record(&transport, "room-updated");

        transport.connect().await.unwrap();
        let end = connector.last_end();

        end.emit(EventMessage::new("room-updated", json!({ "code": "A" })));
        assert_eq!(next(&mut updates).await, json!({ "code": "A" }));
        assert_eq!(next(&mut other).await, json!({ "code": "A" }));

        transport.off("room-updated", None);
        assert_eq!(transport.handler_count("room-updated"), 0);
    }

    #[tokio::test]
    async fn off_with_an_id_keeps_other_handlers() {
        let (transport, _) = setup(FakeConnector::default());

        let first = transport.on("music-state", |_| {});
        transport.on("music-state", |_| {});

        transport.off("music-state", Some(first));
        assert_eq!(transport.handler_count("music-state"), 1);
    }

    #[tokio::test]
    async fn typed_subscriptions_deserialize_payloads() {
        let (transport, connector) = setup(FakeConnector::default());
        let (sender, mut receiver) = unbounded_channel();

        transport.on_queue_item_progress(move |progress| {
            let _ = sender.send(progress);
        });

        transport.connect().await.unwrap();
        let end = connector.last_end();

        // Malformed payloads are dropped, the next one still arrives
        end.emit(EventMessage::new("queueItemProgress", json!({ "nope": true })));
        end.emit(EventMessage::new(
            "queueItemProgress",
            json!({ "queueItemId": "abc", "progress": 40, "status": "downloading" }),
        ));

        let progress = next(&mut receiver).await;
        assert_eq!(progress.progress, 40.);
        assert_eq!(progress.queue_item_id.to_string(), "abc");
    }

    #[tokio::test]
    async fn unexpected_close_reconnects() {
        let (transport, connector) = setup(FakeConnector::default());
        let mut disconnects = record(&transport, events::DISCONNECT);
        let mut reconnects = record(&transport, events::RECONNECT);

        transport.connect().await.unwrap();
        connector.last_end().close("transport close");

        assert_eq!(next(&mut disconnects).await, json!("transport close"));
        assert_eq!(next(&mut reconnects).await, json!(1));
        assert!(transport.is_connected());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn reconnection_gives_up_after_the_bounded_attempts() {
        let (transport, connector) = setup(FakeConnector::default());
        let mut failed = record(&transport, events::RECONNECT_FAILED);

        transport.connect().await.unwrap();
        connector.failures_left.store(10, Ordering::SeqCst);
        connector.last_end().close("transport close");

        next(&mut failed).await;

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_drops_handlers() {
        let (transport, connector) = setup(FakeConnector::default());
        transport.on("room-updated", |_| {});

        transport.connect().await.unwrap();
        transport.disconnect();
        transport.disconnect();

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert_eq!(transport.handler_count("room-updated"), 0);

        // The server side sees the link go away
        let mut end = connector.last_end();
        assert!(timeout(Duration::from_secs(1), end.receiver.recv())
            .await
            .unwrap()
            .is_none());
    }
}
