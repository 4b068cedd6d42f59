use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{EventMessage, TransportError};

pub type LinkSender = UnboundedSender<EventMessage>;
pub type LinkReceiver = UnboundedReceiver<LinkEvent>;
pub type BoxedConnector = Arc<dyn Connector>;

/// Something arriving over an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(EventMessage),
    /// The link is gone. Nothing follows this.
    Closed(String),
}

/// An established, acknowledged connection to the server.
///
/// Dropping the sender closes the link.
pub struct Link {
    /// The id the server assigned to this connection, if any
    pub sid: Option<String>,
    pub sender: LinkSender,
    pub receiver: LinkReceiver,
}

/// The server side of an in-memory [Link].
pub struct LinkEnd {
    /// Delivers events to the client
    pub sender: UnboundedSender<LinkEvent>,
    /// Receives what the client emits
    pub receiver: UnboundedReceiver<EventMessage>,
}

impl Link {
    /// Creates a link whose other end is held in memory.
    /// Used by connectors that do not go over the network.
    pub fn in_memory(sid: impl Into<String>) -> (Link, LinkEnd) {
        let (client_sender, server_receiver) = unbounded_channel();
        let (server_sender, client_receiver) = unbounded_channel();

        let link = Link {
            sid: Some(sid.into()),
            sender: client_sender,
            receiver: client_receiver,
        };

        let end = LinkEnd {
            sender: server_sender,
            receiver: server_receiver,
        };

        (link, end)
    }
}

impl LinkEnd {
    /// Sends an event to the client, returning false if the client is gone.
    pub fn emit(&self, message: EventMessage) -> bool {
        self.sender.send(LinkEvent::Message(message)).is_ok()
    }

    /// Closes the link from the server side.
    pub fn close(&self, reason: &str) {
        let _ = self.sender.send(LinkEvent::Closed(reason.to_string()));
    }
}

/// Represents a type that can open links to the server.
///
/// The transport owns reconnection, timeouts, and event dispatch. A connector only has to produce
/// a link once the server acknowledged the connection.
#[async_trait]
pub trait Connector
where
    Self: Send + Sync + 'static,
{
    async fn open(&self) -> Result<Link, TransportError>;
}
