//! Names and payloads of the events carried by the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Room, User, UserIdentity};

// Server to client
pub const ROOM_UPDATED: &str = "room-updated";
pub const USER_JOINED: &str = "user-joined";
pub const USER_LEFT: &str = "user-left";
pub const HOST_CHANGED: &str = "host-changed";
pub const ROOM_DELETED: &str = "room-deleted";
pub const PARTICIPANT_LIST: &str = "participant-list";
pub const QUEUE_UPDATED: &str = "queueUpdated";
pub const MUSIC_STATE: &str = "music-state";
pub const QUEUE_ITEM_PROGRESS: &str = "queueItemProgress";
pub const QUEUE_ITEM_COMPLETE: &str = "queueItemComplete";
pub const QUEUE_ITEM_ERROR: &str = "queueItemError";

// Client to server
pub const JOIN_ROOM: &str = "join-room";
pub const LEAVE_ROOM: &str = "leave-room";
pub const GET_PARTICIPANTS: &str = "get-participants";

// Emitted by the transport itself
pub const CONNECT: &str = "connect";
pub const CONNECT_ERROR: &str = "connect_error";
pub const DISCONNECT: &str = "disconnect";
pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";
pub const RECONNECT: &str = "reconnect";
pub const RECONNECT_ERROR: &str = "reconnect_error";
pub const RECONNECT_FAILED: &str = "reconnect_failed";

/// A named event with a JSON payload, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub name: String,
    pub payload: Value,
}

impl EventMessage {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Describes the events a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Announce presence in a room.
    JoinRoom {
        room_code: String,
        user: UserIdentity,
    },
    /// Announce departure from a room.
    LeaveRoom { room_code: String },
    /// Ask for a full member list. The answer arrives as a participant-list event.
    GetParticipants { room_code: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => JOIN_ROOM,
            Self::LeaveRoom { .. } => LEAVE_ROOM,
            Self::GetParticipants { .. } => GET_PARTICIPANTS,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomCodePayload<'a> {
    room_code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomPayload<'a> {
    room_code: &'a str,
    user: &'a UserIdentity,
}

impl From<ClientEvent> for EventMessage {
    fn from(event: ClientEvent) -> Self {
        let payload = match &event {
            ClientEvent::JoinRoom { room_code, user } => {
                serde_json::to_value(JoinRoomPayload { room_code, user })
            }
            ClientEvent::LeaveRoom { room_code } | ClientEvent::GetParticipants { room_code } => {
                serde_json::to_value(RoomCodePayload { room_code })
            }
        }
        .unwrap_or_default();

        EventMessage::new(event.name(), payload)
    }
}

/// Payload of the room events.
///
/// Membership events wrap the room together with the affected user, room updates send the room itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoomPayload {
    Wrapped {
        room: Room,
        #[serde(default)]
        user: Option<User>,
    },
    Bare(Room),
}

impl RoomPayload {
    pub fn into_room(self) -> Room {
        match self {
            Self::Wrapped { room, user: _ } => room,
            Self::Bare(room) => room,
        }
    }
}
