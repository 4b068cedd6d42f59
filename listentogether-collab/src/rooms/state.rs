use listentogether_core::{Room, User};

/// How the room store sees the real-time connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything known about the room the user is in
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomState {
    pub room: Option<Room>,
    pub current_user: Option<User>,
    pub connection: ConnectionStatus,
    /// The last failure, shown to the user until cleared
    pub error: Option<String>,
}

impl RoomState {
    pub fn room_code(&self) -> Option<&str> {
        self.room.as_ref().map(|r| r.code.as_str())
    }

    /// Whether the current user hosts the room
    pub fn is_host(&self) -> bool {
        match (&self.room, &self.current_user) {
            (Some(room), Some(user)) => room.host_id == user.id || user.is_host,
            _ => false,
        }
    }

    /// Replaces the room, refreshing the current user from the new member list.
    pub(super) fn set_room(&mut self, room: Room) {
        if let Some(user) = &self.current_user {
            if let Some(member) = room.member(&user.id) {
                self.current_user = Some(member.clone());
            }
        }

        self.room = Some(room);
    }
}

/// How restoring a stored session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    /// Nothing was stored, or it expired
    NoSession,
    /// The room is gone, the stored session was cleared
    RoomNotFound,
    /// The server could not be reached or refused, the stored session was cleared
    Failed,
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored)
    }
}
