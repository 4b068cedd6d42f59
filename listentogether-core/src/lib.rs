//! The real-time half of a listentogether client: the data model shared with the server,
//! the socket.io wire format, and the transport that keeps one connection alive.

mod config;
mod connector;
mod data;
mod transport;
mod util;
mod websocket;

pub mod events;
pub mod protocol;

pub use config::*;
pub use connector::*;
pub use data::*;
pub use events::{ClientEvent, EventMessage, RoomPayload};
pub use transport::*;
pub use util::*;
pub use websocket::*;
