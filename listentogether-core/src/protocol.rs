//! Text encoding of the socket.io v4 protocol, carried over engine.io v4 websocket frames.
//!
//! Every websocket frame holds one engine.io packet: a type digit followed by its data.
//! Socket.io packets travel inside engine.io `message` packets and look like
//! `<type>[<namespace>,][<ack id>][<json>]`, e.g. `42["queueUpdated",{...}]`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::EventMessage;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty packet")]
    Empty,
    #[error("Unknown packet type {0:?}")]
    UnknownType(char),
    #[error("{0} packets are not supported")]
    Unsupported(&'static str),
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The engine.io handshake, sent by the server in the `open` packet
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Milliseconds between server pings
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    pub ping_timeout: u64,
    #[serde(default)]
    pub upgrades: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let data = chars.as_str();

        let packet = match kind {
            '0' => Self::Open(serde_json::from_str(data)?),
            '1' => Self::Close,
            '2' => Self::Ping(data.to_string()),
            '3' => Self::Pong(data.to_string()),
            '4' => Self::Message(data.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => return Err(ProtocolError::UnknownType(other)),
        };

        Ok(packet)
    }

    pub fn encode(&self) -> String {
        match self {
            // Clients never send open packets, the handshake is only relevant for the shape
            Self::Open(handshake) => format!("0{{\"sid\":\"{}\"}}", handshake.sid),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Connect request from the client, or acknowledgment from the server
    Connect(Option<Value>),
    Disconnect,
    Event {
        ack_id: Option<u64>,
        name: String,
        /// The first argument of the event, or null if there is none
        payload: Value,
    },
    Ack {
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    /// Decodes the data of an engine.io message packet.
    ///
    /// Packets addressed to namespaces other than the default one are decoded too, the namespace is dropped.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(ProtocolError::Empty)?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(ProtocolError::Unsupported("Binary"));
        }

        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(index) => &rest[index + 1..],
                None => "",
            };
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let ack_id = match digits {
            0 => None,
            n => Some(
                rest[..n]
                    .parse::<u64>()
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?,
            ),
        };
        let json = &rest[digits..];

        let packet = match kind {
            '0' => Self::Connect(parse_optional(json)?),
            '1' => Self::Disconnect,
            '2' => {
                let mut args = parse_args(json)?.into_iter();

                let name = match args.next() {
                    Some(Value::String(name)) => name,
                    _ => return Err(ProtocolError::Malformed("event without a name".to_string())),
                };

                Self::Event {
                    ack_id,
                    name,
                    payload: args.next().unwrap_or(Value::Null),
                }
            }
            '3' => Self::Ack {
                ack_id: ack_id
                    .ok_or_else(|| ProtocolError::Malformed("ack without an id".to_string()))?,
                args: parse_args(json)?,
            },
            '4' => Self::ConnectError(parse_optional(json)?.unwrap_or(Value::Null)),
            other => return Err(ProtocolError::UnknownType(other)),
        };

        Ok(packet)
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_string(),
            Self::Connect(Some(auth)) => format!("0{auth}"),
            Self::Disconnect => "1".to_string(),
            Self::Event {
                ack_id,
                name,
                payload,
            } => {
                let args = match payload {
                    Value::Null => Value::Array(vec![Value::String(name.clone())]),
                    payload => Value::Array(vec![Value::String(name.clone()), payload.clone()]),
                };

                match ack_id {
                    Some(id) => format!("2{id}{args}"),
                    None => format!("2{args}"),
                }
            }
            Self::Ack { ack_id, args } => format!("3{ack_id}{}", Value::Array(args.clone())),
            Self::ConnectError(data) => format!("4{data}"),
        }
    }

    /// Wraps the packet in an engine.io message, ready to be sent as a text frame.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

impl From<EventMessage> for SocketPacket {
    fn from(message: EventMessage) -> Self {
        Self::Event {
            ack_id: None,
            name: message.name,
            payload: message.payload,
        }
    }
}

fn parse_optional(json: &str) -> Result<Option<Value>, ProtocolError> {
    if json.is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(json)?))
}

fn parse_args(json: &str) -> Result<Vec<Value>, ProtocolError> {
    match serde_json::from_str(json)? {
        Value::Array(args) => Ok(args),
        _ => Err(ProtocolError::Malformed("arguments are not an array".to_string())),
    }
}

/// Extracts a human readable reason from a connect error payload.
pub fn connect_error_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_open_packet() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#,
        )
        .unwrap();

        match packet {
            EnginePacket::Open(handshake) => {
                assert_eq!(handshake.sid, "abc");
                assert_eq!(handshake.ping_interval, 25000);
                assert_eq!(handshake.ping_timeout, 20000);
            }
            other => panic!("expected open packet, got {other:?}"),
        }
    }

    #[test]
    fn ping_is_answered_with_matching_pong() {
        let ping = EnginePacket::decode("2").unwrap();
        assert_eq!(ping, EnginePacket::Ping(String::new()));

        let pong = match ping {
            EnginePacket::Ping(data) => EnginePacket::Pong(data),
            _ => unreachable!(),
        };

        assert_eq!(pong.encode(), "3");
    }

    #[test]
    fn decodes_event_with_namespace_and_ack_id() {
        let packet = SocketPacket::decode(r#"2/admin,12["queueItemProgress",{"progress":40}]"#)
            .unwrap();

        assert_eq!(
            packet,
            SocketPacket::Event {
                ack_id: Some(12),
                name: "queueItemProgress".to_string(),
                payload: json!({ "progress": 40 }),
            }
        );
    }

    #[test]
    fn decodes_event_without_arguments() {
        let packet = SocketPacket::decode(r#"2["room-deleted"]"#).unwrap();

        assert_eq!(
            packet,
            SocketPacket::Event {
                ack_id: None,
                name: "room-deleted".to_string(),
                payload: Value::Null,
            }
        );
    }

    #[test]
    fn encodes_event_frame() {
        let message = EventMessage::new("leave-room", json!({ "roomCode": "ABC" }));
        let frame = SocketPacket::from(message).to_frame();

        assert_eq!(frame, r#"42["leave-room",{"roomCode":"ABC"}]"#);
    }

    #[test]
    fn decodes_connect_ack_and_error() {
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"xyz"}"#).unwrap(),
            SocketPacket::Connect(Some(json!({ "sid": "xyz" })))
        );

        let error = SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap();

        match error {
            SocketPacket::ConnectError(data) => {
                assert_eq!(connect_error_message(&data), "Not authorized")
            }
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(EnginePacket::decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(ProtocolError::UnknownType('9'))
        ));
        assert!(SocketPacket::decode("2{}").is_err());
        assert!(SocketPacket::decode(r#"51-["bin"]"#).is_err());
    }
}
