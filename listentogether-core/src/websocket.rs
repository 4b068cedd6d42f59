use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, warn};
use tokio::{
    net::TcpStream,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    protocol::{connect_error_message, EnginePacket, Handshake, SocketPacket},
    Config, Connector, EventMessage, Link, LinkEvent, TransportError,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, Message>;
type Reader = SplitStream<Socket>;

/// Opens socket.io links over a websocket.
pub struct SocketIoConnector {
    url: Url,
}

impl SocketIoConnector {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let url = config
            .socket_url()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        debug!("Opening websocket to {}", self.url);

        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (mut writer, mut reader) = socket.split();

        let handshake = match next_packet(&mut reader).await? {
            EnginePacket::Open(handshake) => handshake,
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )))
            }
        };

        send_frame(&mut writer, SocketPacket::Connect(None).to_frame()).await?;

        // Wait for the namespace to be acknowledged, the server may ping in the meantime
        loop {
            match next_packet(&mut reader).await? {
                EnginePacket::Ping(data) => {
                    send_frame(&mut writer, EnginePacket::Pong(data).encode()).await?
                }
                EnginePacket::Message(data) => match SocketPacket::decode(&data) {
                    Ok(SocketPacket::Connect(_)) => break,
                    Ok(SocketPacket::ConnectError(data)) => {
                        return Err(TransportError::Rejected(connect_error_message(&data)))
                    }
                    Ok(other) => debug!("Ignoring {other:?} before connect acknowledgment"),
                    Err(e) => return Err(TransportError::Protocol(e.to_string())),
                },
                EnginePacket::Close => {
                    return Err(TransportError::Closed(
                        "server closed during handshake".to_string(),
                    ))
                }
                _ => {}
            }
        }

        let (outgoing_sender, outgoing_receiver) = unbounded_channel();
        let (incoming_sender, incoming_receiver) = unbounded_channel();

        let sid = handshake.sid.clone();
        tokio::spawn(run_link(
            writer,
            reader,
            outgoing_receiver,
            incoming_sender,
            handshake,
        ));

        Ok(Link {
            sid: Some(sid),
            sender: outgoing_sender,
            receiver: incoming_receiver,
        })
    }
}

async fn next_packet(reader: &mut Reader) -> Result<EnginePacket, TransportError> {
    loop {
        let frame = reader
            .next()
            .await
            .ok_or_else(|| TransportError::Closed("transport close".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        match frame {
            Message::Text(text) => {
                return EnginePacket::decode(text.as_str())
                    .map_err(|e| TransportError::Protocol(e.to_string()))
            }
            Message::Close(_) => return Err(TransportError::Closed("transport close".to_string())),
            _ => continue,
        }
    }
}

async fn send_frame(writer: &mut Writer, frame: String) -> Result<(), TransportError> {
    writer
        .send(Message::text(frame))
        .await
        .map_err(|e| TransportError::Closed(e.to_string()))
}

/// Pumps frames in both directions until either side goes away.
async fn run_link(
    mut writer: Writer,
    mut reader: Reader,
    mut outgoing: UnboundedReceiver<EventMessage>,
    incoming: UnboundedSender<LinkEvent>,
    handshake: Handshake,
) {
    // The server pings every interval, if nothing arrives within interval + timeout the link is dead
    let heartbeat = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);

    let reason = loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    let frame = SocketPacket::from(message).to_frame();

                    if let Err(e) = send_frame(&mut writer, frame).await {
                        break e.to_string();
                    }
                }
                None => {
                    // The client dropped the link on purpose
                    let _ = send_frame(&mut writer, SocketPacket::Disconnect.to_frame()).await;
                    let _ = writer.close().await;
                    return;
                }
            },
            frame = timeout(heartbeat, reader.next()) => match frame {
                Err(_) => break "ping timeout".to_string(),
                Ok(None) => break "transport close".to_string(),
                Ok(Some(Err(e))) => break format!("transport error: {e}"),
                Ok(Some(Ok(Message::Close(_)))) => break "transport close".to_string(),
                Ok(Some(Ok(Message::Text(text)))) => match EnginePacket::decode(text.as_str()) {
                    Ok(EnginePacket::Ping(data)) => {
                        if let Err(e) = send_frame(&mut writer, EnginePacket::Pong(data).encode()).await {
                            break e.to_string();
                        }
                    }
                    Ok(EnginePacket::Message(data)) => match SocketPacket::decode(&data) {
                        Ok(SocketPacket::Event { name, payload, .. }) => {
                            if incoming.send(LinkEvent::Message(EventMessage { name, payload })).is_err() {
                                return;
                            }
                        }
                        Ok(SocketPacket::Disconnect) => break "io server disconnect".to_string(),
                        Ok(other) => debug!("Ignoring packet {other:?}"),
                        Err(e) => warn!("Dropping malformed packet: {e}"),
                    },
                    Ok(EnginePacket::Close) => break "transport close".to_string(),
                    Ok(_) => {}
                    Err(e) => warn!("Dropping malformed frame: {e}"),
                },
                Ok(Some(Ok(_))) => {}
            }
        }
    };

    let _ = incoming.send(LinkEvent::Closed(reason));
}
