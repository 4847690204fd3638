//! WebSocket channel to a [`RelayServer`](crate::relay::RelayServer).
//!
//! One socket per subscription. The handshake is a `Subscribe` frame
//! answered by `Subscribed`; after that a writer task drains outgoing
//! frames and a reader task turns relay frames into [`ChannelEvent`]s.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Channel, ChannelEvent, SubscribeOptions, Transport, TransportError};
use crate::model::{Participant, RoomId, UserId};
use crate::protocol::RelayFrame;

/// Connects channels to a relay URL such as `ws://127.0.0.1:9091`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
    event_buffer: usize,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(5),
            event_buffer: 256,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn relay_event(frame: RelayFrame) -> Option<ChannelEvent> {
    match frame {
        RelayFrame::PresenceSync(list) => Some(ChannelEvent::PresenceSync(list)),
        RelayFrame::PresenceJoin(p) => Some(ChannelEvent::PresenceJoin(p)),
        RelayFrame::PresenceLeave(id) => Some(ChannelEvent::PresenceLeave(id)),
        RelayFrame::Broadcast { sender, payload } => Some(ChannelEvent::Broadcast { sender, payload }),
        RelayFrame::Error(e) => {
            log::warn!("Relay reported: {e}");
            None
        }
        other => {
            log::debug!("Ignoring unexpected relay frame {other:?}");
            None
        }
    }
}

fn encode(frame: &RelayFrame) -> Result<Message, TransportError> {
    let bytes = frame
        .encode()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(Message::Binary(bytes.into()))
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Channel>, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = encode(&RelayFrame::Subscribe {
            room_id,
            user_id,
            receive_own: options.receive_own,
        })?;
        ws_writer
            .send(hello)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let ack = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => return RelayFrame::decode(&data).ok(),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => continue,
                }
            }
            None
        })
        .await
        .map_err(|_| TransportError::Timeout)?;

        match ack {
            Some(RelayFrame::Subscribed) => {}
            Some(RelayFrame::Error(e)) => return Err(TransportError::SubscribeFailed(e)),
            Some(other) => {
                return Err(TransportError::SubscribeFailed(format!(
                    "unexpected handshake reply {other:?}"
                )))
            }
            None => return Err(TransportError::SubscribeFailed("relay closed during handshake".into())),
        }
        log::info!("Subscribed to room {room_id} via {}", self.url);

        // Writer task: forward outgoing frames to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.event_buffer);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: relay frames → channel events
        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(frame) => {
                            if let Some(event) = relay_event(frame) {
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = event_tx.send(ChannelEvent::Closed).await;
        });

        Ok(Box::new(WsChannel {
            outgoing: Some(out_tx),
            events: event_rx,
            reader,
            writer,
            finished: false,
        }))
    }
}

/// A subscription over one WebSocket.
pub struct WsChannel {
    outgoing: Option<mpsc::Sender<Message>>,
    events: mpsc::Receiver<ChannelEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    finished: bool,
}

impl WsChannel {
    async fn push(&self, frame: RelayFrame) -> Result<(), TransportError> {
        let tx = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        if self.finished || self.writer.is_finished() {
            return Err(TransportError::Closed);
        }
        tx.send(encode(&frame)?)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn observe(&mut self, event: Option<ChannelEvent>) -> Option<ChannelEvent> {
        match event {
            Some(ChannelEvent::Closed) | None => {
                if self.finished {
                    return None;
                }
                self.finished = true;
                Some(ChannelEvent::Closed)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn track(&mut self, participant: &Participant) -> Result<(), TransportError> {
        self.push(RelayFrame::Track(participant.clone())).await
    }

    async fn untrack(&mut self) -> Result<(), TransportError> {
        self.push(RelayFrame::Untrack).await
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.push(RelayFrame::Publish(payload)).await
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        self.observe(event)
    }

    fn try_recv(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => self.observe(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.observe(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        self.finished = true;
        self.reader.abort();
        Ok(())
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        // Dropping `outgoing` ends the writer, which closes the socket
        self.reader.abort();
    }
}
