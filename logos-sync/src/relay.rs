//! WebSocket relay: fans room traffic out between networked clients.
//!
//! Architecture:
//! ```text
//! WsChannel A ──ws──┐                                ┌──ws──► WsChannel A
//!                   ├── handle_connection ── LocalHub ┤
//! WsChannel B ──ws──┘     (one LocalChannel            └──ws──► WsChannel B
//!                          per connection)
//! ```
//!
//! The relay is a dumb pipe: it never decodes broadcast payloads, never
//! persists anything and never retries. Presence lives in the hub; a
//! closed socket untracks its participant.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::protocol::RelayFrame;
use crate::transport::{Channel, ChannelEvent, HubStats, LocalChannel, LocalHub, SubscribeOptions};

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub hub: HubStats,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub struct RelayServer {
    config: RelayConfig,
    hub: LocalHub,
    counters: Arc<Counters>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: LocalHub::new(config.broadcast_capacity),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The hub backing this relay.
    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            let counters = self.counters.clone();

            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = Self::handle_connection(stream, addr, hub, config, &counters).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle one WebSocket connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: LocalHub,
        config: RelayConfig,
        counters: &Counters,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Handshake: the first binary frame must be Subscribe
        let first = tokio::time::timeout(config.handshake_timeout, async {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => return Some(RelayFrame::decode(&data)),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => continue,
                }
            }
            None
        })
        .await;

        let (room_id, user_id, receive_own) = match first {
            Ok(Some(Ok(RelayFrame::Subscribe {
                room_id,
                user_id,
                receive_own,
            }))) => (room_id, user_id, receive_own),
            Ok(Some(Ok(other))) => {
                let reply = RelayFrame::Error(format!("expected Subscribe, got {other:?}"));
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                return Ok(());
            }
            Ok(Some(Err(e))) => {
                log::warn!("Bad handshake from {addr}: {e}");
                let reply = RelayFrame::Error(e.to_string());
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(_) => {
                log::warn!("Handshake timeout from {addr}");
                return Ok(());
            }
        };

        let mut channel: LocalChannel = hub
            .open(room_id, user_id, SubscribeOptions { receive_own })
            .await;
        ws_sender
            .send(Message::Binary(RelayFrame::Subscribed.encode()?.into()))
            .await?;
        log::info!("{user_id} from {addr} subscribed to room {room_id}");

        let outcome = Self::pump(&mut channel, &mut ws_sender, &mut ws_receiver, addr, counters).await;

        channel.unsubscribe().await?;
        log::info!("{user_id} from {addr} left room {room_id}");
        outcome
    }

    /// Shuttle frames between the socket and the hub channel until either side ends.
    async fn pump<S, R>(
        channel: &mut LocalChannel,
        ws_sender: &mut S,
        ws_receiver: &mut R,
        addr: SocketAddr,
        counters: &Counters,
    ) -> ConnectionResult
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            counters.frames_in.fetch_add(1, Ordering::Relaxed);
                            match RelayFrame::decode(&data) {
                                Ok(RelayFrame::Track(participant)) => {
                                    if let Err(e) = channel.track(&participant).await {
                                        let reply = RelayFrame::Error(e.to_string());
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    }
                                }
                                Ok(RelayFrame::Untrack) => channel.untrack().await?,
                                Ok(RelayFrame::Publish(payload)) => channel.send(payload).await?,
                                Ok(other) => {
                                    log::debug!("Ignoring {other:?} from {addr}");
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                event = channel.recv() => {
                    let frame = match event {
                        Some(ChannelEvent::PresenceSync(list)) => RelayFrame::PresenceSync(list),
                        Some(ChannelEvent::PresenceJoin(p)) => RelayFrame::PresenceJoin(p),
                        Some(ChannelEvent::PresenceLeave(id)) => RelayFrame::PresenceLeave(id),
                        Some(ChannelEvent::Broadcast { sender, payload }) => {
                            RelayFrame::Broadcast { sender, payload }
                        }
                        Some(ChannelEvent::Closed) | None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    };
                    ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                    counters.frames_out.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            hub: self.hub.stats().await,
        }
    }
}
