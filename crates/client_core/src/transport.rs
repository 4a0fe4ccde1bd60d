use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{ClientMessage, ServerMessage};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::warn;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// Text frame that failed to parse; state must not change.
    Malformed(String),
    Closed,
}

/// The live connection handle injected per session, so the state
/// machine stays testable without a real socket. A connection is
/// exclusively owned by the session that created it.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

pub struct MissingTransport;

#[async_trait]
impl SessionTransport for MissingTransport {
    async fn send(&self, _message: ClientMessage) -> Result<()> {
        Err(anyhow!("session transport is unavailable"))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        // Sender dropped immediately; subscribers observe a closed stream.
        let (_sender, receiver) = broadcast::channel(1);
        receiver
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketTransport {
    writer: Mutex<WsSink>,
    events: broadcast::Sender<TransportEvent>,
    reader_task: JoinHandle<()>,
}

impl WebSocketTransport {
    pub async fn connect(server_url: &str, user_id: i64) -> Result<Arc<Self>> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?user_id={user_id}");
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (writer, mut reader) = ws_stream.split();

        let (events, _) = broadcast::channel(256);
        let events_out = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                let _ = events_out.send(TransportEvent::Message(message));
                            }
                            Err(err) => {
                                let _ =
                                    events_out.send(TransportEvent::Malformed(err.to_string()));
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = events_out.send(TransportEvent::Closed);
        });

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            events,
            reader_task,
        }))
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
        self.reader_task.abort();
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl SessionTransport for WebSocketTransport {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        let text = serde_json::to_string(&message).context("failed to encode client message")?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .context("failed to send client message")
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
