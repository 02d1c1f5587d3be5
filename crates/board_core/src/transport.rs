//! Websocket implementation of [`RealtimeTransport`].
//!
//! Frames are JSON-encoded [`ChannelFrame`]s. A single read task decodes
//! incoming frames and fans them out to per-channel broadcast senders;
//! `publish` writes a frame through the shared sink. The relay is assumed to
//! echo every frame to all connected clients on the same endpoint,
//! including the sender.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use shared::protocol::{ChannelFrame, RealtimeMessage};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::listener::RealtimeTransport;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type ChannelMap = HashMap<String, broadcast::Sender<RealtimeMessage>>;

const CHANNEL_CAPACITY: usize = 256;

pub struct WebSocketTransport {
    writer: Mutex<WsSink>,
    channels: Arc<std::sync::Mutex<ChannelMap>>,
    read_task: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to a relay endpoint (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (writer, mut reader) = ws_stream.split();

        let channels: Arc<std::sync::Mutex<ChannelMap>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));
        let route_channels = Arc::clone(&channels);

        let read_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChannelFrame>(&text) {
                        Ok(frame) => {
                            let sender = {
                                let map = route_channels.lock().expect("channel map poisoned");
                                map.get(&frame.channel).cloned()
                            };
                            if let Some(sender) = sender {
                                let _ = sender.send(frame.message);
                            }
                        }
                        Err(err) => {
                            warn!("realtime: discarding undecodable frame: {err}");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("realtime: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            // Dropping the senders closes every subscription receiver, which
            // subscribers observe as a lost connection.
            route_channels
                .lock()
                .expect("channel map poisoned")
                .clear();
        });

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            channels,
            read_task,
        }))
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<RealtimeMessage> {
        let mut map = self.channels.lock().expect("channel map poisoned");
        map.entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<RealtimeMessage>> {
        if self.read_task.is_finished() {
            return Err(anyhow!("realtime connection is closed"));
        }
        Ok(self.channel_sender(channel).subscribe())
    }

    async fn publish(&self, channel: &str, message: &RealtimeMessage) -> Result<()> {
        let frame = ChannelFrame {
            channel: channel.to_string(),
            message: message.clone(),
        };
        let text = serde_json::to_string(&frame).context("failed to encode realtime frame")?;
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .context("failed to publish realtime frame")?;
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
