//! WebSocket audio egress.
//!
//! Mixed-audio PCM is relayed to a customer endpoint as binary frames, after
//! a JSON hello describing the stream. The relay runs on its own task behind
//! a bounded queue; when the consumer falls behind, the oldest chunks are
//! dropped, matching the leaky audio discipline of the media pipeline.

use anyhow::{Context, Result};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::models::BotId;

/// Chunks buffered before the relay starts dropping the oldest.
const QUEUE_CAPACITY: usize = 256;

pub struct WebsocketAudioStreamer {
    queue: mpsc::Sender<Vec<u8>>,
    task: tokio::task::JoinHandle<()>,
}

impl WebsocketAudioStreamer {
    pub async fn connect(url: &str, bot_id: BotId, sample_rate: u32) -> Result<Self> {
        let ws_url = url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        tracing::info!(%ws_url, "connecting websocket audio egress");

        let (mut stream, response) = connect_async(&ws_url)
            .await
            .context("websocket audio connection failed")?;
        tracing::info!(status = %response.status(), "websocket audio connected");

        let hello = serde_json::json!({
            "bot_id": bot_id,
            "encoding": "pcm_s16le",
            "sample_rate": sample_rate,
            "channels": 1,
        });
        stream
            .send(Message::Text(hello.to_string()))
            .await
            .context("failed to send websocket hello")?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(pcm) = rx.recv().await {
                if let Err(e) = stream.send(Message::Binary(pcm)).await {
                    tracing::warn!("websocket audio send failed, stopping egress: {e}");
                    break;
                }
            }
            let _ = stream.send(Message::Close(None)).await;
        });

        Ok(Self { queue: tx, task })
    }

    /// Enqueue a PCM chunk. Drops the chunk when the queue is full; audio
    /// egress must never stall the media path.
    pub fn send_pcm(&self, pcm: Vec<u8>) {
        if let Err(e) = self.queue.try_send(pcm) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::debug!("websocket audio queue full, dropping chunk");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!("websocket audio relay gone, dropping chunk");
                }
            }
        }
    }

    pub async fn close(self) {
        drop(self.queue);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;

    /// Accept one websocket connection and collect its frames.
    async fn one_shot_server() -> (String, tokio::task::JoinHandle<(String, Vec<Vec<u8>>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut hello = String::new();
            let mut binary = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => hello = text,
                    Message::Binary(data) => binary.push(data),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            (hello, binary)
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn hello_then_binary_frames_arrive() {
        let (url, server) = one_shot_server().await;
        let bot_id = uuid::Uuid::new_v4();

        let streamer = WebsocketAudioStreamer::connect(&url, bot_id, 32000)
            .await
            .unwrap();
        streamer.send_pcm(vec![1, 2, 3, 4]);
        streamer.send_pcm(vec![5, 6]);
        streamer.close().await;

        let (hello, binary) = server.await.unwrap();
        let hello: serde_json::Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(hello["sample_rate"], 32000);
        assert_eq!(hello["encoding"], "pcm_s16le");
        assert_eq!(binary, vec![vec![1, 2, 3, 4], vec![5, 6]]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let result =
            WebsocketAudioStreamer::connect("ws://127.0.0.1:1/audio", uuid::Uuid::new_v4(), 32000)
                .await;
        assert!(result.is_err());
    }
}
