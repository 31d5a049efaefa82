//! Platform bridge transport: JSON lines over a Unix socket.
//!
//! The SDK / headless-browser machinery runs as a separate bridge process
//! that owns the meeting session. This link speaks a line-delimited JSON
//! protocol with it: events flow in as serialized [`PlatformEvent`]s, and
//! outbound commands (leave, audio, stills, chat) flow out as small command
//! objects with base64 media payloads.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::mpsc;

use crate::media::image::I420Frame;

use super::{PlatformEvent, PlatformLink};

pub struct IpcPlatformLink {
    socket_path: PathBuf,
    writer: Mutex<Option<UnixStream>>,
}

impl IpcPlatformLink {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            writer: Mutex::new(None),
        }
    }

    fn send_command(&self, command: serde_json::Value) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let stream = guard
            .as_mut()
            .context("platform bridge is not connected")?;
        let mut line = command.to_string();
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .context("failed to write to platform bridge")?;
        Ok(())
    }
}

impl PlatformLink for IpcPlatformLink {
    fn connect(&self, events: mpsc::UnboundedSender<PlatformEvent>) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "failed to connect to platform bridge at {}",
                self.socket_path.display()
            )
        })?;
        let reader_stream = stream
            .try_clone()
            .context("failed to clone bridge socket")?;
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);

        std::thread::spawn(move || {
            let reader = BufReader::new(reader_stream);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::info!("platform bridge read error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PlatformEvent>(&line) {
                    Ok(event) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::info!("unparseable platform bridge event: {e}");
                    }
                }
            }
            tracing::info!("platform bridge event stream ended");
        });

        self.send_command(serde_json::json!({"command": "join"}))
    }

    fn leave(&self) {
        if let Err(e) = self.send_command(serde_json::json!({"command": "leave"})) {
            tracing::info!("failed to send leave to platform bridge: {e:#}");
        }
    }

    fn disconnect(&self) {
        let _ = self.send_command(serde_json::json!({"command": "disconnect"}));
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn send_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        self.send_command(serde_json::json!({
            "command": "send_audio",
            "sample_rate": sample_rate,
            "pcm_base64": BASE64.encode(pcm),
        }))
    }

    fn send_video_frame(&self, frame: &I420Frame) -> Result<()> {
        self.send_command(serde_json::json!({
            "command": "send_video_frame",
            "width": frame.width,
            "height": frame.height,
            "i420_base64": BASE64.encode(&frame.data),
        }))
    }

    fn send_chat_message(&self, text: &str, to_participant_uuid: Option<&str>) -> Result<()> {
        self.send_command(serde_json::json!({
            "command": "send_chat_message",
            "text": text,
            "to": to_participant_uuid,
        }))
    }

    fn admit_from_waiting_room(&self) -> Result<()> {
        self.send_command(serde_json::json!({"command": "admit_from_waiting_room"}))
    }
}
