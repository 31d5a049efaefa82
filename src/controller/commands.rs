//! Redis command channel.
//!
//! The API layer publishes JSON commands on `bot_{id}`; the listener task
//! owns the Redis connection and forwards parsed commands to the
//! supervisor's main loop. Connection loss is retried every second, up to 30
//! attempts per outage.

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;

use super::MainMessage;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Sync,
    SyncMediaRequests,
    SyncChatMessageRequests,
    PauseRecording,
    ResumeRecording,
    AdmitFromWaitingRoom,
}

/// Parse a channel message. Unknown or malformed commands return `None` and
/// are ignored by the caller.
pub fn parse_command(payload: &str) -> Option<BotCommand> {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::info!("ignoring malformed command payload: {e}");
            return None;
        }
    };
    match value.get("command").and_then(|c| c.as_str()) {
        Some("sync") => Some(BotCommand::Sync),
        Some("sync_media_requests") => Some(BotCommand::SyncMediaRequests),
        Some("sync_chat_message_requests") => Some(BotCommand::SyncChatMessageRequests),
        Some("pause_recording") => Some(BotCommand::PauseRecording),
        Some("resume_recording") => Some(BotCommand::ResumeRecording),
        Some("admit_from_waiting_room") => Some(BotCommand::AdmitFromWaitingRoom),
        Some(other) => {
            tracing::info!(command = %other, "unknown command, ignoring");
            None
        }
        None => {
            tracing::info!("command payload without a command field, ignoring");
            None
        }
    }
}

/// The channel a bot listens on.
pub fn channel_for_bot(bot_id: crate::models::BotId) -> String {
    format!("bot_{bot_id}")
}

/// Subscribe to the bot's channel and pump commands into the main loop
/// until the loop goes away or reconnection is exhausted.
pub async fn run_listener(
    redis_url: String,
    channel: String,
    messages: mpsc::UnboundedSender<MainMessage>,
) -> Result<()> {
    loop {
        match listen_once(&redis_url, &channel, &messages).await {
            Ok(ListenEnd::ReceiverGone) => return Ok(()),
            Ok(ListenEnd::ConnectionLost) => {
                tracing::info!("redis connection closed by server, reconnecting");
            }
            Err(e) => {
                tracing::info!("redis listener error: {e:#}, reconnecting");
            }
        }

        let mut attempts = 0;
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match probe_connection(&redis_url, &channel).await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    tracing::info!(
                        "error reconnecting to redis: {e:#} (attempt {attempts}/{MAX_RECONNECT_ATTEMPTS})"
                    );
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        return Err(e).context("failed to reconnect to redis after 30 attempts");
                    }
                }
            }
        }
    }
}

enum ListenEnd {
    ConnectionLost,
    ReceiverGone,
}

async fn listen_once(
    redis_url: &str,
    channel: &str,
    messages: &mpsc::UnboundedSender<MainMessage>,
) -> Result<ListenEnd> {
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to connect to redis")?;
    pubsub
        .subscribe(channel)
        .await
        .context("failed to subscribe to bot channel")?;
    tracing::info!(%channel, "redis command channel established");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::info!("unreadable redis payload: {e}");
                continue;
            }
        };
        if let Some(command) = parse_command(&payload) {
            if messages.send(MainMessage::Command(command)).is_err() {
                return Ok(ListenEnd::ReceiverGone);
            }
        }
    }
    Ok(ListenEnd::ConnectionLost)
}

/// One cheap round-trip to confirm the server is reachable again.
async fn probe_connection(redis_url: &str, channel: &str) -> Result<()> {
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("failed to connect to redis")?;
    pubsub
        .subscribe(channel)
        .await
        .context("failed to subscribe to bot channel")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse_command(r#"{"command":"sync"}"#), Some(BotCommand::Sync));
        assert_eq!(
            parse_command(r#"{"command":"sync_media_requests"}"#),
            Some(BotCommand::SyncMediaRequests)
        );
        assert_eq!(
            parse_command(r#"{"command":"sync_chat_message_requests"}"#),
            Some(BotCommand::SyncChatMessageRequests)
        );
        assert_eq!(
            parse_command(r#"{"command":"pause_recording"}"#),
            Some(BotCommand::PauseRecording)
        );
        assert_eq!(
            parse_command(r#"{"command":"resume_recording"}"#),
            Some(BotCommand::ResumeRecording)
        );
        assert_eq!(
            parse_command(r#"{"command":"admit_from_waiting_room"}"#),
            Some(BotCommand::AdmitFromWaitingRoom)
        );
    }

    #[test]
    fn unknown_and_malformed_commands_are_ignored() {
        assert_eq!(parse_command(r#"{"command":"reboot"}"#), None);
        assert_eq!(parse_command(r#"{"other":"sync"}"#), None);
        assert_eq!(parse_command("not json"), None);
        // Extra fields are allowed.
        assert_eq!(
            parse_command(r#"{"command":"sync","source":"api"}"#),
            Some(BotCommand::Sync)
        );
    }

    #[test]
    fn channel_name_embeds_bot_id() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(channel_for_bot(id), format!("bot_{id}"));
    }
}
