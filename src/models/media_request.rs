//! Playback jobs: audio clips, TTS, images, video URLs, and outgoing chat.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BotId;

pub type MediaRequestId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRequestKind {
    Audio,
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRequestState {
    Enqueued,
    Playing,
    Finished,
    FailedToPlay,
    Dropped,
}

/// One playback job. AUDIO and VIDEO are strictly serial per bot (at most
/// one PLAYING); IMAGE coalesces to the newest enqueued request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRequest {
    pub id: MediaRequestId,
    pub bot_id: BotId,
    pub kind: MediaRequestKind,
    pub state: MediaRequestState,
    /// Raw media bytes (MP3 for audio, PNG for image). Absent for TTS and
    /// video-URL requests.
    pub media_blob: Option<Vec<u8>>,
    /// Known duration of the blob, when the caller supplied one.
    pub duration_ms: Option<i64>,
    /// Text to synthesize when no blob is given.
    pub text_to_speak: Option<String>,
    pub text_to_speech_settings: Option<Value>,
    pub media_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMessageRequestState {
    Enqueued,
    Sent,
    Failed,
}

/// An outgoing chat message the bot should post into the meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRequest {
    pub id: uuid::Uuid,
    pub bot_id: BotId,
    pub text: String,
    /// Platform participant uuid for a direct message; `None` broadcasts to
    /// everyone in the meeting.
    pub to_participant_uuid: Option<String>,
    pub state: ChatMessageRequestState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
