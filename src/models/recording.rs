//! Recording, utterance and participant rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BotId;

pub type RecordingId = uuid::Uuid;
pub type UtteranceId = uuid::Uuid;
pub type ParticipantId = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    AudioAndVideo,
    AudioOnly,
    NoRecording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionType {
    NonRealtime,
    Realtime,
    NoTranscription,
}

/// One media + transcript artifact. Every bot owns exactly one default
/// recording, created alongside the bot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub bot_id: BotId,
    pub is_default: bool,
    pub recording_type: RecordingType,
    pub transcription_type: TranscriptionType,
    /// Provider key, mirrors the bot's transcription settings.
    pub transcription_provider: Option<String>,
    pub state: RecordingState,
    pub transcription_state: TranscriptionState,
    /// Object-storage key of the uploaded file, set after upload completes.
    pub storage_key: Option<String>,
    /// Wall-clock time of the first media buffer, for transcript alignment.
    pub first_buffer_timestamp_ms: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceSource {
    PerParticipantAudio,
    ClosedCaptionFromPlatform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm,
    Mp3,
}

/// Word-level timing from a transcription provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub start: f64,
    pub end: f64,
    pub word: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub punctuated_word: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<TranscriptWord>>,
}

/// A contiguous speech segment attributed to one participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: UtteranceId,
    pub recording_id: RecordingId,
    pub participant_id: ParticipantId,
    pub source: UtteranceSource,
    /// Raw audio for per-participant utterances; captions carry none.
    pub audio_blob: Option<Vec<u8>>,
    pub audio_format: Option<AudioFormat>,
    pub sample_rate: Option<u32>,
    /// Wall-clock-aligned start offset.
    pub timestamp_ms: i64,
    pub duration_ms: i64,
    pub transcription: Option<Transcription>,
    /// Provider failure detail when transcription gave up.
    pub failure_data: Option<Value>,
    /// Dedup key for caption upserts: `{recording_id}-{device_id}-{caption_id}`.
    pub source_uuid: Option<String>,
}

/// A speaker observed in the bot's meeting, identified by the platform's
/// per-meeting uuid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub bot_id: BotId,
    pub uuid: String,
    pub user_uuid: Option<String>,
    pub full_name: Option<String>,
    pub is_the_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantEventKind {
    Join,
    Leave,
}

/// Join/leave timeline entry for a participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEvent {
    pub id: uuid::Uuid,
    pub participant_id: ParticipantId,
    pub kind: ParticipantEventKind,
    pub timestamp_ms: i64,
}

/// A chat line observed in the meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: uuid::Uuid,
    pub bot_id: BotId,
    pub participant_id: Option<ParticipantId>,
    pub text: String,
    pub timestamp_ms: i64,
    /// Platform-side message id, for dedup.
    pub source_uuid: Option<String>,
}
