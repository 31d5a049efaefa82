//! Bot row and its settings bag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BotState;

pub type BotId = uuid::Uuid;
pub type ProjectId = uuid::Uuid;
pub type OrganizationId = uuid::Uuid;

/// One meeting attendance attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: BotId,
    pub project_id: ProjectId,
    pub meeting_url: String,
    /// Display name shown to other meeting participants.
    pub name: String,
    pub settings: BotSettings,
    /// When set, the bot starts in `scheduled` and the scheduler launches it
    /// at this time. Otherwise the bot starts in `ready`.
    pub join_at: Option<chrono::DateTime<chrono::Utc>>,
    /// User-supplied key, unique among non-terminal bots.
    pub deduplication_key: Option<String>,
    pub metadata: Value,
    pub state: BotState,
    pub last_heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Bot {
    /// Full RTMP push URL: destination with the stream key appended.
    pub fn rtmp_destination_url(&self) -> Option<String> {
        self.settings.rtmp.as_ref().map(|rtmp| {
            format!(
                "{}/{}",
                rtmp.destination_url.trim_end_matches('/'),
                rtmp.stream_key
            )
        })
    }

    pub fn recording_format(&self) -> RecordingFormat {
        self.settings.recording.format
    }

    pub fn create_debug_recording(&self) -> bool {
        self.settings.debug.create_debug_recording
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub transcription: TranscriptionSettings,
    #[serde(default)]
    pub rtmp: Option<RtmpSettings>,
    #[serde(default)]
    pub websocket: Option<WebsocketSettings>,
    #[serde(default)]
    pub auto_leave: AutoLeaveSettings,
    #[serde(default)]
    pub debug: DebugSettings,
    /// Per-platform toggles that don't warrant their own struct yet
    /// (closed-caption language, Zoom web SDK flag, ...).
    #[serde(default)]
    pub platform: Value,
    /// POSTed when a streaming transcript segment finalizes.
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    Mp4,
    Webm,
    Mp3,
}

impl RecordingFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RecordingFormat::Mp4 => "mp4",
            RecordingFormat::Webm => "webm",
            RecordingFormat::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingView {
    SpeakerView,
    GalleryView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    #[serde(default = "default_format")]
    pub format: RecordingFormat,
    #[serde(default = "default_view")]
    pub view: RecordingView,
    /// (width, height) of the encoded output.
    #[serde(default = "default_resolution")]
    pub resolution: (u32, u32),
    /// Audio-only bots skip the video path entirely.
    #[serde(default)]
    pub audio_only: bool,
}

fn default_format() -> RecordingFormat {
    RecordingFormat::Mp4
}

fn default_view() -> RecordingView {
    RecordingView::SpeakerView
}

fn default_resolution() -> (u32, u32) {
    (1920, 1080)
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            format: default_format(),
            view: default_view(),
            resolution: default_resolution(),
            audio_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    /// Provider key ("deepgram", "meeting_closed_captions", ...). When absent
    /// the provider is derived from the meeting platform.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Extra provider-specific knobs, passed through verbatim.
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtmpSettings {
    pub destination_url: String,
    pub stream_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketSettings {
    /// Endpoint that receives mixed-audio PCM as binary frames.
    pub audio_url: String,
}

/// Conditions under which the bot automatically leaves a meeting.
/// All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoLeaveSettings {
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_seconds: u64,
    #[serde(default = "default_silence_activate_after")]
    pub silence_activate_after_seconds: u64,
    #[serde(default = "default_only_participant_timeout")]
    pub only_participant_in_meeting_timeout_seconds: u64,
    #[serde(default = "default_wait_for_host_timeout")]
    pub wait_for_host_to_start_meeting_timeout_seconds: u64,
    #[serde(default = "default_waiting_room_timeout")]
    pub waiting_room_timeout_seconds: u64,
    #[serde(default)]
    pub max_uptime_seconds: Option<u64>,
}

fn default_silence_timeout() -> u64 {
    600
}

fn default_silence_activate_after() -> u64 {
    1200
}

fn default_only_participant_timeout() -> u64 {
    60
}

fn default_wait_for_host_timeout() -> u64 {
    600
}

fn default_waiting_room_timeout() -> u64 {
    900
}

impl Default for AutoLeaveSettings {
    fn default() -> Self {
        Self {
            silence_timeout_seconds: default_silence_timeout(),
            silence_activate_after_seconds: default_silence_activate_after(),
            only_participant_in_meeting_timeout_seconds: default_only_participant_timeout(),
            wait_for_host_to_start_meeting_timeout_seconds: default_wait_for_host_timeout(),
            waiting_room_timeout_seconds: default_waiting_room_timeout(),
            max_uptime_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugSettings {
    #[serde(default)]
    pub create_debug_recording: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub centicredits_balance: i64,
}
