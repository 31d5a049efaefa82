//! Meeting-platform adapters.
//!
//! The supervisor drives one meeting through the [`MeetingAdapter`] trait and
//! receives everything back as [`AdapterMessage`] values on its main-loop
//! channel. The platform SDK / headless-browser machinery itself sits behind
//! [`PlatformLink`]; adapters translate its raw events into the supervisor's
//! vocabulary and keep the bookkeeping that is shared across platforms
//! (roster, auto-leave timers, first-buffer timestamps).

mod auto_leave;
mod browser;
mod core;
mod google_meet;
mod ipc;
mod teams;
mod zoom;

pub use auto_leave::{AutoLeaveTracker, AutoLeaveTrigger};
pub use google_meet::GoogleMeetAdapter;
pub use ipc::IpcPlatformLink;
pub use teams::TeamsAdapter;
pub use zoom::ZoomAdapter;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::media::image::I420Frame;

/// Which platform a meeting URL points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingKind {
    Zoom { meeting_id: String, password: Option<String> },
    GoogleMeet,
    Teams,
}

impl MeetingKind {
    /// Per-participant audio sample rate delivered by the platform.
    pub fn per_participant_sample_rate(&self) -> u32 {
        match self {
            MeetingKind::Zoom { .. } => 32000,
            MeetingKind::GoogleMeet | MeetingKind::Teams => 48000,
        }
    }

    /// Sample rate at which playback audio is pushed to the meeting mic.
    pub fn playback_sample_rate(&self) -> u32 {
        match self {
            MeetingKind::Zoom { .. } => 44100,
            MeetingKind::GoogleMeet | MeetingKind::Teams => 8000,
        }
    }

    /// Pause between playback chunks. Zoom's virtual mic consumes nearly a
    /// second of audio per push; the browser bridges take small chunks.
    pub fn playback_chunk_interval(&self) -> std::time::Duration {
        match self {
            MeetingKind::Zoom { .. } => std::time::Duration::from_millis(900),
            MeetingKind::GoogleMeet | MeetingKind::Teams => std::time::Duration::from_millis(100),
        }
    }

    /// Whether the encoded-recording pipeline runs in this process. Browser
    /// adapters record the compositor output with the screen recorder
    /// instead.
    pub fn uses_media_pipeline(&self) -> bool {
        matches!(self, MeetingKind::Zoom { .. })
    }
}

/// Derive the meeting platform from a meeting URL.
///
/// Unknown hosts are an error: a bot must never try to join an arbitrary
/// URL.
pub fn meeting_kind_from_url(meeting_url: &str) -> Result<MeetingKind> {
    let url = url::Url::parse(meeting_url)
        .map_err(|_| anyhow!("invalid meeting URL: {meeting_url}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("invalid meeting URL: {meeting_url}"))?;

    if host == "zoom.us" || host.ends_with(".zoom.us") {
        let meeting_id = url
            .path_segments()
            .into_iter()
            .flatten()
            .find_map(|segment| {
                let digits: String = segment.chars().filter(|c| c.is_ascii_digit()).collect();
                (!digits.is_empty() && digits.len() == segment.len()).then_some(digits)
            })
            .ok_or_else(|| anyhow!("zoom URL has no meeting id: {meeting_url}"))?;
        let password = url
            .query_pairs()
            .find(|(key, _)| key == "pwd")
            .map(|(_, value)| value.into_owned());
        return Ok(MeetingKind::Zoom {
            meeting_id,
            password,
        });
    }

    if host == "meet.google.com" {
        return Ok(MeetingKind::GoogleMeet);
    }

    if host == "teams.microsoft.com" || host == "teams.live.com" {
        return Ok(MeetingKind::Teams);
    }

    Err(anyhow!("invalid meeting URL: {meeting_url}"))
}

/// Where browser bridges leave their debug screen recording, when the bot
/// was configured to produce one.
pub const DEBUG_RECORDING_PATH: &str = "/tmp/debug_screen_recording.mp4";

/// Why the adapter asked to leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    AutoLeaveSilence,
    AutoLeaveOnlyParticipantInMeeting,
    AutoLeaveMaxUptimeExceeded,
}

/// A speaker as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub uuid: String,
    pub user_uuid: Option<String>,
    pub full_name: Option<String>,
    pub is_the_bot: bool,
}

/// Per-participant PCM handed to the audio ingest queue.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub participant_uuid: String,
    pub timestamp_ms: i64,
    pub pcm: Vec<u8>,
}

/// A platform caption upsert, keyed by (device_id, caption_id).
#[derive(Debug, Clone)]
pub struct CaptionUpsert {
    pub device_id: String,
    pub caption_id: String,
    pub text: String,
}

/// Everything an adapter can tell the supervisor. Each variant maps to a
/// fixed (event type, sub-type) pair or a side effect on the main loop.
#[derive(Debug, Clone)]
pub enum AdapterMessage {
    JoinedMeeting,
    RecordingPermissionGranted,
    PutInWaitingRoom,
    MeetingEnded,
    RequestToJoinDenied,
    MeetingNotFound,
    UiElementNotFound {
        step: String,
        exception_type: Option<String>,
        exception_message: Option<String>,
        screenshot_path: Option<String>,
        mhtml_path: Option<String>,
    },
    RequestedLeave {
        reason: LeaveReason,
    },
    ZoomAuthorizationFailed {
        code: i32,
    },
    ZoomSdkInternalError {
        code: i32,
    },
    ZoomMeetingStatusFailed {
        code: i32,
    },
    ZoomMeetingStatusFailedUnableToJoinExternalMeeting {
        code: i32,
    },
    LeaveMeetingWaitingForHost,
    WaitingRoomTimedOut,
    ReadyToShowBotImage,
    /// Browser adapters: the meeting UI is composited and the screen
    /// recorder should start capturing the given X display.
    ScreenRecordingShouldStart {
        display: String,
    },
    ParticipantJoined {
        participant: ParticipantInfo,
        timestamp_ms: i64,
    },
    ParticipantLeft {
        participant_uuid: String,
        timestamp_ms: i64,
    },
    ChatMessageReceived {
        participant_uuid: Option<String>,
        text: String,
        timestamp_ms: i64,
        source_uuid: Option<String>,
    },
}

/// Sinks the adapter feeds. Messages go to the supervisor's loop; media goes
/// straight into the ingest queues / pipeline without a main-loop hop.
#[derive(Clone)]
pub struct AdapterCallbacks {
    pub messages: mpsc::UnboundedSender<AdapterMessage>,
    pub audio_chunks: Option<std::sync::mpsc::Sender<AudioChunk>>,
    pub captions: Option<std::sync::mpsc::Sender<CaptionUpsert>>,
    pub mixed_audio: Option<Arc<dyn Fn(&[u8], Option<i64>) + Send + Sync>>,
    pub video_frames: Option<Arc<dyn Fn(Vec<u8>, i64) + Send + Sync>>,
    pub wants_video_frames: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl AdapterCallbacks {
    pub fn send_message(&self, message: AdapterMessage) {
        if self.messages.send(message).is_err() {
            tracing::warn!("supervisor channel closed -- adapter message dropped");
        }
    }
}

/// Raw events from the platform bridge (SDK process or driven browser).
/// Serialized (externally tagged, snake_case) on the bridge IPC protocol.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformEvent {
    AuthSucceeded,
    AuthFailed { code: i32 },
    SdkInternalError { code: i32 },
    MeetingStatus(PlatformMeetingStatus),
    RecordingPermissionGranted,
    RecordingUiReady { display: String },
    ReadyToShowBotImage,
    ParticipantJoined {
        uuid: String,
        user_uuid: Option<String>,
        full_name: Option<String>,
        is_the_bot: bool,
    },
    ParticipantLeft { uuid: String },
    /// Number of participants currently in the meeting, bot included.
    ParticipantCount { count: usize },
    AudioChunk {
        participant_uuid: String,
        timestamp_ms: i64,
        pcm: Vec<u8>,
    },
    MixedAudio {
        pcm: Vec<u8>,
        timestamp_ns: Option<i64>,
    },
    VideoFrame { i420: Vec<u8>, timestamp_ns: i64 },
    CaptionUpsert {
        device_id: String,
        caption_id: String,
        text: String,
    },
    ChatMessage {
        participant_uuid: Option<String>,
        text: String,
        timestamp_ms: i64,
        source_uuid: Option<String>,
    },
    RequestToJoinDenied,
    MeetingNotFound,
    UiElementNotFound {
        step: String,
        exception_type: Option<String>,
        exception_message: Option<String>,
        screenshot_path: Option<String>,
        mhtml_path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformMeetingStatus {
    InMeeting,
    WaitingForHost,
    InWaitingRoom,
    Ended,
    Failed { code: i32, unable_to_join_external: bool },
}

/// The out-of-scope platform machinery: the Zoom SDK bridge or the headless
/// browser controller. `connect` begins the join and streams raw events into
/// the given channel until `disconnect`.
pub trait PlatformLink: Send + Sync {
    fn connect(&self, events: mpsc::UnboundedSender<PlatformEvent>) -> Result<()>;
    fn leave(&self);
    fn disconnect(&self);
    fn send_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<()>;
    fn send_video_frame(&self, frame: &I420Frame) -> Result<()>;
    fn send_chat_message(&self, text: &str, to_participant_uuid: Option<&str>) -> Result<()>;
    fn admit_from_waiting_room(&self) -> Result<()>;
}

/// Uniform adapter surface consumed by the supervisor. Implementations are
/// `Send + Sync` because the audio playback worker pushes PCM from its own
/// thread, exactly like the platform SDKs expect.
pub trait MeetingAdapter: Send + Sync {
    /// Begin joining the meeting. Non-blocking; progress arrives as
    /// messages.
    fn init(&self) -> Result<()>;

    /// Request leave. Non-blocking; `MeetingEnded` confirms.
    fn leave(&self);

    /// Release all platform resources. Idempotent.
    fn cleanup(&self);

    fn send_raw_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<()>;

    fn send_raw_image(&self, png: &[u8]) -> Result<()>;

    fn send_chat_message(&self, text: &str, to_participant_uuid: Option<&str>) -> Result<()>;

    fn admit_from_waiting_room(&self) -> Result<()>;

    /// Called on every supervisor tick.
    fn check_auto_leave_conditions(&self);

    fn get_participant(&self, uuid: &str) -> Option<ParticipantInfo>;

    /// Wall-clock timestamp of the first media buffer, for transcript
    /// alignment.
    fn get_first_buffer_timestamp_ms(&self) -> Option<i64>;

    /// Platform-specific correction added to pipeline-derived timestamps.
    fn get_first_buffer_timestamp_ms_offset(&self) -> i64 {
        0
    }

    fn meeting_kind(&self) -> MeetingKind;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_urls_parse_meeting_id_and_password() {
        match meeting_kind_from_url("https://zoom.us/j/123456789?pwd=password123").unwrap() {
            MeetingKind::Zoom {
                meeting_id,
                password,
            } => {
                assert_eq!(meeting_id, "123456789");
                assert_eq!(password.as_deref(), Some("password123"));
            }
            other => panic!("expected zoom, got {other:?}"),
        }
    }

    #[test]
    fn zoom_subdomains_are_zoom() {
        assert!(matches!(
            meeting_kind_from_url("https://us02web.zoom.us/j/987654321").unwrap(),
            MeetingKind::Zoom { .. }
        ));
    }

    #[test]
    fn google_meet_urls() {
        assert_eq!(
            meeting_kind_from_url("https://meet.google.com/abc-defg-hij").unwrap(),
            MeetingKind::GoogleMeet
        );
    }

    #[test]
    fn teams_urls() {
        assert_eq!(
            meeting_kind_from_url("https://teams.microsoft.com/l/meetup-join/19%3ameeting").unwrap(),
            MeetingKind::Teams
        );
        assert_eq!(
            meeting_kind_from_url("https://teams.live.com/meet/12345").unwrap(),
            MeetingKind::Teams
        );
    }

    #[test]
    fn unknown_hosts_are_rejected() {
        for url in [
            "https://example.com/meeting",
            "https://zoom.us.evil.com/j/123",
            "https://meet.google.com.evil.com/abc",
            "not a url",
        ] {
            assert!(meeting_kind_from_url(url).is_err(), "{url}");
        }
    }

    #[test]
    fn zoom_url_without_meeting_id_is_rejected() {
        assert!(meeting_kind_from_url("https://zoom.us/signin").is_err());
    }

    #[test]
    fn sample_rates_per_platform() {
        let zoom = meeting_kind_from_url("https://zoom.us/j/123").unwrap();
        assert_eq!(zoom.per_participant_sample_rate(), 32000);
        assert_eq!(zoom.playback_sample_rate(), 44100);
        let meet = MeetingKind::GoogleMeet;
        assert_eq!(meet.per_participant_sample_rate(), 48000);
        assert_eq!(meet.playback_sample_rate(), 8000);
        assert_eq!(MeetingKind::Teams.per_participant_sample_rate(), 48000);
    }
}
