//! Bot lifecycle state machine.
//!
//! Every change to a bot's state goes through [`transition`]: an event type
//! (plus optional sub-type) applied to the current state either yields the
//! next state or fails without mutating anything. The event store persists
//! the (old_state, new_state) pair alongside each event, so the event log is
//! a complete audit trail of the bot's lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle states of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Scheduled,
    Ready,
    Joining,
    JoinedNotRecording,
    JoinedRecording,
    JoinedRecordingPaused,
    Leaving,
    PostProcessing,
    Ended,
    FatalError,
    WaitingRoom,
    DataDeleted,
}

impl BotState {
    /// Terminal states are irreversible; entering one triggers billing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BotState::Ended | BotState::FatalError | BotState::DataDeleted
        )
    }

    /// States in which the bot is present in the meeting.
    pub fn is_in_meeting(self) -> bool {
        matches!(
            self,
            BotState::JoinedNotRecording
                | BotState::JoinedRecording
                | BotState::JoinedRecordingPaused
        )
    }

    /// Media (audio clips, TTS, images) may only play while the bot is in
    /// the meeting.
    pub fn can_play_media(self) -> bool {
        self.is_in_meeting()
    }

    pub fn can_pause_recording(self) -> bool {
        self == BotState::JoinedRecording
    }

    pub fn can_resume_recording(self) -> bool {
        self == BotState::JoinedRecordingPaused
    }

    pub fn can_admit_from_waiting_room(self) -> bool {
        self.is_in_meeting()
    }

    pub fn api_code(self) -> &'static str {
        match self {
            BotState::Scheduled => "scheduled",
            BotState::Ready => "ready",
            BotState::Joining => "joining",
            BotState::JoinedNotRecording => "joined_not_recording",
            BotState::JoinedRecording => "joined_recording",
            BotState::JoinedRecordingPaused => "joined_recording_paused",
            BotState::Leaving => "leaving",
            BotState::PostProcessing => "post_processing",
            BotState::Ended => "ended",
            BotState::FatalError => "fatal_error",
            BotState::WaitingRoom => "waiting_room",
            BotState::DataDeleted => "data_deleted",
        }
    }
}

/// Event types accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotEventType {
    JoinRequested,
    BotJoinedMeeting,
    BotRecordingPermissionGranted,
    BotPutInWaitingRoom,
    MeetingEnded,
    BotLeftMeeting,
    LeaveRequested,
    CouldNotJoin,
    FatalError,
    PostProcessingCompleted,
    RecordingPaused,
    RecordingResumed,
    DataDeleted,
}

/// Event sub-types. Used to pick among transition branches and to record the
/// precise failure or leave reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotEventSubType {
    CouldNotJoinMeetingRequestToJoinDenied,
    CouldNotJoinMeetingMeetingNotFound,
    CouldNotJoinMeetingNotStartedWaitingForHost,
    CouldNotJoinMeetingZoomAuthorizationFailed,
    CouldNotJoinMeetingZoomMeetingStatusFailed,
    CouldNotJoinMeetingUnpublishedZoomApp,
    CouldNotJoinMeetingZoomSdkInternalError,
    CouldNotJoinMeetingWaitingRoomTimeoutExceeded,
    FatalErrorProcessTerminated,
    FatalErrorRtmpConnectionFailed,
    FatalErrorUiElementNotFound,
    LeaveRequestedAutoLeaveSilence,
    LeaveRequestedAutoLeaveOnlyParticipantInMeeting,
    LeaveRequestedAutoLeaveMaxUptimeExceeded,
    LeaveRequestedUserRequested,
}

/// One append-only audit record. `old_state` is the bot's state at write
/// time; `new_state` is what [`transition`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub id: u64,
    pub bot_id: crate::models::BotId,
    pub event_type: BotEventType,
    pub event_sub_type: Option<BotEventSubType>,
    pub old_state: BotState,
    pub new_state: BotState,
    pub metadata: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Set when the supervisor has acted on a requested transition
    /// (e.g. told the adapter to join or leave).
    pub requested_bot_action_taken_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Debug artifacts (screenshots, MHTML dumps, debug recordings) attached
    /// to this event, as storage keys.
    pub debug_artifacts: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no transition from {from:?} on {event:?} (sub-type {sub_type:?})")]
    InvalidTransition {
        from: BotState,
        event: BotEventType,
        sub_type: Option<BotEventSubType>,
    },
}

/// The transition table. Returns the next state, or an error if the
/// (state, event[, sub-type]) triple has no mapping. Callers must not mutate
/// any state when this fails.
pub fn transition(
    from: BotState,
    event: BotEventType,
    sub_type: Option<BotEventSubType>,
) -> Result<BotState, TransitionError> {
    use BotEventType as Ev;
    use BotState as St;

    let invalid = || TransitionError::InvalidTransition {
        from,
        event,
        sub_type,
    };

    let to = match (from, event) {
        (St::Ready, Ev::JoinRequested) | (St::Scheduled, Ev::JoinRequested) => St::Joining,

        (St::Joining, Ev::BotJoinedMeeting) | (St::WaitingRoom, Ev::BotJoinedMeeting) => {
            St::JoinedNotRecording
        }
        (St::Joining, Ev::BotPutInWaitingRoom) | (St::JoinedRecording, Ev::BotPutInWaitingRoom) => {
            St::WaitingRoom
        }
        (St::Joining, Ev::CouldNotJoin) | (St::WaitingRoom, Ev::CouldNotJoin) => St::FatalError,

        (St::JoinedNotRecording, Ev::BotRecordingPermissionGranted) => St::JoinedRecording,

        (St::JoinedRecording, Ev::RecordingPaused) => St::JoinedRecordingPaused,
        (St::JoinedRecordingPaused, Ev::RecordingResumed) => St::JoinedRecording,

        (St::JoinedNotRecording, Ev::LeaveRequested)
        | (St::JoinedRecording, Ev::LeaveRequested)
        | (St::JoinedRecordingPaused, Ev::LeaveRequested)
        | (St::WaitingRoom, Ev::LeaveRequested) => St::Leaving,

        (St::JoinedNotRecording, Ev::MeetingEnded)
        | (St::JoinedRecording, Ev::MeetingEnded)
        | (St::JoinedRecordingPaused, Ev::MeetingEnded) => St::PostProcessing,

        (St::Leaving, Ev::BotLeftMeeting) => St::PostProcessing,

        (St::PostProcessing, Ev::PostProcessingCompleted) => St::Ended,

        (St::Ended, Ev::DataDeleted) | (St::FatalError, Ev::DataDeleted) => St::DataDeleted,

        (state, Ev::FatalError) if !state.is_terminal() => St::FatalError,

        _ => return Err(invalid()),
    };

    Ok(to)
}
