//! Bookkeeping shared by all meeting adapters: roster, auto-leave timers,
//! first-buffer timestamps, and forwarding of media streams into the
//! supervisor's ingest sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::models::AutoLeaveSettings;

use super::{
    AdapterCallbacks, AdapterMessage, AudioChunk, AutoLeaveTracker, AutoLeaveTrigger,
    CaptionUpsert, LeaveReason, ParticipantInfo, PlatformEvent,
};

pub(super) struct AdapterCore {
    pub callbacks: AdapterCallbacks,
    pub auto_leave_settings: AutoLeaveSettings,
    state: Mutex<CoreState>,
    pub requested_leave: AtomicBool,
    pub cleaned_up: AtomicBool,
}

struct CoreState {
    tracker: AutoLeaveTracker,
    roster: HashMap<String, ParticipantInfo>,
    first_buffer_timestamp_ms: Option<i64>,
}

impl AdapterCore {
    pub fn new(callbacks: AdapterCallbacks, auto_leave_settings: AutoLeaveSettings) -> Self {
        Self {
            callbacks,
            auto_leave_settings,
            state: Mutex::new(CoreState {
                tracker: AutoLeaveTracker::new(Instant::now()),
                roster: HashMap::new(),
                first_buffer_timestamp_ms: None,
            }),
            requested_leave: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn note_joined(&self) {
        self.with_tracker(|tracker, now| tracker.note_joined(now));
    }

    pub fn note_waiting_for_host(&self) {
        self.with_tracker(|tracker, now| tracker.note_waiting_for_host(now));
    }

    pub fn note_in_waiting_room(&self) {
        self.with_tracker(|tracker, now| tracker.note_in_waiting_room(now));
    }

    fn with_tracker(&self, f: impl FnOnce(&mut AutoLeaveTracker, Instant)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state.tracker, Instant::now());
    }

    pub fn get_participant(&self, uuid: &str) -> Option<ParticipantInfo> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .roster
            .get(uuid)
            .cloned()
    }

    pub fn first_buffer_timestamp_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first_buffer_timestamp_ms
    }

    fn note_first_buffer(&self, state: &mut CoreState) {
        if state.first_buffer_timestamp_ms.is_none() {
            state.first_buffer_timestamp_ms = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// Handle the platform events that mean the same thing on every
    /// platform. Returns `false` when the event was not consumed so the
    /// caller can apply its platform-specific translation.
    pub fn handle_common_event(&self, event: &PlatformEvent) -> bool {
        match event {
            PlatformEvent::ParticipantJoined {
                uuid,
                user_uuid,
                full_name,
                is_the_bot,
            } => {
                let participant = ParticipantInfo {
                    uuid: uuid.clone(),
                    user_uuid: user_uuid.clone(),
                    full_name: full_name.clone(),
                    is_the_bot: *is_the_bot,
                };
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.roster.insert(uuid.clone(), participant.clone());
                }
                if !is_the_bot {
                    self.callbacks.send_message(AdapterMessage::ParticipantJoined {
                        participant,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    });
                }
                true
            }
            PlatformEvent::ParticipantLeft { uuid } => {
                self.callbacks.send_message(AdapterMessage::ParticipantLeft {
                    participant_uuid: uuid.clone(),
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                });
                true
            }
            PlatformEvent::ParticipantCount { count } => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                state.tracker.note_participant_count(*count, now);
                true
            }
            PlatformEvent::AudioChunk {
                participant_uuid,
                timestamp_ms,
                pcm,
            } => {
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.tracker.note_audio_received(Instant::now());
                    self.note_first_buffer(&mut state);
                }
                if let Some(sink) = &self.callbacks.audio_chunks {
                    let _ = sink.send(AudioChunk {
                        participant_uuid: participant_uuid.clone(),
                        timestamp_ms: *timestamp_ms,
                        pcm: pcm.clone(),
                    });
                }
                true
            }
            PlatformEvent::MixedAudio { pcm, timestamp_ns } => {
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.tracker.note_audio_received(Instant::now());
                    self.note_first_buffer(&mut state);
                }
                if let Some(sink) = &self.callbacks.mixed_audio {
                    sink(pcm, *timestamp_ns);
                }
                true
            }
            PlatformEvent::VideoFrame { i420, timestamp_ns } => {
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    self.note_first_buffer(&mut state);
                }
                let wants = self
                    .callbacks
                    .wants_video_frames
                    .as_ref()
                    .map(|f| f())
                    .unwrap_or(false);
                if wants {
                    if let Some(sink) = &self.callbacks.video_frames {
                        sink(i420.clone(), *timestamp_ns);
                    }
                }
                true
            }
            PlatformEvent::CaptionUpsert {
                device_id,
                caption_id,
                text,
            } => {
                if let Some(sink) = &self.callbacks.captions {
                    let _ = sink.send(CaptionUpsert {
                        device_id: device_id.clone(),
                        caption_id: caption_id.clone(),
                        text: text.clone(),
                    });
                }
                true
            }
            PlatformEvent::ChatMessage {
                participant_uuid,
                text,
                timestamp_ms,
                source_uuid,
            } => {
                self.callbacks.send_message(AdapterMessage::ChatMessageReceived {
                    participant_uuid: participant_uuid.clone(),
                    text: text.clone(),
                    timestamp_ms: *timestamp_ms,
                    source_uuid: source_uuid.clone(),
                });
                true
            }
            PlatformEvent::RequestToJoinDenied => {
                self.callbacks.send_message(AdapterMessage::RequestToJoinDenied);
                true
            }
            PlatformEvent::MeetingNotFound => {
                self.callbacks.send_message(AdapterMessage::MeetingNotFound);
                true
            }
            PlatformEvent::ReadyToShowBotImage => {
                self.callbacks.send_message(AdapterMessage::ReadyToShowBotImage);
                true
            }
            _ => false,
        }
    }

    /// Run the auto-leave checks at `now` and emit the matching message.
    pub fn check_auto_leave_at(&self, now: Instant) {
        if self.requested_leave.load(Ordering::SeqCst) || self.cleaned_up.load(Ordering::SeqCst) {
            return;
        }
        let trigger = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let settings = self.auto_leave_settings.clone();
            state.tracker.check(&settings, now)
        };
        let Some(trigger) = trigger else { return };

        match trigger {
            AutoLeaveTrigger::Silence => {
                tracing::info!("auto-leave: continuous silence limit reached");
                self.requested_leave.store(true, Ordering::SeqCst);
                self.callbacks.send_message(AdapterMessage::RequestedLeave {
                    reason: LeaveReason::AutoLeaveSilence,
                });
            }
            AutoLeaveTrigger::OnlyParticipantInMeeting => {
                tracing::info!("auto-leave: bot is the only participant");
                self.requested_leave.store(true, Ordering::SeqCst);
                self.callbacks.send_message(AdapterMessage::RequestedLeave {
                    reason: LeaveReason::AutoLeaveOnlyParticipantInMeeting,
                });
            }
            AutoLeaveTrigger::MaxUptimeExceeded => {
                tracing::info!("auto-leave: max uptime exceeded");
                self.requested_leave.store(true, Ordering::SeqCst);
                self.callbacks.send_message(AdapterMessage::RequestedLeave {
                    reason: LeaveReason::AutoLeaveMaxUptimeExceeded,
                });
            }
            AutoLeaveTrigger::WaitingForHostTimeout => {
                tracing::info!("giving up waiting for the host to start the meeting");
                self.requested_leave.store(true, Ordering::SeqCst);
                self.callbacks
                    .send_message(AdapterMessage::LeaveMeetingWaitingForHost);
            }
            AutoLeaveTrigger::WaitingRoomTimeout => {
                tracing::info!("giving up waiting in the waiting room");
                self.requested_leave.store(true, Ordering::SeqCst);
                self.callbacks.send_message(AdapterMessage::WaitingRoomTimedOut);
            }
        }
    }
}
