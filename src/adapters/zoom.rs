//! Zoom adapter: translates raw SDK bridge events into supervisor messages.
//!
//! Zoom is the only platform whose media flows through the in-process
//! encoding pipeline; the bridge delivers per-participant audio, mixed audio
//! and raw video frames, and takes PCM / I420 stills back for the bot's
//! virtual mic and camera.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::media::image;
use crate::models::AutoLeaveSettings;

use super::core::AdapterCore;
use super::{
    AdapterCallbacks, AdapterMessage, MeetingAdapter, MeetingKind, ParticipantInfo, PlatformEvent,
    PlatformLink, PlatformMeetingStatus,
};

pub struct ZoomAdapter {
    inner: Arc<Inner>,
}

struct Inner {
    kind: MeetingKind,
    display_name: String,
    link: Arc<dyn PlatformLink>,
    core: AdapterCore,
    event_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ZoomAdapter {
    pub fn new(
        kind: MeetingKind,
        display_name: String,
        link: Arc<dyn PlatformLink>,
        callbacks: AdapterCallbacks,
        auto_leave_settings: AutoLeaveSettings,
    ) -> Self {
        debug_assert!(matches!(kind, MeetingKind::Zoom { .. }));
        Self {
            inner: Arc::new(Inner {
                kind,
                display_name,
                link,
                core: AdapterCore::new(callbacks, auto_leave_settings),
                event_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Test hook: run the auto-leave checks at an arbitrary instant.
    pub fn check_auto_leave_at(&self, now: Instant) {
        self.inner.core.check_auto_leave_at(now);
    }

    /// Test hook: inject a platform event as if the SDK bridge produced it.
    pub fn handle_platform_event(&self, event: PlatformEvent) {
        self.inner.handle_event(event);
    }
}

impl Inner {
    fn handle_event(&self, event: PlatformEvent) {
        if self.core.handle_common_event(&event) {
            return;
        }
        let callbacks = &self.core.callbacks;
        match event {
            PlatformEvent::AuthSucceeded => {
                tracing::info!("zoom authentication successful");
            }
            PlatformEvent::AuthFailed { code } => {
                callbacks.send_message(AdapterMessage::ZoomAuthorizationFailed { code });
            }
            PlatformEvent::SdkInternalError { code } => {
                callbacks.send_message(AdapterMessage::ZoomSdkInternalError { code });
            }
            PlatformEvent::MeetingStatus(status) => self.handle_meeting_status(status),
            PlatformEvent::RecordingPermissionGranted => {
                callbacks.send_message(AdapterMessage::RecordingPermissionGranted);
            }
            PlatformEvent::RecordingUiReady { .. } => {
                // The Zoom bot records through the pipeline, not the screen.
            }
            PlatformEvent::UiElementNotFound {
                step,
                exception_type,
                exception_message,
                screenshot_path,
                mhtml_path,
            } => {
                callbacks.send_message(AdapterMessage::UiElementNotFound {
                    step,
                    exception_type,
                    exception_message,
                    screenshot_path,
                    mhtml_path,
                });
            }
            other => {
                tracing::debug!(?other, "unhandled zoom platform event");
            }
        }
    }

    fn handle_meeting_status(&self, status: PlatformMeetingStatus) {
        tracing::info!(?status, "zoom meeting status changed");
        let callbacks = &self.core.callbacks;
        match status {
            PlatformMeetingStatus::WaitingForHost => {
                self.core.note_waiting_for_host();
            }
            PlatformMeetingStatus::InWaitingRoom => {
                self.core.note_in_waiting_room();
                callbacks.send_message(AdapterMessage::PutInWaitingRoom);
            }
            PlatformMeetingStatus::InMeeting => {
                self.core.note_joined();
                callbacks.send_message(AdapterMessage::JoinedMeeting);
            }
            PlatformMeetingStatus::Ended => {
                // Arrives whether or not we initiated the leave.
                callbacks.send_message(AdapterMessage::MeetingEnded);
            }
            PlatformMeetingStatus::Failed {
                code,
                unable_to_join_external,
            } => {
                if unable_to_join_external {
                    callbacks.send_message(
                        AdapterMessage::ZoomMeetingStatusFailedUnableToJoinExternalMeeting { code },
                    );
                } else {
                    callbacks.send_message(AdapterMessage::ZoomMeetingStatusFailed { code });
                }
            }
        }
    }
}

impl MeetingAdapter for ZoomAdapter {
    fn init(&self) -> Result<()> {
        tracing::info!(
            meeting = ?self.inner.kind,
            display_name = %self.inner.display_name,
            "joining zoom meeting"
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner
            .link
            .connect(tx)
            .context("failed to connect zoom platform bridge")?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_event(event);
            }
        });
        *self
            .inner
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    fn leave(&self) {
        self.inner
            .core
            .requested_leave
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.link.leave();
    }

    fn cleanup(&self) {
        if self
            .inner
            .core
            .cleaned_up
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.inner.link.disconnect();
        if let Some(task) = self
            .inner
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn send_raw_audio(&self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        self.inner.link.send_audio(pcm, sample_rate)
    }

    fn send_raw_image(&self, png: &[u8]) -> Result<()> {
        let frame = image::png_to_i420(png)?;
        self.inner.link.send_video_frame(&frame)
    }

    fn send_chat_message(&self, text: &str, to_participant_uuid: Option<&str>) -> Result<()> {
        self.inner.link.send_chat_message(text, to_participant_uuid)
    }

    fn admit_from_waiting_room(&self) -> Result<()> {
        self.inner.link.admit_from_waiting_room()
    }

    fn check_auto_leave_conditions(&self) {
        self.inner.core.check_auto_leave_at(Instant::now());
    }

    fn get_participant(&self, uuid: &str) -> Option<ParticipantInfo> {
        self.inner.core.get_participant(uuid)
    }

    fn get_first_buffer_timestamp_ms(&self) -> Option<i64> {
        self.inner.core.first_buffer_timestamp_ms()
    }

    fn meeting_kind(&self) -> MeetingKind {
        self.inner.kind.clone()
    }
}
