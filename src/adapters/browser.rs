//! Shared machinery for the browser-driven adapters (Google Meet, Teams).
//!
//! These platforms are joined through a headless browser controlled by the
//! platform bridge; recording happens by capturing the X display, captions
//! come from the platform's caption UI, and join failures surface as
//! missing-UI-element errors with debug artifacts.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::models::AutoLeaveSettings;

use super::core::AdapterCore;
use super::{
    AdapterCallbacks, AdapterMessage, MeetingKind, ParticipantInfo, PlatformEvent, PlatformLink,
    PlatformMeetingStatus,
};

pub(super) struct BrowserInner {
    pub kind: MeetingKind,
    pub display_name: String,
    pub link: Arc<dyn PlatformLink>,
    pub core: AdapterCore,
    event_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BrowserInner {
    pub fn new(
        kind: MeetingKind,
        display_name: String,
        link: Arc<dyn PlatformLink>,
        callbacks: AdapterCallbacks,
        auto_leave_settings: AutoLeaveSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            display_name,
            link,
            core: AdapterCore::new(callbacks, auto_leave_settings),
            event_task: std::sync::Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        tracing::info!(
            meeting = ?self.kind,
            display_name = %self.display_name,
            "joining browser-based meeting"
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.link
            .connect(tx)
            .context("failed to connect browser platform bridge")?;

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                inner.handle_event(event);
            }
        });
        *self.event_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    pub fn handle_event(&self, event: PlatformEvent) {
        if self.core.handle_common_event(&event) {
            return;
        }
        let callbacks = &self.core.callbacks;
        match event {
            PlatformEvent::MeetingStatus(PlatformMeetingStatus::InMeeting) => {
                self.core.note_joined();
                callbacks.send_message(AdapterMessage::JoinedMeeting);
            }
            PlatformEvent::MeetingStatus(PlatformMeetingStatus::InWaitingRoom) => {
                self.core.note_in_waiting_room();
                callbacks.send_message(AdapterMessage::PutInWaitingRoom);
            }
            PlatformEvent::MeetingStatus(PlatformMeetingStatus::WaitingForHost) => {
                self.core.note_waiting_for_host();
            }
            PlatformEvent::MeetingStatus(PlatformMeetingStatus::Ended) => {
                callbacks.send_message(AdapterMessage::MeetingEnded);
            }
            PlatformEvent::MeetingStatus(PlatformMeetingStatus::Failed { code, .. }) => {
                // Browser bridges report join failures as UI errors; a bare
                // failed status still needs to surface.
                tracing::warn!(code, "browser meeting bridge reported failure");
                callbacks.send_message(AdapterMessage::MeetingNotFound);
            }
            PlatformEvent::RecordingPermissionGranted => {
                callbacks.send_message(AdapterMessage::RecordingPermissionGranted);
            }
            PlatformEvent::RecordingUiReady { display } => {
                callbacks.send_message(AdapterMessage::ScreenRecordingShouldStart { display });
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
                tracing::debug!(?other, "unhandled browser platform event");
            }
        }
    }

    pub fn leave(&self) {
        self.core
            .requested_leave
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.link.leave();
    }

    pub fn cleanup(&self) {
        if self
            .core
            .cleaned_up
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.link.disconnect();
        if let Some(task) = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn check_auto_leave(&self) {
        self.core.check_auto_leave_at(Instant::now());
    }

    pub fn get_participant(&self, uuid: &str) -> Option<ParticipantInfo> {
        self.core.get_participant(uuid)
    }
}
