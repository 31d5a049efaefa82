//! Google Meet adapter (headless-browser based).

use std::sync::Arc;

use anyhow::Result;

use crate::media::image;
use crate::models::AutoLeaveSettings;

use super::browser::BrowserInner;
use super::{
    AdapterCallbacks, MeetingAdapter, MeetingKind, ParticipantInfo, PlatformEvent, PlatformLink,
};

pub struct GoogleMeetAdapter {
    inner: Arc<BrowserInner>,
    /// Language the caption UI is switched to before recording starts.
    closed_captions_language: Option<String>,
}

impl GoogleMeetAdapter {
    pub fn new(
        display_name: String,
        link: Arc<dyn PlatformLink>,
        callbacks: AdapterCallbacks,
        auto_leave_settings: AutoLeaveSettings,
        closed_captions_language: Option<String>,
    ) -> Self {
        Self {
            inner: BrowserInner::new(
                MeetingKind::GoogleMeet,
                display_name,
                link,
                callbacks,
                auto_leave_settings,
            ),
            closed_captions_language,
        }
    }

    /// Test hook: inject a platform event as if the browser bridge produced
    /// it.
    pub fn handle_platform_event(&self, event: PlatformEvent) {
        self.inner.handle_event(event);
    }
}

impl MeetingAdapter for GoogleMeetAdapter {
    fn init(&self) -> Result<()> {
        if let Some(language) = &self.closed_captions_language {
            tracing::info!(%language, "google meet captions language configured");
        }
        self.inner.start()
    }

    fn leave(&self) {
        self.inner.leave();
    }

    fn cleanup(&self) {
        self.inner.cleanup();
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
        self.inner.check_auto_leave();
    }

    fn get_participant(&self, uuid: &str) -> Option<ParticipantInfo> {
        self.inner.get_participant(uuid)
    }

    fn get_first_buffer_timestamp_ms(&self) -> Option<i64> {
        self.inner.core.first_buffer_timestamp_ms()
    }

    fn meeting_kind(&self) -> MeetingKind {
        MeetingKind::GoogleMeet
    }
}
