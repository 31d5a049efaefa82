//! Microsoft Teams adapter (headless-browser based).

use std::sync::Arc;

use anyhow::Result;

use crate::media::image;
use crate::models::AutoLeaveSettings;

use super::browser::BrowserInner;
use super::{
    AdapterCallbacks, MeetingAdapter, MeetingKind, ParticipantInfo, PlatformEvent, PlatformLink,
};

pub struct TeamsAdapter {
    inner: Arc<BrowserInner>,
}

impl TeamsAdapter {
    pub fn new(
        display_name: String,
        link: Arc<dyn PlatformLink>,
        callbacks: AdapterCallbacks,
        auto_leave_settings: AutoLeaveSettings,
    ) -> Self {
        Self {
            inner: BrowserInner::new(
                MeetingKind::Teams,
                display_name,
                link,
                callbacks,
                auto_leave_settings,
            ),
        }
    }

    /// Test hook: inject a platform event as if the browser bridge produced
    /// it.
    pub fn handle_platform_event(&self, event: PlatformEvent) {
        self.inner.handle_event(event);
    }
}

impl MeetingAdapter for TeamsAdapter {
    fn init(&self) -> Result<()> {
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
        MeetingKind::Teams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{collecting_callbacks, NullLink};
    use crate::adapters::{AdapterMessage, CaptionUpsert, PlatformMeetingStatus};

    #[tokio::test]
    async fn captions_flow_to_the_caption_sink() {
        let (mut callbacks, _rx) = collecting_callbacks();
        let (caption_tx, caption_rx) = std::sync::mpsc::channel::<CaptionUpsert>();
        callbacks.captions = Some(caption_tx);

        let adapter = TeamsAdapter::new(
            "Notetaker".into(),
            Arc::new(NullLink::default()),
            callbacks,
            AutoLeaveSettings::default(),
        );
        adapter.handle_platform_event(PlatformEvent::CaptionUpsert {
            device_id: "d1".into(),
            caption_id: "c1".into(),
            text: "hello".into(),
        });

        let caption = caption_rx.try_recv().unwrap();
        assert_eq!(caption.device_id, "d1");
        assert_eq!(caption.text, "hello");
    }

    #[tokio::test]
    async fn joined_then_ended_sequence() {
        let (callbacks, mut rx) = collecting_callbacks();
        let adapter = TeamsAdapter::new(
            "Notetaker".into(),
            Arc::new(NullLink::default()),
            callbacks,
            AutoLeaveSettings::default(),
        );
        adapter.handle_platform_event(PlatformEvent::MeetingStatus(
            PlatformMeetingStatus::InMeeting,
        ));
        adapter.handle_platform_event(PlatformEvent::MeetingStatus(PlatformMeetingStatus::Ended));
        assert!(matches!(rx.try_recv(), Ok(AdapterMessage::JoinedMeeting)));
        assert!(matches!(rx.try_recv(), Ok(AdapterMessage::MeetingEnded)));
    }
}
