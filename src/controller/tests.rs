//! Supervisor scenarios driven through the real message-dispatch path with
//! a scripted platform bridge.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::adapters::test_support::NullLink;
use crate::adapters::{ParticipantInfo, PlatformEvent, PlatformMeetingStatus};
use crate::store::NewBot;
use crate::transcription::test_support::SilenceSynthesizer;
use crate::webhooks::WebhookDispatcher;
use super::uploader::FileUploader;

struct Harness {
    store: Store,
    supervisor: Supervisor,
    bot: Bot,
    org_id: OrganizationId,
    link: Arc<NullLink>,
}

async fn harness(meeting_url: &str, configure: impl FnOnce(&mut BotSettings)) -> Harness {
    let store = Store::new(true);
    let org = Organization {
        id: uuid::Uuid::new_v4(),
        name: "Acme".into(),
        centicredits_balance: 10_000,
    };
    let project = Project {
        id: uuid::Uuid::new_v4(),
        organization_id: org.id,
        name: "Default".into(),
    };
    store.insert_organization(org.clone()).await;
    store.insert_project(project.clone()).await;

    let mut settings = BotSettings::default();
    configure(&mut settings);
    let bot = store
        .create_bot(NewBot {
            project_id: project.id,
            meeting_url: meeting_url.into(),
            name: "Notetaker".into(),
            settings,
            join_at: None,
            deduplication_key: None,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let link = Arc::new(NullLink::default());
    let storage_root =
        std::env::temp_dir().join(format!("meetbot-test-storage-{}", uuid::Uuid::new_v4()));
    let deps = SupervisorDeps {
        platform_link: Arc::clone(&link) as Arc<dyn crate::adapters::PlatformLink>,
        transcriber_factory: None,
        synthesizer: Some(Arc::new(SilenceSynthesizer { duration_ms: 10_000 })),
        uploader: Arc::new(FileUploader::new(storage_root)),
        webhooks: WebhookDispatcher::new(store.clone(), "meetbot-webhook/1.0".into()),
    };
    let supervisor = Supervisor::new(
        store.clone(),
        bot.id,
        "redis://127.0.0.1/".into(),
        deps,
    )
    .await
    .unwrap();

    Harness {
        store,
        supervisor,
        bot,
        org_id: org.id,
        link,
    }
}

async fn event_types(store: &Store, bot_id: BotId) -> Vec<BotEventType> {
    store
        .events_for_bot(bot_id)
        .await
        .iter()
        .map(|e| e.event_type)
        .collect()
}

fn adapter_message(message: AdapterMessage) -> MainMessage {
    MainMessage::Adapter(message)
}

#[tokio::test]
async fn zoom_happy_path_ends_with_one_credit_charge() {
    let mut h = harness("https://zoom.us/j/123456789?pwd=password123", |settings| {
        settings.recording.format = RecordingFormat::Mp4;
    })
    .await;

    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::RecordingPermissionGranted))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::MeetingEnded))
        .await;

    assert_eq!(
        event_types(&h.store, h.bot.id).await,
        vec![
            BotEventType::JoinRequested,
            BotEventType::BotJoinedMeeting,
            BotEventType::BotRecordingPermissionGranted,
            BotEventType::MeetingEnded,
            BotEventType::PostProcessingCompleted,
        ]
    );
    assert_eq!(h.store.bot(h.bot.id).await.unwrap().state, BotState::Ended);

    let transactions = h.store.credit_transactions_for_organization(h.org_id).await;
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].centicredits_delta < 0);

    // Every event recorded a consistent old/new state chain.
    let events = h.store.events_for_bot(h.bot.id).await;
    for window in events.windows(2) {
        assert_eq!(window[0].new_state, window[1].old_state);
    }
}

#[tokio::test]
async fn wait_for_host_timeout_is_a_could_not_join() {
    let mut h = harness("https://zoom.us/j/123456789?pwd=password123", |settings| {
        settings.auto_leave.wait_for_host_to_start_meeting_timeout_seconds = 1;
    })
    .await;

    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::LeaveMeetingWaitingForHost))
        .await;

    let events = h.store.events_for_bot(h.bot.id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].event_type, BotEventType::CouldNotJoin);
    assert_eq!(
        events[1].event_sub_type,
        Some(BotEventSubType::CouldNotJoinMeetingNotStartedWaitingForHost)
    );
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::FatalError
    );
    assert_eq!(
        h.store
            .credit_transactions_for_organization(h.org_id)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn silence_auto_leave_flows_through_leaving_to_ended() {
    let mut h = harness("https://zoom.us/j/123456789?pwd=password123", |_| {}).await;

    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::RecordingPermissionGranted))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::RequestedLeave {
            reason: crate::adapters::LeaveReason::AutoLeaveSilence,
        }))
        .await;

    let events = h.store.events_for_bot(h.bot.id).await;
    let leave = events.last().unwrap();
    assert_eq!(leave.event_type, BotEventType::LeaveRequested);
    assert_eq!(
        leave.event_sub_type,
        Some(BotEventSubType::LeaveRequestedAutoLeaveSilence)
    );
    assert!(leave.requested_bot_action_taken_at.is_some());
    assert!(h.link.left.load(std::sync::atomic::Ordering::SeqCst));

    h.supervisor
        .handle_message(adapter_message(AdapterMessage::MeetingEnded))
        .await;

    assert_eq!(
        event_types(&h.store, h.bot.id).await,
        vec![
            BotEventType::JoinRequested,
            BotEventType::BotJoinedMeeting,
            BotEventType::BotRecordingPermissionGranted,
            BotEventType::LeaveRequested,
            BotEventType::BotLeftMeeting,
            BotEventType::PostProcessingCompleted,
        ]
    );
    assert_eq!(h.store.bot(h.bot.id).await.unwrap().state, BotState::Ended);
}

#[tokio::test]
async fn rtmp_failure_is_fatal_with_destination_in_metadata() {
    let mut h = harness("https://zoom.us/j/123456789?pwd=password123", |settings| {
        settings.rtmp = Some(RtmpSettings {
            destination_url: "rtmp://example.com/live/stream".into(),
            stream_key: "1234".into(),
        });
    })
    .await;
    assert!(h.supervisor.test_pipeline_config().streams_rtmp());

    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor.handle_message(MainMessage::RtmpConnectionFailed).await;

    let events = h.store.events_for_bot(h.bot.id).await;
    let fatal = events.last().unwrap();
    assert_eq!(fatal.event_type, BotEventType::FatalError);
    assert_eq!(
        fatal.event_sub_type,
        Some(BotEventSubType::FatalErrorRtmpConnectionFailed)
    );
    assert_eq!(
        fatal.metadata["rtmp_destination_url"],
        "rtmp://example.com/live/stream/1234"
    );
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::FatalError
    );
}

#[tokio::test]
async fn zoom_failure_codes_land_in_event_metadata() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::ZoomMeetingStatusFailed {
            code: 5003,
        }))
        .await;

    let events = h.store.events_for_bot(h.bot.id).await;
    let failure = events.last().unwrap();
    assert_eq!(failure.event_type, BotEventType::CouldNotJoin);
    assert_eq!(
        failure.event_sub_type,
        Some(BotEventSubType::CouldNotJoinMeetingZoomMeetingStatusFailed)
    );
    assert_eq!(failure.metadata["zoom_result_code"], "5003");
}

#[tokio::test]
async fn at_most_one_audio_request_plays_and_dispatch_is_fifo() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;

    let first = MediaRequest {
        id: uuid::Uuid::new_v4(),
        bot_id: h.bot.id,
        kind: MediaRequestKind::Audio,
        state: MediaRequestState::Enqueued,
        media_blob: None,
        duration_ms: None,
        text_to_speak: Some("first".into()),
        text_to_speech_settings: None,
        media_url: None,
        created_at: chrono::Utc::now(),
    };
    let mut second = first.clone();
    second.id = uuid::Uuid::new_v4();
    second.text_to_speak = Some("second".into());
    second.created_at = first.created_at + chrono::Duration::milliseconds(10);
    h.store.insert_media_request(first.clone()).await;
    h.store.insert_media_request(second.clone()).await;

    h.supervisor
        .handle_message(MainMessage::Command(BotCommand::SyncMediaRequests))
        .await;

    let playing = h
        .store
        .currently_playing_media_request(h.bot.id, MediaRequestKind::Audio)
        .await
        .unwrap();
    assert_eq!(playing.id, first.id);
    assert_eq!(
        h.store.media_request(second.id).await.unwrap().state,
        MediaRequestState::Enqueued
    );

    // A second sync does not start another playback.
    h.supervisor
        .handle_message(MainMessage::Command(BotCommand::SyncMediaRequests))
        .await;
    let requests = [
        h.store.media_request(first.id).await.unwrap().state,
        h.store.media_request(second.id).await.unwrap().state,
    ];
    assert_eq!(
        requests,
        [MediaRequestState::Playing, MediaRequestState::Enqueued]
    );
}

#[tokio::test]
async fn image_requests_coalesce_to_the_newest() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;

    let png = {
        use image::codecs::png::PngEncoder;
        use image::ImageEncoder;
        let img = image::RgbImage::new(4, 4);
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), 4, 4, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    };

    let mut ids = Vec::new();
    for offset in 0..3 {
        let request = MediaRequest {
            id: uuid::Uuid::new_v4(),
            bot_id: h.bot.id,
            kind: MediaRequestKind::Image,
            state: MediaRequestState::Enqueued,
            media_blob: Some(png.clone()),
            duration_ms: None,
            text_to_speak: None,
            text_to_speech_settings: None,
            media_url: None,
            created_at: chrono::Utc::now() + chrono::Duration::milliseconds(offset),
        };
        ids.push(request.id);
        h.store.insert_media_request(request).await;
    }

    h.supervisor
        .handle_message(adapter_message(AdapterMessage::ReadyToShowBotImage))
        .await;

    assert_eq!(
        h.store.media_request(ids[2]).await.unwrap().state,
        MediaRequestState::Finished
    );
    assert_eq!(
        h.store.media_request(ids[0]).await.unwrap().state,
        MediaRequestState::Dropped
    );
    assert_eq!(
        h.store.media_request(ids[1]).await.unwrap().state,
        MediaRequestState::Dropped
    );
}

#[tokio::test]
async fn repeated_caption_upserts_produce_one_utterance() {
    let mut h = harness("https://meet.google.com/abc-defg-hij", |_| {}).await;
    assert_eq!(h.supervisor.test_provider(), "meeting_closed_captions");

    // Drive the join through the adapter so the roster knows the speaker.
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor.take_action_based_on_bot_state().await;

    h.link.emit(PlatformEvent::ParticipantJoined {
        uuid: "d1".into(),
        user_uuid: None,
        full_name: Some("Alice".into()),
        is_the_bot: false,
    });
    h.link.emit(PlatformEvent::MeetingStatus(
        PlatformMeetingStatus::InMeeting,
    ));
    h.link.emit(PlatformEvent::RecordingPermissionGranted);
    for text in ["hel", "hello", "hello world"] {
        h.link.emit(PlatformEvent::CaptionUpsert {
            device_id: "d1".into(),
            caption_id: "c1".into(),
            text: text.into(),
        });
    }
    // Let the adapter's event task drain.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Apply the queued join/permission messages on the main loop.
    while let Ok(message) = h.supervisor.messages_rx.try_recv() {
        h.supervisor.handle_message(message).await;
    }

    h.supervisor.process_captions(true).await;

    let recording = h.store.default_recording(h.bot.id).await.unwrap();
    let utterances = h.store.utterances_for_recording(recording.id).await;
    assert_eq!(utterances.len(), 1);
    let utterance = &utterances[0];
    assert_eq!(
        utterance.transcription.as_ref().unwrap().transcript,
        "hello world"
    );
    assert_eq!(
        utterance.source_uuid.as_deref(),
        Some(format!("{}-d1-c1", recording.id).as_str())
    );
    assert_eq!(utterance.source, UtteranceSource::ClosedCaptionFromPlatform);
    assert_eq!(
        h.store
            .recording_by_id(recording.id)
            .await
            .unwrap()
            .transcription_state,
        TranscriptionState::InProgress
    );

    // The speaker row was created from the roster.
    let info = h.supervisor.adapter.get_participant("d1").unwrap();
    assert_eq!(info.full_name.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn chat_messages_from_the_meeting_are_stored_once() {
    let mut h = harness("https://teams.microsoft.com/l/meetup-join/19%3ameeting", |_| {}).await;
    for _ in 0..2 {
        h.supervisor
            .handle_message(adapter_message(AdapterMessage::ChatMessageReceived {
                participant_uuid: Some("p1".into()),
                text: "hello from chat".into(),
                timestamp_ms: 123,
                source_uuid: Some("m1".into()),
            }))
            .await;
    }
    let messages = h.store.chat_messages_for_bot(h.bot.id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "hello from chat");
}

#[tokio::test]
async fn participant_events_build_a_join_leave_timeline() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::ParticipantJoined {
            participant: ParticipantInfo {
                uuid: "p1".into(),
                user_uuid: Some("u1".into()),
                full_name: Some("Alice".into()),
                is_the_bot: false,
            },
            timestamp_ms: 100,
        }))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::ParticipantLeft {
            participant_uuid: "p1".into(),
            timestamp_ms: 200,
        }))
        .await;

    let events = h.store.participant_events_for_bot(h.bot.id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ParticipantEventKind::Join);
    assert_eq!(events[1].kind, ParticipantEventKind::Leave);
    assert_eq!(events[0].participant_id, events[1].participant_id);
}

#[tokio::test]
async fn ui_element_failure_attaches_debug_artifacts() {
    let mut h = harness("https://meet.google.com/abc-defg-hij", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::UiElementNotFound {
            step: "click_join_button".into(),
            exception_type: Some("TimeoutError".into()),
            exception_message: Some("not found".into()),
            screenshot_path: Some("/tmp/shot.png".into()),
            mhtml_path: Some("/tmp/page.mhtml".into()),
        }))
        .await;

    let events = h.store.events_for_bot(h.bot.id).await;
    let fatal = events.last().unwrap();
    assert_eq!(fatal.event_type, BotEventType::FatalError);
    assert_eq!(
        fatal.event_sub_type,
        Some(BotEventSubType::FatalErrorUiElementNotFound)
    );
    assert_eq!(fatal.metadata["step"], "click_join_button");
    assert_eq!(
        fatal.debug_artifacts,
        vec!["/tmp/shot.png".to_string(), "/tmp/page.mhtml".to_string()]
    );
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::FatalError
    );
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::MeetingEnded))
        .await;
    let events_after_first = h.store.events_for_bot(h.bot.id).await.len();

    h.supervisor.cleanup().await;
    assert_eq!(h.store.events_for_bot(h.bot.id).await.len(), events_after_first);
}

#[tokio::test]
async fn pause_and_resume_guards_follow_state() {
    let mut h = harness("https://meet.google.com/abc-defg-hij", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();

    // Pause before recording starts is ignored.
    h.supervisor
        .handle_message(MainMessage::Command(BotCommand::PauseRecording))
        .await;
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::Joining
    );

    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::RecordingPermissionGranted))
        .await;

    // The screen recorder is not running in tests, so drop it before
    // pausing; the state machine path is what is under test.
    h.supervisor.screen_recorder = None;

    h.supervisor
        .handle_message(MainMessage::Command(BotCommand::PauseRecording))
        .await;
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::JoinedRecordingPaused
    );
    h.supervisor
        .handle_message(MainMessage::Command(BotCommand::ResumeRecording))
        .await;
    assert_eq!(
        h.store.bot(h.bot.id).await.unwrap().state,
        BotState::JoinedRecording
    );
}

#[tokio::test]
async fn audio_segments_become_utterances_with_durations() {
    let mut h = harness("https://zoom.us/j/123456789", |_| {}).await;
    h.store
        .create_event(h.bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
        .await
        .unwrap();
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::JoinedMeeting))
        .await;
    h.supervisor
        .handle_message(adapter_message(AdapterMessage::RecordingPermissionGranted))
        .await;

    // 6400 bytes at 32 kHz mono S16LE = 100 ms of audio.
    let segment = audio_input::FinishedSegment {
        participant_uuid: "p1".into(),
        timestamp_ms: 5000,
        pcm: vec![1u8; 6400],
    };
    h.supervisor.save_audio_utterance(segment).await;

    let recording = h.store.default_recording(h.bot.id).await.unwrap();
    let utterances = h.store.utterances_for_recording(recording.id).await;
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].duration_ms, 100);
    assert_eq!(utterances[0].sample_rate, Some(32000));
    assert_eq!(utterances[0].source, UtteranceSource::PerParticipantAudio);
    assert_eq!(utterances[0].timestamp_ms, 5000);
}
