//! The bot controller: one supervisor per meeting attendance attempt.
//!
//! The supervisor owns the bot for its whole lifetime. Everything runs
//! through a single main loop: adapter callbacks, Redis commands and the
//! RTMP failure path are all funneled in as typed [`MainMessage`]s, and a
//! 100 ms tick drives ingest, captions, auto-leave checks and playback
//! monitoring. All state-machine writes happen here, which is what makes
//! the bot single-writer by construction.

pub mod audio_input;
pub mod audio_output;
pub mod captions;
pub mod commands;
pub mod pipeline;
pub mod pipeline_config;
pub mod rtmp;
pub mod screen_recorder;
pub mod uploader;
pub mod ws_audio;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::adapters::{
    self, AdapterCallbacks, AdapterMessage, AudioChunk, CaptionUpsert, GoogleMeetAdapter,
    LeaveReason, MeetingAdapter, MeetingKind, PlatformLink, TeamsAdapter, ZoomAdapter,
};
use crate::media::audio;
use crate::models::*;
use crate::store::Store;
use crate::transcription::{
    self, BatchTranscriber, SpeechSynthesizer, StreamingTranscriber, TranscriberFactory,
};
use crate::webhooks::{payloads, WebhookDispatcher};

use audio_input::{ParticipantAudioBatcher, StreamingAudioIngest};
use audio_output::{AudioOutputManager, PlaybackOutcome};
use captions::ClosedCaptionManager;
use commands::BotCommand;
use pipeline::{MediaPipeline, OutputFormat, PipelineSettings, SinkType};
use pipeline_config::PipelineConfiguration;
use rtmp::RtmpClient;
use screen_recorder::ScreenAndAudioRecorder;
use uploader::Uploader;
use ws_audio::WebsocketAudioStreamer;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Pipeline stats are reported every this many ticks (15 s).
const STATS_TICK_DIVISOR: u64 = 150;

/// Cleanup must finish within this or the watchdog hard-kills the process.
const CLEANUP_WATCHDOG: Duration = Duration::from_secs(600);

/// Everything that can wake the main loop.
#[derive(Debug)]
pub enum MainMessage {
    Adapter(AdapterMessage),
    Command(BotCommand),
    RtmpConnectionFailed,
}

/// External collaborators handed to the supervisor at startup.
pub struct SupervisorDeps {
    pub platform_link: Arc<dyn PlatformLink>,
    pub transcriber_factory: Option<Arc<dyn TranscriberFactory>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub uploader: Arc<dyn Uploader>,
    pub webhooks: WebhookDispatcher,
}

pub struct Supervisor {
    store: Store,
    bot_id: BotId,
    redis_url: String,
    meeting_kind: MeetingKind,
    pipeline_config: PipelineConfiguration,
    transcription_provider: String,
    transcription_language: Option<String>,

    adapter: Arc<dyn MeetingAdapter>,
    media_pipeline: Option<Arc<MediaPipeline>>,
    rtmp_client: Option<Arc<RtmpClient>>,
    screen_recorder: Option<Arc<ScreenAndAudioRecorder>>,
    audio_output: AudioOutputManager,
    batcher: Option<ParticipantAudioBatcher>,
    streaming_ingest: Option<StreamingAudioIngest>,
    caption_manager: ClosedCaptionManager,
    captions_rx: std::sync::mpsc::Receiver<CaptionUpsert>,
    ws_audio_slot: Arc<std::sync::Mutex<Option<WebsocketAudioStreamer>>>,

    messages_tx: mpsc::UnboundedSender<MainMessage>,
    messages_rx: mpsc::UnboundedReceiver<MainMessage>,

    webhooks: WebhookDispatcher,
    uploader: Arc<dyn Uploader>,
    batch_transcriber: Option<Arc<dyn BatchTranscriber>>,

    recording_file: Option<PathBuf>,
    cleanup_called: bool,
    cleanup_done: Arc<AtomicBool>,
}

impl Supervisor {
    pub async fn new(
        store: Store,
        bot_id: BotId,
        redis_url: String,
        deps: SupervisorDeps,
    ) -> Result<Self> {
        let bot = store.bot(bot_id).await?;
        let recording = store.default_recording(bot_id).await?;
        let meeting_kind = adapters::meeting_kind_from_url(&bot.meeting_url)?;

        let mut pipeline_config = if bot.settings.rtmp.is_some() {
            PipelineConfiguration::rtmp_streamer()
        } else if recording.recording_type == RecordingType::NoRecording {
            PipelineConfiguration::transcription_only()
        } else if bot.settings.recording.audio_only {
            PipelineConfiguration::audio_recorder()
        } else {
            PipelineConfiguration::recorder()
        };
        if bot.settings.websocket.is_some() {
            pipeline_config = pipeline_config.with_websocket_audio();
        }

        let transcription_provider =
            transcription::provider_for(&bot.settings.transcription, &meeting_kind);
        let uses_captions = transcription::uses_platform_captions(&transcription_provider);

        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (captions_tx, captions_rx) = std::sync::mpsc::channel();
        let (chunks_tx, chunks_rx) = std::sync::mpsc::channel::<AudioChunk>();

        // Adapters speak `AdapterMessage`; the main loop speaks
        // `MainMessage`. Forward one into the other.
        let (adapter_messages_tx, mut adapter_messages_rx) =
            mpsc::unbounded_channel::<AdapterMessage>();
        {
            let messages_tx = messages_tx.clone();
            tokio::spawn(async move {
                while let Some(message) = adapter_messages_rx.recv().await {
                    if messages_tx.send(MainMessage::Adapter(message)).is_err() {
                        break;
                    }
                }
            });
        }

        let recording_file = pipeline_config
            .records_to_file()
            .then(|| PathBuf::from(format!("/tmp/{}.{}", recording.id, recording_extension(&bot, &recording))));

        // RTMP client before the pipeline: the appsink callback writes into
        // it.
        let rtmp_client = pipeline_config
            .streams_rtmp()
            .then(|| bot.rtmp_destination_url())
            .flatten()
            .map(|url| Arc::new(RtmpClient::new(url)));

        let ws_audio_slot: Arc<std::sync::Mutex<Option<WebsocketAudioStreamer>>> =
            Arc::new(std::sync::Mutex::new(None));

        let media_pipeline = if meeting_kind.uses_media_pipeline()
            && (pipeline_config.records_to_file() || pipeline_config.streams_rtmp())
        {
            let audio_caps = match meeting_kind {
                MeetingKind::Zoom { .. } => pipeline::AUDIO_FORMAT_PCM_S16_32K,
                _ => pipeline::AUDIO_FORMAT_F32_48K,
            };
            let (output_format, sink) = if pipeline_config.streams_rtmp() {
                let rtmp = rtmp_client
                    .clone()
                    .context("rtmp streaming configured without destination url")?;
                let messages = messages_tx.clone();
                let sink: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |data: &[u8]| {
                    if !rtmp.write_data(data) {
                        let _ = messages.send(MainMessage::RtmpConnectionFailed);
                    }
                });
                (OutputFormat::Flv, SinkType::AppSink(sink))
            } else {
                let format = match bot.recording_format() {
                    RecordingFormat::Mp4 => OutputFormat::Mp4,
                    RecordingFormat::Webm => OutputFormat::Webm,
                    RecordingFormat::Mp3 => OutputFormat::Mp3,
                };
                let file = recording_file
                    .clone()
                    .context("file recording configured without a path")?;
                (format, SinkType::File(file))
            };
            Some(Arc::new(MediaPipeline::new(PipelineSettings {
                video_frame_size: bot.settings.recording.resolution,
                audio_caps,
                output_format,
                sink,
            })))
        } else {
            None
        };

        let screen_recorder = if !meeting_kind.uses_media_pipeline()
            && pipeline_config.records_to_file()
        {
            recording_file.clone().map(|file| {
                Arc::new(ScreenAndAudioRecorder::new(
                    file,
                    bot.settings.recording.resolution,
                    bot.settings.recording.audio_only,
                ))
            })
        } else {
            None
        };

        let callbacks = {
            let mixed_audio = {
                let pipeline = media_pipeline.clone();
                let ws_slot = Arc::clone(&ws_audio_slot);
                let sink: Arc<dyn Fn(&[u8], Option<i64>) + Send + Sync> =
                    Arc::new(move |pcm: &[u8], timestamp_ns: Option<i64>| {
                        if let Some(pipeline) = &pipeline {
                            pipeline.on_mixed_audio_chunk(pcm.to_vec(), timestamp_ns);
                        }
                        if let Some(streamer) =
                            ws_slot.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
                        {
                            streamer.send_pcm(pcm.to_vec());
                        }
                    });
                Some(sink)
            };
            let video_frames = media_pipeline.clone().map(|pipeline| {
                let sink: Arc<dyn Fn(Vec<u8>, i64) + Send + Sync> =
                    Arc::new(move |frame, timestamp_ns| {
                        pipeline.on_new_video_frame(frame, timestamp_ns);
                    });
                sink
            });
            let wants_video_frames = media_pipeline.clone().map(|pipeline| {
                let probe: Arc<dyn Fn() -> bool + Send + Sync> =
                    Arc::new(move || pipeline.wants_any_video_frames());
                probe
            });
            AdapterCallbacks {
                messages: adapter_messages_tx.clone(),
                audio_chunks: (!uses_captions).then(|| chunks_tx.clone()),
                captions: uses_captions.then(move || captions_tx),
                mixed_audio,
                video_frames,
                wants_video_frames,
            }
        };

        let adapter: Arc<dyn MeetingAdapter> = match &meeting_kind {
            MeetingKind::Zoom { .. } => Arc::new(ZoomAdapter::new(
                meeting_kind.clone(),
                bot.name.clone(),
                Arc::clone(&deps.platform_link),
                callbacks,
                bot.settings.auto_leave.clone(),
            )),
            MeetingKind::GoogleMeet => Arc::new(GoogleMeetAdapter::new(
                bot.name.clone(),
                Arc::clone(&deps.platform_link),
                callbacks,
                bot.settings.auto_leave.clone(),
                bot.settings.platform["google_meet_closed_captions_language"]
                    .as_str()
                    .map(|s| s.to_string()),
            )),
            MeetingKind::Teams => Arc::new(TeamsAdapter::new(
                bot.name.clone(),
                Arc::clone(&deps.platform_link),
                callbacks,
                bot.settings.auto_leave.clone(),
            )),
        };

        let audio_output = {
            let adapter = Arc::clone(&adapter);
            let playback_rate = meeting_kind.playback_sample_rate();
            let play: Arc<dyn Fn(&[u8], u32) + Send + Sync> =
                Arc::new(move |pcm: &[u8], rate: u32| {
                    if let Err(e) = adapter.send_raw_audio(pcm, rate) {
                        tracing::info!("error sending raw audio to meeting: {e:#}");
                    }
                });
            AudioOutputManager::new(
                play,
                deps.synthesizer.clone(),
                playback_rate,
                meeting_kind.playback_chunk_interval(),
            )
        };

        let batch_transcriber = if uses_captions {
            None
        } else {
            deps.transcriber_factory
                .as_ref()
                .and_then(|factory| factory.batch(&transcription_provider).ok())
                .map(Arc::from)
        };

        let (batcher, streaming_ingest) = if uses_captions {
            (None, None)
        } else if recording.transcription_type == TranscriptionType::Realtime {
            let ingest = deps.transcriber_factory.as_ref().map(|factory| {
                let factory = Arc::clone(factory);
                let provider = transcription_provider.clone();
                let sample_rate = meeting_kind.per_participant_sample_rate();
                let language = bot.settings.transcription.language.clone();
                let model = bot.settings.transcription.model.clone();
                let callback_url = bot.settings.callback_url.clone();
                let bot_id_string = bot.id.to_string();
                let builder: Box<
                    dyn Fn(&str) -> Result<Box<dyn StreamingTranscriber>> + Send + Sync,
                > = Box::new(move |speaker: &str| {
                    factory.streaming(
                        &provider,
                        sample_rate,
                        language.as_deref(),
                        model.as_deref(),
                        callback_url.as_deref(),
                        vec![
                            ("bot_id".to_string(), bot_id_string.clone()),
                            ("speaker_uuid".to_string(), speaker.to_string()),
                        ],
                    )
                });
                StreamingAudioIngest::new(sample_rate, builder)
            });
            // Streaming mode still keeps the batcher so the recording gets
            // utterance rows with audio attached.
            (Some(ParticipantAudioBatcher::new(chunks_rx)), ingest)
        } else {
            (Some(ParticipantAudioBatcher::new(chunks_rx)), None)
        };

        Ok(Self {
            store,
            bot_id,
            redis_url,
            meeting_kind,
            pipeline_config,
            transcription_provider,
            transcription_language: bot.settings.transcription.language.clone(),
            adapter,
            media_pipeline,
            rtmp_client,
            screen_recorder,
            audio_output,
            batcher,
            streaming_ingest,
            caption_manager: ClosedCaptionManager::new(),
            captions_rx,
            ws_audio_slot,
            messages_tx,
            messages_rx,
            webhooks: deps.webhooks,
            uploader: deps.uploader,
            batch_transcriber,
            recording_file,
            cleanup_called: false,
            cleanup_done: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Drive the bot to a terminal state. Returns once cleanup completed.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            bot_id = %self.bot_id,
            config = ?self.pipeline_config,
            provider = %self.transcription_provider,
            "supervisor starting"
        );

        // Command channel first, so a `sync` published during startup is not
        // lost.
        tokio::spawn(commands::run_listener(
            self.redis_url.clone(),
            commands::channel_for_bot(self.bot_id),
            self.messages_tx.clone(),
        ));

        if let Some(rtmp) = &self.rtmp_client {
            rtmp.start()?;
        }
        if let Some(pipeline) = &self.media_pipeline {
            pipeline.setup()?;
        }
        if let Some(settings) = self.store.bot(self.bot_id).await?.settings.websocket.clone() {
            match WebsocketAudioStreamer::connect(
                &settings.audio_url,
                self.bot_id,
                self.meeting_kind.per_participant_sample_rate(),
            )
            .await
            {
                Ok(streamer) => {
                    *self
                        .ws_audio_slot
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(streamer);
                }
                Err(e) => tracing::warn!("websocket audio egress unavailable: {e:#}"),
            }
        }

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .context("failed to install SIGINT handler")?;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut first_tick = true;
        let mut tick_count: u64 = 0;

        while !self.cleanup_called {
            tokio::select! {
                Some(message) = self.messages_rx.recv() => {
                    self.handle_message(message).await;
                }
                _ = tick.tick() => {
                    if first_tick {
                        first_tick = false;
                        self.take_action_based_on_bot_state().await;
                    }
                    if let Err(e) = self.on_tick().await {
                        tracing::error!("error in supervisor tick: {e:#}");
                        self.cleanup().await;
                    }
                    tick_count += 1;
                    if tick_count % STATS_TICK_DIVISOR == 0 {
                        if let Some(pipeline) = &self.media_pipeline {
                            pipeline.report_queue_stats();
                        }
                    }
                }
                _ = sigterm.recv() => {
                    self.handle_termination_signal().await;
                }
                _ = sigint.recv() => {
                    self.handle_termination_signal().await;
                }
            }
        }
        Ok(())
    }

    async fn handle_termination_signal(&mut self) {
        tracing::info!("termination signal received");
        self.record_event(
            BotEventType::FatalError,
            Some(BotEventSubType::FatalErrorProcessTerminated),
            serde_json::json!({}),
        )
        .await;
        self.cleanup().await;
    }

    /// Sync with the store on the first tick and on `sync` commands: a bot
    /// freshly moved to JOINING (or LEAVING) needs the adapter driven.
    async fn take_action_based_on_bot_state(&mut self) {
        let Ok(bot) = self.store.bot(self.bot_id).await else {
            return;
        };
        match bot.state {
            BotState::Joining => {
                tracing::info!("bot is joining, initializing adapter");
                self.store.set_requested_bot_action_taken_at(self.bot_id).await;
                if let Err(e) = self.adapter.init() {
                    tracing::error!("adapter init failed: {e:#}");
                    self.record_event(BotEventType::FatalError, None, serde_json::json!({}))
                        .await;
                    self.cleanup().await;
                }
            }
            BotState::Leaving => {
                tracing::info!("bot is leaving, telling adapter to leave");
                self.store.set_requested_bot_action_taken_at(self.bot_id).await;
                self.adapter.leave();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Main-loop messages
    // ------------------------------------------------------------------

    pub(crate) async fn handle_message(&mut self, message: MainMessage) {
        match message {
            MainMessage::Adapter(message) => self.handle_adapter_message(message).await,
            MainMessage::Command(command) => self.handle_command(command).await,
            MainMessage::RtmpConnectionFailed => self.on_rtmp_connection_failed().await,
        }
    }

    async fn handle_adapter_message(&mut self, message: AdapterMessage) {
        match message {
            AdapterMessage::JoinedMeeting => {
                tracing::info!("bot joined meeting");
                self.record_event(BotEventType::BotJoinedMeeting, None, serde_json::json!({}))
                    .await;
            }
            AdapterMessage::RecordingPermissionGranted => {
                tracing::info!("recording permission granted");
                self.record_event(
                    BotEventType::BotRecordingPermissionGranted,
                    None,
                    serde_json::json!({}),
                )
                .await;
                if let Ok(recording) = self.store.default_recording(self.bot_id).await {
                    let _ = self
                        .store
                        .set_recording_state(recording.id, RecordingState::InProgress)
                        .await;
                }
            }
            AdapterMessage::PutInWaitingRoom => {
                self.record_event(BotEventType::BotPutInWaitingRoom, None, serde_json::json!({}))
                    .await;
            }
            AdapterMessage::MeetingEnded => {
                tracing::info!("meeting ended");
                self.flush_utterances().await;
                let state = self
                    .store
                    .bot(self.bot_id)
                    .await
                    .map(|bot| bot.state)
                    .unwrap_or(BotState::FatalError);
                if state == BotState::Leaving {
                    self.record_event(BotEventType::BotLeftMeeting, None, serde_json::json!({}))
                        .await;
                } else {
                    self.record_event(BotEventType::MeetingEnded, None, serde_json::json!({}))
                        .await;
                }
                self.cleanup().await;
            }
            AdapterMessage::RequestToJoinDenied => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingRequestToJoinDenied,
                    serde_json::json!({}),
                )
                .await;
            }
            AdapterMessage::MeetingNotFound => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingMeetingNotFound,
                    serde_json::json!({}),
                )
                .await;
            }
            AdapterMessage::LeaveMeetingWaitingForHost => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingNotStartedWaitingForHost,
                    serde_json::json!({}),
                )
                .await;
            }
            AdapterMessage::WaitingRoomTimedOut => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingWaitingRoomTimeoutExceeded,
                    serde_json::json!({}),
                )
                .await;
            }
            AdapterMessage::ZoomAuthorizationFailed { code } => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingZoomAuthorizationFailed,
                    serde_json::json!({"zoom_result_code": code.to_string()}),
                )
                .await;
            }
            AdapterMessage::ZoomSdkInternalError { code } => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingZoomSdkInternalError,
                    serde_json::json!({"zoom_result_code": code.to_string()}),
                )
                .await;
            }
            AdapterMessage::ZoomMeetingStatusFailed { code } => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingZoomMeetingStatusFailed,
                    serde_json::json!({"zoom_result_code": code.to_string()}),
                )
                .await;
            }
            AdapterMessage::ZoomMeetingStatusFailedUnableToJoinExternalMeeting { code } => {
                self.could_not_join(
                    BotEventSubType::CouldNotJoinMeetingUnpublishedZoomApp,
                    serde_json::json!({"zoom_result_code": code.to_string()}),
                )
                .await;
            }
            AdapterMessage::UiElementNotFound {
                step,
                exception_type,
                exception_message,
                screenshot_path,
                mhtml_path,
            } => {
                tracing::info!(%step, "UI element not found");
                let event = self
                    .record_event(
                        BotEventType::FatalError,
                        Some(BotEventSubType::FatalErrorUiElementNotFound),
                        serde_json::json!({
                            "step": step,
                            "exception_type": exception_type,
                            "exception_message": exception_message,
                        }),
                    )
                    .await;
                if let Some(event) = event {
                    for artifact in [screenshot_path, mhtml_path].into_iter().flatten() {
                        self.store
                            .attach_debug_artifact(self.bot_id, event.id, artifact)
                            .await;
                    }
                }
                self.cleanup().await;
            }
            AdapterMessage::RequestedLeave { reason } => {
                tracing::info!(?reason, "adapter requested leave");
                let sub_type = match reason {
                    LeaveReason::AutoLeaveSilence => {
                        BotEventSubType::LeaveRequestedAutoLeaveSilence
                    }
                    LeaveReason::AutoLeaveOnlyParticipantInMeeting => {
                        BotEventSubType::LeaveRequestedAutoLeaveOnlyParticipantInMeeting
                    }
                    LeaveReason::AutoLeaveMaxUptimeExceeded => {
                        BotEventSubType::LeaveRequestedAutoLeaveMaxUptimeExceeded
                    }
                };
                self.record_event(BotEventType::LeaveRequested, Some(sub_type), serde_json::json!({}))
                    .await;
                self.store.set_requested_bot_action_taken_at(self.bot_id).await;
                self.adapter.leave();
            }
            AdapterMessage::ReadyToShowBotImage => {
                self.take_action_based_on_image_media_requests().await;
            }
            AdapterMessage::ScreenRecordingShouldStart { display } => {
                if let Some(recorder) = &self.screen_recorder {
                    if let Err(e) = recorder.start_recording(&display) {
                        tracing::error!("failed to start screen recorder: {e:#}");
                        self.record_event(BotEventType::FatalError, None, serde_json::json!({}))
                            .await;
                        self.cleanup().await;
                    }
                }
            }
            AdapterMessage::ParticipantJoined {
                participant,
                timestamp_ms,
            } => {
                let row = self
                    .store
                    .get_or_create_participant(
                        self.bot_id,
                        &participant.uuid,
                        participant.user_uuid.clone(),
                        participant.full_name.clone(),
                        participant.is_the_bot,
                    )
                    .await;
                let event = ParticipantEvent {
                    id: uuid::Uuid::new_v4(),
                    participant_id: row.id,
                    kind: ParticipantEventKind::Join,
                    timestamp_ms,
                };
                self.store.insert_participant_event(event.clone()).await;
                if let Ok(bot) = self.store.bot(self.bot_id).await {
                    self.webhooks
                        .trigger(
                            &bot,
                            WebhookTrigger::ParticipantEventsJoinLeave,
                            payloads::participant_event_payload(&event, &row),
                        )
                        .await;
                }
            }
            AdapterMessage::ParticipantLeft {
                participant_uuid,
                timestamp_ms,
            } => {
                let row = self
                    .store
                    .get_or_create_participant(self.bot_id, &participant_uuid, None, None, false)
                    .await;
                let event = ParticipantEvent {
                    id: uuid::Uuid::new_v4(),
                    participant_id: row.id,
                    kind: ParticipantEventKind::Leave,
                    timestamp_ms,
                };
                self.store.insert_participant_event(event.clone()).await;
                if let Ok(bot) = self.store.bot(self.bot_id).await {
                    self.webhooks
                        .trigger(
                            &bot,
                            WebhookTrigger::ParticipantEventsJoinLeave,
                            payloads::participant_event_payload(&event, &row),
                        )
                        .await;
                }
            }
            AdapterMessage::ChatMessageReceived {
                participant_uuid,
                text,
                timestamp_ms,
                source_uuid,
            } => {
                let participant = match &participant_uuid {
                    Some(uuid) => Some(
                        self.store
                            .get_or_create_participant(self.bot_id, uuid, None, None, false)
                            .await,
                    ),
                    None => None,
                };
                let message = ChatMessage {
                    id: uuid::Uuid::new_v4(),
                    bot_id: self.bot_id,
                    participant_id: participant.as_ref().map(|p| p.id),
                    text,
                    timestamp_ms,
                    source_uuid,
                };
                self.store.insert_chat_message(message.clone()).await;
                if let Ok(bot) = self.store.bot(self.bot_id).await {
                    self.webhooks
                        .trigger(
                            &bot,
                            WebhookTrigger::ChatMessagesUpdate,
                            payloads::chat_message_payload(&message, participant.as_ref()),
                        )
                        .await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Sync => {
                tracing::info!("sync command received");
                self.take_action_based_on_bot_state().await;
            }
            BotCommand::SyncMediaRequests => {
                self.take_action_based_on_audio_media_requests().await;
                self.take_action_based_on_image_media_requests().await;
            }
            BotCommand::SyncChatMessageRequests => {
                self.take_action_based_on_chat_message_requests().await;
            }
            BotCommand::PauseRecording => {
                let can_pause = self
                    .store
                    .bot(self.bot_id)
                    .await
                    .map(|bot| bot.state.can_pause_recording())
                    .unwrap_or(false);
                if !can_pause {
                    tracing::info!("pause_recording ignored: bot not recording");
                    return;
                }
                if let Some(recorder) = &self.screen_recorder {
                    if let Err(e) = recorder.pause_recording() {
                        tracing::error!("failed to pause recording: {e:#}");
                        return;
                    }
                }
                self.record_event(BotEventType::RecordingPaused, None, serde_json::json!({}))
                    .await;
            }
            BotCommand::ResumeRecording => {
                let can_resume = self
                    .store
                    .bot(self.bot_id)
                    .await
                    .map(|bot| bot.state.can_resume_recording())
                    .unwrap_or(false);
                if !can_resume {
                    tracing::info!("resume_recording ignored: recording not paused");
                    return;
                }
                if let Some(recorder) = &self.screen_recorder {
                    if let Err(e) = recorder.resume_recording() {
                        tracing::error!("failed to resume recording: {e:#}");
                        return;
                    }
                }
                self.record_event(BotEventType::RecordingResumed, None, serde_json::json!({}))
                    .await;
            }
            BotCommand::AdmitFromWaitingRoom => {
                let can_admit = self
                    .store
                    .bot(self.bot_id)
                    .await
                    .map(|bot| bot.state.can_admit_from_waiting_room())
                    .unwrap_or(false);
                if !can_admit {
                    tracing::info!("admit_from_waiting_room ignored: bot not in meeting");
                    return;
                }
                if let Err(e) = self.adapter.admit_from_waiting_room() {
                    tracing::warn!("failed to admit from waiting room: {e:#}");
                }
            }
        }
    }

    async fn on_rtmp_connection_failed(&mut self) {
        tracing::info!("RTMP connection failed");
        let destination = self
            .store
            .bot(self.bot_id)
            .await
            .ok()
            .and_then(|bot| bot.rtmp_destination_url());
        self.record_event(
            BotEventType::FatalError,
            Some(BotEventSubType::FatalErrorRtmpConnectionFailed),
            serde_json::json!({"rtmp_destination_url": destination}),
        )
        .await;
        self.cleanup().await;
    }

    async fn could_not_join(&mut self, sub_type: BotEventSubType, metadata: serde_json::Value) {
        tracing::info!(?sub_type, "could not join meeting");
        self.record_event(BotEventType::CouldNotJoin, Some(sub_type), metadata)
            .await;
        self.cleanup().await;
    }

    /// Create an event, logging (not propagating) transition violations: a
    /// late or duplicate platform callback must not crash the bot.
    async fn record_event(
        &self,
        event_type: BotEventType,
        sub_type: Option<BotEventSubType>,
        metadata: serde_json::Value,
    ) -> Option<BotEvent> {
        match self
            .store
            .create_event(self.bot_id, event_type, sub_type, metadata)
            .await
        {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(?event_type, "event rejected: {e}");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic tick
    // ------------------------------------------------------------------

    async fn on_tick(&mut self) -> Result<()> {
        self.store.set_heartbeat(self.bot_id).await?;

        self.process_audio_segments(false).await;
        self.process_captions(false).await;
        self.adapter.check_auto_leave_conditions();

        if let Some(ingest) = &mut self.streaming_ingest {
            ingest.monitor(Instant::now());
        }

        match self.audio_output.monitor() {
            Some(PlaybackOutcome::Finished(request_id)) => {
                tracing::info!(%request_id, "audio media request finished");
                let _ = self
                    .store
                    .set_media_request_state(request_id, MediaRequestState::Finished)
                    .await;
                self.take_action_based_on_audio_media_requests().await;
            }
            Some(PlaybackOutcome::FailedToPlay(request_id)) => {
                tracing::info!(%request_id, "audio media request failed to play");
                let _ = self
                    .store
                    .set_media_request_state(request_id, MediaRequestState::FailedToPlay)
                    .await;
                self.take_action_based_on_audio_media_requests().await;
            }
            None => {}
        }

        Ok(())
    }

    async fn process_audio_segments(&mut self, flush: bool) {
        let finished = match &mut self.batcher {
            Some(batcher) => {
                if flush {
                    batcher.flush()
                } else {
                    batcher.process_chunks(Instant::now())
                }
            }
            None => Vec::new(),
        };
        for segment in finished {
            self.save_audio_utterance(segment).await;
        }
    }

    async fn save_audio_utterance(&self, segment: audio_input::FinishedSegment) {
        let Ok(recording) = self.store.recording_in_progress(self.bot_id).await else {
            tracing::info!("dropping utterance: no recording in progress");
            return;
        };

        let info = self.adapter.get_participant(&segment.participant_uuid);
        let participant = self
            .store
            .get_or_create_participant(
                self.bot_id,
                &segment.participant_uuid,
                info.as_ref().and_then(|i| i.user_uuid.clone()),
                info.as_ref().and_then(|i| i.full_name.clone()),
                info.as_ref().map(|i| i.is_the_bot).unwrap_or(false),
            )
            .await;

        let sample_rate = self.meeting_kind.per_participant_sample_rate();
        let duration_ms = audio::pcm_duration_ms(segment.pcm.len(), sample_rate);
        let utterance_id = self
            .store
            .insert_audio_utterance(Utterance {
                id: uuid::Uuid::new_v4(),
                recording_id: recording.id,
                participant_id: participant.id,
                source: UtteranceSource::PerParticipantAudio,
                audio_blob: Some(segment.pcm),
                audio_format: Some(AudioFormat::Pcm),
                sample_rate: Some(sample_rate),
                timestamp_ms: segment.timestamp_ms,
                duration_ms,
                transcription: None,
                failure_data: None,
                source_uuid: None,
            })
            .await;

        if let Some(transcriber) = &self.batch_transcriber {
            let store = self.store.clone();
            let transcriber = Arc::clone(transcriber);
            let webhooks = self.webhooks.clone();
            let language = self.transcription_language.clone();
            let bot_id = self.bot_id;
            tokio::spawn(async move {
                transcription::worker::process_utterance(
                    store.clone(),
                    transcriber,
                    utterance_id,
                    language,
                )
                .await;
                let Some(utterance) = store.utterance(utterance_id).await else {
                    return;
                };
                if utterance.transcription.is_none() {
                    return;
                }
                if let Ok(bot) = store.bot(bot_id).await {
                    webhooks
                        .trigger(
                            &bot,
                            WebhookTrigger::TranscriptUpdate,
                            payloads::utterance_payload(&utterance, &participant),
                        )
                        .await;
                }
            });
        }
    }

    async fn process_captions(&mut self, flush: bool) {
        let now = Instant::now();
        while let Ok(caption) = self.captions_rx.try_recv() {
            self.caption_manager.upsert_caption(caption, now);
        }
        let ready = self.caption_manager.take_ready(flush, now);
        for caption in ready {
            self.save_caption_utterance(caption).await;
        }
    }

    async fn save_caption_utterance(&self, caption: captions::ReadyCaption) {
        // Unknown devices are skipped; the platform will re-deliver captions
        // once the roster catches up.
        let Some(info) = self.adapter.get_participant(&caption.device_id) else {
            tracing::info!(device_id = %caption.device_id, "skipping caption for unknown participant");
            return;
        };
        let Ok(recording) = self.store.recording_in_progress(self.bot_id).await else {
            return;
        };

        let participant = self
            .store
            .get_or_create_participant(
                self.bot_id,
                &info.uuid,
                info.user_uuid.clone(),
                info.full_name.clone(),
                info.is_the_bot,
            )
            .await;

        let source_uuid = format!(
            "{}-{}-{}",
            recording.id, caption.device_id, caption.caption_id
        );
        let utterance_id = self
            .store
            .upsert_caption_utterance(
                recording.id,
                participant.id,
                source_uuid,
                Transcription {
                    transcript: caption.text,
                    words: None,
                },
                caption.timestamp_ms,
                caption.duration_ms,
            )
            .await;
        self.store
            .set_recording_transcription_state(recording.id, TranscriptionState::InProgress)
            .await;

        if let (Some(utterance), Ok(bot)) = (
            self.store.utterance(utterance_id).await,
            self.store.bot(self.bot_id).await,
        ) {
            self.webhooks
                .trigger(
                    &bot,
                    WebhookTrigger::TranscriptUpdate,
                    payloads::utterance_payload(&utterance, &participant),
                )
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Media requests
    // ------------------------------------------------------------------

    async fn take_action_based_on_audio_media_requests(&mut self) {
        let Some(request) = self
            .store
            .oldest_enqueued_media_request(self.bot_id, MediaRequestKind::Audio)
            .await
        else {
            return;
        };
        if let Some(playing) = self
            .store
            .currently_playing_media_request(self.bot_id, MediaRequestKind::Audio)
            .await
        {
            tracing::info!(playing = %playing.id, "audio media request already playing");
            return;
        }

        if self
            .store
            .set_media_request_state(request.id, MediaRequestState::Playing)
            .await
            .is_ok()
        {
            self.audio_output.start_playing(&request);
        }
    }

    /// Image coalescing: only the newest enqueued image plays; the rest are
    /// dropped.
    async fn take_action_based_on_image_media_requests(&mut self) {
        let enqueued = self
            .store
            .enqueued_media_requests(self.bot_id, MediaRequestKind::Image)
            .await;
        let Some(most_recent) = enqueued.last().cloned() else {
            return;
        };

        let outcome = match &most_recent.media_blob {
            Some(blob) => {
                let _ = self
                    .store
                    .set_media_request_state(most_recent.id, MediaRequestState::Playing)
                    .await;
                match self.adapter.send_raw_image(blob) {
                    Ok(()) => MediaRequestState::Finished,
                    Err(e) => {
                        tracing::info!("error sending raw image: {e:#}");
                        MediaRequestState::FailedToPlay
                    }
                }
            }
            None => MediaRequestState::FailedToPlay,
        };
        let _ = self
            .store
            .set_media_request_state(most_recent.id, outcome)
            .await;

        for request in enqueued.iter().filter(|r| r.id != most_recent.id) {
            let _ = self
                .store
                .set_media_request_state(request.id, MediaRequestState::Dropped)
                .await;
        }
    }

    async fn take_action_based_on_chat_message_requests(&mut self) {
        for request in self.store.enqueued_chat_message_requests(self.bot_id).await {
            let state = match self
                .adapter
                .send_chat_message(&request.text, request.to_participant_uuid.as_deref())
            {
                Ok(()) => ChatMessageRequestState::Sent,
                Err(e) => {
                    tracing::info!("failed to send chat message: {e:#}");
                    ChatMessageRequestState::Failed
                }
            };
            self.store
                .set_chat_message_request_state(request.id, state)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    async fn flush_utterances(&mut self) {
        tracing::info!("flushing utterances and captions");
        self.process_audio_segments(true).await;
        self.process_captions(true).await;
        if let Some(ingest) = &mut self.streaming_ingest {
            ingest.finish_all();
        }
    }

    fn first_buffer_timestamp_ms(&self) -> Option<i64> {
        if self.screen_recorder.is_some() {
            return self.adapter.get_first_buffer_timestamp_ms();
        }
        self.media_pipeline.as_ref().and_then(|pipeline| {
            pipeline
                .start_time_ns()
                .map(|ns| ns / 1_000_000 + self.adapter.get_first_buffer_timestamp_ms_offset())
        })
    }

    /// Idempotent teardown: stop media, leave the meeting, persist the
    /// recording, and close out post-processing. A detached watchdog
    /// hard-kills the process if this hangs.
    pub(crate) async fn cleanup(&mut self) {
        if self.cleanup_called {
            tracing::info!("cleanup already called");
            return;
        }
        self.cleanup_called = true;

        let done = Arc::clone(&self.cleanup_done);
        std::thread::spawn(move || {
            std::thread::sleep(CLEANUP_WATCHDOG);
            if done.load(Ordering::SeqCst) {
                return;
            }
            tracing::error!("cleanup watchdog expired, hard-killing worker");
            std::process::abort();
        });

        if let Some(pipeline) = &self.media_pipeline {
            tracing::info!("stopping media pipeline");
            let pipeline = Arc::clone(pipeline);
            let _ = tokio::task::spawn_blocking(move || pipeline.cleanup()).await;
        }
        if let Some(rtmp) = &self.rtmp_client {
            tracing::info!("stopping RTMP client");
            rtmp.stop();
        }

        tracing::info!("telling adapter to leave and release the platform");
        self.adapter.leave();
        self.adapter.cleanup();

        self.audio_output.stop();
        self.flush_utterances().await;

        if let Some(recorder) = &self.screen_recorder {
            tracing::info!("stopping screen recorder");
            recorder.stop_recording();
            if let Err(e) = recorder.cleanup() {
                tracing::warn!("screen recorder cleanup failed: {e:#}");
            }
        }

        let streamer = self
            .ws_audio_slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(streamer) = streamer {
            streamer.close().await;
        }

        self.persist_recording().await;
        self.save_debug_recording().await;

        let state = self.store.bot(self.bot_id).await.map(|bot| bot.state);
        if matches!(state, Ok(BotState::PostProcessing)) {
            self.record_event(
                BotEventType::PostProcessingCompleted,
                None,
                serde_json::json!({}),
            )
            .await;
        }

        self.cleanup_done.store(true, Ordering::SeqCst);
        tracing::info!("cleanup complete");
    }

    /// Attach the bridge's debug screen recording to the latest event.
    async fn save_debug_recording(&self) {
        let wants_debug = self
            .store
            .bot(self.bot_id)
            .await
            .map(|bot| bot.create_debug_recording())
            .unwrap_or(false);
        if !wants_debug {
            return;
        }
        let path = std::path::Path::new(adapters::DEBUG_RECORDING_PATH);
        if !path.exists() {
            tracing::info!(path = %path.display(), "no debug recording to attach");
            return;
        }
        if let Some(event) = self.store.last_event_for_bot(self.bot_id).await {
            self.store
                .attach_debug_artifact(self.bot_id, event.id, path.display().to_string())
                .await;
            tracing::info!("attached debug recording to last event");
        }
    }

    async fn persist_recording(&self) {
        let Some(file) = &self.recording_file else {
            return;
        };
        if !file.exists() {
            tracing::info!(path = %file.display(), "no recording file produced");
            return;
        }
        let Ok(recording) = self.store.default_recording(self.bot_id).await else {
            return;
        };

        let key = file
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("{}.bin", recording.id));

        tracing::info!(%key, "uploading recording");
        let uploader = Arc::clone(&self.uploader);
        let path = file.clone();
        let upload_key = key.clone();
        let stored = tokio::task::spawn_blocking(move || {
            uploader.upload_file(&path, &upload_key);
            let stored = uploader.wait_for_upload();
            if stored.is_ok() {
                uploader.delete_file(&path);
            }
            stored
        })
        .await;

        match stored {
            Ok(Ok(storage_key)) => {
                self.store
                    .set_recording_file(
                        recording.id,
                        storage_key,
                        self.first_buffer_timestamp_ms(),
                    )
                    .await;
                let _ = self
                    .store
                    .set_recording_state(recording.id, RecordingState::Complete)
                    .await;
                transcription::worker::maybe_complete_transcription(&self.store, recording.id)
                    .await;
            }
            Ok(Err(e)) => {
                tracing::error!("recording upload failed: {e:#}");
                let _ = self
                    .store
                    .set_recording_state(recording.id, RecordingState::Failed)
                    .await;
            }
            Err(e) => {
                tracing::error!("recording upload task panicked: {e}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_pipeline_config(&self) -> PipelineConfiguration {
        self.pipeline_config
    }

    #[cfg(test)]
    pub(crate) fn test_provider(&self) -> &str {
        &self.transcription_provider
    }
}

fn recording_extension(bot: &Bot, recording: &Recording) -> &'static str {
    if recording.recording_type == RecordingType::AudioOnly {
        "mp3"
    } else {
        bot.recording_format().extension()
    }
}

#[cfg(test)]
mod tests;
