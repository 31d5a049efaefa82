//! In-process repository for the bot fleet's data model.
//!
//! The supervisor is the single writer for everything a bot owns; state
//! transitions additionally serialize through a per-bot write lock so that
//! concurrent callers (scheduler, command listener) cannot interleave event
//! writes for the same bot. Every created [`BotEvent`] is also published on a
//! broadcast channel, which is how the webhook dispatcher observes state
//! changes without the store knowing about HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::models::*;

/// Billing rate: 100 centicredits (one credit) per recorded hour.
const CENTICREDITS_PER_HOUR: i64 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bot {0} not found")]
    BotNotFound(BotId),
    #[error("recording not found for bot {0}")]
    RecordingNotFound(BotId),
    #[error("recording {0} not found")]
    RecordingRowNotFound(RecordingId),
    #[error("no recording in progress for bot {0}")]
    NoRecordingInProgress(BotId),
    #[error("media request {0} not found")]
    MediaRequestNotFound(MediaRequestId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("deduplication key {0:?} already in use by a non-terminal bot")]
    DeduplicationKeyInUse(String),
    #[error("bot {bot_id} is in state {state:?}, expected {expected}")]
    WrongState {
        bot_id: BotId,
        state: BotState,
        expected: &'static str,
    },
}

/// Parameters for creating a bot (what the REST layer would validate and
/// hand over).
#[derive(Debug, Clone)]
pub struct NewBot {
    pub project_id: ProjectId,
    pub meeting_url: String,
    pub name: String,
    pub settings: BotSettings,
    pub join_at: Option<chrono::DateTime<chrono::Utc>>,
    pub deduplication_key: Option<String>,
    pub metadata: Value,
}

struct Inner {
    bots: RwLock<HashMap<BotId, Bot>>,
    projects: RwLock<HashMap<ProjectId, Project>>,
    organizations: RwLock<HashMap<OrganizationId, Organization>>,
    events: RwLock<HashMap<BotId, Vec<BotEvent>>>,
    recordings: RwLock<HashMap<RecordingId, Recording>>,
    utterances: RwLock<HashMap<UtteranceId, Utterance>>,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
    participant_events: RwLock<Vec<ParticipantEvent>>,
    chat_messages: RwLock<Vec<ChatMessage>>,
    media_requests: RwLock<HashMap<MediaRequestId, MediaRequest>>,
    chat_message_requests: RwLock<HashMap<uuid::Uuid, ChatMessageRequest>>,
    webhook_subscriptions: RwLock<HashMap<uuid::Uuid, WebhookSubscription>>,
    webhook_secrets: RwLock<Vec<WebhookSecret>>,
    webhook_attempts: RwLock<HashMap<uuid::Uuid, WebhookDeliveryAttempt>>,
    credit_transactions: RwLock<Vec<CreditTransaction>>,
    /// Per-bot serialization of event writes (the "row lock").
    bot_write_locks: Mutex<HashMap<BotId, Arc<Mutex<()>>>>,
    event_seq: AtomicU64,
    events_tx: broadcast::Sender<BotEvent>,
    charge_credits_enabled: bool,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn new(charge_credits_enabled: bool) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                bots: RwLock::new(HashMap::new()),
                projects: RwLock::new(HashMap::new()),
                organizations: RwLock::new(HashMap::new()),
                events: RwLock::new(HashMap::new()),
                recordings: RwLock::new(HashMap::new()),
                utterances: RwLock::new(HashMap::new()),
                participants: RwLock::new(HashMap::new()),
                participant_events: RwLock::new(Vec::new()),
                chat_messages: RwLock::new(Vec::new()),
                media_requests: RwLock::new(HashMap::new()),
                chat_message_requests: RwLock::new(HashMap::new()),
                webhook_subscriptions: RwLock::new(HashMap::new()),
                webhook_secrets: RwLock::new(Vec::new()),
                webhook_attempts: RwLock::new(HashMap::new()),
                credit_transactions: RwLock::new(Vec::new()),
                bot_write_locks: Mutex::new(HashMap::new()),
                event_seq: AtomicU64::new(1),
                events_tx,
                charge_credits_enabled,
            }),
        }
    }

    /// Subscribe to every event created through [`Store::create_event`].
    pub fn subscribe_events(&self) -> broadcast::Receiver<BotEvent> {
        self.inner.events_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Projects & organizations
    // ------------------------------------------------------------------

    pub async fn insert_organization(&self, org: Organization) {
        self.inner.organizations.write().await.insert(org.id, org);
    }

    pub async fn insert_project(&self, project: Project) {
        self.inner.projects.write().await.insert(project.id, project);
    }

    pub async fn project(&self, id: ProjectId) -> Option<Project> {
        self.inner.projects.read().await.get(&id).cloned()
    }

    pub async fn organization(&self, id: OrganizationId) -> Option<Organization> {
        self.inner.organizations.read().await.get(&id).cloned()
    }

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    /// Create a bot and its default recording. The deduplication key must be
    /// unique among non-terminal bots; the initial state is `scheduled` when
    /// a join time is set, otherwise `ready`.
    pub async fn create_bot(&self, new: NewBot) -> Result<Bot, StoreError> {
        let mut bots = self.inner.bots.write().await;

        if let Some(key) = &new.deduplication_key {
            let clash = bots
                .values()
                .any(|b| !b.state.is_terminal() && b.deduplication_key.as_deref() == Some(key));
            if clash {
                return Err(StoreError::DeduplicationKeyInUse(key.clone()));
            }
        }

        let state = if new.join_at.is_some() {
            BotState::Scheduled
        } else {
            BotState::Ready
        };

        let bot = Bot {
            id: uuid::Uuid::new_v4(),
            project_id: new.project_id,
            meeting_url: new.meeting_url,
            name: new.name,
            settings: new.settings,
            join_at: new.join_at,
            deduplication_key: new.deduplication_key,
            metadata: new.metadata,
            state,
            last_heartbeat_at: None,
            created_at: Utc::now(),
        };

        let audio_only = bot.settings.recording.audio_only;
        let recording = Recording {
            id: uuid::Uuid::new_v4(),
            bot_id: bot.id,
            is_default: true,
            recording_type: if bot.settings.rtmp.is_some() {
                RecordingType::NoRecording
            } else if audio_only {
                RecordingType::AudioOnly
            } else {
                RecordingType::AudioAndVideo
            },
            transcription_type: TranscriptionType::NonRealtime,
            transcription_provider: bot.settings.transcription.provider.clone(),
            state: RecordingState::NotStarted,
            transcription_state: TranscriptionState::NotStarted,
            storage_key: None,
            first_buffer_timestamp_ms: None,
            created_at: Utc::now(),
        };

        self.inner
            .recordings
            .write()
            .await
            .insert(recording.id, recording);
        bots.insert(bot.id, bot.clone());
        Ok(bot)
    }

    pub async fn bot(&self, id: BotId) -> Result<Bot, StoreError> {
        self.inner
            .bots
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::BotNotFound(id))
    }

    /// Update meeting url / join time / settings of a scheduled bot.
    pub async fn patch_scheduled_bot(
        &self,
        id: BotId,
        meeting_url: Option<String>,
        join_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Bot, StoreError> {
        let mut bots = self.inner.bots.write().await;
        let bot = bots.get_mut(&id).ok_or(StoreError::BotNotFound(id))?;
        if bot.state != BotState::Scheduled {
            return Err(StoreError::WrongState {
                bot_id: id,
                state: bot.state,
                expected: "scheduled",
            });
        }
        if let Some(url) = meeting_url {
            bot.meeting_url = url;
        }
        if let Some(at) = join_at {
            bot.join_at = Some(at);
        }
        Ok(bot.clone())
    }

    /// Heartbeat is written at most once a minute.
    pub async fn set_heartbeat(&self, id: BotId) -> Result<(), StoreError> {
        let mut bots = self.inner.bots.write().await;
        let bot = bots.get_mut(&id).ok_or(StoreError::BotNotFound(id))?;
        let now = Utc::now();
        let stale = match bot.last_heartbeat_at {
            None => true,
            Some(last) => now.signed_duration_since(last).num_seconds() >= 60,
        };
        if stale {
            bot.last_heartbeat_at = Some(now);
        }
        Ok(())
    }

    pub async fn scheduled_bots_due(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<Bot> {
        self.inner
            .bots
            .read()
            .await
            .values()
            .filter(|b| b.state == BotState::Scheduled && b.join_at.is_some_and(|at| at <= now))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Event store
    // ------------------------------------------------------------------

    async fn bot_write_lock(&self, id: BotId) -> Arc<Mutex<()>> {
        self.inner
            .bot_write_locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Validate and apply a state transition, appending the audit event.
    ///
    /// Fails with `InvalidTransition` (no mutation) when the transition table
    /// has no entry; otherwise atomically writes the event with the old and
    /// new state and updates the bot. The first transition into a terminal
    /// state also appends the credit charge.
    pub async fn create_event(
        &self,
        bot_id: BotId,
        event_type: BotEventType,
        event_sub_type: Option<BotEventSubType>,
        metadata: Value,
    ) -> Result<BotEvent, StoreError> {
        let row_lock = self.bot_write_lock(bot_id).await;
        let _guard = row_lock.lock().await;

        let old_state = self.bot(bot_id).await?.state;
        let new_state = transition(old_state, event_type, event_sub_type)?;

        let event = BotEvent {
            id: self.inner.event_seq.fetch_add(1, Ordering::SeqCst),
            bot_id,
            event_type,
            event_sub_type,
            old_state,
            new_state,
            metadata,
            created_at: Utc::now(),
            requested_bot_action_taken_at: None,
            debug_artifacts: Vec::new(),
        };

        {
            let mut bots = self.inner.bots.write().await;
            let bot = bots.get_mut(&bot_id).ok_or(StoreError::BotNotFound(bot_id))?;
            bot.state = new_state;
        }
        self.inner
            .events
            .write()
            .await
            .entry(bot_id)
            .or_default()
            .push(event.clone());

        if new_state.is_terminal() && !old_state.is_terminal() {
            self.charge_credits_for_bot(bot_id).await?;
        }

        let _ = self.inner.events_tx.send(event.clone());
        Ok(event)
    }

    pub async fn events_for_bot(&self, bot_id: BotId) -> Vec<BotEvent> {
        self.inner
            .events
            .read()
            .await
            .get(&bot_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn last_event_for_bot(&self, bot_id: BotId) -> Option<BotEvent> {
        self.inner
            .events
            .read()
            .await
            .get(&bot_id)
            .and_then(|events| events.last().cloned())
    }

    /// Stamp the latest requested-action event once the supervisor acted on
    /// it (told the adapter to join or leave).
    pub async fn set_requested_bot_action_taken_at(&self, bot_id: BotId) {
        if let Some(events) = self.inner.events.write().await.get_mut(&bot_id) {
            if let Some(event) = events.last_mut() {
                if event.requested_bot_action_taken_at.is_none() {
                    event.requested_bot_action_taken_at = Some(Utc::now());
                }
            }
        }
    }

    /// Attach a debug artifact storage key to a specific event.
    pub async fn attach_debug_artifact(&self, bot_id: BotId, event_id: u64, key: String) {
        if let Some(events) = self.inner.events.write().await.get_mut(&bot_id) {
            if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
                event.debug_artifacts.push(key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    async fn charge_credits_for_bot(&self, bot_id: BotId) -> Result<(), StoreError> {
        if !self.inner.charge_credits_enabled {
            return Ok(());
        }

        let bot = self.bot(bot_id).await?;
        let Some(project) = self.project(bot.project_id).await else {
            tracing::warn!(%bot_id, "no project for bot; skipping credit charge");
            return Ok(());
        };

        let recorded_ms = self
            .default_recording(bot_id)
            .await
            .ok()
            .and_then(|r| r.first_buffer_timestamp_ms)
            .map(|first| (Utc::now().timestamp_millis() - first).max(0))
            .unwrap_or(0);
        let centicredits = centicredits_for_duration_ms(recorded_ms);

        let tx = CreditTransaction {
            id: uuid::Uuid::new_v4(),
            organization_id: project.organization_id,
            bot_id: Some(bot_id),
            centicredits_delta: -centicredits,
            description: format!("meeting bot {bot_id}"),
            created_at: Utc::now(),
        };
        {
            let mut orgs = self.inner.organizations.write().await;
            if let Some(org) = orgs.get_mut(&project.organization_id) {
                org.centicredits_balance += tx.centicredits_delta;
            }
        }
        self.inner.credit_transactions.write().await.push(tx);
        Ok(())
    }

    pub async fn credit_transactions_for_organization(
        &self,
        org_id: OrganizationId,
    ) -> Vec<CreditTransaction> {
        self.inner
            .credit_transactions
            .read()
            .await
            .iter()
            .filter(|tx| tx.organization_id == org_id)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Recordings & utterances
    // ------------------------------------------------------------------

    pub async fn default_recording(&self, bot_id: BotId) -> Result<Recording, StoreError> {
        self.inner
            .recordings
            .read()
            .await
            .values()
            .find(|r| r.bot_id == bot_id && r.is_default)
            .cloned()
            .ok_or(StoreError::RecordingNotFound(bot_id))
    }

    pub async fn recording_by_id(&self, id: RecordingId) -> Result<Recording, StoreError> {
        self.inner
            .recordings
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordingRowNotFound(id))
    }

    pub async fn recording_in_progress(&self, bot_id: BotId) -> Result<Recording, StoreError> {
        self.inner
            .recordings
            .read()
            .await
            .values()
            .find(|r| r.bot_id == bot_id && r.state == RecordingState::InProgress)
            .cloned()
            .ok_or(StoreError::NoRecordingInProgress(bot_id))
    }

    pub async fn set_recording_state(
        &self,
        recording_id: RecordingId,
        state: RecordingState,
    ) -> Result<(), StoreError> {
        let mut recordings = self.inner.recordings.write().await;
        if let Some(recording) = recordings.get_mut(&recording_id) {
            recording.state = state;
        }
        Ok(())
    }

    pub async fn set_recording_transcription_state(
        &self,
        recording_id: RecordingId,
        state: TranscriptionState,
    ) {
        let mut recordings = self.inner.recordings.write().await;
        if let Some(recording) = recordings.get_mut(&recording_id) {
            recording.transcription_state = state;
        }
    }

    /// Record the uploaded file's storage key and first-buffer timestamp.
    pub async fn set_recording_file(
        &self,
        recording_id: RecordingId,
        storage_key: String,
        first_buffer_timestamp_ms: Option<i64>,
    ) {
        let mut recordings = self.inner.recordings.write().await;
        if let Some(recording) = recordings.get_mut(&recording_id) {
            recording.storage_key = Some(storage_key);
            if recording.first_buffer_timestamp_ms.is_none() {
                recording.first_buffer_timestamp_ms = first_buffer_timestamp_ms;
            }
        }
    }

    pub async fn set_recording_first_buffer_timestamp_ms(
        &self,
        recording_id: RecordingId,
        timestamp_ms: i64,
    ) {
        let mut recordings = self.inner.recordings.write().await;
        if let Some(recording) = recordings.get_mut(&recording_id) {
            if recording.first_buffer_timestamp_ms.is_none() {
                recording.first_buffer_timestamp_ms = Some(timestamp_ms);
            }
        }
    }

    pub async fn get_or_create_participant(
        &self,
        bot_id: BotId,
        uuid_str: &str,
        user_uuid: Option<String>,
        full_name: Option<String>,
        is_the_bot: bool,
    ) -> Participant {
        let mut participants = self.inner.participants.write().await;
        if let Some(existing) = participants
            .values()
            .find(|p| p.bot_id == bot_id && p.uuid == uuid_str)
        {
            return existing.clone();
        }
        let participant = Participant {
            id: uuid::Uuid::new_v4(),
            bot_id,
            uuid: uuid_str.to_string(),
            user_uuid,
            full_name,
            is_the_bot,
        };
        participants.insert(participant.id, participant.clone());
        participant
    }

    pub async fn insert_participant_event(&self, event: ParticipantEvent) {
        self.inner.participant_events.write().await.push(event);
    }

    pub async fn participant_events_for_bot(&self, bot_id: BotId) -> Vec<ParticipantEvent> {
        let participants = self.inner.participants.read().await;
        let ids: Vec<ParticipantId> = participants
            .values()
            .filter(|p| p.bot_id == bot_id)
            .map(|p| p.id)
            .collect();
        self.inner
            .participant_events
            .read()
            .await
            .iter()
            .filter(|e| ids.contains(&e.participant_id))
            .cloned()
            .collect()
    }

    pub async fn insert_chat_message(&self, message: ChatMessage) {
        let mut messages = self.inner.chat_messages.write().await;
        // Dedup on the platform message id when present.
        if let Some(source) = &message.source_uuid {
            if messages
                .iter()
                .any(|m| m.bot_id == message.bot_id && m.source_uuid.as_deref() == Some(source))
            {
                return;
            }
        }
        messages.push(message);
    }

    pub async fn chat_messages_for_bot(&self, bot_id: BotId) -> Vec<ChatMessage> {
        self.inner
            .chat_messages
            .read()
            .await
            .iter()
            .filter(|m| m.bot_id == bot_id)
            .cloned()
            .collect()
    }

    /// Insert a per-participant audio utterance (always a new row).
    pub async fn insert_audio_utterance(&self, utterance: Utterance) -> UtteranceId {
        let id = utterance.id;
        self.inner.utterances.write().await.insert(id, utterance);
        id
    }

    /// Upsert a closed-caption utterance keyed on (recording, source_uuid).
    /// Repeated upserts for the same caption update the existing row.
    pub async fn upsert_caption_utterance(
        &self,
        recording_id: RecordingId,
        participant_id: ParticipantId,
        source_uuid: String,
        transcription: Transcription,
        timestamp_ms: i64,
        duration_ms: i64,
    ) -> UtteranceId {
        let mut utterances = self.inner.utterances.write().await;
        if let Some(existing) = utterances.values_mut().find(|u| {
            u.recording_id == recording_id && u.source_uuid.as_deref() == Some(&source_uuid)
        }) {
            existing.transcription = Some(transcription);
            existing.duration_ms = duration_ms;
            return existing.id;
        }
        let utterance = Utterance {
            id: uuid::Uuid::new_v4(),
            recording_id,
            participant_id,
            source: UtteranceSource::ClosedCaptionFromPlatform,
            audio_blob: None,
            audio_format: None,
            sample_rate: None,
            timestamp_ms,
            duration_ms,
            transcription: Some(transcription),
            failure_data: None,
            source_uuid: Some(source_uuid),
        };
        let id = utterance.id;
        utterances.insert(id, utterance);
        id
    }

    pub async fn utterance(&self, id: UtteranceId) -> Option<Utterance> {
        self.inner.utterances.read().await.get(&id).cloned()
    }

    pub async fn utterances_for_recording(&self, recording_id: RecordingId) -> Vec<Utterance> {
        let mut utterances: Vec<Utterance> = self
            .inner
            .utterances
            .read()
            .await
            .values()
            .filter(|u| u.recording_id == recording_id)
            .cloned()
            .collect();
        utterances.sort_by_key(|u| u.timestamp_ms);
        utterances
    }

    pub async fn set_utterance_transcription(
        &self,
        id: UtteranceId,
        transcription: Transcription,
    ) {
        let mut utterances = self.inner.utterances.write().await;
        if let Some(utterance) = utterances.get_mut(&id) {
            utterance.transcription = Some(transcription);
            utterance.failure_data = None;
            // The blob is only needed for transcription; drop it once done.
            utterance.audio_blob = None;
        }
    }

    pub async fn set_utterance_failure(&self, id: UtteranceId, failure_data: Value) {
        let mut utterances = self.inner.utterances.write().await;
        if let Some(utterance) = utterances.get_mut(&id) {
            utterance.failure_data = Some(failure_data);
        }
    }

    /// True when every utterance of the recording has either a transcription
    /// or terminal failure data.
    pub async fn all_utterances_settled(&self, recording_id: RecordingId) -> bool {
        self.inner
            .utterances
            .read()
            .await
            .values()
            .filter(|u| u.recording_id == recording_id)
            .all(|u| u.transcription.is_some() || u.failure_data.is_some())
    }

    // ------------------------------------------------------------------
    // Media & chat requests
    // ------------------------------------------------------------------

    pub async fn insert_media_request(&self, request: MediaRequest) -> MediaRequestId {
        let id = request.id;
        self.inner.media_requests.write().await.insert(id, request);
        id
    }

    pub async fn media_request(&self, id: MediaRequestId) -> Option<MediaRequest> {
        self.inner.media_requests.read().await.get(&id).cloned()
    }

    /// Oldest enqueued request of the given kind (FIFO dispatch order).
    pub async fn oldest_enqueued_media_request(
        &self,
        bot_id: BotId,
        kind: MediaRequestKind,
    ) -> Option<MediaRequest> {
        self.inner
            .media_requests
            .read()
            .await
            .values()
            .filter(|r| {
                r.bot_id == bot_id && r.kind == kind && r.state == MediaRequestState::Enqueued
            })
            .min_by_key(|r| r.created_at)
            .cloned()
    }

    pub async fn enqueued_media_requests(
        &self,
        bot_id: BotId,
        kind: MediaRequestKind,
    ) -> Vec<MediaRequest> {
        let mut requests: Vec<MediaRequest> = self
            .inner
            .media_requests
            .read()
            .await
            .values()
            .filter(|r| {
                r.bot_id == bot_id && r.kind == kind && r.state == MediaRequestState::Enqueued
            })
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub async fn currently_playing_media_request(
        &self,
        bot_id: BotId,
        kind: MediaRequestKind,
    ) -> Option<MediaRequest> {
        self.inner
            .media_requests
            .read()
            .await
            .values()
            .find(|r| {
                r.bot_id == bot_id && r.kind == kind && r.state == MediaRequestState::Playing
            })
            .cloned()
    }

    pub async fn set_media_request_state(
        &self,
        id: MediaRequestId,
        state: MediaRequestState,
    ) -> Result<(), StoreError> {
        let mut requests = self.inner.media_requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(StoreError::MediaRequestNotFound(id))?;
        request.state = state;
        Ok(())
    }

    pub async fn insert_chat_message_request(&self, request: ChatMessageRequest) {
        self.inner
            .chat_message_requests
            .write()
            .await
            .insert(request.id, request);
    }

    pub async fn enqueued_chat_message_requests(&self, bot_id: BotId) -> Vec<ChatMessageRequest> {
        let mut requests: Vec<ChatMessageRequest> = self
            .inner
            .chat_message_requests
            .read()
            .await
            .values()
            .filter(|r| r.bot_id == bot_id && r.state == ChatMessageRequestState::Enqueued)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub async fn set_chat_message_request_state(
        &self,
        id: uuid::Uuid,
        state: ChatMessageRequestState,
    ) {
        let mut requests = self.inner.chat_message_requests.write().await;
        if let Some(request) = requests.get_mut(&id) {
            request.state = state;
        }
    }

    // ------------------------------------------------------------------
    // Data deletion
    // ------------------------------------------------------------------

    /// Wipe a bot's owned media and participant data. The bot row, its
    /// events and its metadata remain.
    pub async fn delete_bot_data(&self, bot_id: BotId) {
        let recording_ids: Vec<RecordingId> = self
            .inner
            .recordings
            .read()
            .await
            .values()
            .filter(|r| r.bot_id == bot_id)
            .map(|r| r.id)
            .collect();

        self.inner
            .utterances
            .write()
            .await
            .retain(|_, u| !recording_ids.contains(&u.recording_id));

        let participant_ids: Vec<ParticipantId> = self
            .inner
            .participants
            .read()
            .await
            .values()
            .filter(|p| p.bot_id == bot_id)
            .map(|p| p.id)
            .collect();
        self.inner
            .participant_events
            .write()
            .await
            .retain(|e| !participant_ids.contains(&e.participant_id));
        self.inner
            .participants
            .write()
            .await
            .retain(|_, p| p.bot_id != bot_id);

        self.inner
            .chat_messages
            .write()
            .await
            .retain(|m| m.bot_id != bot_id);
        self.inner
            .media_requests
            .write()
            .await
            .retain(|_, r| r.bot_id != bot_id);

        let mut recordings = self.inner.recordings.write().await;
        for recording in recordings.values_mut().filter(|r| r.bot_id == bot_id) {
            recording.storage_key = None;
        }
    }

    // ------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------

    pub async fn insert_webhook_subscription(&self, subscription: WebhookSubscription) {
        self.inner
            .webhook_subscriptions
            .write()
            .await
            .insert(subscription.id, subscription);
    }

    pub async fn insert_webhook_secret(&self, secret: WebhookSecret) {
        self.inner.webhook_secrets.write().await.push(secret);
    }

    /// Newest secret for a project; webhook payloads are signed with it.
    pub async fn active_webhook_secret(&self, project_id: ProjectId) -> Option<WebhookSecret> {
        self.inner
            .webhook_secrets
            .read()
            .await
            .iter()
            .filter(|s| s.project_id == project_id)
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    /// Subscriptions to deliver a bot event to. When any bot-level
    /// subscription exists for the bot, they replace the project-level ones.
    pub async fn subscriptions_for_bot_trigger(
        &self,
        project_id: ProjectId,
        bot_id: BotId,
        trigger: WebhookTrigger,
    ) -> Vec<WebhookSubscription> {
        let subscriptions = self.inner.webhook_subscriptions.read().await;
        let bot_level: Vec<WebhookSubscription> = subscriptions
            .values()
            .filter(|s| s.bot_id == Some(bot_id) && s.triggers.contains(&trigger) && s.is_active)
            .cloned()
            .collect();
        if subscriptions.values().any(|s| s.bot_id == Some(bot_id)) {
            return bot_level;
        }
        subscriptions
            .values()
            .filter(|s| {
                s.project_id == project_id
                    && s.bot_id.is_none()
                    && s.triggers.contains(&trigger)
                    && s.is_active
            })
            .cloned()
            .collect()
    }

    pub async fn webhook_subscription(&self, id: uuid::Uuid) -> Option<WebhookSubscription> {
        self.inner
            .webhook_subscriptions
            .read()
            .await
            .get(&id)
            .cloned()
    }

    pub async fn insert_webhook_delivery_attempt(&self, attempt: WebhookDeliveryAttempt) {
        self.inner
            .webhook_attempts
            .write()
            .await
            .insert(attempt.id, attempt);
    }

    pub async fn webhook_delivery_attempt(&self, id: uuid::Uuid) -> Option<WebhookDeliveryAttempt> {
        self.inner.webhook_attempts.read().await.get(&id).cloned()
    }

    pub async fn update_webhook_delivery_attempt<F>(&self, id: uuid::Uuid, update: F)
    where
        F: FnOnce(&mut WebhookDeliveryAttempt),
    {
        let mut attempts = self.inner.webhook_attempts.write().await;
        if let Some(attempt) = attempts.get_mut(&id) {
            update(attempt);
        }
    }

    pub async fn webhook_attempts_for_bot(&self, bot_id: BotId) -> Vec<WebhookDeliveryAttempt> {
        self.inner
            .webhook_attempts
            .read()
            .await
            .values()
            .filter(|a| a.bot_id == Some(bot_id))
            .cloned()
            .collect()
    }
}

/// Rounded-up duration charge, never less than one centicredit per attempt.
fn centicredits_for_duration_ms(duration_ms: i64) -> i64 {
    let seconds = (duration_ms + 999) / 1000;
    let centicredits = (seconds * CENTICREDITS_PER_HOUR + 3599) / 3600;
    centicredits.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::bot_fixture;

    async fn store_with_bot() -> (Store, Bot) {
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
        store.insert_organization(org).await;
        store.insert_project(project.clone()).await;

        let fixture = bot_fixture();
        let bot = store
            .create_bot(NewBot {
                project_id: project.id,
                meeting_url: fixture.meeting_url,
                name: fixture.name,
                settings: fixture.settings,
                join_at: None,
                deduplication_key: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        (store, bot)
    }

    #[tokio::test]
    async fn events_record_old_and_new_state_in_order() {
        let (store, bot) = store_with_bot().await;
        store
            .create_event(bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
            .await
            .unwrap();
        store
            .create_event(bot.id, BotEventType::BotJoinedMeeting, None, serde_json::json!({}))
            .await
            .unwrap();

        let events = store.events_for_bot(bot.id).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].old_state, BotState::Ready);
        assert_eq!(events[0].new_state, BotState::Joining);
        assert_eq!(events[1].old_state, BotState::Joining);
        assert_eq!(events[1].new_state, BotState::JoinedNotRecording);
        assert!(events[0].created_at <= events[1].created_at);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_untouched() {
        let (store, bot) = store_with_bot().await;
        let err = store
            .create_event(bot.id, BotEventType::MeetingEnded, None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));
        assert_eq!(store.bot(bot.id).await.unwrap().state, BotState::Ready);
        assert!(store.events_for_bot(bot.id).await.is_empty());
    }

    #[tokio::test]
    async fn terminal_transition_charges_exactly_once() {
        let (store, bot) = store_with_bot().await;
        let org_id = store
            .project(bot.project_id)
            .await
            .unwrap()
            .organization_id;

        store
            .create_event(bot.id, BotEventType::FatalError, None, serde_json::json!({}))
            .await
            .unwrap();
        // data_deleted is a terminal-to-terminal transition; no second charge.
        store
            .create_event(bot.id, BotEventType::DataDeleted, None, serde_json::json!({}))
            .await
            .unwrap();

        let txs = store.credit_transactions_for_organization(org_id).await;
        assert_eq!(txs.len(), 1);
        assert!(txs[0].centicredits_delta < 0);
        assert_eq!(txs[0].bot_id, Some(bot.id));
    }

    #[tokio::test]
    async fn credit_charge_respects_feature_flag() {
        let store = Store::new(false);
        let org = Organization {
            id: uuid::Uuid::new_v4(),
            name: "Acme".into(),
            centicredits_balance: 0,
        };
        let project = Project {
            id: uuid::Uuid::new_v4(),
            organization_id: org.id,
            name: "Default".into(),
        };
        store.insert_organization(org.clone()).await;
        store.insert_project(project.clone()).await;
        let bot = store
            .create_bot(NewBot {
                project_id: project.id,
                meeting_url: "https://zoom.us/j/1".into(),
                name: "bot".into(),
                settings: BotSettings::default(),
                join_at: None,
                deduplication_key: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        store
            .create_event(bot.id, BotEventType::FatalError, None, serde_json::json!({}))
            .await
            .unwrap();
        assert!(store
            .credit_transactions_for_organization(org.id)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn deduplication_key_unique_among_non_terminal_bots() {
        let (store, bot) = store_with_bot().await;
        let new = NewBot {
            project_id: bot.project_id,
            meeting_url: "https://zoom.us/j/2".into(),
            name: "dup".into(),
            settings: BotSettings::default(),
            join_at: None,
            deduplication_key: Some("key-1".into()),
            metadata: serde_json::json!({}),
        };
        let first = store.create_bot(new.clone()).await.unwrap();
        let err = store.create_bot(new.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::DeduplicationKeyInUse(_)));

        // Once the first bot terminates, the key is reusable.
        store
            .create_event(first.id, BotEventType::FatalError, None, serde_json::json!({}))
            .await
            .unwrap();
        store.create_bot(new).await.unwrap();
    }

    #[tokio::test]
    async fn scheduled_initial_state_depends_on_join_at() {
        let (store, bot) = store_with_bot().await;
        assert_eq!(bot.state, BotState::Ready);

        let scheduled = store
            .create_bot(NewBot {
                project_id: bot.project_id,
                meeting_url: "https://zoom.us/j/3".into(),
                name: "later".into(),
                settings: BotSettings::default(),
                join_at: Some(Utc::now() + chrono::Duration::hours(1)),
                deduplication_key: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(scheduled.state, BotState::Scheduled);
        assert!(store.scheduled_bots_due(Utc::now()).await.is_empty());
        assert_eq!(
            store
                .scheduled_bots_due(Utc::now() + chrono::Duration::hours(2))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn caption_upsert_is_idempotent_per_source_uuid() {
        let (store, bot) = store_with_bot().await;
        let recording = store.default_recording(bot.id).await.unwrap();
        let participant = store
            .get_or_create_participant(bot.id, "d1", None, Some("Alice".into()), false)
            .await;

        let source_uuid = format!("{}-d1-c1", recording.id);
        for text in ["hel", "hello", "hello world"] {
            store
                .upsert_caption_utterance(
                    recording.id,
                    participant.id,
                    source_uuid.clone(),
                    Transcription {
                        transcript: text.into(),
                        words: None,
                    },
                    1000,
                    2000,
                )
                .await;
        }

        let utterances = store.utterances_for_recording(recording.id).await;
        assert_eq!(utterances.len(), 1);
        assert_eq!(
            utterances[0].transcription.as_ref().unwrap().transcript,
            "hello world"
        );
        assert_eq!(utterances[0].source_uuid.as_deref(), Some(source_uuid.as_str()));
    }

    #[tokio::test]
    async fn media_request_fifo_order() {
        let (store, bot) = store_with_bot().await;
        let mut first = MediaRequest {
            id: uuid::Uuid::new_v4(),
            bot_id: bot.id,
            kind: MediaRequestKind::Audio,
            state: MediaRequestState::Enqueued,
            media_blob: Some(vec![1]),
            duration_ms: Some(10),
            text_to_speak: None,
            text_to_speech_settings: None,
            media_url: None,
            created_at: Utc::now(),
        };
        let mut second = first.clone();
        second.id = uuid::Uuid::new_v4();
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        first.media_blob = Some(vec![2]);

        store.insert_media_request(second.clone()).await;
        store.insert_media_request(first.clone()).await;

        let oldest = store
            .oldest_enqueued_media_request(bot.id, MediaRequestKind::Audio)
            .await
            .unwrap();
        assert_eq!(oldest.id, first.id);
    }

    #[tokio::test]
    async fn delete_bot_data_wipes_owned_rows_but_keeps_bot() {
        let (store, bot) = store_with_bot().await;
        let recording = store.default_recording(bot.id).await.unwrap();
        let participant = store
            .get_or_create_participant(bot.id, "d1", None, None, false)
            .await;
        store
            .insert_audio_utterance(Utterance {
                id: uuid::Uuid::new_v4(),
                recording_id: recording.id,
                participant_id: participant.id,
                source: UtteranceSource::PerParticipantAudio,
                audio_blob: Some(vec![0u8; 64]),
                audio_format: Some(AudioFormat::Pcm),
                sample_rate: Some(32000),
                timestamp_ms: 0,
                duration_ms: 1,
                transcription: None,
                failure_data: None,
                source_uuid: None,
            })
            .await;
        store
            .insert_chat_message(ChatMessage {
                id: uuid::Uuid::new_v4(),
                bot_id: bot.id,
                participant_id: Some(participant.id),
                text: "hi".into(),
                timestamp_ms: 0,
                source_uuid: None,
            })
            .await;

        store.delete_bot_data(bot.id).await;

        assert!(store
            .utterances_for_recording(recording.id)
            .await
            .is_empty());
        assert!(store.chat_messages_for_bot(bot.id).await.is_empty());
        assert!(store.bot(bot.id).await.is_ok());
    }

    #[test]
    fn centicredit_charge_rounds_up_and_has_a_floor() {
        assert_eq!(centicredits_for_duration_ms(0), 1);
        assert_eq!(centicredits_for_duration_ms(1), 1);
        // One hour = 100 centicredits.
        assert_eq!(centicredits_for_duration_ms(3_600_000), 100);
        // 36 seconds = 1/100 hour = 1 centicredit.
        assert_eq!(centicredits_for_duration_ms(36_000), 1);
        assert_eq!(centicredits_for_duration_ms(37_000), 2);
    }

    #[tokio::test]
    async fn bot_level_subscriptions_replace_project_level() {
        let (store, bot) = store_with_bot().await;
        let project_sub = WebhookSubscription {
            id: uuid::Uuid::new_v4(),
            project_id: bot.project_id,
            bot_id: None,
            url: "https://example.com/project".into(),
            triggers: vec![WebhookTrigger::BotStateChange],
            is_active: true,
            created_at: Utc::now(),
        };
        store.insert_webhook_subscription(project_sub.clone()).await;

        let found = store
            .subscriptions_for_bot_trigger(bot.project_id, bot.id, WebhookTrigger::BotStateChange)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, project_sub.id);

        let bot_sub = WebhookSubscription {
            id: uuid::Uuid::new_v4(),
            project_id: bot.project_id,
            bot_id: Some(bot.id),
            url: "https://example.com/bot".into(),
            triggers: vec![WebhookTrigger::BotStateChange],
            is_active: true,
            created_at: Utc::now(),
        };
        store.insert_webhook_subscription(bot_sub.clone()).await;

        let found = store
            .subscriptions_for_bot_trigger(bot.project_id, bot.id, WebhookTrigger::BotStateChange)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, bot_sub.id);
    }
}
