//! Async transcription of per-participant utterances.
//!
//! Each utterance with audio is handed to the configured provider; provider
//! errors are retried with exponential backoff and, once exhausted, recorded
//! as `failure_data` on the utterance. A failing utterance never fails the
//! bot.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use backon::{ExponentialBuilder, Retryable};

use crate::models::{RecordingId, RecordingState, TranscriptionState, UtteranceId};
use crate::store::Store;

use super::BatchTranscriber;

/// Three provider calls total: the first try plus two retries.
const MAX_RETRIES: usize = 2;

fn default_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_times(MAX_RETRIES)
}

pub async fn process_utterance(
    store: Store,
    transcriber: Arc<dyn BatchTranscriber>,
    utterance_id: UtteranceId,
    language: Option<String>,
) {
    process_utterance_with_backoff(store, transcriber, utterance_id, language, default_backoff())
        .await;
}

pub async fn process_utterance_with_backoff(
    store: Store,
    transcriber: Arc<dyn BatchTranscriber>,
    utterance_id: UtteranceId,
    language: Option<String>,
    backoff: ExponentialBuilder,
) {
    let Some(utterance) = store.utterance(utterance_id).await else {
        tracing::warn!(%utterance_id, "utterance vanished before transcription");
        return;
    };
    let Some(pcm) = utterance.audio_blob.clone() else {
        return;
    };
    let Some(sample_rate) = utterance.sample_rate else {
        store
            .set_utterance_failure(
                utterance_id,
                serde_json::json!({"error": "utterance has no sample rate"}),
            )
            .await;
        return;
    };

    store
        .set_recording_transcription_state(utterance.recording_id, TranscriptionState::InProgress)
        .await;

    let attempt = || {
        let transcriber = Arc::clone(&transcriber);
        let pcm = pcm.clone();
        let language = language.clone();
        async move {
            tokio::task::spawn_blocking(move || {
                transcriber.transcribe(&pcm, sample_rate, language.as_deref())
            })
            .await
            .map_err(|e| anyhow!("transcription task panicked: {e}"))?
        }
    };

    match attempt
        .retry(backoff)
        .notify(|err, delay| {
            tracing::info!(%utterance_id, "transcription attempt failed ({err}), retrying in {delay:?}");
        })
        .await
    {
        Ok(transcription) => {
            store
                .set_utterance_transcription(utterance_id, transcription)
                .await;
        }
        Err(e) => {
            tracing::warn!(%utterance_id, "transcription gave up: {e}");
            store
                .set_utterance_failure(
                    utterance_id,
                    serde_json::json!({
                        "error": e.to_string(),
                        "attempts": MAX_RETRIES + 1,
                    }),
                )
                .await;
        }
    }

    maybe_complete_transcription(&store, utterance.recording_id).await;
}

/// Once the media side of a recording is finished and every utterance has
/// settled, flip the transcription state to complete.
pub async fn maybe_complete_transcription(store: &Store, recording_id: RecordingId) {
    let Ok(recording) = store.recording_by_id(recording_id).await else {
        return;
    };
    if recording.state != RecordingState::Complete {
        return;
    }
    if store.utterances_for_recording(recording_id).await.is_empty() {
        return;
    }
    if store.all_utterances_settled(recording_id).await {
        store
            .set_recording_transcription_state(recording_id, TranscriptionState::Complete)
            .await;
    }
}
