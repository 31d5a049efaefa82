//! Webhook payload builders.

use serde_json::Value;

use crate::models::{
    BotEvent, ChatMessage, Participant, ParticipantEvent, ParticipantEventKind, Utterance,
};

pub fn bot_state_change_payload(event: &BotEvent) -> Value {
    serde_json::json!({
        "old_state": event.old_state.api_code(),
        "new_state": event.new_state.api_code(),
        "event_type": event.event_type,
        "event_sub_type": event.event_sub_type,
        "created_at": event.created_at.to_rfc3339(),
    })
}

pub fn utterance_payload(utterance: &Utterance, participant: &Participant) -> Value {
    serde_json::json!({
        "speaker_name": participant.full_name,
        "speaker_uuid": participant.uuid,
        "speaker_user_uuid": participant.user_uuid,
        "timestamp_ms": utterance.timestamp_ms,
        "duration_ms": utterance.duration_ms,
        "transcription": utterance
            .transcription
            .as_ref()
            .map(|t| serde_json::json!({"transcript": t.transcript})),
    })
}

pub fn chat_message_payload(message: &ChatMessage, sender: Option<&Participant>) -> Value {
    serde_json::json!({
        "id": message.id,
        "text": message.text,
        "timestamp_ms": message.timestamp_ms,
        "sender_name": sender.and_then(|p| p.full_name.clone()),
        "sender_uuid": sender.map(|p| p.uuid.clone()),
    })
}

pub fn participant_event_payload(event: &ParticipantEvent, participant: &Participant) -> Value {
    serde_json::json!({
        "id": event.id,
        "participant_name": participant.full_name,
        "participant_uuid": participant.uuid,
        "event_type": match event.kind {
            ParticipantEventKind::Join => "join",
            ParticipantEventKind::Leave => "leave",
        },
        "timestamp_ms": event.timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Transcription, UtteranceSource};

    fn participant() -> Participant {
        Participant {
            id: uuid::Uuid::new_v4(),
            bot_id: uuid::Uuid::new_v4(),
            uuid: "dev-1".into(),
            user_uuid: Some("user-1".into()),
            full_name: Some("Alice".into()),
            is_the_bot: false,
        }
    }

    #[test]
    fn utterance_payload_includes_speaker_and_transcript() {
        let participant = participant();
        let utterance = Utterance {
            id: uuid::Uuid::new_v4(),
            recording_id: uuid::Uuid::new_v4(),
            participant_id: participant.id,
            source: UtteranceSource::ClosedCaptionFromPlatform,
            audio_blob: None,
            audio_format: None,
            sample_rate: None,
            timestamp_ms: 1234,
            duration_ms: 500,
            transcription: Some(Transcription {
                transcript: "hello".into(),
                words: None,
            }),
            failure_data: None,
            source_uuid: Some("r-dev-1-c1".into()),
        };

        let payload = utterance_payload(&utterance, &participant);
        assert_eq!(payload["speaker_name"], "Alice");
        assert_eq!(payload["speaker_uuid"], "dev-1");
        assert_eq!(payload["timestamp_ms"], 1234);
        assert_eq!(payload["transcription"]["transcript"], "hello");
    }

    #[test]
    fn participant_event_payload_kind_strings() {
        let participant = participant();
        let event = ParticipantEvent {
            id: uuid::Uuid::new_v4(),
            participant_id: participant.id,
            kind: ParticipantEventKind::Leave,
            timestamp_ms: 99,
        };
        let payload = participant_event_payload(&event, &participant);
        assert_eq!(payload["event_type"], "leave");
    }
}
