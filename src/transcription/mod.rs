//! Vendor-agnostic transcription and speech-synthesis interfaces.
//!
//! The actual vendor protocols live outside this crate; the controller only
//! depends on these traits. Provider selection mirrors the bot's
//! transcription settings, with a platform-dependent default: Zoom bots get
//! the streaming-vendor default, browser bots fall back to the platform's
//! closed captions.

pub mod worker;

use anyhow::Result;

use crate::adapters::MeetingKind;
use crate::models::{Transcription, TranscriptionSettings};

/// Provider key for platform-caption "transcription".
pub const PROVIDER_CLOSED_CAPTIONS: &str = "meeting_closed_captions";
/// Default streaming vendor for per-participant audio.
pub const PROVIDER_DEFAULT_STREAMING: &str = "deepgram";

/// A live per-speaker transcription session.
pub trait StreamingTranscriber: Send + Sync {
    /// Push a PCM chunk into the session.
    fn send(&self, pcm: &[u8]);

    /// Close the session and flush pending results.
    fn finish(&self);
}

/// Whole-utterance transcription for non-realtime recordings.
pub trait BatchTranscriber: Send + Sync {
    fn transcribe(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        language: Option<&str>,
    ) -> Result<Transcription>;
}

/// Text-to-speech. Implementations must return bare PCM (any WAV header
/// stripped) plus the clip duration.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(
        &self,
        text: &str,
        settings: &serde_json::Value,
        sample_rate: u32,
    ) -> Result<(Vec<u8>, i64)>;
}

/// Creates provider sessions for a project's credentials. Handed to the
/// supervisor at startup; implementations live with the vendor
/// integrations.
pub trait TranscriberFactory: Send + Sync {
    fn streaming(
        &self,
        provider: &str,
        sample_rate: u32,
        language: Option<&str>,
        model: Option<&str>,
        callback_url: Option<&str>,
        metadata: Vec<(String, String)>,
    ) -> Result<Box<dyn StreamingTranscriber>>;

    fn batch(&self, provider: &str) -> Result<Box<dyn BatchTranscriber>>;
}

/// Resolve the effective provider for a bot.
pub fn provider_for(settings: &TranscriptionSettings, kind: &MeetingKind) -> String {
    if let Some(provider) = &settings.provider {
        return provider.clone();
    }
    match kind {
        MeetingKind::Zoom { .. } => PROVIDER_DEFAULT_STREAMING.to_string(),
        MeetingKind::GoogleMeet | MeetingKind::Teams => PROVIDER_CLOSED_CAPTIONS.to_string(),
    }
}

/// Whether transcription comes from platform captions rather than audio.
pub fn uses_platform_captions(provider: &str) -> bool {
    provider == PROVIDER_CLOSED_CAPTIONS
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults_depend_on_platform() {
        let settings = TranscriptionSettings::default();
        let zoom = MeetingKind::Zoom {
            meeting_id: "1".into(),
            password: None,
        };
        assert_eq!(provider_for(&settings, &zoom), PROVIDER_DEFAULT_STREAMING);
        assert_eq!(
            provider_for(&settings, &MeetingKind::GoogleMeet),
            PROVIDER_CLOSED_CAPTIONS
        );
        assert_eq!(
            provider_for(&settings, &MeetingKind::Teams),
            PROVIDER_CLOSED_CAPTIONS
        );
    }

    #[test]
    fn explicit_provider_wins() {
        let settings = TranscriptionSettings {
            provider: Some("acme_speech".into()),
            ..Default::default()
        };
        assert_eq!(
            provider_for(&settings, &MeetingKind::GoogleMeet),
            "acme_speech"
        );
    }

    #[test]
    fn caption_provider_detection() {
        assert!(uses_platform_captions(PROVIDER_CLOSED_CAPTIONS));
        assert!(!uses_platform_captions(PROVIDER_DEFAULT_STREAMING));
    }
}
