//! How the bot uses the media it receives from the meeting platform.
//!
//! Only a handful of capability combinations are supported; everything else
//! is rejected up front so the rest of the controller never has to reason
//! about half-configured pipelines.

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfiguration {
    pub record_video: bool,
    pub record_audio: bool,
    pub transcribe_audio: bool,
    pub rtmp_stream_audio: bool,
    pub rtmp_stream_video: bool,
    pub websocket_stream_audio: bool,
}

impl PipelineConfiguration {
    pub fn recorder() -> Self {
        Self {
            record_video: true,
            record_audio: true,
            transcribe_audio: true,
            rtmp_stream_audio: false,
            rtmp_stream_video: false,
            websocket_stream_audio: false,
        }
    }

    pub fn audio_recorder() -> Self {
        Self {
            record_video: false,
            record_audio: true,
            transcribe_audio: true,
            rtmp_stream_audio: false,
            rtmp_stream_video: false,
            websocket_stream_audio: false,
        }
    }

    pub fn rtmp_streamer() -> Self {
        Self {
            record_video: false,
            record_audio: false,
            transcribe_audio: true,
            rtmp_stream_audio: true,
            rtmp_stream_video: true,
            websocket_stream_audio: false,
        }
    }

    pub fn transcription_only() -> Self {
        Self {
            record_video: false,
            record_audio: false,
            transcribe_audio: true,
            rtmp_stream_audio: false,
            rtmp_stream_video: false,
            websocket_stream_audio: false,
        }
    }

    pub fn with_websocket_audio(mut self) -> Self {
        self.websocket_stream_audio = true;
        self
    }

    /// Validate an arbitrary flag combination against the supported set.
    pub fn try_new(
        record_video: bool,
        record_audio: bool,
        transcribe_audio: bool,
        rtmp_stream_audio: bool,
        rtmp_stream_video: bool,
        websocket_stream_audio: bool,
    ) -> Result<Self> {
        let candidate = Self {
            record_video,
            record_audio,
            transcribe_audio,
            rtmp_stream_audio,
            rtmp_stream_video,
            websocket_stream_audio,
        };
        if Self::valid_configurations().contains(&candidate) {
            Ok(candidate)
        } else {
            Err(anyhow!("invalid pipeline configuration: {candidate:?}"))
        }
    }

    fn valid_configurations() -> [Self; 7] {
        [
            Self::recorder(),
            Self::audio_recorder(),
            Self::rtmp_streamer(),
            Self::recorder().with_websocket_audio(),
            Self::audio_recorder().with_websocket_audio(),
            Self::transcription_only(),
            Self::transcription_only().with_websocket_audio(),
        ]
    }

    pub fn streams_rtmp(&self) -> bool {
        self.rtmp_stream_audio || self.rtmp_stream_video
    }

    pub fn records_to_file(&self) -> bool {
        self.record_audio || self.record_video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_seven_valid_configurations_pass() {
        for config in PipelineConfiguration::valid_configurations() {
            let rebuilt = PipelineConfiguration::try_new(
                config.record_video,
                config.record_audio,
                config.transcribe_audio,
                config.rtmp_stream_audio,
                config.rtmp_stream_video,
                config.websocket_stream_audio,
            );
            assert!(rebuilt.is_ok(), "{config:?}");
        }
    }

    #[test]
    fn off_menu_combinations_are_rejected() {
        // Recording while RTMP-streaming is not supported.
        assert!(PipelineConfiguration::try_new(true, true, true, true, true, false).is_err());
        // Video without audio is not supported.
        assert!(PipelineConfiguration::try_new(true, false, true, false, false, false).is_err());
        // Everything off is not a bot.
        assert!(PipelineConfiguration::try_new(false, false, false, false, false, false).is_err());
    }

    #[test]
    fn helpers() {
        assert!(PipelineConfiguration::rtmp_streamer().streams_rtmp());
        assert!(!PipelineConfiguration::rtmp_streamer().records_to_file());
        assert!(PipelineConfiguration::recorder().records_to_file());
    }
}
