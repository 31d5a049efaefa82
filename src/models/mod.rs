//! Data model for bots, recordings, transcripts, playback and webhooks.

mod bot;
mod events;
mod media_request;
mod recording;
mod webhook;

pub use bot::*;
pub use events::*;
pub use media_request::*;
pub use recording::*;
pub use webhook::*;

#[cfg(test)]
pub mod test_support {
    //! Fixtures shared across test modules.

    use super::*;

    pub fn bot_fixture() -> Bot {
        Bot {
            id: uuid::Uuid::new_v4(),
            project_id: uuid::Uuid::new_v4(),
            meeting_url: "https://zoom.us/j/123456789?pwd=password123".into(),
            name: "Notetaker".into(),
            settings: BotSettings::default(),
            join_at: None,
            deduplication_key: None,
            metadata: serde_json::json!({}),
            state: BotState::Ready,
            last_heartbeat_at: None,
            created_at: chrono::Utc::now(),
        }
    }
}
