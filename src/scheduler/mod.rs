//! Scheduled-bot launcher.
//!
//! A periodic scan finds bots in `scheduled` whose join time has arrived,
//! records JOIN_REQUESTED and hands them to a launcher. In this runtime the
//! launcher spawns the supervisor in-process; a clustered deployment swaps
//! in one that creates a worker pod instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::{BotEventType, BotId};
use crate::store::Store;

const SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Starts a worker for a bot that just entered `joining`.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, bot_id: BotId);
}

pub struct Scheduler {
    store: Store,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Scheduler {
    pub fn new(store: Store, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self { store, launcher }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tick.tick().await;
            self.scan_once().await;
        }
    }

    /// One scan: launch every due bot. The JOIN_REQUESTED event doubles as
    /// the claim; a concurrent scanner loses the transition race and skips.
    pub async fn scan_once(&self) -> usize {
        let due = self.store.scheduled_bots_due(Utc::now()).await;
        let mut launched = 0;
        for bot in due {
            match self
                .store
                .create_event(bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
                .await
            {
                Ok(_) => {
                    tracing::info!(bot_id = %bot.id, "launching scheduled bot");
                    self.launcher.launch(bot.id);
                    launched += 1;
                }
                Err(e) => {
                    tracing::info!(bot_id = %bot.id, "skipping scheduled bot: {e}");
                }
            }
        }
        launched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BotSettings, BotState, Organization, Project};
    use crate::store::NewBot;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<BotId>>,
    }

    impl WorkerLauncher for RecordingLauncher {
        fn launch(&self, bot_id: BotId) {
            self.launched.lock().unwrap().push(bot_id);
        }
    }

    async fn seeded_store() -> (Store, crate::models::ProjectId) {
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
        store.insert_organization(org).await;
        store.insert_project(project.clone()).await;
        (store, project.id)
    }

    #[tokio::test]
    async fn due_bots_are_claimed_and_launched_once() {
        let (store, project_id) = seeded_store().await;
        let bot = store
            .create_bot(NewBot {
                project_id,
                meeting_url: "https://zoom.us/j/123".into(),
                name: "bot".into(),
                settings: BotSettings::default(),
                join_at: Some(Utc::now() - chrono::Duration::minutes(1)),
                deduplication_key: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();
        assert_eq!(bot.state, BotState::Scheduled);

        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(store.clone(), launcher.clone());

        assert_eq!(scheduler.scan_once().await, 1);
        assert_eq!(*launcher.launched.lock().unwrap(), vec![bot.id]);
        assert_eq!(store.bot(bot.id).await.unwrap().state, BotState::Joining);

        // Already claimed: nothing further to launch.
        assert_eq!(scheduler.scan_once().await, 0);
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn future_bots_stay_scheduled() {
        let (store, project_id) = seeded_store().await;
        store
            .create_bot(NewBot {
                project_id,
                meeting_url: "https://zoom.us/j/123".into(),
                name: "bot".into(),
                settings: BotSettings::default(),
                join_at: Some(Utc::now() + chrono::Duration::hours(1)),
                deduplication_key: None,
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(store, launcher.clone());
        assert_eq!(scheduler.scan_once().await, 0);
        assert!(launcher.launched.lock().unwrap().is_empty());
    }
}
