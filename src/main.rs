//! meetbot - meeting-attending bot runtime
//!
//! One supervisor process per meeting attendance attempt, plus a scheduler
//! that launches bots whose join time has arrived.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meetbot::adapters::IpcPlatformLink;
use meetbot::config::{self, RuntimeConfig};
use meetbot::controller::uploader::FileUploader;
use meetbot::controller::{Supervisor, SupervisorDeps};
use meetbot::models::{self, BotEventType, BotId, BotSettings, RecordingFormat, RtmpSettings};
use meetbot::scheduler;
use meetbot::store::{NewBot, Store};
use meetbot::webhooks::WebhookDispatcher;

#[derive(Parser)]
#[command(name = "meetbot")]
#[command(about = "Meeting-attending bot runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a bot for a meeting URL and run its supervisor to completion
    Run {
        /// The meeting to join (Zoom, Google Meet or Microsoft Teams)
        meeting_url: String,

        /// Display name shown to other participants
        #[arg(long, default_value = "Notetaker")]
        name: String,

        /// Recording container format
        #[arg(long, default_value = "mp4")]
        format: String,

        /// Record audio only
        #[arg(long)]
        audio_only: bool,

        /// Stream to this RTMP destination instead of recording to a file
        #[arg(long)]
        rtmp_url: Option<String>,

        /// Stream key for the RTMP destination
        #[arg(long)]
        stream_key: Option<String>,
    },

    /// Run the scheduled-bot launcher
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = RuntimeConfig::from_env()?;
    let store = Store::new(config.charge_credits_when_bot_terminates);
    let webhooks = WebhookDispatcher::new(store.clone(), config::WEBHOOK_USER_AGENT.to_string());
    webhooks.clone().spawn_event_listener();

    match cli.command {
        Commands::Run {
            meeting_url,
            name,
            format,
            audio_only,
            rtmp_url,
            stream_key,
        } => {
            let format = match format.as_str() {
                "mp4" => RecordingFormat::Mp4,
                "webm" => RecordingFormat::Webm,
                "mp3" => RecordingFormat::Mp3,
                other => anyhow::bail!("unsupported recording format: {other}"),
            };
            let mut settings = BotSettings::default();
            settings.recording.format = format;
            settings.recording.audio_only = audio_only;
            if let Some(destination_url) = rtmp_url {
                let stream_key =
                    stream_key.context("--stream-key is required with --rtmp-url")?;
                settings.rtmp = Some(RtmpSettings {
                    destination_url,
                    stream_key,
                });
            }

            // A standalone run gets a throwaway project so ownership and
            // billing still have somewhere to land.
            let organization = models::Organization {
                id: uuid::Uuid::new_v4(),
                name: "local".into(),
                centicredits_balance: 0,
            };
            let project = models::Project {
                id: uuid::Uuid::new_v4(),
                organization_id: organization.id,
                name: "local".into(),
            };
            store.insert_organization(organization).await;
            store.insert_project(project.clone()).await;

            let bot = store
                .create_bot(NewBot {
                    project_id: project.id,
                    meeting_url,
                    name,
                    settings,
                    join_at: None,
                    deduplication_key: None,
                    metadata: serde_json::json!({}),
                })
                .await?;
            store
                .create_event(bot.id, BotEventType::JoinRequested, None, serde_json::json!({}))
                .await?;

            run_supervisor(&store, &config, webhooks, bot.id).await?;
        }
        Commands::Scheduler => {
            let launcher = Arc::new(InProcessLauncher {
                store: store.clone(),
                config: config.clone(),
                webhooks: webhooks.clone(),
            });
            tracing::info!("scheduler starting");
            scheduler::Scheduler::new(store, launcher).run().await;
        }
    }

    Ok(())
}

async fn run_supervisor(
    store: &Store,
    config: &RuntimeConfig,
    webhooks: WebhookDispatcher,
    bot_id: BotId,
) -> Result<()> {
    let deps = SupervisorDeps {
        platform_link: Arc::new(IpcPlatformLink::new(config.bridge_socket.clone())),
        // Vendor transcription/TTS integrations plug in here; without them
        // the bot still records and aggregates platform captions.
        transcriber_factory: None,
        synthesizer: None,
        uploader: Arc::new(FileUploader::new(config.storage_root.clone())),
        webhooks,
    };
    let supervisor = Supervisor::new(store.clone(), bot_id, config.redis_url.clone(), deps)
        .await
        .context("failed to build supervisor")?;
    supervisor.run().await
}

/// Runs supervisors as tasks in this process.
struct InProcessLauncher {
    store: Store,
    config: RuntimeConfig,
    webhooks: WebhookDispatcher,
}

impl scheduler::WorkerLauncher for InProcessLauncher {
    fn launch(&self, bot_id: BotId) {
        let store = self.store.clone();
        let config = self.config.clone();
        let webhooks = self.webhooks.clone();
        tokio::spawn(async move {
            if let Err(e) = run_supervisor(&store, &config, webhooks, bot_id).await {
                tracing::error!(%bot_id, "supervisor exited with error: {e:#}");
            }
        });
    }
}
