//! Webhook subscriptions, delivery attempts and the credit ledger.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BotId, OrganizationId, ProjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookTrigger {
    BotStateChange,
    TranscriptUpdate,
    ChatMessagesUpdate,
    ParticipantEventsJoinLeave,
}

impl WebhookTrigger {
    pub fn api_code(self) -> &'static str {
        match self {
            WebhookTrigger::BotStateChange => "bot.state_change",
            WebhookTrigger::TranscriptUpdate => "transcript.update",
            WebhookTrigger::ChatMessagesUpdate => "chat_messages.update",
            WebhookTrigger::ParticipantEventsJoinLeave => "participant_events.join_leave",
        }
    }
}

/// Destination URL plus trigger mask. Scoped to a project, or to a single
/// bot — bot-level subscriptions replace project-level ones for that bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: uuid::Uuid,
    pub project_id: ProjectId,
    /// When set, this subscription only fires for events about this bot.
    pub bot_id: Option<BotId>,
    pub url: String,
    pub triggers: Vec<WebhookTrigger>,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Per-project HMAC secret. The newest secret is the active one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSecret {
    pub id: uuid::Uuid,
    pub project_id: ProjectId,
    pub secret: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDeliveryStatus {
    Pending,
    Success,
    Failure,
}

/// One webhook delivery, retried up to three attempts total. The
/// idempotency key is fixed at creation and shared across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempt {
    pub id: uuid::Uuid,
    pub subscription_id: uuid::Uuid,
    pub bot_id: Option<BotId>,
    pub trigger: WebhookTrigger,
    pub idempotency_key: uuid::Uuid,
    pub payload: Value,
    pub status: WebhookDeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    pub succeeded_at: Option<chrono::DateTime<chrono::Utc>>,
    /// One entry per attempt: response body or error description.
    pub response_bodies: Vec<Value>,
}

/// Monotonically applied delta to an organization's credit balance.
/// Bot charges carry a negative delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: uuid::Uuid,
    pub organization_id: OrganizationId,
    /// The bot whose termination produced this charge, if any.
    pub bot_id: Option<BotId>,
    pub centicredits_delta: i64,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
