//! Webhook signing and delivery.
//!
//! Payloads are signed with HMAC-SHA256 over a canonical JSON encoding
//! (sorted keys, compact separators, UTF-8) and delivered with up to three
//! attempts. The delivery attempt row is persisted before the first POST so
//! an operator can always see what was sent where; the idempotency key is
//! fixed at enqueue time and survives retries.

pub mod payloads;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::models::{
    Bot, BotEvent, WebhookDeliveryAttempt, WebhookDeliveryStatus, WebhookTrigger,
};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Total POSTs per delivery before giving up.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Response bodies are truncated before storage.
const MAX_STORED_RESPONSE_BYTES: usize = 10_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Canonical JSON: object keys sorted, compact separators, UTF-8 passthrough.
///
/// Implemented by hand rather than relying on the serializer's map ordering
/// so the signature is stable no matter how the payload was built.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).unwrap_or_default());
        }
    }
}

/// Base64-encoded HMAC-SHA256 over the canonical payload encoding.
pub fn sign_payload(payload: &Value, secret: &[u8]) -> String {
    let canonical = canonical_json(payload);
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a received signature.
pub fn verify_signature(payload: &Value, signature: &str, secret: &[u8]) -> bool {
    let canonical = canonical_json(payload);
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    let Ok(expected) = BASE64.decode(signature) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Store,
    http: reqwest::Client,
    user_agent: String,
    retry_base_delay: Duration,
}

impl WebhookDispatcher {
    pub fn new(store: Store, user_agent: String) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            user_agent,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Fan a trigger out to the matching subscriptions. Returns the number
    /// of deliveries enqueued; each delivery runs on its own task.
    pub async fn trigger(&self, bot: &Bot, trigger: WebhookTrigger, payload: Value) -> usize {
        let subscriptions = self
            .store
            .subscriptions_for_bot_trigger(bot.project_id, bot.id, trigger)
            .await;

        let mut enqueued = 0;
        for subscription in subscriptions {
            let attempt = WebhookDeliveryAttempt {
                id: uuid::Uuid::new_v4(),
                subscription_id: subscription.id,
                bot_id: Some(bot.id),
                trigger,
                idempotency_key: uuid::Uuid::new_v4(),
                payload: payload.clone(),
                status: WebhookDeliveryStatus::Pending,
                attempt_count: 0,
                last_attempt_at: None,
                succeeded_at: None,
                response_bodies: Vec::new(),
            };
            let attempt_id = attempt.id;
            self.store.insert_webhook_delivery_attempt(attempt).await;

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.deliver(attempt_id).await;
            });
            enqueued += 1;
        }
        enqueued
    }

    /// Run a delivery to completion: up to three POSTs with exponential
    /// backoff between them.
    pub async fn deliver(&self, attempt_id: uuid::Uuid) {
        for attempt_number in 0..MAX_DELIVERY_ATTEMPTS {
            if attempt_number > 0 {
                tokio::time::sleep(self.retry_base_delay * 2u32.pow(attempt_number - 1)).await;
            }
            match self.attempt_once(attempt_id).await {
                DeliveryOutcome::Done => return,
                DeliveryOutcome::Retry => continue,
            }
        }
        if let Some(attempt) = self.store.webhook_delivery_attempt(attempt_id).await {
            if attempt.status == WebhookDeliveryStatus::Failure {
                tracing::warn!(
                    %attempt_id,
                    attempts = attempt.attempt_count,
                    "webhook delivery failed permanently"
                );
            }
        }
    }

    async fn attempt_once(&self, attempt_id: uuid::Uuid) -> DeliveryOutcome {
        let Some(attempt) = self.store.webhook_delivery_attempt(attempt_id).await else {
            tracing::warn!(%attempt_id, "webhook delivery attempt not found");
            return DeliveryOutcome::Done;
        };
        let Some(subscription) = self.store.webhook_subscription(attempt.subscription_id).await
        else {
            tracing::warn!(%attempt_id, "webhook subscription vanished");
            return DeliveryOutcome::Done;
        };

        // Inactive subscriptions fail without a network call and without
        // retries.
        if !subscription.is_active {
            self.store
                .update_webhook_delivery_attempt(attempt_id, |attempt| {
                    attempt.status = WebhookDeliveryStatus::Failure;
                    attempt.response_bodies.push(serde_json::json!({
                        "status_code": null,
                        "error_type": "InactiveSubscription",
                        "error_message": "webhook subscription is no longer active",
                        "request_url": subscription.url,
                    }));
                })
                .await;
            return DeliveryOutcome::Done;
        }

        let mut webhook_data = serde_json::json!({
            "idempotency_key": attempt.idempotency_key,
            "trigger": attempt.trigger.api_code(),
            "data": attempt.payload,
        });
        if let Some(bot_id) = attempt.bot_id {
            webhook_data["bot_id"] = serde_json::json!(bot_id);
            if let Ok(bot) = self.store.bot(bot_id).await {
                webhook_data["bot_metadata"] = bot.metadata.clone();
            }
        }

        let Some(secret) = self
            .store
            .active_webhook_secret(subscription.project_id)
            .await
        else {
            tracing::warn!(%attempt_id, "no webhook secret for project, failing delivery");
            self.store
                .update_webhook_delivery_attempt(attempt_id, |attempt| {
                    attempt.status = WebhookDeliveryStatus::Failure;
                })
                .await;
            return DeliveryOutcome::Done;
        };
        let signature = sign_payload(&webhook_data, &secret.secret);

        self.store
            .update_webhook_delivery_attempt(attempt_id, |attempt| {
                attempt.attempt_count += 1;
                attempt.last_attempt_at = Some(chrono::Utc::now());
            })
            .await;

        let response = self
            .http
            .post(&subscription.url)
            .timeout(REQUEST_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("X-Webhook-Signature", signature)
            .json(&webhook_data)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let body: String = body.chars().take(MAX_STORED_RESPONSE_BYTES).collect();
                let succeeded = status.is_success();
                self.store
                    .update_webhook_delivery_attempt(attempt_id, |attempt| {
                        attempt.response_bodies.push(serde_json::json!({
                            "status_code": status.as_u16(),
                            "body": body,
                        }));
                        if succeeded {
                            attempt.status = WebhookDeliveryStatus::Success;
                            attempt.succeeded_at = Some(chrono::Utc::now());
                        } else {
                            attempt.status = WebhookDeliveryStatus::Failure;
                        }
                    })
                    .await;
                if succeeded {
                    DeliveryOutcome::Done
                } else {
                    DeliveryOutcome::Retry
                }
            }
            Err(e) => {
                self.store
                    .update_webhook_delivery_attempt(attempt_id, |attempt| {
                        attempt.status = WebhookDeliveryStatus::Failure;
                        attempt.response_bodies.push(serde_json::json!({
                            "status_code": null,
                            "error_type": "RequestError",
                            "error_message": e.to_string(),
                            "request_url": subscription.url,
                        }));
                    })
                    .await;
                DeliveryOutcome::Retry
            }
        }
    }

    /// Fire `bot.state_change` for every event the store creates. Runs until
    /// the store is dropped.
    pub fn spawn_event_listener(self) -> tokio::task::JoinHandle<()> {
        let mut events = self.store.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.dispatch_state_change(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "webhook event listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch_state_change(&self, event: &BotEvent) {
        let Ok(bot) = self.store.bot(event.bot_id).await else {
            return;
        };
        let payload = payloads::bot_state_change_payload(event);
        self.trigger(&bot, WebhookTrigger::BotStateChange, payload)
            .await;
    }
}

enum DeliveryOutcome {
    Done,
    Retry,
}
