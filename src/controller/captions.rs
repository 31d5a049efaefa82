//! Closed-caption aggregation.
//!
//! Platforms extend a caption in place while the speaker talks, so writes
//! are debounced: a caption is first persisted a second after it appears,
//! rewritten once it has been idle for two seconds, and evicted from memory
//! after a minute without modification. Keys are `(device_id, caption_id)`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::adapters::CaptionUpsert;

const FIRST_WRITE_AFTER: Duration = Duration::from_secs(1);
const REWRITE_AFTER_IDLE: Duration = Duration::from_secs(2);
const EVICT_AFTER_IDLE: Duration = Duration::from_secs(60);

/// A caption the supervisor should upsert as an utterance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCaption {
    pub device_id: String,
    pub caption_id: String,
    pub text: String,
    /// Wall-clock time the caption first appeared.
    pub timestamp_ms: i64,
    /// How long the caption kept growing.
    pub duration_ms: i64,
}

struct CaptionEntry {
    text: String,
    created_wall_ms: i64,
    created: Instant,
    modified: Instant,
    last_upsert: Option<Instant>,
}

impl CaptionEntry {
    fn should_upsert(&self, flush: bool, now: Instant) -> bool {
        match self.last_upsert {
            None => flush || now.duration_since(self.created) > FIRST_WRITE_AFTER,
            Some(last_upsert) => {
                self.modified > last_upsert
                    && (flush || now.duration_since(self.modified) >= REWRITE_AFTER_IDLE)
            }
        }
    }
}

#[derive(Default)]
pub struct ClosedCaptionManager {
    captions: HashMap<(String, String), CaptionEntry>,
}

impl ClosedCaptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_caption(&mut self, caption: CaptionUpsert, now: Instant) {
        let key = (caption.device_id, caption.caption_id);
        match self.captions.get_mut(&key) {
            Some(entry) => {
                entry.text = caption.text;
                entry.modified = now;
            }
            None => {
                self.captions.insert(
                    key,
                    CaptionEntry {
                        text: caption.text,
                        created_wall_ms: chrono::Utc::now().timestamp_millis(),
                        created: now,
                        modified: now,
                        last_upsert: None,
                    },
                );
            }
        }
    }

    /// Collect captions whose debounce window has passed (all of them when
    /// `flush` is set), marking them written and evicting long-idle
    /// entries.
    pub fn take_ready(&mut self, flush: bool, now: Instant) -> Vec<ReadyCaption> {
        let mut ready = Vec::new();
        for ((device_id, caption_id), entry) in self.captions.iter_mut() {
            if !entry.should_upsert(flush, now) {
                continue;
            }
            ready.push(ReadyCaption {
                device_id: device_id.clone(),
                caption_id: caption_id.clone(),
                text: entry.text.clone(),
                timestamp_ms: entry.created_wall_ms,
                duration_ms: entry
                    .modified
                    .duration_since(entry.created)
                    .as_millis() as i64,
            });
            entry.last_upsert = Some(now);
        }

        self.captions.retain(|_, entry| {
            entry.last_upsert.is_none()
                || now.duration_since(entry.modified) <= EVICT_AFTER_IDLE
        });

        ready
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }
}
