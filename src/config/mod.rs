//! Process-level configuration.
//!
//! Per-bot settings live on the Bot row; this is only what the worker
//! process itself needs from its environment.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub const WEBHOOK_USER_AGENT: &str = "meetbot-webhook/1.0";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Redis server carrying the per-bot command channels.
    pub redis_url: String,
    /// Root the uploader stores finished recordings under (a mounted bucket
    /// in production).
    pub storage_root: PathBuf,
    /// Platform bridge socket the adapters connect to.
    pub bridge_socket: PathBuf,
    /// Feature flag: append credit charges when bots terminate.
    pub charge_credits_when_bot_terminates: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let redis_url = lookup("REDIS_URL").context("REDIS_URL is not set")?;
        let storage_root = lookup("RECORDING_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/meetbot-storage"));
        let bridge_socket = lookup("PLATFORM_BRIDGE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/meetbot-bridge.sock"));
        let charge_credits_when_bot_terminates = lookup("CHARGE_CREDITS_WHEN_BOT_TERMINATES")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            redis_url,
            storage_root,
            bridge_socket,
            charge_credits_when_bot_terminates,
        })
    }
}
