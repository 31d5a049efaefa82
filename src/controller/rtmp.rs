//! RTMP egress: an ffmpeg child that copies our FLV stream to the endpoint.
//!
//! The encoder already produces FLV, so the child runs in copy mode and the
//! only failure signal we get is the pipe breaking. `write_data` latches
//! `is_running = false` on the first failed write; the supervisor turns that
//! into a fatal event.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

pub struct RtmpClient {
    rtmp_url: String,
    state: Mutex<RtmpState>,
}

struct RtmpState {
    child: Option<Child>,
    is_running: bool,
}

impl RtmpClient {
    pub fn new(rtmp_url: String) -> Self {
        Self {
            rtmp_url,
            state: Mutex::new(RtmpState {
                child: None,
                is_running: false,
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_running {
            return Ok(());
        }

        let child = Command::new("ffmpeg")
            .args([
                "-y",
                "-f",
                "flv",
                "-i",
                "pipe:0",
                "-c",
                "copy",
                "-f",
                "flv",
                &self.rtmp_url,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg for RTMP egress")?;

        tracing::info!(pid = child.id(), url = %self.rtmp_url, "RTMP client started");
        state.child = Some(child);
        state.is_running = true;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_running
    }

    /// Write FLV bytes to the stream. Returns false once the pipe is broken;
    /// after that every call is a cheap no-op returning false.
    pub fn write_data(&self, flv_data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.is_running {
            return false;
        }
        let Some(child) = state.child.as_mut() else {
            return false;
        };
        let Some(stdin) = child.stdin.as_mut() else {
            state.is_running = false;
            return false;
        };
        match stdin.write_all(flv_data).and_then(|_| stdin.flush()) {
            Ok(()) => true,
            Err(e) => {
                tracing::info!("RTMP pipe write failed: {e}");
                state.is_running = false;
                false
            }
        }
    }

    /// Close stdin, give the child a grace period, then kill it.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.is_running = false;

        let Some(mut child) = state.child.take() else {
            return;
        };
        // Dropping stdin sends EOF so ffmpeg can finish the stream.
        drop(child.stdin.take());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, "RTMP client exited");
                    return;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    tracing::warn!("error waiting for RTMP client: {e}");
                    break;
                }
            }
        }

        tracing::info!("RTMP client did not exit in time, killing");
        if let Err(e) = child.kill() {
            tracing::warn!("failed to kill RTMP client: {e}");
        }
        let _ = child.wait();
    }
}

impl Drop for RtmpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_before_start_fails() {
        let client = RtmpClient::new("rtmp://example.com/live/stream/1234".into());
        assert!(!client.is_running());
        assert!(!client.write_data(b"flv data"));
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let client = RtmpClient::new("rtmp://example.com/live/stream/1234".into());
        client.stop();
        assert!(!client.is_running());
    }
}
