//! X-display + audio capture for the browser-based adapters.
//!
//! The headless browser composites the meeting; this records it with an
//! ffmpeg child. Pause works by muting the default sink and covering the
//! screen with a black terminal, so the encoder keeps running and timestamps
//! stay continuous.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

/// Files larger than this skip the faststart remux.
const FASTSTART_MAX_BYTES: u64 = 3 * 1024 * 1024 * 1024;

pub struct ScreenAndAudioRecorder {
    file_location: PathBuf,
    /// The X screen is slightly larger than the recording; we crop a
    /// 10-pixel border off the capture.
    screen_dimensions: (u32, u32),
    recording_dimensions: (u32, u32),
    audio_only: bool,
    state: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    ffmpeg: Option<Child>,
    overlay: Option<Child>,
    paused: bool,
}

impl ScreenAndAudioRecorder {
    pub fn new(file_location: PathBuf, recording_dimensions: (u32, u32), audio_only: bool) -> Self {
        Self {
            file_location,
            screen_dimensions: (recording_dimensions.0 + 10, recording_dimensions.1 + 10),
            recording_dimensions,
            audio_only,
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn start_recording(&self, display: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.ffmpeg.is_some() {
            return Ok(());
        }

        let file = self
            .file_location
            .to_str()
            .ok_or_else(|| anyhow!("recording path is not valid UTF-8"))?;

        let mut cmd = Command::new("ffmpeg");
        if self.audio_only {
            cmd.args([
                "-y",
                "-thread_queue_size",
                "4096",
                "-f",
                "alsa",
                "-i",
                "default",
                "-c:a",
                "libmp3lame",
                "-b:a",
                "192k",
                "-ar",
                "44100",
                "-ac",
                "1",
                file,
            ]);
        } else {
            let (sw, sh) = self.screen_dimensions;
            let (rw, rh) = self.recording_dimensions;
            cmd.args([
                "-y",
                "-thread_queue_size",
                "4096",
                "-framerate",
                "30",
                "-video_size",
                &format!("{sw}x{sh}"),
                "-f",
                "x11grab",
                "-draw_mouse",
                "0",
                "-probesize",
                "32",
                "-i",
                display,
                "-thread_queue_size",
                "4096",
                "-f",
                "alsa",
                "-i",
                "default",
                "-vf",
                &format!("crop={rw}:{rh}:10:10"),
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-pix_fmt",
                "yuv420p",
                "-g",
                "30",
                "-c:a",
                "aac",
                "-strict",
                "experimental",
                "-b:a",
                "128k",
                file,
            ]);
        }

        tracing::info!(x_display = %display, path = %self.file_location.display(), "starting screen recorder");
        let child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg screen recorder")?;
        state.ffmpeg = Some(child);
        Ok(())
    }

    /// Mute the default sink and cover the display with a black terminal.
    pub fn pause_recording(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.paused {
            return Ok(());
        }
        let (sw, sh) = self.screen_dimensions;
        let overlay = Command::new("xterm")
            .args([
                "-bg",
                "black",
                "-fg",
                "black",
                "-geometry",
                &format!("{sw}x{sh}+0+0"),
                "-xrm",
                "*borderWidth:0",
                "-xrm",
                "*scrollBar:false",
            ])
            .spawn()
            .context("failed to spawn pause overlay")?;
        let mute = Command::new("pactl")
            .args(["set-sink-mute", "@DEFAULT_SINK@", "1"])
            .status()
            .context("failed to mute default sink")?;
        if !mute.success() {
            return Err(anyhow!("pactl mute exited with {mute}"));
        }
        state.overlay = Some(overlay);
        state.paused = true;
        Ok(())
    }

    pub fn resume_recording(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.paused {
            return Ok(());
        }
        if let Some(mut overlay) = state.overlay.take() {
            let _ = overlay.kill();
            let _ = overlay.wait();
        }
        let unmute = Command::new("pactl")
            .args(["set-sink-mute", "@DEFAULT_SINK@", "0"])
            .status()
            .context("failed to unmute default sink")?;
        if !unmute.success() {
            return Err(anyhow!("pactl unmute exited with {unmute}"));
        }
        state.paused = false;
        Ok(())
    }

    pub fn stop_recording(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut child) = state.ffmpeg.take() else {
            return;
        };
        // SIGTERM lets ffmpeg finalize the container.
        let pid = child.id().to_string();
        let _ = Command::new("kill").args(["-TERM", pid.as_str()]).status();
        let _ = child.wait();
        tracing::info!(path = %self.file_location.display(), "stopped screen recorder");
    }

    /// Finalize the recording file: ensure it exists, and for reasonably
    /// sized video files move the moov atom to the front so the upload is
    /// immediately seekable.
    pub fn cleanup(&self) -> Result<()> {
        if !self.file_location.exists() {
            tracing::info!(
                path = %self.file_location.display(),
                "recording file missing, creating empty file"
            );
            std::fs::write(&self.file_location, b"")
                .context("failed to create empty recording file")?;
            return Ok(());
        }

        if self.audio_only {
            return Ok(());
        }

        let size = std::fs::metadata(&self.file_location)
            .context("failed to stat recording file")?
            .len();
        if size > FASTSTART_MAX_BYTES {
            tracing::info!(size, "recording exceeds faststart limit, skipping remux");
            return Ok(());
        }

        let seekable = seekable_path(&self.file_location);
        self.make_file_seekable(&seekable)?;
        Ok(())
    }

    fn make_file_seekable(&self, tempfile_path: &Path) -> Result<()> {
        tracing::info!(
            input = %self.file_location.display(),
            output = %tempfile_path.display(),
            "remuxing recording with faststart"
        );
        let status = Command::new("ffmpeg")
            .args([
                "-i",
                self.file_location
                    .to_str()
                    .ok_or_else(|| anyhow!("recording path is not valid UTF-8"))?,
                "-c",
                "copy",
                "-avoid_negative_ts",
                "make_zero",
                "-movflags",
                "+faststart",
                "-y",
                tempfile_path
                    .to_str()
                    .ok_or_else(|| anyhow!("temp path is not valid UTF-8"))?,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to run ffmpeg remux")?;
        if !status.success() {
            return Err(anyhow!("ffmpeg faststart remux exited with {status}"));
        }
        std::fs::rename(tempfile_path, &self.file_location)
            .context("failed to replace recording with seekable version")?;
        Ok(())
    }
}

/// `/tmp/file.mp4` -> `/tmp/file.seekable.mp4`
fn seekable_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recording");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("mp4");
    path.with_file_name(format!("{stem}.seekable.{ext}"))
}
