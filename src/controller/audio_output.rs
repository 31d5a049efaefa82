//! Scheduled playback of one audio clip or TTS utterance at a time.
//!
//! The worker thread resolves the request to raw PCM (MP3 decode or speech
//! synthesis), then feeds fixed-size chunks to the adapter at the platform's
//! cadence. The supervisor polls [`AudioOutputManager::monitor`] on its tick
//! and finishes the request once the wall clock has passed the clip
//! duration, which is also what keeps "at most one playing" true: the next
//! enqueued request only starts after the monitor clears this one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::media::audio;
use crate::models::{MediaRequest, MediaRequestId};
use crate::transcription::SpeechSynthesizer;

/// What the monitor observed this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished(MediaRequestId),
    FailedToPlay(MediaRequestId),
}

struct CurrentPlayback {
    request_id: MediaRequestId,
    /// Set by the worker once the audio is resolved and playback started.
    started: Option<(Instant, i64)>,
    failed: bool,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

pub struct AudioOutputManager {
    play_raw_audio: Arc<dyn Fn(&[u8], u32) + Send + Sync>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    sample_rate: u32,
    chunk_interval: Duration,
    current: Arc<Mutex<Option<CurrentPlayback>>>,
    worker: Mutex<Option<Worker>>,
}

impl AudioOutputManager {
    pub fn new(
        play_raw_audio: Arc<dyn Fn(&[u8], u32) + Send + Sync>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        sample_rate: u32,
        chunk_interval: Duration,
    ) -> Self {
        Self {
            play_raw_audio,
            synthesizer,
            sample_rate,
            chunk_interval,
            current: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    /// Begin playing a request, preempting any playback still running.
    pub fn start_playing(&self, request: &MediaRequest) {
        self.stop_worker();

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(CurrentPlayback {
            request_id: request.id,
            started: None,
            failed: false,
        });

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let current = Arc::clone(&self.current);
            let play = Arc::clone(&self.play_raw_audio);
            let synthesizer = self.synthesizer.clone();
            let sample_rate = self.sample_rate;
            let chunk_interval = self.chunk_interval;
            let request = request.clone();

            std::thread::spawn(move || {
                let resolved = resolve_request_audio(&request, synthesizer.as_deref(), sample_rate);
                let (pcm, duration_ms) = match resolved {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        tracing::info!(request = %request.id, "could not resolve playback audio: {e}");
                        if let Some(current) =
                            current.lock().unwrap_or_else(|e| e.into_inner()).as_mut()
                        {
                            if current.request_id == request.id {
                                current.failed = true;
                            }
                        }
                        return;
                    }
                };

                if let Some(current) = current.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
                    if current.request_id != request.id {
                        return;
                    }
                    current.started = Some((Instant::now(), duration_ms));
                }

                // One chunk per push; the platform consumes it over
                // `chunk_interval`.
                let chunk_size = sample_rate as usize * audio::BYTES_PER_SAMPLE;
                for chunk in pcm.chunks(chunk_size) {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    play(chunk, sample_rate);
                    std::thread::sleep(chunk_interval);
                }
            })
        };

        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Worker { stop, handle });
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            let _ = worker.handle.join();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Tick: report a finished or failed playback, clearing it.
    pub fn monitor(&self) -> Option<PlaybackOutcome> {
        let outcome = {
            let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            let playback = current.as_ref()?;
            if playback.failed {
                Some(PlaybackOutcome::FailedToPlay(playback.request_id))
            } else {
                match playback.started {
                    Some((started_at, duration_ms))
                        if started_at.elapsed().as_millis() as i64 > duration_ms =>
                    {
                        Some(PlaybackOutcome::Finished(playback.request_id))
                    }
                    _ => None,
                }
            }
        }?;

        self.stop_worker();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Some(outcome)
    }

    /// Abandon any playback without reporting an outcome (cleanup path).
    pub fn stop(&self) {
        self.stop_worker();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Drop for AudioOutputManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Turn a media request into (pcm, duration_ms) at the playback rate.
fn resolve_request_audio(
    request: &MediaRequest,
    synthesizer: Option<&dyn SpeechSynthesizer>,
    sample_rate: u32,
) -> Result<(Vec<u8>, i64)> {
    if let Some(blob) = &request.media_blob {
        let pcm = audio::mp3_to_pcm(blob, sample_rate)?;
        let duration_ms = request
            .duration_ms
            .unwrap_or_else(|| audio::pcm_duration_ms(pcm.len(), sample_rate));
        return Ok((pcm, duration_ms));
    }

    if let Some(text) = &request.text_to_speak {
        let synthesizer =
            synthesizer.ok_or_else(|| anyhow!("no speech synthesizer configured"))?;
        let settings = request
            .text_to_speech_settings
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        let (raw, duration_ms) = synthesizer.synthesize(text, &settings, sample_rate)?;
        let pcm = audio::strip_wav_header(&raw).to_vec();
        return Ok((pcm, duration_ms));
    }

    Err(anyhow!("media request carries neither audio nor text"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::test_support::SilenceSynthesizer;
    use std::sync::atomic::AtomicUsize;

    fn audio_request(blob: Option<Vec<u8>>, text: Option<&str>) -> MediaRequest {
        MediaRequest {
            id: uuid::Uuid::new_v4(),
            bot_id: uuid::Uuid::new_v4(),
            kind: crate::models::MediaRequestKind::Audio,
            state: crate::models::MediaRequestState::Playing,
            media_blob: blob,
            duration_ms: None,
            text_to_speak: text.map(|t| t.to_string()),
            text_to_speech_settings: None,
            media_url: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn collector() -> (Arc<dyn Fn(&[u8], u32) + Send + Sync>, Arc<AtomicUsize>) {
        let played = Arc::new(AtomicUsize::new(0));
        let sink = {
            let played = Arc::clone(&played);
            Arc::new(move |chunk: &[u8], _rate: u32| {
                played.fetch_add(chunk.len(), Ordering::SeqCst);
            }) as Arc<dyn Fn(&[u8], u32) + Send + Sync>
        };
        (sink, played)
    }

    #[test]
    fn tts_request_plays_and_finishes() {
        let (sink, played) = collector();
        let manager = AudioOutputManager::new(
            sink,
            Some(Arc::new(SilenceSynthesizer { duration_ms: 40 })),
            8000,
            Duration::from_millis(5),
        );

        let request = audio_request(None, Some("hello"));
        manager.start_playing(&request);
        assert!(manager.is_playing());

        // Poll until the wall clock passes the clip duration.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(outcome) = manager.monitor() {
                assert_eq!(outcome, PlaybackOutcome::Finished(request.id));
                break;
            }
            assert!(Instant::now() < deadline, "playback never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!manager.is_playing());
        assert!(played.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn undecodable_blob_reports_failure() {
        let (sink, _played) = collector();
        let manager = AudioOutputManager::new(sink, None, 8000, Duration::from_millis(5));

        let request = audio_request(Some(vec![0u8; 32]), None);
        manager.start_playing(&request);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(outcome) = manager.monitor() {
                assert_eq!(outcome, PlaybackOutcome::FailedToPlay(request.id));
                break;
            }
            assert!(Instant::now() < deadline, "failure never reported");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn new_request_preempts_running_playback() {
        let (sink, _played) = collector();
        let manager = AudioOutputManager::new(
            sink,
            Some(Arc::new(SilenceSynthesizer { duration_ms: 10_000 })),
            8000,
            Duration::from_millis(5),
        );

        let first = audio_request(None, Some("first"));
        manager.start_playing(&first);
        let second = audio_request(None, Some("second"));
        manager.start_playing(&second);

        // Only the second request is tracked now.
        let current = manager.current.lock().unwrap();
        assert_eq!(current.as_ref().unwrap().request_id, second.id);
    }

    #[test]
    fn request_without_audio_or_text_fails() {
        let result = resolve_request_audio(&audio_request(None, None), None, 8000);
        assert!(result.is_err());
    }
}
