//! Per-participant audio ingest.
//!
//! Two modes share the same input (speaker-attributed PCM chunks from the
//! adapter). Batch mode accumulates per-speaker segments and closes them
//! after a silence gap, producing utterance rows for the async transcription
//! worker. Streaming mode forwards speech to a per-speaker streaming
//! transcriber, created lazily on the first non-silent chunk and torn down
//! on prolonged silence or when too many sessions are open.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use anyhow::Result;
use earshot::{VoiceActivityDetector, VoiceActivityProfile};

use crate::adapters::AudioChunk;
use crate::media::audio;
use crate::transcription::StreamingTranscriber;

/// Speaker pause that closes a batch segment.
const UTTERANCE_GAP: Duration = Duration::from_millis(2000);

/// A streaming transcriber with no speech for this long is finished.
const STREAMING_SILENCE_LIMIT: Duration = Duration::from_secs(10);

/// Cap on concurrently open streaming sessions.
const MAX_STREAMING_TRANSCRIBERS: usize = 4;

/// RMS floor below which a chunk is silence outright.
const SILENCE_RMS_THRESHOLD: f64 = 0.0025;

/// A closed speech segment ready to become an utterance row.
#[derive(Debug)]
pub struct FinishedSegment {
    pub participant_uuid: String,
    pub timestamp_ms: i64,
    pub pcm: Vec<u8>,
}

struct OpenSegment {
    first_timestamp_ms: i64,
    pcm: Vec<u8>,
    last_chunk_at: Instant,
}

/// Batch (non-realtime) ingest: chunks in, closed segments out.
pub struct ParticipantAudioBatcher {
    chunks: Receiver<AudioChunk>,
    segments: HashMap<String, OpenSegment>,
}

impl ParticipantAudioBatcher {
    pub fn new(chunks: Receiver<AudioChunk>) -> Self {
        Self {
            chunks,
            segments: HashMap::new(),
        }
    }

    /// Drain pending chunks and close any segment whose speaker has gone
    /// quiet. Called on every supervisor tick.
    pub fn process_chunks(&mut self, now: Instant) -> Vec<FinishedSegment> {
        while let Ok(chunk) = self.chunks.try_recv() {
            let segment = self
                .segments
                .entry(chunk.participant_uuid.clone())
                .or_insert_with(|| OpenSegment {
                    first_timestamp_ms: chunk.timestamp_ms,
                    pcm: Vec::new(),
                    last_chunk_at: now,
                });
            segment.pcm.extend_from_slice(&chunk.pcm);
            segment.last_chunk_at = now;
        }

        let mut finished = Vec::new();
        let quiet: Vec<String> = self
            .segments
            .iter()
            .filter(|(_, segment)| now.duration_since(segment.last_chunk_at) > UTTERANCE_GAP)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in quiet {
            if let Some(segment) = self.segments.remove(&uuid) {
                if !segment.pcm.is_empty() {
                    finished.push(FinishedSegment {
                        participant_uuid: uuid,
                        timestamp_ms: segment.first_timestamp_ms,
                        pcm: segment.pcm,
                    });
                }
            }
        }
        finished
    }

    /// Close every open segment (meeting ended).
    pub fn flush(&mut self) -> Vec<FinishedSegment> {
        // Drain anything still queued first.
        while let Ok(chunk) = self.chunks.try_recv() {
            let segment = self
                .segments
                .entry(chunk.participant_uuid.clone())
                .or_insert_with(|| OpenSegment {
                    first_timestamp_ms: chunk.timestamp_ms,
                    pcm: Vec::new(),
                    last_chunk_at: Instant::now(),
                });
            segment.pcm.extend_from_slice(&chunk.pcm);
        }
        self.segments
            .drain()
            .filter(|(_, segment)| !segment.pcm.is_empty())
            .map(|(uuid, segment)| FinishedSegment {
                participant_uuid: uuid,
                timestamp_ms: segment.first_timestamp_ms,
                pcm: segment.pcm,
            })
            .collect()
    }
}

/// The dual silence test: quiet by RMS, or no speech according to the VAD.
pub struct SilenceDetector {
    vad: VoiceActivityDetector,
    sample_rate: u32,
}

impl SilenceDetector {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            vad: VoiceActivityDetector::new(VoiceActivityProfile::VERY_AGGRESSIVE),
            sample_rate,
        }
    }

    pub fn is_silent(&mut self, pcm: &[u8]) -> bool {
        if audio::normalized_rms(pcm) < SILENCE_RMS_THRESHOLD {
            return true;
        }
        !self.vad_detects_speech(pcm)
    }

    fn vad_detects_speech(&mut self, pcm: &[u8]) -> bool {
        // The detector runs at 16 kHz; meeting audio arrives at 32/48 kHz.
        let samples = audio::samples_from_pcm(pcm);
        let samples = audio::resample(&samples, self.sample_rate, 16000);

        // 15 ms frames; partial tails are skipped, majority vote wins.
        const FRAME: usize = 240;
        let mut speech_frames = 0usize;
        let mut total_frames = 0usize;
        for chunk in samples.chunks_exact(FRAME) {
            if self.vad.predict_16khz(chunk).unwrap_or(true) {
                speech_frames += 1;
            }
            total_frames += 1;
        }
        // Too short to classify: trust the RMS gate alone.
        total_frames == 0 || speech_frames * 2 >= total_frames
    }
}

type TranscriberBuilder =
    Box<dyn Fn(&str) -> Result<Box<dyn StreamingTranscriber>> + Send + Sync>;

struct StreamingSession {
    transcriber: Box<dyn StreamingTranscriber>,
    last_send: Instant,
    last_nonsilent: Instant,
}

/// Streaming ingest: VAD-gated fan-out to per-speaker transcribers.
pub struct StreamingAudioIngest {
    silence: Box<dyn FnMut(&[u8]) -> bool + Send>,
    build_transcriber: TranscriberBuilder,
    sessions: HashMap<String, StreamingSession>,
}

impl StreamingAudioIngest {
    pub fn new(sample_rate: u32, build_transcriber: TranscriberBuilder) -> Self {
        let mut detector = SilenceDetector::new(sample_rate);
        Self {
            silence: Box::new(move |pcm| detector.is_silent(pcm)),
            build_transcriber,
            sessions: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_silence_fn(
        silence: Box<dyn FnMut(&[u8]) -> bool + Send>,
        build_transcriber: TranscriberBuilder,
    ) -> Self {
        Self {
            silence,
            build_transcriber,
            sessions: HashMap::new(),
        }
    }

    pub fn add_chunk(&mut self, speaker_id: &str, pcm: &[u8], now: Instant) {
        let is_silent = (self.silence)(pcm);

        // Silent audio only flows into an already-open session (it carries
        // the trailing context the vendor needs to finalize a phrase).
        if is_silent && !self.sessions.contains_key(speaker_id) {
            return;
        }

        if !self.sessions.contains_key(speaker_id) {
            match (self.build_transcriber)(speaker_id) {
                Ok(transcriber) => {
                    tracing::info!(%speaker_id, "opening streaming transcriber");
                    self.sessions.insert(
                        speaker_id.to_string(),
                        StreamingSession {
                            transcriber,
                            last_send: now,
                            last_nonsilent: now,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(%speaker_id, "failed to open streaming transcriber: {e}");
                    return;
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(speaker_id) {
            session.transcriber.send(pcm);
            session.last_send = now;
            if !is_silent {
                session.last_nonsilent = now;
            }
        }
    }

    /// Close sessions that have been silent too long, and enforce the cap
    /// by finishing the least-recently-used session.
    pub fn monitor(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                now.duration_since(session.last_nonsilent) > STREAMING_SILENCE_LIMIT
            })
            .map(|(speaker, _)| speaker.clone())
            .collect();
        for speaker in expired {
            if let Some(session) = self.sessions.remove(&speaker) {
                tracing::info!(%speaker, "closing streaming transcriber after silence");
                session.transcriber.finish();
            }
        }

        while self.sessions.len() > MAX_STREAMING_TRANSCRIBERS {
            let Some(oldest) = self
                .sessions
                .iter()
                .min_by_key(|(_, session)| session.last_send)
                .map(|(speaker, _)| speaker.clone())
            else {
                break;
            };
            if let Some(session) = self.sessions.remove(&oldest) {
                tracing::info!(speaker = %oldest, "closing least-recently-used streaming transcriber");
                session.transcriber.finish();
            }
        }
    }

    /// Finish every open session (meeting ended).
    pub fn finish_all(&mut self) {
        for (speaker, session) in self.sessions.drain() {
            tracing::info!(%speaker, "closing streaming transcriber");
            session.transcriber.finish();
        }
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::test_support::RecordingStreamingTranscriber;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn chunk(uuid: &str, timestamp_ms: i64, len: usize) -> AudioChunk {
        AudioChunk {
            participant_uuid: uuid.into(),
            timestamp_ms,
            pcm: vec![1u8; len],
        }
    }

    #[test]
    fn batch_segments_close_after_silence_gap() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut batcher = ParticipantAudioBatcher::new(rx);
        let start = Instant::now();

        tx.send(chunk("alice", 1000, 640)).unwrap();
        tx.send(chunk("alice", 1020, 640)).unwrap();
        assert!(batcher.process_chunks(start).is_empty());

        // The speaker goes quiet past the gap: the segment closes.
        let finished = batcher.process_chunks(start + UTTERANCE_GAP + Duration::from_millis(1));
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].participant_uuid, "alice");
        assert_eq!(finished[0].timestamp_ms, 1000);
        assert_eq!(finished[0].pcm.len(), 1280);
    }

    #[test]
    fn batch_flush_closes_everything() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut batcher = ParticipantAudioBatcher::new(rx);
        tx.send(chunk("alice", 0, 64)).unwrap();
        tx.send(chunk("bob", 5, 64)).unwrap();

        let mut finished = batcher.flush();
        finished.sort_by(|a, b| a.participant_uuid.cmp(&b.participant_uuid));
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].participant_uuid, "alice");
        assert_eq!(finished[1].participant_uuid, "bob");
    }

    #[test]
    fn zero_pcm_is_silent_by_rms() {
        let mut detector = SilenceDetector::new(48000);
        assert!(detector.is_silent(&vec![0u8; 1440 * 2]));
    }

    struct Harness {
        ingest: StreamingAudioIngest,
        created: Arc<Mutex<Vec<(String, Arc<RecordingStreamingTranscriber>)>>>,
    }

    /// Chunks whose first byte is zero count as silent.
    fn harness() -> Harness {
        let created: Arc<Mutex<Vec<(String, Arc<RecordingStreamingTranscriber>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let created2 = Arc::clone(&created);
        let ingest = StreamingAudioIngest::with_silence_fn(
            Box::new(|pcm: &[u8]| pcm.first().copied().unwrap_or(0) == 0),
            Box::new(move |speaker| {
                let transcriber = Arc::new(RecordingStreamingTranscriber::default());
                created2
                    .lock()
                    .unwrap()
                    .push((speaker.to_string(), Arc::clone(&transcriber)));
                Ok(Box::new(transcriber))
            }),
        );
        Harness { ingest, created }
    }

    #[test]
    fn silent_chunks_do_not_open_sessions() {
        let mut h = harness();
        h.ingest.add_chunk("alice", &[0u8, 0, 0, 0], Instant::now());
        assert_eq!(h.ingest.open_session_count(), 0);
        assert!(h.created.lock().unwrap().is_empty());
    }

    #[test]
    fn speech_opens_a_session_and_silence_keeps_feeding_it() {
        let mut h = harness();
        let now = Instant::now();
        h.ingest.add_chunk("alice", &[1u8, 2, 3, 4], now);
        assert_eq!(h.ingest.open_session_count(), 1);
        // Trailing silence still flows into the open session.
        h.ingest.add_chunk("alice", &[0u8, 0, 0, 0], now);
        let created = h.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1.chunks.lock().unwrap().len(), 2);
    }

    #[test]
    fn prolonged_silence_finishes_the_session() {
        let mut h = harness();
        let now = Instant::now();
        h.ingest.add_chunk("alice", &[1u8, 2], now);
        h.ingest.monitor(now + STREAMING_SILENCE_LIMIT + Duration::from_secs(1));
        assert_eq!(h.ingest.open_session_count(), 0);
        assert!(h.created.lock().unwrap()[0].1.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn session_cap_evicts_least_recently_used() {
        let mut h = harness();
        let now = Instant::now();
        for (i, speaker) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            h.ingest
                .add_chunk(speaker, &[1u8, 2], now + Duration::from_millis(i as u64));
        }
        assert_eq!(h.ingest.open_session_count(), 5);
        h.ingest.monitor(now + Duration::from_secs(1));
        assert_eq!(h.ingest.open_session_count(), 4);

        // "a" was the least recently used and got finished.
        let created = h.created.lock().unwrap();
        let a = created.iter().find(|(name, _)| name == "a").unwrap();
        assert!(a.1.finished.load(Ordering::SeqCst));
        let b = created.iter().find(|(name, _)| name == "b").unwrap();
        assert!(!b.1.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn finish_all_closes_open_sessions() {
        let mut h = harness();
        let now = Instant::now();
        h.ingest.add_chunk("a", &[1u8, 2], now);
        h.ingest.add_chunk("b", &[1u8, 2], now);
        h.ingest.finish_all();
        assert_eq!(h.ingest.open_session_count(), 0);
        for (_, transcriber) in h.created.lock().unwrap().iter() {
            assert!(transcriber.finished.load(Ordering::SeqCst));
        }
    }
}
