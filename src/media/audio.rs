//! PCM and MP3 audio helpers.
//!
//! All PCM in this crate is signed 16-bit little-endian mono unless a
//! sample-rate or format parameter says otherwise.

use anyhow::{anyhow, Context, Result};
use mp3lame_encoder::{Builder as LameBuilder, FlushNoGap, MonoPcm};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Bytes per PCM sample (S16LE).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Interpret raw little-endian bytes as i16 samples. A trailing odd byte is
/// ignored.
pub fn samples_from_pcm(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm_from_samples(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampler.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    if out_len == 0 {
        return vec![];
    }
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let s0 = samples[idx.min(samples.len() - 1)] as f64;
        let s1 = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((s0 + frac * (s1 - s0)).round() as i16);
    }
    out
}

/// RMS of the chunk normalized to [0, 1] against 16-bit full scale.
pub fn normalized_rms(pcm: &[u8]) -> f64 {
    let samples = samples_from_pcm(pcm);
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() / 32768.0
}

/// Duration of a mono S16LE PCM buffer.
pub fn pcm_duration_ms(pcm_len: usize, sample_rate: u32) -> i64 {
    (pcm_len as i64 * 1000) / (sample_rate as i64 * BYTES_PER_SAMPLE as i64)
}

/// Decode MP3 bytes to mono S16LE PCM at `sample_rate`.
///
/// Multichannel input is downmixed by averaging; rate conversion uses the
/// linear resampler.
pub fn mp3_to_pcm(mp3: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let cursor = std::io::Cursor::new(mp3.to_vec());
    let stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("unrecognized mp3 data")?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("mp3 data contains no audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let src_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("mp3 track has no sample rate"))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1).max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("failed to create mp3 decoder")?;

    let mut mono: Vec<i16> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e).context("error reading mp3 packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Skip corrupt frames rather than failing the whole blob.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e).context("mp3 decode error"),
        };
        let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        for frame in buffer.samples().chunks_exact(channels) {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            mono.push((sum / channels as i64) as i16);
        }
    }

    if mono.is_empty() {
        return Err(anyhow!("mp3 data decoded to zero samples"));
    }

    Ok(pcm_from_samples(&resample(&mono, src_rate, sample_rate)))
}

/// Encode mono S16LE PCM to MP3 at 128 kbps.
pub fn pcm_to_mp3(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let samples = samples_from_pcm(pcm);

    let mut builder = LameBuilder::new().ok_or_else(|| anyhow!("failed to create LAME builder"))?;
    builder
        .set_num_channels(1)
        .map_err(|e| anyhow!("set channels error: {e:?}"))?;
    builder
        .set_sample_rate(sample_rate)
        .map_err(|e| anyhow!("set sample rate error: {e:?}"))?;
    builder
        .set_brate(mp3lame_encoder::Bitrate::Kbps128)
        .map_err(|e| anyhow!("set bitrate error: {e:?}"))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Best)
        .map_err(|e| anyhow!("set quality error: {e:?}"))?;
    let mut encoder = builder.build().map_err(|e| anyhow!("LAME build error: {e:?}"))?;

    let mut out = Vec::new();
    out.reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));
    encoder
        .encode_to_vec(MonoPcm(&samples), &mut out)
        .map_err(|e| anyhow!("mp3 encode error: {e:?}"))?;
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| anyhow!("mp3 flush error: {e:?}"))?;
    Ok(out)
}

/// Duration of an MP3 blob, by decoding it.
pub fn mp3_duration_ms(mp3: &[u8]) -> Result<i64> {
    // Decode at a fixed rate; duration is rate-independent.
    const PROBE_RATE: u32 = 32000;
    let pcm = mp3_to_pcm(mp3, PROBE_RATE)?;
    Ok(pcm_duration_ms(pcm.len(), PROBE_RATE))
}

/// Strip a RIFF/WAVE header if present, returning the raw sample data.
///
/// Speech-synthesis providers commonly return LINEAR16 WAV; playback needs
/// bare PCM. Walks the chunk list to the `data` chunk rather than assuming a
/// 44-byte header.
pub fn strip_wav_header(audio: &[u8]) -> &[u8] {
    if audio.len() < 12 || &audio[0..4] != b"RIFF" || &audio[8..12] != b"WAVE" {
        return audio;
    }
    let mut offset = 12;
    while offset + 8 <= audio.len() {
        let chunk_id = &audio[offset..offset + 4];
        let chunk_size = u32::from_le_bytes([
            audio[offset + 4],
            audio[offset + 5],
            audio[offset + 6],
            audio[offset + 7],
        ]) as usize;
        if chunk_id == b"data" {
            let start = offset + 8;
            let end = (start + chunk_size).min(audio.len());
            return &audio[start..end];
        }
        // Chunks are word-aligned.
        offset += 8 + chunk_size + (chunk_size & 1);
    }
    audio
}
