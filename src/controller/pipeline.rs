//! Encoded-recording pipeline: raw video + mixed audio in, MP4/WebM/MP3/FLV
//! out, to a file or to the RTMP client via appsink.
//!
//! Timing discipline: the first buffer (audio or video) pins
//! `start_time_ns`; every subsequent buffer's PTS is its wall-clock time
//! minus that origin. Audio queues are leaky downstream — in a live meeting
//! dropping the oldest audio beats stalling the encoder — while video queues
//! block on overrun.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

pub const AUDIO_FORMAT_PCM_S16_32K: &str =
    "audio/x-raw,format=S16LE,channels=1,rate=32000,layout=interleaved";
pub const AUDIO_FORMAT_F32_48K: &str =
    "audio/x-raw,format=F32LE,channels=1,rate=48000,layout=interleaved";

/// Default video frame duration when the platform gives no spacing: 33 ms
/// (30 fps).
const DEFAULT_FRAME_DURATION_NS: u64 = 33 * 1_000_000;

/// How long cleanup waits for EOS to drain before forcing the pipeline down.
const EOS_WAIT_SECONDS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Mp4,
    Webm,
    Flv,
    Mp3,
}

pub enum SinkType {
    File(PathBuf),
    /// Encoded bytes are handed to this callback as they are muxed.
    AppSink(Arc<dyn Fn(&[u8]) + Send + Sync>),
}

pub struct PipelineSettings {
    pub video_frame_size: (u32, u32),
    pub audio_caps: &'static str,
    pub output_format: OutputFormat,
    pub sink: SinkType,
}

struct Elements {
    pipeline: gst::Pipeline,
    video_src: Option<gst_app::AppSrc>,
    audio_src: gst_app::AppSrc,
}

pub struct MediaPipeline {
    settings: PipelineSettings,
    elements: Mutex<Option<Elements>>,
    recording_active: AtomicBool,
    /// Nanoseconds since the epoch of the first pushed buffer; 0 = unset.
    start_time_ns: AtomicI64,
    queue_drops: Arc<Mutex<HashMap<String, u64>>>,
    last_reported_drops: Mutex<HashMap<String, u64>>,
}

impl MediaPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            elements: Mutex::new(None),
            recording_active: AtomicBool::new(false),
            start_time_ns: AtomicI64::new(0),
            queue_drops: Arc::new(Mutex::new(HashMap::new())),
            last_reported_drops: Mutex::new(HashMap::new()),
        }
    }

    fn pipeline_description(&self) -> Result<String> {
        let muxer = match self.settings.output_format {
            OutputFormat::Mp4 => "mp4mux name=muxer",
            OutputFormat::Flv => "h264parse ! flvmux name=muxer streamable=true",
            OutputFormat::Webm => "h264parse ! matroskamux name=muxer",
            OutputFormat::Mp3 => "",
        };

        let sink = match &self.settings.sink {
            SinkType::AppSink(_) => {
                "appsink name=sink emit-signals=true sync=false drop=false ".to_string()
            }
            SinkType::File(path) => format!(
                "filesink location={} name=sink sync=false ",
                path.to_str()
                    .ok_or_else(|| anyhow!("recording path is not valid UTF-8"))?
            ),
        };

        let audio_source = concat!(
            "appsrc name=audio_source do-timestamp=false stream-type=0 format=time ! ",
            "queue name=q5 leaky=downstream max-size-buffers=1000000 max-size-bytes=100000000 max-size-time=0 ! ",
            "audioconvert ! ",
            "audiorate ! ",
            "queue name=q6 leaky=downstream max-size-buffers=1000000 max-size-bytes=100000000 max-size-time=0 ! ",
        );

        let description = if self.settings.output_format == OutputFormat::Mp3 {
            format!("{audio_source}lamemp3enc bitrate=128 ! {sink}")
        } else {
            format!(
                concat!(
                    "appsrc name=video_source do-timestamp=false stream-type=0 format=time ! ",
                    "queue name=q1 max-size-buffers=1000 max-size-bytes=100000000 max-size-time=0 ! ",
                    "videoconvert ! ",
                    "videorate ! ",
                    "queue name=q2 max-size-buffers=5000 max-size-bytes=500000000 max-size-time=0 ! ",
                    "x264enc tune=zerolatency speed-preset=ultrafast ! ",
                    "queue name=q3 max-size-buffers=1000 max-size-bytes=100000000 max-size-time=0 ! ",
                    "{muxer} ! queue name=q4 ! {sink} ",
                    "{audio_source} ",
                    "voaacenc bitrate=128000 ! ",
                    "queue name=q7 leaky=downstream max-size-buffers=1000000 max-size-bytes=100000000 max-size-time=0 ! ",
                    "muxer. "
                ),
                muxer = muxer,
                sink = sink,
                audio_source = audio_source,
            )
        };
        Ok(description)
    }

    pub fn setup(&self) -> Result<()> {
        gst::init().context("failed to initialize gstreamer")?;

        let description = self.pipeline_description()?;
        tracing::debug!(%description, "building media pipeline");
        let pipeline = gst::parse::launch(&description)
            .context("failed to parse pipeline description")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("parsed element is not a pipeline"))?;

        let video_src = if self.settings.output_format == OutputFormat::Mp3 {
            None
        } else {
            let appsrc = pipeline
                .by_name("video_source")
                .ok_or_else(|| anyhow!("video_source element missing"))?
                .downcast::<gst_app::AppSrc>()
                .map_err(|_| anyhow!("video_source is not an appsrc"))?;
            let (width, height) = self.settings.video_frame_size;
            let caps = format!(
                "video/x-raw,format=I420,width={width},height={height},framerate=30/1"
            )
            .parse::<gst::Caps>()
            .map_err(|_| anyhow!("invalid video caps"))?;
            appsrc.set_caps(Some(&caps));
            appsrc.set_format(gst::Format::Time);
            appsrc.set_property("is-live", true);
            appsrc.set_property("do-timestamp", false);
            appsrc.set_stream_type(gst_app::AppStreamType::Stream);
            // Blocking on overrun keeps video and audio in lockstep.
            appsrc.set_block(true);
            Some(appsrc)
        };

        let audio_src = pipeline
            .by_name("audio_source")
            .ok_or_else(|| anyhow!("audio_source element missing"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| anyhow!("audio_source is not an appsrc"))?;
        let audio_caps = self
            .settings
            .audio_caps
            .parse::<gst::Caps>()
            .map_err(|_| anyhow!("invalid audio caps"))?;
        audio_src.set_caps(Some(&audio_caps));
        audio_src.set_format(gst::Format::Time);
        audio_src.set_property("is-live", true);
        audio_src.set_property("do-timestamp", false);
        audio_src.set_stream_type(gst_app::AppStreamType::Stream);
        audio_src.set_block(true);

        if let SinkType::AppSink(callback) = &self.settings.sink {
            let sink = pipeline
                .by_name("sink")
                .ok_or_else(|| anyhow!("sink element missing"))?
                .downcast::<gst_app::AppSink>()
                .map_err(|_| anyhow!("sink is not an appsink"))?;
            let callback = Arc::clone(callback);
            sink.set_callbacks(
                gst_app::AppSinkCallbacks::builder()
                    .new_sample(move |sink| {
                        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                        let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                        let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                        callback(map.as_slice());
                        Ok(gst::FlowSuccess::Ok)
                    })
                    .build(),
            );
        }

        // Count drops on every queue so the stats tick can report them.
        let mut iter = pipeline.iterate_elements();
        while let Ok(Some(element)) = iter.next() {
            let is_queue = element
                .factory()
                .map(|factory| factory.name() == "queue")
                .unwrap_or(false);
            if !is_queue {
                continue;
            }
            let queue_name = element.name().to_string();
            self.queue_drops
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(queue_name.clone(), 0);
            let drops = Arc::clone(&self.queue_drops);
            element.connect("overrun", false, move |_| {
                let mut drops = drops.lock().unwrap_or_else(|e| e.into_inner());
                *drops.entry(queue_name.clone()).or_insert(0) += 1;
                None
            });
        }

        pipeline
            .set_state(gst::State::Playing)
            .context("failed to start pipeline")?;

        *self.elements.lock().unwrap_or_else(|e| e.into_inner()) = Some(Elements {
            pipeline,
            video_src,
            audio_src,
        });
        self.recording_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn start_time_ns(&self) -> Option<i64> {
        match self.start_time_ns.load(Ordering::SeqCst) {
            0 => None,
            ns => Some(ns),
        }
    }

    fn pts_for(&self, current_time_ns: i64) -> u64 {
        // Pin the origin on the first buffer.
        let _ = self.start_time_ns.compare_exchange(
            0,
            current_time_ns,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let start = self.start_time_ns.load(Ordering::SeqCst);
        (current_time_ns - start).max(0) as u64
    }

    pub fn wants_any_video_frames(&self) -> bool {
        if !self.recording_active.load(Ordering::SeqCst) {
            return false;
        }
        self.elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|e| e.video_src.is_some())
    }

    /// Push one raw I420 frame stamped at `current_time_ns` (wall clock).
    pub fn on_new_video_frame(&self, frame: Vec<u8>, current_time_ns: i64) {
        if !self.recording_active.load(Ordering::SeqCst) {
            return;
        }
        let elements = self.elements.lock().unwrap_or_else(|e| e.into_inner());
        let Some(video_src) = elements.as_ref().and_then(|e| e.video_src.as_ref()) else {
            return;
        };

        let pts = self.pts_for(current_time_ns);
        let mut buffer = gst::Buffer::from_mut_slice(frame);
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(DEFAULT_FRAME_DURATION_NS));
        }
        if let Err(e) = video_src.push_buffer(buffer) {
            tracing::info!("failed to push video buffer to pipeline: {e:?}");
        }
    }

    /// Push mixed-audio PCM. `timestamp_ns` defaults to now, on the same
    /// clock as the video path.
    pub fn on_mixed_audio_chunk(&self, pcm: Vec<u8>, timestamp_ns: Option<i64>) {
        if !self.recording_active.load(Ordering::SeqCst) {
            return;
        }
        let elements = self.elements.lock().unwrap_or_else(|e| e.into_inner());
        let Some(audio_src) = elements.as_ref().map(|e| &e.audio_src) else {
            return;
        };

        let current_time_ns =
            timestamp_ns.unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let pts = self.pts_for(current_time_ns);
        let mut buffer = gst::Buffer::from_mut_slice(pcm);
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
        }
        if let Err(e) = audio_src.push_buffer(buffer) {
            tracing::info!("failed to push audio buffer to pipeline: {e:?}");
        }
    }

    /// Report queue drops accumulated since the previous call. Invoked from
    /// the supervisor's 15-second stats tick.
    pub fn report_queue_stats(&self) {
        if !self.recording_active.load(Ordering::SeqCst) {
            return;
        }
        let drops = self.queue_drops.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self
            .last_reported_drops
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (queue_name, &count) in drops.iter() {
            let previous = last.get(queue_name).copied().unwrap_or(0);
            if count > previous {
                tracing::info!(queue = %queue_name, dropped = count - previous, "pipeline queue dropped buffers");
            }
            last.insert(queue_name.clone(), count);
        }

        // Surface any pending bus errors while we're here.
        let elements = self.elements.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bus) = elements.as_ref().and_then(|e| e.pipeline.bus()) {
            while let Some(message) =
                bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning])
            {
                if let gst::MessageView::Error(err) = message.view() {
                    tracing::warn!(
                        source = ?err.src().map(|s| s.name()),
                        "gstreamer error: {} ({:?})",
                        err.error(),
                        err.debug()
                    );
                }
            }
        }
    }

    /// Send EOS on every source, wait for it to drain (bounded), and take
    /// the pipeline to NULL. Idempotent.
    pub fn cleanup(&self) {
        if !self.recording_active.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down media pipeline");

        let Some(elements) = self
            .elements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        if let Some(video_src) = &elements.video_src {
            let _ = video_src.end_of_stream();
        }
        let _ = elements.audio_src.end_of_stream();

        if let Some(bus) = elements.pipeline.bus() {
            let message = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(EOS_WAIT_SECONDS),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            match message.as_ref().map(|m| m.view()) {
                Some(gst::MessageView::Error(err)) => {
                    tracing::warn!("error during pipeline shutdown: {}", err.error());
                }
                Some(_) => {}
                None => tracing::warn!("timed out waiting for pipeline EOS"),
            }
        }

        if let Err(e) = elements.pipeline.set_state(gst::State::Null) {
            tracing::warn!("failed to stop pipeline: {e:?}");
        }
        tracing::info!("media pipeline shut down");
    }
}
