//! Encoders replaying elementary stream files in real time.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use streaming::media::aac::{AdtsHeader, SAMPLES_PER_FRAME};
use streaming::media::h264::extract_nal_units;
use streaming::media::{AacConfig, H264Params, Mp4Config};
use streaming::source::BufferSink;
use streaming::{
    CodecParams, EncodingMode, Encoder, MediaSource, StreamError, StreamErrorKind, buffer_channel,
};

const CHANNEL_DEPTH: usize = 16;

/// One encoded buffer and its offset from the start of the file.
struct Frame {
    data: Vec<u8>,
    pts_us: u64,
}

/// Plays `frames` into `sink` at their presentation times, looping until
/// stopped or until the consumer goes away.
fn spawn_feeder(
    name: &str,
    frames: Arc<Vec<Frame>>,
    period_us: u64,
    sink: BufferSink,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let start = Instant::now();
        let mut base_us = 0u64;
        while running.load(Ordering::SeqCst) {
            for frame in frames.iter() {
                let pts_us = base_us + frame.pts_us;
                let due = start + Duration::from_micros(pts_us);
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
                if !running.load(Ordering::SeqCst) || sink.push(frame.data.clone(), pts_us).is_err() {
                    tracing::debug!("feeder stopped");
                    return;
                }
            }
            base_us += frames.last().map_or(0, |f| f.pts_us) + period_us;
        }
    })
}

fn read_file(path: &PathBuf) -> Result<Vec<u8>, StreamError> {
    fs::read(path).map_err(|e| {
        StreamError::new(
            StreamErrorKind::StorageUnavailable,
            format!("{}: {e}", path.display()),
        )
    })
}

/// Common start/stop plumbing for the file encoders.
struct Feeder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Feeder {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn start(
        &mut self,
        name: &str,
        frames: Arc<Vec<Frame>>,
        period_us: u64,
    ) -> Result<Box<dyn MediaSource>, StreamError> {
        self.stop();
        let (sink, source) = buffer_channel(CHANNEL_DEPTH);
        self.running.store(true, Ordering::SeqCst);
        let thread = spawn_feeder(name, frames, period_us, sink, self.running.clone())?;
        self.thread = Some(thread);
        Ok(Box::new(source))
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("feeder thread panicked");
        }
    }
}

/// H.264 Annex B file, one NAL unit per buffer with its start code.
///
/// SPS and PPS come from the stream itself, or from the `avcC` box of a
/// sample recording made with the same encoder settings.
pub struct H264File {
    path: PathBuf,
    recording: Option<PathBuf>,
    fps: u32,
    frames: Arc<Vec<Frame>>,
    feeder: Feeder,
}

impl H264File {
    pub fn new(path: PathBuf, fps: u32) -> Self {
        Self {
            path,
            recording: None,
            fps: fps.max(1),
            frames: Arc::default(),
            feeder: Feeder::new(),
        }
    }

    /// Take the parameter sets from an MP4/3GP recording.
    pub fn with_recording(mut self, recording: Option<PathBuf>) -> Self {
        self.recording = recording;
        self
    }

    fn parameter_sets(&self, data: &[u8]) -> Result<H264Params, StreamError> {
        if let Some(recording) = &self.recording {
            let config = Mp4Config::from_file(recording).map_err(|e| {
                StreamError::new(
                    StreamErrorKind::ConfigurationNotSupported,
                    format!("{}: {e}", recording.display()),
                )
            })?;
            tracing::debug!(recording = %recording.display(), "parameter sets from recording");
            return Ok(config.into_params());
        }
        H264Params::from_annex_b(data).ok_or_else(|| {
            StreamError::new(
                StreamErrorKind::ConfigurationNotSupported,
                format!("{}: no SPS/PPS found", self.path.display()),
            )
        })
    }

    fn period_us(&self) -> u64 {
        1_000_000 / u64::from(self.fps)
    }
}

impl Encoder for H264File {
    fn configure(
        &mut self,
        _mode: EncodingMode,
        cached: Option<CodecParams>,
    ) -> Result<CodecParams, StreamError> {
        let data = read_file(&self.path)?;
        let params = match cached {
            Some(params) => params,
            None => CodecParams::H264(self.parameter_sets(&data)?),
        };

        let period = self.period_us();
        let mut pts_us = 0u64;
        let mut frames = Vec::new();
        for nal in extract_nal_units(&data) {
            let nal_type = nal.first().map_or(0, |h| h & 0x1f);
            let mut buf = Vec::with_capacity(nal.len() + 4);
            buf.extend_from_slice(&[0, 0, 0, 1]);
            buf.extend_from_slice(&nal);
            frames.push(Frame { data: buf, pts_us });
            // Picture boundary after each coded slice.
            if nal_type == 1 || nal_type == 5 {
                pts_us += period;
            }
        }
        tracing::info!(path = %self.path.display(), nal_units = frames.len(), fps = self.fps, "H.264 file loaded");
        self.frames = Arc::new(frames);
        Ok(params)
    }

    fn start(&mut self) -> Result<Box<dyn MediaSource>, StreamError> {
        let period = self.period_us();
        self.feeder.start("h264-file", self.frames.clone(), period)
    }

    fn stop(&mut self) {
        self.feeder.stop();
    }

    fn probe_key(&self) -> Option<String> {
        let recording = self.recording.as_ref().map(|r| r.display().to_string());
        Some(format!("{}@{}:{}", self.path.display(), self.fps, recording.unwrap_or_default()))
    }

    fn preferred_mode(&self, _suggested: EncodingMode) -> EncodingMode {
        EncodingMode::Buffered
    }
}

/// AAC ADTS file, one raw access unit per buffer.
pub struct AacFile {
    path: PathBuf,
    frames: Arc<Vec<Frame>>,
    period_us: u64,
    feeder: Feeder,
}

impl AacFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            frames: Arc::default(),
            period_us: 0,
            feeder: Feeder::new(),
        }
    }
}

impl Encoder for AacFile {
    fn configure(
        &mut self,
        _mode: EncodingMode,
        _cached: Option<CodecParams>,
    ) -> Result<CodecParams, StreamError> {
        let data = read_file(&self.path)?;
        let mut config: Option<AacConfig> = None;
        let mut frames = Vec::new();
        let mut pts_us = 0u64;
        let mut pos = 0usize;

        while let Some(raw) = data.get(pos..pos + 7) {
            let mut head = [0u8; 7];
            head.copy_from_slice(raw);
            let header = AdtsHeader::parse(&head).map_err(|e| {
                StreamError::new(
                    StreamErrorKind::ConfigurationNotSupported,
                    format!("{}: {e}", self.path.display()),
                )
            })?;
            let start = pos + header.header_len();
            let end = start + header.payload_len();
            let Some(unit) = data.get(start..end) else {
                break;
            };
            let frame_config = *config.get_or_insert(header.config());
            frames.push(Frame {
                data: unit.to_vec(),
                pts_us,
            });
            pts_us += SAMPLES_PER_FRAME * 1_000_000 / u64::from(frame_config.sample_rate().max(1));
            pos = end;
        }

        let config = config.ok_or_else(|| {
            StreamError::new(
                StreamErrorKind::ConfigurationNotSupported,
                format!("{}: no ADTS frames found", self.path.display()),
            )
        })?;
        self.period_us = SAMPLES_PER_FRAME * 1_000_000 / u64::from(config.sample_rate().max(1));
        tracing::info!(path = %self.path.display(), frames = frames.len(), rate = config.sample_rate(), "AAC file loaded");
        self.frames = Arc::new(frames);
        Ok(CodecParams::Aac(config))
    }

    fn start(&mut self) -> Result<Box<dyn MediaSource>, StreamError> {
        self.feeder.start("aac-file", self.frames.clone(), self.period_us)
    }

    fn stop(&mut self) {
        self.feeder.stop();
    }

    fn preferred_mode(&self, _suggested: EncodingMode) -> EncodingMode {
        EncodingMode::Buffered
    }
}
