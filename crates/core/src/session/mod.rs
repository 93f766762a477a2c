//! Session coordination.
//!
//! A [`Session`] owns at most one audio track (id 0) and one video track
//! (id 1) and drives them through their lifecycle:
//!
//! ```text
//! Idle -> Configuring -> Configured -> Starting -> Streaming -> Stopping -> Idle
//! ```
//!
//! Every configure/start/stop runs on the session's own sequential
//! [`Worker`], so two such operations never overlap. The `sync_*`
//! variants block until the worker has finished and return the error;
//! the plain variants return immediately and report through the
//! [`SessionCallback`] only. Callbacks are delivered on a second worker,
//! never on the caller's thread.
//!
//! While streaming, a timer on the session worker reports the aggregate
//! bitrate every [`StreamingConfig::bitrate_period`]. It reschedules
//! itself only while a track is streaming and reports 0 once when
//! streaming stops.

pub mod worker;

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::{MemoryProbeCache, ProbeCache};
use crate::config::StreamingConfig;
use crate::error::{Result, RtspError, StreamError, StreamErrorKind};
use crate::media::Codec;
use crate::protocol::sdp;
use crate::stream::{Encoder, MediaStream};
use crate::transport::SharedWriter;
pub use worker::Worker;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Track id of the audio track.
pub const AUDIO_TRACK: u8 = 0;
/// Track id of the video track.
pub const VIDEO_TRACK: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Configured,
    Starting,
    Streaming,
    Stopping,
}

/// Notifications from a session. Every method has an empty default.
pub trait SessionCallback: Send + Sync {
    /// Aggregate bitrate in bits per second.
    fn on_bitrate_update(&self, _bitrate: u64) {}

    /// A configure or start failed. `track` is `None` when the failure
    /// is not tied to one track.
    fn on_session_error(&self, _track: Option<u8>, _error: &StreamError) {}

    fn on_session_configured(&self) {}

    /// Every track of the session is streaming.
    fn on_session_started(&self) {}

    fn on_session_stopped(&self) {}
}

/// A snapshot of one track's transport state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub codec: Codec,
    pub ssrc: u32,
    pub local_ports: (u16, u16),
    pub destination_ports: Option<(u16, u16)>,
    pub streaming: bool,
}

struct Tracks {
    audio: Option<MediaStream>,
    video: Option<MediaStream>,
    origin: String,
    destination: String,
    ttl: u8,
    state: SessionState,
}

impl Tracks {
    fn get(&self, id: u8) -> Option<&MediaStream> {
        match id {
            AUDIO_TRACK => self.audio.as_ref(),
            VIDEO_TRACK => self.video.as_ref(),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: u8) -> Option<&mut MediaStream> {
        match id {
            AUDIO_TRACK => self.audio.as_mut(),
            VIDEO_TRACK => self.video.as_mut(),
            _ => None,
        }
    }

    fn is_streaming(&self) -> bool {
        self.audio.as_ref().is_some_and(MediaStream::is_streaming)
            || self.video.as_ref().is_some_and(MediaStream::is_streaming)
    }

    fn bitrate(&self) -> u64 {
        self.audio.as_ref().map_or(0, MediaStream::bitrate)
            + self.video.as_ref().map_or(0, MediaStream::bitrate)
    }
}

struct Inner {
    id: u64,
    tracks: Mutex<Tracks>,
    callback: Mutex<Option<Arc<dyn SessionCallback>>>,
    config: StreamingConfig,
    timestamp: u64,
    bitrate_epoch: AtomicU64,
    worker: Worker,
    notifier: Worker,
}

impl Inner {
    fn notify(&self, f: impl FnOnce(&dyn SessionCallback) + Send + 'static) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            self.notifier.post(move || f(callback.as_ref()));
        }
    }

    fn post_error(&self, track: Option<u8>, error: &RtspError) {
        let error = match error {
            RtspError::Stream { source, .. } => source.clone(),
            other => StreamError::new(other.stream_kind(), other.to_string()),
        };
        tracing::warn!(session_id = self.id, ?track, kind = %error.kind, error = %error.message, "session error");
        self.notify(move |cb| cb.on_session_error(track, &error));
    }

    fn configure(&self) -> Result<()> {
        let mut tracks = self.tracks.lock();
        let previous = tracks.state;
        tracks.state = SessionState::Configuring;
        for id in [AUDIO_TRACK, VIDEO_TRACK] {
            let Some(stream) = tracks.get_mut(id) else {
                continue;
            };
            if stream.is_streaming() {
                continue;
            }
            if let Err(e) = stream.configure() {
                tracks.state = if tracks.is_streaming() { previous } else { SessionState::Idle };
                drop(tracks);
                self.post_error(Some(id), &e);
                return Err(e);
            }
        }
        if !tracks.is_streaming() {
            tracks.state = SessionState::Configured;
        } else {
            tracks.state = previous;
        }
        drop(tracks);

        tracing::debug!(session_id = self.id, "session configured");
        self.notify(|cb| cb.on_session_configured());
        Ok(())
    }

    fn start_track(inner: &Arc<Inner>, id: u8) -> Result<()> {
        let mut tracks = inner.tracks.lock();
        let destination = tracks.destination.clone();
        let ttl = tracks.ttl;
        match tracks.get(id) {
            Some(stream) if !stream.is_streaming() => {}
            _ => return Ok(()),
        }

        let previous = tracks.state;
        tracks.state = SessionState::Starting;
        let result = resolve(id, &destination).and_then(|address| {
            let stream = tracks.get_mut(id).ok_or(RtspError::UnknownTrack(id))?;
            stream.set_time_to_live(ttl);
            stream.set_destination_address(address);
            if !stream.is_configured() {
                stream.configure()?;
            }
            stream.start()
        });
        if let Err(e) = result {
            tracks.state = if tracks.is_streaming() { SessionState::Streaming } else { previous };
            drop(tracks);
            inner.post_error(Some(id), &e);
            return Err(e);
        }

        let other = tracks.get(1 - id).map(MediaStream::is_streaming);
        tracks.state = SessionState::Streaming;
        drop(tracks);

        tracing::debug!(session_id = inner.id, track = id, %destination, "track started");
        if other.is_none_or(|streaming| streaming) {
            inner.notify(|cb| cb.on_session_started());
        }
        if other.is_none_or(|streaming| !streaming) {
            Self::schedule_bitrate(inner);
        }
        Ok(())
    }

    fn start(inner: &Arc<Inner>) -> Result<()> {
        Self::start_track(inner, VIDEO_TRACK)?;
        if let Err(e) = Self::start_track(inner, AUDIO_TRACK) {
            inner.stop_track(VIDEO_TRACK);
            return Err(e);
        }
        Ok(())
    }

    fn stop_track(&self, id: u8) {
        let mut tracks = self.tracks.lock();
        if let Some(stream) = tracks.get_mut(id) {
            stream.stop();
        }
        if !tracks.is_streaming() && tracks.state == SessionState::Streaming {
            tracks.state = SessionState::Idle;
        }
    }

    fn stop(&self) {
        {
            let mut tracks = self.tracks.lock();
            tracks.state = SessionState::Stopping;
            for id in [AUDIO_TRACK, VIDEO_TRACK] {
                if let Some(stream) = tracks.get_mut(id) {
                    stream.stop();
                }
            }
            tracks.state = SessionState::Idle;
        }
        tracing::debug!(session_id = self.id, "session stopped");
        self.notify(|cb| cb.on_session_stopped());
    }

    fn schedule_bitrate(inner: &Arc<Inner>) {
        let epoch = inner.bitrate_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Self::post_bitrate_tick(inner, epoch);
    }

    fn post_bitrate_tick(inner: &Arc<Inner>, epoch: u64) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        inner.worker.post_delayed(inner.config.bitrate_period, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.bitrate_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let (streaming, bitrate) = {
                let tracks = inner.tracks.lock();
                (tracks.is_streaming(), tracks.bitrate())
            };
            if streaming {
                inner.notify(move |cb| cb.on_bitrate_update(bitrate));
                Self::post_bitrate_tick(&inner, epoch);
            } else {
                inner.notify(|cb| cb.on_bitrate_update(0));
            }
        });
    }
}

fn resolve(track: u8, destination: &str) -> Result<IpAddr> {
    if let Ok(ip) = destination.parse() {
        return Ok(ip);
    }
    let unknown = || {
        RtspError::stream(
            track,
            StreamError::new(StreamErrorKind::UnknownHost, format!("cannot resolve {destination}")),
        )
    };
    (destination, 0)
        .to_socket_addrs()
        .map_err(|_| unknown())?
        .next()
        .map(|a| a.ip())
        .ok_or_else(unknown)
}

/// Handle to a session. Clones share the same tracks and workers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Process-unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn SessionCallback>>) {
        *self.inner.callback.lock() = callback;
    }

    /// Address advertised in the SDP `o=` line.
    pub fn set_origin(&self, origin: impl Into<String>) {
        self.inner.tracks.lock().origin = origin.into();
    }

    pub fn origin(&self) -> String {
        self.inner.tracks.lock().origin.clone()
    }

    /// Destination host or address. Resolved when a track starts.
    pub fn set_destination(&self, destination: impl Into<String>) {
        self.inner.tracks.lock().destination = destination.into();
    }

    pub fn destination(&self) -> String {
        self.inner.tracks.lock().destination.clone()
    }

    pub fn set_time_to_live(&self, ttl: u8) {
        self.inner.tracks.lock().ttl = ttl;
    }

    pub fn state(&self) -> SessionState {
        self.inner.tracks.lock().state
    }

    pub fn track_exists(&self, id: u8) -> bool {
        self.inner.tracks.lock().get(id).is_some()
    }

    pub fn track_info(&self, id: u8) -> Option<TrackInfo> {
        let tracks = self.inner.tracks.lock();
        tracks.get(id).map(|s| TrackInfo {
            codec: s.codec(),
            ssrc: s.ssrc(),
            local_ports: s.local_ports(),
            destination_ports: s.destination_ports(),
            streaming: s.is_streaming(),
        })
    }

    pub fn set_destination_ports(&self, id: u8, rtp: u16, rtcp: u16) -> Result<()> {
        let mut tracks = self.inner.tracks.lock();
        let stream = tracks.get_mut(id).ok_or(RtspError::UnknownTrack(id))?;
        stream.set_destination_ports(rtp, rtcp);
        Ok(())
    }

    /// Deliver a track's RTP over an interleaved connection.
    pub fn set_output_stream(&self, id: u8, writer: SharedWriter, channel: u8) -> Result<()> {
        let mut tracks = self.inner.tracks.lock();
        let stream = tracks.get_mut(id).ok_or(RtspError::UnknownTrack(id))?;
        stream.set_output_stream(writer, channel);
        Ok(())
    }

    /// Sum of the tracks' bitrates in bits per second.
    pub fn bitrate(&self) -> u64 {
        self.inner.tracks.lock().bitrate()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.tracks.lock().is_streaming()
    }

    /// The full SDP. Every track must be configured.
    pub fn session_description(&self) -> Result<String> {
        let tracks = self.inner.tracks.lock();
        if tracks.audio.is_none() && tracks.video.is_none() {
            return Err(RtspError::InvalidState("session has no tracks"));
        }
        let mut sections = Vec::with_capacity(2);
        for id in [AUDIO_TRACK, VIDEO_TRACK] {
            if let Some(stream) = tracks.get(id) {
                sections.push((id, stream.session_description()?));
            }
        }
        Ok(sdp::session_description(
            &tracks.origin,
            &tracks.destination,
            self.inner.timestamp,
            &sections,
        ))
    }

    pub fn configure(&self) {
        let inner = self.inner.clone();
        self.inner.worker.post(move || {
            let _ = inner.configure();
        });
    }

    /// Configure every track that is not streaming.
    pub fn sync_configure(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.worker.run_sync(move || inner.configure())?
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        self.inner.worker.post(move || {
            let _ = Inner::start(&inner);
        });
    }

    /// Start video, then audio. Video is stopped again if audio fails.
    pub fn sync_start(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.worker.run_sync(move || Inner::start(&inner))?
    }

    /// Start one track. Unknown or already running tracks are left alone.
    pub fn sync_start_track(&self, id: u8) -> Result<()> {
        let inner = self.inner.clone();
        self.inner.worker.run_sync(move || Inner::start_track(&inner, id))?
    }

    pub fn stop(&self) {
        let inner = self.inner.clone();
        self.inner.worker.post(move || inner.stop());
    }

    /// Stop both tracks. Always succeeds.
    pub fn sync_stop(&self) {
        let inner = self.inner.clone();
        if self.inner.worker.run_sync(move || inner.stop()).is_err() {
            // Worker already gone: stop inline.
            self.inner.stop();
        }
    }

    /// Stop, drop the tracks and shut the workers down. The handle is
    /// unusable afterwards.
    pub fn release(&self) {
        let inner = self.inner.clone();
        let _ = self.inner.worker.run_sync(move || {
            let mut tracks = inner.tracks.lock();
            tracks.audio = None;
            tracks.video = None;
            tracks.state = SessionState::Idle;
        });
        self.inner.worker.quit();
        self.inner.notifier.quit();
        tracing::debug!(session_id = self.inner.id, "session released");
    }
}

/// Assembles a [`Session`].
pub struct SessionBuilder {
    config: StreamingConfig,
    origin: Option<String>,
    destination: Option<String>,
    ttl: Option<u8>,
    audio: Option<(Codec, Box<dyn Encoder>)>,
    video: Option<(Codec, Box<dyn Encoder>)>,
    streams: Vec<MediaStream>,
    cache: Option<Arc<dyn ProbeCache>>,
    callback: Option<Arc<dyn SessionCallback>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            config: StreamingConfig::default(),
            origin: None,
            destination: None,
            ttl: None,
            audio: None,
            video: None,
            streams: Vec::new(),
            cache: None,
            callback: None,
        }
    }
}

impl SessionBuilder {
    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn time_to_live(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn audio(mut self, codec: Codec, encoder: Box<dyn Encoder>) -> Self {
        self.audio = Some((codec, encoder));
        self
    }

    pub fn video(mut self, codec: Codec, encoder: Box<dyn Encoder>) -> Self {
        self.video = Some((codec, encoder));
        self
    }

    /// Use an already built stream. It lands on the track its codec
    /// belongs to.
    pub fn stream(mut self, stream: MediaStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn probe_cache(mut self, cache: Arc<dyn ProbeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn callback(mut self, callback: Arc<dyn SessionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn build(self) -> Result<Session> {
        let cache = self
            .cache
            .unwrap_or_else(|| MemoryProbeCache::shared() as Arc<dyn ProbeCache>);

        let mut audio = None;
        let mut video = None;
        if let Some((codec, encoder)) = self.audio {
            if codec.is_video() {
                return Err(RtspError::InvalidState("audio track needs an audio codec"));
            }
            audio = Some(MediaStream::new(codec, encoder, &self.config, cache.clone())?);
        }
        if let Some((codec, encoder)) = self.video {
            if !codec.is_video() {
                return Err(RtspError::InvalidState("video track needs a video codec"));
            }
            video = Some(MediaStream::new(codec, encoder, &self.config, cache.clone())?);
        }
        for stream in self.streams {
            if stream.codec().is_video() {
                video = Some(stream);
            } else {
                audio = Some(stream);
            }
        }

        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let worker = Worker::spawn(&format!("session-{id}"))?;
        let notifier = Worker::spawn(&format!("session-{id}-notify"))?;
        let tracks = Tracks {
            audio,
            video,
            origin: self.origin.unwrap_or_else(|| self.config.origin.clone()),
            destination: self
                .destination
                .unwrap_or_else(|| self.config.destination.clone()),
            ttl: self.ttl.unwrap_or(self.config.time_to_live),
            state: SessionState::Idle,
        };

        tracing::debug!(
            session_id = id,
            audio = ?tracks.audio.as_ref().map(MediaStream::codec),
            video = ?tracks.video.as_ref().map(MediaStream::codec),
            "session created"
        );

        Ok(Session {
            inner: Arc::new(Inner {
                id,
                tracks: Mutex::new(tracks),
                callback: Mutex::new(self.callback),
                config: self.config,
                timestamp: sdp::ntp_timestamp(),
                bitrate_epoch: AtomicU64::new(0),
                worker,
                notifier,
            }),
        })
    }
}
