//! A single audio or video track.
//!
//! [`MediaStream`] pairs an [`Encoder`] collaborator, which produces an
//! encoded bitstream, with a [`Packetizer`] that turns it into RTP. Codec
//! choice is a [`Codec`] value; the codec-specific behavior lives in the
//! payload format the packetizer runs.

use std::net::IpAddr;
use std::sync::Arc;

use crate::cache::ProbeCache;
use crate::config::{EncodingMode, StreamingConfig};
use crate::error::{Result, RtspError, StreamError};
use crate::media::{Codec, CodecParams, Packetizer, RtpPacketizer};
use crate::protocol::sdp;
use crate::source::{self, MediaSource};
use crate::transport::SharedWriter;

/// Capture and encoding collaborator for one track.
///
/// Implementations wrap whatever produces the elementary stream: a camera
/// and hardware encoder, a file replayed in real time, a test fixture.
pub trait Encoder: Send {
    /// Prepare to encode in `mode` and report the decoder parameters.
    ///
    /// `cached` holds the parameters recorded by a previous probe under
    /// [`probe_key`](Self::probe_key), if any. Implementations may return
    /// it instead of probing again.
    fn configure(
        &mut self,
        mode: EncodingMode,
        cached: Option<CodecParams>,
    ) -> std::result::Result<CodecParams, StreamError>;

    /// Start encoding and hand over the output.
    ///
    /// The source is closed before [`stop`](Self::stop) is called, while
    /// the packetizer may still be blocked reading it. Piped output must
    /// therefore be a [`ReaderSource::with_shutdown`](crate::source::ReaderSource::with_shutdown)
    /// whose hook makes that read return.
    fn start(&mut self) -> std::result::Result<Box<dyn MediaSource>, StreamError>;

    fn stop(&mut self);

    /// Key under which `configure` results may be memoized. `None` disables
    /// caching.
    fn probe_key(&self) -> Option<String> {
        None
    }

    /// The mode this encoder runs in when `suggested` is requested.
    fn preferred_mode(&self, suggested: EncodingMode) -> EncodingMode {
        suggested
    }

    /// Whether piped output is wrapped in an MP4 container that must be
    /// skipped up to the `mdat` box.
    fn mp4_wrapped(&self) -> bool {
        false
    }
}

/// A track: encoder, packetizer, destination and negotiated state.
pub struct MediaStream {
    codec: Codec,
    encoder: Box<dyn Encoder>,
    packetizer: Box<dyn Packetizer>,
    cache: Arc<dyn ProbeCache>,
    requested_mode: EncodingMode,
    mode: EncodingMode,
    params: Option<CodecParams>,
    destination: Option<IpAddr>,
    ports: Option<(u16, u16)>,
    ttl: u8,
    output: Option<(SharedWriter, u8)>,
    streaming: bool,
}

impl MediaStream {
    /// A stream with its own RTP socket pair.
    pub fn new(
        codec: Codec,
        encoder: Box<dyn Encoder>,
        config: &StreamingConfig,
        cache: Arc<dyn ProbeCache>,
    ) -> Result<Self> {
        Ok(Self::with_packetizer(
            codec,
            encoder,
            Box::new(RtpPacketizer::new()?),
            config,
            cache,
        ))
    }

    pub fn with_packetizer(
        codec: Codec,
        encoder: Box<dyn Encoder>,
        packetizer: Box<dyn Packetizer>,
        config: &StreamingConfig,
        cache: Arc<dyn ProbeCache>,
    ) -> Self {
        Self {
            codec,
            encoder,
            packetizer,
            cache,
            requested_mode: config.suggested_mode,
            mode: config.suggested_mode,
            params: None,
            destination: None,
            ports: None,
            ttl: config.time_to_live,
            output: None,
            streaming: false,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn track_id(&self) -> u8 {
        self.codec.track_id()
    }

    /// Mode requested for the next `configure`.
    pub fn set_streaming_mode(&mut self, mode: EncodingMode) {
        self.requested_mode = mode;
    }

    /// Mode actually in use after `configure`.
    pub fn streaming_mode(&self) -> EncodingMode {
        self.mode
    }

    pub fn params(&self) -> Option<&CodecParams> {
        self.params.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.params.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn set_destination_address(&mut self, destination: IpAddr) {
        self.destination = Some(destination);
    }

    pub fn destination_address(&self) -> Option<IpAddr> {
        self.destination
    }

    pub fn set_destination_ports(&mut self, rtp: u16, rtcp: u16) {
        self.ports = Some((rtp, rtcp));
    }

    /// Set the pair from one port: an odd port is taken as RTCP and paired
    /// with the even port below it, an even one as RTP.
    pub fn set_destination_port(&mut self, port: u16) {
        if port % 2 == 1 {
            self.ports = Some((port - 1, port));
        } else {
            self.ports = Some((port, port.saturating_add(1)));
        }
    }

    pub fn destination_ports(&self) -> Option<(u16, u16)> {
        self.ports
    }

    pub fn set_time_to_live(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    /// Send RTP over an interleaved RTSP connection instead of UDP.
    pub fn set_output_stream(&mut self, writer: SharedWriter, channel: u8) {
        self.output = Some((writer, channel));
    }

    /// Back to UDP delivery.
    pub fn clear_output_stream(&mut self) {
        self.output = None;
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.ssrc()
    }

    pub fn local_ports(&self) -> (u16, u16) {
        self.packetizer.local_ports()
    }

    /// Bits per second, 0 when not streaming.
    pub fn bitrate(&self) -> u64 {
        if self.streaming {
            self.packetizer.bitrate()
        } else {
            0
        }
    }

    fn stream_error(&self, e: StreamError) -> RtspError {
        RtspError::stream(self.track_id(), e)
    }

    /// Configure the encoder and the payload format. Refused while
    /// streaming.
    pub fn configure(&mut self) -> Result<()> {
        if self.streaming {
            return Err(RtspError::InvalidState("cannot configure a running stream"));
        }

        let requested = self.encoder.preferred_mode(self.requested_mode);
        let codec = self.codec.for_mode(requested);
        let mode = codec.effective_mode(requested);

        let key = self
            .encoder
            .probe_key()
            .map(|k| format!("{}:{}:{}", codec.name(), mode.as_str(), k));
        let cached = key.as_deref().and_then(|k| self.cache.get(k));
        let hit = cached.is_some();

        let params = self
            .encoder
            .configure(mode, cached)
            .map_err(|e| self.stream_error(e))?;
        if let Some(key) = &key
            && !hit
        {
            self.cache.put(key, params.clone());
        }

        let format = codec.payload_format(&params)?;
        self.packetizer.set_format(format)?;

        tracing::debug!(
            track = self.track_id(),
            codec = codec.name(),
            mode = mode.as_str(),
            cached = hit,
            "stream configured"
        );

        self.codec = codec;
        self.mode = mode;
        self.params = Some(params);
        Ok(())
    }

    /// Start the encoder and the packetizer. A running stream is left
    /// alone.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        if self.params.is_none() {
            return Err(RtspError::InvalidState("stream not configured"));
        }

        self.packetizer.set_time_to_live(self.ttl)?;
        match &self.output {
            Some((writer, channel)) => self.packetizer.set_output_stream(writer.clone(), *channel)?,
            None => {
                let (Some(destination), Some((rtp, rtcp))) = (self.destination, self.ports) else {
                    return Err(RtspError::InvalidState("no destination set"));
                };
                self.packetizer.set_destination(destination, rtp, rtcp)?;
            }
        }

        let mut source = self.encoder.start().map_err(|e| self.stream_error(e))?;
        if let Err(e) = self.attach(source.as_mut()) {
            self.encoder.stop();
            return Err(e);
        }
        if let Err(e) = self
            .packetizer
            .set_source(source)
            .and_then(|_| self.packetizer.start())
        {
            self.encoder.stop();
            return Err(e);
        }

        self.streaming = true;
        tracing::info!(
            track = self.track_id(),
            codec = self.codec.name(),
            ssrc = format_args!("{:#010X}", self.ssrc()),
            destination = ?self.destination,
            ports = ?self.ports,
            interleaved = self.output.is_some(),
            "stream started"
        );
        Ok(())
    }

    fn attach(&self, source: &mut dyn MediaSource) -> Result<()> {
        if self.mode == EncodingMode::Piped && self.codec.is_video() && self.encoder.mp4_wrapped() {
            source::skip_mp4_header(source)
                .map_err(|e| self.stream_error(StreamError::other(format!("no mdat box in recorder output: {e}"))))?;
        }
        Ok(())
    }

    /// Stop the packetizer, which closes its source first, then the
    /// encoder.
    pub fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        self.packetizer.stop();
        self.encoder.stop();
        self.streaming = false;
        tracing::info!(track = self.track_id(), "stream stopped");
    }

    /// This track's media section, with the current destination RTP port.
    pub fn session_description(&self) -> Result<String> {
        let params = self
            .params
            .as_ref()
            .ok_or(RtspError::InvalidState("stream not configured"))?;
        let port = self.ports.map(|(rtp, _)| rtp).unwrap_or(0);
        sdp::media_section(self.codec, params, port)
            .ok_or(RtspError::InvalidState("codec parameters do not match codec"))
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeEncoder;
    use super::*;
    use crate::cache::MemoryProbeCache;
    use crate::error::StreamErrorKind;
    use crate::media::AacConfig;

    fn stream(codec: Codec, encoder: FakeEncoder) -> MediaStream {
        MediaStream::new(
            codec,
            Box::new(encoder),
            &StreamingConfig::default(),
            Arc::new(MemoryProbeCache::new(1)),
        )
        .unwrap()
    }

    #[test]
    fn single_port_pairs_even_and_odd() {
        let mut s = stream(Codec::H264, FakeEncoder::h264());
        s.set_destination_port(5007);
        assert_eq!(s.destination_ports(), Some((5006, 5007)));
        s.set_destination_port(5008);
        assert_eq!(s.destination_ports(), Some((5008, 5009)));
    }

    #[test]
    fn description_requires_configure() {
        let mut s = stream(Codec::H264, FakeEncoder::h264());
        assert!(matches!(s.session_description(), Err(RtspError::InvalidState(_))));
        s.configure().unwrap();
        s.set_destination_ports(5006, 5007);
        let desc = s.session_description().unwrap();
        assert!(desc.starts_with("m=video 5006 RTP/AVP 96\r\n"));
    }

    #[test]
    fn start_requires_destination() {
        let mut s = stream(Codec::H264, FakeEncoder::h264());
        s.configure().unwrap();
        assert!(matches!(s.start(), Err(RtspError::InvalidState(_))));
        assert!(!s.is_streaming());
    }

    #[test]
    fn start_and_stop_drive_the_encoder() {
        let encoder = FakeEncoder::h264();
        let calls = encoder.calls.clone();
        let mut s = stream(Codec::H264, encoder);
        s.configure().unwrap();
        s.set_destination_address("127.0.0.1".parse().unwrap());
        s.set_destination_ports(40000, 40001);
        s.start().unwrap();
        assert!(s.is_streaming());
        assert!(matches!(s.configure(), Err(RtspError::InvalidState(_))));

        s.start().unwrap();
        assert_eq!(calls.lock().started, 1, "second start is a no-op");

        s.stop();
        assert!(!s.is_streaming());
        assert_eq!(s.bitrate(), 0);
        assert_eq!(calls.lock().stopped, 1);
    }

    #[test]
    fn encoder_errors_keep_their_kind() {
        let mut encoder = FakeEncoder::h264();
        encoder.fail_configure = Some(StreamErrorKind::CameraAlreadyInUse);
        let mut s = stream(Codec::H264, encoder);
        let err = s.configure().unwrap_err();
        assert_eq!(err.stream_kind(), StreamErrorKind::CameraAlreadyInUse);
        assert!(matches!(err, RtspError::Stream { track: Some(1), .. }));
    }

    #[test]
    fn aac_framing_follows_encoder_mode() {
        let aac = CodecParams::Aac(AacConfig::new(2, 44100, 2).unwrap());
        let mut s = stream(Codec::AacAdts, FakeEncoder::with_params(aac));
        s.set_streaming_mode(EncodingMode::Buffered);
        s.configure().unwrap();
        assert_eq!(s.codec(), Codec::AacLatm);
        assert_eq!(s.streaming_mode(), EncodingMode::Buffered);
    }

    #[test]
    fn probe_results_are_reused() {
        let cache = Arc::new(MemoryProbeCache::new(1));
        let mut encoder = FakeEncoder::h264();
        encoder.probe_key = Some("640x480".into());
        let calls = encoder.calls.clone();
        let mut s = MediaStream::new(
            Codec::H264,
            Box::new(encoder),
            &StreamingConfig::default(),
            cache.clone(),
        )
        .unwrap();

        s.configure().unwrap();
        s.configure().unwrap();
        let configured = calls.lock().configured.clone();
        assert_eq!(
            configured,
            vec![(EncodingMode::Buffered, false), (EncodingMode::Buffered, true)]
        );
        assert_eq!(cache.len(), 1);
    }
}
