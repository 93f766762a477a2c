//! Media codecs and RTP packetization.
//!
//! A packetizer turns an encoder's output ([`MediaSource`]) into RTP
//! packets sent through an [`RtpSocket`]. The codec-specific framing lives
//! behind the [`PayloadFormat`] strategy trait; [`RtpPacketizer`] runs any
//! format on a dedicated worker thread.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC |
//! |-------|--------|-----|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | H.263 | [`h263`] | [RFC 4629](https://tools.ietf.org/html/rfc4629) |
//! | AAC (ADTS/LATM input) | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) |
//! | AMR-NB | [`amr`] | [RFC 3267](https://tools.ietf.org/html/rfc3267) |
//!
//! Every codec uses dynamic payload type 96.

pub mod aac;
pub mod amr;
pub mod h263;
pub mod h264;
pub mod mp4;
pub mod rtp;

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::EncodingMode;
use crate::error::{PacketizeError, Result, RtspError};
use crate::source::{self, CloseHandle, MediaSource, SourceKind};
use crate::transport::{BitrateMeter, RtpSocket, SharedWriter};

pub use aac::AacConfig;
pub use h264::H264Params;
pub use mp4::Mp4Config;

/// Send-queue depth used for piped sources.
const PIPED_CACHE_DEPTH: usize = 32;

/// Samples kept by [`ArrivalStats`].
const ARRIVAL_WINDOW: usize = 20;

/// Codec choice for a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H263,
    /// AAC read from an ADTS-framed pipe.
    AacAdts,
    /// AAC read from encoder buffers, one access unit each.
    AacLatm,
    Amr,
}

impl Codec {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::H264 | Self::H263)
    }

    /// Track index used in SDP and SETUP: 0 for audio, 1 for video.
    pub fn track_id(&self) -> u8 {
        if self.is_video() { 1 } else { 0 }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "H.264",
            Self::H263 => "H.263",
            Self::AacAdts => "AAC/ADTS",
            Self::AacLatm => "AAC/LATM",
            Self::Amr => "AMR-NB",
        }
    }

    /// The encoding mode this codec can actually run in, given a request.
    /// H.263 and AMR are only produced through a pipe.
    pub fn effective_mode(&self, requested: EncodingMode) -> EncodingMode {
        match self {
            Self::H263 | Self::Amr | Self::AacAdts => EncodingMode::Piped,
            Self::AacLatm => EncodingMode::Buffered,
            Self::H264 => requested,
        }
    }

    /// Pick the AAC framing matching an encoding mode.
    pub fn for_mode(self, mode: EncodingMode) -> Self {
        match (self, mode) {
            (Self::AacAdts | Self::AacLatm, EncodingMode::Piped) => Self::AacAdts,
            (Self::AacAdts | Self::AacLatm, EncodingMode::Buffered) => Self::AacLatm,
            (other, _) => other,
        }
    }

    /// Build the payload format for this codec.
    pub fn payload_format(&self, params: &CodecParams) -> Result<Box<dyn PayloadFormat>> {
        let format: Box<dyn PayloadFormat> = match (self, params) {
            (Self::H264, CodecParams::H264(p)) => Box::new(h264::H264Format::new(p.clone())),
            (Self::H263, CodecParams::H263) => Box::new(h263::H263Format::new()),
            (Self::AacAdts, CodecParams::Aac(c)) => Box::new(aac::AdtsFormat::new(*c)),
            (Self::AacLatm, CodecParams::Aac(c)) => Box::new(aac::LatmFormat::new(*c)),
            (Self::Amr, CodecParams::Amr) => Box::new(amr::AmrFormat::new()),
            _ => return Err(RtspError::InvalidState("codec parameters do not match codec")),
        };
        Ok(format)
    }
}

/// Parameters an encoder reports after configuration, used for SDP and
/// for in-band parameter injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecParams {
    H264(H264Params),
    H263,
    Aac(AacConfig),
    Amr,
}

/// Codec-specific RTP payload framing.
///
/// Each call to [`send_next`](Self::send_next) consumes one unit of input
/// (a NAL unit, an ADTS frame, an AMR frame, an H.263 chunk) and sends the
/// packets it produces.
pub trait PayloadFormat: Send {
    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// Reset per-run state before the worker starts.
    fn reset(&mut self, _kind: SourceKind) {}

    /// Called on the controlling thread before the worker starts.
    fn prepare(&mut self, kind: SourceKind, socket: &mut RtpSocket) -> Result<()> {
        self.reset(kind);
        socket.set_clock_frequency(self.clock_rate());
        socket.set_cache_size(match kind {
            SourceKind::Buffered => 0,
            SourceKind::Piped => PIPED_CACHE_DEPTH,
        })
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> std::result::Result<(), PacketizeError>;
}

/// Packetizer capability shared by every stream.
pub trait Packetizer: Send {
    fn set_format(&mut self, format: Box<dyn PayloadFormat>) -> Result<()>;

    fn set_source(&mut self, source: Box<dyn MediaSource>) -> Result<()>;

    fn set_destination(&mut self, destination: IpAddr, rtp_port: u16, rtcp_port: u16)
    -> Result<()>;

    /// Send over an interleaved RTSP connection instead of UDP.
    fn set_output_stream(&mut self, writer: SharedWriter, channel: u8) -> Result<()>;

    fn set_time_to_live(&mut self, ttl: u8) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Close the source, then join the worker. The worker has exited when
    /// this returns.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn ssrc(&self) -> u32;

    fn local_ports(&self) -> (u16, u16);

    /// Bits per second over the last second.
    fn bitrate(&self) -> u64;
}

type WorkerOutput = (RtpSocket, Box<dyn PayloadFormat>);

/// Runs a [`PayloadFormat`] on a dedicated thread.
pub struct RtpPacketizer {
    socket: Option<RtpSocket>,
    format: Option<Box<dyn PayloadFormat>>,
    source: Option<Box<dyn MediaSource>>,
    worker: Option<JoinHandle<WorkerOutput>>,
    running: Arc<AtomicBool>,
    close: Option<CloseHandle>,
    meter: Arc<BitrateMeter>,
    ssrc: u32,
    local_ports: (u16, u16),
}

impl RtpPacketizer {
    pub fn new() -> Result<Self> {
        let socket = RtpSocket::bind()?;
        Ok(Self {
            meter: socket.meter(),
            ssrc: socket.ssrc(),
            local_ports: socket.local_ports(),
            socket: Some(socket),
            format: None,
            source: None,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            close: None,
        })
    }

    fn idle_socket(&mut self) -> Result<&mut RtpSocket> {
        if self.worker.as_ref().is_some_and(|h| h.is_finished()) {
            self.stop();
        }
        if self.worker.is_some() {
            return Err(RtspError::InvalidState("packetizer is running"));
        }
        self.socket
            .as_mut()
            .ok_or(RtspError::InvalidState("packetizer socket unavailable"))
    }

    fn run(
        running: &AtomicBool,
        format: &mut dyn PayloadFormat,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) {
        while running.load(Ordering::SeqCst) {
            if let Err(e) = format.send_next(source, socket) {
                if e.is_normal() {
                    tracing::debug!(ssrc = format_args!("{:#010X}", socket.ssrc()), reason = %e, "packetizer finished");
                } else {
                    tracing::error!(ssrc = format_args!("{:#010X}", socket.ssrc()), error = %e, "packetizer failed");
                }
                break;
            }
        }
    }
}

impl Packetizer for RtpPacketizer {
    fn set_format(&mut self, format: Box<dyn PayloadFormat>) -> Result<()> {
        self.idle_socket()?;
        self.format = Some(format);
        Ok(())
    }

    fn set_source(&mut self, source: Box<dyn MediaSource>) -> Result<()> {
        self.idle_socket()?;
        self.source = Some(source);
        Ok(())
    }

    fn set_destination(
        &mut self,
        destination: IpAddr,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<()> {
        self.idle_socket()?.open(destination, rtp_port, rtcp_port);
        Ok(())
    }

    fn set_output_stream(&mut self, writer: SharedWriter, channel: u8) -> Result<()> {
        self.idle_socket()?.set_output_stream(writer, channel);
        Ok(())
    }

    fn set_time_to_live(&mut self, ttl: u8) -> Result<()> {
        self.idle_socket()?.set_time_to_live(ttl)
    }

    fn start(&mut self) -> Result<()> {
        self.idle_socket()?;
        let mut format = self
            .format
            .take()
            .ok_or(RtspError::InvalidState("no payload format set"))?;
        let mut source = match self.source.take() {
            Some(s) => s,
            None => {
                self.format = Some(format);
                return Err(RtspError::InvalidState("no source set"));
            }
        };
        let mut socket = self
            .socket
            .take()
            .ok_or(RtspError::InvalidState("packetizer socket unavailable"))?;

        if let Err(e) = format.prepare(source.kind(), &mut socket) {
            self.socket = Some(socket);
            self.format = Some(format);
            return Err(e);
        }

        self.close = Some(source.close_handle());
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let ssrc = self.ssrc;

        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "packetizer starting");

        let handle = thread::Builder::new()
            .name(format!("packetizer-{ssrc:08x}"))
            .spawn(move || {
                Self::run(&running, format.as_mut(), source.as_mut(), &mut socket);
                running.store(false, Ordering::SeqCst);
                (socket, format)
            });

        match handle {
            Ok(h) => {
                self.worker = Some(h);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(close) = self.close.take() {
            close.close();
        }
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok((socket, format)) => {
                    self.socket = Some(socket);
                    self.format = Some(format);
                }
                Err(_) => tracing::error!(ssrc = format_args!("{:#010X}", self.ssrc), "packetizer thread panicked"),
            }
        }
        self.meter.reset();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn local_ports(&self) -> (u16, u16) {
        self.local_ports
    }

    fn bitrate(&self) -> u64 {
        self.meter.bitrate()
    }
}

impl Drop for RtpPacketizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Moving average of recent inter-unit arrival durations.
///
/// Piped sources carry no timing information, so timestamps advance by the
/// average time it took for recent units to arrive.
#[derive(Debug)]
pub struct ArrivalStats {
    window: VecDeque<u64>,
    capacity: usize,
    sum: u64,
}

impl Default for ArrivalStats {
    fn default() -> Self {
        Self::new(ARRIVAL_WINDOW)
    }
}

impl ArrivalStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0,
        }
    }

    pub fn push(&mut self, duration_ns: u64) {
        if self.window.len() == self.capacity
            && let Some(old) = self.window.pop_front()
        {
            self.sum -= old;
        }
        self.window.push_back(duration_ns);
        self.sum += duration_ns;
    }

    /// Average duration in nanoseconds, 0 when empty.
    pub fn average(&self) -> u64 {
        if self.window.is_empty() {
            0
        } else {
            self.sum / self.window.len() as u64
        }
    }
}

pub(crate) fn map_read_error(e: io::Error, mid_frame: bool) -> PacketizeError {
    if source::is_closed_error(&e) {
        PacketizeError::Closed
    } else if e.kind() == io::ErrorKind::UnexpectedEof {
        if mid_frame {
            PacketizeError::Malformed("truncated frame".into())
        } else {
            PacketizeError::EndOfStream
        }
    } else {
        PacketizeError::Io(e)
    }
}

/// Read the first bytes of a unit. End of input here is a clean end.
pub(crate) fn read_head(
    source: &mut dyn MediaSource,
    buf: &mut [u8],
) -> std::result::Result<(), PacketizeError> {
    source::read_exact(source, buf).map_err(|e| map_read_error(e, false))
}

/// Read the rest of a unit. End of input here truncates the unit.
pub(crate) fn read_body(
    source: &mut dyn MediaSource,
    buf: &mut [u8],
) -> std::result::Result<(), PacketizeError> {
    source::read_exact(source, buf).map_err(|e| map_read_error(e, true))
}

/// Discard `n` bytes of input.
pub(crate) fn skip(source: &mut dyn MediaSource, n: usize) -> std::result::Result<(), PacketizeError> {
    let mut scratch = [0u8; 256];
    let mut left = n;
    while left > 0 {
        let chunk = left.min(scratch.len());
        read_body(source, &mut scratch[..chunk])?;
        left -= chunk;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers shared by the codec tests: an interleaved capture sink that
    //! records every RTP packet a socket sends.

    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::transport::RtpSocket;
    use crate::transport::interleaved::shared_writer;

    #[derive(Clone, Default)]
    pub struct Capture(pub Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        /// Split the captured bytes back into RTP packets.
        pub fn packets(&self) -> Vec<Vec<u8>> {
            let data = self.0.lock();
            let mut packets = Vec::new();
            let mut i = 0;
            while i + 4 <= data.len() {
                assert_eq!(data[i], b'$', "interleaved marker");
                let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
                packets.push(data[i + 4..i + 4 + len].to_vec());
                i += 4 + len;
            }
            packets
        }
    }

    pub fn capture_socket() -> (RtpSocket, Capture) {
        let capture = Capture::default();
        let mut socket = RtpSocket::bind().unwrap();
        socket.set_output_stream(shared_writer(capture.clone()), 0);
        (socket, capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::PacketInfo;
    use crate::source::{ReaderSource, buffer_channel};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn arrival_stats_is_a_moving_average() {
        let mut stats = ArrivalStats::new(2);
        assert_eq!(stats.average(), 0);
        stats.push(10);
        stats.push(20);
        assert_eq!(stats.average(), 15);
        stats.push(40);
        assert_eq!(stats.average(), 30);
    }

    #[test]
    fn aac_framing_follows_mode() {
        assert_eq!(Codec::AacLatm.for_mode(EncodingMode::Piped), Codec::AacAdts);
        assert_eq!(Codec::AacAdts.for_mode(EncodingMode::Buffered), Codec::AacLatm);
        assert_eq!(Codec::H264.for_mode(EncodingMode::Piped), Codec::H264);
        assert_eq!(Codec::Amr.effective_mode(EncodingMode::Buffered), EncodingMode::Piped);
    }

    #[test]
    fn mismatched_params_are_rejected() {
        assert!(Codec::H264.payload_format(&CodecParams::Amr).is_err());
    }

    #[test]
    fn worker_runs_until_stopped() {
        let (socket, capture) = testing::capture_socket();
        let mut packetizer = RtpPacketizer::new().unwrap();
        packetizer.socket = Some(socket);

        let (sink, source) = buffer_channel(8);
        let sps = vec![0x67, 0x42, 0x00, 0x1e];
        let pps = vec![0x68, 0xce, 0x38, 0x80];
        packetizer
            .set_format(
                Codec::H264
                    .payload_format(&CodecParams::H264(H264Params::new(sps, pps)))
                    .unwrap(),
            )
            .unwrap();
        packetizer.set_source(Box::new(source)).unwrap();
        packetizer.start().unwrap();
        assert!(packetizer.is_running());

        sink.push(vec![0, 0, 0, 1, 0x41, 1, 2, 3], 33_000).unwrap();
        thread::sleep(Duration::from_millis(100));
        packetizer.stop();
        assert!(!packetizer.is_running());

        let packets = capture.packets();
        assert_eq!(packets.len(), 1);
        let info = PacketInfo::parse(&packets[0]).unwrap();
        assert_eq!(info.timestamp, 33_000 * 90 / 1000);
        assert_eq!(&packets[0][12..], &[0x41, 1, 2, 3]);
    }

    #[test]
    fn stop_returns_while_a_pipe_is_silent() {
        let (socket, _capture) = testing::capture_socket();
        let mut packetizer = RtpPacketizer::new().unwrap();
        packetizer.socket = Some(socket);

        let (reader, writer) = io::pipe().unwrap();
        let writer = parking_lot::Mutex::new(Some(writer));
        let source = ReaderSource::with_shutdown(reader, move || drop(writer.lock().take()));
        packetizer
            .set_format(Codec::Amr.payload_format(&CodecParams::Amr).unwrap())
            .unwrap();
        packetizer.set_source(Box::new(source)).unwrap();
        packetizer.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(packetizer.is_running());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            packetizer.stop();
            let _ = tx.send(packetizer.is_running());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)), Ok(false));
    }
}
