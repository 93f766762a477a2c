use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;
use crate::media::rtp::{PAYLOAD_TYPE, RtpHeader};
use crate::transport::interleaved::{self, SharedWriter};
use crate::transport::pool::{BufferPool, MAX_PACKET_SIZE, PacketBuffer};
use crate::transport::udp::UdpTransport;

const BITRATE_WINDOW: Duration = Duration::from_secs(1);
const POOL_CAPACITY: usize = 64;

/// Where packets leave the socket.
#[derive(Clone)]
enum Output {
    Udp {
        transport: UdpTransport,
        destination: Option<SocketAddr>,
    },
    Interleaved {
        writer: SharedWriter,
        channel: u8,
    },
}

impl Output {
    fn deliver(&self, packet: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp {
                transport,
                destination: Some(addr),
            } => transport.send_to(packet, *addr).map(|_| ()),
            Self::Udp {
                destination: None, ..
            } => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no destination set",
            )),
            Self::Interleaved { writer, channel } => {
                interleaved::write_frame(writer, *channel, packet)
            }
        }
    }
}

/// Sent-bytes accounting over a sliding one-second window.
///
/// Shared so the bitrate can be read while the socket itself is owned by a
/// packetizer thread.
#[derive(Debug, Default)]
pub struct BitrateMeter {
    samples: Mutex<VecDeque<(Instant, usize)>>,
}

impl BitrateMeter {
    pub fn record(&self, bytes: usize) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now);
    }

    /// Bits per second over the last second.
    pub fn bitrate(&self) -> u64 {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, Instant::now());
        samples.iter().map(|(_, b)| *b as u64).sum::<u64>() * 8
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }

    fn prune(samples: &mut VecDeque<(Instant, usize)>, now: Instant) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > BITRATE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Queued {
    output: Output,
    buffer: PacketBuffer,
    len: usize,
}

/// Background sender used when a send cache is configured.
struct SenderThread {
    tx: SyncSender<Queued>,
    handle: JoinHandle<()>,
}

impl SenderThread {
    fn spawn(
        depth: usize,
        pool: Arc<BufferPool>,
        failure: Arc<Mutex<Option<io::Error>>>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(depth);
        let handle = thread::Builder::new()
            .name("rtp-sender".into())
            .spawn(move || Self::run(rx, pool, failure))?;
        Ok(Self { tx, handle })
    }

    fn run(rx: Receiver<Queued>, pool: Arc<BufferPool>, failure: Arc<Mutex<Option<io::Error>>>) {
        while let Ok(item) = rx.recv() {
            let result = item.output.deliver(&item.buffer.as_slice()[..item.len]);
            pool.checkin(item.buffer);
            if let Err(e) = result {
                tracing::debug!(error = %e, "RTP sender thread stopping");
                *failure.lock() = Some(e);
                break;
            }
        }
    }

    fn finish(self) {
        drop(self.tx);
        if self.handle.join().is_err() {
            tracing::warn!("RTP sender thread panicked");
        }
    }
}

/// Frames RTP packets and sends them over UDP or an interleaved TCP channel.
///
/// Owns the stream's [`RtpHeader`]: every [`send`](Self::send) stamps the
/// current timestamp, the next sequence number, the SSRC and the pending
/// marker bit into the buffer's first 12 bytes.
///
/// Single producer: the packetizer thread that owns the socket.
pub struct RtpSocket {
    header: RtpHeader,
    clock_rate: u32,
    udp: UdpTransport,
    output: Output,
    destination_ports: Option<(u16, u16)>,
    pool: Arc<BufferPool>,
    meter: Arc<BitrateMeter>,
    sender: Option<SenderThread>,
    failure: Arc<Mutex<Option<io::Error>>>,
    mark_next: bool,
}

impl RtpSocket {
    /// Bind the RTP/RTCP pair with a random SSRC and a 90 kHz clock.
    pub fn bind() -> Result<Self> {
        let udp = UdpTransport::bind()?;
        Ok(Self {
            header: RtpHeader::with_random_ssrc(PAYLOAD_TYPE),
            clock_rate: 90_000,
            output: Output::Udp {
                transport: udp.clone(),
                destination: None,
            },
            udp,
            destination_ports: None,
            pool: Arc::new(BufferPool::new(POOL_CAPACITY)),
            meter: Arc::new(BitrateMeter::default()),
            sender: None,
            failure: Arc::new(Mutex::new(None)),
            mark_next: false,
        })
    }

    /// Send to `destination` over UDP.
    pub fn open(&mut self, destination: IpAddr, rtp_port: u16, rtcp_port: u16) {
        self.destination_ports = Some((rtp_port, rtcp_port));
        self.output = Output::Udp {
            transport: self.udp.clone(),
            destination: Some(SocketAddr::new(destination, rtp_port)),
        };
    }

    /// Switch to interleaved framing on an RTSP connection.
    pub fn set_output_stream(&mut self, writer: SharedWriter, channel: u8) {
        self.output = Output::Interleaved { writer, channel };
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self.output, Output::Interleaved { .. })
    }

    /// Queue depth for a background sender. 0 sends inline on the caller's
    /// thread, which suits buffer-fed sources where latency matters.
    pub fn set_cache_size(&mut self, depth: usize) -> Result<()> {
        if let Some(sender) = self.sender.take() {
            sender.finish();
        }
        if depth > 0 {
            self.sender = Some(SenderThread::spawn(
                depth,
                self.pool.clone(),
                self.failure.clone(),
            )?);
        }
        Ok(())
    }

    pub fn set_clock_frequency(&mut self, hz: u32) {
        self.clock_rate = hz;
    }

    pub fn clock_frequency(&self) -> u32 {
        self.clock_rate
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.header.ssrc = ssrc;
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn set_time_to_live(&self, ttl: u8) -> Result<()> {
        self.udp.set_time_to_live(ttl)
    }

    /// Local (RTP, RTCP) UDP ports.
    pub fn local_ports(&self) -> (u16, u16) {
        self.udp.local_ports()
    }

    pub fn destination_ports(&self) -> Option<(u16, u16)> {
        self.destination_ports
    }

    pub fn request_buffer(&self) -> PacketBuffer {
        self.pool.checkout()
    }

    /// Set the timestamp of the next packets from a time in nanoseconds.
    pub fn update_timestamp(&mut self, nanos: u64) {
        let ticks = nanos as u128 * self.clock_rate as u128 / 1_000_000_000;
        self.header.set_timestamp(ticks as u32);
    }

    /// Set the RTP timestamp directly, in clock ticks.
    pub fn set_rtp_timestamp(&mut self, ticks: u32) {
        self.header.set_timestamp(ticks);
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    /// Set the marker bit on the next packet only.
    pub fn mark_next_packet(&mut self) {
        self.mark_next = true;
    }

    /// Stamp the RTP header into `buffer` and send its first `len` bytes.
    pub fn send(&mut self, mut buffer: PacketBuffer, len: usize) -> io::Result<()> {
        if let Some(e) = self.failure.lock().take() {
            return Err(e);
        }
        let len = len.min(MAX_PACKET_SIZE);
        let marker = std::mem::take(&mut self.mark_next);
        self.header.write_into(buffer.as_mut_slice(), marker);
        self.meter.record(len);

        tracing::trace!(
            ssrc = format_args!("{:#010X}", self.header.ssrc),
            seq = self.header.sequence().wrapping_sub(1),
            ts = self.header.timestamp(),
            marker,
            len,
            "RTP packet"
        );

        match &self.sender {
            Some(sender) => {
                let item = Queued {
                    output: self.output.clone(),
                    buffer,
                    len,
                };
                sender.tx.send(item).map_err(|_| {
                    self.failure.lock().take().unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "RTP sender stopped")
                    })
                })
            }
            None => {
                let result = self.output.deliver(&buffer.as_slice()[..len]);
                self.pool.checkin(buffer);
                result
            }
        }
    }

    pub fn bitrate(&self) -> u64 {
        self.meter.bitrate()
    }

    pub fn meter(&self) -> Arc<BitrateMeter> {
        self.meter.clone()
    }
}

impl Drop for RtpSocket {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.finish();
        }
    }
}
