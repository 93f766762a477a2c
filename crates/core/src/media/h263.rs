use std::time::Instant;

use super::{ArrivalStats, PayloadFormat, map_read_error};
use crate::error::PacketizeError;
use crate::source::{MediaSource, SourceKind};
use crate::transport::RtpSocket;
use crate::transport::pool::MAX_PAYLOAD_SIZE;

/// Picture data carried per packet, after the 2-byte payload header.
const MAX_CHUNK: usize = MAX_PAYLOAD_SIZE - 2;

/// Payload header with the P bit set: the packet starts a picture and the
/// two zero bytes of its start code were omitted.
const PICTURE_START: u8 = 0x04;

/// Position of the first picture start code (`00 00 1000 00xx`) in `data`,
/// ignoring offset 0.
fn find_picture_start(data: &[u8]) -> Option<usize> {
    (1..data.len().saturating_sub(2))
        .find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] & 0xfc == 0x80)
}

/// H.263+ RTP payload format (RFC 4629 §5.1).
///
/// Reads an unframed pipe, looks ahead for the next picture start code, and
/// splits each picture into packets of at most [`MAX_CHUNK`] bytes. The
/// last packet of a picture carries the marker bit. Timestamps advance by
/// the moving average of picture intervals.
pub struct H263Format {
    pending: Vec<u8>,
    picture_start: bool,
    started: bool,
    stats: ArrivalStats,
    last_picture: Option<Instant>,
    ts_ns: u64,
}

impl Default for H263Format {
    fn default() -> Self {
        Self::new()
    }
}

impl H263Format {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(MAX_CHUNK + 2),
            picture_start: true,
            started: false,
            stats: ArrivalStats::default(),
            last_picture: None,
            ts_ns: 0,
        }
    }

    /// Keep enough bytes buffered that a start code straddling the packet
    /// boundary is still found. Returns `true` once the input has ended
    /// with bytes still buffered.
    fn fill(&mut self, source: &mut dyn MediaSource) -> Result<bool, PacketizeError> {
        let want = MAX_CHUNK + 2;
        let mut have = self.pending.len();
        if have >= want {
            return Ok(false);
        }
        self.pending.resize(want, 0);
        while have < want {
            match source.read(&mut self.pending[have..]) {
                Ok(n) => have += n,
                Err(e) => {
                    self.pending.truncate(have);
                    return match map_read_error(e, false) {
                        PacketizeError::EndOfStream if have > 0 => Ok(true),
                        e => Err(e),
                    };
                }
            }
        }
        Ok(false)
    }

    fn end_of_picture(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_picture {
            self.stats.push(now.duration_since(prev).as_nanos() as u64);
        }
        self.last_picture = Some(now);
        self.ts_ns += self.stats.average();
    }

    fn send_chunk(
        &mut self,
        len: usize,
        marker: bool,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let mut buf = socket.request_buffer();
        let payload = buf.payload_mut();
        payload[0] = if self.picture_start { PICTURE_START } else { 0 };
        payload[1] = 0;
        payload[2..2 + len].copy_from_slice(&self.pending[..len]);
        if marker {
            socket.mark_next_packet();
        }
        socket.send(buf, 12 + 2 + len)?;
        Ok(())
    }
}

impl PayloadFormat for H263Format {
    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn reset(&mut self, _kind: SourceKind) {
        self.pending.clear();
        self.picture_start = true;
        self.started = false;
        self.stats = ArrivalStats::default();
        self.last_picture = None;
        self.ts_ns = 0;
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let mut ended = self.fill(source)?;

        if !self.started {
            self.started = true;
            if self.pending.starts_with(&[0, 0]) && self.pending.get(2).is_some_and(|b| b & 0xfc == 0x80) {
                self.pending.drain(..2);
                ended = self.fill(source)?;
            }
        }

        socket.update_timestamp(self.ts_ns);
        match find_picture_start(&self.pending) {
            Some(end) => {
                self.send_chunk(end, true, socket)?;
                self.pending.drain(..end + 2);
                self.picture_start = true;
                self.end_of_picture();
                tracing::trace!(len = end, ts_ns = self.ts_ns, "H.263 picture end");
            }
            // Last picture of the stream.
            None if ended && self.pending.len() <= MAX_CHUNK => {
                let len = self.pending.len();
                self.send_chunk(len, true, socket)?;
                self.pending.clear();
                self.picture_start = true;
                self.end_of_picture();
                tracing::trace!(len, "H.263 final picture flushed");
            }
            None => {
                self.send_chunk(MAX_CHUNK, false, socket)?;
                self.pending.drain(..MAX_CHUNK);
                self.picture_start = false;
            }
        }
        Ok(())
    }
}
