use std::time::Instant;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{ArrivalStats, PayloadFormat, read_body, read_head, skip};
use crate::error::PacketizeError;
use crate::source::{MediaSource, SourceKind};
use crate::transport::RtpSocket;
use crate::transport::pool::MAX_PAYLOAD_SIZE;

/// Length prefixes above this are treated as garbage and trigger a resync.
const MAX_NAL_LEN: u32 = 100_000;

/// NAL units above this size are split into FU-A fragments.
pub const MAX_SINGLE_NAL: usize = MAX_PAYLOAD_SIZE - 2;

/// In-band SPS/PPS seen more often than this disables injection.
const NATIVE_PARAM_SET_LIMIT: u32 = 4;

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// H.264 decoder configuration (SPS and PPS NAL units, without start codes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Params {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl H264Params {
    pub fn new(sps: Vec<u8>, pps: Vec<u8>) -> Self {
        Self { sps, pps }
    }

    /// Pick the first SPS and PPS out of an Annex B bitstream.
    pub fn from_annex_b(data: &[u8]) -> Option<Self> {
        let nals = extract_nal_units(data);
        let find = |t: u8| nals.iter().find(|n| n[0] & 0x1f == t).cloned();
        Some(Self::new(find(NAL_SPS)?, find(NAL_PPS)?))
    }

    /// profile-level-id from SPS bytes 1–3: profile_idc, constraint flags,
    /// level_idc (RFC 6184 §8.1).
    pub fn profile_level_id(&self) -> Option<String> {
        if self.sps.len() < 4 {
            return None;
        }
        Some(format!(
            "{:02x}{:02x}{:02x}",
            self.sps[1], self.sps[2], self.sps[3]
        ))
    }

    pub fn sprop_parameter_sets(&self) -> String {
        format!(
            "{},{}",
            BASE64_STANDARD.encode(&self.sps),
            BASE64_STANDARD.encode(&self.pps)
        )
    }

    /// STAP-A payload aggregating SPS and PPS (RFC 6184 §5.7.1).
    pub fn stap_a(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.sps.len() + self.pps.len());
        out.push(NAL_STAP_A);
        out.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sps);
        out.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.pps);
        out
    }
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
    let mut nal_units = Vec::new();
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = if idx + 1 < start_entries.len() {
            let (next_start, next_sc_len) = start_entries[idx + 1];
            next_start - next_sc_len
        } else {
            data.len()
        };

        if start < end {
            nal_units.push(data[start..end].to_vec());
        }
    }

    nal_units
}

/// How NAL units are delimited in the input.
///
/// Transitions only go forward: a start-code stream that turns out to have
/// no start codes switches to `Raw` for the rest of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 4-byte big-endian length before each NAL (recorder pipes).
    LengthPrefixed,
    /// `00 00 00 01` before each NAL, one NAL per buffer.
    StartCode,
    /// One bare NAL per buffer.
    Raw,
}

/// H.264 RTP payload format (RFC 6184, packetization-mode=1).
///
/// - **Single NAL Unit** (§5.6): NALs up to [`MAX_SINGLE_NAL`] bytes are
///   sent as-is.
/// - **FU-A** (§5.8): larger NALs are split. Each fragment carries
///   `[F|NRI|28]` and `[S|E|R|type]` before the NAL data.
/// - **STAP-A** (§5.7.1): before every IDR, SPS and PPS are sent in one
///   aggregation packet, until the encoder is seen emitting them itself.
///
/// Timestamps come from buffer presentation times, or for piped input
/// from a moving average of NAL arrival intervals.
pub struct H264Format {
    stap_a: Option<Vec<u8>>,
    framing: Framing,
    header: [u8; 5],
    native_param_sets: u32,
    stats: ArrivalStats,
    last_arrival: Option<Instant>,
    ts_ns: u64,
}

impl H264Format {
    pub fn new(params: H264Params) -> Self {
        let stap = params.stap_a();
        let stap_a = if params.sps.is_empty() || params.pps.is_empty() {
            None
        } else if stap.len() > MAX_PAYLOAD_SIZE {
            tracing::warn!(len = stap.len(), "SPS/PPS too large for STAP-A, not injecting");
            None
        } else {
            Some(stap)
        };
        Self {
            stap_a,
            framing: Framing::StartCode,
            header: [0; 5],
            native_param_sets: 0,
            stats: ArrivalStats::default(),
            last_arrival: None,
            ts_ns: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_arrival {
            self.stats.push(now.duration_since(prev).as_nanos() as u64);
        }
        self.last_arrival = Some(now);
        self.ts_ns += self.stats.average();
    }

    fn prefix_len(&self) -> u32 {
        u32::from_be_bytes([self.header[0], self.header[1], self.header[2], self.header[3]])
    }

    /// Slide a 5-byte window over the input until it looks like a length
    /// prefix followed by a slice or IDR NAL header.
    fn resync(&mut self, source: &mut dyn MediaSource) -> Result<u32, PacketizeError> {
        tracing::warn!(len = self.prefix_len(), "implausible NAL length, resynchronizing");
        let mut byte = [0u8; 1];
        let mut skipped = 0usize;
        loop {
            read_head(source, &mut byte)?;
            self.header.copy_within(1..5, 0);
            self.header[4] = byte[0];
            skipped += 1;
            let nal_type = self.header[4] & 0x1f;
            if nal_type == NAL_SLICE || nal_type == NAL_IDR {
                let len = self.prefix_len();
                if len > 0 && len < MAX_NAL_LEN {
                    tracing::debug!(skipped, len, "resynchronized");
                    self.last_arrival = None;
                    return Ok(len);
                }
            }
        }
    }

    fn send_nal(
        &mut self,
        nal_header: u8,
        nal_len: usize,
        ts_ns: u64,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let nal_type = nal_header & 0x1f;

        if nal_type == NAL_SPS || nal_type == NAL_PPS {
            self.native_param_sets += 1;
            if self.native_param_sets > NATIVE_PARAM_SET_LIMIT && self.stap_a.take().is_some() {
                tracing::debug!("encoder sends SPS/PPS in-band, injection disabled");
            }
        }

        if nal_type == NAL_IDR
            && let Some(stap) = &self.stap_a
        {
            let mut buf = socket.request_buffer();
            buf.payload_mut()[..stap.len()].copy_from_slice(stap);
            socket.update_timestamp(ts_ns);
            socket.mark_next_packet();
            socket.send(buf, 12 + stap.len())?;
        }

        if nal_len <= MAX_SINGLE_NAL {
            let mut buf = socket.request_buffer();
            let payload = buf.payload_mut();
            payload[0] = nal_header;
            read_body(source, &mut payload[1..nal_len])?;
            socket.update_timestamp(ts_ns);
            socket.mark_next_packet();
            socket.send(buf, 12 + nal_len)?;
            return Ok(());
        }

        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let mut fu_header = 0x80 | nal_type;
        let mut sent = 1;
        while sent < nal_len {
            let chunk = (nal_len - sent).min(MAX_SINGLE_NAL);
            let mut buf = socket.request_buffer();
            let payload = buf.payload_mut();
            payload[0] = fu_indicator;
            payload[1] = fu_header;
            read_body(source, &mut payload[2..2 + chunk])?;
            sent += chunk;
            if sent >= nal_len {
                payload[1] |= 0x40;
                socket.mark_next_packet();
            }
            socket.update_timestamp(ts_ns);
            socket.send(buf, 12 + 2 + chunk)?;
            fu_header &= 0x7f;
        }
        Ok(())
    }
}

impl PayloadFormat for H264Format {
    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn reset(&mut self, kind: SourceKind) {
        self.framing = match kind {
            SourceKind::Piped => Framing::LengthPrefixed,
            SourceKind::Buffered => Framing::StartCode,
        };
        self.stats = ArrivalStats::default();
        self.last_arrival = None;
        self.ts_ns = 0;
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let (nal_header, nal_len, ts_ns) = match self.framing {
            Framing::LengthPrefixed => {
                read_head(source, &mut self.header)?;
                let mut len = self.prefix_len();
                if len == 0 || len > MAX_NAL_LEN {
                    len = self.resync(source)?;
                }
                self.tick();
                (self.header[4], len as usize, self.ts_ns)
            }
            Framing::StartCode => {
                read_head(source, &mut self.header)?;
                if self.header[..3] != [0, 0, 0] {
                    tracing::warn!("no start code in encoder buffer, switching to raw NAL framing");
                    self.framing = Framing::Raw;
                    let rest = source.available();
                    return skip(source, rest);
                }
                let pts_ns = source.presentation_time_us() * 1000;
                (self.header[4], source.available() + 1, pts_ns)
            }
            Framing::Raw => {
                let mut first = [0u8; 1];
                read_head(source, &mut first)?;
                let pts_ns = source.presentation_time_us() * 1000;
                (first[0], source.available() + 1, pts_ns)
            }
        };

        tracing::trace!(nal_type = nal_header & 0x1f, nal_len, "NAL unit");
        self.send_nal(nal_header, nal_len, ts_ns, source, socket)
    }
}
