//! AAC over RTP, `mpeg4-generic` AAC-hbr mode (RFC 3640).
//!
//! Every packet starts with a 4-byte AU header section:
//!
//! ```text
//! +----------------------+----------------------------+
//! | AU-headers-length=16 | AU-size (13) | index (3)   |
//! +----------------------+----------------------------+
//! ```
//!
//! Two input framings are supported: ADTS frames read from a pipe
//! ([`AdtsFormat`]) and one raw access unit per encoder buffer
//! ([`LatmFormat`]).

use super::{PayloadFormat, read_body, read_head, skip};
use crate::error::PacketizeError;
use crate::source::{MediaSource, SourceKind};
use crate::transport::RtpSocket;
use crate::transport::pool::MAX_PAYLOAD_SIZE;

/// MPEG-4 sampling frequency table. Indices 13–15 are reserved.
pub const SAMPLING_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: u64 = 1024;

const AU_HEADER_LEN: usize = 4;
/// Largest access unit the 13-bit AU-size field can describe.
const MAX_AU_SIZE: usize = (1 << 13) - 1;
const ADTS_HEADER_LEN: usize = 7;
const MAX_AU_CHUNK: usize = MAX_PAYLOAD_SIZE - AU_HEADER_LEN;

pub fn sampling_rate(index: u8) -> Option<u32> {
    SAMPLING_RATES.get(index as usize).copied()
}

pub fn sampling_index(rate: u32) -> Option<u8> {
    SAMPLING_RATES.iter().position(|r| *r == rate).map(|i| i as u8)
}

/// AudioSpecificConfig fields advertised in the SDP `config=` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    /// Audio object type (2 = AAC-LC).
    pub profile: u8,
    pub sampling_index: u8,
    pub channels: u8,
}

impl AacConfig {
    /// Fails for sampling rates outside the MPEG-4 table.
    pub fn new(profile: u8, sample_rate: u32, channels: u8) -> Option<Self> {
        Some(Self {
            profile,
            sampling_index: sampling_index(sample_rate)?,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        sampling_rate(self.sampling_index).unwrap_or(0)
    }

    pub fn config(&self) -> u16 {
        ((self.profile as u16 & 0x1f) << 11)
            | ((self.sampling_index as u16 & 0x0f) << 7)
            | ((self.channels as u16 & 0x0f) << 3)
    }

    pub fn config_hex(&self) -> String {
        format!("{:x}", self.config())
    }
}

/// Fixed ADTS header fields (ISO/IEC 13818-7 §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// 0 for MPEG-4, 1 for MPEG-2.
    pub mpeg_version: u8,
    pub protection_absent: bool,
    /// Audio object type (profile + 1).
    pub profile: u8,
    pub sampling_index: u8,
    pub channels: u8,
    /// Whole frame length including the header.
    pub frame_length: usize,
    pub raw_blocks: u8,
}

impl AdtsHeader {
    pub fn parse(h: &[u8; ADTS_HEADER_LEN]) -> Result<Self, PacketizeError> {
        if h[0] != 0xff || h[1] & 0xf0 != 0xf0 {
            return Err(PacketizeError::Malformed("missing ADTS sync word".into()));
        }
        let sampling_index = (h[2] & 0x3c) >> 2;
        if sampling_rate(sampling_index).is_none() {
            return Err(PacketizeError::Malformed(format!(
                "reserved sampling frequency index {sampling_index}"
            )));
        }
        let header = Self {
            mpeg_version: (h[1] & 0x08) >> 3,
            protection_absent: h[1] & 0x01 != 0,
            profile: ((h[2] & 0xc0) >> 6) + 1,
            sampling_index,
            channels: ((h[2] & 0x01) << 2) | ((h[3] & 0xc0) >> 6),
            frame_length: (((h[3] & 0x03) as usize) << 11)
                | ((h[4] as usize) << 3)
                | ((h[5] as usize) >> 5),
            raw_blocks: (h[6] & 0x03) + 1,
        };
        if header.frame_length < header.header_len() {
            return Err(PacketizeError::Malformed(format!(
                "ADTS frame length {} shorter than its header",
                header.frame_length
            )));
        }
        Ok(header)
    }

    /// 7 bytes, or 9 with CRC.
    pub fn header_len(&self) -> usize {
        if self.protection_absent { 7 } else { 9 }
    }

    pub fn payload_len(&self) -> usize {
        self.frame_length - self.header_len()
    }

    pub fn sample_rate(&self) -> u32 {
        sampling_rate(self.sampling_index).unwrap_or(0)
    }

    pub fn config(&self) -> AacConfig {
        AacConfig {
            profile: self.profile,
            sampling_index: self.sampling_index,
            channels: self.channels,
        }
    }
}

fn au_header(au_size: usize) -> [u8; AU_HEADER_LEN] {
    [0x00, 0x10, (au_size >> 5) as u8, ((au_size << 3) & 0xf8) as u8]
}

/// Send one access unit of `len` bytes, fragmenting it when it exceeds a
/// packet. `head` holds bytes of the unit already consumed from `source`.
/// The marker goes on the last packet.
fn send_access_unit(
    len: usize,
    head: &[u8],
    source: &mut dyn MediaSource,
    socket: &mut RtpSocket,
) -> Result<(), PacketizeError> {
    let mut sent = 0;
    let mut head = head;
    while sent < len {
        let chunk = (len - sent).min(MAX_AU_CHUNK);
        let mut buf = socket.request_buffer();
        let payload = buf.payload_mut();
        payload[..AU_HEADER_LEN].copy_from_slice(&au_header(len));
        let body = &mut payload[AU_HEADER_LEN..AU_HEADER_LEN + chunk];
        let copied = head.len().min(chunk);
        body[..copied].copy_from_slice(&head[..copied]);
        head = &head[copied..];
        read_body(source, &mut body[copied..])?;
        sent += chunk;
        if sent >= len {
            socket.mark_next_packet();
        }
        socket.send(buf, 12 + AU_HEADER_LEN + chunk)?;
    }
    Ok(())
}

/// AAC from an ADTS-framed byte pipe. Timestamps advance by 1024 samples
/// per frame at the sampling rate read from each header.
pub struct AdtsFormat {
    config: AacConfig,
    samples: u64,
}

impl AdtsFormat {
    pub fn new(config: AacConfig) -> Self {
        Self { config, samples: 0 }
    }

    /// Scan forward to the next `0xFFF` sync word.
    fn sync(source: &mut dyn MediaSource, header: &mut [u8; ADTS_HEADER_LEN]) -> Result<(), PacketizeError> {
        let mut byte = [0u8; 1];
        loop {
            read_head(source, &mut byte)?;
            if byte[0] != 0xff {
                continue;
            }
            read_head(source, &mut byte)?;
            if byte[0] & 0xf0 == 0xf0 {
                header[0] = 0xff;
                header[1] = byte[0];
                return Ok(());
            }
        }
    }
}

impl PayloadFormat for AdtsFormat {
    fn clock_rate(&self) -> u32 {
        self.config.sample_rate()
    }

    fn reset(&mut self, _kind: SourceKind) {
        self.samples = 0;
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let mut raw = [0u8; ADTS_HEADER_LEN];
        Self::sync(source, &mut raw)?;
        read_body(source, &mut raw[2..])?;
        let header = AdtsHeader::parse(&raw)?;
        if !header.protection_absent {
            skip(source, 2)?;
        }

        tracing::trace!(
            len = header.frame_length,
            rate = header.sample_rate(),
            channels = header.channels,
            "ADTS frame"
        );

        socket.set_clock_frequency(header.sample_rate());
        self.samples += SAMPLES_PER_FRAME;
        socket.set_rtp_timestamp(self.samples as u32);
        send_access_unit(header.payload_len(), &[], source, socket)
    }
}

/// AAC access units delivered one per encoder buffer. Timestamps come from
/// presentation times; a buffer older than its predecessor is dropped.
pub struct LatmFormat {
    config: AacConfig,
    last_pts_us: Option<u64>,
}

impl LatmFormat {
    pub fn new(config: AacConfig) -> Self {
        Self {
            config,
            last_pts_us: None,
        }
    }
}

impl PayloadFormat for LatmFormat {
    fn clock_rate(&self) -> u32 {
        self.config.sample_rate()
    }

    fn reset(&mut self, _kind: SourceKind) {
        self.last_pts_us = None;
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        let mut first = [0u8; 1];
        read_head(source, &mut first)?;
        let len = source.available() + 1;
        let pts_us = source.presentation_time_us();

        if len > MAX_AU_SIZE {
            tracing::warn!(len, max = MAX_AU_SIZE, "AAC access unit too large for AU-size, dropped");
            return skip(source, len - 1);
        }
        if let Some(last) = self.last_pts_us
            && pts_us < last
        {
            tracing::debug!(pts_us, last, "out-of-order AAC buffer dropped");
            return skip(source, len - 1);
        }
        self.last_pts_us = Some(pts_us);
        socket.update_timestamp(pts_us * 1000);

        send_access_unit(len, &first, source, socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::PacketInfo;
    use crate::media::testing::capture_socket;
    use crate::source::{ReaderSource, buffer_channel};
    use std::io::Cursor;

    /// Build an ADTS frame: AAC-LC, given sampling index, stereo.
    fn adts_frame(sampling_index: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() + 7;
        let mut h = vec![
            0xff,
            0xf1,
            (1 << 6) | (sampling_index << 2),
            (2 << 6) | ((len >> 11) as u8 & 0x03),
            (len >> 3) as u8,
            ((len & 0x07) << 5) as u8 | 0x1f,
            0xfc,
        ];
        h.extend_from_slice(payload);
        h
    }

    #[test]
    fn parses_adts_header() {
        let frame = adts_frame(4, &[0u8; 100]);
        let raw: [u8; 7] = frame[..7].try_into().unwrap();
        let h = AdtsHeader::parse(&raw).unwrap();
        assert_eq!(h.mpeg_version, 0);
        assert!(h.protection_absent);
        assert_eq!(h.profile, 2);
        assert_eq!(h.sample_rate(), 44100);
        assert_eq!(h.channels, 2);
        assert_eq!(h.frame_length, 107);
        assert_eq!(h.payload_len(), 100);
    }

    #[test]
    fn rejects_reserved_sampling_indices() {
        for index in 13..=15u8 {
            let frame = adts_frame(index, &[0u8; 10]);
            let raw: [u8; 7] = frame[..7].try_into().unwrap();
            assert!(
                matches!(AdtsHeader::parse(&raw), Err(PacketizeError::Malformed(_))),
                "index {index} must be rejected"
            );
        }
        assert_eq!(sampling_rate(12), Some(7350));
        assert_eq!(sampling_rate(13), None);
    }

    #[test]
    fn config_value() {
        let c = AacConfig::new(2, 44100, 2).unwrap();
        assert_eq!(c.config(), 0x1210);
        assert_eq!(c.config_hex(), "1210");
        assert!(AacConfig::new(2, 44000, 2).is_none());
    }

    #[test]
    fn adts_frames_become_au_packets() {
        let (mut socket, capture) = capture_socket();
        let mut data = vec![0x00, 0x12];
        data.extend(adts_frame(3, &[0xAB; 200]));
        data.extend(adts_frame(3, &[0xCD; 50]));
        let mut source = ReaderSource::new(Cursor::new(data));
        let mut format = AdtsFormat::new(AacConfig::new(2, 48000, 2).unwrap());

        format.send_next(&mut source, &mut socket).unwrap();
        format.send_next(&mut source, &mut socket).unwrap();
        assert!(matches!(
            format.send_next(&mut source, &mut socket),
            Err(PacketizeError::EndOfStream)
        ));

        let packets = capture.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][12..16], &au_header(200));
        assert_eq!(packets[0].len(), 12 + 4 + 200);
        assert_eq!(socket.clock_frequency(), 48000);

        let first = PacketInfo::parse(&packets[0]).unwrap();
        let second = PacketInfo::parse(&packets[1]).unwrap();
        assert!(first.marker && second.marker);
        assert_eq!(second.timestamp - first.timestamp, 1024);
    }

    #[test]
    fn large_adts_frame_is_fragmented() {
        let (mut socket, capture) = capture_socket();
        let data = adts_frame(4, &[0x11; 2000]);
        let mut source = ReaderSource::new(Cursor::new(data));
        let mut format = AdtsFormat::new(AacConfig::new(2, 44100, 2).unwrap());
        format.send_next(&mut source, &mut socket).unwrap();

        let packets = capture.packets();
        assert_eq!(packets.len(), 2);
        let payload: usize = packets.iter().map(|p| p.len() - 16).sum();
        assert_eq!(payload, 2000);
        assert!(!PacketInfo::parse(&packets[0]).unwrap().marker);
        assert!(PacketInfo::parse(&packets[1]).unwrap().marker);
    }

    #[test]
    fn latm_uses_presentation_time_and_drops_late_buffers() {
        let (mut socket, capture) = capture_socket();
        let (sink, mut source) = buffer_channel(4);
        let mut format = LatmFormat::new(AacConfig::new(2, 8000, 1).unwrap());
        socket.set_clock_frequency(format.clock_rate());

        sink.push(vec![1, 2, 3], 1_000_000).unwrap();
        sink.push(vec![4, 5], 500_000).unwrap();
        sink.push(vec![6], 1_128_000).unwrap();
        for _ in 0..3 {
            format.send_next(&mut source, &mut socket).unwrap();
        }

        let packets = capture.packets();
        assert_eq!(packets.len(), 2, "late buffer dropped");
        assert_eq!(&packets[0][16..], &[1, 2, 3]);
        assert_eq!(PacketInfo::parse(&packets[0]).unwrap().timestamp, 8000);
        assert_eq!(PacketInfo::parse(&packets[1]).unwrap().timestamp, 9024);
    }

    #[test]
    fn latm_drops_units_beyond_au_size() {
        let (mut socket, capture) = capture_socket();
        let (sink, mut source) = buffer_channel(4);
        let mut format = LatmFormat::new(AacConfig::new(2, 48000, 2).unwrap());

        sink.push(vec![0x22; MAX_AU_SIZE + 1], 0).unwrap();
        sink.push(vec![0x33; MAX_AU_SIZE], 21_333).unwrap();
        format.send_next(&mut source, &mut socket).unwrap();
        format.send_next(&mut source, &mut socket).unwrap();

        let packets = capture.packets();
        assert!(packets.iter().all(|p| p[12..16] == au_header(MAX_AU_SIZE)));
        let payload: usize = packets.iter().map(|p| p.len() - 16).sum();
        assert_eq!(payload, MAX_AU_SIZE, "only the unit that fits is sent");
    }
}
