use super::{PayloadFormat, read_body, read_head};
use crate::error::PacketizeError;
use crate::source::{MediaSource, SourceKind};
use crate::transport::RtpSocket;

/// Magic at the start of a raw AMR-NB file (RFC 4867 §5).
pub const AMR_MAGIC: &[u8; 6] = b"#!AMR\n";

/// Samples per 20 ms frame at 8 kHz.
const SAMPLES_PER_FRAME: u32 = 160;

/// Codec mode request: no preference.
const CMR_NONE: u8 = 0xf0;

/// Speech bits per frame type 0–7 (4.75 to 12.2 kbit/s).
const FRAME_BITS: [usize; 8] = [95, 103, 118, 134, 148, 159, 204, 244];
const FRAME_TYPE_SID: u8 = 8;
const FRAME_TYPE_NO_DATA: u8 = 15;

/// Speech payload size in bytes for a frame type, `None` for reserved types.
pub fn frame_size(frame_type: u8) -> Option<usize> {
    let bits = match frame_type {
        0..=7 => FRAME_BITS[frame_type as usize],
        FRAME_TYPE_SID => 39,
        FRAME_TYPE_NO_DATA => 0,
        _ => return None,
    };
    Some(bits.div_ceil(8))
}

/// AMR-NB RTP payload format, octet-aligned (RFC 4867 §4.4).
///
/// One frame per packet: `CMR | TOC | speech bits`. Every packet carries the
/// marker bit and the timestamp advances 160 samples per frame.
#[derive(Debug, Default)]
pub struct AmrFormat {
    magic_checked: bool,
    samples: u32,
}

impl AmrFormat {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadFormat for AmrFormat {
    fn clock_rate(&self) -> u32 {
        8_000
    }

    fn reset(&mut self, _kind: SourceKind) {
        self.magic_checked = false;
        self.samples = 0;
    }

    fn send_next(
        &mut self,
        source: &mut dyn MediaSource,
        socket: &mut RtpSocket,
    ) -> Result<(), PacketizeError> {
        if !self.magic_checked {
            let mut magic = [0u8; AMR_MAGIC.len()];
            read_head(source, &mut magic)?;
            if &magic != AMR_MAGIC {
                return Err(PacketizeError::Malformed("missing #!AMR header".into()));
            }
            self.magic_checked = true;
        }

        let mut buf = socket.request_buffer();
        let payload = buf.payload_mut();
        payload[0] = CMR_NONE;
        read_head(source, &mut payload[1..2])?;
        let toc = payload[1];
        let frame_type = (toc >> 3) & 0x0f;
        let size = frame_size(frame_type)
            .ok_or_else(|| PacketizeError::Malformed(format!("reserved AMR frame type {frame_type}")))?;
        read_body(source, &mut payload[2..2 + size])?;

        self.samples = self.samples.wrapping_add(SAMPLES_PER_FRAME);
        socket.set_rtp_timestamp(self.samples);
        socket.mark_next_packet();
        socket.send(buf, 12 + 2 + size)?;
        Ok(())
    }
}
