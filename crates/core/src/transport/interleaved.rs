//! RTSP interleaved binary framing (RFC 2326 §10.12).
//!
//! RTP and RTCP share the RTSP TCP connection. Each binary packet is
//! prefixed with four bytes:
//!
//! ```text
//! +------+---------+----------------+
//! | '$'  | channel | length (BE 16) |
//! +------+---------+----------------+
//! ```
//!
//! The writer is shared between the RTSP client (requests) and every
//! track's packetizer (RTP frames), so a whole frame is written under one
//! lock.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Interleaved frame marker.
pub const FRAME_MAGIC: u8 = b'$';

/// A writer shared between RTSP signaling and RTP delivery.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_writer<W: Write + Send + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Write one interleaved frame and flush.
pub fn write_frame(writer: &SharedWriter, channel: u8, payload: &[u8]) -> io::Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let [hi, lo] = len.to_be_bytes();
    let mut w = writer.lock();
    w.write_all(&[FRAME_MAGIC, channel, hi, lo])?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one interleaved frame whose `$` has not been consumed yet.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    if header[0] != FRAME_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing interleaved frame marker",
        ));
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((header[1], payload))
}

/// Discard interleaved frames (typically RTCP receiver reports) sitting
/// in front of the next RTSP message.
///
/// Returns the number of frames skipped.
pub fn skip_frames<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let next = reader.fill_buf()?;
        if next.first() != Some(&FRAME_MAGIC) {
            return Ok(skipped);
        }
        let (channel, payload) = read_frame(reader)?;
        tracing::trace!(channel, len = payload.len(), "skipped interleaved frame");
        skipped += 1;
    }
}
