//! Minimal MP4 box walker.
//!
//! Used once per device configuration to pull the H.264 SPS and PPS out of
//! a short test recording, when the encoder is recorder-style and never
//! reports them directly.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use super::H264Params;

const STSD_PATH: &str = "/moov/trak/mdia/minf/stbl/stsd";
const MAX_DEPTH: usize = 32;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Box names are four lowercase letters or digits.
fn valid_box_name(name: &[u8]) -> bool {
    name.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Offsets of every box in a file, keyed by path (`/moov/trak/...`).
#[derive(Debug, Default)]
pub struct BoxTree {
    boxes: HashMap<String, usize>,
}

impl BoxTree {
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut tree = Self::default();
        tree.walk(data, 0, data.len(), "", 0)?;
        Ok(tree)
    }

    /// Offset of the box header at `path`.
    pub fn offset(&self, path: &str) -> Option<usize> {
        self.boxes.get(path).copied()
    }

    fn walk(&mut self, data: &[u8], start: usize, end: usize, path: &str, depth: usize) -> io::Result<()> {
        if depth > MAX_DEPTH {
            return Err(invalid("mp4 boxes nested too deeply"));
        }
        let mut pos = start;
        while pos + 8 <= end {
            let name = &data[pos + 4..pos + 8];
            if !valid_box_name(name) {
                // Leaf payload, not a child box.
                return Ok(());
            }
            let size32 = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            let (header, size) = match size32 {
                0 => (8, end - pos),
                1 => {
                    if pos + 16 > end {
                        return Err(invalid("truncated 64-bit box size"));
                    }
                    let mut large = [0u8; 8];
                    large.copy_from_slice(&data[pos + 8..pos + 16]);
                    (16, u64::from_be_bytes(large) as usize)
                }
                n => (8, n as usize),
            };
            if size < header || pos + size > end {
                return Err(invalid(format!("bad size {size} for box at {pos}")));
            }

            let child = format!("{path}/{}", String::from_utf8_lossy(name));
            tracing::trace!(path = %child, pos, size, "mp4 box");
            self.boxes.insert(child.clone(), pos);
            self.walk(data, pos + header, pos + size, &child, depth + 1)?;
            pos += size;
        }
        Ok(())
    }
}

/// H.264 decoder configuration found in a recording's `avcC` box
/// (ISO/IEC 14496-15 §5.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4Config {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl Mp4Config {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::parse(&std::fs::read(path)?)
    }

    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let tree = BoxTree::parse(data)?;
        let stsd = tree
            .offset(STSD_PATH)
            .ok_or_else(|| invalid("stsd box not found"))?;

        let avcc = data[stsd + 8..]
            .windows(4)
            .position(|w| w == b"avcC")
            .map(|i| stsd + 8 + i + 4)
            .ok_or_else(|| invalid("avcC box not found"))?;

        // version, profile, compatibility, level, length size, SPS count
        let mut r = Cursor::new(data, avcc + 6);
        let sps_len = r.u16()? as usize;
        let sps = r.take(sps_len)?.to_vec();
        let _pps_count = r.u8()?;
        let pps_len = r.u16()? as usize;
        let pps = r.take(pps_len)?.to_vec();

        if sps.is_empty() || pps.is_empty() {
            return Err(invalid("empty parameter set in avcC"));
        }
        Ok(Self { sps, pps })
    }

    pub fn into_params(self) -> H264Params {
        H264Params::new(self.sps, self.pps)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let out = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| invalid("truncated avcC box"))?;
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
