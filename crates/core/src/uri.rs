//! Session options carried in the requested URI.
//!
//! ```text
//! rtsp://host:8086/live?h264=800-25-1280-720&aac=64-44100&multicast=239.0.0.1&ttl=16
//! ```
//!
//! | Option | Value |
//! |--------|-------|
//! | `h264`, `h263` | optional `bitrate(kbps)-fps-width-height` |
//! | `aac`, `amr` (`amrnb`) | optional `bitrate(kbps)-samplingrate` |
//! | `unicast` | destination address |
//! | `multicast` | group address, `228.5.6.7` when empty |
//! | `ttl` | time-to-live |
//! | `videoapi`, `audioapi` | `mr` for a piped recorder, `mc` for buffer output |
//!
//! Unknown options are ignored. A URI without codec options asks the
//! session factory for its defaults.

use crate::config::EncodingMode;
use crate::media::Codec;

/// Group used by `multicast` without an address.
pub const DEFAULT_MULTICAST_GROUP: &str = "228.5.6.7";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoQuality {
    /// Bits per second.
    pub bitrate: u32,
    pub framerate: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for VideoQuality {
    fn default() -> Self {
        Self {
            bitrate: 500_000,
            framerate: 20,
            width: 176,
            height: 144,
        }
    }
}

impl VideoQuality {
    /// Parse `bitrate-fps-width-height`. Missing or malformed fields keep
    /// their defaults.
    pub fn parse(value: &str) -> Self {
        let mut quality = Self::default();
        let mut fields = value.split('-').map(|f| f.trim().parse::<u32>().ok());
        if let Some(Some(kbps)) = fields.next() {
            quality.bitrate = kbps.saturating_mul(1000);
        }
        if let Some(Some(fps)) = fields.next() {
            quality.framerate = fps;
        }
        if let Some(Some(width)) = fields.next() {
            quality.width = width;
        }
        if let Some(Some(height)) = fields.next() {
            quality.height = height;
        }
        quality
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioQuality {
    /// Bits per second.
    pub bitrate: u32,
    pub sampling_rate: u32,
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self {
            bitrate: 32_000,
            sampling_rate: 8_000,
        }
    }
}

impl AudioQuality {
    /// Parse `bitrate-samplingrate`.
    pub fn parse(value: &str) -> Self {
        let mut quality = Self::default();
        let mut fields = value.split('-').map(|f| f.trim().parse::<u32>().ok());
        if let Some(Some(kbps)) = fields.next() {
            quality.bitrate = kbps.saturating_mul(1000);
        }
        if let Some(Some(rate)) = fields.next() {
            quality.sampling_rate = rate;
        }
        quality
    }
}

/// Options parsed from a request URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriOptions {
    /// Path component, `/` when empty.
    pub path: String,
    pub video: Option<(Codec, VideoQuality)>,
    pub audio: Option<(Codec, AudioQuality)>,
    pub destination: Option<String>,
    pub multicast: bool,
    pub ttl: Option<u8>,
    pub video_mode: Option<EncodingMode>,
    pub audio_mode: Option<EncodingMode>,
}

fn parse_mode(value: &str) -> Option<EncodingMode> {
    match value.to_ascii_lowercase().as_str() {
        "mr" => Some(EncodingMode::Piped),
        "mc" => Some(EncodingMode::Buffered),
        _ => None,
    }
}

impl UriOptions {
    /// ```
    /// use streaming::uri::UriOptions;
    /// use streaming::media::Codec;
    ///
    /// let opts = UriOptions::parse("rtsp://10.0.0.1:8086/live?h264=800-25-1280-720&unicast=10.0.0.9");
    /// assert_eq!(opts.path, "/live");
    /// let (codec, quality) = opts.video.unwrap();
    /// assert_eq!(codec, Codec::H264);
    /// assert_eq!(quality.bitrate, 800_000);
    /// assert_eq!(opts.destination.as_deref(), Some("10.0.0.9"));
    /// ```
    pub fn parse(uri: &str) -> Self {
        let rest = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
            .map(|after| after.find('/').map_or("", |i| &after[i..]))
            .unwrap_or(uri);
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut options = Self {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key.to_ascii_lowercase().as_str() {
                "h264" => options.video = Some((Codec::H264, VideoQuality::parse(value))),
                "h263" => options.video = Some((Codec::H263, VideoQuality::parse(value))),
                "aac" => options.audio = Some((Codec::AacAdts, AudioQuality::parse(value))),
                "amr" | "amrnb" => options.audio = Some((Codec::Amr, AudioQuality::parse(value))),
                "unicast" if !value.is_empty() => {
                    options.destination = Some(value.to_string());
                    options.multicast = false;
                }
                "multicast" => {
                    options.multicast = true;
                    options.destination = Some(if value.is_empty() {
                        DEFAULT_MULTICAST_GROUP.to_string()
                    } else {
                        value.to_string()
                    });
                }
                "ttl" => match value.parse() {
                    Ok(ttl) => options.ttl = Some(ttl),
                    Err(_) => tracing::warn!(value, "ignoring invalid ttl option"),
                },
                "videoapi" => options.video_mode = parse_mode(value),
                "audioapi" => options.audio_mode = parse_mode(value),
                other => tracing::debug!(option = other, "ignoring unknown uri option"),
            }
        }
        options
    }

    /// No codec was named: the factory picks its defaults.
    pub fn wants_defaults(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}
