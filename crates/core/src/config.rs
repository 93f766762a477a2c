use std::time::Duration;

/// How an encoder hands its output to a packetizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingMode {
    /// A continuous byte pipe with no framing metadata (MediaRecorder style).
    /// Timestamps are interpolated from arrival times.
    Piped,
    /// Discrete encoded buffers carrying presentation times (MediaCodec style).
    Buffered,
}

impl EncodingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Piped => "piped",
            Self::Buffered => "buffered",
        }
    }
}

/// Environment-dependent defaults, decided once at startup and handed to
/// every [`Session`](crate::Session) and stream built from it.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Mode used by streams that don't request one explicitly.
    pub suggested_mode: EncodingMode,
    /// Default multicast/unicast time-to-live.
    pub time_to_live: u8,
    /// Address advertised in the SDP `o=` line.
    pub origin: String,
    /// Default RTP destination until one is set.
    pub destination: String,
    /// Period of the bitrate report while streaming.
    pub bitrate_period: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            suggested_mode: EncodingMode::Buffered,
            time_to_live: 64,
            origin: "127.0.0.1".to_string(),
            destination: "127.0.0.1".to_string(),
            bitrate_period: Duration::from_millis(500),
        }
    }
}

impl StreamingConfig {
    pub fn with_mode(mut self, mode: EncodingMode) -> Self {
        self.suggested_mode = mode;
        self
    }
}
