//! Error types for the streaming library.

use std::fmt;
use std::io;

/// Errors that can occur in the streaming library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`UnexpectedStatus`](Self::UnexpectedStatus),
///   [`InvalidResponse`](Self::InvalidResponse). Malformed or unexpected RTSP messages.
/// - **Transport**: [`Io`](Self::Io). Socket/network failures.
/// - **Streams**: [`Stream`](Self::Stream). A track failed to configure or start,
///   classified by [`StreamErrorKind`].
/// - **Lifecycle**: [`InvalidState`](Self::InvalidState), [`UnknownTrack`](Self::UnknownTrack),
///   [`NotStarted`](Self::NotStarted), [`AlreadyRunning`](Self::AlreadyRunning).
/// - **Authentication**: [`BadCredentials`](Self::BadCredentials),
///   [`AccessForbidden`](Self::AccessForbidden), [`MissingCredentials`](Self::MissingCredentials).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an RTSP message (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A track failed to configure or start.
    #[error("stream error on track {track:?}: {source}")]
    Stream {
        track: Option<u8>,
        source: StreamError,
    },

    /// Operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The session has no track with this id.
    #[error("no such track: {0}")]
    UnknownTrack(u8),

    /// The server rejected our credentials twice in a row.
    #[error("bad credentials")]
    BadCredentials,

    /// The server answered 403.
    #[error("access forbidden")]
    AccessForbidden,

    /// The server asked for credentials and none are configured.
    #[error("server requires authentication")]
    MissingCredentials,

    /// The peer answered with a status we cannot continue from.
    #[error("unexpected RTSP status {0}")]
    UnexpectedStatus(u16),

    /// The peer's response is missing something we need.
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RtspError {
    /// Classify this error into the caller-facing taxonomy.
    pub fn stream_kind(&self) -> StreamErrorKind {
        match self {
            Self::Stream { source, .. } => source.kind,
            _ => StreamErrorKind::Other,
        }
    }

    pub(crate) fn stream(track: u8, source: StreamError) -> Self {
        Self::Stream {
            track: Some(track),
            source,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `RTSP/1.0 Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number, or above [`MAX_BODY_LEN`](crate::protocol::MAX_BODY_LEN).
    InvalidContentLength,
    /// A request, status or header line had no end within
    /// [`MAX_LINE_LEN`](crate::protocol::MAX_LINE_LEN) bytes.
    LineTooLong,
}

impl ParseErrorKind {
    /// After these the reader no longer knows where the next message starts.
    pub fn loses_framing(self) -> bool {
        matches!(self, Self::InvalidContentLength | Self::LineTooLong)
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::LineTooLong => write!(f, "line too long"),
        }
    }
}

/// Failure kinds surfaced to session callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorKind {
    /// Capture device unavailable.
    CameraAlreadyInUse,
    /// Requested bitrate/resolution/framerate rejected by the encoder.
    ConfigurationNotSupported,
    /// Scratch storage needed for capability probing is missing.
    StorageUnavailable,
    /// No or invalid render target supplied.
    InvalidSurface,
    /// Destination address failed to resolve.
    UnknownHost,
    /// Catch-all I/O or runtime failure.
    Other,
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CameraAlreadyInUse => "camera already in use",
            Self::ConfigurationNotSupported => "configuration not supported",
            Self::StorageUnavailable => "storage unavailable",
            Self::InvalidSurface => "invalid surface",
            Self::UnknownHost => "unknown host",
            Self::Other => "stream failure",
        };
        f.write_str(s)
    }
}

/// A classified failure reported by an encoder collaborator or a stream.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Other, message)
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::other(e.to_string())
    }
}

/// Why a packetizer worker stopped.
#[derive(Debug, thiserror::Error)]
pub enum PacketizeError {
    /// The input source was closed by `stop()`.
    #[error("source closed")]
    Closed,
    /// The encoder finished on a frame boundary.
    #[error("end of stream")]
    EndOfStream,
    /// The bitstream could not be framed.
    #[error("malformed bitstream: {0}")]
    Malformed(String),
    /// Sending a packet failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PacketizeError {
    /// Normal terminations end the worker without logging an error.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Closed | Self::EndOfStream)
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
