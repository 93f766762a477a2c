use std::fmt::Write as _;
use std::io::{BufRead, Read};

use crate::error::{ParseErrorKind, Result, RtspError};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. The same type is
/// used in both directions: the server parses it, the push client builds
/// and [`serialize`](Self::serialize)s it.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/trackID=1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Body, `Content-Length` bytes after the blank line.
    pub body: String,
}

fn parse_error(kind: ParseErrorKind) -> RtspError {
    RtspError::Parse { kind }
}

/// Split a header line at its first colon.
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| parse_error(ParseErrorKind::InvalidHeader))?;
    Ok((
        line[..colon].trim().to_string(),
        line[colon + 1..].trim().to_string(),
    ))
}

/// Longest accepted request, status or header line, terminator included.
pub const MAX_LINE_LEN: usize = 8 * 1024;
/// Largest accepted `Content-Length`.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// Read one line of at most [`MAX_LINE_LEN`] bytes. Returns 0 at end of
/// stream.
pub(crate) fn read_line<R: BufRead>(reader: &mut R, line: &mut String) -> Result<usize> {
    let n = reader.by_ref().take(MAX_LINE_LEN as u64).read_line(line)?;
    if n == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(parse_error(ParseErrorKind::LineTooLong));
    }
    Ok(n)
}

/// Read header lines up to the blank line terminating them.
///
/// A malformed line does not stop the read: the block is consumed to its
/// end so the next message starts in the right place, then the first
/// error is returned.
pub(crate) fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    let mut malformed = None;
    loop {
        let mut line = String::new();
        if read_line(reader, &mut line)? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return match malformed {
                Some(e) => Err(e),
                None => Ok(headers),
            };
        }
        match parse_header_line(line) {
            Ok(header) if malformed.is_none() => headers.push(header),
            Ok(_) => {}
            Err(e) => {
                malformed.get_or_insert(e);
            }
        }
    }
}

/// Read a body of `Content-Length` bytes, if the header is present.
pub(crate) fn read_body<R: BufRead>(reader: &mut R, headers: &[(String, String)]) -> Result<String> {
    let len = match find_header(headers, "Content-Length") {
        Some(v) => v
            .parse::<usize>()
            .ok()
            .filter(|&len| len <= MAX_BODY_LEN)
            .ok_or_else(|| parse_error(ParseErrorKind::InvalidContentLength))?,
        None => return Ok(String::new()),
    };
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

impl RtspRequest {
    /// A request to send, with an empty header list.
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: "RTSP/1.0".to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }

    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a complete request: request line, headers, and trailing blank
    /// line, optionally followed by the body. Returns [`RtspError::Parse`] on
    /// malformed input.
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = match raw.find("\r\n\r\n") {
            Some(i) => (&raw[..i], &raw[i + 4..]),
            None => (raw, ""),
        };
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| parse_error(ParseErrorKind::EmptyRequest))?;
        let mut request = Self::parse_request_line(request_line)?;

        for line in lines {
            if line.is_empty() {
                break;
            }
            request.headers.push(parse_header_line(line)?);
        }
        request.body = body.to_string();
        Ok(request)
    }

    /// Read one request from a connection.
    ///
    /// Returns `Ok(None)` when the peer closed the connection before
    /// sending anything. Blank lines between requests are skipped.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Option<Self>> {
        let request_line = loop {
            let mut line = String::new();
            if read_line(reader, &mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                break line.to_string();
            }
        };

        // Headers are consumed even after a bad request line so the next
        // read starts at the next request.
        let parsed = Self::parse_request_line(&request_line);
        let headers = read_headers(reader)?;
        let mut request = parsed?;
        request.headers = headers;
        request.body = read_body(reader, &request.headers)?;
        Ok(Some(request))
    }

    fn parse_request_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        }

        let version = parts[2].to_string();
        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        Ok(RtspRequest {
            method: parts[0].to_ascii_uppercase(),
            uri: parts[1].to_string(),
            version,
            headers: Vec::new(),
            body: String::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Serialize to the RTSP text wire format. `Content-Length` is written
    /// when there is a body.
    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if !self.body.is_empty() && self.get_header("Content-Length").is_none() {
            let _ = write!(out, "Content-Length: {}\r\n", self.body.len());
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}
