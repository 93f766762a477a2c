use std::fmt::Write as _;
use std::io::BufRead;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::request::{find_header, read_body, read_headers, read_line};
use crate::transport::interleaved;

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// Server: rtsp-streaming/0.1\r\n
/// CSeq: 1\r\n
/// Content-Length: 142\r\n
/// Content-Type: application/sdp\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is always written, 0 without a body.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "rtsp-streaming/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    /// 401 Unauthorized with a Basic challenge for `realm`.
    pub fn unauthorized(realm: &str) -> Self {
        Self::new(401, "Unauthorized")
            .add_header("WWW-Authenticate", &format!("Basic realm=\"{realm}\""))
    }

    /// 404 Not Found: the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 500 Internal Server Error: processing the request failed.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace a header, or add it when absent.
    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Serialize to the RTSP text wire format (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let body = self.body.as_deref().unwrap_or("");
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            let _ = write!(response, "{name}: {value}\r\n");
        }
        let _ = write!(response, "Content-Length: {}\r\n\r\n", body.len());
        response.push_str(body);
        response
    }

    /// Read one response from the server side of a connection.
    ///
    /// Interleaved frames the server sends ahead of the response (RTCP
    /// reports on a TCP-interleaved session) are discarded first.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        interleaved::skip_frames(reader)?;

        let mut line = String::new();
        if read_line(reader, &mut line)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )
            .into());
        }
        let status_line = line.trim_end_matches(['\r', '\n']);
        let mut parts = status_line.splitn(3, ' ');
        let (version, code) = (parts.next(), parts.next());
        let code = match (version, code.and_then(|c| c.parse::<u16>().ok())) {
            (Some(v), Some(code)) if v.starts_with("RTSP/") => code,
            _ => {
                return Err(RtspError::Parse {
                    kind: ParseErrorKind::InvalidStatusLine,
                });
            }
        };
        let text = parts.next().unwrap_or("").to_string();

        let headers = read_headers(reader)?;
        let body = read_body(reader, &headers)?;

        tracing::trace!(status = code, headers = headers.len(), "response");
        Ok(Self {
            status_code: code,
            status_text: text,
            headers,
            body: (!body.is_empty()).then_some(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "DESCRIBE,SETUP,TEARDOWN,PLAY,PAUSE");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("Server: rtsp-streaming/0.1\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: DESCRIBE,SETUP,TEARDOWN,PLAY,PAUSE\r\n"));
        assert!(
            s.ends_with("Content-Length: 0\r\n\r\n"),
            "Content-Length is always present"
        );
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let s = RtspResponse::unauthorized("cam").serialize();
        assert!(s.starts_with("RTSP/1.0 401 Unauthorized\r\n"));
        assert!(s.contains("WWW-Authenticate: Basic realm=\"cam\"\r\n"));
    }

    #[test]
    fn set_header_replaces_server() {
        let resp = RtspResponse::not_found().set_header("Server", "Phone Server");
        assert_eq!(resp.get_header("server"), Some("Phone Server"));
        assert_eq!(resp.headers.len(), 1);
    }

    #[test]
    fn read_response_after_interleaved_frames() {
        let mut raw = vec![b'$', 1, 0, 3, 9, 9, 9];
        raw.extend_from_slice(
            b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"x\", nonce=\"y\"\r\nContent-Length: 2\r\n\r\nhi",
        );
        let resp = RtspResponse::read_from(&mut Cursor::new(raw)).unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.status_text, "Unauthorized");
        assert_eq!(resp.get_header("cseq"), Some("1"));
        assert_eq!(resp.body.as_deref(), Some("hi"));
    }

    #[test]
    fn read_response_rejects_garbage() {
        let err = RtspResponse::read_from(&mut Cursor::new(b"HTTP 200\r\n\r\n".to_vec())).unwrap_err();
        assert!(matches!(err, RtspError::Parse { kind: ParseErrorKind::InvalidStatusLine }));
        assert!(RtspResponse::read_from(&mut Cursor::new(Vec::new())).is_err());
    }
}
