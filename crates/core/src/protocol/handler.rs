use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::error::{Result, RtspError};
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::transport::TransportHeader;
use crate::server::{ServerError, ServerEvent, Shared};
use crate::session::Session;
use crate::uri::UriOptions;

/// Handles RTSP method requests for a single TCP connection.
///
/// A connection owns at most one [`Session`] at a time, created by
/// DESCRIBE (or by SETUP when the client skipped DESCRIBE).
pub struct MethodHandler {
    shared: Arc<Shared>,
    connection: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    session: Option<Session>,
    session_id: String,
}

/// Track id from a `.../trackID=N` URI.
fn track_id(uri: &str) -> Option<&str> {
    let start = uri.to_ascii_lowercase().find("trackid=")? + "trackid=".len();
    let rest = &uri[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

fn is_multicast(destination: &str) -> bool {
    if let Ok(ip) = destination.parse::<IpAddr>() {
        return ip.is_multicast();
    }
    (destination, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .is_some_and(|a| a.ip().is_multicast())
}

impl MethodHandler {
    pub(crate) fn new(
        shared: Arc<Shared>,
        connection: u64,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        MethodHandler {
            shared,
            connection,
            peer_addr,
            local_addr,
            session: None,
            session_id: format!("{:016x}", rand::random::<u64>()),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Always produces a response. Processing failures become 500 and are
    /// reported to the server listeners.
    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let response = match self.process(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(peer = %self.peer_addr, method = %request.method, error = %e, "request failed");
                self.shared.post_error(ServerError::StartFailed {
                    kind: e.stream_kind(),
                    message: e.to_string(),
                });
                RtspResponse::internal_error()
            }
        };
        match request.cseq() {
            Some(cseq) => response.set_header("CSeq", cseq),
            None => response,
        }
    }

    fn authorized(&self, request: &RtspRequest) -> bool {
        match &self.shared.config.credentials {
            Some(creds) if !creds.username.is_empty() => {
                creds.check_basic(request.get_header("Authorization"))
            }
            _ => true,
        }
    }

    fn process(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        if request.method != "OPTIONS" && !self.authorized(request) {
            tracing::warn!(peer = %self.peer_addr, method = %request.method, "unauthorized request");
            return Ok(RtspResponse::unauthorized(&self.shared.config.server_name));
        }

        match request.method.as_str() {
            "OPTIONS" => Ok(RtspResponse::ok().add_header("Public", "DESCRIBE,SETUP,TEARDOWN,PLAY,PAUSE")),
            "DESCRIBE" => self.handle_describe(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => Ok(self.handle_play()),
            "PAUSE" | "TEARDOWN" => Ok(RtspResponse::ok()),
            _ => {
                tracing::warn!(peer = %self.peer_addr, method = %request.method, "unknown RTSP method");
                Ok(RtspResponse::bad_request())
            }
        }
    }

    /// Build a session for `uri` and attach it to this connection,
    /// releasing the previous one.
    fn open_session(&mut self, uri: &str) -> Result<Session> {
        let options = UriOptions::parse(uri);
        let session = self.shared.factory.create(&options)?;

        session.set_origin(self.local_addr.ip().to_string());
        match &options.destination {
            Some(destination) => session.set_destination(destination.clone()),
            None => session.set_destination(self.peer_addr.ip().to_string()),
        }
        if let Some(ttl) = options.ttl {
            session.set_time_to_live(ttl);
        }

        if let Some(old) = self.session.replace(session.clone()) {
            old.sync_stop();
            old.release();
        }
        self.shared.register(self.connection, session.clone());
        tracing::debug!(peer = %self.peer_addr, session = session.id(), path = %options.path, "session attached");
        Ok(session)
    }

    fn handle_describe(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let session = self.open_session(&request.uri)?;
        session.sync_configure()?;
        let sdp = session.session_description()?;

        Ok(RtspResponse::ok()
            .add_header("Content-Base", &format!("rtsp://{}/", self.local_addr))
            .add_header("Content-Type", "application/sdp")
            .with_body(sdp))
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> Result<RtspResponse> {
        let Some(id) = track_id(&request.uri).and_then(|t| t.parse::<u8>().ok()) else {
            tracing::warn!(peer = %self.peer_addr, uri = %request.uri, "SETUP without track id");
            return Ok(RtspResponse::bad_request());
        };

        let session = match &self.session {
            Some(s) => s.clone(),
            None => self.open_session(&request.uri)?,
        };
        let Some(info) = session.track_info(id) else {
            tracing::warn!(peer = %self.peer_addr, track = id, "SETUP for unknown track");
            return Ok(RtspResponse::not_found());
        };

        let transport = TransportHeader::parse(request.get_header("Transport").unwrap_or(""));
        let (p1, p2) = transport
            .client_port
            .or(info.destination_ports)
            .ok_or(RtspError::InvalidState("no client ports"))?;
        session.set_destination_ports(id, p1, p2)?;

        let was_streaming = self.shared.is_streaming();
        session.sync_start_track(id)?;
        if !was_streaming && self.shared.is_streaming() {
            self.shared.post_event(ServerEvent::StreamingStarted);
        }

        let destination = session.destination();
        let (s1, s2) = info.local_ports;
        let transport = format!(
            "RTP/AVP/UDP;{};destination={};client_port={}-{};server_port={}-{};ssrc={:x};mode=play",
            if is_multicast(&destination) { "multicast" } else { "unicast" },
            destination,
            p1,
            p2,
            s1,
            s2,
            info.ssrc,
        );
        tracing::debug!(peer = %self.peer_addr, track = id, %transport, "track set up");

        Ok(RtspResponse::ok()
            .add_header("Transport", &transport)
            .add_header("Session", &self.session_id)
            .add_header("Cache-Control", "no-cache"))
    }

    fn handle_play(&self) -> RtspResponse {
        let Some(session) = &self.session else {
            return RtspResponse::bad_request();
        };
        let info = [0u8, 1]
            .into_iter()
            .filter(|id| session.track_exists(*id))
            .map(|id| format!("url=rtsp://{}/trackID={id};seq=0", self.local_addr))
            .collect::<Vec<_>>()
            .join(",");
        RtspResponse::ok()
            .add_header("RTP-Info", &info)
            .add_header("Session", &self.session_id)
    }

    /// Stop and release the session after the connection ended.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let was_streaming = self.shared.is_streaming();
        session.sync_stop();
        self.shared.unregister(self.connection);
        if was_streaming && !self.shared.is_streaming() {
            self.shared.post_event(ServerEvent::StreamingStopped);
        }
        session.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_id_from_uri() {
        assert_eq!(track_id("rtsp://10.0.0.1:8086/trackID=1"), Some("1"));
        assert_eq!(track_id("rtsp://h/live/TRACKID=0"), Some("0"));
        assert_eq!(track_id("rtsp://h/trackID=12/x"), Some("12"));
        assert_eq!(track_id("rtsp://h/trackID="), None);
        assert_eq!(track_id("rtsp://h/live"), None);
    }

    #[test]
    fn multicast_classification() {
        assert!(is_multicast("228.5.6.7"));
        assert!(!is_multicast("10.0.0.2"));
        assert!(!is_multicast("not an address"));
    }
}
