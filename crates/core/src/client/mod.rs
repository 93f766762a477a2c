//! RTSP push client (ANNOUNCE / SETUP / RECORD).
//!
//! The client publishes a [`Session`] to a remote RTSP server:
//!
//! ```text
//! ANNOUNCE rtsp://host:port/path      SDP body, Digest auth on 401
//! SETUP    rtsp://host:port/path/trackID=N   per track
//! RECORD   rtsp://host:port/path      Range: npt=0.000-
//! ```
//!
//! Media goes over UDP to the ports the server announces, or interleaved
//! on the RTSP connection (channel `2 * track`).
//!
//! Once started, an OPTIONS probe checks the connection every
//! [`ClientConfig::probe_interval`]. When a probe fails the session is
//! stopped, [`ClientEvent::ConnectionLost`] is reported, and the whole
//! sequence is retried every [`ClientConfig::retry_interval`] until it
//! succeeds or [`RtspClient::stop_stream`] is called. Credential errors
//! are fatal.
//!
//! All protocol I/O runs on the client's own worker thread; events are
//! delivered on a separate notification thread.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::protocol::auth::{Credentials, DigestChallenge};
use crate::protocol::transport::TransportHeader;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::session::{AUDIO_TRACK, Session, VIDEO_TRACK, Worker};
use crate::transport::SharedWriter;
use crate::transport::interleaved::shared_writer;

/// First local port advertised in UDP SETUP requests.
const CLIENT_PORT_BASE: u16 = 5000;

/// Read and write halves of a connection to the server.
pub type ConnectionHalves = (Box<dyn Read + Send>, Box<dyn Write + Send>);

/// Opens connections to the RTSP server.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<ConnectionHalves>;
}

/// Plain TCP connections with connect and read timeouts.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<ConnectionHalves> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok((Box::new(reader), Box::new(stream)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// RTP to the server's UDP ports.
    Udp,
    /// RTP interleaved on the RTSP connection.
    Tcp,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between OPTIONS liveness probes.
    pub probe_interval: Duration,
    /// Interval between reconnection attempts.
    pub retry_interval: Duration,
    pub port: u16,
    pub path: String,
    pub transport: TransportMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(6),
            retry_interval: Duration::from_secs(1),
            port: 1935,
            path: "/".to_string(),
            transport: TransportMode::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The initial connection failed.
    ConnectionFailed(String),
    /// The server rejected the credentials, or asked for some and none
    /// are set.
    WrongCredentials,
    /// A liveness probe failed. Reconnection is under way.
    ConnectionLost(String),
    ConnectionRecovered,
}

pub trait ClientCallback: Send + Sync {
    fn on_rtsp_update(&self, event: ClientEvent);
}

#[derive(Clone)]
struct Params {
    host: Option<String>,
    port: u16,
    path: String,
    credentials: Option<Credentials>,
    session: Option<Session>,
    transport: TransportMode,
}

impl Params {
    fn uri(&self, host: &str) -> String {
        format!("rtsp://{host}:{}{}", self.port, self.path)
    }
}

struct Connection {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: SharedWriter,
}

/// State of the running exchange. Only touched on the client worker.
struct Exchange {
    params: Option<Params>,
    connection: Option<Connection>,
    cseq: u32,
    session_id: Option<String>,
    authorization: Option<String>,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    pending: Mutex<Params>,
    exchange: Mutex<Exchange>,
    state: Mutex<ClientState>,
    /// Bumped on abort; scheduled probes and retries from an older epoch
    /// do nothing.
    epoch: AtomicU64,
    callback: Mutex<Option<Arc<dyn ClientCallback>>>,
    worker: Worker,
    notifier: Worker,
}

fn is_fatal(e: &RtspError) -> bool {
    matches!(
        e,
        RtspError::BadCredentials | RtspError::AccessForbidden | RtspError::MissingCredentials
    )
}

impl Inner {
    fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(old = ?*current, new = ?state, "client state");
            *current = state;
        }
    }

    fn notify(&self, event: ClientEvent) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            self.notifier.post(move || callback.on_rtsp_update(event));
        }
    }

    fn session(&self) -> Option<Session> {
        self.exchange
            .lock()
            .params
            .as_ref()
            .and_then(|p| p.session.clone())
    }

    fn run(inner: &Arc<Inner>) {
        if inner.state() != ClientState::Stopped {
            return;
        }
        inner.set_state(ClientState::Starting);

        let params = inner.pending.lock().clone();
        let (Some(host), Some(session)) = (params.host.clone(), params.session.clone()) else {
            inner.set_state(ClientState::Stopped);
            return;
        };
        tracing::info!(%host, port = params.port, path = %params.path, "connecting to RTSP server");

        session.set_destination(host);
        if let Err(e) = session.sync_configure() {
            tracing::warn!(error = %e, "session configuration failed");
            inner.exchange.lock().params = None;
            inner.set_state(ClientState::Stopped);
            return;
        }
        inner.exchange.lock().params = Some(params);

        if let Err(e) = inner.try_connection() {
            tracing::error!(error = %e, "connection to RTSP server failed");
            inner.notify(if is_fatal(&e) {
                ClientEvent::WrongCredentials
            } else {
                ClientEvent::ConnectionFailed(e.to_string())
            });
            inner.abort();
            return;
        }

        if let Err(e) = session.sync_start() {
            tracing::error!(error = %e, "session failed to start");
            inner.abort();
            return;
        }
        inner.set_state(ClientState::Started);
        tracing::info!("streaming to RTSP server");

        let epoch = inner.epoch.load(Ordering::SeqCst);
        Self::post_monitor(inner, epoch, Duration::ZERO);
    }

    fn post_monitor(inner: &Arc<Inner>, epoch: u64, delay: Duration) {
        let task = inner.clone();
        inner
            .worker
            .post_delayed(delay, move || Self::monitor(&task, epoch));
    }

    fn post_retry(inner: &Arc<Inner>, epoch: u64, delay: Duration) {
        let task = inner.clone();
        inner
            .worker
            .post_delayed(delay, move || Self::retry(&task, epoch));
    }

    fn current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch && self.state() == ClientState::Started
    }

    fn monitor(inner: &Arc<Inner>, epoch: u64) {
        if !inner.current(epoch) {
            return;
        }
        match inner.send_options() {
            Ok(()) => Self::post_monitor(inner, epoch, inner.config.probe_interval),
            Err(e) => {
                tracing::error!(error = %e, "connection lost with the server");
                inner.notify(ClientEvent::ConnectionLost(e.to_string()));
                if let Some(session) = inner.session() {
                    session.stop();
                }
                Self::post_retry(inner, epoch, Duration::ZERO);
            }
        }
    }

    fn retry(inner: &Arc<Inner>, epoch: u64) {
        if !inner.current(epoch) {
            return;
        }
        tracing::info!("trying to reconnect");
        match inner.try_connection() {
            Ok(()) => {
                let started = inner
                    .session()
                    .ok_or(RtspError::InvalidState("no session"))
                    .and_then(|s| s.sync_start());
                match started {
                    Ok(()) => {
                        tracing::info!("connection recovered");
                        Self::post_monitor(inner, epoch, Duration::ZERO);
                        inner.notify(ClientEvent::ConnectionRecovered);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "session failed to restart");
                        inner.abort();
                    }
                }
            }
            Err(e) if is_fatal(&e) => {
                tracing::error!(error = %e, "reconnection refused");
                inner.notify(ClientEvent::WrongCredentials);
                inner.abort();
            }
            Err(e) => {
                tracing::debug!(error = %e, "reconnection failed");
                Self::post_retry(inner, epoch, inner.config.retry_interval);
            }
        }
    }

    /// Connect and run ANNOUNCE, SETUP and RECORD.
    fn try_connection(&self) -> Result<()> {
        let mut exchange = self.exchange.lock();
        let params = exchange
            .params
            .clone()
            .ok_or(RtspError::InvalidState("client not started"))?;
        let host = params
            .host
            .clone()
            .ok_or(RtspError::InvalidState("no server address"))?;
        let session = params
            .session
            .clone()
            .ok_or(RtspError::InvalidState("no session"))?;

        exchange.cseq = 0;
        exchange.session_id = None;
        exchange.authorization = None;
        exchange.connection = None;

        let (reader, writer) = self.connector.connect(&host, params.port)?;
        exchange.connection = Some(Connection {
            reader: BufReader::new(reader),
            writer: shared_writer(writer),
        });

        let uri = params.uri(&host);
        Self::announce(&mut exchange, &params, &session, &uri)?;
        Self::setup(&mut exchange, &params, &session, &uri)?;
        let response = Self::send(
            &mut exchange,
            RtspRequest::new("RECORD", &uri).add_header("Range", "npt=0.000-"),
        )?;
        Self::check(&response)?;
        Ok(())
    }

    fn announce(exchange: &mut Exchange, params: &Params, session: &Session, uri: &str) -> Result<()> {
        let body = session.session_description()?;
        let announce = || {
            RtspRequest::new("ANNOUNCE", uri)
                .add_header("Content-Type", "application/sdp")
                .with_body(body.clone())
        };

        let response = Self::send(exchange, announce())?;
        if let Some(server) = response.get_header("Server") {
            tracing::debug!(server, "RTSP server name");
        }

        match response.status_code {
            401 => {
                let credentials = params
                    .credentials
                    .as_ref()
                    .ok_or(RtspError::MissingCredentials)?;
                let challenge = response
                    .get_header("WWW-Authenticate")
                    .and_then(DigestChallenge::parse)
                    .ok_or_else(|| RtspError::InvalidResponse("missing digest challenge".into()))?;
                exchange.authorization = Some(challenge.authorization(credentials, "ANNOUNCE", uri));

                let response = Self::send(exchange, announce())?;
                match response.status_code {
                    401 => Err(RtspError::BadCredentials),
                    403 => Err(RtspError::AccessForbidden),
                    _ => Self::check(&response),
                }
            }
            403 => Err(RtspError::AccessForbidden),
            _ => Self::check(&response),
        }
    }

    fn setup(exchange: &mut Exchange, params: &Params, session: &Session, uri: &str) -> Result<()> {
        for track in [AUDIO_TRACK, VIDEO_TRACK] {
            if !session.track_exists(track) {
                continue;
            }
            let channel = 2 * track;
            let transport = match params.transport {
                TransportMode::Tcp => format!("RTP/AVP/TCP;interleaved={}-{}", channel, channel + 1),
                TransportMode::Udp => {
                    let port = CLIENT_PORT_BASE + u16::from(channel);
                    format!("RTP/AVP/UDP;unicast;client_port={}-{};mode=receive", port, port + 1)
                }
            };
            let request = RtspRequest::new("SETUP", &format!("{uri}/trackID={track}"))
                .add_header("Transport", &transport);
            let response = Self::send(exchange, request)?;
            Self::check(&response)?;

            match params.transport {
                TransportMode::Udp => {
                    let reply = TransportHeader::parse(response.get_header("Transport").unwrap_or(""));
                    match reply.server_port {
                        Some((rtp, rtcp)) => {
                            tracing::debug!(track, rtp, rtcp, "destination ports from server");
                            session.set_destination_ports(track, rtp, rtcp)?;
                        }
                        None => tracing::debug!(
                            track,
                            ports = ?session.track_info(track).and_then(|t| t.destination_ports),
                            "server did not specify ports, keeping current ones"
                        ),
                    }
                }
                TransportMode::Tcp => {
                    let writer = exchange
                        .connection
                        .as_ref()
                        .map(|c| c.writer.clone())
                        .ok_or(RtspError::InvalidState("not connected"))?;
                    session.set_output_stream(track, writer, channel)?;
                }
            }
        }
        Ok(())
    }

    fn check(response: &RtspResponse) -> Result<()> {
        if response.is_success() {
            Ok(())
        } else {
            Err(RtspError::UnexpectedStatus(response.status_code))
        }
    }

    /// Send a request with the common headers and read the response.
    fn send(exchange: &mut Exchange, request: RtspRequest) -> Result<RtspResponse> {
        Self::write(exchange, request)?;
        let connection = exchange
            .connection
            .as_mut()
            .ok_or(RtspError::InvalidState("not connected"))?;
        let response = RtspResponse::read_from(&mut connection.reader)?;
        tracing::debug!(status = response.status_code, "response from server");

        if let Some(session) = response.get_header("Session") {
            let id = session.split(';').next().unwrap_or("").trim();
            if id.is_empty() {
                return Err(RtspError::InvalidResponse(format!("invalid session id: {session}")));
            }
            exchange.session_id = Some(id.to_string());
        }
        Ok(response)
    }

    fn write(exchange: &mut Exchange, mut request: RtspRequest) -> Result<()> {
        exchange.cseq += 1;
        request = request.add_header("CSeq", &exchange.cseq.to_string());
        if request.body.is_empty() {
            request = request.add_header("Content-Length", "0");
        }
        if let Some(id) = &exchange.session_id {
            request = request.add_header("Session", id);
        }
        if let Some(auth) = &exchange.authorization {
            request = request.add_header("Authorization", auth);
        }

        let connection = exchange
            .connection
            .as_ref()
            .ok_or(RtspError::InvalidState("not connected"))?;
        tracing::info!(method = %request.method, uri = %request.uri, cseq = exchange.cseq, "request");
        let mut writer = connection.writer.lock();
        writer.write_all(request.serialize().as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn send_options(&self) -> Result<()> {
        let mut exchange = self.exchange.lock();
        let params = exchange
            .params
            .clone()
            .ok_or(RtspError::InvalidState("client not started"))?;
        let host = params.host.as_deref().unwrap_or_default();
        Self::send(&mut exchange, RtspRequest::new("OPTIONS", &params.uri(host)))?;
        Ok(())
    }

    /// TEARDOWN best-effort, close the connection and cancel scheduled
    /// probes and retries.
    fn abort(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut exchange = self.exchange.lock();
            if exchange.connection.is_some()
                && let Some(params) = exchange.params.clone()
            {
                let host = params.host.as_deref().unwrap_or_default();
                let teardown = RtspRequest::new("TEARDOWN", &params.uri(host));
                if let Err(e) = Self::write(&mut exchange, teardown) {
                    tracing::debug!(error = %e, "TEARDOWN not sent");
                }
            }
            exchange.connection = None;
        }
        self.set_state(ClientState::Stopped);
    }
}

/// Publishes a [`Session`] to a remote RTSP server.
pub struct RtspClient {
    inner: Arc<Inner>,
}

impl RtspClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TcpConnector::default()))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let pending = Params {
            host: None,
            port: config.port,
            path: config.path.clone(),
            credentials: None,
            session: None,
            transport: config.transport,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                pending: Mutex::new(pending),
                exchange: Mutex::new(Exchange {
                    params: None,
                    connection: None,
                    cseq: 0,
                    session_id: None,
                    authorization: None,
                }),
                state: Mutex::new(ClientState::Stopped),
                epoch: AtomicU64::new(0),
                callback: Mutex::new(None),
                worker: Worker::spawn("rtsp-client")?,
                notifier: Worker::spawn("rtsp-client-notify")?,
            }),
        })
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn ClientCallback>>) {
        *self.inner.callback.lock() = callback;
    }

    /// Settings below apply from the next [`start_stream`](Self::start_stream).
    pub fn set_session(&self, session: Session) {
        self.inner.pending.lock().session = Some(session);
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.pending.lock().session.clone()
    }

    pub fn set_server_address(&self, host: impl Into<String>, port: u16) {
        let mut pending = self.inner.pending.lock();
        pending.host = Some(host.into());
        pending.port = port;
    }

    pub fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        self.inner.pending.lock().credentials = Some(Credentials::new(username, password));
    }

    /// Path of the published stream, starting with `/`.
    pub fn set_stream_path(&self, path: impl Into<String>) {
        self.inner.pending.lock().path = path.into();
    }

    pub fn set_transport_mode(&self, mode: TransportMode) {
        self.inner.pending.lock().transport = mode;
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), ClientState::Started | ClientState::Starting)
    }

    /// Connect and start publishing. Ignored unless stopped.
    pub fn start_stream(&self) -> Result<()> {
        {
            let pending = self.inner.pending.lock();
            if pending.host.is_none() {
                return Err(RtspError::InvalidState("server address not set"));
            }
            if pending.session.is_none() {
                return Err(RtspError::InvalidState("session not set"));
            }
        }
        let inner = self.inner.clone();
        self.inner.worker.post(move || Inner::run(&inner));
        Ok(())
    }

    /// Stop the session and the exchange, and cancel reconnection.
    pub fn stop_stream(&self) {
        let inner = self.inner.clone();
        self.inner.worker.post(move || {
            if let Some(session) = inner.session() {
                session.sync_stop();
            }
            if inner.state() != ClientState::Stopped {
                inner.set_state(ClientState::Stopping);
                inner.abort();
            }
        });
    }

    /// Stop and shut the client's threads down.
    pub fn release(&self) {
        self.stop_stream();
        self.inner.worker.quit();
        self.inner.notifier.quit();
    }
}

impl Drop for RtspClient {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::mpsc;

    use super::*;
    use crate::cache::MemoryProbeCache;
    use crate::media::{Codec, CodecParams};
    use crate::stream::testing::FakeEncoder;

    /// A connector replaying canned server output. Each `connect` takes
    /// the next script; `None` makes the attempt fail.
    #[derive(Clone, Default)]
    struct Scripted {
        scripts: Arc<Mutex<VecDeque<Option<String>>>>,
        sent: Arc<Mutex<Vec<u8>>>,
        attempts: Arc<AtomicU64>,
    }

    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Scripted {
        fn push(&self, script: Option<String>) {
            self.scripts.lock().push_back(script);
        }

        fn sent(&self) -> String {
            String::from_utf8_lossy(&self.sent.lock()).into_owned()
        }
    }

    impl Connector for Scripted {
        fn connect(&self, _host: &str, _port: u16) -> io::Result<ConnectionHalves> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().pop_front().flatten() {
                Some(script) => Ok((
                    Box::new(Cursor::new(script.into_bytes())),
                    Box::new(Sink(self.sent.clone())),
                )),
                None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal")),
            }
        }
    }

    fn reply(cseq: u32, extra: &str) -> String {
        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 902878796;timeout=60\r\n{extra}Content-Length: 0\r\n\r\n")
    }

    /// ANNOUNCE, SETUP (video only), RECORD.
    fn handshake() -> String {
        let mut s = reply(1, "");
        s.push_str(&reply(2, "Transport: RTP/AVP/UDP;unicast;client_port=5002-5003;server_port=6970-6971\r\n"));
        s.push_str(&reply(3, ""));
        s
    }

    struct Events(Mutex<mpsc::Sender<ClientEvent>>);

    impl ClientCallback for Events {
        fn on_rtsp_update(&self, event: ClientEvent) {
            let _ = self.0.lock().send(event);
        }
    }

    fn client(connector: &Scripted, config: ClientConfig) -> (RtspClient, mpsc::Receiver<ClientEvent>) {
        let session = Session::builder()
            .probe_cache(Arc::new(MemoryProbeCache::new(1)))
            .video(Codec::H264, Box::new(FakeEncoder::h264()))
            .build()
            .unwrap();
        let client = RtspClient::with_connector(config, Arc::new(connector.clone())).unwrap();
        let (tx, rx) = mpsc::channel();
        client.set_callback(Some(Arc::new(Events(Mutex::new(tx)))));
        client.set_session(session);
        client.set_server_address("127.0.0.1", 8554);
        client.set_stream_path("/live");
        (client, rx)
    }

    fn event(rx: &mpsc::Receiver<ClientEvent>) -> ClientEvent {
        rx.recv_timeout(Duration::from_secs(5)).expect("client event")
    }

    #[test]
    fn start_requires_address_and_session() {
        let client = RtspClient::with_connector(ClientConfig::default(), Arc::new(Scripted::default())).unwrap();
        assert!(matches!(client.start_stream(), Err(RtspError::InvalidState(_))));
        client.set_server_address("127.0.0.1", 554);
        assert!(matches!(client.start_stream(), Err(RtspError::InvalidState(_))));
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[test]
    fn digest_retry_and_bad_credentials() {
        let connector = Scripted::default();
        let challenge = "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"test\", nonce=\"abc123\"\r\n\r\n";
        connector.push(Some(format!("{challenge}{}", challenge.replace("CSeq: 1", "CSeq: 2"))));
        let (client, rx) = client(&connector, ClientConfig::default());
        client.set_credentials("u", "p");
        client.start_stream().unwrap();

        assert_eq!(event(&rx), ClientEvent::WrongCredentials);
        client.inner.worker.run_sync(|| ()).unwrap();
        let sent = connector.sent();
        assert_eq!(sent.matches("ANNOUNCE rtsp://127.0.0.1:8554/live RTSP/1.0\r\n").count(), 2);
        assert!(sent.contains("Authorization: Digest username=\"u\",realm=\"test\",nonce=\"abc123\",uri=\"rtsp://127.0.0.1:8554/live\",response=\""));
        assert!(sent.contains("TEARDOWN"), "abort sends TEARDOWN");
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let connector = Scripted::default();
        connector.push(Some("RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n".into()));
        let (client, rx) = client(&connector, ClientConfig::default());
        client.start_stream().unwrap();
        assert_eq!(event(&rx), ClientEvent::WrongCredentials);
    }

    #[test]
    fn connection_failure_is_reported() {
        let connector = Scripted::default();
        connector.push(None);
        let (client, rx) = client(&connector, ClientConfig::default());
        client.start_stream().unwrap();
        assert!(matches!(event(&rx), ClientEvent::ConnectionFailed(_)));
        client.inner.worker.run_sync(|| ()).unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[test]
    fn reconnects_after_probe_failure() {
        let connector = Scripted::default();
        // First connection ends right after RECORD, so the first probe fails.
        connector.push(Some(handshake()));
        connector.push(None);
        connector.push(None);
        let mut recovered = handshake();
        recovered.push_str(&reply(4, "Public: ANNOUNCE,SETUP,RECORD,OPTIONS,TEARDOWN\r\n"));
        connector.push(Some(recovered));

        let config = ClientConfig {
            probe_interval: Duration::from_secs(30),
            retry_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let (client, rx) = client(&connector, config);
        client.start_stream().unwrap();

        assert!(matches!(event(&rx), ClientEvent::ConnectionLost(_)));
        assert_eq!(event(&rx), ClientEvent::ConnectionRecovered);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4, "two refused retries");
        assert_eq!(client.state(), ClientState::Started);

        let sent = connector.sent();
        assert!(sent.contains("SETUP rtsp://127.0.0.1:8554/live/trackID=1 RTSP/1.0\r\nTransport: RTP/AVP/UDP;unicast;client_port=5002-5003;mode=receive\r\n"));
        assert!(sent.contains("RECORD rtsp://127.0.0.1:8554/live RTSP/1.0\r\nRange: npt=0.000-\r\n"));
        assert!(sent.contains("Session: 902878796\r\n"));
        assert_eq!(
            client.session().unwrap().track_info(1).unwrap().destination_ports,
            Some((6970, 6971))
        );

        client.stop_stream();
        client.inner.worker.run_sync(|| ()).unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
        assert!(!client.session().unwrap().is_streaming());
    }

    #[test]
    fn tcp_mode_interleaves_on_the_connection() {
        let connector = Scripted::default();
        let mut script = reply(1, "");
        script.push_str(&reply(2, "Transport: RTP/AVP/TCP;interleaved=2-3\r\n"));
        script.push_str(&reply(3, ""));
        script.push_str(&reply(4, ""));
        connector.push(Some(script));
        let config = ClientConfig {
            transport: TransportMode::Tcp,
            probe_interval: Duration::from_secs(30),
            ..ClientConfig::default()
        };
        let (client, _rx) = client(&connector, config);
        client.start_stream().unwrap();
        client.inner.worker.run_sync(|| ()).unwrap();

        assert_eq!(client.state(), ClientState::Started);
        assert!(connector.sent().contains("Transport: RTP/AVP/TCP;interleaved=2-3\r\n"));
        assert!(client.session().unwrap().is_streaming());
        client.stop_stream();
    }

    #[test]
    fn sdp_codec_params_reach_announce() {
        let connector = Scripted::default();
        connector.push(Some(handshake()));
        let session = Session::builder()
            .probe_cache(Arc::new(MemoryProbeCache::new(1)))
            .audio(Codec::Amr, Box::new(FakeEncoder::with_params(CodecParams::Amr)))
            .build()
            .unwrap();
        let client = RtspClient::with_connector(ClientConfig::default(), Arc::new(connector.clone())).unwrap();
        client.set_session(session);
        client.set_server_address("127.0.0.1", 8554);
        client.start_stream().unwrap();
        client.inner.worker.run_sync(|| ()).unwrap();

        let sent = connector.sent();
        assert!(sent.contains("Content-Type: application/sdp\r\n"));
        assert!(sent.contains("a=rtpmap:96 AMR/8000\r\n"));
        assert!(sent.contains("c=IN IP4 127.0.0.1\r\n"));
        client.stop_stream();
    }
}
