//! End-to-end tests over localhost sockets.
//!
//! - A player dialog against [`Server`]: OPTIONS, DESCRIBE, SETUP, PLAY,
//!   TEARDOWN, with RTP arriving on the player's UDP port.
//! - [`RtspClient`] publishing to a minimal RTSP server thread that
//!   challenges with Digest auth.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use streaming::media::H264Params;
use streaming::protocol::auth::digest_response;
use streaming::protocol::transport::TransportHeader;
use streaming::protocol::{RtspRequest, RtspResponse};
use streaming::source::BufferSink;
use streaming::{
    ClientCallback, ClientConfig, ClientEvent, Codec, CodecParams, Credentials, EncodingMode,
    Encoder, MediaSource, RtspClient, Server, ServerConfig, ServerError, ServerEvent,
    ServerListener, Session, StreamError, TransportMode, UriOptions, buffer_channel,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// An encoder whose output the test feeds by hand.
#[derive(Clone, Default)]
struct HandFed {
    sink: Arc<Mutex<Option<BufferSink>>>,
}

impl HandFed {
    /// Push an IDR slice once the stream has started.
    fn push_idr(&self) {
        for _ in 0..50 {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                let mut nal = vec![0, 0, 0, 1, 0x65];
                nal.extend(std::iter::repeat_n(0xab, 64));
                sink.push(nal, 40_000).unwrap();
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("encoder never started");
    }
}

impl Encoder for HandFed {
    fn configure(
        &mut self,
        _mode: EncodingMode,
        _cached: Option<CodecParams>,
    ) -> Result<CodecParams, StreamError> {
        Ok(CodecParams::H264(H264Params::new(
            vec![0x67, 0x42, 0x00, 0x1e],
            vec![0x68, 0xce, 0x38, 0x80],
        )))
    }

    fn start(&mut self) -> Result<Box<dyn MediaSource>, StreamError> {
        let (sink, source) = buffer_channel(8);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(source))
    }

    fn stop(&mut self) {
        self.sink.lock().unwrap().take();
    }

    fn preferred_mode(&self, _suggested: EncodingMode) -> EncodingMode {
        EncodingMode::Buffered
    }
}

fn video_session(encoder: &HandFed) -> streaming::Result<Session> {
    Session::builder()
        .video(Codec::H264, Box::new(encoder.clone()))
        .build()
}

struct Events(Mutex<Sender<ServerEvent>>);

impl ServerListener for Events {
    fn on_event(&self, event: ServerEvent) {
        let _ = self.0.lock().unwrap().send(event);
    }

    fn on_error(&self, error: &ServerError) {
        eprintln!("server error: {error}");
    }
}

struct Player {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    cseq: u32,
    base: String,
}

impl Player {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, TIMEOUT).expect("connect to server");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
            base: format!("rtsp://{addr}"),
        }
    }

    fn send(&mut self, method: &str, path: &str, headers: &[(&str, &str)]) -> RtspResponse {
        self.cseq += 1;
        let mut request = RtspRequest::new(method, &format!("{}{path}", self.base))
            .add_header("CSeq", &self.cseq.to_string());
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        self.writer.write_all(request.serialize().as_bytes()).unwrap();
        let response = RtspResponse::read_from(&mut self.reader).expect("response");
        assert_eq!(response.get_header("CSeq"), Some(self.cseq.to_string().as_str()));
        response
    }
}

fn start_server(config: ServerConfig, encoder: &HandFed) -> (Server, Receiver<ServerEvent>) {
    let encoder = encoder.clone();
    let factory = move |_: &UriOptions| video_session(&encoder);
    let mut server = Server::new(
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..config
        },
        factory,
    );
    let (tx, rx) = mpsc::channel();
    server.add_listener(Arc::new(Events(Mutex::new(tx))));
    server.start().expect("server start");
    (server, rx)
}

#[test]
fn player_dialog_streams_rtp() {
    let encoder = HandFed::default();
    let (mut server, events) = start_server(ServerConfig::default(), &encoder);
    let mut player = Player::connect(server.local_addr().unwrap());

    let options = player.send("OPTIONS", "/", &[]);
    assert_eq!(options.status_code, 200);
    assert_eq!(options.get_header("Public"), Some("DESCRIBE,SETUP,TEARDOWN,PLAY,PAUSE"));

    let describe = player.send("DESCRIBE", "/", &[]);
    assert_eq!(describe.status_code, 200);
    assert_eq!(describe.get_header("Content-Type"), Some("application/sdp"));
    let sdp = describe.body.unwrap_or_default();
    assert!(sdp.starts_with("v=0\r\n"));
    assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
    assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
    assert!(sdp.contains("a=control:trackID=1\r\n"));
    assert!(!sdp.contains("m=audio"));

    let missing = player.send("SETUP", "/trackID=5", &[("Transport", "RTP/AVP;unicast;client_port=9000-9001")]);
    assert_eq!(missing.status_code, 404);

    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
    let setup = player.send("SETUP", "/trackID=1", &[("Transport", &transport)]);
    assert_eq!(setup.status_code, 200);
    let reply = setup.get_header("Transport").unwrap_or_default().to_string();
    assert!(reply.starts_with("RTP/AVP/UDP;unicast;destination=127.0.0.1;"), "{reply}");
    assert_eq!(TransportHeader::parse(&reply).client_port, Some((port, port + 1)));
    let session_id = setup.get_header("Session").unwrap().to_string();
    assert_eq!(events.recv_timeout(TIMEOUT), Ok(ServerEvent::StreamingStarted));
    assert!(server.is_streaming());

    let play = player.send("PLAY", "/", &[("Session", &session_id)]);
    assert_eq!(play.status_code, 200);
    assert!(play.get_header("RTP-Info").unwrap().contains("/trackID=1;seq=0"));

    encoder.push_idr();
    let mut packet = [0u8; 1500];
    let (len, _) = rtp.recv_from(&mut packet).expect("RTP packet");
    assert!(len > 12);
    assert_eq!(packet[0] >> 6, 2, "RTP version");
    assert_eq!(packet[1] & 0x7f, 96, "dynamic payload type");
    let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
    assert!(reply.contains(&format!("ssrc={ssrc:x}")));

    let teardown = player.send("TEARDOWN", "/", &[("Session", &session_id)]);
    assert_eq!(teardown.status_code, 200);
    drop(player);

    assert_eq!(events.recv_timeout(TIMEOUT), Ok(ServerEvent::StreamingStopped));
    assert!(!server.is_streaming());
    assert_eq!(server.bitrate(), 0);
    server.stop();
}

#[test]
fn credentials_gate_everything_but_options() {
    let config = ServerConfig {
        credentials: Some(Credentials::new("admin", "secret")),
        ..ServerConfig::default()
    };
    let encoder = HandFed::default();
    let (server, _events) = start_server(config, &encoder);
    let mut player = Player::connect(server.local_addr().unwrap());

    assert_eq!(player.send("OPTIONS", "/", &[]).status_code, 200);

    let denied = player.send("DESCRIBE", "/", &[]);
    assert_eq!(denied.status_code, 401);
    assert!(denied.get_header("WWW-Authenticate").unwrap().starts_with("Basic realm="));

    let wrong = Credentials::new("admin", "nope").basic_header();
    assert_eq!(player.send("DESCRIBE", "/", &[("Authorization", &wrong)]).status_code, 401);

    let right = Credentials::new("admin", "secret").basic_header();
    assert_eq!(player.send("DESCRIBE", "/", &[("Authorization", &right)]).status_code, 200);
}

#[test]
fn setup_without_track_id_is_rejected() {
    let encoder = HandFed::default();
    let (server, _events) = start_server(ServerConfig::default(), &encoder);
    let mut player = Player::connect(server.local_addr().unwrap());
    let setup = player.send("SETUP", "/live", &[("Transport", "RTP/AVP;unicast;client_port=9000-9001")]);
    assert_eq!(setup.status_code, 400);
    assert_eq!(player.send("PLAY", "/", &[]).status_code, 400);
    assert_eq!(player.send("RECORD", "/", &[]).status_code, 400);
}

#[test]
fn oversized_request_ends_the_session() {
    let encoder = HandFed::default();
    let (mut server, events) = start_server(ServerConfig::default(), &encoder);
    let mut player = Player::connect(server.local_addr().unwrap());

    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = rtp.local_addr().unwrap().port();
    let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
    assert_eq!(player.send("SETUP", "/trackID=1", &[("Transport", &transport)]).status_code, 200);
    assert_eq!(events.recv_timeout(TIMEOUT), Ok(ServerEvent::StreamingStarted));

    let raw = "OPTIONS rtsp://h/ RTSP/1.0\r\nCSeq: 9\r\nContent-Length: 18446744073709551615\r\n\r\n";
    player.writer.write_all(raw.as_bytes()).unwrap();
    let response = RtspResponse::read_from(&mut player.reader).expect("400 response");
    assert_eq!(response.status_code, 400);
    assert!(RtspResponse::read_from(&mut player.reader).is_err(), "connection closed");

    assert_eq!(events.recv_timeout(TIMEOUT), Ok(ServerEvent::StreamingStopped));
    assert!(!server.is_streaming());
    server.stop();
}

/// Minimal publishing endpoint: Digest-protected ANNOUNCE, then 200 for
/// everything. Reports each method it sees.
fn ingest_server(udp_port: u16) -> (SocketAddr, Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        while let Ok(Some(request)) = RtspRequest::read_from(&mut reader) {
            let _ = tx.send(request.method.clone());
            let cseq = request.cseq().unwrap_or("0").to_string();
            let response = match request.method.as_str() {
                "ANNOUNCE" => {
                    let expected = digest_response("pub", "pw", "ingest", "n0nce", "ANNOUNCE", &request.uri);
                    let authorized = request
                        .get_header("Authorization")
                        .is_some_and(|h| h.contains(&format!("response=\"{expected}\"")));
                    if authorized {
                        assert!(request.body.contains("m=video"));
                        RtspResponse::ok().add_header("Session", "12345678;timeout=60")
                    } else {
                        RtspResponse::new(401, "Unauthorized")
                            .add_header("WWW-Authenticate", "Digest realm=\"ingest\", nonce=\"n0nce\"")
                    }
                }
                "SETUP" => RtspResponse::ok().add_header(
                    "Transport",
                    &format!("RTP/AVP/UDP;unicast;client_port=5002-5003;server_port={}-{}", udp_port, udp_port + 1),
                ),
                "TEARDOWN" => {
                    let _ = writer.write_all(RtspResponse::ok().set_header("CSeq", &cseq).serialize().as_bytes());
                    return;
                }
                _ => RtspResponse::ok(),
            };
            let response = response.set_header("CSeq", &cseq);
            if writer.write_all(response.serialize().as_bytes()).is_err() {
                return;
            }
        }
    });
    (addr, rx)
}

struct ClientEvents(Mutex<Sender<ClientEvent>>);

impl ClientCallback for ClientEvents {
    fn on_rtsp_update(&self, event: ClientEvent) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

fn expect_methods(rx: &Receiver<String>, methods: &[&str]) {
    for method in methods {
        assert_eq!(rx.recv_timeout(TIMEOUT).as_deref(), Ok(*method));
    }
}

#[test]
fn client_publishes_with_digest_auth() {
    let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (addr, methods) = ingest_server(rtp.local_addr().unwrap().port());

    let encoder = HandFed::default();
    let client = RtspClient::new(ClientConfig {
        probe_interval: Duration::from_secs(30),
        ..ClientConfig::default()
    })
    .unwrap();
    let (tx, client_events) = mpsc::channel();
    client.set_callback(Some(Arc::new(ClientEvents(Mutex::new(tx)))));
    client.set_session(video_session(&encoder).unwrap());
    client.set_server_address("127.0.0.1", addr.port());
    client.set_stream_path("/live/cam");
    client.set_credentials("pub", "pw");
    client.set_transport_mode(TransportMode::Udp);
    client.start_stream().unwrap();

    expect_methods(&methods, &["ANNOUNCE", "ANNOUNCE", "SETUP", "RECORD", "OPTIONS"]);
    assert!(client.is_streaming());

    encoder.push_idr();
    let mut packet = [0u8; 1500];
    let (len, _) = rtp.recv_from(&mut packet).expect("RTP packet");
    assert!(len > 12);
    assert_eq!(packet[0] >> 6, 2);

    client.stop_stream();
    expect_methods(&methods, &["TEARDOWN"]);
    assert!(client_events.try_recv().is_err(), "no failure events");
    client.release();
    assert!(!client.is_streaming());
}
