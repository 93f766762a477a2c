use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::RtspError;
use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::server::Shared;

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub(crate) fn accept_loop(listener: TcpListener, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let shared = shared.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-connection".to_string())
                    .spawn(move || Connection::handle(stream, shared));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "cannot spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    id: u64,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, shared: Arc<Shared>) {
        let (Ok(peer_addr), Ok(local_addr)) = (stream.peer_addr(), stream.local_addr()) else {
            return;
        };
        let (Ok(reader_stream), Ok(control)) = (stream.try_clone(), stream.try_clone()) else {
            return;
        };

        tracing::info!(%peer_addr, "client connected");

        let id = shared.next_connection_id();
        shared.add_connection(id, control);

        let mut conn = Connection {
            id,
            reader: BufReader::new(reader_stream),
            writer: stream,
            handler: MethodHandler::new(shared.clone(), id, peer_addr, local_addr),
            peer_addr,
        };

        let reason = conn.run();
        conn.handler.close();
        shared.remove_connection(conn.id);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self) -> &'static str {
        loop {
            let response = match RtspRequest::read_from(&mut self.reader) {
                Ok(Some(request)) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        cseq = request.cseq().unwrap_or("-"),
                        "request"
                    );
                    self.handler.handle(&request)
                }
                Ok(None) => return "connection closed by client",
                Err(RtspError::Io(_)) => return "read error",
                Err(RtspError::Parse { kind }) if kind.loses_framing() => {
                    tracing::warn!(peer = %self.peer_addr, error = %kind, "unrecoverable request");
                    let _ = self
                        .writer
                        .write_all(RtspResponse::bad_request().serialize().as_bytes());
                    return "malformed request";
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    RtspResponse::bad_request()
                }
            };

            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self
                .writer
                .write_all(response.serialize().as_bytes())
                .is_err()
            {
                return "write error";
            }
        }
    }
}
