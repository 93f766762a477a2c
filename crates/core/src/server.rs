use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{Result, RtspError, StreamErrorKind};
use crate::protocol::Credentials;
use crate::session::Session;
use crate::transport::tcp;
use crate::uri::UriOptions;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the RTSP listener binds to.
    pub bind_addr: String,
    /// Used as the Basic-Auth realm.
    pub server_name: String,
    /// When set, every request except OPTIONS must authenticate.
    pub credentials: Option<Credentials>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8086".to_string(),
            server_name: "Streaming RTSP Server".to_string(),
            credentials: None,
        }
    }
}

/// Builds the session a client asked for in DESCRIBE.
pub trait SessionFactory: Send + Sync {
    fn create(&self, options: &UriOptions) -> Result<Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(&UriOptions) -> Result<Session> + Send + Sync,
{
    fn create(&self, options: &UriOptions) -> Result<Session> {
        self(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The first session started streaming.
    StreamingStarted,
    /// The last streaming session stopped.
    StreamingStopped,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {message}")]
    BindFailed { addr: String, message: String },
    #[error("request failed ({kind}): {message}")]
    StartFailed {
        kind: StreamErrorKind,
        message: String,
    },
}

/// Receives server events, on the thread that caused them.
pub trait ServerListener: Send + Sync {
    fn on_event(&self, _event: ServerEvent) {}

    fn on_error(&self, _error: &ServerError) {}
}

/// State shared between the server handle, its acceptor and every
/// connection.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) factory: Box<dyn SessionFactory>,
    sessions: Mutex<HashMap<u64, Session>>,
    connections: Mutex<HashMap<u64, TcpStream>>,
    listeners: Mutex<Vec<Arc<dyn ServerListener>>>,
    next_connection: AtomicU64,
}

impl Shared {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::SeqCst)
    }

    /// Track a connection's session for aggregate queries. Replaces any
    /// earlier session of the same connection.
    pub(crate) fn register(&self, connection: u64, session: Session) {
        self.sessions.lock().insert(connection, session);
    }

    pub(crate) fn unregister(&self, connection: u64) {
        self.sessions.lock().remove(&connection);
    }

    pub(crate) fn add_connection(&self, id: u64, stream: TcpStream) {
        self.connections.lock().insert(id, stream);
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.sessions().iter().any(Session::is_streaming)
    }

    pub(crate) fn bitrate(&self) -> u64 {
        self.sessions()
            .iter()
            .filter(|s| s.is_streaming())
            .map(Session::bitrate)
            .sum()
    }

    fn listeners(&self) -> Vec<Arc<dyn ServerListener>> {
        self.listeners.lock().clone()
    }

    pub(crate) fn post_event(&self, event: ServerEvent) {
        tracing::debug!(?event, "server event");
        for listener in self.listeners() {
            listener.on_event(event);
        }
    }

    pub(crate) fn post_error(&self, error: ServerError) {
        for listener in self.listeners() {
            listener.on_error(&error);
        }
    }
}

/// RTSP server: one acceptor thread, one thread and one [`Session`] per
/// client connection.
pub struct Server {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig, factory: impl SessionFactory + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                factory: Box::new(factory),
                sessions: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            acceptor: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let bind_addr = self.shared.config.bind_addr.clone();
        let listener = match TcpListener::bind(&bind_addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %bind_addr, error = %e, "bind failed");
                self.shared.post_error(ServerError::BindFailed {
                    addr: bind_addr,
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let shared = self.shared.clone();

        tracing::info!(addr = %local_addr, "RTSP server listening");

        let handle = thread::Builder::new()
            .name("rtsp-acceptor".to_string())
            .spawn(move || tcp::accept_loop(listener, shared, running));
        match handle {
            Ok(h) => {
                self.acceptor = Some(h);
                self.local_addr = Some(local_addr);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop accepting, stop every session and close every connection.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.acceptor.take()
            && handle.join().is_err()
        {
            tracing::error!("acceptor thread panicked");
        }

        for session in self.shared.sessions() {
            if session.is_streaming() {
                session.sync_stop();
            }
        }
        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.local_addr = None;
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(RtspError::NotStarted)
    }

    /// Whether any client session is streaming.
    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming()
    }

    /// Sum of the bitrates of every streaming session.
    pub fn bitrate(&self) -> u64 {
        self.shared.bitrate()
    }

    /// Register a listener. Registering the same listener twice has no
    /// effect.
    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        let mut listeners = self.shared.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServerListener>) {
        self.shared
            .listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl ServerListener for Nop {}

    struct Failing(Mutex<Vec<ServerError>>);
    impl ServerListener for Failing {
        fn on_error(&self, error: &ServerError) {
            self.0.lock().push(error.clone());
        }
    }

    fn no_sessions(_: &UriOptions) -> Result<Session> {
        Err(RtspError::InvalidState("no sessions in this test"))
    }

    #[test]
    fn listeners_are_deduplicated() {
        let server = Server::new(ServerConfig::default(), no_sessions);
        let listener: Arc<dyn ServerListener> = Arc::new(Nop);
        server.add_listener(listener.clone());
        server.add_listener(listener.clone());
        assert_eq!(server.shared.listeners().len(), 1);
        server.remove_listener(&listener);
        assert!(server.shared.listeners().is_empty());
    }

    #[test]
    fn start_stop_lifecycle() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        let mut server = Server::new(config, no_sessions);
        assert!(matches!(server.local_addr(), Err(RtspError::NotStarted)));
        server.start().unwrap();
        assert!(server.is_running());
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(matches!(server.start(), Err(RtspError::AlreadyRunning)));
        assert!(!server.is_streaming());
        assert_eq!(server.bitrate(), 0);
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };
        let mut server = Server::new(config, no_sessions);
        let failing = Arc::new(Failing(Mutex::new(Vec::new())));
        server.add_listener(failing.clone());
        assert!(server.start().is_err());
        assert!(matches!(
            failing.0.lock().as_slice(),
            [ServerError::BindFailed { .. }]
        ));
    }
}
