pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod stream;
pub mod transport;
pub mod uri;

pub use cache::{MemoryProbeCache, ProbeCache};
pub use client::{ClientCallback, ClientConfig, ClientEvent, ClientState, RtspClient, TransportMode};
pub use config::{EncodingMode, StreamingConfig};
pub use error::{Result, RtspError, StreamError, StreamErrorKind};
pub use media::{Codec, CodecParams, Packetizer};
pub use protocol::Credentials;
pub use server::{Server, ServerConfig, ServerError, ServerEvent, ServerListener, SessionFactory};
pub use session::{Session, SessionBuilder, SessionCallback, SessionState};
pub use source::{MediaSource, buffer_channel};
pub use stream::{Encoder, MediaStream};
pub use uri::UriOptions;
