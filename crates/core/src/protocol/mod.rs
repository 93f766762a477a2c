//! RTSP signaling (RFC 2326).
//!
//! Both ends of the protocol share these types: the server parses
//! [`RtspRequest`]s and answers with [`RtspResponse`]s through a
//! [`MethodHandler`], while the push client builds requests and parses
//! the responses of a remote server.
//!
//! ```text
//! player  -> server   OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN
//! client  -> remote   ANNOUNCE, SETUP, RECORD, OPTIONS (probe), TEARDOWN
//! ```
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`request`], [`response`] | Message framing, `Content-Length` bodies |
//! | [`transport`] | `Transport` header fields |
//! | [`auth`] | Basic checks (server) and Digest answers (client) |
//! | [`sdp`] | Session and per-codec media descriptions |
//! | [`handler`] | Server-side method dispatch for one connection |

pub mod auth;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use auth::{Credentials, DigestChallenge};
pub use handler::MethodHandler;
pub use request::{MAX_BODY_LEN, MAX_LINE_LEN, RtspRequest};
pub use response::RtspResponse;
