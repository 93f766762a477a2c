//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling for the
//!   server. One TCP connection per client, with a thread per connection.
//!
//! - **UDP** ([`udp`]): carries RTP media packets to the negotiated
//!   destination, with an RTCP socket bound alongside.
//!
//! - **Interleaved** ([`interleaved`]): multiplexes RTP onto the RTSP TCP
//!   connection using `$` framing (RFC 2326 §10.12).
//!
//! [`RtpSocket`] sits on top of these: it stamps RTP headers into pooled
//! buffers ([`pool`]) and sends them through whichever output is active.

pub mod interleaved;
pub mod pool;
pub mod rtp_socket;
pub(crate) mod tcp;
pub mod udp;

pub use interleaved::SharedWriter;
pub use pool::{MAX_PACKET_SIZE, PacketBuffer};
pub use rtp_socket::{BitrateMeter, RtpSocket};
pub use udp::UdpTransport;
