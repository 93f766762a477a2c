use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::Result;

/// UDP transport for outbound RTP, with its companion RTCP socket.
///
/// Binds two ephemeral sockets (`0.0.0.0:0`). The RTCP socket is only kept
/// bound so its port can be advertised; RTCP reports are not processed.
///
/// This layer is address-only: it does not know about sessions or
/// tracks. The caller resolves the destination before calling
/// [`send_to`](Self::send_to).
#[derive(Debug, Clone)]
pub struct UdpTransport {
    rtp: Arc<UdpSocket>,
    rtcp: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral RTP/RTCP socket pair.
    pub fn bind() -> Result<Self> {
        let rtp = UdpSocket::bind("0.0.0.0:0")?;
        let rtcp = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
        })
    }

    /// Local (RTP, RTCP) ports.
    pub fn local_ports(&self) -> (u16, u16) {
        let port = |s: &UdpSocket| s.local_addr().map(|a| a.port()).unwrap_or(0);
        (port(&self.rtp), port(&self.rtcp))
    }

    /// Apply the time-to-live to unicast and multicast sends.
    pub fn set_time_to_live(&self, ttl: u8) -> Result<()> {
        self.rtp.set_ttl(ttl as u32)?;
        self.rtp.set_multicast_ttl_v4(ttl as u32)?;
        Ok(())
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> std::io::Result<usize> {
        self.rtp.send_to(payload, addr)
    }
}
