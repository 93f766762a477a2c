/// Parsed `Transport` header (RFC 2326 §12.39).
///
/// Only the parameters this crate negotiates are kept; everything else is
/// ignored.
///
/// ## Wire format examples
///
/// ```text
/// Client → Server (pull):
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client (push reply):
///   Transport: RTP/AVP/UDP;unicast;client_port=5000-5001;server_port=6970-6971
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeader {
    /// Receiver's RTP/RTCP ports.
    pub client_port: Option<(u16, u16)>,
    /// Sender-side RTP/RTCP ports.
    pub server_port: Option<(u16, u16)>,
    /// Interleaved channel pair on the RTSP connection.
    pub interleaved: Option<(u8, u8)>,
    pub multicast: bool,
    /// `destination=` parameter.
    pub destination: Option<String>,
}

/// Parse `a-b`, or a single `a` meaning `a-(a+1)`.
fn parse_range<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

impl TransportHeader {
    /// Parse the header value. Unknown or malformed parameters are skipped.
    ///
    /// ```
    /// use streaming::protocol::transport::TransportHeader;
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001");
    /// assert_eq!(th.client_port, Some((8000, 8001)));
    ///
    /// assert!(TransportHeader::parse("RTP/AVP;unicast").client_port.is_none());
    /// ```
    pub fn parse(header: &str) -> Self {
        let mut parsed = Self::default();
        for part in header.split(';') {
            let part = part.trim();
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            match key.to_ascii_lowercase().as_str() {
                "client_port" => parsed.client_port = parse_range(value),
                "server_port" => parsed.server_port = parse_range(value),
                "interleaved" => parsed.interleaved = parse_range(value),
                "multicast" => parsed.multicast = true,
                "destination" if !value.is_empty() => {
                    parsed.destination = Some(value.to_string())
                }
                _ => {}
            }
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001");
        assert_eq!(th.client_port, Some((5000, 5001)));
        assert!(!th.multicast);
    }

    #[test]
    fn parse_no_client_port() {
        assert!(TransportHeader::parse("RTP/AVP;unicast").client_port.is_none());
    }

    #[test]
    fn parse_server_reply() {
        let th = TransportHeader::parse(
            "RTP/AVP/UDP;unicast;destination=10.0.0.2;client_port=5000-5001;server_port=6970-6971;ssrc=1A2B",
        );
        assert_eq!(th.server_port, Some((6970, 6971)));
        assert_eq!(th.destination.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn parse_interleaved_and_multicast() {
        let th = TransportHeader::parse("RTP/AVP/TCP;multicast;interleaved=2-3");
        assert_eq!(th.interleaved, Some((2, 3)));
        assert!(th.multicast);
        assert_eq!(TransportHeader::parse("RTP/AVP/TCP;interleaved=4").interleaved, Some((4, 5)));
    }

    #[test]
    fn malformed_ports_are_ignored() {
        let th = TransportHeader::parse("RTP/AVP;client_port=abc-def");
        assert!(th.client_port.is_none());
    }
}
