//! SDP (Session Description Protocol) generation (RFC 4566).
//!
//! Produces the body of DESCRIBE responses and of the push client's
//! ANNOUNCE:
//!
//! ```text
//! v=0                                      ← protocol version
//! o=- <ntp> <ntp> IN IP4 <origin>          ← origin
//! s=Unnamed                                ← session name
//! i=N/A                                    ← session information
//! c=IN IP4 <destination>                   ← connection address
//! t=0 0                                    ← timing (live stream)
//! a=recvonly                               ← direction
//! m=audio <port> RTP/AVP 96                ← one media section per track,
//! a=rtpmap:96 mpeg4-generic/44100            audio (trackID=0) first
//! a=fmtp:96 ...
//! a=control:trackID=0
//! m=video <port> RTP/AVP 96
//! ...
//! ```

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::media::rtp::PAYLOAD_TYPE;
use crate::media::{Codec, CodecParams};

/// NTP-style origin timestamp: seconds in the high 32 bits, fraction below.
pub fn ntp_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() << 32) | ((now.subsec_nanos() as u64) << 32) / 1_000_000_000
}

/// Media section for one track, without its `a=control` line.
///
/// Returns `None` when `params` do not belong to `codec`.
pub fn media_section(codec: Codec, params: &CodecParams, port: u16) -> Option<String> {
    let pt = PAYLOAD_TYPE;
    let section = match (codec, params) {
        (Codec::H264, CodecParams::H264(p)) => format!(
            "m=video {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} H264/90000\r\n\
             a=fmtp:{pt} packetization-mode=1;profile-level-id={};sprop-parameter-sets={};\r\n",
            p.profile_level_id().unwrap_or_default(),
            p.sprop_parameter_sets(),
        ),
        (Codec::H263, CodecParams::H263) => format!(
            "m=video {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} H263-1998/90000\r\n"
        ),
        (Codec::AacAdts | Codec::AacLatm, CodecParams::Aac(c)) => format!(
            "m=audio {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} mpeg4-generic/{}\r\n\
             a=fmtp:{pt} streamtype=5;profile-level-id=15;mode=AAC-hbr;config={};SizeLength=13;IndexLength=3;IndexDeltaLength=3;\r\n",
            c.sample_rate(),
            c.config_hex(),
        ),
        (Codec::Amr, CodecParams::Amr) => format!(
            "m=audio {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} AMR/8000\r\n\
             a=fmtp:{pt} octet-align=1;\r\n"
        ),
        _ => return None,
    };
    Some(section)
}

/// Full session description. `tracks` holds `(track id, media section)`
/// pairs in the order they should appear.
pub fn session_description(
    origin: &str,
    destination: &str,
    timestamp: u64,
    tracks: &[(u8, String)],
) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    let _ = write!(sdp, "o=- {timestamp} {timestamp} IN IP4 {origin}\r\n");
    sdp.push_str("s=Unnamed\r\n");
    sdp.push_str("i=N/A\r\n");
    let _ = write!(sdp, "c=IN IP4 {destination}\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=recvonly\r\n");
    for (id, section) in tracks {
        sdp.push_str(section);
        let _ = write!(sdp, "a=control:trackID={id}\r\n");
    }

    tracing::trace!(sdp = %sdp.replace("\r\n", " | "), "session description");
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AacConfig, H264Params};

    fn h264() -> CodecParams {
        CodecParams::H264(H264Params::new(
            vec![0x67, 0x42, 0x00, 0x1e],
            vec![0x68, 0xce, 0x38, 0x80],
        ))
    }

    #[test]
    fn h264_section() {
        let s = media_section(Codec::H264, &h264(), 5006).unwrap();
        assert_eq!(
            s,
            "m=video 5006 RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=fmtp:96 packetization-mode=1;profile-level-id=42001e;sprop-parameter-sets=Z0IAHg==,aM44gA==;\r\n"
        );
    }

    #[test]
    fn audio_sections() {
        let aac = CodecParams::Aac(AacConfig::new(2, 44100, 2).unwrap());
        let s = media_section(Codec::AacLatm, &aac, 5004).unwrap();
        assert!(s.starts_with("m=audio 5004 RTP/AVP 96\r\n"));
        assert!(s.contains("a=rtpmap:96 mpeg4-generic/44100\r\n"));
        assert!(s.contains("mode=AAC-hbr;config=1210;SizeLength=13;IndexLength=3;IndexDeltaLength=3;\r\n"));

        let amr = media_section(Codec::Amr, &CodecParams::Amr, 0).unwrap();
        assert!(amr.contains("a=rtpmap:96 AMR/8000\r\na=fmtp:96 octet-align=1;\r\n"));

        let h263 = media_section(Codec::H263, &CodecParams::H263, 0).unwrap();
        assert!(h263.contains("a=rtpmap:96 H263-1998/90000\r\n"));
    }

    #[test]
    fn mismatched_params() {
        assert!(media_section(Codec::Amr, &h264(), 0).is_none());
    }

    #[test]
    fn session_layout() {
        let video = media_section(Codec::H264, &h264(), 0).unwrap();
        let audio = media_section(Codec::Amr, &CodecParams::Amr, 0).unwrap();
        let sdp = session_description("10.0.0.1", "10.0.0.2", 42, &[(0, audio), (1, video)]);

        assert!(sdp.starts_with(
            "v=0\r\no=- 42 42 IN IP4 10.0.0.1\r\ns=Unnamed\r\ni=N/A\r\nc=IN IP4 10.0.0.2\r\nt=0 0\r\na=recvonly\r\n"
        ));
        let audio_idx = sdp.find("m=audio").unwrap();
        let video_idx = sdp.find("m=video").unwrap();
        assert!(audio_idx < video_idx, "audio track comes first");
        assert!(sdp.contains("a=control:trackID=0\r\nm=video"));
        assert!(sdp.ends_with("a=control:trackID=1\r\n"));
        assert_eq!(sdp.matches("m=").count(), 2);
    }

    #[test]
    fn ntp_timestamp_has_seconds_in_high_word() {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let ntp = ntp_timestamp();
        assert!((ntp >> 32).abs_diff(secs) <= 1);
    }
}
