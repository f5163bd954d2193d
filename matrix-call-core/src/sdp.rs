//! Just enough SDP inspection for call negotiation
//!
//! The media engine owns real SDP handling. Signaling only needs to look at
//! the media sections of a remote description: whether audio is offered with
//! a codec we can decode, which stream ids (msid) and SSRCs it announces, and
//! whether candidates are embedded directly in the body.

use crate::types::MediaKind;

/// Audio codec every pipeline must be able to negotiate
pub const REQUIRED_AUDIO_CODEC: &str = "opus";

/// One `m=` section of a session description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSection {
    /// Media type from the `m=` line (`audio`, `video`, ...)
    pub media: String,
    /// `a=rtpmap:` values, in order
    pub rtpmaps: Vec<String>,
    /// Stream id from the first `a=msid:` attribute
    pub msid: Option<String>,
    /// SSRCs from `a=ssrc:` attributes
    pub ssrcs: Vec<u32>,
    /// `a=recvonly` present
    pub receive_only: bool,
    /// `a=sendonly` present
    pub send_only: bool,
    /// `a=candidate:` lines present
    pub has_candidates: bool,
}

impl MediaSection {
    /// Media kind, if it is one the pipeline handles
    pub fn kind(&self) -> Option<MediaKind> {
        match self.media.as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Payload type of the first rtpmap whose encoding matches, case-insensitively
    pub fn payload_type(&self, encoding: &str) -> Option<u32> {
        let encoding = encoding.to_ascii_lowercase();
        self.rtpmaps
            .iter()
            .find(|v| v.to_ascii_lowercase().contains(&encoding))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|pt| pt.parse().ok())
    }
}

/// Split a session description into its media sections
pub fn media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections = Vec::new();
    let mut current: Option<MediaSection> = None;

    for line in sdp.lines().map(str::trim_end) {
        if let Some(rest) = line.strip_prefix("m=") {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some(MediaSection {
                media: rest.split_whitespace().next().unwrap_or_default().to_string(),
                ..MediaSection::default()
            });
            continue;
        }

        let Some(section) = current.as_mut() else {
            continue;
        };
        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };

        if let Some(v) = attr.strip_prefix("rtpmap:") {
            section.rtpmaps.push(v.to_string());
        } else if let Some(v) = attr.strip_prefix("msid:") {
            if section.msid.is_none() {
                section.msid = v.split_whitespace().next().map(str::to_string);
            }
        } else if let Some(v) = attr.strip_prefix("ssrc:") {
            if let Some(ssrc) = v.split_whitespace().next().and_then(|s| s.parse().ok()) {
                if !section.ssrcs.contains(&ssrc) {
                    section.ssrcs.push(ssrc);
                }
            }
        } else if attr.starts_with("candidate:") {
            section.has_candidates = true;
        } else if attr == "recvonly" {
            section.receive_only = true;
        } else if attr == "sendonly" {
            section.send_only = true;
        }
    }

    if let Some(done) = current {
        sections.push(done);
    }
    sections
}

/// Whether the description offers audio with the required codec
pub fn has_compatible_audio(sdp: &str) -> bool {
    media_sections(sdp)
        .iter()
        .find(|s| s.kind() == Some(MediaKind::Audio))
        .and_then(|s| s.payload_type(REQUIRED_AUDIO_CODEC))
        .is_some()
}

/// Whether any media section carries inline ICE candidates
pub fn has_inline_candidates(sdp: &str) -> bool {
    media_sections(sdp).iter().any(|s| s.has_candidates)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OFFER: &str = "v=0\r\n\
o=- 1 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 OPUS/48000/2\r\n\
a=msid:stream-a track-a\r\n\
a=ssrc:1111 cname:x\r\n\
a=ssrc:1111 msid:stream-a track-a\r\n\
a=sendrecv\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=msid:stream-a track-v\r\n\
a=ssrc:2222 cname:x\r\n\
a=candidate:1 1 UDP 2122260223 10.0.0.1 5000 typ host\r\n\
a=recvonly\r\n";

    #[test]
    fn test_media_sections() {
        let sections = media_sections(OFFER);
        assert_eq!(sections.len(), 2);

        assert_eq!(sections[0].kind(), Some(MediaKind::Audio));
        assert_eq!(sections[0].payload_type("opus"), Some(111));
        assert_eq!(sections[0].msid.as_deref(), Some("stream-a"));
        assert_eq!(sections[0].ssrcs, vec![1111]);
        assert!(!sections[0].has_candidates);

        assert_eq!(sections[1].kind(), Some(MediaKind::Video));
        assert_eq!(sections[1].payload_type("opus"), None);
        assert!(sections[1].receive_only);
        assert!(sections[1].has_candidates);
    }

    #[test]
    fn test_compatible_audio() {
        assert!(has_compatible_audio(OFFER));

        let no_opus = OFFER.replace("OPUS", "PCMU");
        assert!(!has_compatible_audio(&no_opus));

        let video_only = "v=0\r\nm=video 9 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\n";
        assert!(!has_compatible_audio(video_only));
        assert!(!has_compatible_audio(""));
    }

    #[test]
    fn test_inline_candidates() {
        assert!(has_inline_candidates(OFFER));
        assert!(!has_inline_candidates(&OFFER.replace("a=candidate:", "a=x-candidate:")));
    }
}
