//! Session description model
//!
//! Only the parts needed for codec preference are modelled: session-level
//! lines are kept verbatim, and each media section exposes its `m=` line fields
//! plus its attribute lines. Serialization reproduces every line that was
//! parsed, so a reorder never adds or drops anything besides moving payload ids.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// One `m=` section and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: String,
    pub port: String,
    pub protocol: String,
    /// Payload identifiers in preference order
    pub payloads: Vec<String>,
    pub attributes: Vec<String>,
}

impl MediaSection {
    fn parse_media_line(line: &str) -> Result<Self> {
        let mut fields = line.trim_start_matches("m=").split_whitespace();
        let (Some(kind), Some(port), Some(protocol)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::InvalidSdp(format!("malformed media line: {line}")));
        };

        Ok(Self {
            kind: kind.to_string(),
            port: port.to_string(),
            protocol: protocol.to_string(),
            payloads: fields.map(str::to_string).collect(),
            attributes: Vec::new(),
        })
    }

    /// Codec name declared for a payload id by `a=rtpmap`
    #[must_use]
    pub fn codec_of(&self, payload: &str) -> Option<&str> {
        self.attributes.iter().find_map(|attr| {
            let rest = attr.strip_prefix("a=rtpmap:")?;
            let (pt, encoding) = rest.split_once(' ')?;
            (pt == payload).then(|| encoding.split('/').next().unwrap_or(encoding))
        })
    }

    /// Move every payload mapped to `codec` to the front, keeping the relative
    /// order of both groups. Returns whether the order changed.
    pub fn prefer_codec(&mut self, codec: &str) -> bool {
        let (preferred, others): (Vec<String>, Vec<String>) = self
            .payloads
            .iter()
            .cloned()
            .partition(|pt| self.codec_of(pt).is_some_and(|name| name.eq_ignore_ascii_case(codec)));

        let reordered: Vec<String> = preferred.into_iter().chain(others).collect();
        let changed = reordered != self.payloads;
        self.payloads = reordered;
        changed
    }

    fn media_line(&self) -> String {
        let mut line = format!("m={} {} {}", self.kind, self.port, self.protocol);
        for payload in &self.payloads {
            line.push(' ');
            line.push_str(payload);
        }
        line
    }
}

/// Parsed session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDocument {
    pub session: Vec<String>,
    pub media: Vec<MediaSection>,
}

impl SessionDocument {
    /// Reorder every media section that carries `codec`
    pub fn prefer_codec(&mut self, codec: &str) -> bool {
        self.media
            .iter_mut()
            .fold(false, |changed, section| section.prefer_codec(codec) || changed)
    }
}

impl FromStr for SessionDocument {
    type Err = Error;

    fn from_str(sdp: &str) -> Result<Self> {
        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
            if line.is_empty() {
                continue;
            }
            if line.starts_with("m=") {
                media.push(MediaSection::parse_media_line(line)?);
            } else if let Some(section) = media.last_mut() {
                section.attributes.push(line.to_string());
            } else {
                session.push(line.to_string());
            }
        }

        if !session.first().is_some_and(|l| l.starts_with("v=")) {
            return Err(Error::InvalidSdp("missing version line".to_string()));
        }

        Ok(Self { session, media })
    }
}

impl fmt::Display for SessionDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.session {
            write!(f, "{line}\r\n")?;
        }
        for section in &self.media {
            write!(f, "{}\r\n", section.media_line())?;
            for attr in &section.attributes {
                write!(f, "{attr}\r\n")?;
            }
        }
        Ok(())
    }
}

/// Move the preferred codec's payload ids to the front of each media line.
pub fn reorder_codec_preference(sdp: &str, preferred_codec: &str) -> Result<String> {
    let mut document: SessionDocument = sdp.parse()?;
    document.prefer_codec(preferred_codec);
    Ok(document.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 9 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102 103 98 125\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtpmap:103 rtx/90000\r\n\
a=rtpmap:98 VP9/90000\r\n\
a=rtpmap:125 h264/90000\r\n";

    fn video_payloads(sdp: &str) -> Vec<String> {
        let doc: SessionDocument = sdp.parse().unwrap();
        doc.media
            .into_iter()
            .find(|m| m.kind == "video")
            .unwrap()
            .payloads
    }

    #[test]
    fn test_parse_sections() {
        let doc: SessionDocument = OFFER.parse().unwrap();
        assert_eq!(doc.session.len(), 5);
        assert_eq!(doc.media.len(), 2);
        assert_eq!(doc.media[0].kind, "audio");
        assert_eq!(doc.media[1].payloads, ["96", "97", "102", "103", "98", "125"]);
        assert_eq!(doc.media[1].codec_of("102"), Some("H264"));
        assert_eq!(doc.media[1].codec_of("104"), None);
    }

    #[test]
    fn test_reorder_moves_preferred_codec_first() {
        let reordered = reorder_codec_preference(OFFER, "H264").unwrap();
        let payloads = video_payloads(&reordered);
        assert_eq!(payloads, ["102", "125", "96", "97", "103", "98"]);
    }

    #[test]
    fn test_reorder_preserves_payload_set_and_other_order() {
        let before = video_payloads(OFFER);
        for codec in ["H264", "VP9", "VP8", "AV1"] {
            let after = video_payloads(&reorder_codec_preference(OFFER, codec).unwrap());

            let mut sorted_before = before.clone();
            let mut sorted_after = after.clone();
            sorted_before.sort();
            sorted_after.sort();
            assert_eq!(sorted_before, sorted_after, "{codec}");

            let doc: SessionDocument = OFFER.parse().unwrap();
            let video = &doc.media[1];
            let is_preferred =
                |pt: &String| video.codec_of(pt).is_some_and(|c| c.eq_ignore_ascii_case(codec));

            let first_other = after.iter().position(|pt| !is_preferred(pt)).unwrap_or(after.len());
            assert!(after[first_other..].iter().all(|pt| !is_preferred(pt)), "{codec}");

            let others_before: Vec<&String> = before.iter().filter(|pt| !is_preferred(pt)).collect();
            let others_after: Vec<&String> = after.iter().filter(|pt| !is_preferred(pt)).collect();
            assert_eq!(others_before, others_after, "{codec}");
        }
    }

    #[test]
    fn test_reorder_keeps_every_other_line() {
        let reordered = reorder_codec_preference(OFFER, "VP9").unwrap();
        let original_lines: Vec<&str> = OFFER.lines().filter(|l| !l.starts_with("m=")).collect();
        let new_lines: Vec<&str> = reordered.lines().filter(|l| !l.starts_with("m=")).collect();
        assert_eq!(original_lines, new_lines);
        assert!(reordered.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 9 0\r\n"));
    }

    #[test]
    fn test_reorder_accepts_bare_newlines() {
        let unix = OFFER.replace("\r\n", "\n");
        let reordered = reorder_codec_preference(&unix, "VP9").unwrap();
        assert_eq!(video_payloads(&reordered)[0], "98");
    }

    #[test]
    fn test_invalid_sdp_is_rejected() {
        assert!(reorder_codec_preference("", "H264").is_err());
        assert!(reorder_codec_preference("v=0\r\nm=video\r\n", "H264").is_err());
    }
}
