// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3264 offer/answer construction.

use smol_str::SmolStr;

use crate::{
    Attribute, Connection, MediaDescription, Origin, RtpMap, SessionDescription, TimeDescription,
};

/// Payload types retained by [`create_answer`] when the caller does not
/// supply an accepted set: PCMU, PCMA and telephone-event.
pub const DEFAULT_ACCEPTED_PAYLOADS: &[u8] = &[0, 8, 101];

/// One codec entry for a [`MediaSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpec {
    pub payload_type: u8,
    pub name: SmolStr,
    pub rate: u32,
    pub fmtp: Option<SmolStr>,
    pub ptime: Option<u32>,
}

impl CodecSpec {
    pub fn new(payload_type: u8, name: &str, rate: u32) -> Self {
        Self {
            payload_type,
            name: SmolStr::new(name),
            rate,
            fmtp: None,
            ptime: None,
        }
    }

    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        self.fmtp = Some(SmolStr::new(fmtp));
        self
    }

    pub fn with_ptime(mut self, ptime: u32) -> Self {
        self.ptime = Some(ptime);
        self
    }
}

/// One media section of an offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSpec {
    pub media: SmolStr,
    pub port: u16,
    pub protocol: SmolStr,
    pub codecs: Vec<CodecSpec>,
}

impl MediaSpec {
    /// An RTP/AVP audio section.
    pub fn audio(port: u16, codecs: &[CodecSpec]) -> Self {
        Self {
            media: SmolStr::new("audio"),
            port,
            protocol: SmolStr::new("RTP/AVP"),
            codecs: codecs.to_vec(),
        }
    }
}

/// Builds an SDP offer from media specifications.
pub fn create_offer(
    session_name: &str,
    origin: Origin,
    connection_addr: &str,
    media_specs: &[MediaSpec],
) -> SessionDescription {
    let media = media_specs.iter().map(build_media).collect();
    SessionDescription {
        version: 0,
        origin,
        session_name: SmolStr::new(session_name),
        connection: Some(Connection::ip4(connection_addr)),
        times: vec![TimeDescription::permanent()],
        attributes: Vec::new(),
        media,
    }
}

/// Builds an SDP answer to `offer`.
///
/// Each offered media section is answered in order. Offered payloads outside
/// the accepted set are dropped; a section left with no accepted payload is
/// rejected with port 0 (its formats are echoed, as RFC 3264 §6 requires the
/// format list to be non-empty even on rejection).
pub fn create_answer(
    offer: &SessionDescription,
    local_origin: Origin,
    local_connection: &str,
    accepted_payloads: Option<&[u8]>,
    local_port: u16,
) -> SessionDescription {
    let accepted = accepted_payloads.unwrap_or(DEFAULT_ACCEPTED_PAYLOADS);
    let mut media = Vec::with_capacity(offer.media.len());

    for offered in &offer.media {
        let kept: Vec<SmolStr> = offered
            .formats
            .iter()
            .filter(|f| {
                f.parse::<u8>()
                    .map(|pt| accepted.contains(&pt))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if kept.is_empty() {
            media.push(MediaDescription {
                media: offered.media.clone(),
                port: 0,
                protocol: offered.protocol.clone(),
                formats: offered.formats.clone(),
                connection: None,
                attributes: Vec::new(),
                rtpmaps: Vec::new(),
            });
            continue;
        }

        let mut attributes = Vec::new();
        let mut rtpmaps = Vec::new();
        for format in &kept {
            if let Ok(pt) = format.parse::<u8>() {
                if let Some(map) = offered.rtpmap(pt) {
                    attributes.push(rtpmap_attribute(map));
                    rtpmaps.push(map.clone());
                }
            }
        }

        media.push(MediaDescription {
            media: offered.media.clone(),
            port: local_port,
            protocol: offered.protocol.clone(),
            formats: kept,
            connection: None,
            attributes,
            rtpmaps,
        });
    }

    SessionDescription {
        version: 0,
        origin: local_origin,
        session_name: offer.session_name.clone(),
        connection: Some(Connection::ip4(local_connection)),
        times: vec![TimeDescription::permanent()],
        attributes: Vec::new(),
        media,
    }
}

fn build_media(spec: &MediaSpec) -> MediaDescription {
    let mut formats = Vec::with_capacity(spec.codecs.len());
    let mut attributes = Vec::new();
    let mut rtpmaps = Vec::new();
    let mut ptime: Option<u32> = None;

    for codec in &spec.codecs {
        formats.push(SmolStr::new(codec.payload_type.to_string()));
        attributes.push(Attribute::value(
            "rtpmap",
            &format!("{} {}/{}", codec.payload_type, codec.name, codec.rate),
        ));
        if let Some(fmtp) = &codec.fmtp {
            attributes.push(Attribute::value(
                "fmtp",
                &format!("{} {}", codec.payload_type, fmtp),
            ));
        }
        if ptime.is_none() {
            ptime = codec.ptime;
        }
        rtpmaps.push(RtpMap {
            payload_type: codec.payload_type,
            encoding_name: codec.name.clone(),
            clock_rate: codec.rate,
            encoding_params: None,
        });
    }
    if let Some(value) = ptime {
        attributes.push(Attribute::value("ptime", &value.to_string()));
    }

    MediaDescription {
        media: spec.media.clone(),
        port: spec.port,
        protocol: spec.protocol.clone(),
        formats,
        connection: None,
        attributes,
        rtpmaps,
    }
}

fn rtpmap_attribute(map: &RtpMap) -> Attribute {
    let value = match &map.encoding_params {
        Some(params) => format!(
            "{} {}/{}/{}",
            map.payload_type, map.encoding_name, map.clock_rate, params
        ),
        None => format!("{} {}/{}", map.payload_type, map.encoding_name, map.clock_rate),
    };
    Attribute::value("rtpmap", &value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_offer() -> SessionDescription {
        create_offer(
            "call",
            Origin::new("alice", "192.0.2.10"),
            "192.0.2.10",
            &[MediaSpec::audio(
                8000,
                &[
                    CodecSpec::new(0, "PCMU", 8000),
                    CodecSpec::new(8, "PCMA", 8000),
                    CodecSpec::new(101, "telephone-event", 8000).with_fmtp("0-16"),
                ],
            )],
        )
    }

    #[test]
    fn offer_matches_minimal_wire_shape() {
        let text = standard_offer().to_string();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("o=alice 0 0 IN IP4 192.0.2.10\r\n"));
        assert!(text.contains("s=call\r\n"));
        assert!(text.contains("c=IN IP4 192.0.2.10\r\n"));
        assert!(text.contains("t=0 0\r\n"));
        assert!(text.contains("m=audio 8000 RTP/AVP 0 8 101\r\n"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(text.contains("a=rtpmap:8 PCMA/8000\r\n"));
        assert!(text.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(text.contains("a=fmtp:101 0-16\r\n"));
    }

    #[test]
    fn answer_defaults_to_library_accepted_set() {
        let mut offer = standard_offer();
        offer.media[0].formats.push(SmolStr::new("96"));
        let answer = create_answer(&offer, Origin::new("bob", "192.0.2.20"), "192.0.2.20", None, 9000);
        assert_eq!(
            answer.media[0]
                .formats
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>(),
            vec!["0", "8", "101"]
        );
        assert_eq!(answer.media[0].port, 9000);
    }

    #[test]
    fn answer_honors_explicit_accepted_set() {
        let offer = standard_offer();
        let answer = create_answer(
            &offer,
            Origin::new("bob", "192.0.2.20"),
            "192.0.2.20",
            Some(&[8]),
            9000,
        );
        assert_eq!(
            answer.media[0].formats.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
            vec!["8"]
        );
        assert_eq!(answer.codec_summary().as_slice(), &[SmolStr::new("PCMA")]);
    }

    #[test]
    fn answer_rejects_section_with_no_common_payload() {
        let offer = standard_offer();
        let answer = create_answer(
            &offer,
            Origin::new("bob", "192.0.2.20"),
            "192.0.2.20",
            Some(&[96]),
            9000,
        );
        assert!(answer.media[0].is_rejected());
        assert!(answer.media_rejected());
        assert!(!answer.media[0].formats.is_empty());
    }

    #[test]
    fn ptime_emitted_once_per_section() {
        let offer = create_offer(
            "call",
            Origin::new("alice", "192.0.2.10"),
            "192.0.2.10",
            &[MediaSpec::audio(
                8000,
                &[
                    CodecSpec::new(0, "PCMU", 8000).with_ptime(20),
                    CodecSpec::new(8, "PCMA", 8000).with_ptime(30),
                ],
            )],
        );
        let text = offer.to_string();
        assert_eq!(text.matches("a=ptime:").count(), 1);
        assert!(text.contains("a=ptime:20\r\n"));
    }
}
