// sipdial-rs - The Sipdial SIP Client Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SDP (RFC 4566) parsing, serialization and RFC 3264 offer/answer helpers.
//!
//! # Example
//! ```
//! use dial_sdp::{create_offer, CodecSpec, MediaSpec, Origin};
//!
//! let offer = create_offer(
//!     "call",
//!     Origin::new("alice", "192.0.2.10"),
//!     "192.0.2.10",
//!     &[MediaSpec::audio(8000, &[
//!         CodecSpec::new(0, "PCMU", 8000),
//!         CodecSpec::new(8, "PCMA", 8000),
//!     ])],
//! );
//! assert!(offer.to_string().contains("m=audio 8000 RTP/AVP 0 8\r\n"));
//! ```

pub mod offer_answer;
pub mod parse;
pub mod serialize;

pub use offer_answer::{create_answer, create_offer, CodecSpec, MediaSpec, DEFAULT_ACCEPTED_PAYLOADS};
pub use parse::{parse_sdp, SdpError};

use smol_str::SmolStr;

/// A complete session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Protocol version; always 0.
    pub version: u8,
    /// `o=` line.
    pub origin: Origin,
    /// `s=` line.
    pub session_name: SmolStr,
    /// Session-level `c=` line.
    pub connection: Option<Connection>,
    /// `t=` lines.
    pub times: Vec<TimeDescription>,
    /// Session-level `a=` lines.
    pub attributes: Vec<Attribute>,
    /// `m=` sections in order.
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Parses SDP text.
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        parse::parse_sdp(text)
    }

    /// Names of the codecs announced by `a=rtpmap` lines across all media,
    /// in order of appearance.
    pub fn codec_summary(&self) -> Vec<SmolStr> {
        let mut names = Vec::new();
        for media in &self.media {
            for rtpmap in &media.rtpmaps {
                if !names.contains(&rtpmap.encoding_name) {
                    names.push(rtpmap.encoding_name.clone());
                }
            }
        }
        names
    }

    /// True when any media line has a nonzero port and is not marked
    /// `a=inactive`.
    pub fn has_early_media(&self) -> bool {
        self.media
            .iter()
            .any(|m| m.port > 0 && !m.is_inactive())
    }

    /// True when every media line is rejected (port 0). An SDP with no
    /// media sections has nothing rejected.
    pub fn media_rejected(&self) -> bool {
        !self.media.is_empty() && self.media.iter().all(|m| m.port == 0)
    }
}

impl std::fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serialize::serialize_sdp(self))
    }
}

/// `o=` line fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: SmolStr,
    pub session_id: SmolStr,
    pub session_version: SmolStr,
    pub net_type: SmolStr,
    pub addr_type: SmolStr,
    pub unicast_address: SmolStr,
}

impl Origin {
    /// Creates an IPv4 internet origin with session id/version 0.
    pub fn new(username: &str, addr: &str) -> Self {
        Self {
            username: SmolStr::new(username),
            session_id: SmolStr::new("0"),
            session_version: SmolStr::new("0"),
            net_type: SmolStr::new("IN"),
            addr_type: SmolStr::new("IP4"),
            unicast_address: SmolStr::new(addr),
        }
    }

    pub fn with_session_id(mut self, id: &str) -> Self {
        self.session_id = SmolStr::new(id);
        self
    }
}

/// `c=` line fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: SmolStr,
    pub addr_type: SmolStr,
    pub address: SmolStr,
}

impl Connection {
    pub fn ip4(address: &str) -> Self {
        Self {
            net_type: SmolStr::new("IN"),
            addr_type: SmolStr::new("IP4"),
            address: SmolStr::new(address),
        }
    }
}

/// `t=` line fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDescription {
    pub start: u64,
    pub stop: u64,
}

impl TimeDescription {
    /// The permanent session `t=0 0`.
    pub const fn permanent() -> Self {
        Self { start: 0, stop: 0 }
    }
}

/// `a=` line: a bare flag or a name:value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Flag(SmolStr),
    Value { name: SmolStr, value: SmolStr },
}

impl Attribute {
    pub fn flag(name: &str) -> Self {
        Attribute::Flag(SmolStr::new(name))
    }

    pub fn value(name: &str, value: &str) -> Self {
        Attribute::Value {
            name: SmolStr::new(name),
            value: SmolStr::new(value),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Attribute::Flag(name) => name,
            Attribute::Value { name, .. } => name,
        }
    }
}

/// One `m=` section with its attribute lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Media kind token: audio, video, application, ...
    pub media: SmolStr,
    /// Transport port; 0 marks a rejected stream.
    pub port: u16,
    /// Transport protocol, e.g. `RTP/AVP`.
    pub protocol: SmolStr,
    /// Format tokens (RTP payload types, in offer order).
    pub formats: Vec<SmolStr>,
    /// Media-level connection override.
    pub connection: Option<Connection>,
    /// Media-level attributes in arrival order.
    pub attributes: Vec<Attribute>,
    /// Parsed `a=rtpmap` entries in arrival order.
    pub rtpmaps: Vec<RtpMap>,
}

impl MediaDescription {
    /// Creates an empty RTP/AVP audio section.
    pub fn audio(port: u16) -> Self {
        Self {
            media: SmolStr::new("audio"),
            port,
            protocol: SmolStr::new("RTP/AVP"),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
            rtpmaps: Vec::new(),
        }
    }

    /// Returns the rtpmap for a payload type, if announced.
    pub fn rtpmap(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|r| r.payload_type == payload_type)
    }

    /// True when the section carries `a=inactive`.
    pub fn is_inactive(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, Attribute::Flag(f) if f.eq_ignore_ascii_case("inactive")))
    }

    /// True when the stream is rejected (port 0).
    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }
}

/// Parsed `a=rtpmap:<pt> <name>/<rate>[/<params>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: SmolStr,
    pub clock_rate: u32,
    pub encoding_params: Option<SmolStr>,
}
